use std::{collections::BTreeMap, path::Path};

use serde::{Deserialize, Serialize};

use crate::{config::MAX_FADE_MS, LightSyncError, Result};

/// Channel number (1..=512) to value map describing one lighting state.
pub type ChannelLevels = BTreeMap<u16, u8>;

/// Order in which the sequencer walks its steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Forward,
    Backward,
    Bounce,
    Random,
}

impl Direction {
    /// Next mode in the UI cycling order.
    pub fn cycled(self) -> Self {
        match self {
            Self::Forward => Self::Backward,
            Self::Backward => Self::Bounce,
            Self::Bounce => Self::Random,
            Self::Random => Self::Forward,
        }
    }

    /// Forward and backward swap; the other modes are their own reverse.
    pub fn reversed(self) -> Self {
        match self {
            Self::Forward => Self::Backward,
            Self::Backward => Self::Forward,
            other => other,
        }
    }
}

/// Reference to a stored scene together with the levels it sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRef {
    pub scene_id: String,
    #[serde(default)]
    pub levels: ChannelLevels,
}

impl StepRef {
    pub fn new(scene_id: impl Into<String>, levels: ChannelLevels) -> Self {
        Self {
            scene_id: scene_id.into(),
            levels,
        }
    }
}

/// Externally authored sequence ("chase"). Read-only to the sequencer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceDefinition {
    pub name: String,
    pub steps: Vec<StepRef>,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default = "default_loop", rename = "loop")]
    pub looping: bool,
    #[serde(default = "default_bpm")]
    pub bpm: u32,
    #[serde(default)]
    pub fade_duration_ms: u64,
}

fn default_loop() -> bool {
    true
}

fn default_bpm() -> u32 {
    120
}

impl SequenceDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<StepRef>) -> Self {
        Self {
            name: name.into(),
            steps,
            direction: Direction::Forward,
            looping: true,
            bpm: default_bpm(),
            fade_duration_ms: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Loads a JSON sequence file and checks every level targets a valid
    /// channel.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let definition: Self = serde_json::from_str(&text)?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn validate(&self) -> Result<()> {
        for step in &self.steps {
            if let Some(channel) = step.levels.keys().find(|c| !(1..=512).contains(*c)) {
                return Err(LightSyncError::Channel { channel: *channel });
            }
        }
        if self.fade_duration_ms > MAX_FADE_MS {
            return Err(LightSyncError::validation(format!(
                "sequence `{}` fades for {}ms, more than {MAX_FADE_MS}ms",
                self.name, self.fade_duration_ms
            )));
        }
        Ok(())
    }

    /// Small demo sequence cycling a single RGB fixture through primaries.
    pub fn rgb_demo(start_channel: u16) -> Self {
        let colors = [
            ("red", [255, 0, 0]),
            ("green", [0, 255, 0]),
            ("blue", [0, 0, 255]),
            ("white", [255, 255, 255]),
        ];
        let steps = colors
            .iter()
            .map(|(name, rgb)| {
                let levels = rgb
                    .iter()
                    .enumerate()
                    .map(|(offset, value)| (start_channel + offset as u16, *value))
                    .collect();
                StepRef::new(*name, levels)
            })
            .collect();
        Self::new("RGB Demo", steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sequence_json_with_defaults() {
        let definition: SequenceDefinition = serde_json::from_str(
            r#"{ "name": "Chase", "steps": [ { "scene_id": "a", "levels": { "1": 255 } }, { "scene_id": "b" } ], "direction": "random" }"#,
        )
        .unwrap();

        assert_eq!(definition.len(), 2);
        assert_eq!(definition.direction, Direction::Random);
        assert!(definition.looping);
        assert_eq!(definition.bpm, 120);
        assert_eq!(definition.steps[0].levels.get(&1), Some(&255));
    }

    #[test]
    fn rejects_levels_outside_universe() {
        let mut levels = ChannelLevels::new();
        levels.insert(513, 10);
        let definition = SequenceDefinition::new("bad", vec![StepRef::new("x", levels)]);
        assert!(matches!(
            definition.validate(),
            Err(LightSyncError::Channel { channel: 513 })
        ));
    }

    #[test]
    fn direction_cycles_through_all_modes() {
        let mut direction = Direction::Forward;
        for _ in 0..4 {
            direction = direction.cycled();
        }
        assert_eq!(direction, Direction::Forward);
        assert_eq!(Direction::Backward.reversed(), Direction::Forward);
        assert_eq!(Direction::Bounce.reversed(), Direction::Bounce);
    }

    #[test]
    fn demo_sequence_targets_consecutive_channels() {
        let demo = SequenceDefinition::rgb_demo(10);
        assert_eq!(demo.len(), 4);
        assert_eq!(demo.steps[0].levels.get(&10), Some(&255));
        assert_eq!(demo.steps[2].levels.get(&12), Some(&255));
        demo.validate().unwrap();
    }
}
