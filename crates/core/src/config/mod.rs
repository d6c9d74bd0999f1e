use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Direction, LightSyncError, Result, Sensitivity, SyncSource};

pub const MIN_BPM: u32 = 30;
pub const MAX_BPM: u32 = 300;
pub const MAX_FADE_MS: u64 = 5_000;

/// Top-level configuration structure for the rig.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    pub analysis: AnalysisConfig,
    pub detector: DetectorConfig,
    pub sequencer: SequencerConfig,
    pub smoother: SmootherConfig,
}

impl RigConfig {
    /// Reads a JSON config file and validates it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.analysis.validate()?;
        self.detector.validate()?;
        self.sequencer.validate()
    }
}

/// Configuration specific to the analysis front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub sensitivity: Sensitivity,
    pub sample_rate: u32,
    pub fft_size: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            sensitivity: Sensitivity::default(),
            sample_rate: 44_100,
            fft_size: 2048,
        }
    }
}

impl AnalysisConfig {
    fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(LightSyncError::validation("sample_rate must be non-zero"));
        }
        if self.fft_size < 2 {
            return Err(LightSyncError::validation("fft_size must be at least 2"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Roughly one second of ticks.
    pub history_capacity: usize,
    /// Samples required before any decision is made.
    pub min_history: usize,
    pub debounce_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            history_capacity: 43,
            min_history: 10,
            debounce_ms: 150,
        }
    }
}

impl DetectorConfig {
    fn validate(&self) -> Result<()> {
        if !(100..=200).contains(&self.debounce_ms) {
            return Err(LightSyncError::validation(format!(
                "detector debounce {}ms is outside 100..=200",
                self.debounce_ms
            )));
        }
        if self.min_history == 0 || self.min_history > self.history_capacity {
            return Err(LightSyncError::validation(
                "detector min_history must be within 1..=history_capacity",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    pub bpm: u32,
    pub direction: Direction,
    #[serde(rename = "loop")]
    pub looping: bool,
    pub fade_duration_ms: u64,
    pub sync_source: SyncSource,
    /// Minimum gap between beat-driven advances.
    pub beat_debounce_ms: u64,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            bpm: 120,
            direction: Direction::Forward,
            looping: true,
            fade_duration_ms: 0,
            sync_source: SyncSource::Manual,
            beat_debounce_ms: 200,
        }
    }
}

impl SequencerConfig {
    fn validate(&self) -> Result<()> {
        if !(MIN_BPM..=MAX_BPM).contains(&self.bpm) {
            return Err(LightSyncError::validation(format!(
                "bpm {} is outside {MIN_BPM}..={MAX_BPM}",
                self.bpm
            )));
        }
        if self.fade_duration_ms > MAX_FADE_MS {
            return Err(LightSyncError::validation(format!(
                "fade duration {}ms exceeds {MAX_FADE_MS}ms",
                self.fade_duration_ms
            )));
        }
        if self.beat_debounce_ms < 200 {
            return Err(LightSyncError::validation(
                "beat debounce must be at least 200ms",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmootherConfig {
    /// Summed RGB delta that counts as a hard cut.
    pub snap_delta: u32,
    pub hold_ticks: u32,
}

impl Default for SmootherConfig {
    fn default() -> Self {
        Self {
            snap_delta: 300,
            hold_ticks: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        RigConfig::default().validate().unwrap();
    }

    #[test]
    fn parses_partial_json() {
        let config: RigConfig = serde_json::from_str(
            r#"{ "analysis": { "sensitivity": 8 }, "sequencer": { "bpm": 128, "direction": "bounce", "loop": false } }"#,
        )
        .unwrap();

        assert_eq!(config.analysis.sensitivity.level(), 8);
        assert_eq!(config.analysis.sample_rate, 44_100);
        assert_eq!(config.sequencer.bpm, 128);
        assert_eq!(config.sequencer.direction, Direction::Bounce);
        assert!(!config.sequencer.looping);
        assert_eq!(config.detector.history_capacity, 43);
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(serde_json::from_str::<RigConfig>(r#"{ "analysis": { "sensitivity": 11 } }"#).is_err());

        let mut config = RigConfig::default();
        config.sequencer.bpm = 500;
        assert!(matches!(config.validate(), Err(LightSyncError::Validation(_))));

        let mut config = RigConfig::default();
        config.detector.debounce_ms = 50;
        assert!(config.validate().is_err());

        let mut config = RigConfig::default();
        config.sequencer.fade_duration_ms = 6_000;
        assert!(config.validate().is_err());
    }
}
