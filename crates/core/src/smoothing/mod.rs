use std::collections::HashMap;

use crate::{config::SmootherConfig, Rgb};

const ENERGY_SNAP: f32 = 0.7;
const ENERGY_FAST: f32 = 0.5;
const FAST_FACTOR: f32 = 0.4;
const SLOW_FACTOR: f32 = 0.2;

/// Per-fixture smoothing state.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SmootherState {
    current: [f32; 3],
    hold_ticks_remaining: u32,
}

impl SmootherState {
    pub fn current_color(&self) -> Rgb {
        let [r, g, b] = self.current.map(|c| c.floor().clamp(0.0, 255.0) as u8);
        Rgb::new(r, g, b)
    }

    pub fn hold_ticks_remaining(&self) -> u32 {
        self.hold_ticks_remaining
    }
}

/// Removes jitter from audio-driven colors while letting hard cuts through.
///
/// Large jumps, transients and loud passages snap straight to the target and
/// then hold it for a few ticks so short flashes stay visible. Otherwise the
/// output eases towards the target, faster when the music is energetic.
#[derive(Debug, Default)]
pub struct OutputSmoother {
    config: SmootherConfig,
    states: HashMap<String, SmootherState>,
}

impl OutputSmoother {
    pub fn new(config: SmootherConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
        }
    }

    pub fn smooth(&mut self, key: &str, target: Rgb, transient: bool, energy: f32) -> Rgb {
        let config = &self.config;
        let state = self.states.entry(key.to_string()).or_default();
        let target = [f32::from(target.r), f32::from(target.g), f32::from(target.b)];

        let delta: f32 = target
            .iter()
            .zip(state.current.iter())
            .map(|(t, c)| (t - c).abs())
            .sum();

        if delta > config.snap_delta as f32 || transient || energy > ENERGY_SNAP {
            state.current = target;
            state.hold_ticks_remaining = config.hold_ticks;
        } else if state.hold_ticks_remaining > 0 {
            state.hold_ticks_remaining -= 1;
        } else {
            let factor = if energy > ENERGY_FAST {
                FAST_FACTOR
            } else {
                SLOW_FACTOR
            };
            for (current, target) in state.current.iter_mut().zip(target) {
                *current += (target - *current) * factor;
            }
        }

        state.current_color()
    }

    pub fn state(&self, key: &str) -> Option<&SmootherState> {
        self.states.get(key)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn reset(&mut self) {
        self.states.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Rgb = Rgb::new(255, 0, 0);

    fn smoother() -> OutputSmoother {
        OutputSmoother::new(SmootherConfig::default())
    }

    #[test]
    fn transient_snaps_and_holds() {
        let mut smoother = smoother();
        assert_eq!(smoother.smooth("par-1", RED, true, 0.0), RED);

        for tick in 0..10 {
            let color = smoother.smooth("par-1", Rgb::BLACK, false, 0.0);
            assert_eq!(color, RED, "hold released early on tick {tick}");
        }
        assert_eq!(smoother.state("par-1").unwrap().hold_ticks_remaining(), 0);

        let released = smoother.smooth("par-1", Rgb::BLACK, false, 0.0);
        assert_eq!(released, Rgb::new(204, 0, 0));
    }

    #[test]
    fn large_jumps_snap_without_flag() {
        let mut smoother = smoother();
        let white = Rgb::new(255, 255, 255);
        assert_eq!(smoother.smooth("a", white, false, 0.0), white);
        assert_eq!(smoother.state("a").unwrap().hold_ticks_remaining(), 10);
    }

    #[test]
    fn loud_passages_snap() {
        let mut smoother = smoother();
        let dim = Rgb::new(40, 40, 0);
        assert_eq!(smoother.smooth("a", dim, false, 0.8), dim);
    }

    #[test]
    fn eases_faster_with_energy() {
        let mut slow = smoother();
        let mut fast = smoother();
        let target = Rgb::new(100, 0, 0);

        assert_eq!(slow.smooth("a", target, false, 0.1), Rgb::new(20, 0, 0));
        assert_eq!(fast.smooth("a", target, false, 0.6), Rgb::new(40, 0, 0));
    }

    #[test]
    fn hold_counter_only_decreases_between_transients() {
        let mut smoother = smoother();
        smoother.smooth("a", RED, true, 0.0);
        let mut last = smoother.state("a").unwrap().hold_ticks_remaining();
        for _ in 0..15 {
            smoother.smooth("a", Rgb::new(200, 10, 0), false, 0.2);
            let remaining = smoother.state("a").unwrap().hold_ticks_remaining();
            assert!(remaining <= last);
            last = remaining;
        }
    }

    #[test]
    fn state_is_per_key_and_resettable() {
        let mut smoother = smoother();
        smoother.smooth("a", RED, true, 0.0);
        smoother.smooth("b", Rgb::new(10, 0, 0), false, 0.0);
        assert_eq!(smoother.len(), 2);
        assert_eq!(smoother.state("b").unwrap().current_color(), Rgb::new(2, 0, 0));

        smoother.reset();
        assert!(smoother.is_empty());
    }
}
