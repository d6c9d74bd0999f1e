//! Tempo estimation from detected beats and from manual taps.

use std::collections::VecDeque;

use tracing::debug;

use crate::{BeatEvent, Millis};

pub const MIN_ESTIMATE_BPM: u32 = 60;
pub const MAX_ESTIMATE_BPM: u32 = 200;

const MAX_BEAT_INTERVALS: usize = 10;
const MIN_BEAT_INTERVALS: usize = 3;
const MAX_TAPS: usize = 8;
const TAP_GUESSES: usize = 3;
const TAP_IDLE_MS: Millis = 3_000;
const OUTLIER_LOW: f64 = 0.7;
const OUTLIER_HIGH: f64 = 1.3;

/// A tempo estimate, always within [`MIN_ESTIMATE_BPM`]..=[`MAX_ESTIMATE_BPM`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TempoEstimate {
    bpm: u32,
}

impl TempoEstimate {
    /// Converts an average interval into a clamped estimate. Returns `None`
    /// for non-positive intervals.
    pub fn from_interval_ms(interval_ms: f64) -> Option<Self> {
        if !interval_ms.is_finite() || interval_ms <= 0.0 {
            return None;
        }
        Some(Self::from_bpm((60_000.0 / interval_ms).round() as u32))
    }

    pub fn from_bpm(bpm: u32) -> Self {
        Self {
            bpm: bpm.clamp(MIN_ESTIMATE_BPM, MAX_ESTIMATE_BPM),
        }
    }

    pub fn bpm(self) -> u32 {
        self.bpm
    }

    pub fn interval_ms(self) -> f64 {
        60_000.0 / f64::from(self.bpm)
    }
}

/// Beat-driven and tap-driven tempo tracking.
#[derive(Debug, Clone, Default)]
pub struct TempoEstimator {
    last_beat: Option<Millis>,
    intervals: VecDeque<Millis>,
    beat_estimate: Option<TempoEstimate>,
    taps: TapTempo,
}

impl TempoEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest beat-derived estimate.
    pub fn estimate(&self) -> Option<TempoEstimate> {
        self.beat_estimate
    }

    /// Feeds one detector tick. Non-beats are ignored.
    pub fn observe(&mut self, beat: &BeatEvent) -> Option<TempoEstimate> {
        if beat.detected {
            self.record_beat(beat.timestamp);
        }
        self.beat_estimate
    }

    pub fn record_beat(&mut self, timestamp: Millis) {
        if let Some(last) = self.last_beat {
            let interval = timestamp.saturating_sub(last);
            if interval > 0 {
                self.intervals.push_back(interval);
                while self.intervals.len() > MAX_BEAT_INTERVALS {
                    self.intervals.pop_front();
                }
            }
        }
        self.last_beat = Some(timestamp);

        if self.intervals.len() >= MIN_BEAT_INTERVALS {
            if let Some(estimate) = median_filtered_estimate(self.intervals.make_contiguous()) {
                if self.beat_estimate != Some(estimate) {
                    debug!(bpm = estimate.bpm(), "beat tempo updated");
                }
                self.beat_estimate = Some(estimate);
            }
        }
    }

    /// Position within the current beat period in `[0, 1]`.
    pub fn beat_phase(&self, now: Millis) -> f32 {
        match (self.beat_estimate, self.last_beat) {
            (Some(estimate), Some(last)) => {
                let elapsed = now.saturating_sub(last) as f64;
                (elapsed / estimate.interval_ms()).min(1.0) as f32
            }
            _ => 0.0,
        }
    }

    /// Registers a manual tap and returns the smoothed tap tempo, if enough
    /// taps have been collected.
    pub fn tap(&mut self, now: Millis) -> Option<TempoEstimate> {
        self.taps.tap(now)
    }

    pub fn taps(&self) -> &TapTempo {
        &self.taps
    }

    /// Drops tap history once taps have gone idle.
    pub fn expire_taps(&mut self, now: Millis) {
        self.taps.expire(now);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Tap-tempo state: the last few tap timestamps plus a short rolling average
/// of raw guesses.
#[derive(Debug, Clone, Default)]
pub struct TapTempo {
    taps: VecDeque<Millis>,
    guesses: VecDeque<u32>,
}

impl TapTempo {
    pub fn tap_count(&self) -> usize {
        self.taps.len()
    }

    pub fn expire(&mut self, now: Millis) {
        if let Some(&last) = self.taps.back() {
            if now.saturating_sub(last) > TAP_IDLE_MS {
                debug!("tap tempo history expired");
                self.taps.clear();
                self.guesses.clear();
            }
        }
    }

    pub fn tap(&mut self, now: Millis) -> Option<TempoEstimate> {
        self.expire(now);

        self.taps.push_back(now);
        while self.taps.len() > MAX_TAPS {
            self.taps.pop_front();
        }
        if self.taps.len() < 2 {
            return None;
        }

        let deltas: Vec<f64> = self
            .taps
            .iter()
            .zip(self.taps.iter().skip(1))
            .map(|(a, b)| b.saturating_sub(*a) as f64)
            .collect();

        let average = mean(&deltas);
        let kept: Vec<f64> = deltas
            .into_iter()
            .filter(|d| *d >= average * OUTLIER_LOW && *d <= average * OUTLIER_HIGH)
            .collect();
        let raw = TempoEstimate::from_interval_ms(mean(&kept))?;

        self.guesses.push_back(raw.bpm());
        while self.guesses.len() > TAP_GUESSES {
            self.guesses.pop_front();
        }
        let smoothed = self.guesses.iter().map(|g| f64::from(*g)).sum::<f64>()
            / self.guesses.len() as f64;

        Some(TempoEstimate::from_bpm(smoothed.round() as u32))
    }
}

fn median_filtered_estimate(intervals: &[Millis]) -> Option<TempoEstimate> {
    if intervals.is_empty() {
        return None;
    }
    let mut sorted = intervals.to_vec();
    sorted.sort_unstable();
    let median = sorted[sorted.len() / 2] as f64;

    let kept: Vec<f64> = intervals
        .iter()
        .map(|i| *i as f64)
        .filter(|i| *i >= median * OUTLIER_LOW && *i <= median * OUTLIER_HIGH)
        .collect();

    TempoEstimate::from_interval_ms(mean(&kept))
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn beat(timestamp: Millis) -> BeatEvent {
        BeatEvent {
            detected: true,
            strength: 1.0,
            count: 0,
            timestamp,
        }
    }

    #[test]
    fn evenly_spaced_taps_give_120_bpm() {
        let mut estimator = TempoEstimator::new();
        let mut last = None;
        for t in [0, 500, 1000, 1500] {
            last = estimator.tap(t);
        }
        assert_eq!(last.map(TempoEstimate::bpm), Some(120));
    }

    #[test]
    fn single_tap_has_no_estimate() {
        let mut estimator = TempoEstimator::new();
        assert!(estimator.tap(0).is_none());
    }

    #[test]
    fn idle_taps_are_forgotten() {
        let mut estimator = TempoEstimator::new();
        estimator.tap(0);
        estimator.tap(500);
        assert_eq!(estimator.taps().tap_count(), 2);

        assert!(estimator.tap(4_000).is_none());
        assert_eq!(estimator.taps().tap_count(), 1);

        estimator.expire_taps(7_500);
        assert_eq!(estimator.taps().tap_count(), 0);
    }

    #[test]
    fn tap_guesses_are_averaged() {
        let mut taps = TapTempo::default();
        taps.tap(0);
        // 600ms -> 100 bpm
        assert_eq!(taps.tap(600).unwrap().bpm(), 100);
        // Deltas 600 and 400 both sit within 0.7..1.3 of 500, so the raw
        // guess is 120 and the rolling average (100 + 120) / 2.
        assert_eq!(taps.tap(1_000).unwrap().bpm(), 110);
    }

    #[test]
    fn beat_tempo_needs_three_intervals() {
        let mut estimator = TempoEstimator::new();
        for t in [0, 500, 1000] {
            estimator.observe(&beat(t));
        }
        assert!(estimator.estimate().is_none());

        estimator.observe(&beat(1500));
        assert_eq!(estimator.estimate().map(TempoEstimate::bpm), Some(120));
    }

    #[test]
    fn beat_tempo_discards_outliers() {
        let mut estimator = TempoEstimator::new();
        let mut t = 0;
        estimator.record_beat(t);
        for interval in [500, 500, 250, 500, 1000, 500] {
            t += interval;
            estimator.record_beat(t);
        }
        assert_eq!(estimator.estimate().map(TempoEstimate::bpm), Some(120));
    }

    #[test]
    fn non_beats_are_ignored() {
        let mut estimator = TempoEstimator::new();
        let mut quiet = beat(100);
        quiet.detected = false;
        estimator.observe(&quiet);
        assert_eq!(estimator.beat_phase(200), 0.0);
    }

    #[test]
    fn beat_phase_tracks_elapsed_fraction() {
        let mut estimator = TempoEstimator::new();
        for t in [0, 500, 1000, 1500] {
            estimator.record_beat(t);
        }
        assert!((estimator.beat_phase(1750) - 0.5).abs() < 1e-6);
        assert_eq!(estimator.beat_phase(5_000), 1.0);
    }

    #[test]
    fn clamps_extreme_tempos() {
        assert_eq!(TempoEstimate::from_interval_ms(100.0).unwrap().bpm(), 200);
        assert_eq!(TempoEstimate::from_interval_ms(5_000.0).unwrap().bpm(), 60);
        assert!(TempoEstimate::from_interval_ms(0.0).is_none());
    }

    proptest! {
        #[test]
        fn estimates_stay_clamped(intervals in proptest::collection::vec(1u64..10_000, 1..40)) {
            let mut estimator = TempoEstimator::new();
            let mut t = 0;
            estimator.record_beat(t);
            for interval in &intervals {
                t += interval;
                estimator.record_beat(t);
                if let Some(estimate) = estimator.estimate() {
                    prop_assert!((MIN_ESTIMATE_BPM..=MAX_ESTIMATE_BPM).contains(&estimate.bpm()));
                }
                if let Some(estimate) = estimator.tap(t) {
                    prop_assert!((MIN_ESTIMATE_BPM..=MAX_ESTIMATE_BPM).contains(&estimate.bpm()));
                }
            }
        }
    }
}
