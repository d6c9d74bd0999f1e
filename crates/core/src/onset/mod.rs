//! Onset detection over a rolling energy / spectral-flux history.
//!
//! The detector combines three criteria: an energy spike over an adaptive
//! multiple of the historical mean, a sustained rise of the short-term
//! average, and a spectral-flux outlier. A debounce window bounds how often
//! it can fire.

use std::collections::VecDeque;

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::analysis::FrequencySnapshot;
use crate::config::DetectorConfig;
use crate::Millis;

const LOW_BIN_SPAN: usize = 32;
const RECENT_WINDOW: usize = 5;
const RECENT_RISE: f32 = 1.1;
const FLUX_DEVIATIONS: f32 = 1.5;
const STRENGTH_SPAN: f32 = 0.3;
const STRENGTH_FLOOR: f32 = 0.5;
const DROP_WINDOW: usize = 20;
const DROP_RECENT: usize = 5;
const DROP_RISE: f32 = 2.0;
const BUILD_UP_SPAN: usize = 10;
const BUILD_UP_TOLERANCE: f32 = 0.95;
const BREAKDOWN_ENERGY: f32 = 0.3;
const PATTERN_LEN: u8 = 16;

/// Outcome of one detector tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeatEvent {
    pub detected: bool,
    pub strength: f32,
    pub count: u64,
    pub timestamp: Millis,
}

impl BeatEvent {
    fn quiet(count: u64, timestamp: Millis) -> Self {
        Self {
            detected: false,
            strength: 0.0,
            count,
            timestamp,
        }
    }
}

/// Fixed-capacity ring of recent samples. The oldest entry is dropped once
/// the capacity is exceeded.
#[derive(Debug, Clone)]
pub struct EnergyHistory {
    values: VecDeque<f32>,
    capacity: usize,
}

impl EnergyHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    pub fn push(&mut self, value: f32) {
        self.values.push_back(value);
        while self.values.len() > self.capacity {
            self.values.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Arithmetic mean, 0 when empty.
    pub fn mean(&self) -> f32 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f32>() / self.values.len() as f32
    }

    /// Population standard deviation, 0 when empty.
    pub fn std_dev(&self) -> f32 {
        if self.values.is_empty() {
            return 0.0;
        }
        let avg = self.mean();
        let variance = self.values.iter().map(|v| (v - avg).powi(2)).sum::<f32>()
            / self.values.len() as f32;
        variance.sqrt()
    }

    /// Mean of the newest `n` entries (fewer if the history is shorter).
    pub fn recent_mean(&self, n: usize) -> f32 {
        let take = n.min(self.values.len());
        if take == 0 {
            return 0.0;
        }
        self.values.iter().rev().take(take).sum::<f32>() / take as f32
    }

    /// Coefficient of variation, 0 when the mean is zero.
    pub fn coefficient_of_variation(&self) -> f32 {
        let avg = self.mean();
        if avg <= f32::EPSILON {
            0.0
        } else {
            self.std_dev() / avg
        }
    }

    /// Mean of the oldest `n` entries (fewer if the history is shorter).
    pub fn oldest_mean(&self, n: usize) -> f32 {
        let take = n.min(self.values.len());
        if take == 0 {
            return 0.0;
        }
        self.values.iter().take(take).sum::<f32>() / take as f32
    }

    /// True when each of the newest `n` entries is at least `tolerance`
    /// times its predecessor. False until `n` entries exist.
    pub fn is_rising(&self, n: usize, tolerance: f32) -> bool {
        if n == 0 || self.values.len() < n {
            return false;
        }
        let start = self.values.len() - n;
        self.values
            .iter()
            .skip(start)
            .zip(self.values.iter().skip(start + 1))
            .all(|(before, after)| *after >= before * tolerance)
    }
}

/// Song-structure hints derived from the onset energy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionFlags {
    /// Recent energy more than doubled over the start of a 20-tick window.
    pub drop: bool,
    /// Energy has not fallen by more than 5% tick over tick for 10 ticks.
    pub build_up: bool,
    /// Energy is below 0.3.
    pub breakdown: bool,
}

/// Rolling hit/miss record of the last 16 processed ticks, oldest first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeatPattern {
    bits: u16,
    len: u8,
}

impl BeatPattern {
    pub fn push(&mut self, hit: bool) {
        self.bits = (self.bits << 1) | u16::from(hit);
        self.len = (self.len + 1).min(PATTERN_LEN);
    }

    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of beats in the window.
    pub fn hits(&self) -> u32 {
        self.mask().count_ones()
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len).rev().map(move |shift| (self.bits >> shift) & 1 == 1)
    }

    fn mask(&self) -> u16 {
        if self.len >= PATTERN_LEN {
            self.bits
        } else {
            self.bits & ((1 << self.len) - 1)
        }
    }
}

/// Broadcasts [`BeatEvent`]s to any number of subscribers. Receivers that
/// have been dropped are pruned on the next publish.
#[derive(Debug, Default)]
pub struct BeatBus {
    subscribers: Vec<Sender<BeatEvent>>,
}

impl BeatBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> Receiver<BeatEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn publish(&mut self, event: BeatEvent) {
        self.subscribers.retain(|tx| tx.send(event).is_ok());
    }
}

/// Adaptive-threshold onset detector. Each consumer owns its own instance.
#[derive(Debug)]
pub struct OnsetDetector {
    config: DetectorConfig,
    energy_history: EnergyHistory,
    flux_history: EnergyHistory,
    previous_spectrum: Option<Vec<f32>>,
    last_beat: Option<Millis>,
    beat_count: u64,
    adaptive_threshold: f32,
    last_interval: Option<Millis>,
    drop_window: EnergyHistory,
    sections: SectionFlags,
    pattern: BeatPattern,
    bus: BeatBus,
}

impl OnsetDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            energy_history: EnergyHistory::new(config.history_capacity),
            flux_history: EnergyHistory::new(config.history_capacity),
            config,
            previous_spectrum: None,
            last_beat: None,
            beat_count: 0,
            adaptive_threshold: 1.3,
            last_interval: None,
            drop_window: EnergyHistory::new(DROP_WINDOW),
            sections: SectionFlags::default(),
            pattern: BeatPattern::default(),
            bus: BeatBus::new(),
        }
    }

    pub fn beat_count(&self) -> u64 {
        self.beat_count
    }

    pub fn last_beat(&self) -> Option<Millis> {
        self.last_beat
    }

    /// Interval between the two most recent beats, if two have fired.
    pub fn last_interval(&self) -> Option<Millis> {
        self.last_interval
    }

    pub fn adaptive_threshold(&self) -> f32 {
        self.adaptive_threshold
    }

    pub fn history_len(&self) -> usize {
        self.energy_history.len()
    }

    /// Section flags from the most recent processed tick. Skipped ticks
    /// leave them unchanged.
    pub fn sections(&self) -> SectionFlags {
        self.sections
    }

    pub fn pattern(&self) -> BeatPattern {
        self.pattern
    }

    pub fn subscribe(&mut self) -> Receiver<BeatEvent> {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> &BeatBus {
        &self.bus
    }

    /// Processes one tick. `None` models a missing snapshot: no beat is
    /// reported and the histories are left untouched.
    pub fn process(&mut self, now: Millis, snapshot: Option<&FrequencySnapshot>) -> BeatEvent {
        let event = match snapshot {
            Some(snapshot) => {
                let energy = low_weighted_energy(snapshot.magnitudes());
                let flux = self.spectral_flux(snapshot.magnitudes());
                self.observe(now, energy, flux)
            }
            None => {
                trace!(now, "skipping tick without snapshot");
                BeatEvent::quiet(self.beat_count, now)
            }
        };
        self.bus.publish(event);
        event
    }

    /// Runs detection on a precomputed energy value (and optional flux).
    pub fn process_energy(&mut self, now: Millis, energy: f32, flux: Option<f32>) -> BeatEvent {
        let energy = if energy.is_finite() { energy.max(0.0) } else { 0.0 };
        let flux = flux.filter(|f| f.is_finite());
        let event = self.observe(now, energy, flux);
        self.bus.publish(event);
        event
    }

    /// Clears the signal statistics. The beat count is kept so it stays
    /// monotonic for the detector's lifetime.
    pub fn reset(&mut self) {
        self.energy_history.clear();
        self.flux_history.clear();
        self.previous_spectrum = None;
        self.last_beat = None;
        self.adaptive_threshold = 1.3;
        self.last_interval = None;
        self.drop_window.clear();
        self.sections = SectionFlags::default();
        self.pattern = BeatPattern::default();
    }

    fn observe(&mut self, now: Millis, energy: f32, flux: Option<f32>) -> BeatEvent {
        let event = self.evaluate(now, energy, flux);
        self.drop_window.push(energy);
        self.pattern.push(event.detected);

        let sections = SectionFlags {
            drop: self.drop_window.len() >= DROP_WINDOW
                && self.drop_window.recent_mean(DROP_RECENT)
                    > self.drop_window.oldest_mean(DROP_WINDOW - DROP_RECENT) * DROP_RISE,
            build_up: self.energy_history.is_rising(BUILD_UP_SPAN, BUILD_UP_TOLERANCE),
            breakdown: energy < BREAKDOWN_ENERGY,
        };
        if sections != self.sections {
            debug!(now, ?sections, "section changed");
        }
        self.sections = sections;
        event
    }

    fn evaluate(&mut self, now: Millis, energy: f32, flux: Option<f32>) -> BeatEvent {
        self.energy_history.push(energy);
        if let Some(flux) = flux {
            self.flux_history.push(flux);
        }

        if self.energy_history.len() < self.config.min_history {
            return BeatEvent::quiet(self.beat_count, now);
        }

        self.adaptive_threshold = threshold_for(self.energy_history.coefficient_of_variation());

        let debounced = self
            .last_beat
            .map(|last| now.saturating_sub(last) > self.config.debounce_ms)
            .unwrap_or(true);
        if !debounced {
            return BeatEvent::quiet(self.beat_count, now);
        }

        let historical = self.energy_history.mean();
        let energy_peak = energy > historical * self.adaptive_threshold;
        let sustained_rise =
            self.energy_history.recent_mean(RECENT_WINDOW) > historical * RECENT_RISE;
        let flux_peak = match flux {
            Some(flux) if self.flux_history.len() >= self.config.min_history => {
                flux > self.flux_history.mean() + FLUX_DEVIATIONS * self.flux_history.std_dev()
            }
            _ => false,
        };

        if !(energy_peak || sustained_rise || flux_peak) {
            return BeatEvent::quiet(self.beat_count, now);
        }

        self.last_interval = self.last_beat.map(|last| now.saturating_sub(last));
        self.last_beat = Some(now);
        self.beat_count += 1;

        let strength = beat_strength(energy, historical);
        debug!(
            now,
            count = self.beat_count,
            strength,
            threshold = self.adaptive_threshold,
            energy_peak,
            sustained_rise,
            flux_peak,
            "beat detected"
        );

        BeatEvent {
            detected: true,
            strength,
            count: self.beat_count,
            timestamp: now,
        }
    }

    fn spectral_flux(&mut self, magnitudes: &[f32]) -> Option<f32> {
        let flux = match &self.previous_spectrum {
            Some(previous) if previous.len() == magnitudes.len() => Some(positive_flux(previous, magnitudes)),
            _ => None,
        };
        self.previous_spectrum = Some(magnitudes.to_vec());
        flux
    }
}

/// Noisier signals get a lower bar, stable ones a higher one.
fn threshold_for(cv: f32) -> f32 {
    if cv > 0.5 {
        1.2
    } else if cv > 0.3 {
        1.3
    } else {
        1.4
    }
}

fn beat_strength(energy: f32, historical: f32) -> f32 {
    if historical <= f32::EPSILON {
        return 1.0;
    }
    ((energy / historical - 1.0) / STRENGTH_SPAN)
        .clamp(0.0, 1.0)
        .max(STRENGTH_FLOOR)
}

/// RMS over the lowest bins with a linear tilt favouring the bottom of the
/// spectrum. Normalised by the total weight so a flat spectrum of value `v`
/// yields exactly `v`.
fn low_weighted_energy(magnitudes: &[f32]) -> f32 {
    let span = magnitudes.len().min(LOW_BIN_SPAN);
    if span == 0 {
        return 0.0;
    }

    let mut sum = 0.0;
    let mut weights = 0.0;
    for (i, magnitude) in magnitudes.iter().take(span).enumerate() {
        let weight = 1.0 + (1.0 - i as f32 / span as f32) * 0.5;
        sum += magnitude * magnitude * weight;
        weights += weight;
    }

    (sum / weights).sqrt()
}

/// Mean positive per-bin increase between two spectra.
fn positive_flux(previous: &[f32], current: &[f32]) -> f32 {
    if current.is_empty() {
        return 0.0;
    }
    let rise: f32 = previous
        .iter()
        .zip(current)
        .map(|(before, now)| (now - before).max(0.0))
        .sum();
    rise / current.len() as f32
}
