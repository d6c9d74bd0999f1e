use std::{fmt, ops::Range};

use serde::{Deserialize, Serialize};

use crate::{LightSyncError, Result};

const SUB_BASS_HZ: (f32, f32) = (20.0, 60.0);
const BASS_HZ: (f32, f32) = (60.0, 250.0);
const LOW_MID_HZ: (f32, f32) = (250.0, 500.0);
const MID_HZ: (f32, f32) = (500.0, 2000.0);
const HIGH_MID_HZ: (f32, f32) = (2000.0, 4000.0);
const TREBLE_HZ: (f32, f32) = (4000.0, 8000.0);

/// Sensitivity factor above which band smoothing is relaxed and downstream
/// color smoothing is bypassed.
pub const HIGH_SENSITIVITY: f32 = 1.5;
const RESPONSIVE_ALPHA: f32 = 0.3;
const STEADY_ALPHA: f32 = 0.1;
const ENERGY_ALPHA: f32 = 0.3;

/// Immutable per-tick magnitude spectrum paired with the sample rate used to
/// derive it. Magnitudes are clamped into [0, 1] on construction.
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencySnapshot {
    magnitudes: Vec<f32>,
    sample_rate: u32,
}

impl FrequencySnapshot {
    pub fn new(magnitudes: Vec<f32>, sample_rate: u32) -> Result<Self> {
        if magnitudes.is_empty() {
            return Err(LightSyncError::InvalidInput(
                "snapshot requires at least one bin",
            ));
        }
        if sample_rate == 0 {
            return Err(LightSyncError::InvalidInput(
                "snapshot requires a non-zero sample rate",
            ));
        }
        if magnitudes.iter().any(|m| !m.is_finite()) {
            return Err(LightSyncError::InvalidInput(
                "snapshot magnitudes must be finite",
            ));
        }

        let magnitudes = magnitudes.into_iter().map(|m| m.clamp(0.0, 1.0)).collect();
        Ok(Self {
            magnitudes,
            sample_rate,
        })
    }

    /// Builds a snapshot from byte magnitudes (0..=255), the format browser
    /// style analysers hand out.
    pub fn from_bytes(bytes: &[u8], sample_rate: u32) -> Result<Self> {
        Self::new(
            bytes.iter().map(|b| f32::from(*b) / 255.0).collect(),
            sample_rate,
        )
    }

    pub fn magnitudes(&self) -> &[f32] {
        &self.magnitudes
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.magnitudes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.magnitudes.is_empty()
    }

    pub fn nyquist(&self) -> f32 {
        self.sample_rate as f32 * 0.5
    }

    /// Maps a frequency onto a bin index using `round(freq / nyquist * bins)`.
    /// The result may equal `len()` for frequencies at or above Nyquist.
    pub fn bin_index(&self, freq_hz: f32) -> usize {
        let nyquist = self.nyquist();
        if nyquist <= 0.0 {
            return 0;
        }
        let index = (freq_hz / nyquist * self.len() as f32).round();
        (index.max(0.0) as usize).min(self.len())
    }

    /// Half-open bin span covering `[min_hz, max_hz)`.
    pub fn band_bins(&self, min_hz: f32, max_hz: f32) -> Range<usize> {
        let start = self.bin_index(min_hz);
        let end = self.bin_index(max_hz).max(start);
        start..end
    }

    /// Average magnitude across the bins covering the band, 0 when the span
    /// is empty.
    pub fn band_average(&self, min_hz: f32, max_hz: f32) -> f32 {
        let span = self.band_bins(min_hz, max_hz);
        mean(&self.magnitudes[span])
    }
}

/// Normalised band energies for a single tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BandEnergies {
    pub bass: f32,
    pub low_mid: f32,
    pub mid: f32,
    pub high_mid: f32,
    pub treble: f32,
    pub energy: f32,
}

/// User facing sensitivity level (1..=10). The analyser works with the
/// derived factor `level / 5`, i.e. 0.2..=2.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Sensitivity(u8);

impl Sensitivity {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 10;

    pub fn new(level: u8) -> Result<Self> {
        if (Self::MIN..=Self::MAX).contains(&level) {
            Ok(Self(level))
        } else {
            Err(LightSyncError::validation(format!(
                "sensitivity {level} is outside {}..={}",
                Self::MIN,
                Self::MAX
            )))
        }
    }

    pub fn level(self) -> u8 {
        self.0
    }

    pub fn factor(self) -> f32 {
        f32::from(self.0) / 5.0
    }

    pub fn is_high(self) -> bool {
        self.factor() >= HIGH_SENSITIVITY
    }
}

impl Default for Sensitivity {
    fn default() -> Self {
        Self(5)
    }
}

impl TryFrom<u8> for Sensitivity {
    type Error = LightSyncError;

    fn try_from(value: u8) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Sensitivity> for u8 {
    fn from(value: Sensitivity) -> Self {
        value.0
    }
}

impl fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Turns magnitude snapshots into smoothed band energies.
///
/// Each band is exponentially smoothed towards its raw value. High
/// sensitivity uses the larger coefficient so the output tracks the music
/// more tightly; the overall energy runs through its own filter so the onset
/// detector sees a stable input.
#[derive(Debug, Clone, Default)]
pub struct SignalAnalyzer {
    sensitivity: Sensitivity,
    smoothed: BandEnergies,
    primed: bool,
}

impl SignalAnalyzer {
    pub fn new(sensitivity: Sensitivity) -> Self {
        Self {
            sensitivity,
            ..Default::default()
        }
    }

    pub fn sensitivity(&self) -> Sensitivity {
        self.sensitivity
    }

    pub fn set_sensitivity(&mut self, sensitivity: Sensitivity) {
        self.sensitivity = sensitivity;
    }

    /// Most recent smoothed output.
    pub fn current(&self) -> BandEnergies {
        self.smoothed
    }

    pub fn reset(&mut self) {
        self.smoothed = BandEnergies::default();
        self.primed = false;
    }

    /// Unsmoothed band energies for a snapshot at the given sensitivity.
    pub fn raw_bands(snapshot: &FrequencySnapshot, sensitivity: Sensitivity) -> BandEnergies {
        let s = sensitivity.factor();
        let scaled = |(lo, hi): (f32, f32)| snapshot.band_average(lo, hi) * s;

        let sub_bass = scaled(SUB_BASS_HZ);
        let bass = scaled(BASS_HZ);
        let low_mid = scaled(LOW_MID_HZ);
        let mid = scaled(MID_HZ);
        let high_mid = scaled(HIGH_MID_HZ);
        let treble = scaled(TREBLE_HZ);

        let combined_bass = ((sub_bass * 0.3 + bass * 0.7).clamp(0.0, 1.0) * 1.2).min(1.0);
        let combined_mid = (low_mid * 0.3 + mid * 0.5 + high_mid * 0.2).clamp(0.0, 1.0);
        let combined_treble = (treble * 1.1).clamp(0.0, 1.0);

        BandEnergies {
            bass: combined_bass,
            low_mid: low_mid.clamp(0.0, 1.0),
            mid: combined_mid,
            high_mid: high_mid.clamp(0.0, 1.0),
            treble: combined_treble,
            energy: overall_energy(combined_bass, combined_mid, combined_treble),
        }
    }

    /// Analyses one snapshot and advances the smoothing state.
    pub fn analyze(&mut self, snapshot: &FrequencySnapshot) -> BandEnergies {
        let raw = Self::raw_bands(snapshot, self.sensitivity);

        if !self.primed {
            self.smoothed = raw;
            self.primed = true;
            return self.smoothed;
        }

        let alpha = if self.sensitivity.is_high() {
            RESPONSIVE_ALPHA
        } else {
            STEADY_ALPHA
        };

        let s = &mut self.smoothed;
        approach(&mut s.bass, raw.bass, alpha);
        approach(&mut s.low_mid, raw.low_mid, alpha);
        approach(&mut s.mid, raw.mid, alpha);
        approach(&mut s.high_mid, raw.high_mid, alpha);
        approach(&mut s.treble, raw.treble, alpha);
        approach(&mut s.energy, raw.energy, ENERGY_ALPHA);

        self.smoothed
    }
}

fn overall_energy(bass: f32, mid: f32, treble: f32) -> f32 {
    (0.5 * bass + 0.3 * mid + 0.2 * treble).clamp(0.0, 1.0)
}

fn approach(value: &mut f32, target: f32, alpha: f32) {
    *value += (target - *value) * alpha;
}

/// Arithmetic mean, 0 for an empty slice.
fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(value: f32, bins: usize, sample_rate: u32) -> FrequencySnapshot {
        FrequencySnapshot::new(vec![value; bins], sample_rate).unwrap()
    }

    #[test]
    fn maps_bass_band_onto_expected_bins() {
        let snapshot = flat(0.0, 1024, 44_100);
        assert_eq!(snapshot.band_bins(60.0, 250.0), 3..12);
    }

    #[test]
    fn band_average_covers_only_the_band() {
        let mut magnitudes = vec![0.0; 1024];
        for bin in 3..12 {
            magnitudes[bin] = 0.8;
        }
        let snapshot = FrequencySnapshot::new(magnitudes, 44_100).unwrap();

        assert!((snapshot.band_average(60.0, 250.0) - 0.8).abs() < 1e-6);
        assert_eq!(snapshot.band_average(4000.0, 8000.0), 0.0);
    }

    #[test]
    fn empty_band_averages_to_zero() {
        let snapshot = flat(1.0, 8, 44_100);
        // Both bounds round onto bin 0.
        assert_eq!(snapshot.band_average(20.0, 60.0), 0.0);
    }

    #[test]
    fn rejects_malformed_snapshots() {
        assert!(FrequencySnapshot::new(Vec::new(), 44_100).is_err());
        assert!(FrequencySnapshot::new(vec![0.5], 0).is_err());
        assert!(FrequencySnapshot::new(vec![f32::NAN], 44_100).is_err());
    }

    #[test]
    fn clamps_magnitudes_into_unit_range() {
        let snapshot = FrequencySnapshot::new(vec![-1.0, 2.0], 44_100).unwrap();
        assert_eq!(snapshot.magnitudes(), &[0.0, 1.0]);

        let bytes = FrequencySnapshot::from_bytes(&[0, 255], 44_100).unwrap();
        assert_eq!(bytes.magnitudes(), &[0.0, 1.0]);
    }

    #[test]
    fn sensitivity_validates_its_range() {
        assert!(Sensitivity::new(0).is_err());
        assert!(Sensitivity::new(11).is_err());
        assert_eq!(Sensitivity::new(10).unwrap().factor(), 2.0);
        assert_eq!(Sensitivity::new(1).unwrap().factor(), 0.2);
        assert!(Sensitivity::new(8).unwrap().is_high());
        assert!(!Sensitivity::default().is_high());
    }

    #[test]
    fn composite_bands_stay_in_unit_range() {
        let snapshot = flat(1.0, 1024, 44_100);
        let bands = SignalAnalyzer::raw_bands(&snapshot, Sensitivity::new(10).unwrap());

        for value in [bands.bass, bands.low_mid, bands.mid, bands.high_mid, bands.treble, bands.energy] {
            assert!((0.0..=1.0).contains(&value), "{value} out of range");
        }
        assert_eq!(bands.bass, 1.0);
    }

    #[test]
    fn overall_energy_weights_bass_most() {
        let snapshot = flat(0.5, 1024, 44_100);
        let bands = SignalAnalyzer::raw_bands(&snapshot, Sensitivity::default());

        let expected = 0.5 * bands.bass + 0.3 * bands.mid + 0.2 * bands.treble;
        assert!((bands.energy - expected).abs() < 1e-6);
    }

    #[test]
    fn smoothing_moves_gradually_towards_raw_values() {
        let mut analyzer = SignalAnalyzer::new(Sensitivity::default());
        analyzer.analyze(&flat(0.0, 1024, 44_100));
        let loud = flat(0.5, 1024, 44_100);
        let raw = SignalAnalyzer::raw_bands(&loud, Sensitivity::default());

        let first = analyzer.analyze(&loud);
        assert!((first.bass - raw.bass * STEADY_ALPHA).abs() < 1e-6);
        assert!((first.energy - raw.energy * ENERGY_ALPHA).abs() < 1e-6);

        let mut responsive = SignalAnalyzer::new(Sensitivity::new(9).unwrap());
        responsive.analyze(&flat(0.0, 1024, 44_100));
        let raw_hi = SignalAnalyzer::raw_bands(&loud, Sensitivity::new(9).unwrap());
        let fast = responsive.analyze(&loud);
        assert!((fast.bass - raw_hi.bass * RESPONSIVE_ALPHA).abs() < 1e-6);
    }

    #[test]
    fn statistics_guard_empty_input() {
        assert_eq!(mean(&[]), 0.0);
    }
}
