use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};

use crate::{FrequencySnapshot, LightSyncError, Result};

/// Turns blocks of PCM samples into [`FrequencySnapshot`]s: Hann window,
/// real FFT, magnitudes normalised so a full-scale sine lands near 1.0.
///
/// The FFT plan is cached and only rebuilt when the block size changes.
pub struct SpectrumFrontEnd {
    sample_rate: u32,
    planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
}

impl SpectrumFrontEnd {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            planner: RealFftPlanner::new(),
            fft: None,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Analyses one block. The snapshot has `samples.len() / 2` bins.
    pub fn snapshot(&mut self, samples: &[f32]) -> Result<FrequencySnapshot> {
        if samples.len() < 2 {
            return Err(LightSyncError::InvalidInput(
                "spectrum analysis requires blocks with at least two samples",
            ));
        }

        let len = samples.len();
        let fft = self.prepare_fft(len);
        for (index, value) in samples.iter().enumerate() {
            fft.input[index] = if value.is_finite() {
                *value * hann_value(index, len)
            } else {
                0.0
            };
        }

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;

        let scale = 4.0 / len as f32;
        let magnitudes = fft
            .spectrum
            .iter()
            .take(len / 2)
            .map(|bin| bin.norm() * scale)
            .collect();

        FrequencySnapshot::new(magnitudes, self.sample_rate)
    }

    fn prepare_fft(&mut self, size: usize) -> &mut FftResources {
        if !matches!(&self.fft, Some(fft) if fft.size == size) {
            self.fft = None;
        }

        let planner = &mut self.planner;
        self.fft
            .get_or_insert_with(|| FftResources::plan(planner, size))
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl FftResources {
    fn plan(planner: &mut RealFftPlanner<f32>, size: usize) -> Self {
        let plan = planner.plan_fft_forward(size);
        Self {
            size,
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            plan,
        }
    }
}

impl fmt::Debug for SpectrumFrontEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumFrontEnd")
            .field("sample_rate", &self.sample_rate)
            .field("fft_size", &self.fft.as_ref().map(|fft| fft.size))
            .finish()
    }
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn silence_has_an_empty_spectrum() {
        let mut front = SpectrumFrontEnd::new(44_100);
        let snapshot = front.snapshot(&vec![0.0; 2048]).unwrap();
        assert_eq!(snapshot.len(), 1024);
        assert!(snapshot.magnitudes().iter().all(|m| *m == 0.0));
    }

    #[test]
    fn sine_energy_lands_in_its_band() {
        let mut front = SpectrumFrontEnd::new(44_100);
        let snapshot = front.snapshot(&sine(100.0, 44_100, 2048)).unwrap();

        let bass = snapshot.band_average(60.0, 250.0);
        let treble = snapshot.band_average(4000.0, 8000.0);
        assert!(bass > 0.1, "bass {bass}");
        assert!(treble < 0.01, "treble {treble}");
    }

    #[test]
    fn rebuilds_plan_for_new_block_sizes() {
        let mut front = SpectrumFrontEnd::new(48_000);
        assert_eq!(front.snapshot(&[0.5; 512]).unwrap().len(), 256);
        assert_eq!(front.snapshot(&[0.5; 1024]).unwrap().len(), 512);
    }

    #[test]
    fn rejects_tiny_blocks() {
        let mut front = SpectrumFrontEnd::new(48_000);
        assert!(front.snapshot(&[0.1]).is_err());
    }
}
