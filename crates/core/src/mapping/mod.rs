use serde::{Deserialize, Serialize};

use crate::{BandEnergies, BeatEvent, SectionFlags, Sensitivity};

/// 8-bit RGB color.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Self = Self::new(0, 0, 0);
    pub const WHITE: Self = Self::new(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

const BEAT_PALETTE: [Rgb; 6] = [
    Rgb::new(255, 0, 0),
    Rgb::new(0, 255, 0),
    Rgb::new(0, 0, 255),
    Rgb::new(255, 255, 0),
    Rgb::new(255, 0, 255),
    Rgb::new(0, 255, 255),
];

const INTENSE_PALETTE: [Rgb; 7] = [
    Rgb::new(255, 0, 0),
    Rgb::new(0, 255, 0),
    Rgb::new(0, 0, 255),
    Rgb::new(255, 255, 0),
    Rgb::new(255, 0, 255),
    Rgb::new(0, 255, 255),
    Rgb::new(255, 255, 255),
];

const LOW_SENSITIVITY: f32 = 0.6;
const INTENSE_SENSITIVITY: f32 = 1.4;

/// Maps band energies and beats onto a target fixture color.
///
/// Bass drives red, mids drive green and treble drives blue. On a detected
/// beat the color jumps to a palette entry chosen by the beat count so
/// consecutive beats alternate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColorModulator {
    sensitivity: Sensitivity,
}

impl ColorModulator {
    pub fn new(sensitivity: Sensitivity) -> Self {
        Self { sensitivity }
    }

    pub fn set_sensitivity(&mut self, sensitivity: Sensitivity) {
        self.sensitivity = sensitivity;
    }

    pub fn target_color(&self, bands: &BandEnergies, beat: &BeatEvent) -> Rgb {
        let factor = self.sensitivity.factor();

        if factor < LOW_SENSITIVITY {
            return scaled(bands, 100.0);
        }

        if factor > INTENSE_SENSITIVITY {
            if beat.detected {
                return palette_entry(&INTENSE_PALETTE, beat.count);
            }
            return scaled(bands, 400.0);
        }

        if beat.detected {
            palette_entry(&BEAT_PALETTE, beat.count)
        } else {
            scaled(bands, 255.0)
        }
    }

    /// Color and dimmer for the current song section, `None` outside any
    /// section. A drop wins over a build-up, which wins over a breakdown.
    pub fn section_color(&self, bands: &BandEnergies, sections: SectionFlags) -> Option<(Rgb, u8)> {
        let s = self.sensitivity.factor();

        if sections.drop {
            return Some((Rgb::WHITE, 255));
        }
        if sections.build_up {
            let intensity = bands.energy * s;
            let color = Rgb::new(
                level(255.0 * intensity),
                level(100.0 * intensity),
                level(150.0 * intensity),
            );
            return Some((color, level(100.0 + 155.0 * intensity)));
        }
        if sections.breakdown {
            let color = Rgb::new(
                level(50.0 + bands.mid * 100.0 * s),
                level(50.0 + bands.treble * 100.0 * s),
                level(100.0 + bands.bass * 155.0 * s),
            );
            return Some((color, level(80.0 + bands.energy * 100.0 * s)));
        }
        None
    }
}

fn level(value: f32) -> u8 {
    value.floor().clamp(0.0, 255.0) as u8
}

fn palette_entry(palette: &[Rgb], count: u64) -> Rgb {
    palette[(count % palette.len() as u64) as usize]
}

fn scaled(bands: &BandEnergies, gain: f32) -> Rgb {
    Rgb::new(
        level(bands.bass * gain),
        level(bands.mid * gain),
        level(bands.treble * gain),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bands(bass: f32, mid: f32, treble: f32) -> BandEnergies {
        BandEnergies {
            bass,
            mid,
            treble,
            ..Default::default()
        }
    }

    fn beat(detected: bool, count: u64) -> BeatEvent {
        BeatEvent {
            detected,
            strength: if detected { 1.0 } else { 0.0 },
            count,
            timestamp: 0,
        }
    }

    #[test]
    fn normal_sensitivity_maps_bands_to_rgb() {
        let modulator = ColorModulator::new(Sensitivity::default());
        let color = modulator.target_color(&bands(1.0, 0.5, 0.0), &beat(false, 0));
        assert_eq!(color, Rgb::new(255, 127, 0));
    }

    #[test]
    fn beats_cycle_through_palette() {
        let modulator = ColorModulator::new(Sensitivity::default());
        let quiet = bands(0.0, 0.0, 0.0);
        assert_eq!(modulator.target_color(&quiet, &beat(true, 1)), Rgb::new(0, 255, 0));
        assert_eq!(modulator.target_color(&quiet, &beat(true, 6)), Rgb::new(255, 0, 0));
    }

    #[test]
    fn low_sensitivity_mutes_colors_and_ignores_beats() {
        let modulator = ColorModulator::new(Sensitivity::new(2).unwrap());
        let color = modulator.target_color(&bands(1.0, 1.0, 1.0), &beat(true, 3));
        assert_eq!(color, Rgb::new(100, 100, 100));
    }

    #[test]
    fn sections_override_in_priority_order() {
        let modulator = ColorModulator::new(Sensitivity::default());
        let bands = BandEnergies {
            bass: 0.5,
            mid: 0.5,
            treble: 0.5,
            energy: 0.5,
            ..Default::default()
        };
        let all = SectionFlags {
            drop: true,
            build_up: true,
            breakdown: true,
        };
        assert_eq!(modulator.section_color(&bands, all), Some((Rgb::WHITE, 255)));

        let build_up = SectionFlags {
            build_up: true,
            breakdown: true,
            ..Default::default()
        };
        assert_eq!(
            modulator.section_color(&bands, build_up),
            Some((Rgb::new(127, 50, 75), 177))
        );

        let breakdown = SectionFlags {
            breakdown: true,
            ..Default::default()
        };
        assert_eq!(
            modulator.section_color(&bands, breakdown),
            Some((Rgb::new(100, 100, 177), 130))
        );
        assert_eq!(modulator.section_color(&bands, SectionFlags::default()), None);
    }

    #[test]
    fn high_sensitivity_saturates() {
        let modulator = ColorModulator::new(Sensitivity::new(9).unwrap());
        let color = modulator.target_color(&bands(0.5, 0.25, 0.1), &beat(false, 0));
        assert_eq!(color, Rgb::new(200, 100, 40));
        assert_eq!(
            modulator.target_color(&bands(0.0, 0.0, 0.0), &beat(true, 6)),
            Rgb::new(255, 255, 255)
        );
    }
}
