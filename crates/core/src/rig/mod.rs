//! Per-tick pipeline wiring the analysis chain to the sequencer and the
//! fixture outputs.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use crate::{
    BandEnergies, BeatEvent, BeatPattern, BeatSource, ColorModulator, FrequencySnapshot, Millis,
    OnsetDetector, OutputSink, OutputSmoother, Result, RgbFixture, RigConfig, Rgb, SectionFlags,
    SequenceDefinition, Sequencer, SequencerOutput, Sensitivity, SignalAnalyzer, SyncSource,
    TempoEstimate, TempoEstimator,
};

/// Snapshots available this tick. `None` means the input produced nothing
/// usable and the tick is skipped for that feed.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickInput<'a> {
    pub mic: Option<&'a FrequencySnapshot>,
    pub music: Option<&'a FrequencySnapshot>,
}

/// Summary of one processed tick.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub now: Millis,
    pub bands: Option<BandEnergies>,
    pub beat: BeatEvent,
    pub sections: SectionFlags,
    pub pattern: BeatPattern,
    pub tempo: Option<TempoEstimate>,
    pub sequencer: SequencerOutput,
    pub colors: Vec<(String, Rgb)>,
}

/// One onset detector per audio input. Consumers subscribe through
/// [`BeatSource`].
#[derive(Debug)]
pub struct BeatFeeds {
    pub mic: OnsetDetector,
    pub music: OnsetDetector,
}

impl BeatSource for BeatFeeds {
    fn subscribe(&mut self, source: SyncSource) -> Option<Receiver<BeatEvent>> {
        match source {
            SyncSource::Manual => None,
            SyncSource::Mic => Some(self.mic.subscribe()),
            SyncSource::Music => Some(self.music.subscribe()),
        }
    }
}

/// The whole lighting rig: analysis, beat feeds, tempo, sequencer and the
/// audio-reactive color effect.
#[derive(Debug)]
pub struct Rig {
    analyzer: SignalAnalyzer,
    feeds: BeatFeeds,
    tempo: TempoEstimator,
    sequencer: Sequencer,
    modulator: ColorModulator,
    smoother: OutputSmoother,
    fixtures: Vec<RgbFixture>,
    color_effect: bool,
    section_effects: bool,
    effect_input_missing: bool,
}

impl Rig {
    pub fn new(config: &RigConfig) -> Self {
        Self::with_sequencer(config, Sequencer::new(config.sequencer.clone()))
    }

    pub fn with_sequencer(config: &RigConfig, sequencer: Sequencer) -> Self {
        let sensitivity = config.analysis.sensitivity;
        Self {
            analyzer: SignalAnalyzer::new(sensitivity),
            feeds: BeatFeeds {
                mic: OnsetDetector::new(config.detector.clone()),
                music: OnsetDetector::new(config.detector.clone()),
            },
            tempo: TempoEstimator::new(),
            sequencer,
            modulator: ColorModulator::new(sensitivity),
            smoother: OutputSmoother::new(config.smoother.clone()),
            fixtures: Vec::new(),
            color_effect: false,
            section_effects: false,
            effect_input_missing: false,
        }
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn tempo(&self) -> &TempoEstimator {
        &self.tempo
    }

    pub fn feeds_mut(&mut self) -> &mut BeatFeeds {
        &mut self.feeds
    }

    pub fn sensitivity(&self) -> Sensitivity {
        self.analyzer.sensitivity()
    }

    pub fn patch(&mut self, fixture: RgbFixture) {
        self.fixtures.push(fixture);
    }

    /// Enables or disables the audio-reactive color effect. Disabling it
    /// clears the smoothing state.
    pub fn set_color_effect(&mut self, enabled: bool) {
        if !enabled {
            self.smoother.reset();
        }
        self.color_effect = enabled;
    }

    /// Lets drops, build-ups and breakdowns override the color effect.
    pub fn set_section_effects(&mut self, enabled: bool) {
        self.section_effects = enabled;
    }

    /// Whether the input feeding the color effect was missing on the last
    /// tick.
    pub fn effect_input_missing(&self) -> bool {
        self.effect_input_missing
    }

    /// Validated sensitivity change (1..=10).
    pub fn set_sensitivity(&mut self, level: u8) -> Result<()> {
        let sensitivity = Sensitivity::new(level)?;
        self.analyzer.set_sensitivity(sensitivity);
        self.modulator.set_sensitivity(sensitivity);
        Ok(())
    }

    pub fn load_sequence(&mut self, definition: SequenceDefinition) {
        self.sequencer.load(definition);
    }

    pub fn play(&mut self, now: Millis) -> Result<()> {
        self.sequencer.play(now, &mut self.feeds)
    }

    pub fn pause(&mut self) {
        self.sequencer.pause();
    }

    pub fn stop(&mut self) {
        self.sequencer.stop();
    }

    pub fn set_sync_source(&mut self, now: Millis, source: SyncSource) -> Result<()> {
        self.sequencer.set_sync_source(now, source, &mut self.feeds)
    }

    pub fn set_bpm(&mut self, now: Millis, bpm: u32) {
        self.sequencer.set_bpm(now, bpm);
    }

    /// Manual tap tempo; a resulting estimate retunes the sequencer.
    pub fn tap(&mut self, now: Millis) -> Option<TempoEstimate> {
        let estimate = self.tempo.tap(now)?;
        debug!(bpm = estimate.bpm(), "tap tempo");
        self.sequencer.set_bpm(now, estimate.bpm());
        Some(estimate)
    }

    /// Runs one tick in dependency order: analysis, onset detection (which
    /// publishes to subscribers), tempo, sequencer, then color output.
    pub fn tick(
        &mut self,
        now: Millis,
        input: TickInput<'_>,
        sink: &mut dyn OutputSink,
    ) -> Result<TickReport> {
        let effect_input = match self.sequencer.runtime().sync_source {
            SyncSource::Music => input.music,
            _ => input.mic,
        };
        let missing = effect_input.is_none();
        if missing != self.effect_input_missing {
            if missing {
                warn!(now, "effect input lost, skipping analysis");
            } else {
                info!(now, "effect input restored");
            }
            self.effect_input_missing = missing;
        }

        let bands = effect_input.map(|snapshot| self.analyzer.analyze(snapshot));
        let mic_beat = self.feeds.mic.process(now, input.mic);
        let music_beat = self.feeds.music.process(now, input.music);
        let (beat, detector) = match self.sequencer.runtime().sync_source {
            SyncSource::Music => (music_beat, &self.feeds.music),
            _ => (mic_beat, &self.feeds.mic),
        };
        let sections = detector.sections();
        let pattern = detector.pattern();

        let tempo = self.tempo.observe(&beat);
        self.tempo.expire_taps(now);

        let sequencer = self.sequencer.tick(now);
        sink.apply_writes(&sequencer.writes)?;

        let mut colors = Vec::new();
        if self.color_effect {
            if let Some(bands) = bands {
                colors = self.apply_colors(&bands, &beat, sections, sink)?;
            }
        }

        Ok(TickReport {
            now,
            bands,
            beat,
            sections,
            pattern,
            tempo,
            sequencer,
            colors,
        })
    }

    fn apply_colors(
        &mut self,
        bands: &BandEnergies,
        beat: &BeatEvent,
        sections: SectionFlags,
        sink: &mut dyn OutputSink,
    ) -> Result<Vec<(String, Rgb)>> {
        let section = if self.section_effects {
            self.modulator.section_color(bands, sections)
        } else {
            None
        };
        let (target, dimmer) = section.unwrap_or_else(|| {
            let dimmer = if beat.detected {
                255
            } else {
                (150.0 + bands.energy * 105.0).floor().clamp(0.0, 255.0) as u8
            };
            (self.modulator.target_color(bands, beat), dimmer)
        });
        let transient = beat.detected || (self.section_effects && sections.drop);
        let bypass = self.analyzer.sensitivity().is_high();

        let mut colors = Vec::with_capacity(self.fixtures.len());
        for fixture in &self.fixtures {
            let color = if bypass {
                target
            } else {
                self.smoother
                    .smooth(&fixture.id, target, transient, bands.energy)
            };
            fixture.apply_color(sink, color, dimmer)?;
            colors.push((fixture.id.clone(), color));
        }
        Ok(colors)
    }
}

/// Shared cancellation flag for a [`TickLoop`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Fixed-period tick driver. Each iteration is processed to completion
/// before the next begins; the body decides what a tick does.
#[derive(Debug, Clone)]
pub struct TickLoop {
    period_ms: Millis,
    token: CancelToken,
}

impl TickLoop {
    pub fn new(period_ms: Millis, token: CancelToken) -> Self {
        Self {
            period_ms: period_ms.max(1),
            token,
        }
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Calls `body` with successive tick timestamps starting at `start`
    /// until the token is cancelled or the body errors. Returns the number of
    /// ticks run.
    pub fn run<F>(&self, start: Millis, mut body: F) -> Result<u64>
    where
        F: FnMut(Millis) -> Result<()>,
    {
        let mut ticks = 0;
        while !self.token.is_cancelled() {
            body(start + ticks * self.period_ms)?;
            ticks += 1;
        }
        Ok(ticks)
    }
}
