//! Tempo-synchronised step sequencer.
//!
//! The sequencer walks a [`SequenceDefinition`] either on its own clock
//! (manual BPM) or on beats delivered by an onset detector subscription. All
//! timing is driven by [`Sequencer::tick`]; nothing here reads the wall clock.

mod clock;
mod fade;

use crossbeam_channel::Receiver;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{SequencerConfig, MAX_BPM, MAX_FADE_MS, MIN_BPM};
use crate::{BeatEvent, ChannelLevels, Direction, LightSyncError, Millis, Result, SequenceDefinition};

pub use clock::{step_interval_ms, ClockFire, StepClock};
pub use fade::Fade;

/// What drives the sequencer forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncSource {
    /// Internal clock at the configured BPM.
    #[default]
    Manual,
    /// Beats detected on the microphone input.
    Mic,
    /// Beats detected on the music player output.
    Music,
}

impl SyncSource {
    pub fn is_beat_driven(self) -> bool {
        !matches!(self, Self::Manual)
    }
}

/// Supplies beat subscriptions for the beat-driven sync sources.
pub trait BeatSource {
    fn subscribe(&mut self, source: SyncSource) -> Option<Receiver<BeatEvent>>;
}

/// Beat source for hosts that only ever run the sequencer manually.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBeatSource;

impl BeatSource for NoBeatSource {
    fn subscribe(&mut self, _source: SyncSource) -> Option<Receiver<BeatEvent>> {
        None
    }
}

/// Mutable scheduling state. Reset to its defaults on [`Sequencer::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencerRuntime {
    pub current_index: usize,
    pub bounce_direction: i32,
    pub is_playing: bool,
    pub sync_source: SyncSource,
    pub last_step_at: Option<Millis>,
}

impl SequencerRuntime {
    fn new(sync_source: SyncSource) -> Self {
        Self {
            current_index: 0,
            bounce_direction: 1,
            is_playing: false,
            sync_source,
            last_step_at: None,
        }
    }
}

/// Notification emitted whenever the sequencer moves to another step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepChange {
    pub index: usize,
    pub scene_id: String,
    pub timestamp: Millis,
    pub fading: bool,
}

/// A single write destined for the fixture output sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWrite {
    pub channel: u16,
    pub value: u8,
}

/// Everything the sequencer produced since the previous tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SequencerOutput {
    pub steps: Vec<StepChange>,
    pub writes: Vec<ChannelWrite>,
    pub fade_progress: Option<f32>,
    /// Set when a non-looping sequence ran off its end this tick.
    pub finished: bool,
}

impl SequencerOutput {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty() && self.writes.is_empty() && !self.finished
    }
}

pub struct Sequencer {
    definition: Option<SequenceDefinition>,
    settings: SequencerConfig,
    runtime: SequencerRuntime,
    clock: StepClock,
    beats: Option<Receiver<BeatEvent>>,
    last_beat_advance: Option<Millis>,
    beats_received: u64,
    fade: Option<Fade>,
    live_levels: ChannelLevels,
    outbox: SequencerOutput,
    rng: StdRng,
}

impl Sequencer {
    pub fn new(settings: SequencerConfig) -> Self {
        Self::with_rng(settings, StdRng::from_os_rng())
    }

    /// Deterministic construction for tests and replays.
    pub fn with_seed(settings: SequencerConfig, seed: u64) -> Self {
        Self::with_rng(settings, StdRng::seed_from_u64(seed))
    }

    fn with_rng(mut settings: SequencerConfig, rng: StdRng) -> Self {
        settings.bpm = settings.bpm.clamp(MIN_BPM, MAX_BPM);
        settings.fade_duration_ms = settings.fade_duration_ms.min(MAX_FADE_MS);
        Self {
            runtime: SequencerRuntime::new(settings.sync_source),
            settings,
            definition: None,
            clock: StepClock::Idle,
            beats: None,
            last_beat_advance: None,
            beats_received: 0,
            fade: None,
            live_levels: ChannelLevels::new(),
            outbox: SequencerOutput::default(),
            rng,
        }
    }

    pub fn definition(&self) -> Option<&SequenceDefinition> {
        self.definition.as_ref()
    }

    pub fn settings(&self) -> &SequencerConfig {
        &self.settings
    }

    pub fn runtime(&self) -> SequencerRuntime {
        self.runtime
    }

    pub fn current_index(&self) -> usize {
        self.runtime.current_index
    }

    pub fn is_playing(&self) -> bool {
        self.runtime.is_playing
    }

    pub fn bpm(&self) -> u32 {
        self.settings.bpm
    }

    pub fn beats_received(&self) -> u64 {
        self.beats_received
    }

    /// Deadline of the next clock-driven step, if a timer is armed.
    pub fn next_step_due(&self) -> Option<Millis> {
        self.clock.next_due()
    }

    pub fn live_levels(&self) -> &ChannelLevels {
        &self.live_levels
    }

    /// Activates a sequence, adopting its persisted tempo, direction, loop
    /// and fade settings. Any playback in progress is stopped.
    pub fn load(&mut self, definition: SequenceDefinition) {
        self.stop();
        self.settings.bpm = definition.bpm.clamp(MIN_BPM, MAX_BPM);
        self.settings.direction = definition.direction;
        self.settings.looping = definition.looping;
        self.settings.fade_duration_ms = definition.fade_duration_ms.min(MAX_FADE_MS);
        info!(name = %definition.name, steps = definition.len(), "sequence loaded");
        self.definition = Some(definition);
    }

    /// Starts playback from the current index.
    pub fn play(&mut self, now: Millis, beats: &mut dyn BeatSource) -> Result<()> {
        let steps = self.definition.as_ref().map(|d| d.len()).unwrap_or(0);
        if steps < 2 {
            return Err(LightSyncError::validation(format!(
                "a sequence needs at least 2 steps to play, found {steps}"
            )));
        }
        if self.runtime.is_playing {
            return Ok(());
        }

        let subscription = self.open_subscription(self.runtime.sync_source, beats)?;
        self.runtime.is_playing = true;
        self.runtime.last_step_at = Some(now);
        self.arm(now, subscription);
        info!(
            source = ?self.runtime.sync_source,
            bpm = self.settings.bpm,
            "sequencer playing"
        );
        Ok(())
    }

    pub fn pause(&mut self) {
        if self.runtime.is_playing {
            info!(index = self.runtime.current_index, "sequencer paused");
        }
        self.runtime.is_playing = false;
        self.disarm();
    }

    pub fn stop(&mut self) {
        if self.runtime.is_playing {
            info!("sequencer stopped");
        }
        self.disarm();
        self.fade = None;
        self.last_beat_advance = None;
        self.runtime = SequencerRuntime::new(self.runtime.sync_source);
    }

    /// Switches what drives the sequencer. While playing, the previous source
    /// is torn down before the new one is armed; the current step is kept.
    pub fn set_sync_source(
        &mut self,
        now: Millis,
        source: SyncSource,
        beats: &mut dyn BeatSource,
    ) -> Result<()> {
        if source == self.runtime.sync_source {
            return Ok(());
        }

        if !self.runtime.is_playing {
            self.runtime.sync_source = source;
            return Ok(());
        }

        let subscription = self.open_subscription(source, beats)?;
        self.disarm();
        self.runtime.sync_source = source;
        self.arm(now, subscription);
        debug!(?source, "sync source switched");
        Ok(())
    }

    /// Sets the tempo (clamped to 30..=300). A running manual clock is
    /// retimed without losing its phase.
    pub fn set_bpm(&mut self, now: Millis, bpm: u32) {
        let bpm = bpm.clamp(MIN_BPM, MAX_BPM);
        if bpm == self.settings.bpm {
            return;
        }
        debug!(from = self.settings.bpm, to = bpm, "bpm changed");
        self.settings.bpm = bpm;
        if let Some(definition) = self.definition.as_mut() {
            definition.bpm = bpm;
        }

        if self.runtime.is_playing && self.runtime.sync_source == SyncSource::Manual {
            self.retime(now);
        }
    }

    /// Nudges the tempo by 10% (at least 1 BPM) up or down.
    pub fn nudge_bpm(&mut self, now: Millis, faster: bool) {
        let change = ((f64::from(self.settings.bpm) * 0.1).round() as u32).max(1);
        let bpm = if faster {
            self.settings.bpm + change
        } else {
            self.settings.bpm.saturating_sub(change)
        };
        self.set_bpm(now, bpm);
    }

    pub fn set_direction(&mut self, direction: Direction) {
        self.settings.direction = direction;
        if let Some(definition) = self.definition.as_mut() {
            definition.direction = direction;
        }
    }

    pub fn set_loop(&mut self, looping: bool) {
        self.settings.looping = looping;
        if let Some(definition) = self.definition.as_mut() {
            definition.looping = looping;
        }
    }

    pub fn set_fade_duration(&mut self, fade_duration_ms: Millis) {
        let fade_duration_ms = fade_duration_ms.min(MAX_FADE_MS);
        self.settings.fade_duration_ms = fade_duration_ms;
        if let Some(definition) = self.definition.as_mut() {
            definition.fade_duration_ms = fade_duration_ms;
        }
    }

    /// Moves to the next step according to the direction policy. Returns the
    /// new index, or `None` when nothing moved (empty sequence or terminal
    /// stop of a non-looping sequence).
    pub fn advance(&mut self, now: Millis) -> Option<usize> {
        self.step_with(now, self.settings.direction)
    }

    /// One step against the configured direction.
    pub fn previous_step(&mut self, now: Millis) -> Option<usize> {
        self.step_with(now, self.settings.direction.reversed())
    }

    /// Runs one scheduling pass and returns everything produced since the
    /// previous tick.
    pub fn tick(&mut self, now: Millis) -> SequencerOutput {
        if self.runtime.is_playing {
            if self.runtime.sync_source.is_beat_driven() {
                self.drain_beats(now);
            } else if let Some(fire) = self.clock.poll(now) {
                self.advance(now);
                if self.runtime.is_playing {
                    // Retimes measure from the same point the clock does.
                    self.runtime.last_step_at = Some(fire.anchor);
                }
            }
        }

        self.sample_fade(now);
        std::mem::take(&mut self.outbox)
    }

    fn drain_beats(&mut self, now: Millis) {
        let Some(beats) = self.beats.clone() else {
            return;
        };

        for beat in beats.try_iter() {
            // Only beats computed in this tick may drive a step.
            if !beat.detected || beat.timestamp != now {
                continue;
            }
            self.beats_received += 1;

            let ready = self
                .last_beat_advance
                .map(|last| now.saturating_sub(last) > self.settings.beat_debounce_ms)
                .unwrap_or(true);
            if ready && self.runtime.is_playing {
                self.advance(now);
                self.last_beat_advance = Some(now);
            }
        }
    }

    fn step_with(&mut self, now: Millis, direction: Direction) -> Option<usize> {
        let len = self.definition.as_ref().map(|d| d.len()).unwrap_or(0);
        if len == 0 {
            return None;
        }

        let current = self.runtime.current_index.min(len - 1);
        let next = match direction {
            Direction::Forward => {
                if current + 1 < len {
                    current + 1
                } else if self.settings.looping {
                    0
                } else {
                    return self.finish();
                }
            }
            Direction::Backward => {
                if current > 0 {
                    current - 1
                } else if self.settings.looping {
                    len - 1
                } else {
                    return self.finish();
                }
            }
            Direction::Bounce => self.bounce_from(current, len),
            Direction::Random => self.random_from(current, len),
        };

        self.runtime.current_index = next;
        self.runtime.last_step_at = Some(now);
        self.enter_step(now, next);
        Some(next)
    }

    fn bounce_from(&mut self, current: usize, len: usize) -> usize {
        if len == 1 {
            return 0;
        }
        let candidate = current as i64 + i64::from(self.runtime.bounce_direction);
        if candidate >= len as i64 {
            self.runtime.bounce_direction = -1;
            len - 2
        } else if candidate < 0 {
            self.runtime.bounce_direction = 1;
            1
        } else {
            candidate as usize
        }
    }

    /// Uniform over every index except `current`.
    fn random_from(&mut self, current: usize, len: usize) -> usize {
        if len == 1 {
            return 0;
        }
        let pick = self.rng.random_range(0..len - 1);
        if pick >= current {
            pick + 1
        } else {
            pick
        }
    }

    fn finish(&mut self) -> Option<usize> {
        debug!("non-looping sequence reached its end");
        self.stop();
        self.outbox.finished = true;
        None
    }

    fn enter_step(&mut self, now: Millis, index: usize) {
        let Some(step) = self.definition.as_ref().and_then(|d| d.steps.get(index)) else {
            return;
        };
        let fading = self.settings.fade_duration_ms > 0;

        debug!(index, scene = %step.scene_id, fading, "step advanced");
        self.outbox.steps.push(StepChange {
            index,
            scene_id: step.scene_id.clone(),
            timestamp: now,
            fading,
        });

        if fading {
            // A fade in flight is abandoned from wherever it currently is.
            let from = match &self.fade {
                Some(fade) => fade.sample(now),
                None => self.live_levels.clone(),
            };
            self.fade = Some(Fade::new(from, &step.levels, now, self.settings.fade_duration_ms));
        } else {
            self.fade = None;
            let levels = step.levels.clone();
            self.emit_levels(&levels);
            self.live_levels.extend(levels);
        }
    }

    fn sample_fade(&mut self, now: Millis) {
        let Some(fade) = self.fade.as_ref() else {
            return;
        };

        let progress = fade.progress(now);
        let levels = fade.sample(now);
        if fade.is_complete(now) {
            self.fade = None;
        }

        self.emit_levels(&levels);
        self.live_levels.extend(levels);
        self.outbox.fade_progress = Some(progress);
    }

    fn emit_levels(&mut self, levels: &ChannelLevels) {
        self.outbox.writes.extend(
            levels
                .iter()
                .map(|(channel, value)| ChannelWrite {
                    channel: *channel,
                    value: *value,
                }),
        );
    }

    fn retime(&mut self, now: Millis) {
        let interval = step_interval_ms(self.settings.bpm);
        let elapsed = self
            .runtime
            .last_step_at
            .map(|last| now.saturating_sub(last))
            .unwrap_or(0);

        let (clock, immediate) = StepClock::retimed(now, elapsed, interval);
        self.clock = clock;
        debug!(interval, elapsed, immediate, "clock retimed");

        if immediate {
            self.advance(now);
        }
    }

    fn open_subscription(
        &self,
        source: SyncSource,
        beats: &mut dyn BeatSource,
    ) -> Result<Option<Receiver<BeatEvent>>> {
        if !source.is_beat_driven() {
            return Ok(None);
        }
        beats.subscribe(source).map(Some).ok_or_else(|| {
            LightSyncError::validation(format!("no beat source available for {source:?}"))
        })
    }

    fn arm(&mut self, now: Millis, subscription: Option<Receiver<BeatEvent>>) {
        match subscription {
            Some(receiver) => {
                self.clock = StepClock::Idle;
                self.beats = Some(receiver);
            }
            None => {
                self.beats = None;
                self.clock = StepClock::periodic(now, step_interval_ms(self.settings.bpm));
            }
        }
    }

    fn disarm(&mut self) {
        self.clock = StepClock::Idle;
        self.beats = None;
    }
}

impl std::fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequencer")
            .field("definition", &self.definition.as_ref().map(|d| &d.name))
            .field("settings", &self.settings)
            .field("runtime", &self.runtime)
            .field("clock", &self.clock)
            .field("subscribed", &self.beats.is_some())
            .field("fading", &self.fade.is_some())
            .finish()
    }
}
