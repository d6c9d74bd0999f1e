//! Core library for the LightSync rig.
//!
//! Audio snapshots flow through band analysis and onset detection; detected
//! beats feed tempo estimation and a step sequencer that drives DMX-style
//! lighting channels. Everything is driven by explicit millisecond
//! timestamps passed to `tick` methods, so the whole pipeline runs the same
//! under a real-time loop or a simulation.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod error;
pub mod mapping;
pub mod onset;
pub mod output;
pub mod rig;
pub mod scene;
pub mod smoothing;
pub mod tempo;
pub mod timeline;

/// Milliseconds on the host's monotonic clock.
pub type Millis = u64;

pub use analysis::{BandEnergies, FrequencySnapshot, Sensitivity, SignalAnalyzer};
pub use audio::SpectrumFrontEnd;
pub use config::{AnalysisConfig, DetectorConfig, RigConfig, SequencerConfig, SmootherConfig};
pub use error::{LightSyncError, Result};
pub use mapping::{ColorModulator, Rgb};
pub use onset::{BeatBus, BeatEvent, BeatPattern, EnergyHistory, OnsetDetector, SectionFlags};
pub use output::{DmxUniverse, OutputSink, RgbFixture, RgbLayout};
pub use rig::{BeatFeeds, CancelToken, Rig, TickInput, TickLoop, TickReport};
pub use scene::{ChannelLevels, Direction, SequenceDefinition, StepRef};
pub use smoothing::{OutputSmoother, SmootherState};
pub use tempo::{TapTempo, TempoEstimate, TempoEstimator};
pub use timeline::{
    BeatSource, ChannelWrite, NoBeatSource, Sequencer, SequencerOutput, SequencerRuntime,
    StepChange, SyncSource,
};
