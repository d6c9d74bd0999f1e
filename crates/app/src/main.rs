use std::{f32::consts::PI, path::PathBuf};

use clap::{Parser, Subcommand};
use lightsync_core::{
    CancelToken, DmxUniverse, LightSyncError, Millis, RgbFixture, RgbLayout, Rig, RigConfig,
    SequenceDefinition, SpectrumFrontEnd, SyncSource, TickInput, TickLoop,
};
use tracing_subscriber::EnvFilter;

const TICK_MS: Millis = 25;
const KICK_HZ: f32 = 60.0;
const KICK_DECAY_S: f32 = 0.08;
const PAD_HZ: f32 = 2_000.0;

fn main() -> lightsync_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            bpm,
            seconds,
            sync,
            config,
            sequence,
            color,
            sections,
        } => run_simulate(SimulateArgs {
            bpm,
            seconds,
            sync,
            config,
            sequence,
            color,
            sections,
        }),
        Commands::Check { sequence, config } => run_check(&sequence, config.as_ref()),
    }
}

struct SimulateArgs {
    bpm: u32,
    seconds: u32,
    sync: SyncSource,
    config: Option<PathBuf>,
    sequence: Option<PathBuf>,
    color: bool,
    sections: bool,
}

fn run_simulate(args: SimulateArgs) -> lightsync_core::Result<()> {
    if args.bpm == 0 {
        return Err(LightSyncError::validation("track tempo must be positive"));
    }

    let mut config = match &args.config {
        Some(path) => RigConfig::load(path)?,
        None => RigConfig::default(),
    };
    config.sequencer.sync_source = args.sync;

    let definition = match &args.sequence {
        Some(path) => SequenceDefinition::load(path)?,
        None => SequenceDefinition::rgb_demo(1),
    };
    tracing::info!(
        track_bpm = args.bpm,
        seconds = args.seconds,
        sequence = %definition.name,
        sync = ?args.sync,
        "starting simulation"
    );

    let mut rig = Rig::new(&config);
    rig.load_sequence(definition);
    rig.set_sync_source(0, args.sync)?;
    if args.sync == SyncSource::Manual {
        rig.set_bpm(0, args.bpm);
    }
    if args.color {
        rig.patch(RgbFixture::new("wash", 10, RgbLayout::PAR_DRGB));
        rig.set_color_effect(true);
        rig.set_section_effects(args.sections);
    }
    rig.play(0)?;

    let track = KickTrack::new(args.bpm, config.analysis.sample_rate);
    let mut front_end = SpectrumFrontEnd::new(config.analysis.sample_rate);
    let mut universe = DmxUniverse::new();
    let mut beats = 0_u64;
    let mut steps = 0_usize;

    let end = Millis::from(args.seconds) * 1_000;
    let token = CancelToken::new();
    let tick_loop = TickLoop::new(TICK_MS, token.clone());
    let ticks = tick_loop.run(0, |now| {
        if now >= end {
            token.cancel();
            return Ok(());
        }

        let block = track.block_ending_at(now, config.analysis.fft_size);
        let snapshot = front_end.snapshot(&block)?;
        let input = TickInput {
            mic: Some(&snapshot),
            music: Some(&snapshot),
        };
        let report = rig.tick(now, input, &mut universe)?;

        if report.beat.detected {
            beats += 1;
            tracing::debug!(now, count = report.beat.count, strength = report.beat.strength, "beat");
        }
        if report.sections.drop {
            tracing::debug!(now, "drop");
        }
        for change in &report.sequencer.steps {
            steps += 1;
            tracing::debug!(now, index = change.index, scene = %change.scene_id, "step");
        }
        Ok(())
    })?;

    let estimate = rig.tempo().estimate().map(|t| t.bpm());
    tracing::info!(ticks, beats, steps, ?estimate, "simulation finished");

    println!("track tempo      : {} bpm", args.bpm);
    match estimate {
        Some(bpm) => println!("estimated tempo  : {bpm} bpm"),
        None => println!("estimated tempo  : not enough beats"),
    }
    println!("beats detected   : {beats}");
    println!("steps taken      : {steps}");
    println!("sequencer bpm    : {}", rig.sequencer().bpm());

    let lit: Vec<String> = universe
        .channels()
        .iter()
        .enumerate()
        .filter(|(_, value)| **value > 0)
        .map(|(index, value)| format!("{}={value}", index + 1))
        .collect();
    println!("universe         : {}", if lit.is_empty() { "dark".to_string() } else { lit.join(" ") });

    Ok(())
}

fn run_check(sequence: &PathBuf, config: Option<&PathBuf>) -> lightsync_core::Result<()> {
    tracing::info!(?sequence, "checking sequence");

    if let Some(path) = config {
        RigConfig::load(path)?;
        println!("config ok: {}", path.display());
    }

    let definition = SequenceDefinition::load(sequence)?;
    if definition.len() < 2 {
        return Err(LightSyncError::validation(format!(
            "sequence `{}` has {} step(s); at least 2 are needed to play",
            definition.name,
            definition.len()
        )));
    }

    println!(
        "sequence ok: `{}` with {} steps, {:?}, loop {}, {} bpm, fade {}ms",
        definition.name,
        definition.len(),
        definition.direction,
        definition.looping,
        definition.bpm,
        definition.fade_duration_ms
    );
    Ok(())
}

/// Synthetic test signal: a decaying low sine kick on every beat over a quiet
/// high pad.
struct KickTrack {
    beat_period_s: f32,
    sample_rate: u32,
}

impl KickTrack {
    fn new(bpm: u32, sample_rate: u32) -> Self {
        Self {
            beat_period_s: 60.0 / bpm as f32,
            sample_rate,
        }
    }

    fn sample(&self, t: f32) -> f32 {
        let pad = 0.05 * (2.0 * PI * PAD_HZ * t).sin();
        if t < 0.0 {
            return pad;
        }
        let since_beat = t % self.beat_period_s;
        let kick = 0.9 * (2.0 * PI * KICK_HZ * since_beat).sin() * (-since_beat / KICK_DECAY_S).exp();
        kick + pad
    }

    /// The `len` samples leading up to `now`.
    fn block_ending_at(&self, now: Millis, len: usize) -> Vec<f32> {
        let rate = self.sample_rate as f32;
        let end = now as f32 / 1_000.0;
        (0..len)
            .map(|i| self.sample(end - (len - i) as f32 / rate))
            .collect()
    }
}

fn parse_sync(value: &str) -> Result<SyncSource, String> {
    match value.to_ascii_lowercase().as_str() {
        "manual" => Ok(SyncSource::Manual),
        "mic" => Ok(SyncSource::Mic),
        "music" => Ok(SyncSource::Music),
        other => Err(format!("unknown sync source `{other}` (manual, mic, music)")),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Beat-synced lighting sequencer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drive the rig with a synthetic kick track and report what it did.
    Simulate {
        /// Tempo of the synthetic track.
        #[arg(long, default_value_t = 128)]
        bpm: u32,
        /// Length of the simulation in seconds.
        #[arg(long, default_value_t = 8)]
        seconds: u32,
        /// What drives the sequencer: manual, mic or music.
        #[arg(long, default_value = "mic", value_parser = parse_sync)]
        sync: SyncSource,
        /// Optional rig configuration (JSON).
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Sequence to play instead of the built-in RGB demo.
        #[arg(short, long)]
        sequence: Option<PathBuf>,
        /// Also run the audio-reactive color effect on a wash fixture.
        #[arg(long)]
        color: bool,
        /// Let drops, build-ups and breakdowns override the color effect.
        #[arg(long, requires = "color")]
        sections: bool,
    },
    /// Validate a sequence file (and optionally a config file).
    Check {
        /// Path to the sequence JSON.
        sequence: PathBuf,
        /// Optional rig configuration to validate alongside.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}
