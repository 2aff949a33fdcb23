//! ecg-sonify CLI
//!
//! Streams a heart sensor through the analysis pipeline and plays the
//! resulting sound layers.

use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand};
use ecg_sonify::{
    config::{Config, ConfigError},
    core::{Calibration, RrSource},
    pipeline::{Session, SessionError, SessionOptions, SessionSummary, Shutdown, ShutdownReason},
    playback::{create_engine, EngineKind, PlaybackScheduler, TerminationPolicy},
    sensor::{
        Channel, ReplayConfig, ReplaySensor, SensorSource, SimulatedConfig, SimulatedSensor,
    },
    stats::{create_shared_stats_with_persistence, PersistedStats},
    VERSION,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ecg-sonify")]
#[command(version = VERSION)]
#[command(about = "Streaming ECG sonification", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream from a sensor and play it live
    Start {
        #[command(flatten)]
        source: SourceArgs,

        #[command(flatten)]
        overrides: Overrides,

        /// Record incoming frames to CSV in the export directory
        #[arg(long)]
        record: bool,
    },

    /// Analyse a whole recording and loop its sound
    Offline {
        /// ECG export (time,ecg_samples)
        #[arg(long)]
        recording: PathBuf,

        /// RR export (time,rr_value)
        #[arg(long)]
        rr: Option<PathBuf>,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Show statistics of the last session
    Status,

    /// Show configuration
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        init: bool,
    },
}

#[derive(Args)]
struct SourceArgs {
    /// Frame source (simulated or replay)
    #[arg(long, default_value = "simulated")]
    source: String,

    /// ECG export to replay
    #[arg(long, required_if_eq("source", "replay"))]
    recording: Option<PathBuf>,

    /// RR export to replay alongside the ECG
    #[arg(long)]
    rr: Option<PathBuf>,

    /// Deliver frames as fast as they are consumed instead of in real time
    #[arg(long)]
    fast: bool,

    /// Simulated sensor drops the link after this many frames
    #[arg(long)]
    frames: Option<u64>,

    /// Simulated sensor rejects ECG streaming with this code
    #[arg(long)]
    reject_code: Option<i32>,
}

/// Per-run overrides of the configuration file.
#[derive(Args)]
struct Overrides {
    /// Audio engine (log, memory or cpal)
    #[arg(long)]
    engine: Option<EngineKind>,

    /// End-of-sequence policy (wrap or halt)
    #[arg(long, value_parser = parse_policy)]
    policy: Option<TerminationPolicy>,

    /// QRS calibration range (narrow or wide)
    #[arg(long, value_parser = parse_calibration)]
    calibration: Option<Calibration>,

    /// RR interval source (hr or ecg)
    #[arg(long, value_parser = parse_rr_source)]
    rr_source: Option<RrSource>,

    /// Frames per channel in one analysis window
    #[arg(long)]
    batch_size: Option<usize>,

    /// Speed factor for every trigger interval (0.01 to 100)
    #[arg(long)]
    tempo: Option<f64>,

    /// Disable the binaural drone
    #[arg(long)]
    no_drone: bool,

    /// Stop after this many seconds
    #[arg(long)]
    duration: Option<u64>,
}

impl Overrides {
    fn apply(&self, config: &mut Config) -> Result<(), ConfigError> {
        if let Some(engine) = self.engine {
            config.playback.engine = engine;
        }
        if let Some(policy) = self.policy {
            config.playback.policy = policy;
        }
        if let Some(calibration) = self.calibration {
            config.mapping.calibration = calibration;
        }
        if let Some(rr_source) = self.rr_source {
            config.analysis.rr_source = rr_source;
        }
        if let Some(batch_size) = self.batch_size {
            config.analysis.batch_size = batch_size;
        }
        if let Some(tempo) = self.tempo {
            config.playback.tempo = tempo;
        }
        if self.no_drone {
            config.playback.drone.enabled = false;
        }
        config.validate()
    }
}

fn parse_policy(s: &str) -> Result<TerminationPolicy, String> {
    match s.trim().to_lowercase().as_str() {
        "wrap" => Ok(TerminationPolicy::Wrap),
        "halt" | "halt-at-end" | "halt_at_end" => Ok(TerminationPolicy::HaltAtEnd),
        other => Err(format!("unknown policy '{other}' (expected wrap or halt)")),
    }
}

fn parse_calibration(s: &str) -> Result<Calibration, String> {
    match s.trim().to_lowercase().as_str() {
        "narrow" => Ok(Calibration::Narrow),
        "wide" => Ok(Calibration::Wide),
        other => Err(format!("unknown calibration '{other}' (expected narrow or wide)")),
    }
}

fn parse_rr_source(s: &str) -> Result<RrSource, String> {
    match s.trim().to_lowercase().as_str() {
        "hr" | "heart_rate" | "heart-rate" => Ok(RrSource::HeartRate),
        "ecg" => Ok(RrSource::Ecg),
        other => Err(format!("unknown RR source '{other}' (expected hr or ecg)")),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Start {
            source,
            overrides,
            record,
        } => cmd_start(source, overrides, record),
        Commands::Offline {
            recording,
            rr,
            overrides,
        } => cmd_offline(recording, rr, overrides),
        Commands::Status => cmd_status(),
        Commands::Config { init } => cmd_config(init),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            exit_code(&e)
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "ecg_sonify=info",
        1 => "ecg_sonify=debug",
        _ => "ecg_sonify=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn exit_code(err: &anyhow::Error) -> ExitCode {
    if let Some(e) = err.downcast_ref::<SessionError>() {
        return ExitCode::from(e.exit_code());
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return ExitCode::from(2);
    }
    ExitCode::FAILURE
}

/// Load the config file and apply the command line on top of it.
fn effective_config(overrides: &Overrides) -> anyhow::Result<Config> {
    let mut config = Config::load().context("loading configuration")?;
    overrides.apply(&mut config)?;
    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }
    Ok(config)
}

fn build_runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("starting async runtime")
}

/// Wire Ctrl+C and Enter to the shutdown flag.
fn install_quit_handlers(shutdown: &Shutdown) -> anyhow::Result<()> {
    let on_interrupt = shutdown.clone();
    ctrlc::set_handler(move || {
        on_interrupt.trigger(ShutdownReason::Interrupted);
    })
    .context("setting Ctrl+C handler")?;

    let on_enter = shutdown.clone();
    std::thread::Builder::new()
        .name("stdin-quit".into())
        .spawn(move || {
            let mut line = String::new();
            // EOF means no terminal; leave quitting to Ctrl+C.
            if let Ok(n) = std::io::stdin().read_line(&mut line) {
                if n > 0 {
                    on_enter.trigger(ShutdownReason::UserQuit);
                }
            }
        })
        .context("starting stdin reader")?;
    Ok(())
}

/// Trigger the shutdown flag after `secs` seconds. Must be called inside the
/// runtime.
fn spawn_deadline(shutdown: &Shutdown, secs: Option<u64>) {
    if let Some(secs) = secs {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            shutdown.trigger(ShutdownReason::DurationElapsed);
        });
    }
}

fn print_settings(config: &Config) {
    println!("  Engine: {:?}", config.playback.engine);
    println!("  Policy: {:?}", config.playback.policy);
    println!(
        "  Window: {} frames at {} Hz",
        config.analysis.batch_size, config.analysis.sampling_rate_hz
    );
    println!("  Calibration: {:?}", config.mapping.calibration);
    println!(
        "  Drone: {}",
        if config.playback.drone.enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
}

fn print_summary(summary: &SessionSummary, config: &Config) {
    println!();
    if let Some(reason) = summary.ended_by {
        println!("Session ended: {reason}");
    }
    if let Some((ref ecg, ref rr)) = summary.recording {
        println!("Recorded frames to {ecg:?} and {rr:?}");
    }
    if config.export.window_reports {
        match summary.save_reports(&config.export.export_path) {
            Ok(Some(path)) => println!(
                "Exported {} window reports to {:?}",
                summary.reports.len(),
                path
            ),
            Ok(None) => {}
            Err(e) => eprintln!("Error writing window reports: {e}"),
        }
    }
    println!();
    println!("{}", summary.stats.summary());
}

fn cmd_start(source: SourceArgs, overrides: Overrides, record: bool) -> anyhow::Result<()> {
    let mut config = effective_config(&overrides)?;
    if record {
        config.export.enabled = true;
    }

    println!("ecg-sonify v{VERSION}");
    println!();
    println!("Starting session...");
    println!("  Source: {}", source.source);
    print_settings(&config);

    let engine = create_engine(config.playback.engine).map_err(SessionError::from)?;
    let mut scheduler = PlaybackScheduler::new(engine, config.playback.clone());
    let stats = create_shared_stats_with_persistence(config.export.stats_path());
    let shutdown = Shutdown::new();
    install_quit_handlers(&shutdown)?;

    let mut options = SessionOptions::from_config(&config);
    let realtime = !source.fast;
    let mut sensor: Box<dyn SensorSource> = match source.source.as_str() {
        "simulated" => Box::new(SimulatedSensor::new(SimulatedConfig {
            realtime,
            frame_limit: source.frames,
            reject_code: source.reject_code,
            ..SimulatedConfig::default()
        })),
        "replay" => {
            let ecg_path = source
                .recording
                .context("--recording is required for replay")?;
            options.finish_pending = true;
            Box::new(
                ReplaySensor::open(ReplayConfig {
                    ecg_path,
                    rr_path: source.rr,
                    realtime,
                })
                .map_err(SessionError::from)?,
            )
        }
        other => {
            return Err(ConfigError::Invalid(format!(
                "unknown source '{other}' (expected simulated or replay)"
            ))
            .into())
        }
    };

    let session = Session::new(options, stats.clone(), shutdown.clone());
    println!("  Session ID: {}", session.session_id());
    println!();
    println!("Hit Enter or Ctrl+C to stop");
    println!();

    let runtime = build_runtime()?;
    let result = runtime.block_on(async {
        spawn_deadline(&shutdown, overrides.duration);
        let result = session.run(sensor.as_mut(), &mut scheduler).await;
        // Sensor tasks need the runtime to shut down cleanly.
        drop(sensor);
        result
    });

    if let Err(e) = stats.save(&session.session_id().to_string(), shutdown.reason()) {
        eprintln!("Warning: Could not save session statistics: {e}");
    }

    let summary = result?;
    print_summary(&summary, &config);
    Ok(())
}

fn cmd_offline(recording: PathBuf, rr: Option<PathBuf>, overrides: Overrides) -> anyhow::Result<()> {
    let mut config = effective_config(&overrides)?;
    // A finite recording loops until stopped.
    config.playback.policy = TerminationPolicy::Wrap;

    println!("ecg-sonify v{VERSION}");
    println!();
    println!("Analysing {recording:?}...");
    print_settings(&config);

    let sensor = ReplaySensor::open(ReplayConfig {
        ecg_path: recording,
        rr_path: rr,
        realtime: false,
    })
    .map_err(SessionError::from)?;
    let with_hr = sensor.channels().contains(&Channel::HeartRate);

    let engine = create_engine(config.playback.engine).map_err(SessionError::from)?;
    let mut scheduler = PlaybackScheduler::new(engine, config.playback.clone());
    let stats = create_shared_stats_with_persistence(config.export.stats_path());
    let shutdown = Shutdown::new();
    install_quit_handlers(&shutdown)?;

    let session = Session::new(SessionOptions::from_config(&config), stats.clone(), shutdown.clone());
    println!("  Session ID: {}", session.session_id());
    println!();
    println!("Hit Enter or Ctrl+C to stop");
    println!();

    let runtime = build_runtime()?;
    let result = runtime.block_on(async {
        spawn_deadline(&shutdown, overrides.duration);
        session
            .run_offline(sensor.frames(), with_hr, &mut scheduler)
            .await
    });

    if let Err(e) = stats.save(&session.session_id().to_string(), shutdown.reason()) {
        eprintln!("Warning: Could not save session statistics: {e}");
    }

    let summary = result?;
    print_summary(&summary, &config);
    Ok(())
}

fn cmd_status() -> anyhow::Result<()> {
    let config = Config::load().context("loading configuration")?;

    println!("ecg-sonify Status");
    println!("=================");
    println!();
    println!("Configuration:");
    print_settings(&config);
    println!(
        "  CSV recording: {}",
        if config.export.enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!("  Export path: {:?}", config.export.export_path);
    println!();

    let stats_path = config.export.stats_path();
    match PersistedStats::load(&stats_path) {
        Ok(Some(last)) => {
            println!("Last session: {}", last.session_id);
            if let Some(reason) = last.ended_by {
                println!("  Ended: {reason}");
            }
            println!("  Saved: {}", last.last_updated.to_rfc3339());
            println!();
            println!("{}", last.stats.summary());
        }
        Ok(None) => println!("No previous session data found."),
        Err(e) => eprintln!("Warning: Could not read {stats_path:?}: {e}"),
    }
    Ok(())
}

fn cmd_config(init: bool) -> anyhow::Result<()> {
    let config = Config::load().context("loading configuration")?;

    if init {
        config.save()?;
        println!("Wrote {:?}", Config::config_path());
        return Ok(());
    }

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
