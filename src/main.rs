//! Ostinato CLI - run the synthesis engine against real or simulated drivers.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use ostinato::io::{audio_driver_names, create_audio_driver, create_event_driver, event_driver_names};
use ostinato::prelude::*;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ostinato")]
#[command(author, version, about = "Real-time polyphonic synthesis engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine until Ctrl+C or the duration elapses
    Run(RunArgs),

    /// List the devices each driver can open
    Devices {
        /// Audio driver to enumerate
        #[arg(long, default_value = "cpal")]
        audio: String,

        /// Event driver to enumerate
        #[arg(long, default_value = "midir")]
        events: String,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Engine configuration (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Audio driver: cpal, timer or none
    #[arg(long)]
    audio_driver: Option<String>,

    /// Audio device name (substring match)
    #[arg(long)]
    audio_device: Option<String>,

    /// Event driver: midir, virtual or none
    #[arg(long)]
    event_driver: Option<String>,

    /// MIDI input port name (substring match)
    #[arg(long)]
    event_device: Option<String>,

    /// Frames per period
    #[arg(long)]
    period_size: Option<usize>,

    /// Stop after this many seconds
    #[arg(short, long)]
    duration: Option<f64>,

    /// Play a short arpeggio on channel 1 after starting
    #[arg(long)]
    demo: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => run(args),
        Commands::Devices { audio, events } => devices(&audio, &events),
    };

    if let Err(e) = result {
        let fatal = e
            .downcast_ref::<ostinato::Error>()
            .is_some_and(ostinato::Error::is_fatal);
        if fatal {
            eprintln!("fatal: could not allocate engine pools: {:#}", e);
            std::process::exit(2);
        }
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(args: &RunArgs) -> anyhow::Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(driver) = &args.audio_driver {
        config.audio.driver = driver.clone();
    }
    if let Some(device) = &args.audio_device {
        config.audio.device = Some(device.clone());
    }
    if let Some(driver) = &args.event_driver {
        config.events.driver = driver.clone();
    }
    if let Some(device) = &args.event_device {
        config.events.device = Some(device.clone());
    }
    if let Some(period_size) = args.period_size {
        config.period_size = period_size;
    }
    Ok(config)
}

fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    let engine = SynthEngine::from_config(config)?;
    engine.start()?;

    let geometry = engine.geometry();
    println!(
        "Running {} part(s) at {} Hz, {} x {} frames",
        engine.part_count(),
        engine.sample_rate(),
        geometry.period_count,
        geometry.period_size
    );
    println!("\nPress Ctrl+C to stop...\n");

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        println!("\nStopping...");
        r.store(false, Ordering::SeqCst);
    })?;

    if args.demo {
        play_demo(&engine);
    }

    let started = Instant::now();
    let deadline = args.duration.map(Duration::from_secs_f64);
    let mut last_report = Instant::now();
    while running.load(Ordering::SeqCst) {
        if deadline.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
        thread::sleep(Duration::from_millis(50));

        if let Some(e) = engine.take_fatal_error() {
            return Err(e.into());
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            last_report = Instant::now();
            let stats = engine.stats();
            tracing::info!(
                peak = engine.take_output_peak(),
                frames = engine.frames_played(),
                violations = stats.timing_violations,
                dropped = stats.dropped_events,
                restarts = stats.restarts,
                "engine status"
            );
        }
    }

    engine.stop();
    println!("Done!");
    Ok(())
}

fn play_demo(engine: &SynthEngine) {
    for note in [60u8, 64, 67, 72, 76, 72, 67, 64] {
        engine.note_on(0, note, 100);
        thread::sleep(Duration::from_millis(150));
        engine.note_off(0, note);
    }
}

fn devices(audio: &str, events: &str) -> anyhow::Result<()> {
    let audio_driver = create_audio_driver(audio)
        .with_context(|| format!("audio drivers: {}", audio_driver_names().join(", ")))?;
    let event_driver = create_event_driver(events)
        .with_context(|| format!("event drivers: {}", event_driver_names().join(", ")))?;

    println!("Audio Devices ({})", audio_driver.name());
    println!("==================\n");
    for (idx, name) in audio_driver.list_devices()?.iter().enumerate() {
        println!("  [{}] {}", idx, name);
    }

    println!("\nMIDI Inputs ({})", event_driver.name());
    println!("================\n");
    let inputs = event_driver.list_devices()?;
    if inputs.is_empty() {
        println!("  No MIDI input devices found.");
    }
    for (idx, name) in inputs.iter().enumerate() {
        println!("  [{}] {}", idx, name);
    }
    Ok(())
}
