use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use beacon_ring::voice::{AudioSource, MicrophoneSource};
use beacon_ring::{
    AlertAction, Companion, Config, ConnectionManager, Controller, DiscoveryEvent, HttpRecognizer,
    LogAlert, MdnsDirectory, Message, ServiceDirectory, ToneAlert,
};

/// Beacon Ring - make a paired device ring by voice
#[derive(Parser)]
#[command(name = "beacon-ring", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Advertise, accept a companion, and listen for the trigger phrase
    Controller {
        /// Port to listen on (OS-assigned when omitted)
        #[arg(long, env = "BEACON_RING_PORT")]
        port: Option<u16>,
    },
    /// Find a controller and ring when told to
    Companion {
        /// Log instead of playing a tone
        #[arg(long)]
        silent: bool,
    },
    /// Send one command literal to the first controller found
    Send {
        /// Command literal, e.g. RING
        command: String,
        /// Seconds to wait for a controller to appear
        #[arg(short, long, default_value = "10")]
        timeout: u64,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Play the companion alert once
    TestAlert,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,beacon_ring=info",
        1 => "info,beacon_ring=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;
    tracing::debug!(?config, "loaded configuration");

    match cli.command {
        Command::Controller { port } => run_controller(&config, port).await,
        Command::Companion { silent } => run_companion(&config, silent).await,
        Command::Send { command, timeout } => {
            send_command(&config, &command, Duration::from_secs(timeout)).await
        }
        Command::TestMic { duration } => test_mic(duration).await,
        Command::TestAlert => test_alert(&config).await,
    }
}

async fn run_controller(config: &Config, port: Option<u16>) -> anyhow::Result<()> {
    let directory = MdnsDirectory::new()?;
    let recognizer = HttpRecognizer::new(config.recognizer_settings())?;
    let options = config.controller_options();

    let mut descriptor = config.descriptor();
    if let Some(port) = port {
        descriptor = descriptor.with_port(port);
    }

    tracing::info!(
        name = descriptor.name(),
        triggers = ?options.triggers.phrases(),
        "starting controller"
    );

    let (controller, handle) = Controller::new(
        Box::new(MicrophoneSource::new()),
        Arc::new(recognizer),
        options,
    );

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted");
            handle.shutdown().await;
        }
    });

    controller.serve(&directory, descriptor).await?;
    Ok(())
}

async fn run_companion(config: &Config, silent: bool) -> anyhow::Result<()> {
    let directory = MdnsDirectory::new()?;
    let alert: Arc<dyn AlertAction> = if silent {
        Arc::new(LogAlert)
    } else {
        Arc::new(ToneAlert::new(config.alert))
    };

    tracing::info!(service_type = %config.service.service_type, "starting companion");

    let (companion, handle) = Companion::new(alert);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted");
            handle.shutdown().await;
        }
    });

    companion.run(&directory, &config.service.service_type).await?;
    Ok(())
}

async fn send_command(config: &Config, command: &str, timeout: Duration) -> anyhow::Result<()> {
    let directory = MdnsDirectory::new()?;
    let mut sightings = directory.browse(&config.service.service_type).await?;

    println!("Looking for a controller ({}s)...", timeout.as_secs());

    let endpoint = tokio::time::timeout(timeout, async {
        while let Some(event) = sightings.next().await {
            if let DiscoveryEvent::Found(endpoint) = event {
                return Some(endpoint);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
    .ok_or_else(|| anyhow::anyhow!("no controller found within {}s", timeout.as_secs()))?;

    println!("Found {endpoint}");

    // Keep the receiver alive so the connection's reader has somewhere to report
    let (events_tx, _events_rx) = mpsc::channel(8);
    let mut connections = ConnectionManager::new(events_tx);
    connections.connect(&endpoint).await?;
    connections.send(&Message::literal(command)).await?;
    connections.close().await;

    println!("Sent {command:?}");
    Ok(())
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let (tx, mut rx) = mpsc::channel(64);
    let mut capture = MicrophoneSource::new();
    capture.start(tx)?;

    if let Some(sample_rate) = capture.sample_rate() {
        println!("Sample rate: {sample_rate} Hz");
    }
    println!("---");

    for i in 0..duration {
        let mut samples = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while let Ok(Some(buffer)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            samples.extend_from_slice(&buffer.samples);
        }

        let energy = calculate_rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    capture.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: arecord -l (to list devices)");

    Ok(())
}

/// Calculate RMS energy
#[allow(clippy::cast_precision_loss)]
fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Play the alert pattern once
async fn test_alert(config: &Config) -> anyhow::Result<()> {
    println!(
        "Playing {} beeps at {} Hz...",
        config.alert.repeats, config.alert.frequency_hz
    );

    ToneAlert::new(config.alert).alert().await?;

    println!("If you heard the beeps, your speakers are working!");
    Ok(())
}
