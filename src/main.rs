//! # Live Voice Client - Application Entry Point
//!
//! Runs one voice conversation against the live endpoint using the software
//! audio devices: the microphone reads a WAV file (or silence) and the reply
//! audio is rendered into a WAV file.
//!
//! ## Usage:
//! ```text
//! live-voice-client [--config <path>] [--print-config]
//! ```
//!
//! ## Exit Codes:
//! - **0**: the session closed cleanly (server close or Ctrl-C)
//! - **1**: the session ended in an error, or startup failed

use anyhow::Result;
use clap::Parser;
use live_voice_client::audio::software::SoftwareDevices;
use live_voice_client::config::AppConfig;
use live_voice_client::transport::gemini::GeminiConnector;
use live_voice_client::{Session, SessionCallbacks, SessionResult, SessionState, SessionStats};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGINT or SIGTERM arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// Command line options.
#[derive(Debug, Parser)]
#[command(name = "live-voice-client", version)]
#[command(about = "Hold a realtime voice conversation with a live model")]
struct Args {
    /// Configuration file; defaults to config.toml in the working directory
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    config.validate()?;

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    info!("Starting live-voice-client v{}", env!("CARGO_PKG_VERSION"));
    info!(
        model = %config.session.model,
        voice = %config.session.voice,
        input = ?config.devices.input_wav,
        output = ?config.devices.output_wav,
        "Configuration loaded"
    );

    setup_signal_handlers();

    let (stats, outcome) = run_session(&config).await;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    if let Err(e) = outcome {
        error!(error = %e, "Session failed");
        std::process::exit(1);
    }

    info!("Session finished");
    Ok(())
}

/// Run one session until the server closes it, it fails, or a shutdown
/// signal arrives.
async fn run_session(config: &AppConfig) -> (SessionStats, SessionResult<()>) {
    let devices = Arc::new(SoftwareDevices::new(config.devices.clone()));
    let connector = Arc::new(GeminiConnector::new(
        config.session.endpoint.clone(),
        config.audio.outbound_queue,
    ));

    let (error_tx, error_rx) = oneshot::channel();
    let callbacks = SessionCallbacks::new()
        .on_audio_data(|frame| {
            debug!(
                samples = frame.len(),
                rms = frame.rms(),
                peak = frame.peak(),
                "Reply audio level"
            );
        })
        .on_error(move |e| {
            let _ = error_tx.send(e);
        })
        .on_close(|| info!("Conversation ended"));

    let session = Session::new(config.session_config(), devices, connector, callbacks);
    info!(session_id = %session.session_id(), "Session created");

    let watcher = {
        let session = session.clone();
        tokio::spawn(async move {
            wait_for_shutdown().await;
            info!("Shutdown signal received, disconnecting...");
            session.disconnect().await;
        })
    };

    if session.connect().await == SessionState::Open {
        info!("Conversation open, speak into the configured input (Ctrl-C to stop)");
    }
    let state = session.closed().await;
    watcher.abort();
    debug!(%state, "Session settled");

    // on_error either fired or was dropped with the other callbacks
    let outcome = match error_rx.await {
        Ok(e) => Err(e),
        Err(_) => Ok(()),
    };
    (session.stats(), outcome)
}

/// Initialize the tracing (logging) system.
///
/// `RUST_LOG` controls what gets logged; without it the default is
/// `live_voice_client=debug`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_voice_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM and SIGINT and raise the shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!(error = %e, "Failed to install signal handlers");
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown flag, checking every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
