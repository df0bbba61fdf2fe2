//! Application entry point — console voice-chat client.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Parse CLI flags and load [`AppConfig`] from disk (defaults on first
//!    run).
//! 3. Create the tokio runtime (multi-thread, 2 workers).
//! 4. Build the [`CaptureSession`] with the production collaborators
//!    (cpal microphone, WebSocket connector, cpal playback).
//! 5. `start()` the session and render events to the console until Ctrl-C,
//!    the turn limit, or transport closure.
//! 6. `stop()` the session and print the byte totals.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;

use voice_chat::{
    audio::{CpalMicrophone, DevicePlayback},
    config::AppConfig,
    net::WsConnector,
    session::{CaptureSession, ClientEvent},
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

/// Talk to a remote speech service from the terminal.
#[derive(Debug, Parser)]
#[command(name = "voice-chat", version, about)]
struct Args {
    /// Path to an explicit settings.toml (default: the platform config dir).
    #[arg(long)]
    config: Option<PathBuf>,

    /// WebSocket URL of the speech service (overrides the config file).
    #[arg(long)]
    url: Option<String>,

    /// Stop after this many final transcripts; -1 means run until Ctrl-C.
    #[arg(long, default_value_t = -1)]
    turns: i32,
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load().unwrap_or_else(|e| {
            log::warn!("failed to load config ({e}); using defaults");
            AppConfig::default()
        }),
    };
    if let Some(url) = args.url {
        config.server.url = Some(url);
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    rt.block_on(run(config, args.turns))
}

async fn run(config: AppConfig, turns: i32) -> anyhow::Result<()> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ClientEvent>();

    let mut session = CaptureSession::new(
        config,
        Box::new(CpalMicrophone),
        Arc::new(WsConnector),
        Arc::new(DevicePlayback),
        event_tx,
    );

    session.start().await?;
    log::info!("listening — press Ctrl-C to stop");

    let mut finals = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted");
                break;
            }
            event = event_rx.recv() => match event {
                Some(ClientEvent::Utterance(utterance)) => {
                    println!("{}: {}", utterance.speaker.label(), utterance.text);
                    finals += 1;
                    if turns > 0 && finals >= turns {
                        log::info!("turn limit reached");
                        break;
                    }
                }
                Some(ClientEvent::Partial { text, agent }) => {
                    // Transient; not worth a console line of its own.
                    log::debug!("partial ({}): {text}", if agent { "agent" } else { "you" });
                }
                Some(ClientEvent::TransportClosed) => {
                    log::warn!("connection closed by the remote side");
                    break;
                }
                None => break,
            }
        }
    }

    session.stop().await;

    let (sent, received) = session.byte_counters();
    log::info!("bytes sent: {sent}, bytes received: {received}");
    Ok(())
}
