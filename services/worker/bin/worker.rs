//! Main Entrypoint for the Voice Agent Worker
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing logging.
//! 3. Building the backend client and the voice pipeline factory.
//! 4. Either registering with the dispatch server (`start`) or joining one
//!    room directly (`connect`).
//! 5. Handling graceful shutdown on Ctrl+C.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{Instrument, info};
use voice_worker::{
    config::Config,
    dispatch::{Worker, WorkerSettings},
    job::ShimJobRunner,
    pipeline::VoicePipelineFactory,
    room::rtc::{self, LiveKitConnector},
    shim::SessionShim,
};
use voice_worker_core::backend::HttpBackendClient;

/// How long a running session gets to report its end after Ctrl+C.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(version, about = "LiveKit voice agent worker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Register with the dispatch server and serve assigned rooms.
    Start,
    /// Join a single room directly, skipping dispatch.
    Connect {
        #[arg(long)]
        room: String,
        #[arg(long, default_value = "agent-dev")]
        identity: String,
        /// Used when the room has no metadata, e.g. `{"agentId":"..","sessionId":".."}`.
        #[arg(long, default_value = "")]
        metadata: String,
    },
}

/// Listens for the `Ctrl+C` signal and raises the shutdown flag.
async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
    let _ = shutdown.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!(?config, "Configuration loaded.");

    // --- 3. Initialize Shared Services ---
    let backend = Arc::new(
        HttpBackendClient::new(
            &config.backend_url,
            config.worker_secret.clone(),
            config.backend_timeout,
        )
        .context("Failed to build backend client")?,
    );
    let sessions = Arc::new(VoicePipelineFactory::new(
        reqwest::Client::new(),
        config.llm_api_base.clone(),
        config.sarvam_api_base.clone(),
    ));
    let shim = SessionShim::new(backend, sessions);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(shutdown_signal(shutdown_tx));

    // --- 4. Run ---
    match cli.command.unwrap_or(Command::Start) {
        Command::Start => {
            let settings =
                WorkerSettings::from_config(&config).context("Invalid dispatch settings")?;
            info!(
                agent_name = %settings.agent_name,
                url = %settings.ws_url,
                "Starting worker..."
            );
            let runner = ShimJobRunner::new(shim, Arc::new(LiveKitConnector), &config.livekit.url);
            let worker = Worker::new(settings, Arc::new(runner));

            worker
                .serve(shutdown_rx, DRAIN_TIMEOUT)
                .await
                .context("Dispatch connection failed")?;
        }
        Command::Connect {
            room,
            identity,
            metadata,
        } => {
            let token = rtc::join_token(&config.livekit, &room, &identity, &config.agent_name)
                .context("Failed to mint join token")?;
            let link = rtc::connect(&config.livekit.url, &token)
                .await
                .context("Failed to join room")?;

            let span = tracing::info_span!(
                "session",
                %room,
                agent_id = tracing::field::Empty,
                session_id = tracing::field::Empty,
            );
            let reason = shim.run(link, &metadata, shutdown_rx).instrument(span).await?;
            info!(%reason, "Session closed");
        }
    }

    info!("Worker has shut down.");
    Ok(())
}
