//! GTM Intelligence sync CLI
//!
//! Composition root for the sync client: owns the single Transport
//! instance for the process and wires the store, offline cache, and
//! lifecycle controller together.

mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use gtmintel_client::cache::{create_cache_channel, load_icp_models, load_sessions, CacheWriter};
use gtmintel_client::rest::RestClient;
use gtmintel_client::{
    paths, LifecycleController, Phase, SessionStore, SyncConfig, Transport,
};
use gtmintel_protocol::{EventKind, ServerMessage};

#[derive(Parser)]
#[command(name = "gtmintel", about = "GTM Intelligence session sync client", version)]
struct Cli {
    /// REST backend base URL
    #[arg(long, env = "GTMINTEL_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    /// Workflow server WebSocket URL
    #[arg(long, env = "GTMINTEL_WS_URL", default_value = "ws://localhost:3001/ws")]
    ws_url: String,

    /// Acting user id (sent as x-user-id and joined on connect)
    #[arg(long, env = "GTMINTEL_USER_ID")]
    user_id: String,

    /// Data directory (default ~/.gtmintel)
    #[arg(long, env = "GTMINTEL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Connect and stream live session updates (default)
    Run,
    /// List sessions from the backend
    Sessions,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    paths::init_data_dir(cli.data_dir.as_deref());
    paths::ensure_dirs().context("creating data directories")?;
    let _logging = logging::init_logging()?;

    match cli.command {
        Some(Command::Sessions) => list_sessions(&cli).await,
        Some(Command::Run) | None => run(&cli).await,
    }
}

fn sync_config(cli: &Cli) -> SyncConfig {
    SyncConfig::new(&cli.api_url, &cli.ws_url, &cli.user_id)
}

async fn list_sessions(cli: &Cli) -> anyhow::Result<()> {
    let config = sync_config(cli);
    let rest = RestClient::new(config.rest_base_url, config.user_id, config.request_timeout)?;
    let sessions = rest.list_sessions().await.context("fetching sessions")?;

    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }
    for session in sessions {
        let stage = session
            .status
            .as_ref()
            .map(|s| s.stage.as_str().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<32}  {:>5} results  {}",
            session.id, session.name, session.results_count, stage
        );
    }
    Ok(())
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = sync_config(cli);

    // Offline cache: writer actor plus startup seed.
    let db_path = paths::cache_db_path();
    let (cache_tx, cache_rx) = create_cache_channel();
    tokio::spawn(CacheWriter::new(cache_rx, db_path.clone()).run());

    let seed_path = db_path.clone();
    let (sessions, models) = tokio::task::spawn_blocking(move || {
        let sessions = load_sessions(&seed_path).unwrap_or_else(|e| {
            warn!(
                component = "cli",
                event = "cli.cache.load_failed",
                error = %e,
                "Could not load cached sessions"
            );
            Vec::new()
        });
        let models = load_icp_models(&seed_path).unwrap_or_else(|e| {
            warn!(
                component = "cli",
                event = "cli.cache.load_failed",
                error = %e,
                "Could not load cached ICP models"
            );
            Vec::new()
        });
        (sessions, models)
    })
    .await
    .context("loading offline cache")?;

    let rest = RestClient::new(
        config.rest_base_url.clone(),
        config.user_id.clone(),
        config.request_timeout,
    )?;
    let store = SessionStore::new(rest, Some(cache_tx));
    store.seed(sessions, models);

    // The one Transport instance for this process.
    let transport = Transport::new(config.clone());

    // Bridge inbound events into the store's async entry point.
    let (event_tx, mut event_rx) = mpsc::channel::<ServerMessage>(64);
    for kind in [
        EventKind::Connected,
        EventKind::SessionJoined,
        EventKind::WorkflowStatus,
        EventKind::WorkflowSubsteps,
        EventKind::WorkflowSubstep,
        EventKind::SearchComplete,
        EventKind::Error,
    ] {
        let event_tx = event_tx.clone();
        transport.on(kind, move |msg| {
            let _ = event_tx.try_send(msg.clone());
        });
    }
    {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            while let Some(msg) = event_rx.recv().await {
                if let ServerMessage::WorkflowStatus { session_id, data } = &msg {
                    if let Some(progress) = data.progress {
                        println!(
                            "[{}] {} {}%",
                            session_id,
                            data.message.as_deref().unwrap_or("working"),
                            progress
                        );
                    }
                }
                store.apply_server_message(&msg).await;
            }
        });
    }

    let lifecycle = LifecycleController::new(Arc::clone(&transport), Arc::clone(&store));
    lifecycle.start();

    // Notices (search completion, failures) to stdout.
    let mut notices = store.subscribe_notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            println!("• {}", notice.message);
        }
    });

    transport
        .connect(&config.user_id)
        .await
        .context("connecting to workflow server")?;
    store.refresh_sessions().await;
    store.refresh_icp_models().await;

    info!(
        component = "cli",
        event = "cli.running",
        "Connected; streaming session updates"
    );
    println!("Connected. Streaming session updates (ctrl-c to exit).");

    let mut phase = transport.phase_watch();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = phase.changed() => {
                if changed.is_err() {
                    break;
                }
                if *phase.borrow() == Phase::Failed {
                    error!(
                        component = "cli",
                        event = "cli.connection_lost",
                        "Reconnect attempts exhausted"
                    );
                    eprintln!(
                        "Connection to the workflow server was lost and could not be re-established."
                    );
                    break;
                }
            }
        }
    }

    lifecycle.shutdown();
    transport.disconnect();
    Ok(())
}
