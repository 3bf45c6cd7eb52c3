//! encore - playback session daemon

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use encore_common::config::{Config, LoggingConfig};
use encore_common::protocol::TransportAction;
use encore_common::{Session, Track};
use encore_player::api::{self, AppContext};
use encore_player::backend::mpv::MpvBackend;
use encore_player::backend::AudioBackend;
use encore_player::coordinator::{CoordinatorMsg, CoordinatorOptions, SessionCoordinator};
use encore_player::hub::StateBroadcaster;
use encore_player::persistence::SessionPersistence;
use encore_player::reattach::HandleStore;
use encore_player::retry::RetryPolicy;
use encore_player::session;

#[derive(Parser, Debug)]
#[command(name = "encore")]
#[command(about = "Playback session daemon for a terminal music player")]
#[command(version)]
struct Args {
    /// Port for the command/state channel (overrides the config file)
    #[arg(short, long, env = "ENCORE_PORT")]
    port: Option<u16>,

    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bearer token required from observers (overrides the config file)
    #[arg(long, env = "ENCORE_TOKEN")]
    token: Option<String>,

    /// Track ids to seed the queue with at startup
    #[arg(long = "queue", value_name = "TRACK_ID")]
    queue: Vec<String>,

    /// Start playing the first seeded track immediately
    #[arg(long, requires = "queue")]
    play: bool,

    /// Do not restore the persisted session
    #[arg(long)]
    no_restore: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).context("loading configuration")?;
    init_tracing(&config.logging)?;
    info!("encore v{} starting", env!("CARGO_PKG_VERSION"));

    let port = args.port.unwrap_or(config.port);
    let token = args.token.clone().or_else(|| config.auth_token.clone());

    let session_path = match &config.state_file {
        Some(path) => path.clone(),
        None => config.session_file().context("resolving session file")?,
    };
    let persistence = SessionPersistence::new(session_path, config.save_debounce());

    let initial = if args.no_restore {
        Session::default()
    } else {
        match persistence.load() {
            Some(saved) => {
                info!("restoring persisted session");
                session::reduce(Session::default(), &TransportAction::RestoreState(saved))
            }
            None => Session::default(),
        }
    };

    let backend: Arc<dyn AudioBackend> = Arc::new(MpvBackend::new());
    let hub = StateBroadcaster::new(100);
    let snapshot = Arc::new(RwLock::new(initial.clone()));
    let handles = HandleStore::new(
        config
            .background_file()
            .context("resolving background session handle file")?,
    );

    let (coordinator, command_tx) = SessionCoordinator::new(CoordinatorOptions {
        initial,
        backend,
        persistence,
        hub: hub.clone(),
        snapshot: snapshot.clone(),
        handles,
        retry: RetryPolicy::new(config.retry_attempts, config.retry_delay()),
        pause_suppression: config.pause_suppression(),
        detach_on_exit: config.detach_on_exit,
    });
    let coordinator_task = tokio::spawn(coordinator.run());

    seed_from_cli(&args, &command_tx).await;

    let ctx = AppContext {
        command_tx: command_tx.clone(),
        hub,
        snapshot,
        token,
    };
    let result = api::run(port, ctx, shutdown_signal()).await;

    // The server is down; stop the coordinator and wait for its final
    // flush before exiting.
    let _ = command_tx.send(CoordinatorMsg::Shutdown).await;
    if let Err(e) = coordinator_task.await {
        warn!("coordinator task failed: {e}");
    }
    info!("shutdown complete");

    result.map_err(Into::into)
}

/// Turn `--queue`/`--play` flags into the startup actions.
async fn seed_from_cli(args: &Args, command_tx: &mpsc::Sender<CoordinatorMsg>) {
    if args.queue.is_empty() {
        return;
    }
    let tracks: Vec<Track> = args
        .queue
        .iter()
        .map(|id| Track::new(id.clone(), id.clone()))
        .collect();
    let first = tracks.first().cloned();

    let _ = command_tx
        .send(CoordinatorMsg::Command(TransportAction::SetQueue(tracks)))
        .await;
    if args.play {
        if let Some(track) = first {
            let _ = command_tx
                .send(CoordinatorMsg::Command(TransportAction::Play(track)))
                .await;
        }
    }
}

fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "encore={level},encore_player={level},encore_common={level}",
            level = logging.level
        )
        .into()
    });

    match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received terminate signal, shutting down"),
    }
}
