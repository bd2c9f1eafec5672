// Daemon wiring: store, engine, scheduler, and the HTTP listener.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::http::{self, AppState};
use crate::store::MessageStore;
use crate::sync::github::GithubClient;
use crate::sync::{RemoteRepositoryClient, Scheduler, SyncEngine, SyncSettings, TargetSpec};

/// Run until Ctrl-C or SIGTERM against the configured GitHub API.
pub async fn run(config: DaemonConfig) -> Result<()> {
    let timeout = Duration::from_secs(config.sync.commit_timeout_sec);
    let client = GithubClient::from_config(&config.github, timeout)?;
    let engine = open_engine(&config, Arc::new(client))?;

    let addr = config.listen_socket_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {addr}"))?;

    serve(listener, &config, engine, shutdown_signal()).await
}

/// Open the message store and register every configured target.
pub fn open_engine(
    config: &DaemonConfig,
    client: Arc<dyn RemoteRepositoryClient>,
) -> Result<Arc<SyncEngine>> {
    let db_path = config.resolved_db_path();
    let store = Arc::new(
        MessageStore::open(&db_path)
            .with_context(|| format!("failed to open message store at `{}`", db_path.display()))?,
    );

    let targets = config
        .targets
        .iter()
        .map(|target| {
            TargetSpec::from_config(target)
                .with_context(|| format!("invalid path_prefix for target `{}`", target.name))
        })
        .collect::<Result<Vec<_>>>()?;

    let engine = SyncEngine::new(store, client, targets, SyncSettings::from(&config.sync))
        .context("failed to register sync targets")?;
    info!(
        db_path = %db_path.display(),
        targets = engine.targets().len(),
        "message store ready"
    );
    Ok(Arc::new(engine))
}

/// Serve HTTP on `listener` with a background scheduler until `shutdown`
/// resolves, then stop the scheduler.
pub async fn serve<F>(
    listener: TcpListener,
    config: &DaemonConfig,
    engine: Arc<SyncEngine>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let interval = Duration::from_secs(config.sync.sweep_interval_sec);
    let scheduler = Scheduler::start(Arc::clone(&engine), interval);
    let state = AppState {
        engine,
        trigger: Some(scheduler.trigger()),
        sync_on_append: config.sync.sync_on_append,
    };

    let local_addr = listener.local_addr().context("failed to read listener address")?;
    info!(listen_addr = %local_addr, "chatlog daemon listening");

    let served = axum::serve(listener, http::router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server exited unexpectedly");

    scheduler.stop().await;
    info!("chatlog daemon stopped");
    served
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
