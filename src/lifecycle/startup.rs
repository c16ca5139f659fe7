//! Startup orchestration.
//!
//! # Responsibilities
//! - Load and validate configuration
//! - Install logging and the metrics recorder
//! - Build the balancer, start its loops, bind the admin server
//! - Wire the config watcher to hot reload
//! - Shut everything down within the configured timeout
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - The admin server binds last, after the balancer is running

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusHandle};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::admin::{setup_admin_router, AdminState};
use crate::config::{load_config, ConfigError, ConfigWatcher, NlbConfig};
use crate::lifecycle::signals::wait_for_shutdown_signal;
use crate::lifecycle::supervisor::{self, BackgroundTask, StopOutcome};
use crate::nlb::{Nlb, NlbError};
use crate::observability::logging::init_logging;
use crate::observability::metrics::{install_prometheus, NoopSink, PrometheusSink, SharedSink};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("logging: {0}")]
    Logging(#[from] tracing_subscriber::util::TryInitError),

    #[error("metrics recorder: {0}")]
    Metrics(#[from] BuildError),

    #[error(transparent)]
    Nlb(#[from] NlbError),

    #[error("failed to bind admin server on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config watcher: {0}")]
    Watch(#[from] notify::Error),
}

/// Load config from `config_path` (defaults when `None`), then run until
/// SIGINT or SIGTERM.
pub async fn run(config_path: Option<PathBuf>) -> Result<(), StartupError> {
    let config = match &config_path {
        Some(path) => load_config(path)?,
        None => NlbConfig::default(),
    };
    init_logging(&config.observability)?;

    let prometheus = if config.observability.metrics_enabled {
        Some(install_prometheus()?)
    } else {
        None
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?config_path,
        "proxy-nlb starting"
    );
    run_until(config, config_path, prometheus, wait_for_shutdown_signal()).await
}

/// Run the balancer until `shutdown` resolves.
///
/// Logging and the recorder are the caller's job; tests drive this directly.
pub async fn run_until<F>(
    config: NlbConfig,
    config_path: Option<PathBuf>,
    prometheus: Option<PrometheusHandle>,
    shutdown: F,
) -> Result<(), StartupError>
where
    F: Future<Output = ()>,
{
    let sink: SharedSink = match prometheus {
        Some(_) => Arc::new(PrometheusSink),
        None => Arc::new(NoopSink),
    };
    let shutdown_timeout = config.lifecycle.shutdown_timeout();
    let admin = config.admin.clone();
    let running = config.clone();

    let nlb = Arc::new(Nlb::new(config, sink)?);
    nlb.start()?;

    let mut tasks = Vec::new();

    // Keep the watcher handle alive for the whole run.
    let _watcher = match &config_path {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            let watcher = watcher.with_current(running);
            let handle = watcher.run()?;
            tasks.push(spawn_reload(nlb.clone(), updates));
            Some(handle)
        }
        None => None,
    };

    if admin.enabled {
        let listener = TcpListener::bind(&admin.bind_address)
            .await
            .map_err(|source| StartupError::Bind {
                addr: admin.bind_address.clone(),
                source,
            })?;
        let app = setup_admin_router(AdminState {
            nlb: nlb.clone(),
            prometheus,
        });
        let addr = listener.local_addr().ok();
        tracing::info!(address = ?addr, "Admin server listening");

        tasks.push(BackgroundTask::spawn("admin-server", move |mut stop| async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop.recv().await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "Admin server failed");
            }
        }));
    }

    shutdown.await;
    tracing::info!(timeout = ?shutdown_timeout, "Shutting down");

    stop_within(tasks, shutdown_timeout, |remaining| nlb.stop(remaining)).await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Stop `tasks`, then hand whatever is left of `timeout` to `then`.
///
/// The whole shutdown shares one deadline.
async fn stop_within<F, Fut>(
    tasks: Vec<BackgroundTask>,
    timeout: Duration,
    then: F,
) -> Vec<(String, StopOutcome)>
where
    F: FnOnce(Duration) -> Fut,
    Fut: Future<Output = Vec<(String, StopOutcome)>>,
{
    let deadline = Instant::now() + timeout;
    let mut outcomes = supervisor::stop_all(tasks, timeout).await;
    let remaining = deadline.saturating_duration_since(Instant::now());
    tracing::debug!(?remaining, "Run tasks stopped, stopping balancer");
    outcomes.extend(then(remaining).await);
    outcomes
}

fn spawn_reload(nlb: Arc<Nlb>, mut updates: mpsc::UnboundedReceiver<NlbConfig>) -> BackgroundTask {
    BackgroundTask::spawn("config-reload", move |mut stop| async move {
        loop {
            tokio::select! {
                update = updates.recv() => {
                    let Some(config) = update else { break };
                    if let Err(e) = nlb.apply_config(config) {
                        tracing::error!(error = %e, "Failed to apply reloaded config");
                    }
                }
                _ = stop.recv() => break,
            }
        }
    })
}
