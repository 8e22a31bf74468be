//! Cirrus Daemon - Background synchronization service
//!
//! This binary runs as a user service and handles:
//! - Watching the sync root for local changes
//! - Listening for server notifications
//! - Running sync cycles on triggers and on a poll interval
//! - Graceful shutdown on SIGTERM/SIGINT
//!
//! # Architecture
//!
//! Startup builds one [`EngineContext`] holding every component handle and
//! recovers changes left in flight by a previous run. The watcher ingestor,
//! the notification listener and the sync worker then run as separate
//! tasks sharing a `CancellationToken` that fires on SIGTERM or SIGINT.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use cirrus_core::{config::Config, domain::ClientId, ports::ILocalIndex};
use cirrus_index::{DatabasePool, SqliteLocalIndex};
use cirrus_remote::{NotificationPoller, RemoteClient};
use cirrus_sync::{
    applier::LocalFilesystemApplier,
    backoff::Backoff,
    engine::{CycleReport, EngineContext, EngineSettings, SyncEngine},
    notification::NotificationListener,
    watcher::{ChangeIngestor, FileWatcher},
    worker::{SyncTrigger, SyncWorker},
};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How long the server may hold a notification request
const NOTIFICATION_WAIT: Duration = Duration::from_secs(60);

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "cirrusd", version, about = "Cirrus file synchronization daemon")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run sync cycles until nothing is pending, then exit
    #[arg(long)]
    once: bool,
}

// ============================================================================
// DaemonService
// ============================================================================

/// Owns the configuration and the engine built from it
struct DaemonService {
    config: Config,
    client_id: ClientId,
    engine: Arc<SyncEngine>,
    shutdown: CancellationToken,
}

impl DaemonService {
    /// Opens the index, builds the adapters and recovers interrupted work
    async fn new(mut config: Config, config_path: &Path, shutdown: CancellationToken) -> Result<Self> {
        config.sync.root = expand_home(&config.sync.root);
        config.database.path = expand_home(&config.database.path);

        let (client_id, generated) = config.ensure_client_id();
        if generated {
            config
                .save(config_path)
                .with_context(|| format!("Failed to save {}", config_path.display()))?;
            info!(%client_id, "Generated client identity");
        }

        tokio::fs::create_dir_all(&config.sync.root)
            .await
            .with_context(|| format!("Failed to create sync root {}", config.sync.root.display()))?;

        let errors = config.validate();
        if !errors.is_empty() {
            for e in &errors {
                error!(field = %e.field, "{}", e.message);
            }
            bail!("Invalid configuration ({} errors)", errors.len());
        }

        let pool = DatabasePool::new(&config.database.path)
            .await
            .context("Failed to open database")?;
        let index = Arc::new(SqliteLocalIndex::new(
            pool.pool().clone(),
            config.sync.root.clone(),
        ));
        info!(path = %config.database.path.display(), "Opened index");

        let remote = Arc::new(
            RemoteClient::new(&config.remote.base_url, config.sync.network_timeout())
                .context("Failed to create remote client")?,
        );
        let applier = Arc::new(LocalFilesystemApplier::new(
            config.sync.root.clone(),
            remote.clone(),
        ));

        let ctx = EngineContext::new(
            client_id,
            EngineSettings::from_config(&config),
            index.clone(),
            remote,
            applier,
        )
        .await
        .context("Failed to build engine context")?;
        let engine = Arc::new(SyncEngine::new(ctx));

        let indexed_root = index.cursor().await.context("Failed to read sync cursor")?.root_path;
        if let Some(target) = relocation_target(&indexed_root, &config.sync.root) {
            info!(
                from = %indexed_root.display(),
                to = %target.display(),
                "Sync root moved, relocating index at next commit"
            );
            engine.request_relocation(target);
        }

        let recovered = engine.recover().await.context("Startup recovery failed")?;
        if recovered > 0 {
            info!(recovered, "Recovered interrupted changes");
        }

        Ok(Self {
            config,
            client_id,
            engine,
            shutdown,
        })
    }

    fn worker(&self, trigger: SyncTrigger) -> SyncWorker {
        SyncWorker::new(
            self.engine.clone(),
            trigger,
            self.config.sync.poll_interval(),
            self.config.sync.debounce_delay(),
        )
    }

    /// Runs cycles until nothing is pending
    async fn sync_once(&self) -> Result<CycleReport> {
        let report = self.worker(SyncTrigger::new()).run_once(&self.shutdown).await?;
        log_report(&report);
        Ok(report)
    }

    /// Runs until shutdown or until the engine halts
    async fn run(&self) -> Result<()> {
        let trigger = SyncTrigger::new();
        let root = self.config.sync.root.clone();

        // The watcher stops when dropped, so it lives for the whole run
        let (mut watcher, events) = FileWatcher::new().context("Failed to create file watcher")?;
        watcher
            .watch(&root)
            .with_context(|| format!("Failed to watch {}", root.display()))?;
        let ingestor = ChangeIngestor::new(self.engine.context(), root.clone(), trigger.clone());
        let ingest_task = tokio::spawn(ingestor.run(events, self.shutdown.clone()));

        let poller = NotificationPoller::new(&self.config.remote.base_url, self.client_id, NOTIFICATION_WAIT)
            .context("Failed to create notification poller")?;
        let listener = NotificationListener::new(
            Arc::new(poller),
            self.client_id,
            trigger.clone(),
            Backoff::from_config(&self.config.retry),
        );
        let listen_shutdown = self.shutdown.clone();
        let listen_task = tokio::spawn(async move { listener.run(listen_shutdown).await });

        info!(
            root = %root.display(),
            poll_interval_secs = self.config.sync.poll_interval,
            "Sync services started"
        );
        let result = self.worker(trigger).run(self.shutdown.clone()).await;

        // Stop the other tasks whether the worker finished cleanly or not
        self.shutdown.cancel();
        for (name, task) in [("ingestor", ingest_task), ("listener", listen_task)] {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "Task ended abnormally");
            }
        }

        result.map_err(Into::into)
    }
}

fn log_report(report: &CycleReport) {
    info!(
        pushed = report.pushed,
        completed = report.completed,
        applied = report.applied,
        deferred = report.deferred,
        conflicts = report.conflicts,
        rejected = report.rejected,
        errors = report.errors.len(),
        more_pending = report.more_pending,
        "Sync finished"
    );
    for e in report.errors.iter() {
        warn!(error = %e, "Cycle error");
    }
}

/// Root the index should move to, if the configured root changed
fn relocation_target(indexed: &Path, configured: &Path) -> Option<PathBuf> {
    if indexed.as_os_str().is_empty() || indexed == configured {
        return None;
    }
    Some(configured.to_path_buf())
}

/// Expands a leading `~` to the home directory
fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

fn init_tracing(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

// ============================================================================
// Graceful shutdown
// ============================================================================

/// Waits for SIGTERM or SIGINT and triggers the cancellation token
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }

    token.cancel();
}

// ============================================================================
// Main entry point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let config = if config_path.exists() {
        Config::load(&config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?
    } else {
        Config::default()
    };

    init_tracing(&config);
    info!(config_path = %config_path.display(), "Cirrus daemon starting (cirrusd)");

    let shutdown_token = CancellationToken::new();
    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    let service = DaemonService::new(config, &config_path, shutdown_token.clone()).await?;

    let result = if args.once {
        service.sync_once().await.map(|_| ())
    } else {
        service.run().await
    };

    match &result {
        Ok(()) => info!("Cirrus daemon shut down gracefully"),
        Err(e) => error!(error = %e, "Cirrus daemon exiting with error"),
    }

    result
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use cirrus_core::config::ConfigBuilder;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_args_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["cirrusd", "--config", "/etc/cirrus.yaml", "--once"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/etc/cirrus.yaml")));
        assert!(args.once);

        let args = Args::try_parse_from(["cirrusd"]).unwrap();
        assert!(args.config.is_none());
        assert!(!args.once);
    }

    #[test]
    fn test_relocation_target() {
        let configured = Path::new("/home/user/Cirrus");
        assert_eq!(relocation_target(Path::new(""), configured), None);
        assert_eq!(relocation_target(configured, configured), None);
        assert_eq!(
            relocation_target(Path::new("/old/Cirrus"), configured),
            Some(configured.to_path_buf())
        );
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home(Path::new("/abs/path")), PathBuf::from("/abs/path"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/Cirrus")), home.join("Cirrus"));
        }
    }

    fn test_config(dir: &TempDir) -> Config {
        ConfigBuilder::new()
            .sync_root(dir.path().join("root"))
            .remote_base_url("http://127.0.0.1:1")
            .remote_user_id("tester")
            .sync_network_timeout(2)
            .retry_jitter(false)
            .database_path(dir.path().join("index.db"))
            .build()
    }

    #[tokio::test]
    async fn test_startup_persists_client_identity() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.yaml");

        let service = DaemonService::new(test_config(&dir), &config_path, CancellationToken::new())
            .await
            .unwrap();

        let saved = Config::load(&config_path).unwrap();
        assert_eq!(saved.remote.client_id, Some(service.client_id));
        assert!(dir.path().join("root").is_dir());

        // A second start keeps the identity
        let again = DaemonService::new(saved, &config_path, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.client_id, service.client_id);
    }

    #[tokio::test]
    async fn test_sync_once_reports_unreachable_server() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.yaml");
        let service = DaemonService::new(test_config(&dir), &config_path, CancellationToken::new())
            .await
            .unwrap();

        let report = service.sync_once().await.unwrap();

        assert!(report.ran);
        assert!(!report.errors.is_empty());
        assert!(report.sync_id.is_none());
    }

    #[tokio::test]
    async fn test_invalid_config_is_refused() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.remote.base_url = "ftp://example.com".into();

        let result =
            DaemonService::new(config, &dir.path().join("config.yaml"), CancellationToken::new()).await;

        assert!(result.is_err());
    }
}
