//! Charnoks POS storage runtime.
//!
//! Picks a storage backend (Supabase, Firebase, Neon or the on-device
//! store), falls back to local storage whenever the remote side fails and
//! replays offline writes once a remote backend is reachable again.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod backends;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod facade;
pub mod local_store;
pub mod model;
pub mod monitor;
pub mod offline;
pub mod probe;
pub mod selector;
pub mod storage;
pub mod sync_queue;

use backends::BackendRegistry;
use config::AppConfig;
use db::DbState;
use error::StoreResult;
use facade::DataService;
use local_store::LocalStore;
use model::BackendKind;
use monitor::{HttpNetworkCheck, NetworkListener};
use offline::{OfflineSignal, Subscription};
use selector::BackendSelector;
use sync_queue::{ReplayReport, SyncQueue};

/// Everything the POS needs to read and write data, wired together.
pub struct PosRuntime {
    pub config: AppConfig,
    pub db: Arc<DbState>,
    pub local: Arc<LocalStore>,
    pub offline: Arc<OfflineSignal>,
    pub queue: Arc<SyncQueue>,
    pub selector: Arc<BackendSelector>,
    pub data: DataService,
    _demo_listener: Subscription,
}

impl PosRuntime {
    /// Build the runtime with adapters for every configured remote backend.
    pub fn new(config: AppConfig, db: Arc<DbState>) -> StoreResult<Self> {
        let local = Arc::new(LocalStore::new(Arc::clone(&db)));
        let registry = BackendRegistry::from_config(&config, Arc::clone(&local))?;
        Ok(Self::assemble(config, db, local, registry))
    }

    /// Build the runtime around a pre-populated registry. The registry's
    /// local adapter is replaced with the runtime's own store.
    pub fn with_registry(
        config: AppConfig,
        db: Arc<DbState>,
        mut registry: BackendRegistry,
    ) -> StoreResult<Self> {
        let local = Arc::new(LocalStore::new(Arc::clone(&db)));
        registry.register(local.clone(), false);
        Ok(Self::assemble(config, db, local, registry))
    }

    fn assemble(
        config: AppConfig,
        db: Arc<DbState>,
        local: Arc<LocalStore>,
        registry: BackendRegistry,
    ) -> Self {
        let offline = Arc::new(OfflineSignal::new());

        // Demo mode follows remote access: losing it (demotion or a local
        // selection) turns demo mode on, regaining it turns it off.
        let demo_local = Arc::clone(&local);
        let demo_listener = offline.subscribe(move |before, after| {
            if before.has_remote_access != after.has_remote_access {
                if let Err(e) = demo_local.set_demo_mode(!after.has_remote_access) {
                    warn!(error = %e, "Failed to update demo mode");
                }
            }
        });

        let selector = Arc::new(BackendSelector::new(
            Arc::new(registry),
            Arc::clone(&local),
            Arc::clone(&offline),
            config.priority.clone(),
            config.probe_policy(),
            config.session_ttl,
        ));
        let queue = Arc::new(SyncQueue::new(Arc::clone(&local)));
        let data = DataService::new(
            Arc::clone(&selector),
            Arc::clone(&local),
            Arc::clone(&offline),
            Arc::clone(&queue),
        );

        Self {
            config,
            db,
            local,
            offline,
            queue,
            selector,
            data,
            _demo_listener: demo_listener,
        }
    }

    /// Select a backend (reusing this session's choice when still fresh) and
    /// flush pending writes if a remote backend was picked.
    pub async fn start(&self) -> BackendKind {
        let kind = self.selector.ensure_initialized().await;
        if kind.is_remote() {
            if let Err(e) = self.sync_now().await {
                warn!(error = %e, "Startup sync failed");
            }
        }
        kind
    }

    /// React to a network check. Coming back online with remote access lost
    /// re-runs selection; with remote access available the queue is flushed.
    pub async fn handle_network_event(&self, online: bool) {
        self.selector.set_network_online(online);
        if !online {
            return;
        }

        let registry = self.selector.registry();
        if !self.offline.get_remote_access() && !registry.configured_remotes().is_empty() {
            let priority = self.selector.priority().to_vec();
            let kind = self.selector.initialize(&priority).await;
            if !kind.is_remote() {
                return;
            }
            info!(backend = %kind, "Remote backend available again");
        }

        match self.sync_now().await {
            Ok(report)
                if report.succeeded > 0 || report.dead_lettered > 0 || report.last_error.is_some() =>
            {
                info!(
                    succeeded = report.succeeded,
                    dead_lettered = report.dead_lettered,
                    remaining = report.remaining,
                    last_error = report.last_error.as_deref().unwrap_or(""),
                    "Sync queue replayed"
                );
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Sync queue replay failed"),
        }
    }

    /// Push offline writes to the active backend. Does nothing (and reports
    /// everything as remaining) unless a sync-enabled remote backend is
    /// active and reachable.
    pub async fn sync_now(&self) -> StoreResult<ReplayReport> {
        let active = self.selector.active_backend();
        let registry = self.selector.registry();
        let target = registry.get(active).filter(|_| {
            active.is_remote() && self.offline.get_remote_access() && registry.is_sync_enabled(active)
        });
        let Some(target) = target else {
            return Ok(ReplayReport {
                remaining: self.queue.len()?,
                ..ReplayReport::default()
            });
        };

        let reconciled = self.queue.reconcile_local_records()?;
        if reconciled > 0 {
            info!(count = reconciled, "Queued local-only records for sync");
        }
        let report = self.queue.replay(target.as_ref()).await?;
        if let (Some(class), Some(message)) = (report.error_class, report.last_error.as_deref()) {
            self.selector.report_classified(class, message);
        }
        Ok(report)
    }
}

#[async_trait]
impl NetworkListener for PosRuntime {
    async fn on_network_check(&self, online: bool) {
        self.handle_network_event(online).await;
    }
}

/// Open the database in the default data directory and build the runtime
/// from the resolved configuration.
pub fn open_default() -> StoreResult<PosRuntime> {
    let db = db::init(&config::default_data_dir())?;
    let config = AppConfig::load(&db);
    PosRuntime::new(config, Arc::new(db))
}

/// Structured logging to the console and a daily rolling file.
pub fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,charnoks_pos_lib=debug"));

    // Prune old log files before setting up the appender
    diagnostics::prune_old_logs();

    let log_dir = diagnostics::get_log_dir();
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, "pos");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // The guard flushes on drop; the process keeps logging until exit.
    std::mem::forget(_guard);
}

// ============================================================================
// App entry point
// ============================================================================

pub fn run() -> anyhow::Result<()> {
    init_logging();
    info!("Starting Charnoks POS v{}", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        let runtime = Arc::new(open_default()?);
        let active = runtime.start().await;
        info!(backend = %active, data_dir = %runtime.config.data_dir.display(), "Storage ready");

        let monitor = match runtime.config.network_check_target() {
            Some(url) => {
                let check = Arc::new(HttpNetworkCheck::new(&url)?);
                Some(monitor::start_network_monitor(
                    runtime.clone(),
                    check,
                    runtime.config.monitor_interval,
                    runtime.offline.get_online(),
                ))
            }
            None => {
                info!("No remote backend configured, network monitor not started");
                None
            }
        };

        tokio::signal::ctrl_c().await?;
        info!("Shutting down");
        if let Some(monitor) = monitor {
            monitor.shutdown().await;
        }
        Ok::<(), anyhow::Error>(())
    })
}
