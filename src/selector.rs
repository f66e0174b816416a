//! Backend selection: probe candidates in priority order, activate the first
//! reachable one and persist the choice for the session.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::backends::BackendRegistry;
use crate::error::StoreError;
use crate::local_store::LocalStore;
use crate::model::BackendKind;
use crate::offline::{ErrorClass, OfflineSignal};
use crate::probe::{probe_backend, ConnectivityResult, DEFAULT_PROBE_TIMEOUT};

/// Probe deadline per backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbePolicy {
    pub default_timeout: Duration,
    pub overrides: HashMap<BackendKind, Duration>,
}

impl ProbePolicy {
    pub fn timeout_for(&self, kind: BackendKind) -> Duration {
        self.overrides
            .get(&kind)
            .copied()
            .unwrap_or(self.default_timeout)
    }
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_PROBE_TIMEOUT,
            overrides: HashMap::new(),
        }
    }
}

pub struct BackendSelector {
    registry: Arc<BackendRegistry>,
    local: Arc<LocalStore>,
    offline: Arc<OfflineSignal>,
    priority: Vec<BackendKind>,
    policy: ProbePolicy,
    session_ttl: Duration,
    active: RwLock<Option<BackendKind>>,
    last_results: Mutex<Vec<ConnectivityResult>>,
    // serialises concurrent initialize() calls
    init_lock: tokio::sync::Mutex<()>,
}

impl BackendSelector {
    pub fn new(
        registry: Arc<BackendRegistry>,
        local: Arc<LocalStore>,
        offline: Arc<OfflineSignal>,
        priority: Vec<BackendKind>,
        policy: ProbePolicy,
        session_ttl: Duration,
    ) -> Self {
        Self {
            registry,
            local,
            offline,
            priority,
            policy,
            session_ttl,
            active: RwLock::new(None),
            last_results: Mutex::new(Vec::new()),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn priority(&self) -> &[BackendKind] {
        &self.priority
    }

    /// Currently selected backend; `local` until a selection is made.
    pub fn active_backend(&self) -> BackendKind {
        self.active
            .read()
            .ok()
            .and_then(|a| *a)
            .unwrap_or(BackendKind::Local)
    }

    pub fn is_initialized(&self) -> bool {
        self.active.read().map(|a| a.is_some()).unwrap_or(false)
    }

    /// Probe `priority` in order and activate the first reachable backend.
    /// Stops at the first success; lands on `local` when nothing answers.
    /// Never fails.
    pub async fn initialize(&self, priority: &[BackendKind]) -> BackendKind {
        let _guard = self.init_lock.lock().await;

        let mut results = Vec::new();
        let mut chosen = BackendKind::Local;
        for &kind in priority {
            if kind == BackendKind::Local {
                break;
            }
            let Some(adapter) = self.registry.get(kind) else {
                results.push(ConnectivityResult::unreachable(kind, "not configured"));
                continue;
            };
            let result = probe_backend(adapter.as_ref(), self.policy.timeout_for(kind)).await;
            let reachable = result.reachable;
            if !reachable {
                warn!(
                    backend = %kind,
                    latency_ms = result.latency_ms,
                    error = result.error.as_deref().unwrap_or(""),
                    "Backend unreachable"
                );
            }
            results.push(result);
            if reachable {
                chosen = kind;
                break;
            }
        }

        if let Ok(mut last) = self.last_results.lock() {
            *last = results;
        }
        self.activate(chosen);
        chosen
    }

    /// Reuse a persisted selection from this session if there is one,
    /// otherwise probe with the configured priority.
    pub async fn ensure_initialized(&self) -> BackendKind {
        if self.is_initialized() {
            return self.active_backend();
        }
        if let Some(kind) = self.restore_session() {
            return kind;
        }
        let priority = self.priority.clone();
        self.initialize(&priority).await
    }

    /// Activate the persisted backend if it was selected less than the
    /// session TTL ago and is still configured.
    pub fn restore_session(&self) -> Option<BackendKind> {
        let record = match self.local.load_active_backend() {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable backend session");
                return None;
            }
        };
        let age = Utc::now().signed_duration_since(record.selected_at);
        let fresh = age
            .to_std()
            .map(|age| age < self.session_ttl)
            .unwrap_or(false);
        if !fresh || !self.registry.is_configured(record.backend) {
            return None;
        }
        info!(backend = %record.backend, age_secs = age.num_seconds(), "Restored backend session");
        self.apply(record.backend, record.selected_at);
        Some(record.backend)
    }

    /// Route a failed backend call through error classification; only
    /// connectivity errors demote remote access.
    pub fn report_failure(&self, err: &StoreError) -> ErrorClass {
        self.offline.report_error(err)
    }

    pub fn report_classified(&self, class: ErrorClass, detail: &str) {
        self.offline.report_class(class, detail)
    }

    /// Mirror the host network signal. Returns the previous value.
    pub fn set_network_online(&self, online: bool) -> bool {
        self.offline.set_online(online)
    }

    pub fn last_probe_results(&self) -> Vec<ConnectivityResult> {
        self.last_results
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn activate(&self, kind: BackendKind) {
        self.apply(kind, Utc::now());
    }

    fn apply(&self, kind: BackendKind, selected_at: chrono::DateTime<Utc>) {
        let previous = match self.active.write() {
            Ok(mut active) => active.replace(kind),
            Err(_) => None,
        };

        if kind == BackendKind::Local {
            self.offline.set_remote_access(false);
            if previous != Some(BackendKind::Local) {
                if let Err(e) = self.local.reset_demo_data() {
                    error!(error = %e, "Demo reset failed");
                }
            }
        } else {
            self.offline.set_remote_access(true);
            if let Err(e) = self.local.set_demo_mode(false) {
                warn!(error = %e, "Failed to clear demo mode");
            }
        }

        if let Err(e) = self.local.save_active_backend(kind, selected_at) {
            warn!(error = %e, "Failed to persist active backend");
        }
        info!(backend = %kind, previous = ?previous, "Active backend selected");
    }
}
