//! Runtime configuration.
//!
//! Every setting is looked up by a snake_case key. Precedence:
//! `CHARNOKS_<KEY>` environment variable, then the OS credential store,
//! then `local_settings` (category `backend`). Bad values are logged and
//! replaced by defaults rather than failing startup.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::db::{self, DbState};
use crate::model::{parse_priority, BackendKind};
use crate::probe::DEFAULT_PROBE_TIMEOUT;
use crate::selector::ProbePolicy;

pub const ENV_PREFIX: &str = "CHARNOKS_";

/// `local_settings` category for backend configuration.
pub const SETTINGS_CATEGORY: &str = "backend";

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(15);

// Lookup keys
pub const KEY_DATA_DIR: &str = "data_dir";
pub const KEY_PRIORITY: &str = "backend_priority";
pub const KEY_PROBE_TIMEOUT_MS: &str = "probe_timeout_ms";
pub const KEY_SESSION_TTL_SECS: &str = "session_ttl_secs";
pub const KEY_MONITOR_INTERVAL_SECS: &str = "monitor_interval_secs";
pub const KEY_NETWORK_CHECK_URL: &str = "network_check_url";
pub const KEY_SUPABASE_URL: &str = "supabase_url";
pub const KEY_SUPABASE_ANON_KEY: &str = "supabase_anon_key";
pub const KEY_FIREBASE_PROJECT_ID: &str = "firebase_project_id";
pub const KEY_FIREBASE_API_KEY: &str = "firebase_api_key";
pub const KEY_FIREBASE_ENDPOINT: &str = "firebase_endpoint";
pub const KEY_NEON_API_URL: &str = "neon_api_url";
pub const KEY_NEON_API_KEY: &str = "neon_api_key";

#[derive(Debug, Clone, PartialEq)]
pub struct SupabaseConfig {
    pub url: String,
    pub anon_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FirebaseConfig {
    pub project_id: String,
    pub api_key: String,
    /// Override for the Firestore REST root (emulator or test server).
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NeonConfig {
    pub api_url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub priority: Vec<BackendKind>,
    pub probe_timeout: Duration,
    pub probe_timeouts: HashMap<BackendKind, Duration>,
    pub session_ttl: Duration,
    pub monitor_interval: Duration,
    /// URL polled by the network monitor; defaults to the first configured
    /// remote backend's base URL.
    pub network_check_url: Option<String>,
    pub sync_disabled: HashSet<BackendKind>,
    pub supabase: Option<SupabaseConfig>,
    pub firebase: Option<FirebaseConfig>,
    pub neon: Option<NeonConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            priority: BackendKind::DEFAULT_PRIORITY.to_vec(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            probe_timeouts: HashMap::new(),
            session_ttl: DEFAULT_SESSION_TTL,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            network_check_url: None,
            sync_disabled: HashSet::new(),
            supabase: None,
            firebase: None,
            neon: None,
        }
    }
}

impl AppConfig {
    /// Build a config from a key lookup. Missing keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();

        if let Some(dir) = get(KEY_DATA_DIR) {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(raw) = get(KEY_PRIORITY) {
            match parse_priority(&raw) {
                Ok(order) => config.priority = order,
                Err(e) => warn!(value = %raw, "Ignoring backend priority: {e}"),
            }
        }
        if let Some(ms) = parse_u64(KEY_PROBE_TIMEOUT_MS, get(KEY_PROBE_TIMEOUT_MS)) {
            config.probe_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_u64(KEY_SESSION_TTL_SECS, get(KEY_SESSION_TTL_SECS)) {
            config.session_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(KEY_MONITOR_INTERVAL_SECS, get(KEY_MONITOR_INTERVAL_SECS)) {
            config.monitor_interval = Duration::from_secs(secs.max(1));
        }
        config.network_check_url = get(KEY_NETWORK_CHECK_URL);

        for kind in BackendKind::DEFAULT_PRIORITY {
            let key = format!("{kind}_probe_timeout_ms");
            if let Some(ms) = parse_u64(&key, get(&key)) {
                config.probe_timeouts.insert(kind, Duration::from_millis(ms));
            }
            let key = format!("{kind}_sync_enabled");
            if let Some(raw) = get(&key) {
                match parse_flag(&raw) {
                    Some(false) => {
                        config.sync_disabled.insert(kind);
                    }
                    Some(true) => {}
                    None => warn!(key = %key, value = %raw, "Ignoring non-boolean sync flag"),
                }
            }
        }

        config.supabase = match (get(KEY_SUPABASE_URL), get(KEY_SUPABASE_ANON_KEY)) {
            (Some(url), Some(anon_key)) => Some(SupabaseConfig { url, anon_key }),
            _ => None,
        };
        config.firebase = match (get(KEY_FIREBASE_PROJECT_ID), get(KEY_FIREBASE_API_KEY)) {
            (Some(project_id), Some(api_key)) => Some(FirebaseConfig {
                project_id,
                api_key,
                endpoint: get(KEY_FIREBASE_ENDPOINT),
            }),
            _ => None,
        };
        config.neon = get(KEY_NEON_API_URL).map(|api_url| NeonConfig {
            api_url,
            api_key: get(KEY_NEON_API_KEY),
        });
        config
    }

    /// Load from env, the OS credential store and the settings table.
    /// The data directory is the one `db` was opened in.
    pub fn load(db: &DbState) -> Self {
        Self::load_with(db, crate::storage::get_credential)
    }

    pub fn load_with(db: &DbState, credential: impl Fn(&str) -> Option<String>) -> Self {
        let conn = db.conn.lock().ok();
        let mut config = Self::from_lookup(|key| {
            env_value(key)
                .or_else(|| credential(key))
                .or_else(|| {
                    conn.as_ref()
                        .and_then(|c| db::get_setting(c, SETTINGS_CATEGORY, key).ok().flatten())
                })
        });
        if let Some(dir) = db.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            config.data_dir = dir.to_path_buf();
        }
        config
    }

    /// Sync is on for every remote backend unless switched off.
    pub fn is_sync_enabled(&self, kind: BackendKind) -> bool {
        kind.is_remote() && !self.sync_disabled.contains(&kind)
    }

    pub fn probe_policy(&self) -> ProbePolicy {
        ProbePolicy {
            default_timeout: self.probe_timeout,
            overrides: self.probe_timeouts.clone(),
        }
    }

    /// Non-secret summary for diagnostics.
    pub fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "dataDir": self.data_dir.to_string_lossy(),
            "priority": self.priority,
            "probeTimeoutMs": self.probe_timeout.as_millis() as u64,
            "sessionTtlSecs": self.session_ttl.as_secs(),
            "monitorIntervalSecs": self.monitor_interval.as_secs(),
            "syncDisabled": self.sync_disabled.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
            "supabase": self.supabase.as_ref().map(|s| serde_json::json!({ "url": s.url })),
            "firebase": self.firebase.as_ref().map(|f| serde_json::json!({
                "projectId": f.project_id,
                "endpoint": f.endpoint,
            })),
            "neon": self.neon.as_ref().map(|n| serde_json::json!({
                "url": n.api_url,
                "authenticated": n.api_key.is_some(),
            })),
        })
    }

    /// URL the network monitor polls.
    pub fn network_check_target(&self) -> Option<String> {
        self.network_check_url
            .clone()
            .or_else(|| self.supabase.as_ref().map(|s| s.url.clone()))
            .or_else(|| self.neon.as_ref().map(|n| format!("{}/health", n.api_url.trim_end_matches('/'))))
            .or_else(|| {
                self.firebase
                    .as_ref()
                    .map(|_| "https://firestore.googleapis.com".to_string())
            })
    }
}

/// Read `CHARNOKS_<KEY>` from the process environment.
pub fn env_value(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{}", key.to_ascii_uppercase()))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

/// Data directory to open the database in before any other setting is known.
pub fn default_data_dir() -> PathBuf {
    env_value(KEY_DATA_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(crate::diagnostics::app_data_dir)
}

fn parse_u64(key: &str, raw: Option<String>) -> Option<u64> {
    let raw = raw?;
    match raw.parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring non-numeric setting");
            None
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
