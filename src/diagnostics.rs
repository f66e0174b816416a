//! Diagnostics for the POS storage layer.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **System health**: active backend, offline flags, sync backlog, last
//!   probe results, schema version
//! - **Log rotation helpers**: used by `lib.rs` to configure rolling log files.

use rusqlite::params;
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use tracing::warn;

use crate::PosRuntime;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

const APP_DIR_NAME: &str = "com.charnoks.pos";

const RECENT_ERROR_LIMIT: i64 = 20;

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

/// Returns version, build timestamp, git SHA, and platform info.
pub fn get_about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    })
}

// ---------------------------------------------------------------------------
// System health
// ---------------------------------------------------------------------------

/// Snapshot of the storage layer for the status screen and `status` command.
/// Credentials never appear here; the config section is redacted anyway.
pub fn get_system_health(runtime: &PosRuntime) -> Result<Value, String> {
    let (schema_version, sync_backlog, recent_errors, db_size) = {
        let conn = runtime.db.conn.lock().map_err(|e| e.to_string())?;
        (
            crate::db::schema_version(&conn),
            get_sync_backlog(&conn),
            get_recent_sync_errors(&conn, RECENT_ERROR_LIMIT),
            fs::metadata(&runtime.db.db_path).map(|m| m.len()).unwrap_or(0),
        )
    }; // lock released here

    let demo_mode = runtime.local.is_demo_mode().map_err(|e| e.to_string())?;
    let registry = runtime.selector.registry();

    Ok(json!({
        "activeBackend": runtime.selector.active_backend(),
        "initialized": runtime.selector.is_initialized(),
        "configuredRemotes": registry.configured_remotes(),
        "priority": runtime.selector.priority(),
        "offline": runtime.offline.state(),
        "demoMode": demo_mode,
        "replaying": runtime.queue.is_replaying(),
        "lastProbeResults": runtime.selector.last_probe_results(),
        "syncBacklog": sync_backlog,
        "recentSyncErrors": recent_errors,
        "schemaVersion": schema_version,
        "dbSizeBytes": db_size,
        "config": redact_sensitive_fields(runtime.config.describe()),
    }))
}

fn get_sync_backlog(conn: &rusqlite::Connection) -> Value {
    let mut result = serde_json::Map::new();
    let mut total = 0i64;
    if let Ok(mut stmt) = conn.prepare(
        "SELECT data_type, COUNT(*), SUM(CASE WHEN attempts > 0 THEN 1 ELSE 0 END)
         FROM sync_queue GROUP BY data_type",
    ) {
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .ok();
        if let Some(rows) = rows {
            for (data_type, count, retried) in rows.flatten() {
                total += count;
                result.insert(data_type, json!({ "pending": count, "retried": retried }));
            }
        }
    }
    result.insert("total".to_string(), json!(total));
    let dead_lettered: i64 = conn
        .query_row("SELECT COUNT(*) FROM sync_dead_letter", [], |row| row.get(0))
        .unwrap_or(0);
    result.insert("deadLettered".to_string(), json!(dead_lettered));
    Value::Object(result)
}

fn get_recent_sync_errors(conn: &rusqlite::Connection, limit: i64) -> Vec<Value> {
    let mut errors = Vec::new();
    if let Ok(mut stmt) = conn.prepare(
        "SELECT id, data_type, local_id, attempts, last_error, enqueued_at_ms
         FROM sync_queue
         WHERE last_error IS NOT NULL AND last_error != ''
         ORDER BY id LIMIT ?1",
    ) {
        if let Ok(rows) = stmt.query_map(params![limit], |row| {
            Ok(json!({
                "id": row.get::<_, i64>(0)?,
                "dataType": row.get::<_, String>(1)?,
                "localId": row.get::<_, Option<String>>(2)?,
                "attempts": row.get::<_, i64>(3)?,
                "lastError": row.get::<_, String>(4)?,
                "enqueuedAtMs": row.get::<_, i64>(5)?,
            }))
        }) {
            errors.extend(rows.flatten());
        }
    }
    errors
}

pub fn redact_sensitive_fields(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut redacted = serde_json::Map::new();
            for (key, value) in map {
                if should_redact_key(&key) && !value.is_null() {
                    redacted.insert(key, Value::String("[REDACTED]".to_string()));
                } else {
                    redacted.insert(key, redact_sensitive_fields(value));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(redact_sensitive_fields).collect())
        }
        other => other,
    }
}

fn should_redact_key(key: &str) -> bool {
    let normalized = key.to_ascii_lowercase();
    let sensitive_markers = [
        "api_key",
        "apikey",
        "anon_key",
        "anonkey",
        "secret",
        "password",
        "token",
        "authorization",
    ];
    sensitive_markers
        .iter()
        .any(|marker| normalized.contains(marker))
}

// ---------------------------------------------------------------------------
// Paths and log rotation
// ---------------------------------------------------------------------------

/// Per-user application directory; holds the database and the logs.
pub fn app_data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join(APP_DIR_NAME)
}

/// Returns the log directory path (same location used by lib.rs).
pub fn get_log_dir() -> PathBuf {
    app_data_dir().join("logs")
}

/// Prune old log files, keeping only the most recent `MAX_LOG_FILES`.
pub fn prune_old_logs() {
    prune_logs_in(&get_log_dir(), MAX_LOG_FILES);
}

fn prune_logs_in(log_dir: &std::path::Path, keep: usize) {
    if !log_dir.exists() {
        return;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with("pos."));
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Sort newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.iter().skip(keep) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::fake::FakeBackend;
    use crate::backends::BackendRegistry;
    use crate::config::AppConfig;
    use crate::local_store::LocalStore;
    use crate::model::{BackendKind, NewProduct};
    use crate::sync_queue::SyncQueueEntry;
    use std::sync::Arc;

    #[test]
    fn test_about_info_has_required_fields() {
        let info = get_about_info();
        assert!(info.get("version").is_some());
        assert!(info.get("buildTimestamp").is_some());
        assert!(info.get("gitSha").is_some());
        assert!(info.get("platform").is_some());
        assert!(info.get("arch").is_some());
    }

    #[test]
    fn test_log_dir_is_stable() {
        let d1 = get_log_dir();
        let d2 = get_log_dir();
        assert_eq!(d1, d2);
        assert!(d1.starts_with(app_data_dir()));
        assert!(d1.to_string_lossy().contains(APP_DIR_NAME));
    }

    #[test]
    fn test_prune_keeps_newest_pos_logs_only() {
        let dir = std::env::temp_dir().join(format!("diag_logs_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        for day in 1..=4 {
            fs::write(dir.join(format!("pos.2026-10-0{day}")), "x").unwrap();
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        fs::write(dir.join("other.log"), "x").unwrap();

        prune_logs_in(&dir, 2);

        let mut left: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        left.sort();
        assert_eq!(left, vec!["other.log", "pos.2026-10-03", "pos.2026-10-04"]);
        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_system_health_reports_backend_and_backlog() {
        let db = Arc::new(crate::db::open_in_memory().unwrap());
        let local = Arc::new(LocalStore::new(Arc::clone(&db)));
        let mut registry = BackendRegistry::new(Arc::clone(&local));
        registry.register(Arc::new(FakeBackend::unreachable(BackendKind::Neon)), true);

        let mut config = AppConfig::default();
        config.priority = vec![BackendKind::Neon, BackendKind::Local];
        let runtime = PosRuntime::with_registry(config, db, registry).unwrap();
        runtime.start().await;

        let entry = SyncQueueEntry::product(&NewProduct::new("Soda", 1.5, 3, "drinks"), Some("local-1")).unwrap();
        runtime.queue.enqueue(&entry).unwrap();

        let health = get_system_health(&runtime).unwrap();
        assert_eq!(health["activeBackend"], json!("local"));
        assert_eq!(health["offline"]["hasRemoteAccess"], json!(false));
        assert_eq!(health["syncBacklog"]["products"]["pending"], json!(1));
        assert_eq!(health["syncBacklog"]["total"], json!(1));
        assert_eq!(health["syncBacklog"]["deadLettered"], json!(0));
        assert_eq!(health["lastProbeResults"][0]["backend"], json!("neon"));
        assert_eq!(health["lastProbeResults"][0]["reachable"], json!(false));
        assert!(health["schemaVersion"].as_i64().unwrap() >= 2);
    }

    #[test]
    fn test_should_redact_key_matches_sensitive_markers() {
        assert!(should_redact_key("api_key"));
        assert!(should_redact_key("supabaseAnonKey"));
        assert!(should_redact_key("Authorization"));
        assert!(!should_redact_key("status"));
        assert!(!should_redact_key("supabase_url"));
    }

    #[test]
    fn test_redact_sensitive_fields_recurses_through_objects() {
        let value = json!({
            "token": "tk-val",
            "nested": {
                "api_key": "key-value",
                "status": "ok"
            },
            "items": [
                { "password": "1234" },
                { "name": "safe" }
            ],
            "neon_api_key": null
        });

        let redacted = redact_sensitive_fields(value);
        assert_eq!(redacted["token"], json!("[REDACTED]"));
        assert_eq!(redacted["nested"]["api_key"], json!("[REDACTED]"));
        assert_eq!(redacted["nested"]["status"], json!("ok"));
        assert_eq!(redacted["items"][0]["password"], json!("[REDACTED]"));
        assert_eq!(redacted["items"][1]["name"], json!("safe"));
        assert_eq!(redacted["neon_api_key"], Value::Null);
    }
}
