//! Backend credentials in the OS credential store.
//!
//! On Windows this uses the Credential Manager (via the `keyring` crate), on
//! macOS Keychain, and on Linux the kernel keyutils store. Values are looked
//! up by the same snake_case keys `config` uses.

use keyring::Entry;
use serde_json::Value;
use tracing::{info, warn};

use crate::backends::http::normalize_base_url;
use crate::config::{
    KEY_FIREBASE_API_KEY, KEY_FIREBASE_ENDPOINT, KEY_FIREBASE_PROJECT_ID, KEY_NEON_API_KEY,
    KEY_NEON_API_URL, KEY_PRIORITY, KEY_SUPABASE_ANON_KEY, KEY_SUPABASE_URL,
};
use crate::model::parse_priority;

const SERVICE_NAME: &str = "charnoks-pos";

/// All credential keys managed by this module, with their camelCase aliases.
const CREDENTIAL_KEYS: &[(&str, &str)] = &[
    (KEY_SUPABASE_URL, "supabaseUrl"),
    (KEY_SUPABASE_ANON_KEY, "supabaseAnonKey"),
    (KEY_FIREBASE_PROJECT_ID, "firebaseProjectId"),
    (KEY_FIREBASE_API_KEY, "firebaseApiKey"),
    (KEY_FIREBASE_ENDPOINT, "firebaseEndpoint"),
    (KEY_NEON_API_URL, "neonApiUrl"),
    (KEY_NEON_API_KEY, "neonApiKey"),
    (KEY_PRIORITY, "backendPriority"),
];

const URL_KEYS: &[&str] = &[KEY_SUPABASE_URL, KEY_NEON_API_URL, KEY_FIREBASE_ENDPOINT];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())?;
    Ok(())
}

/// Delete a credential. Silently succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// Pull backend credentials out of a JSON payload, accepting camelCase or
/// snake_case keys. URLs are normalised and the priority list validated.
///
/// ```json
/// { "supabaseUrl": "...", "supabaseAnonKey": "...", "neonApiUrl": "...", "backendPriority": "neon,local" }
/// ```
pub fn collect_backend_credentials(payload: &Value) -> Result<Vec<(&'static str, String)>, String> {
    let mut out = Vec::new();
    for &(key, camel) in CREDENTIAL_KEYS {
        let Some(raw) = payload
            .get(camel)
            .or_else(|| payload.get(key))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
        else {
            continue;
        };
        let value = if URL_KEYS.contains(&key) {
            normalize_base_url(raw)
        } else if key == KEY_PRIORITY {
            parse_priority(raw)?
                .iter()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(",")
        } else {
            raw.to_string()
        };
        out.push((key, value));
    }
    if out.is_empty() {
        return Err("No backend credentials in payload".to_string());
    }
    Ok(out)
}

/// Store backend credentials received from setup.
pub fn store_backend_credentials(payload: &Value) -> Result<Value, String> {
    let credentials = collect_backend_credentials(payload)?;
    for (key, value) in &credentials {
        set_credential(key, value)?;
    }
    let stored: Vec<&str> = credentials.iter().map(|(k, _)| *k).collect();
    info!(keys = ?stored, "backend credentials updated");
    Ok(serde_json::json!({ "success": true, "stored": stored }))
}

/// Delete every stored backend credential (factory reset).
pub fn factory_reset() -> Result<Value, String> {
    info!("performing factory reset, deleting all backend credentials");
    for (key, _) in CREDENTIAL_KEYS {
        delete_credential(key)?;
    }
    Ok(serde_json::json!({ "success": true }))
}
