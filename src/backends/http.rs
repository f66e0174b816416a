//! Shared HTTP plumbing for the REST-based backends.
//!
//! Normalises base URLs, builds clients, and maps transport failures and
//! HTTP statuses onto the [`StoreError`] taxonomy so every adapter classifies
//! failures the same way.

use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::model::BackendKind;

/// Default timeout for data requests. Probes apply their own, shorter deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise a backend base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/api` segment
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

pub fn build_client(backend: BackendKind, timeout: Duration) -> StoreResult<Client> {
    Client::builder().timeout(timeout).build().map_err(|e| StoreError::Backend {
        backend,
        status: None,
        message: format!("Failed to create HTTP client: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Map a `reqwest::Error` raised before a response arrived.
pub fn transport_error(backend: BackendKind, url: &str, err: &reqwest::Error) -> StoreError {
    if err.is_connect() {
        return StoreError::connectivity(backend, format!("Cannot reach {url}"));
    }
    if err.is_timeout() {
        return StoreError::connectivity(backend, format!("Connection to {url} timed out"));
    }
    if err.is_builder() {
        return StoreError::Backend {
            backend,
            status: None,
            message: format!("Invalid URL: {url}"),
        };
    }
    if err.is_decode() || err.is_body() {
        return StoreError::Backend {
            backend,
            status: None,
            message: format!("Malformed response from {url}: {err}"),
        };
    }
    StoreError::connectivity(backend, format!("Network error communicating with {url}: {err}"))
}

/// Map a non-success HTTP status. Permission problems count as connectivity,
/// constraint violations as validation.
pub fn status_error(backend: BackendKind, status: StatusCode, detail: &str) -> StoreError {
    let code = status.as_u16();
    let detail = detail.trim();
    let with_detail = |base: &str| {
        if detail.is_empty() {
            base.to_string()
        } else {
            format!("{base}: {detail}")
        }
    };
    match code {
        401 | 403 => StoreError::connectivity(
            backend,
            with_detail(&format!("permission denied (HTTP {code})")),
        ),
        408 | 429 => StoreError::connectivity(
            backend,
            with_detail(&format!("backend unavailable (HTTP {code})")),
        ),
        400 | 409 | 422 => StoreError::Validation(with_detail(&format!(
            "{backend} rejected the record (HTTP {code})"
        ))),
        _ => StoreError::Backend {
            backend,
            status: Some(code),
            message: if detail.is_empty() {
                "unexpected response".to_string()
            } else {
                detail.to_string()
            },
        },
    }
}

/// Pull a human readable message out of an error body.
fn error_detail(body_text: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body_text) {
        let message = json
            .get("error")
            .and_then(|e| e.get("message").or(Some(e)))
            .or_else(|| json.get("message"))
            .or_else(|| json.get("msg"))
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(message) = message {
            return message;
        }
    }
    body_text.trim().to_string()
}

// ---------------------------------------------------------------------------
// Request execution
// ---------------------------------------------------------------------------

/// Send a prepared request and decode a JSON body. Empty bodies become `Null`.
pub async fn send_json(backend: BackendKind, url: &str, req: RequestBuilder) -> StoreResult<Value> {
    let resp = req
        .send()
        .await
        .map_err(|e| transport_error(backend, url, &e))?;
    let status = resp.status();
    let body_text = resp
        .text()
        .await
        .map_err(|e| transport_error(backend, url, &e))?;

    if !status.is_success() {
        debug!(%backend, status = status.as_u16(), "backend request failed");
        return Err(status_error(backend, status, &error_detail(&body_text)));
    }

    if body_text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body_text).map_err(|e| StoreError::Backend {
        backend,
        status: Some(status.as_u16()),
        message: format!("Invalid JSON from {url}: {e}"),
    })
}

/// Send a request where only the status matters.
pub async fn send_ok(backend: BackendKind, url: &str, req: RequestBuilder) -> StoreResult<()> {
    let resp = req
        .send()
        .await
        .map_err(|e| transport_error(backend, url, &e))?;
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body_text = resp.text().await.unwrap_or_default();
    Err(status_error(backend, status, &error_detail(&body_text)))
}

/// Decode a JSON value into `T`, reporting failures against `backend`.
pub fn decode<T: serde::de::DeserializeOwned>(backend: BackendKind, value: Value) -> StoreResult<T> {
    serde_json::from_value(value).map_err(|e| StoreError::Backend {
        backend,
        status: None,
        message: format!("Unexpected payload shape: {e}"),
    })
}
