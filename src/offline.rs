//! Process-wide offline state with listener fan-out.
//!
//! `has_remote_access` says whether an app-level backend is usable;
//! `is_online` mirrors the host network signal. Turning remote access off
//! also turns `is_online` off, and turning it on turns `is_online` on. The
//! network signal alone never changes remote access.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineState {
    pub has_remote_access: bool,
    pub is_online: bool,
}

impl Default for OfflineState {
    fn default() -> Self {
        Self {
            has_remote_access: false,
            is_online: true,
        }
    }
}

/// Called with `(previous, current)` after every change.
pub type Listener = Arc<dyn Fn(OfflineState, OfflineState) + Send + Sync>;

pub struct OfflineSignal {
    state: watch::Sender<OfflineState>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
}

/// Handle returned by [`OfflineSignal::subscribe`].
pub struct Subscription {
    signal: Weak<OfflineSignal>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(signal) = self.signal.upgrade() {
            if let Ok(mut listeners) = signal.listeners.lock() {
                listeners.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

impl OfflineSignal {
    pub fn new() -> Self {
        let (state, _) = watch::channel(OfflineState::default());
        Self {
            state,
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    pub fn state(&self) -> OfflineState {
        *self.state.borrow()
    }

    pub fn get_remote_access(&self) -> bool {
        self.state().has_remote_access
    }

    pub fn get_online(&self) -> bool {
        self.state().is_online
    }

    /// Async view of the state for tasks that want to await changes.
    pub fn watch(&self) -> watch::Receiver<OfflineState> {
        self.state.subscribe()
    }

    pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn(OfflineState, OfflineState) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push((id, Arc::new(listener)));
        }
        Subscription {
            signal: Arc::downgrade(self),
            id,
        }
    }

    pub fn set_remote_access(&self, has_remote_access: bool) {
        self.update(|s| {
            s.has_remote_access = has_remote_access;
            s.is_online = has_remote_access;
        });
    }

    /// Mirror the host network signal. Returns the previous value.
    pub fn set_online(&self, is_online: bool) -> bool {
        let previous = self.get_online();
        self.update(|s| s.is_online = is_online);
        previous
    }

    /// Classify a failed backend call and demote remote access when it is a
    /// connectivity problem. Validation and other errors leave state alone.
    pub fn report_error(&self, err: &StoreError) -> ErrorClass {
        let class = classify_error(err);
        self.report_class(class, &err.to_string());
        class
    }

    /// Same as [`report_error`](Self::report_error) for a failure that was
    /// classified when it happened.
    pub fn report_class(&self, class: ErrorClass, detail: &str) {
        if class == ErrorClass::Connectivity && self.get_remote_access() {
            warn!(error = detail, "Connectivity error, demoting to local-only mode");
            self.set_remote_access(false);
        }
    }

    fn update(&self, apply: impl FnOnce(&mut OfflineState)) {
        let mut previous = None;
        self.state.send_if_modified(|s| {
            let before = *s;
            apply(s);
            if *s != before {
                previous = Some(before);
                true
            } else {
                false
            }
        });
        let Some(previous) = previous else {
            return;
        };
        let current = self.state();
        debug!(
            has_remote_access = current.has_remote_access,
            is_online = current.is_online,
            "Offline state changed"
        );

        // Listeners run outside the lock so they may call back into the signal.
        let listeners: Vec<Listener> = match self.listeners.lock() {
            Ok(guard) => guard.iter().map(|(_, l)| Arc::clone(l)).collect(),
            Err(_) => return,
        };
        for listener in listeners {
            listener(previous, current);
        }
    }
}

impl Default for OfflineSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network failure, timeout or permission denied.
    Connectivity,
    /// Bad data; the backend itself is fine.
    Validation,
    Other,
}

pub fn classify_error(err: &StoreError) -> ErrorClass {
    match err {
        StoreError::Connectivity { .. } => ErrorClass::Connectivity,
        StoreError::Validation(_) => ErrorClass::Validation,
        StoreError::FatalLocal(_) => ErrorClass::Other,
        StoreError::Backend { message, .. } => classify_message(message),
    }
}

fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    if lower.contains("duplicate key")
        || lower.contains("violates")
        || lower.contains("invalid argument")
        || lower.contains("already exists")
    {
        return ErrorClass::Validation;
    }
    if lower.contains("network error")
        || lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("permission denied")
        || lower.contains("permission_denied")
        || lower.contains("unauthenticated")
    {
        return ErrorClass::Connectivity;
    }
    ErrorClass::Other
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BackendKind;

    #[test]
    fn test_remote_access_drives_online_flag() {
        let signal = OfflineSignal::new();
        assert_eq!(signal.state(), OfflineState::default());

        signal.set_remote_access(true);
        assert!(signal.get_remote_access());
        assert!(signal.get_online());

        signal.set_remote_access(false);
        assert!(!signal.get_online());
    }

    #[test]
    fn test_network_signal_does_not_touch_remote_access() {
        let signal = OfflineSignal::new();
        signal.set_remote_access(true);
        assert!(signal.set_online(false));
        assert!(signal.get_remote_access());
        assert!(!signal.get_online());
        assert!(!signal.set_online(true));
    }

    #[test]
    fn test_listeners_fire_on_change_only_and_unsubscribe() {
        let signal = Arc::new(OfflineSignal::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = signal.subscribe(move |before, after| {
            sink.lock().unwrap().push((before.has_remote_access, after.has_remote_access));
        });

        signal.set_remote_access(true);
        signal.set_remote_access(true);
        signal.set_remote_access(false);
        assert_eq!(*seen.lock().unwrap(), vec![(false, true), (true, false)]);

        sub.unsubscribe();
        signal.set_remote_access(true);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_listener_may_read_signal() {
        let signal = Arc::new(OfflineSignal::new());
        let inner = Arc::clone(&signal);
        let observed = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&observed);
        let _sub = signal.subscribe(move |_, _| {
            *slot.lock().unwrap() = Some(inner.get_remote_access());
        });
        signal.set_remote_access(true);
        assert_eq!(*observed.lock().unwrap(), Some(true));
    }

    #[tokio::test]
    async fn test_watch_receiver_sees_changes() {
        let signal = OfflineSignal::new();
        let mut rx = signal.watch();
        signal.set_online(false);
        rx.changed().await.unwrap();
        assert!(!rx.borrow().is_online);
    }

    #[test]
    fn test_validation_error_does_not_demote() {
        let signal = OfflineSignal::new();
        signal.set_remote_access(true);

        let class = signal.report_error(&StoreError::validation("duplicate key"));
        assert_eq!(class, ErrorClass::Validation);
        assert!(signal.get_remote_access());

        let class = signal.report_error(&StoreError::connectivity(BackendKind::Firebase, "permission denied"));
        assert_eq!(class, ErrorClass::Connectivity);
        assert!(!signal.get_remote_access());
    }

    #[test]
    fn test_backend_messages_are_classified() {
        let backend = |message: &str| StoreError::Backend {
            backend: BackendKind::Neon,
            status: Some(500),
            message: message.into(),
        };
        assert_eq!(
            classify_error(&backend("duplicate key value violates unique constraint")),
            ErrorClass::Validation
        );
        assert_eq!(classify_error(&backend("upstream request timed out")), ErrorClass::Connectivity);
        assert_eq!(classify_error(&backend("internal error")), ErrorClass::Other);
        assert_eq!(classify_error(&StoreError::fatal("disk full")), ErrorClass::Other);
    }

    #[test]
    fn test_reported_class_wins_over_message_text() {
        let signal = OfflineSignal::new();
        signal.set_remote_access(true);
        signal.report_class(ErrorClass::Validation, "validation failed: network timeout field");
        assert!(signal.get_remote_access());
        signal.report_class(ErrorClass::Connectivity, "neon unreachable: connection refused");
        assert!(!signal.get_remote_access());
    }
}
