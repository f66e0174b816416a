//! Single entry point for reading and writing products and transactions.
//!
//! Calls go to the active backend. A remote failure is logged, classified
//! (connectivity errors demote remote access) and the same operation is
//! re-run against the local store. A backend that rejects a write as invalid
//! (duplicate key, constraint violation) gets the error passed back instead,
//! so callers only see an error when the input is invalid or the local store
//! itself fails.
//!
//! Successful remote writes are cached locally and successful remote lists
//! refresh the local cache, so offline reads see the last remote state.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backends::BackendAdapter;
use crate::error::{StoreError, StoreResult};
use crate::local_store::LocalStore;
use crate::model::{
    BackendKind, NewProduct, NewTransaction, Product, SaleLine, Transaction, User,
};
use crate::offline::{ErrorClass, OfflineSignal};
use crate::selector::BackendSelector;
use crate::sync_queue::{SyncQueue, SyncQueueEntry};

/// Where a write ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WriteOrigin {
    Remote {
        backend: BackendKind,
    },
    /// Saved offline. `queued` says whether it will be replayed; `reason`
    /// carries the remote failure when there was one.
    Local {
        queued: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Saved<T> {
    pub value: T,
    pub origin: WriteOrigin,
}

impl<T> Saved<T> {
    pub fn saved_offline(&self) -> bool {
        matches!(self.origin, WriteOrigin::Local { .. })
    }
}

pub struct DataService {
    selector: Arc<BackendSelector>,
    local: Arc<LocalStore>,
    offline: Arc<OfflineSignal>,
    queue: Arc<SyncQueue>,
}

impl DataService {
    pub fn new(
        selector: Arc<BackendSelector>,
        local: Arc<LocalStore>,
        offline: Arc<OfflineSignal>,
        queue: Arc<SyncQueue>,
    ) -> Self {
        Self {
            selector,
            local,
            offline,
            queue,
        }
    }

    // -- products -----------------------------------------------------------

    pub async fn list_products(&self) -> StoreResult<Vec<Product>> {
        if let Some(remote) = self.remote_target() {
            match remote.list_products().await {
                Ok(products) => match self.local.replace_remote_products(&products) {
                    Ok(()) => return self.local.list_products(),
                    Err(e) => {
                        warn!(error = %e, "Failed to cache remote products");
                        return Ok(products);
                    }
                },
                Err(e) => self.note_fallback(remote.kind(), "list_products", &e)?,
            }
        }
        self.local.list_products()
    }

    pub async fn active_products(&self) -> StoreResult<Vec<Product>> {
        let mut products = self.list_products().await?;
        products.retain(|p| p.is_active);
        Ok(products)
    }

    pub async fn create_product(&self, input: &NewProduct) -> StoreResult<Saved<Product>> {
        input.validate()?;
        let active = self.selector.active_backend();
        let mut reason = None;

        if let Some(remote) = self.remote_target() {
            match remote.create_product(input).await {
                Ok(product) => {
                    if let Err(e) = self.local.upsert_product(&product) {
                        warn!(id = %product.id, error = %e, "Failed to cache remote product");
                    }
                    return Ok(Saved {
                        value: product,
                        origin: WriteOrigin::Remote { backend: active },
                    });
                }
                Err(e) => {
                    self.note_fallback(active, "create_product", &e)?;
                    reason = Some(e.to_string());
                }
            }
        } else if active.is_remote() {
            reason = Some("remote access unavailable".to_string());
        }

        let product = self.local.insert_product(input)?;
        let queued = self.should_queue(active)
            && self.enqueue(SyncQueueEntry::product(input, Some(&product.id)));
        info!(id = %product.id, queued, "Product saved offline");
        Ok(Saved {
            value: product,
            origin: WriteOrigin::Local { queued, reason },
        })
    }

    // -- transactions -------------------------------------------------------

    pub async fn list_transactions(&self) -> StoreResult<Vec<Transaction>> {
        if let Some(remote) = self.remote_target() {
            match remote.list_transactions().await {
                Ok(transactions) => match self.local.replace_remote_transactions(&transactions) {
                    Ok(()) => return self.local.list_transactions(),
                    Err(e) => {
                        warn!(error = %e, "Failed to cache remote transactions");
                        return Ok(transactions);
                    }
                },
                Err(e) => self.note_fallback(remote.kind(), "list_transactions", &e)?,
            }
        }
        self.local.list_transactions()
    }

    pub async fn create_transaction(&self, input: &NewTransaction) -> StoreResult<Saved<Transaction>> {
        input.validate()?;
        let active = self.selector.active_backend();
        let mut reason = None;

        if let Some(remote) = self.remote_target() {
            match remote.create_transaction(input).await {
                Ok(tx) => {
                    if let Err(e) = self.local.upsert_transaction(&tx) {
                        warn!(id = %tx.id, error = %e, "Failed to cache remote transaction");
                    }
                    return Ok(Saved {
                        value: tx,
                        origin: WriteOrigin::Remote { backend: active },
                    });
                }
                Err(e) => {
                    self.note_fallback(active, "create_transaction", &e)?;
                    reason = Some(e.to_string());
                }
            }
        } else if active.is_remote() {
            reason = Some("remote access unavailable".to_string());
        }

        let tx = self.local.insert_transaction(input)?;
        let queued = self.should_queue(active)
            && self.enqueue(SyncQueueEntry::transaction(input, Some(&tx.id)));
        info!(id = %tx.id, kind = tx.details.kind(), queued, "Transaction saved offline");
        Ok(Saved {
            value: tx,
            origin: WriteOrigin::Local { queued, reason },
        })
    }

    /// Build and record a completed sale. An insufficient payment is
    /// rejected before anything is written.
    pub async fn record_sale(
        &self,
        worker: &User,
        lines: Vec<SaleLine>,
        amount_paid: f64,
        payment_method: &str,
        voice_input: Option<&str>,
    ) -> StoreResult<Saved<Transaction>> {
        let mut sale = NewTransaction::sale(&worker.id, &worker.email, lines, amount_paid, payment_method)?;
        if let Some(transcript) = voice_input {
            sale = sale.with_voice_input(transcript);
        }
        self.create_transaction(&sale).await
    }

    pub async fn record_expense(
        &self,
        worker: &User,
        description: &str,
        amount: f64,
        category: &str,
        notes: Option<&str>,
    ) -> StoreResult<Saved<Transaction>> {
        let expense = NewTransaction::expense(&worker.id, &worker.email, description, amount, category, notes)?;
        self.create_transaction(&expense).await
    }

    // -- users --------------------------------------------------------------

    pub fn list_users(&self) -> StoreResult<Vec<User>> {
        self.local.list_users()
    }

    pub fn save_user(&self, user: &User) -> StoreResult<()> {
        self.local.save_user(user)
    }

    // -- routing ------------------------------------------------------------

    /// The remote adapter to try first, if any.
    fn remote_target(&self) -> Option<Arc<dyn BackendAdapter>> {
        let active = self.selector.active_backend();
        if !active.is_remote() {
            return None;
        }
        if !self.offline.get_remote_access() {
            debug!(backend = %active, "No remote access, using local store");
            return None;
        }
        self.selector.registry().get(active)
    }

    /// Classify a remote failure. Validation rejections come back as `Err`
    /// for the caller; everything else is logged and falls through to local.
    fn note_fallback(&self, backend: BackendKind, op: &str, err: &StoreError) -> StoreResult<()> {
        let class = self.selector.report_failure(err);
        if class == ErrorClass::Validation {
            warn!(backend = %backend, op, error = %err, "Backend rejected the write");
            return Err(StoreError::validation(validation_detail(err)));
        }
        warn!(
            backend = %backend,
            op,
            error = %err,
            class = ?class,
            "Remote call failed, falling back to local store"
        );
        Ok(())
    }

    fn should_queue(&self, active: BackendKind) -> bool {
        active.is_remote() && self.selector.registry().is_sync_enabled(active)
    }

    fn enqueue(&self, entry: StoreResult<SyncQueueEntry>) -> bool {
        match entry.and_then(|e| self.queue.enqueue(&e)) {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Failed to queue offline write, reconciliation will pick it up");
                false
            }
        }
    }
}

fn validation_detail(err: &StoreError) -> String {
    match err {
        StoreError::Validation(message) => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::fake::{CallLog, FailureKind, FakeBackend};
    use crate::backends::BackendRegistry;
    use crate::db;
    use crate::model::{TransactionDetails, UserRole, LOCAL_ID_PREFIX};
    use crate::selector::ProbePolicy;
    use std::time::Duration;

    struct Harness {
        local: Arc<LocalStore>,
        offline: Arc<OfflineSignal>,
        queue: Arc<SyncQueue>,
        selector: Arc<BackendSelector>,
        data: DataService,
    }

    fn harness(fakes: &[Arc<FakeBackend>], sync_enabled: bool) -> Harness {
        let local = Arc::new(LocalStore::new(Arc::new(db::open_in_memory().unwrap())));
        let offline = Arc::new(OfflineSignal::new());
        let mut registry = BackendRegistry::new(Arc::clone(&local));
        for fake in fakes {
            registry.register(fake.clone(), sync_enabled);
        }
        let selector = Arc::new(BackendSelector::new(
            Arc::new(registry),
            Arc::clone(&local),
            Arc::clone(&offline),
            BackendKind::DEFAULT_PRIORITY.to_vec(),
            ProbePolicy::default(),
            Duration::from_secs(1800),
        ));
        let queue = Arc::new(SyncQueue::new(Arc::clone(&local)));
        let data = DataService::new(
            Arc::clone(&selector),
            Arc::clone(&local),
            Arc::clone(&offline),
            Arc::clone(&queue),
        );
        Harness {
            local,
            offline,
            queue,
            selector,
            data,
        }
    }

    fn fake(kind: BackendKind, log: &CallLog) -> Arc<FakeBackend> {
        Arc::new(FakeBackend::new(kind).with_log(Arc::clone(log)))
    }

    fn worker() -> User {
        User {
            id: "w-1".into(),
            email: "worker@charnoks.test".into(),
            name: "Worker".into(),
            role: UserRole::Worker,
        }
    }

    fn soda() -> NewProduct {
        NewProduct::new("Soda", 15.0, 50, "Beverages")
    }

    #[tokio::test]
    async fn test_failed_remote_create_resolves_with_local_id() {
        let log = CallLog::default();
        let firebase = fake(BackendKind::Firebase, &log);
        let h = harness(&[firebase.clone()], true);
        h.selector.initialize(&BackendKind::DEFAULT_PRIORITY).await;
        firebase.script_creates([Some(FailureKind::Server)]);

        let saved = h.data.create_product(&soda()).await.expect("falls back");
        assert!(saved.value.id.starts_with(LOCAL_ID_PREFIX));
        assert!(matches!(saved.origin, WriteOrigin::Local { queued: true, .. }));

        let listed = h.data.list_products().await.unwrap();
        assert!(listed.iter().any(|p| p.id == saved.value.id));
        assert_eq!(h.queue.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_backend_validation_error_propagates_without_fallback() {
        let log = CallLog::default();
        let neon = fake(BackendKind::Neon, &log);
        let h = harness(&[neon.clone()], true);
        h.selector.initialize(&BackendKind::DEFAULT_PRIORITY).await;
        neon.script_creates([Some(FailureKind::Validation)]);

        let err = h.data.create_product(&soda()).await.unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("duplicate key"));
        assert!(h.offline.get_remote_access());
        assert!(h.local.list_products().unwrap().is_empty());
        assert!(h.queue.is_empty().unwrap());

        neon.script_creates([Some(FailureKind::Validation)]);
        let err = h
            .data
            .record_expense(&worker(), "Ice", 40.0, "Supplies", None)
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(h.local.list_transactions().unwrap().is_empty());
        assert!(h.queue.is_empty().unwrap());

        // next write goes remote again
        let saved = h.data.create_product(&soda()).await.unwrap();
        assert_eq!(saved.origin, WriteOrigin::Remote { backend: BackendKind::Neon });
    }

    #[tokio::test]
    async fn test_remote_roundtrip_preserves_fields() {
        let log = CallLog::default();
        let supabase = fake(BackendKind::Supabase, &log);
        let h = harness(&[supabase.clone()], true);
        h.selector.initialize(&BackendKind::DEFAULT_PRIORITY).await;

        let mut input = soda();
        input.description = Some("330ml can".into());
        let saved = h.data.create_product(&input).await.unwrap();
        assert!(!saved.saved_offline());

        let listed = h.data.list_products().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(NewProduct::from(&listed[0]), input);
        assert_eq!(listed[0].id, saved.value.id);
    }

    #[tokio::test]
    async fn test_insufficient_payment_is_rejected_before_persistence() {
        let log = CallLog::default();
        let neon = fake(BackendKind::Neon, &log);
        let h = harness(&[neon.clone()], true);
        h.selector.initialize(&BackendKind::DEFAULT_PRIORITY).await;

        let err = h
            .data
            .record_sale(&worker(), vec![SaleLine::new("p-1", "Soda", 2, 15.0)], 20.0, "cash", None)
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(neon.transactions().is_empty());
        assert!(h.local.list_transactions().unwrap().is_empty());
        assert!(h.queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_sale_stores_non_negative_change() {
        let log = CallLog::default();
        let neon = fake(BackendKind::Neon, &log);
        let h = harness(&[neon.clone()], true);
        h.selector.initialize(&BackendKind::DEFAULT_PRIORITY).await;

        let saved = h
            .data
            .record_sale(
                &worker(),
                vec![SaleLine::new("p-1", "Soda", 2, 15.0)],
                50.0,
                "cash",
                Some("two sodas"),
            )
            .await
            .unwrap();
        let TransactionDetails::Sale(sale) = &saved.value.details else {
            panic!("expected sale");
        };
        assert_eq!(sale.change, 20.0);
        assert!(sale.is_voice_transaction);
        assert_eq!(saved.value.worker_email, "worker@charnoks.test");
    }

    #[tokio::test]
    async fn test_no_remote_access_skips_remote_call() {
        let log = CallLog::default();
        let neon = fake(BackendKind::Neon, &log);
        let h = harness(&[neon.clone()], true);
        h.selector.initialize(&BackendKind::DEFAULT_PRIORITY).await;
        h.offline.set_remote_access(false);
        log.lock().unwrap().clear();

        let saved = h
            .data
            .record_expense(&worker(), "Ice", 40.0, "Supplies", None)
            .await
            .unwrap();
        assert_eq!(
            saved.origin,
            WriteOrigin::Local {
                queued: true,
                reason: Some("remote access unavailable".into())
            }
        );
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_backend_writes_are_not_queued() {
        let h = harness(&[], true);
        assert_eq!(
            h.selector.initialize(&BackendKind::DEFAULT_PRIORITY).await,
            BackendKind::Local
        );

        let saved = h.data.create_product(&soda()).await.unwrap();
        assert_eq!(saved.origin, WriteOrigin::Local { queued: false, reason: None });
        assert!(h.queue.is_empty().unwrap());
        assert_eq!(h.data.list_products().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_disabled_backend_does_not_queue() {
        let log = CallLog::default();
        let neon = fake(BackendKind::Neon, &log);
        let h = harness(&[neon.clone()], false);
        h.selector.initialize(&BackendKind::DEFAULT_PRIORITY).await;
        neon.script_creates([Some(FailureKind::Server)]);

        let saved = h.data.create_product(&soda()).await.unwrap();
        assert!(matches!(saved.origin, WriteOrigin::Local { queued: false, .. }));
        assert!(h.queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_offline_reads_see_cached_remote_state() {
        let log = CallLog::default();
        let neon = fake(BackendKind::Neon, &log);
        neon.seed_product(soda().into_product("neon-p-1".into(), chrono::Utc::now()));
        let h = harness(&[neon.clone()], true);
        h.selector.initialize(&BackendKind::DEFAULT_PRIORITY).await;
        assert_eq!(h.data.list_products().await.unwrap().len(), 1);

        neon.fail_lists(Some(FailureKind::Connectivity));
        let listed = h.data.list_products().await.unwrap();
        assert_eq!(listed[0].id, "neon-p-1");
        assert!(!h.offline.get_remote_access(), "connectivity failure demotes");
    }

    #[tokio::test]
    async fn test_active_products_filters_soft_deleted() {
        let h = harness(&[], true);
        h.selector.initialize(&BackendKind::DEFAULT_PRIORITY).await;
        let mut retired = soda();
        retired.is_active = false;
        h.data.create_product(&retired).await.unwrap();
        h.data.create_product(&NewProduct::new("Juice", 20.0, 5, "Beverages")).await.unwrap();

        let active = h.data.active_products().await.unwrap();
        let names: Vec<_> = active.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Juice"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_timeout_then_permission_denied() {
        let log = CallLog::default();
        let supabase = Arc::new(
            FakeBackend::new(BackendKind::Supabase)
                .with_log(Arc::clone(&log))
                .with_probe_delay(Duration::from_secs(60)),
        );
        let firebase = Arc::new(
            FakeBackend::new(BackendKind::Firebase)
                .with_log(Arc::clone(&log))
                .with_probe_delay(Duration::from_millis(1200)),
        );
        let neon = fake(BackendKind::Neon, &log);
        let h = harness(&[supabase.clone(), firebase.clone(), neon.clone()], true);

        let chosen = h.selector.initialize(&BackendKind::DEFAULT_PRIORITY).await;
        assert_eq!(chosen, BackendKind::Firebase);
        assert!(h.offline.get_remote_access());
        let results = h.selector.last_probe_results();
        assert_eq!(results[0].error.as_deref(), Some("timeout"));
        assert!(results[1].reachable);
        assert!(!log.lock().unwrap().iter().any(|c| c.starts_with("neon")));

        firebase.script_creates([Some(FailureKind::Connectivity)]);
        let saved = h.data.create_product(&soda()).await.unwrap();
        assert!(saved.value.id.starts_with(LOCAL_ID_PREFIX));
        assert_eq!(saved.value.name, "Soda");
        assert!(matches!(saved.origin, WriteOrigin::Local { queued: true, .. }));
        assert_eq!(h.queue.len().unwrap(), 1);
        // permission denied is a connectivity error
        assert!(!h.offline.get_remote_access());
        assert_eq!(h.selector.active_backend(), BackendKind::Firebase);
    }
}
