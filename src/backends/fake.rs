//! Scriptable in-memory backend for tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::BackendAdapter;
use crate::error::{StoreError, StoreResult};
use crate::model::{BackendKind, NewProduct, NewTransaction, Product, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Connectivity,
    Validation,
    Server,
}

impl FailureKind {
    fn into_error(self, backend: BackendKind) -> StoreError {
        match self {
            Self::Connectivity => StoreError::connectivity(backend, "connection refused"),
            Self::Validation => StoreError::validation("duplicate key"),
            Self::Server => StoreError::Backend {
                backend,
                status: Some(500),
                message: "internal error".into(),
            },
        }
    }
}

pub type CallLog = Arc<Mutex<Vec<String>>>;

pub struct FakeBackend {
    kind: BackendKind,
    reachable: AtomicBool,
    probe_delay: Mutex<Option<Duration>>,
    create_delay: Mutex<Option<Duration>>,
    create_failures: Mutex<VecDeque<Option<FailureKind>>>,
    list_failure: Mutex<Option<FailureKind>>,
    next_id: AtomicU64,
    products: Mutex<Vec<Product>>,
    transactions: Mutex<Vec<Transaction>>,
    log: CallLog,
}

impl FakeBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            reachable: AtomicBool::new(true),
            probe_delay: Mutex::new(None),
            create_delay: Mutex::new(None),
            create_failures: Mutex::new(VecDeque::new()),
            list_failure: Mutex::new(None),
            next_id: AtomicU64::new(1),
            products: Mutex::new(Vec::new()),
            transactions: Mutex::new(Vec::new()),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn unreachable(kind: BackendKind) -> Self {
        let fake = Self::new(kind);
        fake.set_reachable(false);
        fake
    }

    /// Share a call log across several fakes to assert cross-backend ordering.
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    pub fn with_probe_delay(self, delay: Duration) -> Self {
        *self.probe_delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn with_create_delay(self, delay: Duration) -> Self {
        *self.create_delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Script the outcome of upcoming creates in order; `None` means succeed.
    /// Once the script is exhausted creates follow `reachable`.
    pub fn script_creates(&self, outcomes: impl IntoIterator<Item = Option<FailureKind>>) {
        self.create_failures.lock().unwrap().extend(outcomes);
    }

    pub fn fail_lists(&self, failure: Option<FailureKind>) {
        *self.list_failure.lock().unwrap() = failure;
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn products(&self) -> Vec<Product> {
        self.products.lock().unwrap().clone()
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.transactions.lock().unwrap().clone()
    }

    pub fn seed_product(&self, product: Product) {
        self.products.lock().unwrap().push(product);
    }

    fn record(&self, call: &str) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:{call}", self.kind));
    }

    async fn check_create(&self) -> StoreResult<()> {
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.create_failures.lock().unwrap().pop_front();
        match scripted {
            Some(Some(failure)) => Err(failure.into_error(self.kind)),
            Some(None) => Ok(()),
            None => self.check_reachable(),
        }
    }

    fn check_reachable(&self) -> StoreResult<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(FailureKind::Connectivity.into_error(self.kind))
        }
    }

    fn check_list(&self) -> StoreResult<()> {
        if let Some(failure) = *self.list_failure.lock().unwrap() {
            return Err(failure.into_error(self.kind));
        }
        self.check_reachable()
    }

    fn next_id(&self) -> String {
        format!("{}-{}", self.kind, self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl BackendAdapter for FakeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.record("probe");
        let delay = *self.probe_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_reachable()
    }

    async fn list_products(&self) -> StoreResult<Vec<Product>> {
        self.record("list_products");
        self.check_list()?;
        Ok(self.products())
    }

    async fn create_product(&self, input: &NewProduct) -> StoreResult<Product> {
        self.record(&format!("create_product:{}", input.name));
        self.check_create().await?;
        let product = input.clone().into_product(self.next_id(), Utc::now());
        self.products.lock().unwrap().push(product.clone());
        Ok(product)
    }

    async fn list_transactions(&self) -> StoreResult<Vec<Transaction>> {
        self.record("list_transactions");
        self.check_list()?;
        Ok(self.transactions())
    }

    async fn create_transaction(&self, input: &NewTransaction) -> StoreResult<Transaction> {
        self.record(&format!("create_transaction:{}", input.details.kind()));
        self.check_create().await?;
        let tx = input.clone().into_transaction(self.next_id(), Utc::now());
        self.transactions.lock().unwrap().push(tx.clone());
        Ok(tx)
    }
}
