//! Durable local store: products, transactions and users as JSON documents
//! in `local_settings`, plus the demo flag, the active-backend session and
//! the local→remote id alias map.
//!
//! Each collection is one JSON array. Every read-modify-write happens under
//! the single connection lock, so a background replay and a foreground save
//! cannot interleave inside one update.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, MutexGuard};
use tracing::{debug, info};

use crate::backends::BackendAdapter;
use crate::db::{self, DbState};
use crate::error::{StoreError, StoreResult};
use crate::model::{
    BackendKind, NewProduct, NewTransaction, Product, Transaction, User, LOCAL_ID_PREFIX,
};

/// `local_settings` category holding every local document.
pub const CATEGORY: &str = "local";

pub const PRODUCTS_KEY: &str = "products";
pub const TRANSACTIONS_KEY: &str = "transactions";
const USERS_KEY: &str = "users";
const DEMO_MODE_KEY: &str = "demo_mode";
const ACTIVE_BACKEND_KEY: &str = "active_backend";
const ALIASES_KEY: &str = "id_aliases";

/// Anything stored in an id-keyed collection.
pub trait Record: Serialize + DeserializeOwned + Clone {
    fn id(&self) -> &str;

    fn is_local(&self) -> bool {
        self.id().starts_with(LOCAL_ID_PREFIX)
    }
}

impl Record for Product {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for Transaction {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Persisted active-backend selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveBackendRecord {
    pub backend: BackendKind,
    pub selected_at: DateTime<Utc>,
}

/// Counts of cached records dropped by a demo reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemoReset {
    pub products_removed: usize,
    pub transactions_removed: usize,
}

// ---------------------------------------------------------------------------
// Connection-level helpers (usable inside a caller-owned SQLite transaction)
// ---------------------------------------------------------------------------

pub(crate) fn read_doc<T: DeserializeOwned + Default>(conn: &Connection, key: &str) -> StoreResult<T> {
    match db::get_setting(conn, CATEGORY, key)? {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| StoreError::fatal(format!("corrupt local {key} document: {e}"))),
        None => Ok(T::default()),
    }
}

pub(crate) fn write_doc<T: Serialize + ?Sized>(conn: &Connection, key: &str, value: &T) -> StoreResult<()> {
    let raw = serde_json::to_string(value)?;
    db::set_setting(conn, CATEGORY, key, &raw)
}

/// Next free `local-<ms>` id, bumping the timestamp past any collision.
/// Ids still held by the alias map count as taken, since a replayed record
/// no longer appears under its local id.
fn next_local_id<T: Record>(
    existing: &[T],
    aliases: &HashMap<String, String>,
    now: DateTime<Utc>,
) -> String {
    let mut ms = now.timestamp_millis();
    loop {
        let candidate = format!("{LOCAL_ID_PREFIX}{ms}");
        if !existing.iter().any(|r| r.id() == candidate) && !aliases.contains_key(&candidate) {
            return candidate;
        }
        ms += 1;
    }
}

fn upsert<T: Record>(conn: &Connection, key: &str, record: &T) -> StoreResult<()> {
    let mut all: Vec<T> = read_doc(conn, key)?;
    match all.iter_mut().find(|r| r.id() == record.id()) {
        Some(existing) => *existing = record.clone(),
        None => all.push(record.clone()),
    }
    write_doc(conn, key, &all)
}

/// Replace the remote part of a cached collection, keeping `local-` records.
fn replace_remote<T: Record>(conn: &Connection, key: &str, remote: &[T]) -> StoreResult<()> {
    let existing: Vec<T> = read_doc(conn, key)?;
    let mut merged: Vec<T> = remote.to_vec();
    merged.extend(existing.into_iter().filter(|r| r.is_local()));
    write_doc(conn, key, &merged)
}

/// Swap a local record for its remote counterpart in place.
pub(crate) fn replace_local<T: Record>(
    conn: &Connection,
    key: &str,
    local_id: &str,
    remote: &T,
) -> StoreResult<()> {
    let mut all: Vec<T> = read_doc(conn, key)?;
    all.retain(|r| r.id() != remote.id());
    match all.iter_mut().find(|r| r.id() == local_id) {
        Some(slot) => *slot = remote.clone(),
        None => all.push(remote.clone()),
    }
    write_doc(conn, key, &all)
}

pub(crate) fn record_alias(conn: &Connection, local_id: &str, remote_id: &str) -> StoreResult<()> {
    let mut aliases: HashMap<String, String> = read_doc(conn, ALIASES_KEY)?;
    aliases.insert(local_id.to_string(), remote_id.to_string());
    write_doc(conn, ALIASES_KEY, &aliases)
}

pub(crate) fn alias_map(conn: &Connection) -> StoreResult<HashMap<String, String>> {
    read_doc(conn, ALIASES_KEY)
}

/// Overwrite the alias map; an empty map removes the document.
pub(crate) fn write_aliases(conn: &Connection, aliases: &HashMap<String, String>) -> StoreResult<()> {
    if aliases.is_empty() {
        return db::delete_setting(conn, CATEGORY, ALIASES_KEY);
    }
    write_doc(conn, ALIASES_KEY, aliases)
}

// ---------------------------------------------------------------------------
// LocalStore
// ---------------------------------------------------------------------------

pub struct LocalStore {
    db: Arc<DbState>,
}

impl LocalStore {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    pub(crate) fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        Ok(self.db.conn.lock()?)
    }

    // -- products -----------------------------------------------------------

    pub fn list_products(&self) -> StoreResult<Vec<Product>> {
        read_doc(&*self.lock()?, PRODUCTS_KEY)
    }

    /// Store a new product under a fresh `local-` id.
    pub fn insert_product(&self, input: &NewProduct) -> StoreResult<Product> {
        input.validate()?;
        let conn = self.lock()?;
        let mut all: Vec<Product> = read_doc(&conn, PRODUCTS_KEY)?;
        let aliases = alias_map(&conn)?;
        let now = Utc::now();
        let product = input.clone().into_product(next_local_id(&all, &aliases, now), now);
        all.push(product.clone());
        write_doc(&conn, PRODUCTS_KEY, &all)?;
        debug!(id = %product.id, "Product stored locally");
        Ok(product)
    }

    pub fn upsert_product(&self, product: &Product) -> StoreResult<()> {
        upsert(&*self.lock()?, PRODUCTS_KEY, product)
    }

    pub fn replace_remote_products(&self, remote: &[Product]) -> StoreResult<()> {
        replace_remote(&*self.lock()?, PRODUCTS_KEY, remote)
    }

    // -- transactions -------------------------------------------------------

    pub fn list_transactions(&self) -> StoreResult<Vec<Transaction>> {
        read_doc(&*self.lock()?, TRANSACTIONS_KEY)
    }

    /// Append a new transaction under a fresh `local-` id.
    pub fn insert_transaction(&self, input: &NewTransaction) -> StoreResult<Transaction> {
        input.validate()?;
        let conn = self.lock()?;
        let mut all: Vec<Transaction> = read_doc(&conn, TRANSACTIONS_KEY)?;
        let aliases = alias_map(&conn)?;
        let now = Utc::now();
        let tx = input.clone().into_transaction(next_local_id(&all, &aliases, now), now);
        all.push(tx.clone());
        write_doc(&conn, TRANSACTIONS_KEY, &all)?;
        debug!(id = %tx.id, kind = tx.details.kind(), "Transaction stored locally");
        Ok(tx)
    }

    pub fn upsert_transaction(&self, tx: &Transaction) -> StoreResult<()> {
        upsert(&*self.lock()?, TRANSACTIONS_KEY, tx)
    }

    pub fn replace_remote_transactions(&self, remote: &[Transaction]) -> StoreResult<()> {
        replace_remote(&*self.lock()?, TRANSACTIONS_KEY, remote)
    }

    // -- users --------------------------------------------------------------

    pub fn list_users(&self) -> StoreResult<Vec<User>> {
        read_doc(&*self.lock()?, USERS_KEY)
    }

    /// Insert or update a user, matched case-insensitively by email.
    pub fn save_user(&self, user: &User) -> StoreResult<()> {
        if user.email.trim().is_empty() {
            return Err(StoreError::validation("email is required"));
        }
        let conn = self.lock()?;
        let mut users: Vec<User> = read_doc(&conn, USERS_KEY)?;
        match users
            .iter_mut()
            .find(|u| u.email.eq_ignore_ascii_case(&user.email))
        {
            Some(existing) => *existing = user.clone(),
            None => users.push(user.clone()),
        }
        write_doc(&conn, USERS_KEY, &users)
    }

    // -- demo mode ----------------------------------------------------------

    pub fn is_demo_mode(&self) -> StoreResult<bool> {
        let raw = db::get_setting(&*self.lock()?, CATEGORY, DEMO_MODE_KEY)?;
        Ok(raw.as_deref() == Some("true"))
    }

    pub fn set_demo_mode(&self, enabled: bool) -> StoreResult<()> {
        let value = if enabled { "true" } else { "false" };
        db::set_setting(&*self.lock()?, CATEGORY, DEMO_MODE_KEY, value)
    }

    /// Enter a clean demo state: drop cached remote records and fixtures,
    /// keep `local-` records, and turn demo mode on. Users are untouched.
    pub fn reset_demo_data(&self) -> StoreResult<DemoReset> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let products: Vec<Product> = read_doc(&tx, PRODUCTS_KEY)?;
        let transactions: Vec<Transaction> = read_doc(&tx, TRANSACTIONS_KEY)?;
        let kept_products: Vec<Product> = products.iter().filter(|p| p.is_local()).cloned().collect();
        let kept_transactions: Vec<Transaction> =
            transactions.iter().filter(|t| t.is_local()).cloned().collect();

        write_doc(&tx, PRODUCTS_KEY, &kept_products)?;
        write_doc(&tx, TRANSACTIONS_KEY, &kept_transactions)?;
        db::set_setting(&tx, CATEGORY, DEMO_MODE_KEY, "true")?;
        tx.commit()?;

        let reset = DemoReset {
            products_removed: products.len() - kept_products.len(),
            transactions_removed: transactions.len() - kept_transactions.len(),
        };
        info!(
            products_removed = reset.products_removed,
            transactions_removed = reset.transactions_removed,
            "Local store reset to clean demo state"
        );
        Ok(reset)
    }

    // -- active backend session ---------------------------------------------

    pub fn load_active_backend(&self) -> StoreResult<Option<ActiveBackendRecord>> {
        let raw = db::get_setting(&*self.lock()?, CATEGORY, ACTIVE_BACKEND_KEY)?;
        raw.map(|r| {
            serde_json::from_str(&r)
                .map_err(|e| StoreError::fatal(format!("corrupt active backend record: {e}")))
        })
        .transpose()
    }

    pub fn save_active_backend(&self, backend: BackendKind, selected_at: DateTime<Utc>) -> StoreResult<()> {
        let record = ActiveBackendRecord {
            backend,
            selected_at,
        };
        write_doc(&*self.lock()?, ACTIVE_BACKEND_KEY, &record)
    }

    // -- aliases ------------------------------------------------------------

    pub fn resolve_alias(&self, local_id: &str) -> StoreResult<Option<String>> {
        Ok(alias_map(&*self.lock()?)?.remove(local_id))
    }
}

#[async_trait]
impl BackendAdapter for LocalStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn list_products(&self) -> StoreResult<Vec<Product>> {
        LocalStore::list_products(self)
    }

    async fn create_product(&self, input: &NewProduct) -> StoreResult<Product> {
        self.insert_product(input)
    }

    async fn list_transactions(&self) -> StoreResult<Vec<Transaction>> {
        LocalStore::list_transactions(self)
    }

    async fn create_transaction(&self, input: &NewTransaction) -> StoreResult<Transaction> {
        self.insert_transaction(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SaleLine, UserRole};

    fn store() -> LocalStore {
        LocalStore::new(Arc::new(db::open_in_memory().unwrap()))
    }

    fn remote_product(id: &str, name: &str) -> Product {
        NewProduct::new(name, 10.0, 5, "Snacks").into_product(id.into(), Utc::now())
    }

    #[test]
    fn test_insert_assigns_unique_local_ids() {
        let store = store();
        let a = store.insert_product(&NewProduct::new("Soda", 15.0, 50, "Beverages")).unwrap();
        let b = store.insert_product(&NewProduct::new("Juice", 20.0, 10, "Beverages")).unwrap();
        assert!(a.id.starts_with(LOCAL_ID_PREFIX));
        assert!(b.id.starts_with(LOCAL_ID_PREFIX));
        assert_ne!(a.id, b.id);
        assert_eq!(store.list_products().unwrap().len(), 2);
    }

    #[test]
    fn test_local_id_skips_ids_still_aliased() {
        let store = store();
        let now = Utc::now();
        let taken = format!("{LOCAL_ID_PREFIX}{}", now.timestamp_millis());
        {
            let conn = store.lock().unwrap();
            record_alias(&conn, &taken, "r-1").unwrap();
        }
        let aliases = alias_map(&*store.lock().unwrap()).unwrap();
        let id = next_local_id::<Product>(&[], &aliases, now);
        assert_ne!(id, taken);
        assert_eq!(id, format!("{LOCAL_ID_PREFIX}{}", now.timestamp_millis() + 1));
    }

    #[test]
    fn test_empty_alias_map_removes_document() {
        let store = store();
        let conn = store.lock().unwrap();
        record_alias(&conn, "local-1", "r-1").unwrap();
        write_aliases(&conn, &HashMap::new()).unwrap();
        assert_eq!(db::get_setting(&conn, CATEGORY, ALIASES_KEY).unwrap(), None);
    }

    #[test]
    fn test_price_is_kept_exactly() {
        let store = store();
        let saved = store.insert_product(&NewProduct::new("Candy", 0.125, 10, "Snacks")).unwrap();
        assert_eq!(saved.price, 0.125);
        assert_eq!(store.list_products().unwrap()[0].price, 0.125);
    }

    #[test]
    fn test_insert_rejects_invalid_product() {
        let err = store()
            .insert_product(&NewProduct::new("Soda", -1.0, 1, "Beverages"))
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_timestamps_survive_roundtrip() {
        let store = store();
        let tx = NewTransaction::sale("w-1", "w@x", vec![SaleLine::new("p", "Soda", 1, 15.0)], 20.0, "cash")
            .unwrap();
        let saved = store.insert_transaction(&tx).unwrap();
        let listed = store.list_transactions().unwrap();
        assert_eq!(listed, vec![saved]);
    }

    #[test]
    fn test_replace_remote_keeps_local_records() {
        let store = store();
        store.upsert_product(&remote_product("r-1", "Old")).unwrap();
        let local = store.insert_product(&NewProduct::new("Offline", 1.0, 1, "Misc")).unwrap();

        store
            .replace_remote_products(&[remote_product("r-2", "Fresh")])
            .unwrap();
        let ids: Vec<_> = store.list_products().unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["r-2".to_string(), local.id]);
    }

    #[test]
    fn test_demo_reset_clears_remote_cache_only() {
        let store = store();
        store.upsert_product(&remote_product("r-1", "Cached")).unwrap();
        let local = store.insert_product(&NewProduct::new("Offline", 1.0, 1, "Misc")).unwrap();
        store
            .save_user(&User {
                id: "u-1".into(),
                email: "owner@shop.test".into(),
                name: "Owner".into(),
                role: UserRole::Owner,
            })
            .unwrap();

        let reset = store.reset_demo_data().unwrap();
        assert_eq!(reset.products_removed, 1);
        assert_eq!(store.list_products().unwrap(), vec![local]);
        assert!(store.list_transactions().unwrap().is_empty());
        assert!(store.is_demo_mode().unwrap());
        assert_eq!(store.list_users().unwrap().len(), 1);
    }

    #[test]
    fn test_save_user_upserts_by_email() {
        let store = store();
        let mut user = User {
            id: "u-1".into(),
            email: "w@shop.test".into(),
            name: "Worker".into(),
            role: UserRole::Worker,
        };
        store.save_user(&user).unwrap();
        user.email = "W@SHOP.TEST".into();
        user.name = "Renamed".into();
        store.save_user(&user).unwrap();

        let users = store.list_users().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].name, "Renamed");
    }

    #[test]
    fn test_corrupt_document_is_fatal() {
        let store = store();
        db::set_setting(&*store.lock().unwrap(), CATEGORY, PRODUCTS_KEY, "{not json").unwrap();
        let err = store.list_products().unwrap_err();
        assert!(matches!(err, StoreError::FatalLocal(_)));
    }

    #[test]
    fn test_active_backend_record_roundtrip() {
        let store = store();
        assert_eq!(store.load_active_backend().unwrap(), None);
        let now = Utc::now();
        store.save_active_backend(BackendKind::Neon, now).unwrap();
        let record = store.load_active_backend().unwrap().unwrap();
        assert_eq!(record.backend, BackendKind::Neon);
        assert_eq!(record.selected_at, now);
    }

    #[test]
    fn test_replace_local_and_alias() {
        let store = store();
        let local = store.insert_product(&NewProduct::new("Soda", 15.0, 50, "Beverages")).unwrap();
        {
            let conn = store.lock().unwrap();
            replace_local(&conn, PRODUCTS_KEY, &local.id, &remote_product("r-9", "Soda")).unwrap();
            record_alias(&conn, &local.id, "r-9").unwrap();
        }
        let ids: Vec<_> = store.list_products().unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["r-9".to_string()]);
        assert_eq!(store.resolve_alias(&local.id).unwrap().as_deref(), Some("r-9"));
    }
}
