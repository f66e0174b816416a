//! Durable FIFO of writes made while a remote backend was unavailable.
//!
//! Replay walks the queue in id order and stops at the first failure, so a
//! later write is never applied before an earlier one. A successful replay
//! removes the row and swaps the local record for the remote one in one
//! SQLite transaction. Replayed products also leave a `local id → remote id`
//! alias so queued sales can be pointed at the remote product; aliases are
//! dropped once nothing left to replay refers to them.
//!
//! An entry the backend rejects as invalid will never succeed, so it moves to
//! `sync_dead_letter` and replay carries on with the next one.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::backends::BackendAdapter;
use crate::error::{StoreError, StoreResult};
use crate::local_store::{self, LocalStore, Record, PRODUCTS_KEY, TRANSACTIONS_KEY};
use crate::model::{NewProduct, NewTransaction, Transaction, TransactionDetails};
use crate::offline::{classify_error, ErrorClass};

pub const SAVE_OPERATION: &str = "save";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDataType {
    Products,
    Transactions,
}

impl SyncDataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Products => "products",
            Self::Transactions => "transactions",
        }
    }
}

impl fmt::Display for SyncDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncDataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "products" => Ok(Self::Products),
            "transactions" => Ok(Self::Transactions),
            other => Err(format!("Unknown sync data type: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueEntry {
    pub data_type: SyncDataType,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    pub enqueued_at_ms: i64,
    pub operation: String,
}

impl SyncQueueEntry {
    pub fn product(input: &NewProduct, local_id: Option<&str>) -> StoreResult<Self> {
        Ok(Self::new(SyncDataType::Products, serde_json::to_value(input)?, local_id))
    }

    pub fn transaction(input: &NewTransaction, local_id: Option<&str>) -> StoreResult<Self> {
        Ok(Self::new(SyncDataType::Transactions, serde_json::to_value(input)?, local_id))
    }

    fn new(data_type: SyncDataType, payload: Value, local_id: Option<&str>) -> Self {
        Self {
            data_type,
            payload,
            local_id: local_id.map(str::to_string),
            enqueued_at_ms: Utc::now().timestamp_millis(),
            operation: SAVE_OPERATION.to_string(),
        }
    }

    pub fn at(mut self, enqueued_at_ms: i64) -> Self {
        self.enqueued_at_ms = enqueued_at_ms;
        self
    }

    fn idempotency_key(&self) -> Option<String> {
        self.local_id
            .as_ref()
            .map(|id| format!("{}:{id}", self.data_type))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedItem {
    pub id: i64,
    #[serde(flatten)]
    pub entry: SyncQueueEntry,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    pub succeeded: usize,
    pub remaining: usize,
    /// Entries the backend rejected as invalid during this run.
    pub dead_lettered: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Class of the failure that stopped the run.
    #[serde(skip)]
    pub error_class: Option<ErrorClass>,
}

/// Clears the in-progress flag when a replay ends, however it ends.
struct ReplayGuard<'a>(&'a AtomicBool);

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncQueue {
    local: Arc<LocalStore>,
    replaying: AtomicBool,
}

impl SyncQueue {
    pub fn new(local: Arc<LocalStore>) -> Self {
        Self {
            local,
            replaying: AtomicBool::new(false),
        }
    }

    /// Append an entry. An entry for a `local_id` that is already queued is
    /// not duplicated; the existing row id is returned.
    pub fn enqueue(&self, entry: &SyncQueueEntry) -> StoreResult<i64> {
        let conn = self.local.lock()?;
        let payload = serde_json::to_string(&entry.payload)?;
        let key = entry.idempotency_key();
        let inserted = conn.execute(
            "INSERT INTO sync_queue (data_type, operation, payload, local_id, enqueued_at_ms, idempotency_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(idempotency_key) DO NOTHING",
            params![
                entry.data_type.as_str(),
                entry.operation,
                payload,
                entry.local_id,
                entry.enqueued_at_ms,
                key
            ],
        )?;
        if inserted == 0 {
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT id FROM sync_queue WHERE idempotency_key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                debug!(queue_id = id, local_id = ?entry.local_id, "Entry already queued");
                return Ok(id);
            }
        }
        let id = conn.last_insert_rowid();
        info!(
            queue_id = id,
            data_type = %entry.data_type,
            local_id = ?entry.local_id,
            "Write queued for sync"
        );
        Ok(id)
    }

    pub fn pending(&self) -> StoreResult<Vec<QueuedItem>> {
        load_items(
            &*self.local.lock()?,
            "SELECT id, data_type, operation, payload, local_id, enqueued_at_ms, attempts, last_error
             FROM sync_queue ORDER BY id ASC",
        )
    }

    /// Entries parked after a validation rejection, oldest first. `id` is
    /// the original queue id.
    pub fn dead_letters(&self) -> StoreResult<Vec<QueuedItem>> {
        load_items(
            &*self.local.lock()?,
            "SELECT queue_id, data_type, operation, payload, local_id, enqueued_at_ms, attempts, last_error
             FROM sync_dead_letter ORDER BY id ASC",
        )
    }

    pub fn len(&self) -> StoreResult<usize> {
        let conn = self.local.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// `(data type, local id)` of every queued or dead-lettered entry that
    /// carries a local id.
    pub fn pending_local_ids(&self) -> StoreResult<HashSet<(SyncDataType, String)>> {
        let conn = self.local.lock()?;
        let mut stmt = conn.prepare(
            "SELECT data_type, local_id FROM sync_queue WHERE local_id IS NOT NULL
             UNION
             SELECT data_type, local_id FROM sync_dead_letter WHERE local_id IS NOT NULL",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(data_type, id)| Ok((SyncDataType::from_str(&data_type).map_err(StoreError::fatal)?, id)))
            .collect()
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying.load(Ordering::SeqCst)
    }

    /// Re-apply queued writes against `target` in FIFO order, stopping at
    /// the first failure that is not a validation rejection. Only one replay
    /// runs at a time; a concurrent call returns the current counts without
    /// replaying.
    pub async fn replay(&self, target: &dyn BackendAdapter) -> StoreResult<ReplayReport> {
        if !target.kind().is_remote() {
            return Ok(ReplayReport {
                remaining: self.len()?,
                ..ReplayReport::default()
            });
        }
        if self
            .replaying
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Replay already in progress");
            return Ok(ReplayReport {
                remaining: self.len()?,
                ..ReplayReport::default()
            });
        }
        let _guard = ReplayGuard(&self.replaying);

        let items = self.pending()?;
        if items.is_empty() {
            return Ok(ReplayReport::default());
        }
        info!(backend = %target.kind(), pending = items.len(), "Replaying sync queue");

        let mut report = ReplayReport::default();
        for item in items {
            let Err(e) = self.apply(target, &item).await else {
                report.succeeded += 1;
                continue;
            };
            let class = classify_error(&e);
            if class == ErrorClass::Validation {
                warn!(
                    queue_id = item.id,
                    backend = %target.kind(),
                    error = %e,
                    "Backend rejected queued entry, moved to dead letters"
                );
                self.dead_letter(item.id, &e)?;
                report.dead_lettered += 1;
                continue;
            }
            warn!(
                queue_id = item.id,
                backend = %target.kind(),
                attempts = item.attempts + 1,
                error = %e,
                "Replay stopped at failed entry"
            );
            self.record_failure(item.id, &e)?;
            report.last_error = Some(e.to_string());
            report.error_class = Some(class);
            break;
        }
        self.prune_aliases()?;
        report.remaining = self.len()?;
        info!(
            succeeded = report.succeeded,
            dead_lettered = report.dead_lettered,
            remaining = report.remaining,
            "Replay finished"
        );
        Ok(report)
    }

    async fn apply(&self, target: &dyn BackendAdapter, item: &QueuedItem) -> StoreResult<()> {
        let local_id = item.entry.local_id.as_deref();
        match item.entry.data_type {
            SyncDataType::Products => {
                let input: NewProduct = decode_payload(item)?;
                let remote = target.create_product(&input).await?;
                self.commit_replayed(item.id, |conn| {
                    if let Some(local_id) = local_id {
                        local_store::replace_local(conn, PRODUCTS_KEY, local_id, &remote)?;
                        local_store::record_alias(conn, local_id, &remote.id)?;
                    }
                    Ok(())
                })
            }
            SyncDataType::Transactions => {
                let mut input: NewTransaction = decode_payload(item)?;
                let aliases = local_store::alias_map(&*self.local.lock()?)?;
                rewrite_product_ids(&mut input, &aliases);
                let remote = target.create_transaction(&input).await?;
                self.commit_replayed(item.id, |conn| {
                    if let Some(local_id) = local_id {
                        local_store::replace_local(conn, TRANSACTIONS_KEY, local_id, &remote)?;
                    }
                    Ok(())
                })
            }
        }
    }

    fn commit_replayed(
        &self,
        queue_id: i64,
        update_local: impl FnOnce(&Connection) -> StoreResult<()>,
    ) -> StoreResult<()> {
        let mut conn = self.local.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM sync_queue WHERE id = ?1", params![queue_id])?;
        update_local(&tx)?;
        tx.commit()?;
        debug!(queue_id, "Queue entry replayed");
        Ok(())
    }

    fn dead_letter(&self, queue_id: i64, err: &StoreError) -> StoreResult<()> {
        let mut conn = self.local.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO sync_dead_letter
                (queue_id, data_type, operation, payload, local_id, enqueued_at_ms, attempts, last_error)
             SELECT id, data_type, operation, payload, local_id, enqueued_at_ms, attempts + 1, ?2
             FROM sync_queue WHERE id = ?1",
            params![queue_id, err.to_string()],
        )?;
        tx.execute("DELETE FROM sync_queue WHERE id = ?1", params![queue_id])?;
        tx.commit()?;
        Ok(())
    }

    /// Drop aliases no queued sale or unsynced local sale still refers to.
    fn prune_aliases(&self) -> StoreResult<()> {
        let mut conn = self.local.lock()?;
        let tx = conn.transaction()?;
        let mut aliases = local_store::alias_map(&tx)?;
        if aliases.is_empty() {
            return Ok(());
        }

        let mut referenced = HashSet::new();
        for item in load_items(
            &tx,
            "SELECT id, data_type, operation, payload, local_id, enqueued_at_ms, attempts, last_error
             FROM sync_queue WHERE data_type = 'transactions' ORDER BY id ASC",
        )? {
            if let Ok(input) = serde_json::from_value::<NewTransaction>(item.entry.payload) {
                collect_product_ids(&input.details, &mut referenced);
            }
        }
        let local_sales: Vec<Transaction> = local_store::read_doc(&tx, TRANSACTIONS_KEY)?;
        for sale in local_sales.iter().filter(|t| t.is_local()) {
            collect_product_ids(&sale.details, &mut referenced);
        }

        let before = aliases.len();
        aliases.retain(|local_id, _| referenced.contains(local_id));
        if aliases.len() == before {
            return Ok(());
        }
        local_store::write_aliases(&tx, &aliases)?;
        tx.commit()?;
        debug!(pruned = before - aliases.len(), "Pruned product id aliases");
        Ok(())
    }

    fn record_failure(&self, queue_id: i64, err: &StoreError) -> StoreResult<()> {
        let conn = self.local.lock()?;
        conn.execute(
            "UPDATE sync_queue SET attempts = attempts + 1, last_error = ?2 WHERE id = ?1",
            params![queue_id, err.to_string()],
        )?;
        Ok(())
    }

    /// Queue every `local-` record that has no pending entry, products
    /// before transactions. Returns the number of entries added.
    pub fn reconcile_local_records(&self) -> StoreResult<usize> {
        let queued = self.pending_local_ids()?;
        let mut added = 0;

        for product in self.local.list_products()? {
            if !product.is_local() || queued.contains(&(SyncDataType::Products, product.id.clone())) {
                continue;
            }
            let entry = SyncQueueEntry::product(&NewProduct::from(&product), Some(&product.id))?
                .at(product.created_at.timestamp_millis());
            self.enqueue(&entry)?;
            added += 1;
        }
        for tx in self.local.list_transactions()? {
            if !tx.is_local() || queued.contains(&(SyncDataType::Transactions, tx.id.clone())) {
                continue;
            }
            let entry = SyncQueueEntry::transaction(&NewTransaction::from(&tx), Some(&tx.id))?
                .at(tx.timestamp.timestamp_millis());
            self.enqueue(&entry)?;
            added += 1;
        }
        if added > 0 {
            info!(added, "Local-only records queued for sync");
        }
        Ok(added)
    }
}

/// Rows of `(id, data_type, operation, payload, local_id, enqueued_at_ms,
/// attempts, last_error)` in query order.
fn load_items(conn: &Connection, sql: &str) -> StoreResult<Vec<QueuedItem>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut items = Vec::with_capacity(rows.len());
    for (id, data_type, operation, payload, local_id, enqueued_at_ms, attempts, last_error) in rows {
        let data_type = SyncDataType::from_str(&data_type).map_err(|e| {
            error!(queue_id = id, "{e}");
            StoreError::fatal(e)
        })?;
        let payload: Value = serde_json::from_str(&payload)
            .map_err(|e| StoreError::fatal(format!("corrupt payload for queue entry {id}: {e}")))?;
        items.push(QueuedItem {
            id,
            entry: SyncQueueEntry {
                data_type,
                payload,
                local_id,
                enqueued_at_ms,
                operation,
            },
            attempts: attempts.max(0) as u32,
            last_error,
        });
    }
    Ok(items)
}

fn decode_payload<T: serde::de::DeserializeOwned>(item: &QueuedItem) -> StoreResult<T> {
    serde_json::from_value(item.entry.payload.clone()).map_err(|e| {
        StoreError::fatal(format!(
            "undecodable {} payload in queue entry {}: {e}",
            item.entry.data_type, item.id
        ))
    })
}

fn collect_product_ids(details: &TransactionDetails, into: &mut HashSet<String>) {
    if let TransactionDetails::Sale(sale) = details {
        into.extend(sale.items.iter().map(|item| item.product_id.clone()));
    }
}

fn rewrite_product_ids(input: &mut NewTransaction, aliases: &HashMap<String, String>) {
    if let TransactionDetails::Sale(sale) = &mut input.details {
        for item in &mut sale.items {
            if let Some(remote_id) = aliases.get(&item.product_id) {
                item.product_id = remote_id.clone();
            }
        }
    }
}
