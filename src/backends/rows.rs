//! Postgres row shapes shared by the Supabase (PostgREST) and Neon REST
//! adapters, and their translation to and from the normalised model.
//!
//! Postgres drivers are loose about numeric and timestamp encodings
//! (`numeric` may arrive as a string, `timestamp` without a zone), so the
//! deserializers here accept both forms.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StoreError, StoreResult};
use crate::model::{
    BackendKind, ExpenseDetails, NewProduct, NewTransaction, Product, SaleDetails, SaleItem,
    Transaction, TransactionDetails, TransactionStatus,
};

pub const PRODUCTS_TABLE: &str = "products";
pub const TRANSACTIONS_TABLE: &str = "transactions";

// ---------------------------------------------------------------------------
// Lenient scalar decoding
// ---------------------------------------------------------------------------

fn value_to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn de_f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    let v = Value::deserialize(d)?;
    value_to_f64(&v).ok_or_else(|| de::Error::custom(format!("expected a number, got {v}")))
}

fn de_opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    let v = Value::deserialize(d)?;
    if v.is_null() {
        return Ok(None);
    }
    value_to_f64(&v)
        .map(Some)
        .ok_or_else(|| de::Error::custom(format!("expected a number, got {v}")))
}

fn de_opt_timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
    let raw = Option::<String>::deserialize(d)?;
    match raw {
        None => Ok(None),
        Some(s) => parse_timestamp(&s)
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("invalid timestamp: {s}"))),
    }
}

/// Parse RFC 3339 or a zone-less Postgres timestamp (assumed UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Remote ids may be uuids, text or serial integers.
pub fn id_to_string(id: &Value) -> Option<String> {
    match id {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn missing_id(backend: BackendKind, table: &str) -> StoreError {
    StoreError::Backend {
        backend,
        status: None,
        message: format!("{table} row is missing an id"),
    }
}

// ---------------------------------------------------------------------------
// Products
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub name: String,
    #[serde(deserialize_with = "de_f64")]
    pub price: f64,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub stock: Option<f64>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default, deserialize_with = "de_opt_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de_opt_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProductRow {
    pub fn from_new(input: &NewProduct, now: DateTime<Utc>) -> Self {
        Self {
            id: None,
            name: input.name.clone(),
            price: input.price,
            stock: Some(f64::from(input.stock)),
            category: input.category.clone(),
            image_url: input.image_url.clone(),
            description: input.description.clone(),
            is_active: Some(input.is_active),
            created_at: Some(now),
            updated_at: Some(now),
        }
    }

    pub fn into_product(self, backend: BackendKind) -> StoreResult<Product> {
        let id = self
            .id
            .as_ref()
            .and_then(id_to_string)
            .ok_or_else(|| missing_id(backend, PRODUCTS_TABLE))?;
        let now = Utc::now();
        let created_at = self.created_at.unwrap_or(now);
        Ok(Product {
            id,
            name: self.name,
            price: self.price,
            stock: self.stock.unwrap_or(0.0).clamp(0.0, f64::from(u32::MAX)) as u32,
            category: self.category,
            image_url: self.image_url,
            description: self.description,
            is_active: self.is_active.unwrap_or(true),
            created_at,
            updated_at: self.updated_at.unwrap_or(created_at),
        })
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(rename = "type")]
    pub kind: String,
    pub worker_id: String,
    #[serde(default)]
    pub worker_email: String,
    #[serde(default, deserialize_with = "de_opt_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<String>,

    // sale columns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<SaleItem>>,
    #[serde(default, deserialize_with = "de_opt_f64", skip_serializing_if = "Option::is_none")]
    pub total_amount: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64", skip_serializing_if = "Option::is_none")]
    pub amount_paid: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64", skip_serializing_if = "Option::is_none")]
    pub change: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_voice_transaction: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_input: Option<String>,

    // expense columns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64", skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl TransactionRow {
    pub fn from_new(input: &NewTransaction, now: DateTime<Utc>) -> Self {
        let mut row = Self {
            id: None,
            kind: input.details.kind().to_string(),
            worker_id: input.worker_id.clone(),
            worker_email: input.worker_email.clone(),
            timestamp: Some(now),
            status: Some(input.status.as_str().to_string()),
            items: None,
            total_amount: None,
            amount_paid: None,
            change: None,
            payment_method: None,
            is_voice_transaction: None,
            voice_input: None,
            description: None,
            amount: None,
            category: None,
            notes: None,
        };
        match &input.details {
            TransactionDetails::Sale(sale) => {
                row.items = Some(sale.items.clone());
                row.total_amount = Some(sale.total_amount);
                row.amount_paid = Some(sale.amount_paid);
                row.change = Some(sale.change);
                row.payment_method = Some(sale.payment_method.clone());
                row.is_voice_transaction = Some(sale.is_voice_transaction);
                row.voice_input = sale.voice_input.clone();
            }
            TransactionDetails::Expense(expense) => {
                row.description = Some(expense.description.clone());
                row.amount = Some(expense.amount);
                row.category = Some(expense.category.clone());
                row.notes = expense.notes.clone();
            }
        }
        row
    }

    pub fn into_transaction(self, backend: BackendKind) -> StoreResult<Transaction> {
        let id = self
            .id
            .as_ref()
            .and_then(id_to_string)
            .ok_or_else(|| missing_id(backend, TRANSACTIONS_TABLE))?;
        let status = match self.status.as_deref() {
            None => TransactionStatus::Completed,
            Some(raw) => raw.parse().map_err(|e: String| StoreError::Backend {
                backend,
                status: None,
                message: e,
            })?,
        };
        let details = match self.kind.as_str() {
            "sale" => {
                let items = self.items.unwrap_or_default();
                let total_amount = self
                    .total_amount
                    .unwrap_or_else(|| items.iter().map(|i| i.total).sum());
                let amount_paid = self.amount_paid.unwrap_or(total_amount);
                TransactionDetails::Sale(SaleDetails {
                    items,
                    total_amount,
                    amount_paid,
                    change: self.change.unwrap_or(amount_paid - total_amount).max(0.0),
                    payment_method: self.payment_method.unwrap_or_else(|| "cash".to_string()),
                    is_voice_transaction: self.is_voice_transaction.unwrap_or(false),
                    voice_input: self.voice_input,
                })
            }
            "expense" => TransactionDetails::Expense(ExpenseDetails {
                description: self.description.unwrap_or_default(),
                amount: self.amount.unwrap_or(0.0),
                category: self.category.unwrap_or_default(),
                notes: self.notes,
            }),
            other => {
                return Err(StoreError::Backend {
                    backend,
                    status: None,
                    message: format!("Unknown transaction type: '{other}'"),
                })
            }
        };
        Ok(Transaction {
            id,
            worker_id: self.worker_id,
            worker_email: self.worker_email,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            status,
            details,
        })
    }
}

/// Accept either a bare array or `{ "data": [...] }`.
pub fn unwrap_rows(value: Value) -> Value {
    match value {
        Value::Object(mut obj) if obj.contains_key("data") => obj.remove("data").unwrap_or(Value::Null),
        other => other,
    }
}

/// Insert responses come back as a single row or a one-element array.
pub fn first_row(value: Value) -> Option<Value> {
    match unwrap_rows(value) {
        Value::Array(mut rows) if !rows.is_empty() => Some(rows.swap_remove(0)),
        Value::Object(obj) => Some(Value::Object(obj)),
        _ => None,
    }
}
