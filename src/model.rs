//! Normalised entity schema shared by every backend adapter.
//!
//! Adapters translate their native payloads into these types at the boundary;
//! nothing above the adapters sees SDK-specific field names. JSON uses the
//! camelCase shape the web frontend already speaks, with timestamps as
//! RFC 3339 strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{StoreError, StoreResult};

/// Prefix for ids assigned by the local store.
pub const LOCAL_ID_PREFIX: &str = "local-";

// ---------------------------------------------------------------------------
// Backend kind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Supabase,
    Firebase,
    Neon,
    Local,
}

impl BackendKind {
    /// Default probing order used when no priority is configured.
    pub const DEFAULT_PRIORITY: [BackendKind; 4] = [
        BackendKind::Supabase,
        BackendKind::Firebase,
        BackendKind::Neon,
        BackendKind::Local,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Supabase => "supabase",
            Self::Firebase => "firebase",
            Self::Neon => "neon",
            Self::Local => "local",
        }
    }

    pub fn is_remote(&self) -> bool {
        !matches!(self, Self::Local)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "supabase" => Ok(Self::Supabase),
            "firebase" | "firestore" => Ok(Self::Firebase),
            "neon" | "postgres" => Ok(Self::Neon),
            "local" | "localstorage" => Ok(Self::Local),
            other => Err(format!("Unknown backend: '{other}'")),
        }
    }
}

/// Parse a comma separated priority list such as `"firebase, neon, local"`.
///
/// Duplicates are dropped (first occurrence wins) and `local` is appended when
/// missing so selection always has a terminal candidate.
pub fn parse_priority(raw: &str) -> Result<Vec<BackendKind>, String> {
    let mut order = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let kind: BackendKind = part.parse()?;
        if !order.contains(&kind) {
            order.push(kind);
        }
    }
    if !order.contains(&BackendKind::Local) {
        order.push(BackendKind::Local);
    }
    Ok(order)
}

// ---------------------------------------------------------------------------
// Money helpers
// ---------------------------------------------------------------------------

/// Round a currency amount to cents.
pub fn round_money(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn ensure_amount(field: &str, value: f64) -> StoreResult<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(StoreError::validation(format!(
            "{field} must be a non-negative amount (got {value})"
        )));
    }
    Ok(())
}

fn ensure_text(field: &str, value: &str) -> StoreResult<()> {
    if value.trim().is_empty() {
        return Err(StoreError::validation(format!("{field} is required")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Products
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub name: String,
    pub price: f64,
    pub stock: u32,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

/// Product fields supplied by the caller; the backend assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProduct {
    pub name: String,
    pub price: f64,
    pub stock: u32,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl NewProduct {
    pub fn new(name: &str, price: f64, stock: u32, category: &str) -> Self {
        Self {
            name: name.trim().to_string(),
            price,
            stock,
            category: category.trim().to_string(),
            image_url: None,
            description: None,
            is_active: true,
        }
    }

    pub fn validate(&self) -> StoreResult<()> {
        ensure_text("name", &self.name)?;
        ensure_text("category", &self.category)?;
        ensure_amount("price", self.price)
    }

    pub fn into_product(self, id: String, now: DateTime<Utc>) -> Product {
        Product {
            id,
            name: self.name,
            price: self.price,
            stock: self.stock,
            category: self.category,
            image_url: self.image_url,
            description: self.description,
            is_active: self.is_active,
            created_at: now,
            updated_at: now,
        }
    }
}

impl From<&Product> for NewProduct {
    fn from(p: &Product) -> Self {
        Self {
            name: p.name.clone(),
            price: p.price,
            stock: p.stock,
            category: p.category.clone(),
            image_url: p.image_url.clone(),
            description: p.description.clone(),
            is_active: p.is_active,
        }
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Completed,
    Pending,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Pending => "pending",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "completed" => Ok(Self::Completed),
            "pending" => Ok(Self::Pending),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(format!("Unknown transaction status: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleItem {
    #[serde(alias = "product_id")]
    pub product_id: String,
    #[serde(alias = "product_name")]
    pub product_name: String,
    pub quantity: u32,
    pub price: f64,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleDetails {
    pub items: Vec<SaleItem>,
    pub total_amount: f64,
    pub amount_paid: f64,
    pub change: f64,
    pub payment_method: String,
    #[serde(default)]
    pub is_voice_transaction: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_input: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseDetails {
    pub description: String,
    pub amount: f64,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Sale or expense payload, tagged by `type` in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransactionDetails {
    Sale(SaleDetails),
    Expense(ExpenseDetails),
}

impl TransactionDetails {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sale(_) => "sale",
            Self::Expense(_) => "expense",
        }
    }

    /// Check the per-type invariants. A stored sale never has negative change.
    pub fn validate(&self) -> StoreResult<()> {
        match self {
            Self::Sale(sale) => {
                if sale.items.is_empty() {
                    return Err(StoreError::validation("sale has no items"));
                }
                let mut sum = 0.0;
                for item in &sale.items {
                    ensure_text("productId", &item.product_id)?;
                    if item.quantity == 0 {
                        return Err(StoreError::validation(format!(
                            "quantity for {} must be greater than zero",
                            item.product_name
                        )));
                    }
                    ensure_amount("price", item.price)?;
                    sum += item.total;
                }
                ensure_amount("amountPaid", sale.amount_paid)?;
                if (round_money(sum) - sale.total_amount).abs() > 0.005 {
                    return Err(StoreError::validation(format!(
                        "totalAmount {} does not match item totals {}",
                        sale.total_amount,
                        round_money(sum)
                    )));
                }
                if sale.amount_paid + 0.005 < sale.total_amount {
                    return Err(StoreError::validation(format!(
                        "insufficient payment: paid {} of {}",
                        sale.amount_paid, sale.total_amount
                    )));
                }
                if sale.change < 0.0 {
                    return Err(StoreError::validation("change cannot be negative"));
                }
                ensure_text("paymentMethod", &sale.payment_method)
            }
            Self::Expense(expense) => {
                ensure_text("description", &expense.description)?;
                ensure_text("category", &expense.category)?;
                ensure_amount("amount", expense.amount)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub worker_id: String,
    pub worker_email: String,
    pub timestamp: DateTime<Utc>,
    pub status: TransactionStatus,
    #[serde(flatten)]
    pub details: TransactionDetails,
}

/// One cart line as entered at the till, before totals are computed.
#[derive(Debug, Clone, PartialEq)]
pub struct SaleLine {
    pub product_id: String,
    pub product_name: String,
    pub quantity: u32,
    pub price: f64,
}

impl SaleLine {
    pub fn new(product_id: &str, product_name: &str, quantity: u32, price: f64) -> Self {
        Self {
            product_id: product_id.to_string(),
            product_name: product_name.to_string(),
            quantity,
            price,
        }
    }
}

/// Transaction fields supplied by the caller; the backend assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTransaction {
    pub worker_id: String,
    pub worker_email: String,
    pub status: TransactionStatus,
    #[serde(flatten)]
    pub details: TransactionDetails,
}

impl NewTransaction {
    /// Build a completed sale, computing line totals, the grand total and change.
    /// Rejects an insufficient payment before anything is persisted.
    pub fn sale(
        worker_id: &str,
        worker_email: &str,
        lines: Vec<SaleLine>,
        amount_paid: f64,
        payment_method: &str,
    ) -> StoreResult<Self> {
        let items: Vec<SaleItem> = lines
            .into_iter()
            .map(|line| SaleItem {
                total: round_money(line.price * f64::from(line.quantity)),
                product_id: line.product_id,
                product_name: line.product_name,
                quantity: line.quantity,
                price: line.price,
            })
            .collect();
        let total_amount = round_money(items.iter().map(|i| i.total).sum());
        let change = round_money(amount_paid - total_amount);

        let tx = Self {
            worker_id: worker_id.to_string(),
            worker_email: worker_email.to_string(),
            status: TransactionStatus::Completed,
            details: TransactionDetails::Sale(SaleDetails {
                items,
                total_amount,
                amount_paid,
                change: change.max(0.0),
                payment_method: payment_method.to_string(),
                is_voice_transaction: false,
                voice_input: None,
            }),
        };
        if change < 0.0 {
            return Err(StoreError::validation(format!(
                "insufficient payment: paid {amount_paid} of {total_amount}"
            )));
        }
        tx.validate()?;
        Ok(tx)
    }

    pub fn expense(
        worker_id: &str,
        worker_email: &str,
        description: &str,
        amount: f64,
        category: &str,
        notes: Option<&str>,
    ) -> StoreResult<Self> {
        let tx = Self {
            worker_id: worker_id.to_string(),
            worker_email: worker_email.to_string(),
            status: TransactionStatus::Completed,
            details: TransactionDetails::Expense(ExpenseDetails {
                description: description.trim().to_string(),
                amount: round_money(amount),
                category: category.trim().to_string(),
                notes: notes.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
            }),
        };
        tx.validate()?;
        Ok(tx)
    }

    /// Mark a sale as captured through voice input.
    pub fn with_voice_input(mut self, transcript: &str) -> Self {
        if let TransactionDetails::Sale(sale) = &mut self.details {
            sale.is_voice_transaction = true;
            sale.voice_input = Some(transcript.to_string());
        }
        self
    }

    pub fn validate(&self) -> StoreResult<()> {
        ensure_text("workerId", &self.worker_id)?;
        self.details.validate()
    }

    pub fn into_transaction(self, id: String, now: DateTime<Utc>) -> Transaction {
        Transaction {
            id,
            worker_id: self.worker_id,
            worker_email: self.worker_email,
            timestamp: now,
            status: self.status,
            details: self.details,
        }
    }
}

impl From<&Transaction> for NewTransaction {
    fn from(t: &Transaction) -> Self {
        Self {
            worker_id: t.worker_id.clone(),
            worker_email: t.worker_email.clone(),
            status: t.status,
            details: t.details.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Owner,
    Worker,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub role: UserRole,
}
