//! Supabase adapter over the PostgREST endpoint (`/rest/v1/<table>`).

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;

use super::http::{self, DEFAULT_TIMEOUT};
use super::rows::{first_row, ProductRow, TransactionRow, PRODUCTS_TABLE, TRANSACTIONS_TABLE};
use super::BackendAdapter;
use crate::config::SupabaseConfig;
use crate::error::{StoreError, StoreResult};
use crate::model::{BackendKind, NewProduct, NewTransaction, Product, Transaction};

const KIND: BackendKind = BackendKind::Supabase;

pub struct SupabaseBackend {
    base_url: String,
    anon_key: String,
    client: Client,
}

impl SupabaseBackend {
    pub fn new(config: &SupabaseConfig) -> StoreResult<Self> {
        Ok(Self {
            base_url: http::normalize_base_url(&config.url),
            anon_key: config.anon_key.clone(),
            client: http::build_client(KIND, DEFAULT_TIMEOUT)?,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", self.anon_key))
            .header("Content-Type", "application/json")
    }

    async fn select(&self, table: &str, order: &str) -> StoreResult<Vec<Value>> {
        let url = self.table_url(table);
        let req = self
            .client
            .get(&url)
            .query(&[("select", "*"), ("order", order)]);
        let body = http::send_json(KIND, &url, self.authed(req)).await?;
        http::decode(KIND, body)
    }

    async fn insert(&self, table: &str, row: Value) -> StoreResult<Value> {
        let url = self.table_url(table);
        let req = self
            .client
            .post(&url)
            .header("Prefer", "return=representation")
            .json(&row);
        let body = http::send_json(KIND, &url, self.authed(req)).await?;
        first_row(body).ok_or_else(|| StoreError::Backend {
            backend: KIND,
            status: None,
            message: format!("insert into {table} returned no row"),
        })
    }
}

#[async_trait]
impl BackendAdapter for SupabaseBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn health_check(&self) -> StoreResult<()> {
        let url = self.table_url(PRODUCTS_TABLE);
        let req = self
            .client
            .get(&url)
            .query(&[("select", "id"), ("limit", "1")]);
        http::send_ok(KIND, &url, self.authed(req)).await
    }

    async fn list_products(&self) -> StoreResult<Vec<Product>> {
        self.select(PRODUCTS_TABLE, "created_at.desc")
            .await?
            .into_iter()
            .map(|v| http::decode::<ProductRow>(KIND, v)?.into_product(KIND))
            .collect()
    }

    async fn create_product(&self, input: &NewProduct) -> StoreResult<Product> {
        let row = serde_json::to_value(ProductRow::from_new(input, Utc::now()))?;
        let created = self.insert(PRODUCTS_TABLE, row).await?;
        http::decode::<ProductRow>(KIND, created)?.into_product(KIND)
    }

    async fn list_transactions(&self) -> StoreResult<Vec<Transaction>> {
        self.select(TRANSACTIONS_TABLE, "timestamp.desc")
            .await?
            .into_iter()
            .map(|v| http::decode::<TransactionRow>(KIND, v)?.into_transaction(KIND))
            .collect()
    }

    async fn create_transaction(&self, input: &NewTransaction) -> StoreResult<Transaction> {
        let row = serde_json::to_value(TransactionRow::from_new(input, Utc::now()))?;
        let created = self.insert(TRANSACTIONS_TABLE, row).await?;
        http::decode::<TransactionRow>(KIND, created)?.into_transaction(KIND)
    }
}
