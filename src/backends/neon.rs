//! Adapter for the Postgres (Neon) REST API.
//!
//! The API exposes `GET /health`, and `GET`/`POST` on `/api/products` and
//! `/api/transactions`, speaking snake_case Postgres rows either bare or
//! wrapped in `{ "data": ... }`.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;

use super::http::{self, DEFAULT_TIMEOUT};
use super::rows::{
    first_row, unwrap_rows, ProductRow, TransactionRow, PRODUCTS_TABLE, TRANSACTIONS_TABLE,
};
use super::BackendAdapter;
use crate::config::NeonConfig;
use crate::error::{StoreError, StoreResult};
use crate::model::{BackendKind, NewProduct, NewTransaction, Product, Transaction};

const KIND: BackendKind = BackendKind::Neon;

pub struct NeonBackend {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl NeonBackend {
    pub fn new(config: &NeonConfig) -> StoreResult<Self> {
        Ok(Self {
            base_url: http::normalize_base_url(&config.api_url),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            client: http::build_client(KIND, DEFAULT_TIMEOUT)?,
        })
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn get_rows(&self, resource: &str) -> StoreResult<Vec<Value>> {
        let url = format!("{}/api/{resource}", self.base_url);
        let req = self.authed(self.client.get(&url));
        let body = http::send_json(KIND, &url, req).await?;
        http::decode(KIND, unwrap_rows(body))
    }

    async fn post_row(&self, resource: &str, row: Value) -> StoreResult<Value> {
        let url = format!("{}/api/{resource}", self.base_url);
        let req = self.authed(self.client.post(&url).json(&row));
        let body = http::send_json(KIND, &url, req).await?;
        first_row(body).ok_or_else(|| StoreError::Backend {
            backend: KIND,
            status: None,
            message: format!("POST /api/{resource} returned no row"),
        })
    }
}

#[async_trait]
impl BackendAdapter for NeonBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn health_check(&self) -> StoreResult<()> {
        let url = format!("{}/health", self.base_url);
        http::send_ok(KIND, &url, self.authed(self.client.get(&url))).await
    }

    async fn list_products(&self) -> StoreResult<Vec<Product>> {
        self.get_rows(PRODUCTS_TABLE)
            .await?
            .into_iter()
            .map(|v| http::decode::<ProductRow>(KIND, v)?.into_product(KIND))
            .collect()
    }

    async fn create_product(&self, input: &NewProduct) -> StoreResult<Product> {
        let row = serde_json::to_value(ProductRow::from_new(input, Utc::now()))?;
        let created = self.post_row(PRODUCTS_TABLE, row).await?;
        http::decode::<ProductRow>(KIND, created)?.into_product(KIND)
    }

    async fn list_transactions(&self) -> StoreResult<Vec<Transaction>> {
        self.get_rows(TRANSACTIONS_TABLE)
            .await?
            .into_iter()
            .map(|v| http::decode::<TransactionRow>(KIND, v)?.into_transaction(KIND))
            .collect()
    }

    async fn create_transaction(&self, input: &NewTransaction) -> StoreResult<Transaction> {
        let row = serde_json::to_value(TransactionRow::from_new(input, Utc::now()))?;
        let created = self.post_row(TRANSACTIONS_TABLE, row).await?;
        http::decode::<TransactionRow>(KIND, created)?.into_transaction(KIND)
    }
}
