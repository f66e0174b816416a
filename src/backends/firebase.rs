//! Firestore adapter over the REST API.
//!
//! Firestore wraps every field in a typed envelope (`stringValue`,
//! `doubleValue`, `integerValue` as a string, `mapValue`, ...). This module
//! converts between those envelopes and plain JSON, then reuses the model's
//! camelCase serde shape, so Firestore field names never leak upward.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};

use super::http::{self, DEFAULT_TIMEOUT};
use super::rows::{PRODUCTS_TABLE, TRANSACTIONS_TABLE};
use super::BackendAdapter;
use crate::config::FirebaseConfig;
use crate::error::{StoreError, StoreResult};
use crate::model::{BackendKind, NewProduct, NewTransaction, Product, Transaction};

const KIND: BackendKind = BackendKind::Firebase;
const DEFAULT_ENDPOINT: &str = "https://firestore.googleapis.com/v1";
const PAGE_SIZE: &str = "300";

pub struct FirebaseBackend {
    documents_url: String,
    api_key: String,
    client: Client,
}

impl FirebaseBackend {
    pub fn new(config: &FirebaseConfig) -> StoreResult<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .map(http::normalize_base_url)
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        Ok(Self {
            documents_url: format!(
                "{endpoint}/projects/{}/databases/(default)/documents",
                config.project_id
            ),
            api_key: config.api_key.clone(),
            client: http::build_client(KIND, DEFAULT_TIMEOUT)?,
        })
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/{collection}", self.documents_url)
    }

    async fn list_documents<T: DeserializeOwned>(&self, collection: &str) -> StoreResult<Vec<T>> {
        let url = self.collection_url(collection);
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut req = self
                .client
                .get(&url)
                .query(&[("key", self.api_key.as_str()), ("pageSize", PAGE_SIZE)]);
            if let Some(token) = &page_token {
                req = req.query(&[("pageToken", token.as_str())]);
            }
            let body = http::send_json(KIND, &url, req).await?;
            if let Some(docs) = body.get("documents").and_then(Value::as_array) {
                for doc in docs {
                    out.push(http::decode(KIND, document_to_json(doc)?)?);
                }
            }
            page_token = body
                .get("nextPageToken")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            if page_token.is_none() {
                break;
            }
        }
        Ok(out)
    }

    async fn create_document<I: Serialize, T: DeserializeOwned>(
        &self,
        collection: &str,
        input: &I,
        timestamp_fields: &[&str],
    ) -> StoreResult<T> {
        let mut plain = serde_json::to_value(input)?;
        let now = Utc::now().to_rfc3339();
        if let Value::Object(obj) = &mut plain {
            for field in timestamp_fields {
                obj.insert((*field).to_string(), Value::String(now.clone()));
            }
        }
        let url = self.collection_url(collection);
        let req = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&json!({ "fields": json_to_fields(&plain) }));
        let body = http::send_json(KIND, &url, req).await?;
        http::decode(KIND, document_to_json(&body)?)
    }
}

#[async_trait]
impl BackendAdapter for FirebaseBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn health_check(&self) -> StoreResult<()> {
        let url = self.collection_url(PRODUCTS_TABLE);
        let req = self
            .client
            .get(&url)
            .query(&[("key", self.api_key.as_str()), ("pageSize", "1")]);
        http::send_ok(KIND, &url, req).await
    }

    async fn list_products(&self) -> StoreResult<Vec<Product>> {
        self.list_documents(PRODUCTS_TABLE).await
    }

    async fn create_product(&self, input: &NewProduct) -> StoreResult<Product> {
        self.create_document(PRODUCTS_TABLE, input, &["createdAt", "updatedAt"])
            .await
    }

    async fn list_transactions(&self) -> StoreResult<Vec<Transaction>> {
        self.list_documents(TRANSACTIONS_TABLE).await
    }

    async fn create_transaction(&self, input: &NewTransaction) -> StoreResult<Transaction> {
        self.create_document(TRANSACTIONS_TABLE, input, &["timestamp"])
            .await
    }
}

// ---------------------------------------------------------------------------
// Typed value conversion
// ---------------------------------------------------------------------------

/// Flatten a Firestore document into plain JSON with `id` taken from the
/// last segment of the document name.
fn document_to_json(doc: &Value) -> StoreResult<Value> {
    let name = doc
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::Backend {
            backend: KIND,
            status: None,
            message: "document without a name".to_string(),
        })?;
    let id = name.rsplit('/').next().unwrap_or(name).to_string();

    let mut obj = match doc.get("fields") {
        Some(Value::Object(fields)) => fields_to_json(fields),
        _ => Map::new(),
    };
    obj.insert("id".to_string(), Value::String(id));
    if !obj.contains_key("createdAt") {
        if let Some(created) = doc.get("createTime") {
            obj.insert("createdAt".to_string(), created.clone());
        }
    }
    if !obj.contains_key("updatedAt") {
        if let Some(updated) = doc.get("updateTime") {
            obj.insert("updatedAt".to_string(), updated.clone());
        }
    }
    Ok(Value::Object(obj))
}

fn fields_to_json(fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .map(|(k, v)| (k.clone(), from_typed(v)))
        .collect()
}

fn from_typed(v: &Value) -> Value {
    let Some(obj) = v.as_object() else {
        return Value::Null;
    };
    if let Some(s) = obj.get("stringValue") {
        return s.clone();
    }
    if let Some(t) = obj.get("timestampValue") {
        return t.clone();
    }
    if let Some(b) = obj.get("booleanValue") {
        return b.clone();
    }
    if let Some(d) = obj.get("doubleValue") {
        return d.clone();
    }
    if let Some(i) = obj.get("integerValue") {
        // int64 is transported as a decimal string
        return match i {
            Value::String(s) => s.parse::<i64>().map(Value::from).unwrap_or(Value::Null),
            other => other.clone(),
        };
    }
    if let Some(arr) = obj.get("arrayValue") {
        let values = arr
            .get("values")
            .and_then(Value::as_array)
            .map(|vals| vals.iter().map(from_typed).collect())
            .unwrap_or_default();
        return Value::Array(values);
    }
    if let Some(map) = obj.get("mapValue") {
        return match map.get("fields") {
            Some(Value::Object(fields)) => Value::Object(fields_to_json(fields)),
            _ => Value::Object(Map::new()),
        };
    }
    Value::Null
}

fn json_to_fields(plain: &Value) -> Value {
    match plain {
        Value::Object(obj) => Value::Object(
            obj.iter()
                .map(|(k, v)| (k.clone(), to_typed(v)))
                .collect(),
        ),
        _ => Value::Object(Map::new()),
    }
}

fn to_typed(v: &Value) -> Value {
    match v {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match n.as_i64() {
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64() }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => {
            json!({ "arrayValue": { "values": items.iter().map(to_typed).collect::<Vec<_>>() } })
        }
        Value::Object(_) => json!({ "mapValue": { "fields": json_to_fields(v) } }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SaleLine, TransactionDetails};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DOCS_PATH: &str = "/projects/charnoks-demo/databases/(default)/documents";

    fn backend(server: &MockServer) -> FirebaseBackend {
        FirebaseBackend::new(&FirebaseConfig {
            project_id: "charnoks-demo".into(),
            api_key: "web-key".into(),
            endpoint: Some(server.uri()),
        })
        .unwrap()
    }

    #[test]
    fn test_typed_values_roundtrip_through_plain_json() {
        let plain = json!({
            "name": "Soda",
            "price": 15.5,
            "stock": 50,
            "isActive": true,
            "imageUrl": null,
            "tags": ["cold", "can"],
            "meta": { "supplier": "Coke" }
        });
        let fields = json_to_fields(&plain);
        assert_eq!(fields["stock"], json!({ "integerValue": "50" }));
        assert_eq!(fields["price"], json!({ "doubleValue": 15.5 }));

        let back = Value::Object(fields_to_json(fields.as_object().unwrap()));
        assert_eq!(back, plain);
    }

    #[tokio::test]
    async fn test_list_products_follows_page_tokens() {
        let server = MockServer::start().await;
        let doc = |id: &str, name: &str| {
            json!({
                "name": format!("projects/charnoks-demo/databases/(default)/documents/products/{id}"),
                "fields": {
                    "name": { "stringValue": name },
                    "price": { "integerValue": "15" },
                    "stock": { "integerValue": "50" },
                    "category": { "stringValue": "Beverages" },
                    "isActive": { "booleanValue": true }
                },
                "createTime": "2026-05-01T10:00:00.000000Z",
                "updateTime": "2026-05-01T10:00:00.000000Z"
            })
        };
        Mock::given(method("GET"))
            .and(path(format!("{DOCS_PATH}/products")))
            .and(query_param("pageToken", "page-2"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "documents": [doc("b", "Juice")] })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{DOCS_PATH}/products")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "documents": [doc("a", "Soda")],
                "nextPageToken": "page-2"
            })))
            .mount(&server)
            .await;

        let products = backend(&server).list_products().await.unwrap();
        let names: Vec<_> = products.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Soda", "Juice"]);
        assert_eq!(products[0].id, "a");
        assert_eq!(products[0].price, 15.0);
    }

    #[tokio::test]
    async fn test_create_transaction_decodes_nested_items() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{DOCS_PATH}/transactions")))
            .and(query_param("key", "web-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "projects/charnoks-demo/databases/(default)/documents/transactions/tx1",
                "fields": {
                    "type": { "stringValue": "sale" },
                    "workerId": { "stringValue": "w-1" },
                    "workerEmail": { "stringValue": "w@shop.test" },
                    "timestamp": { "timestampValue": "2026-05-01T10:00:00Z" },
                    "status": { "stringValue": "completed" },
                    "items": { "arrayValue": { "values": [{ "mapValue": { "fields": {
                        "productId": { "stringValue": "a" },
                        "productName": { "stringValue": "Soda" },
                        "quantity": { "integerValue": "2" },
                        "price": { "integerValue": "15" },
                        "total": { "integerValue": "30" }
                    }}}]}},
                    "totalAmount": { "integerValue": "30" },
                    "amountPaid": { "integerValue": "50" },
                    "change": { "integerValue": "20" },
                    "paymentMethod": { "stringValue": "cash" },
                    "isVoiceTransaction": { "booleanValue": false }
                }
            })))
            .mount(&server)
            .await;

        let input = NewTransaction::sale(
            "w-1",
            "w@shop.test",
            vec![SaleLine::new("a", "Soda", 2, 15.0)],
            50.0,
            "cash",
        )
        .unwrap();
        let tx = backend(&server).create_transaction(&input).await.unwrap();
        assert_eq!(tx.id, "tx1");
        let TransactionDetails::Sale(sale) = &tx.details else {
            panic!("expected sale");
        };
        assert_eq!(sale.items[0].quantity, 2);
        assert_eq!(sale.change, 20.0);
    }

    #[tokio::test]
    async fn test_permission_denied_is_connectivity() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{DOCS_PATH}/products")))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error": { "code": 403, "message": "Missing or insufficient permissions.", "status": "PERMISSION_DENIED" }
            })))
            .mount(&server)
            .await;

        let err = backend(&server)
            .create_product(&NewProduct::new("Soda", 15.0, 50, "Beverages"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Connectivity { .. }), "got {err:?}");
        assert!(err.to_string().contains("insufficient permissions"));
    }
}
