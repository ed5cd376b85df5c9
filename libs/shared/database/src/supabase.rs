use async_trait::async_trait;
use reqwest::{
    Client,
    header::{HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION},
    Method, StatusCode,
};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use shared_config::AppConfig;
use shared_models::AppError;

use crate::store::{
    Collection, Direction, Document, DocumentStore, FieldValue, Fields, Filter, Query,
    StoreResult, Subscription,
};

/// `DocumentStore` over a hosted PostgREST endpoint. Each collection is a
/// table whose columns carry the document field names.
#[derive(Clone)]
pub struct SupabaseStore {
    client: Client,
    base_url: String,
    anon_key: String,
    access_token: Option<String>,
    poll_interval: Duration,
}

impl SupabaseStore {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.supabase_url.trim_end_matches('/').to_string(),
            anon_key: config.supabase_anon_key.clone(),
            access_token: config.supabase_access_token.clone(),
            poll_interval: config.listener_poll_interval(),
        }
    }

    fn get_headers(&self) -> StoreResult<HeaderMap> {
        let mut headers = HeaderMap::new();

        headers.insert("apikey", header_value(&self.anon_key)?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("Prefer", HeaderValue::from_static("return=representation"));

        let token = self.access_token.as_deref().unwrap_or(&self.anon_key);
        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", token))?);

        Ok(headers)
    }

    fn table_url(&self, collection: Collection) -> String {
        format!("{}/rest/v1/{}", self.base_url, collection.as_str())
    }

    async fn request(
        &self,
        method: Method,
        collection: Collection,
        params: &[(String, String)],
        body: Option<Value>,
    ) -> StoreResult<Vec<Map<String, Value>>> {
        let url = self.table_url(collection);
        debug!("Making {} request to {}", method, url);

        let mut req = self
            .client
            .request(method, &url)
            .headers(self.get_headers()?)
            .query(params);

        if let Some(body_data) = body {
            req = req.json(&body_data);
        }

        let response = req
            .send()
            .await
            .map_err(|e| AppError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("API error ({}): {}", status, error_text);
            return Err(map_status(status, error_text));
        }

        response
            .json::<Vec<Map<String, Value>>>()
            .await
            .map_err(|e| AppError::Serialization(e.to_string()))
    }
}

fn header_value(raw: &str) -> StoreResult<HeaderValue> {
    HeaderValue::from_str(raw).map_err(|e| AppError::Internal(format!("invalid header value: {}", e)))
}

fn map_status(status: StatusCode, error_text: String) -> AppError {
    match status.as_u16() {
        401 | 403 => AppError::PermissionDenied(error_text),
        404 => AppError::NotFound(error_text),
        409 => AppError::Conflict(error_text),
        408 | 429 | 502 | 503 | 504 => AppError::Network(format!("({}) {}", status, error_text)),
        _ => AppError::Database(format!("API error ({}): {}", status, error_text)),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_quoted(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{}\"", s.replace('"', "\\\"")),
        other => other.to_string(),
    }
}

/// PostgREST query-string parameters for `query`.
pub fn query_params(query: &Query) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = query
        .filters
        .iter()
        .map(|filter| {
            let expression = match filter {
                Filter::Eq(_, v) => format!("eq.{}", render(v)),
                Filter::In(_, values) => format!(
                    "in.({})",
                    values.iter().map(render_quoted).collect::<Vec<_>>().join(",")
                ),
                Filter::Gt(_, v) => format!("gt.{}", render(v)),
                Filter::Lt(_, v) => format!("lt.{}", render(v)),
            };
            (filter.field().to_string(), expression)
        })
        .collect();

    if let Some(order) = &query.order_by {
        let direction = match order.direction {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        };
        params.push(("order".to_string(), format!("{}.{},id.{}", order.field, direction, direction)));
    }
    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    params
}

/// Request body for a write. Server timestamps become Postgres' `now`.
fn write_body(fields: Fields) -> Value {
    let body: Map<String, Value> = fields
        .iter()
        .map(|(key, value)| {
            let value = match value {
                FieldValue::Value(v) => v.clone(),
                FieldValue::ServerTimestamp => Value::String("now".to_string()),
            };
            (key.clone(), value)
        })
        .collect();
    Value::Object(body)
}

fn row_to_document(mut row: Map<String, Value>) -> StoreResult<Document> {
    let id = match row.remove("id") {
        Some(Value::String(id)) => id,
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(AppError::Serialization("row without id".to_string())),
    };
    Ok(Document::new(id, row))
}

#[async_trait]
impl DocumentStore for SupabaseStore {
    async fn query(&self, query: &Query) -> StoreResult<Vec<Document>> {
        let rows = self
            .request(Method::GET, query.collection, &query_params(query), None)
            .await?;
        rows.into_iter().map(row_to_document).collect()
    }

    async fn subscribe(&self, query: Query) -> StoreResult<Subscription> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let store = self.clone();
        let interval = self.poll_interval;

        // PostgREST has no push channel, so changes are detected by polling.
        let handle = tokio::spawn(async move {
            let mut last: Option<Vec<Document>> = None;
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match store.query(&query).await {
                    Ok(documents) => {
                        if last.as_ref() == Some(&documents) {
                            continue;
                        }
                        if sender.send(Ok(documents.clone())).is_err() {
                            break;
                        }
                        last = Some(documents);
                    }
                    Err(e) => {
                        warn!("Polling {} failed: {}", query.collection, e);
                        if sender.send(Err(e)).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Subscription::new(receiver, move || handle.abort()))
    }

    async fn create(&self, collection: Collection, fields: Fields) -> StoreResult<String> {
        let rows = self
            .request(Method::POST, collection, &[], Some(write_body(fields)))
            .await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Database(format!("insert into {} returned no row", collection)))?;
        Ok(row_to_document(row)?.id)
    }

    async fn update(&self, collection: Collection, id: &str, fields: Fields) -> StoreResult<()> {
        let params = [("id".to_string(), format!("eq.{}", id))];
        let rows = self
            .request(Method::PATCH, collection, &params, Some(write_body(fields)))
            .await?;
        if rows.is_empty() {
            return Err(AppError::NotFound(format!("{}/{}", collection, id)));
        }
        Ok(())
    }

    async fn get(&self, collection: Collection, id: &str) -> StoreResult<Option<Document>> {
        let params = [
            ("id".to_string(), format!("eq.{}", id)),
            ("limit".to_string(), "1".to_string()),
        ];
        let rows = self.request(Method::GET, collection, &params, None).await?;
        rows.into_iter().next().map(row_to_document).transpose()
    }
}
