//! BigQuery streaming inserts through the `tabledata.insertAll` REST call.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::BigQueryConfig;
use crate::error::{ConfigError, WarehouseError};

use super::auth::{TokenSource, token_source};
use super::{InsertResponse, RowError, TableRef, Warehouse, WarehouseRow, is_retryable};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllRequest<'a> {
    kind: &'static str,
    skip_invalid_rows: bool,
    ignore_unknown_values: bool,
    rows: Vec<InsertAllRow<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllRow<'a> {
    insert_id: &'a str,
    json: &'a Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllResponse {
    #[serde(default)]
    insert_errors: Vec<InsertErrors>,
}

#[derive(Debug, Deserialize)]
struct InsertErrors {
    index: usize,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: ErrorBody,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Clone)]
pub struct BigQueryWarehouse {
    client: reqwest::Client,
    endpoint: String,
    tokens: Arc<dyn TokenSource>,
    skip_invalid_rows: bool,
    ignore_unknown_values: bool,
}

impl BigQueryWarehouse {
    pub fn new(config: &BigQueryConfig) -> Result<Self, ConfigError> {
        Self::with_token_source(config, token_source(config)?)
    }

    pub fn with_token_source(
        config: &BigQueryConfig,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ConfigError::ConfigInvalid {
                name: "sink.bigquery".to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            tokens,
            skip_invalid_rows: config.skip_invalid_rows,
            ignore_unknown_values: config.ignore_unknown_values,
        })
    }

    fn url(&self, table: &TableRef) -> String {
        format!(
            "{}/bigquery/v2/projects/{}/datasets/{}/tables/{}/insertAll",
            self.endpoint, table.project_id, table.dataset, table.table
        )
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn insert_rows(
        &self,
        table: &TableRef,
        rows: &[WarehouseRow],
    ) -> Result<InsertResponse, WarehouseError> {
        let request = InsertAllRequest {
            kind: "bigquery#tableDataInsertAllRequest",
            skip_invalid_rows: self.skip_invalid_rows,
            ignore_unknown_values: self.ignore_unknown_values,
            rows: rows
                .iter()
                .map(|row| InsertAllRow {
                    insert_id: &row.insert_id,
                    json: &row.json,
                })
                .collect(),
        };

        // An expired or revoked token gets one refresh before the call fails.
        let mut refreshed = false;
        let response = loop {
            let mut builder = self.client.post(self.url(table)).json(&request);
            if let Some(token) = self.tokens.token().await? {
                builder = builder.bearer_auth(token);
            }

            let response = builder.send().await.map_err(request_error)?;
            if response.status() != StatusCode::UNAUTHORIZED || refreshed {
                break response;
            }
            if !self.tokens.refresh().await? {
                break response;
            }
            warn!("[sink] Token rejected for {}, retrying with fresh credentials", table);
            refreshed = true;
        };
        let status = response.status();

        if status.is_success() {
            let body: InsertAllResponse = response.json().await.map_err(request_error)?;
            debug!(
                "insertAll into {}: {} rows, {} with errors",
                table,
                rows.len(),
                body.insert_errors.len()
            );
            return Ok(InsertResponse {
                row_errors: row_errors(body),
            });
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

/// Flatten the per-row error lists into one error per reported problem.
fn row_errors(body: InsertAllResponse) -> Vec<RowError> {
    body.insert_errors
        .into_iter()
        .flat_map(|entry| {
            let index = entry.index;
            let errors = if entry.errors.is_empty() {
                vec![ErrorProto::default()]
            } else {
                entry.errors
            };
            errors
                .into_iter()
                .map(move |e| RowError::new(index, e.reason, e.message))
        })
        .collect()
}

fn request_error(e: reqwest::Error) -> WarehouseError {
    if e.is_builder() {
        WarehouseError::WarehousePermanent {
            message: e.to_string(),
        }
    } else {
        WarehouseError::WarehouseTransient {
            message: e.to_string(),
        }
    }
}

fn classify_status(status: StatusCode, body: &str) -> WarehouseError {
    let envelope: ErrorEnvelope = serde_json::from_str(body).unwrap_or_default();
    let message = if envelope.error.message.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {}", envelope.error.message)
    };

    let retryable_reason = envelope
        .error
        .errors
        .iter()
        .any(|e| is_retryable(&e.reason, &e.message));

    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
        || retryable_reason
    {
        WarehouseError::WarehouseTransient { message }
    } else {
        WarehouseError::WarehousePermanent { message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BigQueryAuth;
    use axum::Router;
    use axum::http::HeaderMap;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Hands out "stale" until refreshed, "fresh" afterwards.
    #[derive(Debug, Default)]
    struct RotatingToken {
        refreshes: AtomicUsize,
    }

    #[async_trait]
    impl TokenSource for RotatingToken {
        async fn token(&self) -> Result<Option<String>, WarehouseError> {
            let token = match self.refreshes.load(Ordering::SeqCst) {
                0 => "stale",
                _ => "fresh",
            };
            Ok(Some(token.to_string()))
        }

        async fn refresh(&self) -> Result<bool, WarehouseError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    /// Serve insertAll, accepting only `accepted` as bearer token.
    async fn serve(accepted: &'static str) -> String {
        let expected = format!("Bearer {accepted}");
        let router = Router::new().fallback(move |headers: HeaderMap| {
            let expected = expected.clone();
            async move {
                let authorized = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|v| v == expected);
                if authorized {
                    (
                        StatusCode::OK,
                        r#"{"kind": "bigquery#tableDataInsertAllResponse"}"#,
                    )
                } else {
                    (
                        StatusCode::UNAUTHORIZED,
                        r#"{"error": {"code": 401, "message": "Request had invalid authentication credentials."}}"#,
                    )
                }
            }
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{addr}")
    }

    fn rows() -> Vec<WarehouseRow> {
        let record = crate::source::Record {
            partition: 0,
            offset: 7,
            key: None,
            value: bytes::Bytes::from_static(br#"{"id": "a1"}"#),
            timestamp: Utc::now(),
        };
        vec![crate::sink::to_row("events", &record, Utc::now())]
    }

    fn table() -> TableRef {
        TableRef {
            project_id: "proj".to_string(),
            dataset: "ds".to_string(),
            table: "events".to_string(),
        }
    }

    #[tokio::test]
    async fn test_rejected_token_is_refreshed_once() {
        let config = BigQueryConfig {
            endpoint: serve("fresh").await,
            ..BigQueryConfig::default()
        };
        let tokens = Arc::new(RotatingToken::default());
        let warehouse = BigQueryWarehouse::with_token_source(&config, tokens.clone()).unwrap();

        let response = warehouse.insert_rows(&table(), &rows()).await.unwrap();
        assert!(response.row_errors.is_empty());
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_token_rejected_after_refresh_is_permanent() {
        let config = BigQueryConfig {
            endpoint: serve("never-issued").await,
            ..BigQueryConfig::default()
        };
        let tokens = Arc::new(RotatingToken::default());
        let warehouse = BigQueryWarehouse::with_token_source(&config, tokens.clone()).unwrap();

        let err = warehouse.insert_rows(&table(), &rows()).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("invalid authentication credentials"));
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_request_body_shape() {
        let mut json = Map::new();
        json.insert("id".to_string(), Value::from("a1"));
        let request = InsertAllRequest {
            kind: "bigquery#tableDataInsertAllRequest",
            skip_invalid_rows: true,
            ignore_unknown_values: false,
            rows: vec![InsertAllRow {
                insert_id: "events-0-1",
                json: &json,
            }],
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["skipInvalidRows"], true);
        assert_eq!(value["rows"][0]["insertId"], "events-0-1");
        assert_eq!(value["rows"][0]["json"]["id"], "a1");
    }

    #[test]
    fn test_row_errors_are_classified() {
        let body: InsertAllResponse = serde_json::from_str(
            r#"{
                "kind": "bigquery#tableDataInsertAllResponse",
                "insertErrors": [
                    {"index": 0, "errors": [{"reason": "invalid", "message": "no such field: foo"}]},
                    {"index": 3, "errors": [{"reason": "stopped", "message": ""}]}
                ]
            }"#,
        )
        .unwrap();

        let errors = row_errors(body);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].index, 0);
        assert!(!errors[0].retryable);
        assert_eq!(errors[1].index, 3);
        assert!(errors[1].retryable);
    }

    #[test]
    fn test_empty_response_has_no_errors() {
        let body: InsertAllResponse =
            serde_json::from_str(r#"{"kind": "bigquery#tableDataInsertAllResponse"}"#).unwrap();
        assert!(row_errors(body).is_empty());
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(!classify_status(StatusCode::NOT_FOUND, "").is_transient());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, "").is_transient());

        let quota = r#"{"error": {"code": 403, "message": "Exceeded rate limits",
            "errors": [{"reason": "rateLimitExceeded", "message": "Exceeded rate limits"}]}}"#;
        let err = classify_status(StatusCode::FORBIDDEN, quota);
        assert!(err.is_transient());
        assert!(err.to_string().contains("Exceeded rate limits"));
    }

    #[test]
    fn test_url_layout() {
        let warehouse = BigQueryWarehouse::new(&BigQueryConfig {
            endpoint: "http://localhost:9050/".to_string(),
            auth: BigQueryAuth::None,
            ..BigQueryConfig::default()
        })
        .unwrap();
        let table = TableRef {
            project_id: "proj".to_string(),
            dataset: "ds".to_string(),
            table: "events".to_string(),
        };
        assert_eq!(
            warehouse.url(&table),
            "http://localhost:9050/bigquery/v2/projects/proj/datasets/ds/tables/events/insertAll"
        );
    }
}
