//! Live warehouse sources

use super::LiveSource;
use crate::error::{AnalyticsError, TransportKind};
use crate::models::{QuerySpec, Row};
use crate::Result;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error};

#[derive(Debug, Deserialize)]
struct WarehouseResponse {
    #[serde(default)]
    rows: Vec<Row>,
}

/// Warehouse gateway reached over HTTP.
///
/// POSTs the query spec to `{base}/api/v1/warehouse/query` and expects
/// `{"rows": [...]}` back.
#[derive(Clone)]
pub struct HttpWarehouseSource {
    client: Client,
    base_url: String,
}

impl HttpWarehouseSource {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn classify_request_error(e: reqwest::Error) -> AnalyticsError {
    let kind = if e.is_timeout() {
        TransportKind::Timeout
    } else {
        TransportKind::Network
    };
    AnalyticsError::transport(kind, format!("warehouse request failed: {}", e))
}

#[async_trait::async_trait]
impl LiveSource for HttpWarehouseSource {
    fn name(&self) -> &str {
        "warehouse"
    }

    async fn execute(&self, query: &QuerySpec) -> Result<Vec<Row>> {
        let url = format!("{}/api/v1/warehouse/query", self.base_url);
        debug!(url = %url, query = %query, "Querying warehouse");

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&json!({ "query": query }))
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AnalyticsError::transport(
                TransportKind::Auth,
                format!("warehouse returned {}", status),
            ));
        }

        if status.is_server_error() {
            return Err(AnalyticsError::transport(
                TransportKind::Network,
                format!("warehouse returned {}", status),
            ));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, "Warehouse rejected query: {}", body);
            return Err(AnalyticsError::QueryRejected(format!("{}: {}", status, body)));
        }

        let parsed: WarehouseResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                classify_request_error(e)
            } else {
                AnalyticsError::HttpError(e)
            }
        })?;

        Ok(parsed.rows)
    }
}

/// Stand-in when no warehouse is configured; every call is a network failure.
#[derive(Debug, Clone, Default)]
pub struct DisconnectedSource;

#[async_trait::async_trait]
impl LiveSource for DisconnectedSource {
    fn name(&self) -> &str {
        "disconnected"
    }

    async fn execute(&self, _query: &QuerySpec) -> Result<Vec<Row>> {
        Err(AnalyticsError::transport(
            TransportKind::Network,
            "no live warehouse configured",
        ))
    }
}
