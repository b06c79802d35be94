//! Data source resolution
//!
//! Every query is tried against the live warehouse first. Transport failures
//! get one bounded retry; after that, or when the warehouse answers with
//! nothing for a query that needs data, the static fallback dataset is
//! consulted. The result always says which source produced it.

pub mod fallback;
pub mod live;

pub use fallback::{FallbackDataset, FallbackSource};
pub use live::{DisconnectedSource, HttpWarehouseSource};

use crate::error::{AnalyticsError, TransportKind};
use crate::models::{FallbackReason, Payload, QuerySpec, ResolvedResult, Row, Subject};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Queryable warehouse behind the resolver.
#[async_trait::async_trait]
pub trait LiveSource: Send + Sync {
    fn name(&self) -> &str {
        "live"
    }

    /// Rows matching the query. An empty vector is a successful answer.
    async fn execute(&self, query: &QuerySpec) -> Result<Vec<Row>>;
}

#[derive(Debug, Clone, Copy)]
pub struct ResolverPolicy {
    /// Upper bound on each live attempt.
    pub timeout: Duration,
    /// Pause before the single retry.
    pub retry_delay: Duration,
}

impl Default for ResolverPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retry_delay: Duration::from_millis(500),
        }
    }
}

pub struct DataSourceResolver {
    live: Arc<dyn LiveSource>,
    fallback: Arc<dyn FallbackSource>,
    policy: ResolverPolicy,
}

impl DataSourceResolver {
    pub fn new(
        live: Arc<dyn LiveSource>,
        fallback: Arc<dyn FallbackSource>,
        policy: ResolverPolicy,
    ) -> Self {
        Self {
            live,
            fallback,
            policy,
        }
    }

    pub fn policy(&self) -> ResolverPolicy {
        self.policy
    }

    /// Resolve a query to exactly one tagged result.
    pub async fn resolve(&self, query: &QuerySpec) -> Result<ResolvedResult> {
        let reason = match self.query_live(query).await {
            Ok(rows) if !rows.is_empty() || query.empty_is_valid => {
                let payload = live_payload(query, rows)?;
                info!(
                    source = self.live.name(),
                    query = %query,
                    rows = payload.row_count(),
                    "Resolved from live source"
                );
                return Ok(ResolvedResult::live(query.clone(), payload));
            }
            Ok(_) => {
                warn!(query = %query, "Live source returned no rows for a query that requires data");
                FallbackReason::ScenarioNotPresent
            }
            Err(e) if e.is_transport() => {
                warn!(query = %query, error = %e, "Live source exhausted");
                FallbackReason::SourceUnavailable
            }
            Err(e) => return Err(e),
        };

        match self.fallback.lookup(query) {
            Some(payload) if !payload.is_empty() => {
                info!(
                    query = %query,
                    reason = reason.as_str(),
                    rows = payload.row_count(),
                    "Resolved from fallback dataset"
                );
                Ok(ResolvedResult::fallback(query.clone(), payload, reason))
            }
            _ => {
                warn!(query = %query, "No source could answer");
                Err(AnalyticsError::NoData {
                    query: query.to_string(),
                })
            }
        }
    }

    /// One attempt, plus one retry after a transport failure.
    async fn query_live(&self, query: &QuerySpec) -> Result<Vec<Row>> {
        match self.attempt(query, 1).await {
            Err(e) if e.is_transport() => {
                debug!(
                    delay_ms = self.policy.retry_delay.as_millis() as u64,
                    error = %e,
                    "Retrying live source"
                );
                tokio::time::sleep(self.policy.retry_delay).await;
                self.attempt(query, 2).await
            }
            other => other,
        }
    }

    async fn attempt(&self, query: &QuerySpec, attempt: u32) -> Result<Vec<Row>> {
        debug!(source = self.live.name(), attempt = attempt, "Live attempt");

        match tokio::time::timeout(self.policy.timeout, self.live.execute(query)).await {
            Ok(result) => result,
            Err(_) => Err(AnalyticsError::transport(
                TransportKind::Timeout,
                format!(
                    "{} did not answer within {} ms",
                    self.live.name(),
                    self.policy.timeout.as_millis()
                ),
            )),
        }
    }
}

fn live_payload(query: &QuerySpec, rows: Vec<Row>) -> Result<Payload> {
    match &query.subject {
        Subject::Drivers { .. } if !rows.is_empty() => Ok(Payload::Drivers(
            crate::models::DriverSet::from_rows(&query.entity, &query.period.from, query.scenario, &rows)?,
        )),
        _ => Ok(Payload::Rows(rows)),
    }
}
