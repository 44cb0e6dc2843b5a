use crate::retry::RetryPolicy;
use crate::types::{OracleError, OracleRequest, OracleResponse, ScoringOracle};
use futures::stream::{self, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Outcome of one request after retries.
#[derive(Debug, Clone)]
pub enum OracleOutcome {
    Scored(OracleResponse),
    Failed(OracleError),
}

/// A finished request, identified by the request id it was submitted under.
#[derive(Debug, Clone)]
pub struct Correlated {
    pub request_id: Uuid,
    pub item_id: String,
    pub outcome: OracleOutcome,
    pub attempts: u32,
}

/// Submits rubric requests to a [`ScoringOracle`] with bounded parallelism,
/// a per-call timeout, and retry with exponential backoff.
pub struct OracleAdapter {
    oracle: Arc<dyn ScoringOracle>,
    retry: RetryPolicy,
    parallelism: usize,
    per_call_timeout: Duration,
}

impl OracleAdapter {
    pub fn new(oracle: Arc<dyn ScoringOracle>, retry: RetryPolicy, parallelism: usize, per_call_timeout: Duration) -> Self {
        Self {
            oracle,
            retry,
            parallelism: parallelism.max(1),
            per_call_timeout,
        }
    }

    pub fn oracle_name(&self) -> String {
        self.oracle.oracle_name()
    }

    /// Score every request concurrently. Results arrive in completion order,
    /// not submission order; callers match them up by `request_id`.
    pub fn score_all(&self, requests: Vec<OracleRequest>) -> impl Stream<Item = Correlated> + '_ {
        stream::iter(requests)
            .map(move |request| self.score_one(request))
            .buffer_unordered(self.parallelism)
    }

    async fn score_one(&self, request: OracleRequest) -> Correlated {
        let label = format!("oracle:{}:{}", request.rubric.as_str(), request.item_id);
        let attempted = self
            .retry
            .run(&label, OracleError::is_retryable, || self.call_once(&request))
            .await;

        let outcome = match attempted.result {
            Ok(response) => {
                debug!(item_id = %request.item_id, attempts = attempted.attempts, "Oracle scored item");
                OracleOutcome::Scored(response)
            }
            Err(e) => {
                warn!(item_id = %request.item_id, attempts = attempted.attempts, error = %e, "Oracle gave up on item");
                OracleOutcome::Failed(e)
            }
        };

        Correlated {
            request_id: request.request_id,
            item_id: request.item_id,
            outcome,
            attempts: attempted.attempts,
        }
    }

    async fn call_once(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError> {
        let response = tokio::time::timeout(self.per_call_timeout, self.oracle.score(request))
            .await
            .map_err(|_| OracleError::Timeout {
                after_ms: u64::try_from(self.per_call_timeout.as_millis()).unwrap_or(u64::MAX),
            })??;

        if response.request_id != request.request_id || response.item_id != request.item_id {
            return Err(OracleError::Malformed(format!(
                "response for {}/{} does not match request {}/{}",
                response.item_id, response.request_id, request.item_id, request.request_id
            )));
        }
        Ok(response)
    }
}
