//! Batch Dispatcher
//!
//! Delivers discovery records in fixed-size chunks. One failed chunk never
//! stops the others.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::scanner::JobRecord;
use crate::api::{join_path, ApiClient, DISCOVERY_PATH};
use crate::gate::GateError;
use crate::utils::truncate::truncate_body;

pub const BATCH_SIZE: usize = 50;

/// Destination for one chunk of records
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn deliver(&self, base_url: &str, token: &str, records: &[JobRecord]) -> Result<(), GateError>;
}

/// POSTs `{jobsCount, jobs}` to the monitoring endpoint
pub struct HttpBatchSink {
    api: ApiClient,
}

impl HttpBatchSink {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl BatchSink for HttpBatchSink {
    async fn deliver(&self, base_url: &str, token: &str, records: &[JobRecord]) -> Result<(), GateError> {
        let url = join_path(base_url, DISCOVERY_PATH);
        let payload = json!({
            "jobsCount": records.len(),
            "jobs": records,
        });
        let response = self.api.post_json(&url, token, &payload).await?;
        debug!("Batch accepted: {}", truncate_body(&response));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub total_records: usize,
    pub succeeded_records: usize,
    pub batches: usize,
    pub failed_batches: usize,
}

impl BatchResult {
    pub fn is_success(&self) -> bool {
        self.succeeded_records == self.total_records
    }
}

pub struct BatchDispatcher {
    sink: Arc<dyn BatchSink>,
    batch_size: usize,
    cancel: Option<CancellationToken>,
}

impl BatchDispatcher {
    pub fn new(sink: Arc<dyn BatchSink>) -> Self {
        Self { sink, batch_size: BATCH_SIZE, cancel: None }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Send every record, pacing between chunks but not after the last.
    pub async fn send(&self, records: &[JobRecord], base_url: &str, token: &str, pacing: Duration) -> BatchResult {
        let mut result = BatchResult { total_records: records.len(), ..BatchResult::default() };
        let chunks: Vec<&[JobRecord]> = records.chunks(self.batch_size).collect();
        let count = chunks.len();

        for (idx, chunk) in chunks.into_iter().enumerate() {
            if self.is_cancelled() {
                warn!("Discovery dispatch cancelled after {} of {} batches", idx, count);
                break;
            }

            result.batches += 1;
            match self.sink.deliver(base_url, token, chunk).await {
                Ok(()) => result.succeeded_records += chunk.len(),
                Err(e) => {
                    result.failed_batches += 1;
                    match e.status_code() {
                        Some(status) => warn!("Batch {}/{} send failed with HTTP {}: {}", idx + 1, count, status, e),
                        None => warn!("Batch {}/{} send failed: {}", idx + 1, count, e),
                    }
                }
            }

            if idx + 1 < count && !pacing.is_zero() && !self.pause(pacing).await {
                warn!("Discovery dispatch cancelled after {} of {} batches", idx + 1, count);
                break;
            }
        }

        info!(
            "Sent {} of {} jobs to ArmorCode in {} batches",
            result.succeeded_records, result.total_records, result.batches
        );
        result
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }

    /// False when cancelled mid-pause
    async fn pause(&self, delay: Duration) -> bool {
        match &self.cancel {
            Some(cancel) => tokio::select! {
                _ = cancel.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            },
            None => {
                tokio::time::sleep(delay).await;
                true
            }
        }
    }
}
