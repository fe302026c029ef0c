//! Discovery Module
//!
//! Periodic inventory of CI jobs: which ones exist, when they last ran and
//! whether they are instrumented with the release gate.

pub mod cron;
pub mod detectors;
pub mod dispatcher;
pub mod host;
pub mod scanner;
pub mod scheduler;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{Settings, SettingsStore};

pub use detectors::{Detector, DetectionContext};
pub use dispatcher::{BatchDispatcher, BatchResult, BatchSink, HttpBatchSink};
pub use host::{FsJobHost, HostJob, JobHost};
pub use scanner::{JobFilter, JobRecord, JobScanner};
pub use scheduler::{next_interval, DiscoveryScheduler, ScanTrigger, ScheduleSpec};

/// What a scan did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ScanReport {
    Disabled,
    MissingToken,
    NoJobs,
    Failed { reason: String },
    Sent(BatchResult),
}

/// Scan then dispatch, driven by the scheduler or the CLI
pub struct DiscoveryService {
    scanner: Arc<JobScanner>,
    dispatcher: BatchDispatcher,
    settings: SettingsStore,
}

impl DiscoveryService {
    pub fn new(scanner: Arc<JobScanner>, dispatcher: BatchDispatcher, settings: SettingsStore) -> Self {
        Self { scanner, dispatcher, settings }
    }

    /// Scan on a blocking thread. Returns the records without sending them.
    pub async fn collect(&self, settings: &Settings) -> anyhow::Result<Vec<JobRecord>> {
        let scanner = self.scanner.clone();
        let snapshot = settings.clone();
        tokio::task::spawn_blocking(move || scanner.scan(&snapshot)).await?
    }

    pub async fn run_scan(&self, settings: &Settings) -> ScanReport {
        let span = info_span!("discovery_scan", id = %Uuid::new_v4());
        self.scan_and_send(settings).instrument(span).await
    }

    async fn scan_and_send(&self, settings: &Settings) -> ScanReport {
        if !settings.monitor_builds {
            info!("Job discovery is disabled in configuration");
            return ScanReport::Disabled;
        }
        let Some(token) = settings.token() else {
            warn!("No ArmorCode token found - skipping job discovery");
            return ScanReport::MissingToken;
        };

        info!("Starting job discovery scan");
        let records = match self.collect(settings).await {
            Ok(records) => records,
            Err(e) => {
                error!("Error during job discovery: {:#}", e);
                return ScanReport::Failed { reason: format!("{:#}", e) };
            }
        };

        if records.is_empty() {
            info!("No matching jobs found during discovery");
            return ScanReport::NoJobs;
        }
        info!("Collected {} jobs for discovery", records.len());

        let result = self
            .dispatcher
            .send(&records, &settings.base_url, token, settings.batch_pacing())
            .await;
        if result.is_success() {
            info!("Successfully sent {} jobs to ArmorCode", result.total_records);
        } else {
            warn!(
                "Failed to send job discovery data ({} of {} jobs delivered)",
                result.succeeded_records, result.total_records
            );
        }
        ScanReport::Sent(result)
    }
}

#[async_trait]
impl ScanTrigger for DiscoveryService {
    async fn fire(&self) {
        let settings = self.settings.snapshot().await;
        self.run_scan(&settings).await;
    }
}
