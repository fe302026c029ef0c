//! Discovery Scheduler
//!
//! Owns the single discovery timer. Each fire runs one scan, then the next
//! interval is recomputed from whatever configuration is current.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone};
use regex::Regex;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cron::parse_schedule;
use crate::config::{SettingsStore, DEFAULT_CRON};

const DISABLED_INTERVAL: Duration = Duration::from_secs(7 * 24 * 3600);
const DEFAULT_INTERVAL: Duration = Duration::from_secs(24 * 3600);
const FALLBACK_INTERVAL: Duration = Duration::from_secs(3600);
const MIN_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSpec {
    pub cron_expression: String,
    pub monitoring_enabled: bool,
}

/// Work the timer kicks off
#[async_trait]
pub trait ScanTrigger: Send + Sync {
    async fn fire(&self);
}

/// Delay until the next discovery run.
pub fn next_interval<Tz: TimeZone>(spec: &ScheduleSpec, now: &DateTime<Tz>) -> Duration {
    if !spec.monitoring_enabled {
        return DISABLED_INTERVAL;
    }

    let expression = spec.cron_expression.trim();
    if expression.is_empty() || expression == DEFAULT_CRON {
        return DEFAULT_INTERVAL;
    }

    if let Some(minutes) = every_n_minutes(expression) {
        return match minutes.checked_mul(60) {
            Some(secs) => Duration::from_secs(secs),
            None => {
                warn!("Interval in '{}' is out of range. Falling back to 1 hour", expression);
                FALLBACK_INTERVAL
            }
        };
    }

    match parse_schedule(expression) {
        Ok(schedule) => match schedule.after(now).next() {
            Some(next) => (next - now.clone()).to_std().unwrap_or(MIN_INTERVAL).max(MIN_INTERVAL),
            None => {
                warn!("Cron expression '{}' never fires again, retrying in 1 hour", expression);
                FALLBACK_INTERVAL
            }
        },
        Err(e) => {
            warn!("{}. Falling back to 1 hour", e);
            FALLBACK_INTERVAL
        }
    }
}

/// `*/N * * * *`
fn every_n_minutes(expression: &str) -> Option<u64> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^\*/(\d+)\s+\*\s+\*\s+\*\s+\*$").ok()).as_ref()?;
    let minutes = re.captures(expression)?.get(1)?.as_str().parse::<u64>().ok()?;
    (minutes > 0).then_some(minutes)
}

struct ArmedTimer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    interval: Duration,
}

pub struct DiscoveryScheduler {
    settings: SettingsStore,
    trigger: Arc<dyn ScanTrigger>,
    timer: Mutex<Option<ArmedTimer>>,
    scan_lock: Arc<Mutex<()>>,
    generation: AtomicU64,
}

impl DiscoveryScheduler {
    pub fn new(settings: SettingsStore, trigger: Arc<dyn ScanTrigger>) -> Self {
        Self {
            settings,
            trigger,
            timer: Mutex::new(None),
            scan_lock: Arc::new(Mutex::new(())),
            generation: AtomicU64::new(0),
        }
    }

    /// Replace any pending timer with one armed for `spec`.
    pub async fn reschedule(&self, spec: &ScheduleSpec) -> Duration {
        let mut timer = self.timer.lock().await;
        if let Some(old) = timer.take() {
            old.cancel.cancel();
            // A scan in flight holds scan_lock and finishes; an idle timer can go now.
            if self.scan_lock.try_lock().is_ok() {
                old.handle.abort();
            }
        }

        let interval = next_interval(spec, &Local::now());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(timer_loop(
            cancel.clone(),
            interval,
            self.settings.clone(),
            self.trigger.clone(),
            self.scan_lock.clone(),
        ));
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Discovery scheduled: next run in {:?} (timer #{})", interval, generation);

        *timer = Some(ArmedTimer { cancel, handle, interval });
        interval
    }

    /// Run one scan right away, serialized with timer fires.
    pub async fn run_now(&self) {
        let _guard = self.scan_lock.lock().await;
        self.trigger.fire().await;
    }

    pub async fn shutdown(&self) {
        if let Some(old) = self.timer.lock().await.take() {
            old.cancel.cancel();
            info!("Discovery timer cancelled");
        }
    }

    pub async fn is_armed(&self) -> bool {
        self.timer.lock().await.as_ref().is_some_and(|t| !t.handle.is_finished())
    }

    pub async fn current_interval(&self) -> Option<Duration> {
        self.timer.lock().await.as_ref().map(|t| t.interval)
    }

    /// Number of timers armed so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

async fn timer_loop(
    cancel: CancellationToken,
    mut interval: Duration,
    settings: SettingsStore,
    trigger: Arc<dyn ScanTrigger>,
    scan_lock: Arc<Mutex<()>>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        {
            let _guard = scan_lock.lock().await;
            if cancel.is_cancelled() {
                break;
            }
            trigger.fire().await;
        }

        let spec = settings.snapshot().await.schedule();
        interval = next_interval(&spec, &Local::now());
        debug!("Next discovery run in {:?}", interval);
    }
}
