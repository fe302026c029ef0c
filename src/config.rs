//! Configuration
//!
//! Global settings come from an optional JSON file, overridden by
//! `ARMORCODE_*` environment variables. Per-invocation gate parameters live
//! in [`GateParams`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::api::DEFAULT_BASE_URL;
use crate::discovery::cron::{is_too_frequent, parse_schedule, ScheduleError};
use crate::discovery::scheduler::ScheduleSpec;
use crate::gate::{BuildIdentity, Mode, SubProductsInput};

pub const DEFAULT_CRON: &str = "H H * * *";
pub const DEFAULT_INCLUDE: &str = ".*";
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(20);

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Global configuration shared by the gate and discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub monitor_builds: bool,
    pub include_jobs_pattern: String,
    pub exclude_jobs_pattern: String,
    /// Legacy comma list, `!` prefix excludes. Converted on load.
    pub job_filter: String,
    pub cron_expression: String,
    pub jobs_dir: Option<PathBuf>,
    pub root_url: Option<String>,
    pub batch_pacing_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token: None,
            monitor_builds: false,
            include_jobs_pattern: DEFAULT_INCLUDE.to_string(),
            exclude_jobs_pattern: String::new(),
            job_filter: String::new(),
            cron_expression: DEFAULT_CRON.to_string(),
            jobs_dir: None,
            root_url: None,
            batch_pacing_ms: 1000,
        }
    }
}

/// Severity of a settings validation finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IssueLevel {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub field: &'static str,
    pub level: IssueLevel,
    pub message: String,
}

impl Settings {
    /// File (if any), then environment, then normalization.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut settings = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            _ => Self::default(),
        };
        settings.apply_overrides(|key| std::env::var(key).ok());
        settings.normalize();
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| SettingsError::Io { path: path.to_path_buf(), source })?;
        serde_json::from_str(&raw).map_err(|source| SettingsError::Parse { path: path.to_path_buf(), source })
    }

    /// Apply `ARMORCODE_*` overrides from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ARMORCODE_BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = lookup("ARMORCODE_TOKEN") {
            self.token = Some(v);
        }
        if let Some(v) = lookup("ARMORCODE_MONITOR_BUILDS") {
            self.monitor_builds = matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(v) = lookup("ARMORCODE_INCLUDE_JOBS") {
            self.include_jobs_pattern = v;
        }
        if let Some(v) = lookup("ARMORCODE_EXCLUDE_JOBS") {
            self.exclude_jobs_pattern = v;
        }
        if let Some(v) = lookup("ARMORCODE_CRON") {
            self.cron_expression = v;
        }
        if let Some(v) = lookup("ARMORCODE_JOBS_DIR") {
            self.jobs_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("ARMORCODE_ROOT_URL") {
            self.root_url = Some(v);
        }
    }

    /// Fill blanks with defaults and convert the legacy job filter.
    pub fn normalize(&mut self) {
        if self.cron_expression.trim().is_empty() {
            self.cron_expression = DEFAULT_CRON.to_string();
        }
        if self.token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            self.token = None;
        }
        if !self.job_filter.trim().is_empty()
            && self.include_jobs_pattern == DEFAULT_INCLUDE
            && self.exclude_jobs_pattern.is_empty()
        {
            self.convert_legacy_filter();
        }
    }

    fn convert_legacy_filter(&mut self) {
        let mut includes = Vec::new();
        let mut excludes = Vec::new();
        for pattern in self.job_filter.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match pattern.strip_prefix('!') {
                Some(excluded) => excludes.push(excluded),
                None => includes.push(pattern),
            }
        }
        if !includes.is_empty() {
            self.include_jobs_pattern = includes.join("|");
        }
        if !excludes.is_empty() {
            self.exclude_jobs_pattern = excludes.join("|");
        }
        info!(
            "Converted legacy job filter '{}' to include='{}' exclude='{}'",
            self.job_filter, self.include_jobs_pattern, self.exclude_jobs_pattern
        );
        self.job_filter.clear();
    }

    pub fn schedule(&self) -> ScheduleSpec {
        ScheduleSpec {
            cron_expression: self.cron_expression.clone(),
            monitoring_enabled: self.monitor_builds,
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.is_empty())
    }

    pub fn batch_pacing(&self) -> Duration {
        Duration::from_millis(self.batch_pacing_ms)
    }

    /// Check the settings an operator can get wrong. Never fatal.
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.base_url.trim().is_empty() {
            issues.push(ValidationIssue {
                field: "baseUrl",
                level: IssueLevel::Error,
                message: "Base URL must not be empty".to_string(),
            });
        } else if !self.base_url.starts_with("https://") {
            issues.push(ValidationIssue {
                field: "baseUrl",
                level: IssueLevel::Error,
                message: "Base URL must start with https://".to_string(),
            });
        }

        // Unusable expressions fall back to hourly runs
        match parse_schedule(&self.cron_expression) {
            Err(ScheduleError::Empty) => {}
            Err(e) => issues.push(ValidationIssue {
                field: "cronExpression",
                level: IssueLevel::Warning,
                message: format!("Invalid Cron Expression: {}", e),
            }),
            Ok(_) if is_too_frequent(&self.cron_expression) => issues.push(ValidationIssue {
                field: "cronExpression",
                level: IssueLevel::Warning,
                message: "Cron expression must not run more frequently than once per hour".to_string(),
            }),
            Ok(_) => {}
        }

        for (field, pattern) in [
            ("includeJobsPattern", &self.include_jobs_pattern),
            ("excludeJobsPattern", &self.exclude_jobs_pattern),
        ] {
            if let Err(e) = regex::Regex::new(pattern) {
                issues.push(ValidationIssue { field, level: IssueLevel::Warning, message: e.to_string() });
            }
        }

        if self.monitor_builds && self.token().is_none() {
            issues.push(ValidationIssue {
                field: "token",
                level: IssueLevel::Warning,
                message: "Monitoring is enabled but no ArmorCode token is configured".to_string(),
            });
        }

        issues
    }
}

/// Shared, reloadable settings. Readers get an immutable snapshot.
#[derive(Clone)]
pub struct SettingsStore {
    inner: Arc<RwLock<Settings>>,
    path: Option<PathBuf>,
}

impl SettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self { inner: Arc::new(RwLock::new(settings)), path: None }
    }

    pub fn open(path: Option<PathBuf>) -> Result<Self, SettingsError> {
        let settings = Settings::load(path.as_deref())?;
        Ok(Self { inner: Arc::new(RwLock::new(settings)), path })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn snapshot(&self) -> Settings {
        self.inner.read().await.clone()
    }

    pub async fn replace(&self, settings: Settings) {
        *self.inner.write().await = settings;
    }

    /// Re-read the backing file. Keeps the current settings on error.
    pub async fn reload_from_file(&self) -> Result<Settings, SettingsError> {
        match Settings::load(self.path.as_deref()) {
            Ok(settings) => {
                self.replace(settings.clone()).await;
                Ok(settings)
            }
            Err(e) => {
                warn!("Keeping previous settings: {}", e);
                Err(e)
            }
        }
    }
}

/// Parameters of one gate invocation
#[derive(Debug, Clone, Default)]
pub struct GateParams {
    pub product: String,
    pub sub_products: Vec<String>,
    /// Sub-products exactly as supplied, for the recorded metadata
    pub sub_products_text: Option<String>,
    pub environment: String,
    pub mode: Mode,
    /// Non-positive values fall back to the default
    pub max_retries: i64,
    pub retry_delay: Duration,
    /// Optional pause after a terminal verdict
    pub settle_delay: Option<Duration>,
    pub target_url: Option<String>,
    pub build: BuildIdentity,
}

impl GateParams {
    pub fn new(product: impl Into<String>, sub_products: Vec<String>, environment: impl Into<String>) -> Self {
        Self {
            product: product.into(),
            sub_products,
            sub_products_text: None,
            environment: environment.into(),
            mode: Mode::Block,
            max_retries: DEFAULT_MAX_RETRIES as i64,
            retry_delay: DEFAULT_RETRY_DELAY,
            settle_delay: None,
            target_url: None,
            build: BuildIdentity::default(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        if self.max_retries <= 0 {
            DEFAULT_MAX_RETRIES
        } else {
            u32::try_from(self.max_retries).unwrap_or(u32::MAX)
        }
    }

    /// Override URL, then the global base URL, then the public default.
    /// Supplied text if any, otherwise the list as `[a, b]`
    pub fn recorded_sub_products(&self) -> String {
        self.sub_products_text
            .clone()
            .unwrap_or_else(|| SubProductsInput::List(self.sub_products.clone()).recorded_text())
    }

    pub fn resolve_base_url(&self, settings: &Settings) -> String {
        [self.target_url.as_deref(), Some(settings.base_url.as_str())]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|u| !u.is_empty())
            .unwrap_or(DEFAULT_BASE_URL)
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.base_url, "https://app.armorcode.com");
        assert!(!s.monitor_builds);
        assert_eq!(s.include_jobs_pattern, ".*");
        assert_eq!(s.cron_expression, "H H * * *");
        assert!(s.validate().is_empty());
    }

    #[test]
    fn test_file_then_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"baseUrl":"https://file.test","monitorBuilds":true,"cronExpression":""}"#).unwrap();

        let mut s = Settings::from_file(&path).unwrap();
        let env: HashMap<&str, &str> = HashMap::from([("ARMORCODE_TOKEN", "t0k"), ("ARMORCODE_EXCLUDE_JOBS", "tmp-.*")]);
        s.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        s.normalize();

        assert_eq!(s.base_url, "https://file.test");
        assert!(s.monitor_builds);
        assert_eq!(s.token(), Some("t0k"));
        assert_eq!(s.exclude_jobs_pattern, "tmp-.*");
        assert_eq!(s.cron_expression, DEFAULT_CRON);
    }

    #[test]
    fn test_legacy_filter_conversion() {
        let mut s = Settings { job_filter: "prod.*, release.*,!test.*".into(), ..Settings::default() };
        s.normalize();
        assert_eq!(s.include_jobs_pattern, "prod.*|release.*");
        assert_eq!(s.exclude_jobs_pattern, "test.*");
        assert!(s.job_filter.is_empty());

        // Explicit patterns win over the legacy field
        let mut s = Settings {
            job_filter: "a".into(),
            include_jobs_pattern: "b".into(),
            ..Settings::default()
        };
        s.normalize();
        assert_eq!(s.include_jobs_pattern, "b");
    }

    #[test]
    fn test_validate_flags_problems() {
        let s = Settings {
            base_url: "http://insecure.test".into(),
            cron_expression: "*/5 * * * *".into(),
            monitor_builds: true,
            ..Settings::default()
        };
        let issues = s.validate();
        assert!(issues.iter().any(|i| i.field == "baseUrl" && i.level == IssueLevel::Error));
        assert!(issues.iter().any(|i| i.field == "cronExpression" && i.level == IssueLevel::Warning));
        assert!(issues.iter().any(|i| i.field == "token"));

        let bad = Settings { cron_expression: "not a cron".into(), ..Settings::default() };
        assert!(bad.validate().iter().any(|i| i.message.starts_with("Invalid Cron Expression")));
    }

    #[test]
    fn test_unparsable_cron_is_only_a_warning() {
        for expr in ["not a cron", "H(0-4294967295) * * * *", "61 * * * *"] {
            let s = Settings { cron_expression: expr.into(), ..Settings::default() };
            let issues = s.validate();
            let cron: Vec<_> = issues.iter().filter(|i| i.field == "cronExpression").collect();
            assert_eq!(cron.len(), 1, "{}", expr);
            assert_eq!(cron[0].level, IssueLevel::Warning);
            assert!(!issues.iter().any(|i| i.level == IssueLevel::Error));
        }
        let empty = Settings { cron_expression: String::new(), ..Settings::default() };
        assert!(!empty.validate().iter().any(|i| i.field == "cronExpression"));
    }

    #[test]
    fn test_recorded_sub_products() {
        let mut p = GateParams::new("p", vec!["api".into(), "web".into()], "dev");
        assert_eq!(p.recorded_sub_products(), "[api, web]");
        p.sub_products_text = Some("api\nweb".into());
        assert_eq!(p.recorded_sub_products(), "api\nweb");
    }

    #[test]
    fn test_gate_params_attempts_and_url() {
        let mut p = GateParams::new("p", vec!["s".into()], "dev");
        assert_eq!(p.max_attempts(), 5);
        p.max_retries = 0;
        assert_eq!(p.max_attempts(), 5);
        p.max_retries = -2;
        assert_eq!(p.max_attempts(), 5);
        p.max_retries = 2;
        assert_eq!(p.max_attempts(), 2);

        let settings = Settings { base_url: "https://global.test".into(), ..Settings::default() };
        assert_eq!(p.resolve_base_url(&settings), "https://global.test");
        p.target_url = Some("https://override.test".into());
        assert_eq!(p.resolve_base_url(&settings), "https://override.test");
        p.target_url = Some("  ".into());
        let blank = Settings { base_url: String::new(), ..Settings::default() };
        assert_eq!(p.resolve_base_url(&blank), DEFAULT_BASE_URL);
    }

    #[tokio::test]
    async fn test_store_snapshot_is_isolated() {
        let store = SettingsStore::new(Settings::default());
        let before = store.snapshot().await;
        store.replace(Settings { monitor_builds: true, ..Settings::default() }).await;
        assert!(!before.monitor_builds);
        assert!(store.snapshot().await.monitor_builds);
    }
}
