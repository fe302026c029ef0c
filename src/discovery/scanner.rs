//! Job Scanner
//!
//! Enumerates host jobs, applies the include/exclude filters and builds one
//! [`JobRecord`] per surviving job.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::detectors::{default_detectors, detect_gate_usage, DetectionContext, Detector};
use super::host::{HostJob, JobHost};
use crate::config::Settings;

pub const BUILD_TOOL: &str = "JENKINS";
const LOCAL_ROOT_URL: &str = "http://localhost:8080/";

/// One job as reported to the monitoring endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(rename = "jobName")]
    pub job_name: String,
    #[serde(rename = "buildNumber")]
    pub build_number: String,
    #[serde(rename = "lastBuildTimestamp")]
    pub last_build_timestamp: i64,
    #[serde(rename = "buildTool")]
    pub build_tool: String,
    #[serde(rename = "jobURL")]
    pub job_url: String,
    #[serde(rename = "jobMapped")]
    pub job_mapped: bool,
}

impl JobRecord {
    pub fn never_built(job_name: String, job_url: String, job_mapped: bool) -> Self {
        Self {
            job_name,
            build_number: "0".to_string(),
            last_build_timestamp: 0,
            build_tool: BUILD_TOOL.to_string(),
            job_url,
            job_mapped,
        }
    }
}

/// Full-match include/exclude filter. Exclusion wins.
#[derive(Debug, Clone)]
pub struct JobFilter {
    include: Option<Regex>,
    exclude: Option<Regex>,
    include_all: bool,
}

impl JobFilter {
    pub fn new(include: &str, exclude: &str) -> Self {
        let include_all = include.trim().is_empty();
        Self {
            include: if include_all { None } else { compile("include", include) },
            exclude: if exclude.trim().is_empty() { None } else { compile("exclude", exclude) },
            include_all,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.include_jobs_pattern, &settings.exclude_jobs_pattern)
    }

    pub fn matches(&self, name: &str) -> bool {
        if self.exclude.as_ref().is_some_and(|re| re.is_match(name)) {
            return false;
        }
        // An invalid include pattern leaves `include` empty and matches nothing
        self.include_all || self.include.as_ref().is_some_and(|re| re.is_match(name))
    }
}

fn compile(kind: &str, pattern: &str) -> Option<Regex> {
    match Regex::new(&format!("^(?:{})$", pattern)) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!("Invalid {} pattern '{}': {}", kind, pattern, e);
            None
        }
    }
}

pub struct JobScanner {
    host: Arc<dyn JobHost>,
    detectors: Vec<Box<dyn Detector>>,
}

impl JobScanner {
    pub fn new(host: Arc<dyn JobHost>) -> Self {
        Self { host, detectors: default_detectors() }
    }

    pub fn with_detectors(mut self, detectors: Vec<Box<dyn Detector>>) -> Self {
        self.detectors = detectors;
        self
    }

    pub fn host(&self) -> &Arc<dyn JobHost> {
        &self.host
    }

    /// Blocking: touches the host filesystem.
    pub fn scan(&self, settings: &Settings) -> Result<Vec<JobRecord>> {
        let filter = JobFilter::from_settings(settings);
        let root_url = self.host.root_url().or_else(|| settings.root_url.clone());
        let ctx = DetectionContext { host: self.host.as_ref() };

        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for job in self.host.all_jobs()? {
            let name = job.full_name().to_string();
            if !filter.matches(&name) {
                debug!("Skipping {} (filtered)", name);
                continue;
            }
            if !seen.insert(name.clone()) {
                continue;
            }

            let mapped = detect_gate_usage(&self.detectors, job.as_ref(), &ctx);
            records.push(self.record(job.as_ref(), root_url.as_deref(), mapped));
        }
        Ok(records)
    }

    fn record(&self, job: &dyn HostJob, root_url: Option<&str>, mapped: bool) -> JobRecord {
        let url = job_url(job, root_url);
        match job.last_build() {
            Some(build) => JobRecord {
                job_name: job.full_name().to_string(),
                build_number: build.number.to_string(),
                last_build_timestamp: build.timestamp_ms,
                build_tool: BUILD_TOOL.to_string(),
                job_url: url,
                job_mapped: mapped,
            },
            None => JobRecord::never_built(job.full_name().to_string(), url, mapped),
        }
    }
}

/// Host URL, then `<root>job/<name>/`, then a localhost default
fn job_url(job: &dyn HostJob, root_url: Option<&str>) -> String {
    if let Some(url) = job.absolute_url().filter(|u| !u.is_empty()) {
        return url;
    }
    let root = match root_url.filter(|r| !r.trim().is_empty()) {
        Some(root) => root,
        None => {
            warn!("Could not determine job URL for {}; configure the CI root URL", job.full_name());
            LOCAL_ROOT_URL
        }
    };
    let separator = if root.ends_with('/') { "" } else { "/" };
    format!("{}{}job/{}/", root, separator, job.full_name())
}

#[cfg(test)]
mod tests {
    use super::super::host::fixtures::*;
    use super::super::host::FsJobHost;
    use super::*;

    #[test]
    fn test_filter_semantics() {
        let f = JobFilter::new("prod-.*", "prod-tmp.*");
        assert!(f.matches("prod-api"));
        assert!(!f.matches("prod-tmp-1"));
        assert!(!f.matches("staging-prod-api"));

        let all = JobFilter::new("", "");
        assert!(all.matches("anything"));

        let broken_include = JobFilter::new("([", "");
        assert!(!broken_include.matches("x"));

        let broken_exclude = JobFilter::new(".*", "([");
        assert!(broken_exclude.matches("x"));
    }

    #[test]
    fn test_exclude_overrides_overlapping_include() {
        let f = JobFilter::new("prod-.*", ".*-ignore");
        assert!(f.matches("prod-a"));
        assert!(!f.matches("prod-a-ignore"));
        assert!(!f.matches("dev-a"));
    }

    #[test]
    fn test_full_match_not_substring() {
        let f = JobFilter::new("api", "");
        assert!(f.matches("api"));
        assert!(!f.matches("api-v2"));
    }

    #[test]
    fn test_scan_builds_records() {
        let home = tempfile::tempdir().unwrap();
        let root = home.path();
        write_job(&root.join("built"), FREESTYLE);
        let dir = write_build(
            &root.join("built"),
            7,
            "=== ArmorCode Release Gate ===\nStatus: SUCCESS\n",
            Some("<build><timestamp>1700000000123</timestamp></build>"),
        );
        assert!(dir.exists());
        write_job(&root.join("fresh"), FREESTYLE);
        write_job(&root.join("tmp-job"), FREESTYLE);

        let scanner = JobScanner::new(Arc::new(FsJobHost::new(root, None)));
        let settings = Settings {
            exclude_jobs_pattern: "tmp-.*".into(),
            root_url: Some("https://ci.test".into()),
            ..Settings::default()
        };
        let records = scanner.scan(&settings).unwrap();

        assert_eq!(records.len(), 2);
        let built = &records[0];
        assert_eq!(built.job_name, "built");
        assert_eq!(built.build_number, "7");
        assert_eq!(built.last_build_timestamp, 1_700_000_000_123);
        assert!(built.job_mapped);
        assert_eq!(built.job_url, "https://ci.test/job/built/");

        let fresh = &records[1];
        assert_eq!(fresh.build_number, "0");
        assert_eq!(fresh.last_build_timestamp, 0);
        assert!(!fresh.job_mapped);
    }

    #[test]
    fn test_localhost_url_fallback_and_wire_names() {
        let home = tempfile::tempdir().unwrap();
        write_job(&home.path().join("solo"), FREESTYLE);
        let scanner = JobScanner::new(Arc::new(FsJobHost::new(home.path(), None)));
        let records = scanner.scan(&Settings::default()).unwrap();
        assert_eq!(records[0].job_url, "http://localhost:8080/job/solo/");

        let json = serde_json::to_value(&records[0]).unwrap();
        assert_eq!(json["jobName"], "solo");
        assert_eq!(json["buildTool"], "JENKINS");
        assert_eq!(json["jobURL"], "http://localhost:8080/job/solo/");
        assert_eq!(json["jobMapped"], false);
    }
}
