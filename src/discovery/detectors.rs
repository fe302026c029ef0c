//! Gate usage detectors
//!
//! Each detector looks at one kind of evidence that a job runs the release
//! gate. They are evaluated in order and the first positive wins.

use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;
use tracing::debug;

use super::host::{HostJob, JobHost};
use crate::gate::machine::{POLL_BANNER, START_BANNER};
use crate::gate::recorder::{MARKER_FILE, PARAM_PREFIX};

/// What a detector may consult besides the job itself
pub struct DetectionContext<'a> {
    pub host: &'a dyn JobHost,
}

pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;
    fn detect(&self, job: &dyn HostJob, ctx: &DetectionContext<'_>) -> Result<bool>;
}

/// Detectors in evaluation order
pub fn default_detectors() -> Vec<Box<dyn Detector>> {
    vec![
        Box::new(ConfiguredStepDetector),
        Box::new(RunParameterDetector),
        Box::new(MarkerArtifactDetector),
        Box::new(DefinitionSignatureDetector),
        Box::new(BuildLogDetector),
        Box::new(SiblingBranchDetector),
    ]
}

/// First positive wins. Errors count as a negative vote.
pub fn detect_gate_usage(detectors: &[Box<dyn Detector>], job: &dyn HostJob, ctx: &DetectionContext<'_>) -> bool {
    for detector in detectors {
        match detector.detect(job, ctx) {
            Ok(true) => {
                debug!(job = job.full_name(), detector = detector.name(), "Gate usage detected");
                return true;
            }
            Ok(false) => {}
            Err(e) => debug!(job = job.full_name(), detector = detector.name(), "Detector failed: {:#}", e),
        }
    }
    false
}

pub struct ConfiguredStepDetector;

impl Detector for ConfiguredStepDetector {
    fn name(&self) -> &'static str {
        "configured-step"
    }

    fn detect(&self, job: &dyn HostJob, _ctx: &DetectionContext<'_>) -> Result<bool> {
        Ok(job.steps()?.iter().any(|s| s.ends_with("ArmorCodeReleaseGateBuilder")))
    }
}

pub struct RunParameterDetector;

impl Detector for RunParameterDetector {
    fn name(&self) -> &'static str {
        "run-parameter"
    }

    fn detect(&self, job: &dyn HostJob, _ctx: &DetectionContext<'_>) -> Result<bool> {
        Ok(job.last_build_parameters()?.iter().any(|p| p.starts_with(PARAM_PREFIX)))
    }
}

pub struct MarkerArtifactDetector;

impl Detector for MarkerArtifactDetector {
    fn name(&self) -> &'static str {
        "marker-artifact"
    }

    fn detect(&self, job: &dyn HostJob, _ctx: &DetectionContext<'_>) -> Result<bool> {
        Ok(job.last_build_dir().is_some_and(|dir| dir.join(MARKER_FILE).is_file()))
    }
}

pub struct DefinitionSignatureDetector;

impl DefinitionSignatureDetector {
    const SIGNATURES: [&'static str; 4] = [
        "armorcodeReleaseGate(",
        "new ArmorCodeReleaseGateBuilder(",
        "step $class: 'ArmorCodeReleaseGateBuilder'",
        "ArmorCode.GateUsed",
    ];

    /// Loosely coupled references, possibly across lines
    fn has_loose_reference(text: &str) -> bool {
        static RE: OnceLock<Option<Regex>> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"(?s)\bArmorCode\b.*\bReleaseGate\b").ok())
            .as_ref()
            .is_some_and(|re| re.is_match(text))
    }

    /// Gate usage visible in a job definition
    fn matches(text: &str) -> bool {
        Self::SIGNATURES.iter().any(|s| text.contains(s))
            || Self::has_loose_reference(text)
            || Self::is_script_integration(text)
    }

    fn is_script_integration(text: &str) -> bool {
        text.contains("armorcode.ai/client/buildvalidation")
            || text.contains("armorcode.com/client/buildvalidation")
            || (text.contains("curl")
                && text.contains("Authorization: Bearer")
                && (text.contains("armorcode.ai") || text.contains("ArmorCode")))
    }
}

impl Detector for DefinitionSignatureDetector {
    fn name(&self) -> &'static str {
        "definition-signature"
    }

    fn detect(&self, job: &dyn HostJob, _ctx: &DetectionContext<'_>) -> Result<bool> {
        Ok(Self::matches(&job.definition()?))
    }
}

pub struct BuildLogDetector;

impl BuildLogDetector {
    fn is_gate_line(line: &str) -> bool {
        static RE: OnceLock<Option<Regex>> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"\[INFO\]\s+ArmorCode check passed|\[BLOCK\]\s+SLA check").ok())
            .as_ref()
            .is_some_and(|re| re.is_match(line))
    }
}

impl Detector for BuildLogDetector {
    fn name(&self) -> &'static str {
        "build-log"
    }

    fn detect(&self, job: &dyn HostJob, _ctx: &DetectionContext<'_>) -> Result<bool> {
        let log = job.last_build_log()?;
        Ok(log.lines().any(|line| {
            line.contains(START_BANNER) || line.contains(POLL_BANNER) || Self::is_gate_line(line)
        }))
    }
}

pub struct SiblingBranchDetector;

impl SiblingBranchDetector {
    fn mentions_gate(text: &str) -> bool {
        text.contains("ArmorCode") || text.contains("armorcode")
    }

    /// Last log or definition of a sibling shows the gate
    fn sibling_uses_gate(sibling: &dyn HostJob) -> bool {
        match sibling.last_build_log() {
            Ok(log) if Self::mentions_gate(&log) => return true,
            Ok(_) => {}
            Err(e) => debug!(sibling = sibling.full_name(), "Could not read sibling log: {:#}", e),
        }
        match sibling.definition() {
            Ok(text) => DefinitionSignatureDetector::matches(&text),
            Err(e) => {
                debug!(sibling = sibling.full_name(), "Could not read sibling definition: {:#}", e);
                false
            }
        }
    }
}

impl Detector for SiblingBranchDetector {
    fn name(&self) -> &'static str {
        "sibling-branch"
    }

    fn detect(&self, job: &dyn HostJob, ctx: &DetectionContext<'_>) -> Result<bool> {
        let Some(parent) = job.parent_name() else {
            return Ok(false);
        };
        let Some(folder) = ctx.host.folder(parent) else {
            return Ok(false);
        };
        if Self::mentions_gate(&folder.description) {
            return Ok(true);
        }
        if !folder.multibranch {
            return Ok(false);
        }

        Ok(ctx
            .host
            .children(parent)?
            .iter()
            .filter(|sibling| sibling.full_name() != job.full_name())
            .any(|sibling| Self::sibling_uses_gate(sibling.as_ref())))
    }
}

#[cfg(test)]
mod tests {
    use super::super::host::fixtures::*;
    use super::super::host::FsJobHost;
    use super::*;
    use std::sync::Arc;

    fn job_named(host: &FsJobHost, name: &str) -> Arc<dyn HostJob> {
        host.all_jobs().unwrap().into_iter().find(|j| j.full_name() == name).unwrap()
    }

    fn detected_by(host: &FsJobHost, name: &str) -> Option<&'static str> {
        let ctx = DetectionContext { host };
        let job = job_named(host, name);
        default_detectors()
            .into_iter()
            .find(|d| d.detect(job.as_ref(), &ctx).unwrap_or(false))
            .map(|d| d.name())
    }

    #[test]
    fn test_each_signal() {
        let home = tempfile::tempdir().unwrap();
        let root = home.path();

        write_job(
            &root.join("step"),
            "<project><builders><io.jenkins.plugins.armorcode.ArmorCodeReleaseGateBuilder><product>1</product></io.jenkins.plugins.armorcode.ArmorCodeReleaseGateBuilder></builders></project>",
        );

        write_job(&root.join("param"), FREESTYLE);
        let dir = write_build(&root.join("param"), 1, "", None);
        std::fs::write(dir.join("gate-params.json"), r#"{"ArmorCode.GateResult":"PASS"}"#).unwrap();

        write_job(&root.join("marker"), FREESTYLE);
        let dir = write_build(&root.join("marker"), 4, "", None);
        std::fs::write(dir.join(MARKER_FILE), "").unwrap();

        write_job(
            &root.join("pipeline"),
            "<flow-definition><definition><script>stage('gate') { armorcodeReleaseGate(product: '1') }</script></definition></flow-definition>",
        );

        write_job(
            &root.join("script"),
            "<project><builders><hudson.tasks.Shell><command>curl -H 'Authorization: Bearer $T' https://app.armorcode.ai/api</command></hudson.tasks.Shell></builders></project>",
        );

        write_job(&root.join("logged"), FREESTYLE);
        write_build(&root.join("logged"), 1, "noise\n[BLOCK]  SLA check FAILED => Terminating\n", None);

        write_job(&root.join("plain"), FREESTYLE);
        write_build(&root.join("plain"), 1, "just a build", None);

        let host = FsJobHost::new(root, None);
        assert_eq!(detected_by(&host, "step"), Some("configured-step"));
        assert_eq!(detected_by(&host, "param"), Some("run-parameter"));
        assert_eq!(detected_by(&host, "marker"), Some("marker-artifact"));
        assert_eq!(detected_by(&host, "pipeline"), Some("definition-signature"));
        assert_eq!(detected_by(&host, "script"), Some("definition-signature"));
        assert_eq!(detected_by(&host, "logged"), Some("build-log"));
        assert_eq!(detected_by(&host, "plain"), None);
    }

    #[test]
    fn test_loose_reference_spans_lines() {
        assert!(DefinitionSignatureDetector::has_loose_reference("ArmorCode\nfoo\nReleaseGate"));
        assert!(!DefinitionSignatureDetector::has_loose_reference("ArmorCodeReleaseGate"));
    }

    #[test]
    fn test_sibling_branch_signal() {
        let home = tempfile::tempdir().unwrap();
        let root = home.path();
        write_job(&root.join("svc"), &multibranch(""));
        write_job(&root.join("svc/branches/main"), FREESTYLE);
        write_build(&root.join("svc/branches/main"), 1, "=== Starting ArmorCode Release Gate Check ===", None);
        write_job(&root.join("svc/branches/feature"), FREESTYLE);
        write_build(&root.join("svc/branches/feature"), 1, "compiled", None);

        write_job(&root.join("described"), &multibranch("Gated by ArmorCode"));
        write_job(&root.join("described/branches/dev"), FREESTYLE);

        let host = FsJobHost::new(root, None);
        let ctx = DetectionContext { host: &host };
        let feature = job_named(&host, "svc/feature");
        assert!(SiblingBranchDetector.detect(feature.as_ref(), &ctx).unwrap());
        let dev = job_named(&host, "described/dev");
        assert!(SiblingBranchDetector.detect(dev.as_ref(), &ctx).unwrap());
    }

    #[test]
    fn test_sibling_definition_counts_before_any_build() {
        let home = tempfile::tempdir().unwrap();
        let root = home.path();
        write_job(&root.join("svc"), &multibranch(""));
        write_job(
            &root.join("svc/branches/main"),
            "<flow-definition><definition><script>armorcodeReleaseGate(product: '1')</script></definition></flow-definition>",
        );
        write_job(&root.join("svc/branches/feature"), FREESTYLE);
        write_build(&root.join("svc/branches/feature"), 1, "compiled", None);

        write_job(&root.join("quiet"), &multibranch(""));
        write_job(&root.join("quiet/branches/main"), FREESTYLE);
        write_job(&root.join("quiet/branches/feature"), FREESTYLE);

        let host = FsJobHost::new(root, None);
        let ctx = DetectionContext { host: &host };
        let feature = job_named(&host, "svc/feature");
        assert!(SiblingBranchDetector.detect(feature.as_ref(), &ctx).unwrap());
        let quiet = job_named(&host, "quiet/feature");
        assert!(!SiblingBranchDetector.detect(quiet.as_ref(), &ctx).unwrap());
    }

    #[test]
    fn test_parent_description_either_casing() {
        let home = tempfile::tempdir().unwrap();
        let root = home.path();
        write_job(&root.join("lc"), &multibranch("gated by armorcode"));
        write_job(&root.join("lc/branches/dev"), FREESTYLE);
        write_job(
            &root.join("team"),
            "<com.cloudbees.hudson.plugins.folder.Folder><description>ArmorCode gated</description></com.cloudbees.hudson.plugins.folder.Folder>",
        );
        write_job(&root.join("team/jobs/api"), FREESTYLE);
        write_job(&root.join("plain"), FOLDER);
        write_job(&root.join("plain/jobs/api"), FREESTYLE);

        let host = FsJobHost::new(root, None);
        let ctx = DetectionContext { host: &host };
        assert!(SiblingBranchDetector.detect(job_named(&host, "lc/dev").as_ref(), &ctx).unwrap());
        assert!(SiblingBranchDetector.detect(job_named(&host, "team/api").as_ref(), &ctx).unwrap());
        assert!(!SiblingBranchDetector.detect(job_named(&host, "plain/api").as_ref(), &ctx).unwrap());
    }

    struct Failing;

    impl Detector for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn detect(&self, _job: &dyn HostJob, _ctx: &DetectionContext<'_>) -> Result<bool> {
            anyhow::bail!("boom")
        }
    }

    #[test]
    fn test_detector_error_is_negative_vote() {
        let home = tempfile::tempdir().unwrap();
        write_job(&home.path().join("marker"), FREESTYLE);
        let dir = write_build(&home.path().join("marker"), 1, "", None);
        std::fs::write(dir.join(MARKER_FILE), "").unwrap();

        let host = FsJobHost::new(home.path(), None);
        let ctx = DetectionContext { host: &host };
        let job = job_named(&host, "marker");

        let detectors: Vec<Box<dyn Detector>> = vec![Box::new(Failing), Box::new(MarkerArtifactDetector)];
        assert!(detect_gate_usage(&detectors, job.as_ref(), &ctx));
        let only_failing: Vec<Box<dyn Detector>> = vec![Box::new(Failing)];
        assert!(!detect_gate_usage(&only_failing, job.as_ref(), &ctx));
    }
}
