//! Gate Validation State Machine
//!
//! POLLING -> {HOLD_WAIT -> POLLING} | PASSED | FAILED(mode) | ERROR_EXHAUSTED,
//! plus ABORTED when the invocation is cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::classifier::{classify, explain, ExplainContext};
use super::client::GateTransport;
use super::error::GateError;
use super::recorder::{GateMetadata, InvocationContext};
use super::types::{GateOutcome, GateRequest, GateResponse, GateResult, GateStatus, Mode};
use crate::config::GateParams;

pub const START_BANNER: &str = "=== Starting ArmorCode Release Gate Check ===";
pub const POLL_BANNER: &str = "=== ArmorCode Release Gate ===";
pub const PASS_LINE: &str = "[INFO] ArmorCode check passed! Proceeding...";
pub const BLOCK_LINE: &str = "[BLOCK] SLA check FAILED => Terminating build with failure.";
pub const WARN_LINE: &str =
    "[WARN] SLA check FAILED but 'warn' mode is active => Marking build as UNSTABLE and continuing...";

pub struct GateStateMachine {
    transport: Arc<dyn GateTransport>,
    cancel: CancellationToken,
}

impl GateStateMachine {
    pub fn new(transport: Arc<dyn GateTransport>) -> Self {
        Self { transport, cancel: CancellationToken::new() }
    }

    pub fn with_cancellation(transport: Arc<dyn GateTransport>, cancel: CancellationToken) -> Self {
        Self { transport, cancel }
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drive one invocation to exactly one outcome or a fatal error.
    pub async fn run(
        &self,
        params: &GateParams,
        token: &str,
        invocation: &dyn InvocationContext,
    ) -> Result<GateOutcome, GateError> {
        check_preconditions(params, token)?;

        let span = info_span!(
            "gate_check",
            id = %Uuid::new_v4(),
            product = %params.product,
            env = %params.environment,
            job = %params.build.job_name,
        );
        self.drive(params, token, invocation).instrument(span).await
    }

    async fn drive(
        &self,
        params: &GateParams,
        token: &str,
        invocation: &dyn InvocationContext,
    ) -> Result<GateOutcome, GateError> {
        let max_attempts = params.max_attempts();
        let delay = params.retry_delay;
        invocation.console(START_BANNER);
        info!("Release gate check started ({} attempts max)", max_attempts);

        let mut attempt = 1;
        loop {
            let request = GateRequest {
                product: params.product.clone(),
                sub_products: params.sub_products.clone(),
                environment: params.environment.clone(),
                build: params.build.clone(),
                attempt,
                max_attempts,
            };

            let response = match self.poll_once(token, &request).await {
                Ok(response) => response,
                Err(e) => {
                    self.after_error(e, attempt, max_attempts, delay, invocation).await?;
                    attempt += 1;
                    continue;
                }
            };

            invocation.console(POLL_BANNER);
            invocation.console(&format!("Status: {}", response.raw_status));
            debug!(attempt, status = %response.status, "Gate responded");

            match response.status {
                GateStatus::Hold if attempt < max_attempts => {
                    invocation.console(&format!("[INFO] SLA is on HOLD. Sleeping {}s...", delay.as_secs()));
                    invocation.console(&format!(
                        "[INFO] Sleeping {} seconds before trying again. You can temporarily release the build from ArmorCode console",
                        delay.as_secs()
                    ));
                    self.pause(delay).await?;
                }
                GateStatus::Hold => {
                    invocation.console(&format!(
                        "[ERROR] ArmorCode check did not pass after {} retries (last status was HOLD).",
                        max_attempts
                    ));
                    return self.resolve_failure(params, &response, attempt, invocation).await;
                }
                GateStatus::Failed => {
                    return self.resolve_failure(params, &response, attempt, invocation).await;
                }
                GateStatus::Success => {
                    invocation.console(PASS_LINE);
                    record(invocation, params, GateResult::Pass);
                    info!("Release gate passed on attempt {}", attempt);
                    self.settle(params).await;
                    return Ok(GateOutcome {
                        result: GateResult::Pass,
                        applied_mode: params.mode,
                        attempts_used: attempt,
                        last_status: response.status,
                        explanation: None,
                    });
                }
                GateStatus::Unknown => {
                    let e = GateError::Protocol("response carries no status".to_string());
                    self.after_error(e, attempt, max_attempts, delay, invocation).await?;
                }
            }

            attempt += 1;
        }
    }

    async fn poll_once(&self, token: &str, request: &GateRequest) -> Result<GateResponse, GateError> {
        let raw = tokio::select! {
            _ = self.cancel.cancelled() => return Err(GateError::Aborted),
            raw = self.transport.poll(token, request) => raw?,
        };
        classify(&raw)
    }

    /// Report a failed attempt, then either wait for the next one or give up.
    async fn after_error(
        &self,
        error: GateError,
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
        invocation: &dyn InvocationContext,
    ) -> Result<(), GateError> {
        if matches!(error, GateError::Aborted) {
            return Err(error);
        }
        invocation.console(&format!("[ERROR] ArmorCode request failed: {}", error));
        warn!(attempt, "Gate request failed: {}", error);
        if attempt >= max_attempts {
            return Err(GateError::Exhausted { attempts: attempt, last: Box::new(error) });
        }
        invocation.console(&format!("Waiting {}s before retry...", delay.as_secs()));
        self.pause(delay).await
    }

    async fn resolve_failure(
        &self,
        params: &GateParams,
        response: &GateResponse,
        attempt: u32,
        invocation: &dyn InvocationContext,
    ) -> Result<GateOutcome, GateError> {
        let ctx = ExplainContext {
            product: params.product.clone(),
            sub_products: params.sub_products.join(", "),
            environment: params.environment.clone(),
            build_number: params.build.build_number.clone(),
            job_name: params.build.job_name.clone(),
        };
        let explanation = explain(&ctx, response);
        invocation.console(&explanation);

        let result = match params.mode {
            Mode::Warn => {
                invocation.console(WARN_LINE);
                warn!("Release gate failed, continuing in warn mode");
                GateResult::Degraded
            }
            Mode::Block => {
                invocation.console(BLOCK_LINE);
                warn!("Release gate failed, blocking");
                GateResult::Fail
            }
        };
        record(invocation, params, result);
        self.settle(params).await;

        Ok(GateOutcome {
            result,
            applied_mode: params.mode,
            attempts_used: attempt,
            last_status: response.status,
            explanation: Some(explanation),
        })
    }

    /// Interruptible sleep between attempts
    async fn pause(&self, delay: Duration) -> Result<(), GateError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(GateError::Aborted),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// The verdict is already decided; a cancelled settle pause just ends early.
    async fn settle(&self, params: &GateParams) {
        if let Some(delay) = params.settle_delay.filter(|d| !d.is_zero()) {
            debug!("Settling for {:?}", delay);
            let _ = self.pause(delay).await;
        }
    }
}

fn check_preconditions(params: &GateParams, token: &str) -> Result<(), GateError> {
    if params.product.trim().is_empty()
        || params.sub_products.is_empty()
        || params.environment.trim().is_empty()
    {
        return Err(GateError::Configuration("Incomplete security configuration".to_string()));
    }
    if token.trim().is_empty() {
        return Err(GateError::Configuration("Missing security authentication".to_string()));
    }
    Ok(())
}

fn record(invocation: &dyn InvocationContext, params: &GateParams, result: GateResult) {
    let metadata = GateMetadata::new(&params.product, &params.recorded_sub_products(), &params.environment, result);
    if let Err(e) = invocation.record(&metadata) {
        warn!("Failed to record gate metadata: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::recorder::MemoryInvocation;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    /// Replays canned responses; repeats the last one when drained.
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<String, GateError>>>,
        calls: AtomicU32,
        attempts_seen: Mutex<Vec<(u32, u32)>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<String, GateError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
                attempts_seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GateTransport for ScriptedTransport {
        async fn poll(&self, _token: &str, request: &GateRequest) -> Result<String, GateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.attempts_seen.lock().await.push((request.attempt, request.max_attempts));
            let mut script = self.script.lock().await;
            match script.pop_front() {
                Some(next) => next,
                None => Err(GateError::Protocol("script drained".into())),
            }
        }
    }

    fn status(s: &str) -> Result<String, GateError> {
        Ok(format!(r#"{{"status":"{}"}}"#, s))
    }

    fn params(mode: Mode, retries: i64) -> GateParams {
        let mut p = GateParams::new("prod-1", vec!["api".into()], "Production");
        p.mode = mode;
        p.max_retries = retries;
        p.retry_delay = Duration::from_millis(1);
        p.build.build_number = "9".into();
        p.build.job_name = "payments".into();
        p
    }

    #[tokio::test]
    async fn test_pass_after_hold() {
        let transport = ScriptedTransport::new(vec![status("HOLD"), status("SUCCESS")]);
        let machine = GateStateMachine::new(transport.clone());
        let inv = MemoryInvocation::new();

        let outcome = machine.run(&params(Mode::Block, 5), "tok", &inv).await.unwrap();
        assert_eq!(outcome.result, GateResult::Pass);
        assert_eq!(outcome.attempts_used, 2);
        assert_eq!(transport.calls(), 2);
        assert_eq!(*transport.attempts_seen.lock().await, vec![(1, 5), (2, 5)]);

        let out = inv.output();
        assert!(out.starts_with(START_BANNER));
        assert!(out.contains("[INFO] SLA is on HOLD. Sleeping 0s..."));
        assert!(out.contains(PASS_LINE));
        assert_eq!(inv.recorded()[0].result, "PASS");
    }

    #[tokio::test]
    async fn test_failed_in_warn_mode_is_degraded() {
        let transport = ScriptedTransport::new(vec![Ok(
            r#"{"status":"FAILED","severity":{"Critical":2},"failureReasonText":"Too many criticals"}"#.into(),
        )]);
        let machine = GateStateMachine::new(transport);
        let inv = MemoryInvocation::new();

        let outcome = machine.run(&params(Mode::Warn, 5), "tok", &inv).await.unwrap();
        assert_eq!(outcome.result, GateResult::Degraded);
        assert!(!outcome.halts_pipeline());
        assert!(outcome.explanation.unwrap().contains("Findings Scope: 2 Critical"));
        assert!(inv.output().contains(WARN_LINE));
        assert_eq!(inv.recorded()[0].result, "FAIL");
    }

    #[tokio::test]
    async fn test_failed_in_block_mode_halts() {
        let transport = ScriptedTransport::new(vec![status("failed")]);
        let machine = GateStateMachine::new(transport.clone());
        let inv = MemoryInvocation::new();

        let outcome = machine.run(&params(Mode::Block, 5), "tok", &inv).await.unwrap();
        assert_eq!(outcome.result, GateResult::Fail);
        assert!(outcome.halts_pipeline());
        assert_eq!(transport.calls(), 1);
        assert!(inv.output().contains(BLOCK_LINE));
    }

    #[tokio::test]
    async fn test_hold_on_final_attempt_resolves_as_failed() {
        let transport = ScriptedTransport::new(vec![status("HOLD"), status("HOLD"), status("HOLD")]);
        let machine = GateStateMachine::new(transport.clone());
        let inv = MemoryInvocation::new();

        let outcome = machine.run(&params(Mode::Block, 3), "tok", &inv).await.unwrap();
        assert_eq!(outcome.result, GateResult::Fail);
        assert_eq!(outcome.last_status, GateStatus::Hold);
        assert_eq!(outcome.attempts_used, 3);
        assert_eq!(transport.calls(), 3);
        assert!(inv.output().contains("did not pass after 3 retries (last status was HOLD)"));
        assert!(inv.output().contains("Reason: SLA check failed"));
    }

    #[tokio::test]
    async fn test_holds_then_failed_uses_every_attempt() {
        let transport = ScriptedTransport::new(vec![
            status("HOLD"),
            status("HOLD"),
            status("HOLD"),
            Ok(r#"{"status":"FAILED","severity":{"High":1}}"#.into()),
        ]);
        let machine = GateStateMachine::new(transport.clone());
        let inv = MemoryInvocation::new();

        let outcome = machine.run(&params(Mode::Block, 4), "tok", &inv).await.unwrap();
        assert_eq!(outcome.result, GateResult::Fail);
        assert_eq!(outcome.last_status, GateStatus::Failed);
        assert_eq!(outcome.attempts_used, 4);
        assert_eq!(transport.calls(), 4);
        assert_eq!(*transport.attempts_seen.lock().await, vec![(1, 4), (2, 4), (3, 4), (4, 4)]);
        assert!(!inv.output().contains("last status was HOLD"));
        assert!(inv.output().contains(BLOCK_LINE));
    }

    #[tokio::test]
    async fn test_metadata_keeps_sub_products_as_supplied() {
        let transport = ScriptedTransport::new(vec![status("SUCCESS")]);
        let machine = GateStateMachine::new(transport);
        let inv = MemoryInvocation::new();

        let mut p = params(Mode::Block, 5);
        p.sub_products_text = Some("api\nweb".into());
        machine.run(&p, "tok", &inv).await.unwrap();
        assert_eq!(inv.recorded()[0].sub_products, "api\nweb");
    }

    #[tokio::test]
    async fn test_single_attempt_hold_never_sleeps() {
        let transport = ScriptedTransport::new(vec![status("HOLD")]);
        let machine = GateStateMachine::new(transport);
        let inv = MemoryInvocation::new();

        let outcome = machine.run(&params(Mode::Warn, 1), "tok", &inv).await.unwrap();
        assert_eq!(outcome.result, GateResult::Degraded);
        assert!(!inv.output().contains("Sleeping"));
    }

    #[tokio::test]
    async fn test_errors_exhaust_regardless_of_mode() {
        let transport = ScriptedTransport::new(vec![
            Ok("garbage".into()),
            Err(GateError::Http { status: 500, url: "u".into(), body: "boom".into() }),
        ]);
        let machine = GateStateMachine::new(transport.clone());
        let inv = MemoryInvocation::new();

        let err = machine.run(&params(Mode::Warn, 2), "tok", &inv).await.unwrap_err();
        match err {
            GateError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert_eq!(last.status_code(), Some(500));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(transport.calls(), 2);
        assert!(inv.output().contains("Waiting 0s before retry..."));
        assert!(inv.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_missing_status_is_retried() {
        let transport = ScriptedTransport::new(vec![Ok("{}".into()), status("SUCCESS")]);
        let machine = GateStateMachine::new(transport.clone());
        let outcome = machine.run(&params(Mode::Block, 5), "tok", &MemoryInvocation::new()).await.unwrap();
        assert_eq!(outcome.result, GateResult::Pass);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_preconditions_before_network() {
        let transport = ScriptedTransport::new(vec![]);
        let machine = GateStateMachine::new(transport.clone());
        let inv = MemoryInvocation::new();

        let mut p = params(Mode::Block, 5);
        p.sub_products.clear();
        let err = machine.run(&p, "tok", &inv).await.unwrap_err();
        assert_eq!(err.to_string(), "Incomplete security configuration");

        let err = machine.run(&params(Mode::Block, 5), " ", &inv).await.unwrap_err();
        assert_eq!(err.to_string(), "Missing security authentication");
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_hold_wait() {
        let transport = ScriptedTransport::new(vec![status("HOLD"), status("SUCCESS")]);
        let cancel = CancellationToken::new();
        let machine = GateStateMachine::with_cancellation(transport.clone(), cancel.clone());
        let mut p = params(Mode::Block, 5);
        p.retry_delay = Duration::from_secs(3600);

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let err = machine.run(&p, "tok", &MemoryInvocation::new()).await.unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, GateError::Aborted));
        assert_eq!(transport.calls(), 1);
    }
}
