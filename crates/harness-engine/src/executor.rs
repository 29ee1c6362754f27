//! Test case lifecycle execution.
//!
//! Drives a test case through the fixed phase order, advancing the internal
//! state machine, emitting phase-boundary signals and resolving the final
//! run state. Teardown always runs, whatever happened before it.

use crate::checker::RunLogChecker;
use crate::correlator::CorrelatorError;
use crate::session::SessionError;
use async_trait::async_trait;
use chrono::Utc;
use harness_core::logging::{ControlSignal, LogChannel};
use harness_core::{HarnessConfig, Phase, RunState, TestCaseRun, TestCaseState, Verdict};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Outcome of one lifecycle phase.
#[derive(Debug, Error)]
pub enum PhaseError {
    /// Externally requested abandonment of the test case.
    #[error("canceled: {0}")]
    Canceled(String),
    /// Anything else that broke the phase.
    #[error("{0}")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl PhaseError {
    pub fn failed(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Failed(err.into())
    }
}

impl From<CorrelatorError> for PhaseError {
    fn from(err: CorrelatorError) -> Self {
        Self::Failed(Box::new(err))
    }
}

impl From<SessionError> for PhaseError {
    fn from(err: SessionError) -> Self {
        Self::Failed(Box::new(err))
    }
}

impl From<std::io::Error> for PhaseError {
    fn from(err: std::io::Error) -> Self {
        Self::Failed(Box::new(err))
    }
}

/// Everything a test case's phases get to work with.
#[derive(Debug, Clone)]
pub struct TestContext {
    pub config: HarnessConfig,
    pub channel: Arc<LogChannel>,
    pub cancel: CancellationToken,
}

/// One conformance test case: identity plus the five lifecycle phases.
#[async_trait]
pub trait TestCase: Send {
    fn test_case_id(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn purpose(&self) -> &str {
        ""
    }

    async fn setup(&mut self, ctx: &TestContext) -> Result<(), PhaseError>;

    async fn pre_processing(&mut self, ctx: &TestContext) -> Result<(), PhaseError>;

    async fn execute_usecase(&mut self, ctx: &TestContext) -> Result<(), PhaseError>;

    async fn post_processing(&mut self, ctx: &TestContext) -> Result<(), PhaseError>;

    async fn teardown(&mut self, ctx: &TestContext) -> Result<(), PhaseError>;
}

/// Drives one test case to its terminal run state.
#[derive(Debug)]
pub struct TestCaseExecutor {
    config: HarnessConfig,
    channel: Arc<LogChannel>,
}

impl TestCaseExecutor {
    pub fn new(config: HarnessConfig, channel: Arc<LogChannel>) -> Self {
        Self { config, channel }
    }

    /// Run the full lifecycle. The run ends FINISHED only when every phase
    /// including teardown completed; any failure, cancellation or
    /// between-phase fatal condition resolves it as CANCELED.
    pub async fn execute(
        &self,
        test_case: &mut dyn TestCase,
        run: &mut TestCaseRun,
        cancel: CancellationToken,
    ) {
        run.set_state(RunState::Running);
        run.mark_started(Utc::now());
        self.channel.control(ControlSignal::TestCaseStarted {
            test_case_name: run.test_case_name().to_string(),
        });
        if !test_case.description().is_empty() {
            self.channel.control(ControlSignal::TestCaseDescription {
                text: test_case.description().to_string(),
            });
        }
        if !test_case.purpose().is_empty() {
            self.channel.control(ControlSignal::TestCasePurpose {
                text: test_case.purpose().to_string(),
            });
        }
        self.channel
            .install_checker(Box::new(RunLogChecker::for_run(run)));

        let ctx = TestContext {
            config: self.config.clone(),
            channel: Arc::clone(&self.channel),
            cancel,
        };

        let mut state = TestCaseState::Idle;
        let mut canceled = false;

        for phase in [
            Phase::Setup,
            Phase::PreProcessing,
            Phase::Usecase,
            Phase::PostProcessing,
        ] {
            if run.fatal_error_count() > 0 {
                self.channel.info(format!(
                    "Fatal errors recorded; skipping {} and aborting to teardown",
                    phase.as_str()
                ));
                canceled = true;
                break;
            }
            if ctx.cancel.is_cancelled() {
                self.channel.info(format!(
                    "Cancellation requested; skipping {} and aborting to teardown",
                    phase.as_str()
                ));
                canceled = true;
                break;
            }

            self.enter_phase(&mut state, phase);
            let result = Self::run_phase(test_case, phase, &ctx).await;
            self.leave_phase(&mut state, phase);

            match result {
                Ok(()) => {}
                Err(PhaseError::Canceled(reason)) => {
                    self.channel.info(format!(
                        "Test case canceled during {}: {reason}",
                        phase.as_str()
                    ));
                    canceled = true;
                    break;
                }
                Err(PhaseError::Failed(err)) => {
                    self.channel.fatal_with_detail(
                        format!("Failure during {}", phase.as_str()),
                        err.to_string(),
                    );
                    canceled = true;
                    break;
                }
            }
        }

        // A FATAL recorded during the last completed phase must not slip
        // through just because the loop has no next iteration.
        if !canceled && run.fatal_error_count() > 0 {
            self.channel
                .info("Fatal errors recorded; aborting to teardown");
            canceled = true;
        }

        // Teardown always runs.
        self.enter_phase(&mut state, Phase::Teardown);
        let teardown_result = Self::run_phase(test_case, Phase::Teardown, &ctx).await;
        self.leave_phase(&mut state, Phase::Teardown);
        match teardown_result {
            Ok(()) => {}
            Err(PhaseError::Canceled(reason)) => {
                self.channel
                    .info(format!("Test case canceled during teardown: {reason}"));
                canceled = true;
            }
            Err(PhaseError::Failed(err)) => {
                self.channel
                    .fatal_with_detail("Failure during teardown", err.to_string());
                canceled = true;
            }
        }
        if !canceled && run.fatal_error_count() > 0 {
            self.channel.info("Fatal errors recorded during teardown");
            canceled = true;
        }

        let final_state = if canceled {
            RunState::Canceled
        } else {
            RunState::Finished
        };
        // All run mutations happen before the state turns terminal; after
        // that only the completion callback sees the record.
        let verdict = Verdict::resolve(final_state, &run.counters());
        run.add_status_message(format!("Verdict: {}", verdict.as_str()));
        run.mark_stopped(Utc::now());
        run.set_state(final_state);
        info!(
            test_case = run.test_case_name(),
            state = final_state.as_str(),
            "test case execution ended"
        );
    }

    async fn run_phase(
        test_case: &mut dyn TestCase,
        phase: Phase,
        ctx: &TestContext,
    ) -> Result<(), PhaseError> {
        match phase {
            Phase::Setup => test_case.setup(ctx).await,
            Phase::PreProcessing => test_case.pre_processing(ctx).await,
            Phase::Usecase => test_case.execute_usecase(ctx).await,
            Phase::PostProcessing => test_case.post_processing(ctx).await,
            Phase::Teardown => test_case.teardown(ctx).await,
        }
    }

    fn enter_phase(&self, state: &mut TestCaseState, phase: Phase) {
        let next = match phase {
            Phase::Setup => None,
            Phase::PreProcessing => Some(TestCaseState::PreProcessing),
            Phase::Usecase => Some(TestCaseState::ExecuteUsecase),
            Phase::PostProcessing => Some(TestCaseState::PostProcessing),
            Phase::Teardown => Some(TestCaseState::Stop),
        };
        self.advance(state, next);
        self.channel.control(ControlSignal::PhaseBegin { phase });
    }

    fn leave_phase(&self, state: &mut TestCaseState, phase: Phase) {
        self.channel.control(ControlSignal::PhaseEnd { phase });
        let next = match phase {
            Phase::Setup => None,
            Phase::PreProcessing => Some(TestCaseState::PreProcessed),
            Phase::Usecase => Some(TestCaseState::ExecutedUsecase),
            Phase::PostProcessing => Some(TestCaseState::PostProcessed),
            Phase::Teardown => Some(TestCaseState::Stopped),
        };
        self.advance(state, next);
    }

    fn advance(&self, state: &mut TestCaseState, next: Option<TestCaseState>) {
        if let Some(next) = next {
            if state.advance(next) {
                self.channel
                    .control(ControlSignal::TestCaseStateChanged { state: *state });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harness_core::logging::MemorySink;
    use std::sync::Mutex;

    #[derive(Clone, Copy, PartialEq)]
    enum FailAt {
        Nowhere,
        Usecase,
        Teardown,
    }

    #[derive(Clone, Copy, PartialEq)]
    enum LogFatalAt {
        Nowhere,
        PreProcessing,
        PostProcessing,
        Teardown,
    }

    struct ScriptedCase {
        visited: Arc<Mutex<Vec<&'static str>>>,
        fail_at: FailAt,
        cancel_in_pre_processing: bool,
        log_fatal_at: LogFatalAt,
    }

    impl ScriptedCase {
        fn new(visited: Arc<Mutex<Vec<&'static str>>>) -> Self {
            Self {
                visited,
                fail_at: FailAt::Nowhere,
                cancel_in_pre_processing: false,
                log_fatal_at: LogFatalAt::Nowhere,
            }
        }

        fn visit(&self, phase: &'static str) {
            self.visited.lock().unwrap().push(phase);
        }
    }

    #[async_trait]
    impl TestCase for ScriptedCase {
        fn test_case_id(&self) -> &str {
            "TLS_B1_FR_01"
        }

        fn description(&self) -> &str {
            "scripted lifecycle"
        }

        async fn setup(&mut self, _ctx: &TestContext) -> Result<(), PhaseError> {
            self.visit("setup");
            Ok(())
        }

        async fn pre_processing(&mut self, ctx: &TestContext) -> Result<(), PhaseError> {
            self.visit("pre_processing");
            if self.cancel_in_pre_processing {
                ctx.cancel.cancel();
            }
            if self.log_fatal_at == LogFatalAt::PreProcessing {
                ctx.channel.fatal("tool reported an unrecoverable state");
            }
            Ok(())
        }

        async fn execute_usecase(&mut self, _ctx: &TestContext) -> Result<(), PhaseError> {
            self.visit("execute_usecase");
            if self.fail_at == FailAt::Usecase {
                return Err(PhaseError::failed("handshake evidence missing"));
            }
            Ok(())
        }

        async fn post_processing(&mut self, ctx: &TestContext) -> Result<(), PhaseError> {
            self.visit("post_processing");
            if self.log_fatal_at == LogFatalAt::PostProcessing {
                ctx.channel.fatal("evidence archive is corrupt");
            }
            Ok(())
        }

        async fn teardown(&mut self, ctx: &TestContext) -> Result<(), PhaseError> {
            self.visit("teardown");
            if self.log_fatal_at == LogFatalAt::Teardown {
                ctx.channel.fatal("tool left its listener running");
            }
            if self.fail_at == FailAt::Teardown {
                return Err(PhaseError::failed("report file not writable"));
            }
            Ok(())
        }
    }

    async fn run_case(case: &mut ScriptedCase) -> (TestCaseRun, MemorySink) {
        let channel = LogChannel::shared();
        let sink = MemorySink::new();
        channel.add_sink(Box::new(sink.clone()));
        let executor = TestCaseExecutor::new(HarnessConfig::default(), Arc::clone(&channel));
        let mut run = TestCaseRun::new("TLS_B1_FR_01", "tester");
        executor
            .execute(case, &mut run, CancellationToken::new())
            .await;
        (run, sink)
    }

    #[tokio::test]
    async fn clean_run_visits_all_phases_in_order() {
        let visited = Arc::new(Mutex::new(Vec::new()));
        let mut case = ScriptedCase::new(Arc::clone(&visited));
        let (run, sink) = run_case(&mut case).await;

        assert_eq!(
            *visited.lock().unwrap(),
            [
                "setup",
                "pre_processing",
                "execute_usecase",
                "post_processing",
                "teardown"
            ]
        );
        assert_eq!(run.state(), RunState::Finished);
        assert_eq!(run.verdict(), Verdict::Passed);
        assert!(run.start_timestamp().is_some());
        assert!(run.stop_timestamp().is_some());
        // The verdict was recorded on the run before it turned terminal.
        assert_eq!(run.status_messages(), ["Verdict: PASSED"]);

        // State machine advanced monotonically through all nine states.
        let states: Vec<TestCaseState> = sink
            .controls()
            .iter()
            .filter_map(|signal| match signal {
                ControlSignal::TestCaseStateChanged { state } => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            [
                TestCaseState::PreProcessing,
                TestCaseState::PreProcessed,
                TestCaseState::ExecuteUsecase,
                TestCaseState::ExecutedUsecase,
                TestCaseState::PostProcessing,
                TestCaseState::PostProcessed,
                TestCaseState::Stop,
                TestCaseState::Stopped,
            ]
        );
    }

    #[tokio::test]
    async fn phase_failure_still_runs_teardown_and_cancels_run() {
        let visited = Arc::new(Mutex::new(Vec::new()));
        let mut case = ScriptedCase::new(Arc::clone(&visited));
        case.fail_at = FailAt::Usecase;
        let (run, sink) = run_case(&mut case).await;

        assert_eq!(
            *visited.lock().unwrap(),
            ["setup", "pre_processing", "execute_usecase", "teardown"]
        );
        assert_eq!(run.state(), RunState::Canceled);
        // The failure was logged FATAL, so the verdict is FAILED.
        assert_eq!(run.fatal_error_count(), 1);
        assert_eq!(run.verdict(), Verdict::Failed);
        assert!(sink.contains_message("Failure during use_case"));
    }

    #[tokio::test]
    async fn cancellation_skips_remaining_phases_but_not_teardown() {
        let visited = Arc::new(Mutex::new(Vec::new()));
        let mut case = ScriptedCase::new(Arc::clone(&visited));
        case.cancel_in_pre_processing = true;
        let (run, sink) = run_case(&mut case).await;

        assert_eq!(
            *visited.lock().unwrap(),
            ["setup", "pre_processing", "teardown"]
        );
        assert_eq!(run.state(), RunState::Canceled);
        assert_eq!(run.verdict(), Verdict::Inconclusive);
        assert!(sink.contains_message("Cancellation requested"));
    }

    #[tokio::test]
    async fn fatal_log_aborts_between_phases() {
        let visited = Arc::new(Mutex::new(Vec::new()));
        let mut case = ScriptedCase::new(Arc::clone(&visited));
        case.log_fatal_at = LogFatalAt::PreProcessing;
        let (run, sink) = run_case(&mut case).await;

        assert_eq!(
            *visited.lock().unwrap(),
            ["setup", "pre_processing", "teardown"]
        );
        assert_eq!(run.state(), RunState::Canceled);
        assert_eq!(run.fatal_error_count(), 1);
        assert_eq!(run.verdict(), Verdict::Failed);
        assert!(sink.contains_message("Fatal errors recorded"));
    }

    #[tokio::test]
    async fn fatal_log_in_post_processing_cancels_run() {
        let visited = Arc::new(Mutex::new(Vec::new()));
        let mut case = ScriptedCase::new(Arc::clone(&visited));
        case.log_fatal_at = LogFatalAt::PostProcessing;
        let (run, sink) = run_case(&mut case).await;

        // Post-processing was the last looped phase, so only the check
        // ahead of teardown can catch its fatal record.
        assert_eq!(
            *visited.lock().unwrap(),
            [
                "setup",
                "pre_processing",
                "execute_usecase",
                "post_processing",
                "teardown"
            ]
        );
        assert_eq!(run.state(), RunState::Canceled);
        assert_eq!(run.fatal_error_count(), 1);
        assert_eq!(run.verdict(), Verdict::Failed);
        assert!(sink.contains_message("Fatal errors recorded; aborting to teardown"));
    }

    #[tokio::test]
    async fn fatal_log_in_teardown_cancels_run() {
        let visited = Arc::new(Mutex::new(Vec::new()));
        let mut case = ScriptedCase::new(Arc::clone(&visited));
        case.log_fatal_at = LogFatalAt::Teardown;
        let (run, sink) = run_case(&mut case).await;

        assert_eq!(run.state(), RunState::Canceled);
        assert_eq!(run.fatal_error_count(), 1);
        assert_eq!(run.verdict(), Verdict::Failed);
        assert!(sink.contains_message("Fatal errors recorded during teardown"));
    }

    #[tokio::test]
    async fn teardown_failure_alone_downgrades_to_canceled() {
        let visited = Arc::new(Mutex::new(Vec::new()));
        let mut case = ScriptedCase::new(Arc::clone(&visited));
        case.fail_at = FailAt::Teardown;
        let (run, _sink) = run_case(&mut case).await;

        assert_eq!(run.state(), RunState::Canceled);
        assert_eq!(run.fatal_error_count(), 1);
    }
}
