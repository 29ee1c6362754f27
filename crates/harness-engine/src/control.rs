//! Test case admission and completion handling.
//!
//! Submissions run synchronously in submission order; concurrency in this
//! engine is for log I/O, not for parallel test cases. Every terminal run
//! gets its summary block on the channel before the persistence callback
//! fires, exactly once.

use crate::executor::{TestCase, TestCaseExecutor};
use harness_core::logging::{ControlSignal, LogChannel};
use harness_core::{HarnessConfig, TestCaseRun};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

const SUMMARY_RULE: &str = "=============================================";

type SaveFn = Box<dyn FnMut(&TestCaseRun) + Send>;

/// Entry point for running test cases.
pub struct ExecutionControl {
    config: HarnessConfig,
    channel: Arc<LogChannel>,
    executor: TestCaseExecutor,
    cancel: CancellationToken,
    save: SaveFn,
}

impl std::fmt::Debug for ExecutionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionControl")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ExecutionControl {
    /// `save` is the caller's persistence function; it receives every run
    /// exactly once, after the run reached its terminal state.
    pub fn new(config: HarnessConfig, channel: Arc<LogChannel>, save: SaveFn) -> Self {
        let executor = TestCaseExecutor::new(config.clone(), Arc::clone(&channel));
        Self {
            config,
            channel,
            executor,
            cancel: CancellationToken::new(),
            save,
        }
    }

    /// Token for operator-requested aborts; cancelling it unwinds the
    /// currently running test case at the next phase boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run one test case to completion and return its run record.
    pub async fn submit(&mut self, test_case: &mut dyn TestCase) -> TestCaseRun {
        let mut run = TestCaseRun::new(
            test_case.test_case_id(),
            self.config.tester_in_charge.clone(),
        );
        info!(test_case = run.test_case_name(), "submitting test case");

        self.executor
            .execute(test_case, &mut run, self.cancel.clone())
            .await;
        self.finish(&run);
        run
    }

    /// Run several test cases, one at a time, in submission order.
    pub async fn submit_all(
        &mut self,
        test_cases: &mut [Box<dyn TestCase>],
    ) -> Vec<TestCaseRun> {
        let mut runs = Vec::with_capacity(test_cases.len());
        for test_case in test_cases {
            runs.push(self.submit(test_case.as_mut()).await);
        }
        runs
    }

    /// Summary block, end-of-run control signal, persistence. Runs once
    /// per terminal run; the run record itself is read-only here.
    fn finish(&mut self, run: &TestCaseRun) {
        let verdict = run.verdict();
        self.channel.info(SUMMARY_RULE);
        self.channel.info(format!(
            "Test case {} finished with verdict {}.",
            run.test_case_name(),
            verdict.as_str()
        ));
        self.channel
            .info(format!("Started at {}", run.start_time_formatted()));
        self.channel
            .info(format!("Duration {}", run.duration_formatted()));
        self.channel
            .info(format!("Fatal errors: {}", run.fatal_error_count()));
        self.channel.info(format!("Errors: {}", run.error_count()));
        self.channel
            .info(format!("Warnings: {}", run.warning_count()));
        self.channel.info(SUMMARY_RULE);

        self.channel.control(ControlSignal::TestCaseEnded {
            test_case_name: run.test_case_name().to_string(),
        });
        (self.save)(run);
    }
}
