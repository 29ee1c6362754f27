//! Severity bookkeeping for one run.

use harness_core::logging::{CheckerDisposition, ControlSignal, LogEntryChecker, LogRecord, Severity};
use harness_core::{RunCounters, TestCaseRun};
use std::sync::Arc;
use tracing::debug;

/// Counts WARNING/ERROR/FATAL records on the evidence channel into the
/// active run's counters. Installed at run start, deregisters itself when
/// its run's end signal comes through.
#[derive(Debug)]
pub struct RunLogChecker {
    test_case_name: String,
    counters: Arc<RunCounters>,
}

impl RunLogChecker {
    pub fn for_run(run: &TestCaseRun) -> Self {
        Self {
            test_case_name: run.test_case_name().to_string(),
            counters: run.counters(),
        }
    }
}

impl LogEntryChecker for RunLogChecker {
    fn on_record(&mut self, record: &LogRecord) {
        match record.severity {
            Severity::Warning => {
                self.counters.increase_warnings();
            }
            Severity::Error => {
                self.counters.increase_errors();
            }
            Severity::Fatal => {
                self.counters.increase_fatal_errors();
            }
            Severity::Debug | Severity::Info | Severity::Step => {}
        }
    }

    fn on_control(&mut self, signal: &ControlSignal) -> CheckerDisposition {
        match signal {
            ControlSignal::TestCaseEnded { test_case_name }
                if *test_case_name == self.test_case_name =>
            {
                debug!(test_case = %self.test_case_name, "log checker deregistering");
                CheckerDisposition::Finished
            }
            _ => CheckerDisposition::Keep,
        }
    }
}
