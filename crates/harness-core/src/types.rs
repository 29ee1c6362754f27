//! Core types for the conformance harness engine.
//!
//! These carry the run bookkeeping for one test case execution: the coarse
//! run lifecycle, the fine-grained test case state machine, the verdict
//! derivation and the metadata of the external tools the harness drives.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

// --- Enumerations ---

/// Coarse lifecycle of one test case run.
///
/// `Waiting` is the initial state; `Finished` and `Canceled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Waiting,
    Running,
    Finished,
    Canceled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Canceled => "CANCELED",
        }
    }

    /// True for the terminal states.
    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Finished | Self::Canceled)
    }
}

/// Fine-grained state of one test case execution. The order is mandatory:
/// the state machine only ever moves forward through these ordinals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestCaseState {
    Idle,
    PreProcessing,
    PreProcessed,
    ExecuteUsecase,
    ExecutedUsecase,
    PostProcessing,
    PostProcessed,
    Stop,
    Stopped,
}

impl TestCaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::PreProcessing => "PRE_PROCESSING",
            Self::PreProcessed => "PRE_PROCESSED",
            Self::ExecuteUsecase => "EXECUTE_USECASE",
            Self::ExecutedUsecase => "EXECUTED_USECASE",
            Self::PostProcessing => "POST_PROCESSING",
            Self::PostProcessed => "POST_PROCESSED",
            Self::Stop => "STOP",
            Self::Stopped => "STOPPED",
        }
    }

    /// Advance to `next` if it does not rewind the state machine.
    ///
    /// Regressions are ignored rather than rejected loudly; the attempt is
    /// still visible at debug level.
    pub fn advance(&mut self, next: TestCaseState) -> bool {
        if next >= *self {
            *self = next;
            true
        } else {
            tracing::debug!(
                current = self.as_str(),
                attempted = next.as_str(),
                "ignoring test case state regression"
            );
            false
        }
    }
}

/// Lifecycle phase of a test case, in fixed execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    PreProcessing,
    Usecase,
    PostProcessing,
    Teardown,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::PreProcessing => "pre_processing",
            Self::Usecase => "use_case",
            Self::PostProcessing => "post_processing",
            Self::Teardown => "teardown",
        }
    }
}

/// Final classification of a test case run, derived from the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Passed,
    PassedWithWarnings,
    Failed,
    Inconclusive,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "PASSED",
            Self::PassedWithWarnings => "PASSED WITH WARNINGS",
            Self::Failed => "FAILED",
            Self::Inconclusive => "INCONCLUSIVE",
        }
    }

    /// Verdict of a run resolving to `final_state` with these counters.
    /// Usable before the state is committed to the run record.
    pub fn resolve(final_state: RunState, counters: &RunCounters) -> Self {
        if counters.errors() + counters.fatal_errors() > 0 {
            Self::Failed
        } else if final_state == RunState::Canceled {
            Self::Inconclusive
        } else if counters.warnings() > 0 {
            Self::PassedWithWarnings
        } else {
            Self::Passed
        }
    }
}

/// The external tools the harness knows how to drive, with the naming used
/// for their per-test-case report files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    TlsTestTool,
    CrlResponder,
    OcspServer,
    OcspRequest,
    Tshark,
}

impl ToolKind {
    /// Human-readable tool name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TlsTestTool => "TLS Test Tool",
            Self::CrlResponder => "CRL Responder",
            Self::OcspServer => "OCSP Server",
            Self::OcspRequest => "OCSP Request",
            Self::Tshark => "TShark",
        }
    }

    /// Suffix appended to the test case name in the report file name.
    pub fn file_suffix(&self) -> &'static str {
        match self {
            Self::TlsTestTool => "_tls-tool",
            Self::CrlResponder => "_crl",
            Self::OcspServer => "_ocsp_server",
            Self::OcspRequest => "_cached_ocsp_reponse",
            Self::Tshark => "_tshark-capture",
        }
    }

    /// Report file extension, empty for raw dumps.
    pub fn file_extension(&self) -> &'static str {
        match self {
            Self::TlsTestTool | Self::CrlResponder | Self::OcspServer => ".log",
            Self::OcspRequest => "",
            Self::Tshark => ".pcap",
        }
    }

    /// Report file name for this tool within one test case, e.g.
    /// `TLS_B1_FR_01_tls-tool-iteration-0002-of-0010.log`.
    pub fn log_file_name(
        &self,
        test_case_name: &str,
        iteration: Option<&IterationCounter>,
    ) -> String {
        let iteration_suffix = iteration
            .map(IterationCounter::file_name_suffix)
            .unwrap_or_default();
        format!(
            "{test_case_name}{}{iteration_suffix}{}",
            self.file_suffix(),
            self.file_extension()
        )
    }
}

/// Position of one tool execution when a test case runs a tool repeatedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationCounter {
    current: u32,
    /// Zero when the total is not known up front.
    total: u32,
}

impl IterationCounter {
    pub fn new(current: u32, total: u32) -> Self {
        Self { current, total }
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// File name suffix, e.g. `-iteration-0004-of-0010`.
    pub fn file_name_suffix(&self) -> String {
        if self.total > 0 {
            format!("-iteration-{:04}-of-{:04}", self.current, self.total)
        } else {
            format!("-iteration-{:04}", self.current)
        }
    }
}

impl std::fmt::Display for IterationCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.total > 0 {
            write!(f, "Iteration {} of {} log output:", self.current, self.total)
        } else {
            write!(f, "Iteration {} log output:", self.current)
        }
    }
}

// --- Run bookkeeping ---

/// Warning/error/fatal counters of one run.
///
/// Shared between the single active log checker (writer) and the executor
/// driving the run (reader), so the counters are atomic. They are only ever
/// incremented for the lifetime of one run.
#[derive(Debug, Default)]
pub struct RunCounters {
    warnings: AtomicU32,
    errors: AtomicU32,
    fatal_errors: AtomicU32,
}

impl RunCounters {
    pub fn increase_warnings(&self) -> u32 {
        self.warnings.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn increase_errors(&self) -> u32 {
        self.errors.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn increase_fatal_errors(&self) -> u32 {
        self.fatal_errors.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn warnings(&self) -> u32 {
        self.warnings.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> u32 {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn fatal_errors(&self) -> u32 {
        self.fatal_errors.load(Ordering::SeqCst)
    }
}

/// Mutable record of one test case's execution.
#[derive(Debug)]
pub struct TestCaseRun {
    test_case_name: String,
    tester_in_charge: String,
    state: RunState,
    counters: Arc<RunCounters>,
    start_timestamp: Option<DateTime<Utc>>,
    stop_timestamp: Option<DateTime<Utc>>,
    status_messages: Vec<String>,
}

impl TestCaseRun {
    /// Create a new run in the initial `Waiting` state.
    pub fn new(test_case_name: impl Into<String>, tester_in_charge: impl Into<String>) -> Self {
        Self {
            test_case_name: test_case_name.into(),
            tester_in_charge: tester_in_charge.into(),
            state: RunState::Waiting,
            counters: Arc::new(RunCounters::default()),
            start_timestamp: None,
            stop_timestamp: None,
            status_messages: Vec::new(),
        }
    }

    pub fn test_case_name(&self) -> &str {
        &self.test_case_name
    }

    pub fn tester_in_charge(&self) -> &str {
        &self.tester_in_charge
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Set the run state. Transitions out of a terminal state are ignored.
    pub fn set_state(&mut self, new_state: RunState) {
        if self.state.is_ended() {
            tracing::debug!(
                current = self.state.as_str(),
                attempted = new_state.as_str(),
                test_case = %self.test_case_name,
                "ignoring state change on ended run"
            );
            return;
        }
        self.state = new_state;
    }

    /// Shared handle to the counters, for installing a log checker.
    pub fn counters(&self) -> Arc<RunCounters> {
        Arc::clone(&self.counters)
    }

    pub fn warning_count(&self) -> u32 {
        self.counters.warnings()
    }

    pub fn error_count(&self) -> u32 {
        self.counters.errors()
    }

    pub fn fatal_error_count(&self) -> u32 {
        self.counters.fatal_errors()
    }

    /// Record the start of execution. Set exactly once.
    pub fn mark_started(&mut self, timestamp: DateTime<Utc>) {
        if self.start_timestamp.is_none() {
            self.start_timestamp = Some(timestamp);
        }
    }

    /// Record the end of execution. Set exactly once.
    pub fn mark_stopped(&mut self, timestamp: DateTime<Utc>) {
        if self.stop_timestamp.is_none() {
            self.stop_timestamp = Some(timestamp);
        }
    }

    pub fn start_timestamp(&self) -> Option<DateTime<Utc>> {
        self.start_timestamp
    }

    pub fn stop_timestamp(&self) -> Option<DateTime<Utc>> {
        self.stop_timestamp
    }

    /// Human-readable start time for the summary block.
    pub fn start_time_formatted(&self) -> String {
        self.start_timestamp
            .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
            .unwrap_or_else(|| "not started".to_string())
    }

    /// Append a free-text status message. Blank messages are dropped.
    pub fn add_status_message(&mut self, message: impl Into<String>) {
        let message = message.into();
        if !message.trim().is_empty() {
            self.status_messages.push(message);
        }
    }

    pub fn status_messages(&self) -> &[String] {
        &self.status_messages
    }

    /// Duration of the run, zero while it has not finished.
    pub fn duration(&self) -> Duration {
        match (self.start_timestamp, self.stop_timestamp) {
            (Some(start), Some(stop)) if stop > start => stop - start,
            _ => Duration::zero(),
        }
    }

    /// Duration in the `h:mm:ss.mmm` form used by the summary block.
    pub fn duration_formatted(&self) -> String {
        let d = self.duration();
        format!(
            "{}:{:02}:{:02}.{:03}",
            d.num_hours(),
            d.num_minutes() % 60,
            d.num_seconds() % 60,
            d.num_milliseconds() % 1000
        )
    }

    /// Derive the verdict from the final state and counters.
    pub fn verdict(&self) -> Verdict {
        Verdict::resolve(self.state, &self.counters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_state_terminal_detection() {
        assert!(!RunState::Waiting.is_ended());
        assert!(!RunState::Running.is_ended());
        assert!(RunState::Finished.is_ended());
        assert!(RunState::Canceled.is_ended());
    }

    #[test]
    fn test_case_state_never_rewinds() {
        let mut state = TestCaseState::ExecuteUsecase;
        assert!(!state.advance(TestCaseState::PreProcessing));
        assert_eq!(state, TestCaseState::ExecuteUsecase);
        assert!(state.advance(TestCaseState::ExecutedUsecase));
        assert_eq!(state, TestCaseState::ExecutedUsecase);
        // Re-setting the current state is allowed.
        assert!(state.advance(TestCaseState::ExecutedUsecase));
    }

    #[test]
    fn run_ignores_state_change_after_terminal() {
        let mut run = TestCaseRun::new("TLS_B1_FR_01", "tester");
        run.set_state(RunState::Running);
        run.set_state(RunState::Finished);
        run.set_state(RunState::Running);
        assert_eq!(run.state(), RunState::Finished);
    }

    #[test]
    fn counters_only_increase() {
        let run = TestCaseRun::new("TLS_B1_FR_01", "tester");
        let counters = run.counters();
        assert_eq!(counters.increase_warnings(), 1);
        assert_eq!(counters.increase_warnings(), 2);
        assert_eq!(counters.increase_errors(), 1);
        assert_eq!(counters.increase_fatal_errors(), 1);
        assert_eq!(run.warning_count(), 2);
        assert_eq!(run.error_count(), 1);
        assert_eq!(run.fatal_error_count(), 1);
    }

    #[test]
    fn timestamps_set_exactly_once() {
        let mut run = TestCaseRun::new("TLS_B1_FR_01", "tester");
        let first = Utc::now();
        run.mark_started(first);
        run.mark_started(first + Duration::seconds(10));
        assert_eq!(run.start_timestamp(), Some(first));

        run.mark_stopped(first + Duration::seconds(5));
        run.mark_stopped(first + Duration::seconds(50));
        assert_eq!(run.stop_timestamp(), Some(first + Duration::seconds(5)));
    }

    #[test]
    fn duration_formatting() {
        let mut run = TestCaseRun::new("TLS_B1_FR_01", "tester");
        let start = Utc::now();
        run.mark_started(start);
        run.mark_stopped(start + Duration::milliseconds(3_725_042));
        assert_eq!(run.duration_formatted(), "1:02:05.042");
    }

    #[test]
    fn duration_zero_while_running() {
        let mut run = TestCaseRun::new("TLS_B1_FR_01", "tester");
        run.mark_started(Utc::now());
        assert_eq!(run.duration(), Duration::zero());
    }

    #[test]
    fn verdict_from_counters() {
        let mut run = TestCaseRun::new("TLS_B1_FR_01", "tester");
        run.set_state(RunState::Running);
        run.set_state(RunState::Finished);
        assert_eq!(run.verdict(), Verdict::Passed);

        let run_warn = TestCaseRun::new("TLS_B1_FR_02", "tester");
        run_warn.counters().increase_warnings();
        assert_eq!(run_warn.verdict(), Verdict::PassedWithWarnings);

        let run_err = TestCaseRun::new("TLS_B1_FR_03", "tester");
        run_err.counters().increase_errors();
        assert_eq!(run_err.verdict(), Verdict::Failed);
    }

    #[test]
    fn canceled_without_errors_is_inconclusive() {
        let mut run = TestCaseRun::new("TLS_B1_FR_04", "tester");
        run.set_state(RunState::Canceled);
        assert_eq!(run.verdict(), Verdict::Inconclusive);
    }

    #[test]
    fn status_messages_skip_blank() {
        let mut run = TestCaseRun::new("TLS_B1_FR_01", "tester");
        run.add_status_message("first check done");
        run.add_status_message("   ");
        run.add_status_message("");
        run.add_status_message("second check done");
        assert_eq!(
            run.status_messages(),
            ["first check done", "second check done"]
        );
    }

    #[test]
    fn tool_log_file_names() {
        assert_eq!(
            ToolKind::TlsTestTool.log_file_name("TLS_B1_FR_01", None),
            "TLS_B1_FR_01_tls-tool.log"
        );
        let iteration = IterationCounter::new(4, 10);
        assert_eq!(
            ToolKind::Tshark.log_file_name("TLS_B1_FR_01", Some(&iteration)),
            "TLS_B1_FR_01_tshark-capture-iteration-0004-of-0010.pcap"
        );
        assert_eq!(ToolKind::OcspRequest.file_extension(), "");
    }

    #[test]
    fn iteration_counter_rendering() {
        let with_total = IterationCounter::new(4, 10);
        assert_eq!(with_total.to_string(), "Iteration 4 of 10 log output:");
        assert_eq!(with_total.file_name_suffix(), "-iteration-0004-of-0010");

        let open_ended = IterationCounter::new(2, 0);
        assert_eq!(open_ended.to_string(), "Iteration 2 log output:");
        assert_eq!(open_ended.file_name_suffix(), "-iteration-0002");
    }
}
