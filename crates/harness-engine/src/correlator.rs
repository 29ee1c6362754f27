//! Evidence correlation against a tool's streamed output.
//!
//! The correlator turns the session's raw line queue into an append-only
//! list of parsed records and answers "was message M logged" queries under
//! a deadline while the tool may still be producing output. Drained records
//! are never consumed by a search: repeated queries on a terminated, fully
//! drained session return the same result.

use crate::session::{ProcessSession, SessionError};
use harness_core::logging::{ControlSignal, LogChannel, Severity};
use harness_core::{HarnessConfig, IterationCounter, ToolLogRecord};
use regex::Regex;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Exit codes a tool may end with without the run failing: clean exit and
/// death by SIGTERM from a stop request.
const ACCEPTABLE_EXIT_CODES: [i32; 2] = [0, 143];

#[derive(Debug, Error)]
pub enum CorrelatorError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("invalid search pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
    #[error("{tool} failed with exit code {exit_code}")]
    ToolFailed { tool: &'static str, exit_code: i32 },
    #[error("couldn't find the key \"{key}\" in {tool} output")]
    KeyNotFound { key: String, tool: &'static str },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CorrelatorError>;

/// How a pattern is matched against a record's message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Substring containment.
    Contains,
    /// Full regular-expression match of the whole message.
    Regex,
}

enum Matcher {
    Contains(String),
    Regex(Regex),
}

impl Matcher {
    fn compile(pattern: &str, mode: MatchMode) -> Result<Self> {
        match mode {
            MatchMode::Contains => Ok(Self::Contains(pattern.to_string())),
            MatchMode::Regex => Ok(Self::Regex(Regex::new(&format!("^(?:{pattern})$"))?)),
        }
    }

    fn matches(&self, message: &str) -> bool {
        match self {
            Self::Contains(needle) => message.contains(needle.as_str()),
            Self::Regex(re) => re.is_match(message),
        }
    }
}

/// Queryable, append-only log of one tool session.
pub struct LogCorrelator {
    session: ProcessSession,
    channel: Arc<LogChannel>,
    config: HarnessConfig,
    iteration: Option<IterationCounter>,
    records: Vec<ToolLogRecord>,
    output_complete: bool,
    cancel: CancellationToken,
}

impl std::fmt::Debug for LogCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogCorrelator")
            .field("tool", &self.session.tool().name())
            .field("test_case", &self.session.test_case_name())
            .field("records", &self.records.len())
            .field("output_complete", &self.output_complete)
            .finish()
    }
}

impl LogCorrelator {
    pub fn new(
        session: ProcessSession,
        channel: Arc<LogChannel>,
        config: HarnessConfig,
        iteration: Option<IterationCounter>,
    ) -> Self {
        Self {
            session,
            channel,
            config,
            iteration,
            records: Vec::new(),
            output_complete: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Wire the correlator's wait loops to an operator abort token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn session(&mut self) -> &mut ProcessSession {
        &mut self.session
    }

    pub fn records(&self) -> &[ToolLogRecord] {
        &self.records
    }

    /// Parse everything currently queued into records. Returns how many
    /// records were appended. Never blocks, never reorders, never drops a
    /// parseable line.
    pub fn drain_new_lines(&mut self) -> usize {
        let lines = self.session.drain_lines();
        self.append_lines(&lines)
    }

    fn append_lines(&mut self, lines: &[String]) -> usize {
        let before = self.records.len();
        for line in lines {
            if let Some(record) = ToolLogRecord::parse_line(line) {
                self.records.push(record);
            }
        }
        self.records.len() - before
    }

    /// Search for a record matching `pattern` within the configured timeout.
    ///
    /// Already-drained records are checked first; then the wait loop drains
    /// on the poll tick, checking only newly arrived records, until a match
    /// is found, the process terminates (one final drain decides), or the
    /// deadline elapses. A timed-out search returns `Ok(None)` and leaves
    /// the session usable for later queries.
    pub async fn find_message(
        &mut self,
        pattern: &str,
        mode: MatchMode,
    ) -> Result<Option<ToolLogRecord>> {
        enum WaitOutcome {
            Hit(ToolLogRecord),
            Terminated,
            Canceled,
        }

        let matcher = Matcher::compile(pattern, mode)?;

        self.drain_new_lines();
        if let Some(hit) = self.search_from(0, &matcher) {
            return Ok(Some(hit));
        }
        if self.output_complete {
            return Ok(None);
        }

        let deadline = self.config.message_search_timeout();
        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let cancel = self.cancel.clone();

        // The final drain of a terminated process happens outside this
        // timeout: cutting it off mid-drain must not strand queued lines.
        let wait = async {
            loop {
                let scanned = self.records.len();
                self.drain_new_lines();
                if let Some(hit) = self.search_from(scanned, &matcher) {
                    return WaitOutcome::Hit(hit);
                }
                if !self.session.is_running() {
                    return WaitOutcome::Terminated;
                }
                tokio::select! {
                    _ = poll.tick() => {}
                    () = cancel.cancelled() => return WaitOutcome::Canceled,
                }
            }
        };
        let outcome = tokio::time::timeout(deadline, wait).await;

        match outcome {
            Ok(WaitOutcome::Hit(hit)) => Ok(Some(hit)),
            Ok(WaitOutcome::Terminated) => self.search_after_termination(&matcher).await,
            Ok(WaitOutcome::Canceled) => {
                debug!(tool = self.session.tool().name(), "log search canceled");
                Ok(None)
            }
            Err(_) => {
                debug!(
                    tool = self.session.tool().name(),
                    pattern, "log search timed out"
                );
                Ok(None)
            }
        }
    }

    /// Final drain and search once the process has terminated. The drain
    /// gets its own deadline so a grandchild holding the pipes open cannot
    /// stall the query; a cut-short drain keeps the queued lines on the
    /// session for later calls.
    async fn search_after_termination(
        &mut self,
        matcher: &Matcher,
    ) -> Result<Option<ToolLogRecord>> {
        let deadline = self.config.message_search_timeout();
        let scanned = self.records.len();
        let drained = tokio::time::timeout(deadline, self.session.drain_and_cleanup()).await;
        match drained {
            Ok(remnant) => {
                self.append_lines(&remnant?);
                let hit = self.search_from(scanned, matcher);
                self.process_logging_output(false).await?;
                Ok(hit)
            }
            Err(_) => {
                debug!(
                    tool = self.session.tool().name(),
                    "final output drain timed out"
                );
                self.drain_new_lines();
                Ok(self.search_from(scanned, matcher))
            }
        }
    }

    fn search_from(&self, start: usize, matcher: &Matcher) -> Option<ToolLogRecord> {
        self.records[start..]
            .iter()
            .find(|record| matcher.matches(&record.message))
            .cloned()
    }

    /// All records matching `pattern` by containment, after the tool's
    /// output has been fully collected.
    pub async fn find_messages(&mut self, pattern: &str) -> Result<Vec<ToolLogRecord>> {
        self.process_logging_output(false).await?;
        Ok(self
            .records
            .iter()
            .filter(|record| record.message.contains(pattern))
            .cloned()
            .collect())
    }

    /// Wait for the tool to exit, collect the rest of its output and check
    /// the exit code. A non-acceptable exit dumps the captured lines on the
    /// channel (ERROR when `handle_no_log_as_error`, INFO otherwise) and,
    /// when `handle_no_log_as_error`, fails. Idempotent.
    pub async fn process_logging_output(&mut self, handle_no_log_as_error: bool) -> Result<()> {
        if self.output_complete {
            return Ok(());
        }

        let exit_code = self.session.wait().await?;
        let remnant = self.session.drain_and_cleanup().await?;
        self.append_lines(&remnant);
        self.output_complete = true;

        if !ACCEPTABLE_EXIT_CODES.contains(&exit_code) {
            let severity = if handle_no_log_as_error {
                Severity::Error
            } else {
                Severity::Info
            };
            let tool = self.session.tool().name();
            self.channel.emit(
                severity,
                format!("{tool} exited with code {exit_code}. Captured output follows."),
            );
            if let Some(iteration) = &self.iteration {
                self.channel.emit(severity, iteration.to_string());
            }
            for record in &self.records {
                self.channel.emit(severity, record.to_string());
            }
            if handle_no_log_as_error {
                return Err(CorrelatorError::ToolFailed { tool, exit_code });
            }
        }
        Ok(())
    }

    /// Check that `pattern` shows up in the tool output, announcing the
    /// expectation and the outcome on the channel. A miss is logged at
    /// `severity_on_miss` together with closest-match diagnostics.
    pub async fn assert_message_logged(
        &mut self,
        pattern: &str,
        severity_on_miss: Severity,
    ) -> Result<bool> {
        self.assert_logged(pattern, MatchMode::Contains, severity_on_miss)
            .await
    }

    /// Regex variant of [`assert_message_logged`](Self::assert_message_logged).
    pub async fn assert_message_match_logged(
        &mut self,
        pattern: &str,
        severity_on_miss: Severity,
    ) -> Result<bool> {
        self.assert_logged(pattern, MatchMode::Regex, severity_on_miss)
            .await
    }

    async fn assert_logged(
        &mut self,
        pattern: &str,
        mode: MatchMode,
        severity_on_miss: Severity,
    ) -> Result<bool> {
        self.channel
            .info(format!("Expected log message: \"{pattern}\""));
        match self.find_message(pattern, mode).await? {
            Some(record) => {
                self.channel.info(format!("Found log message: \"{record}\""));
                Ok(true)
            }
            None => {
                self.channel.emit(
                    severity_on_miss,
                    format!("Could not find the log message: \"{pattern}\""),
                );
                if let Some(closest) = self.find_closest_message(pattern) {
                    self.channel.emit(
                        severity_on_miss,
                        format!("Closest message found: \"{closest}\""),
                    );
                }
                Ok(false)
            }
        }
    }

    /// For a missed `key=value` pattern, surface what the tool actually
    /// logged for `key`. Diagnostic only; does not affect the verdict.
    pub fn find_closest_message(&self, key_value: &str) -> Option<ToolLogRecord> {
        let (key, _) = key_value.split_once('=')?;
        self.records
            .iter()
            .find(|record| record.message.contains(key))
            .cloned()
    }

    /// Extract the value of a `key=value` line. A missing key is logged at
    /// ERROR and fails the lookup.
    pub async fn get_value(&mut self, key: &str) -> Result<String> {
        match self.value_of(key, Severity::Error).await? {
            Some(value) => Ok(value),
            None => Err(CorrelatorError::KeyNotFound {
                key: key.to_string(),
                tool: self.session.tool().name(),
            }),
        }
    }

    /// Like [`get_value`](Self::get_value), but a missing key is merely
    /// informational.
    pub async fn get_optional_value(&mut self, key: &str) -> Result<Option<String>> {
        self.value_of(key, Severity::Info).await
    }

    async fn value_of(&mut self, key: &str, severity_on_miss: Severity) -> Result<Option<String>> {
        let prefix = format!("{key}=");
        match self.find_message(&prefix, MatchMode::Contains).await? {
            Some(record) => {
                if let Some(index) = record.message.find(&prefix) {
                    let value = record.message[index + prefix.len()..].to_string();
                    return Ok(Some(value));
                }
                self.channel
                    .emit(severity_on_miss, format!("Couldn't find the key \"{key}\""));
                Ok(None)
            }
            None => {
                self.channel
                    .emit(severity_on_miss, format!("Couldn't find the key \"{key}\""));
                Ok(None)
            }
        }
    }

    /// Report file for this session, derived from the test case name, tool
    /// and iteration.
    pub fn report_file_path(&self) -> PathBuf {
        let name = self.session.tool().log_file_name(
            self.session.test_case_name(),
            self.iteration.as_ref(),
        );
        self.config
            .test_case_report_dir(self.session.test_case_name())
            .join(name)
    }

    /// Append all held records to the session's report file and announce
    /// the produced file on the channel.
    pub fn write_records_to_file(&self) -> Result<PathBuf> {
        let path = self.report_file_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        for record in &self.records {
            writeln!(file, "{record}")?;
        }
        self.channel.info(format!(
            "{} log written to {}",
            self.session.tool().name(),
            path.display()
        ));
        self.channel
            .control(ControlSignal::ToolLogWritten { path: path.clone() });
        Ok(path)
    }

    /// Teardown helper: collect the remaining output (bounded by the
    /// teardown guard, force-stopping a tool that will not exit) and write
    /// the report file. Failures are logged, never propagated; teardown
    /// must keep going.
    pub async fn clean_and_exit(&mut self) {
        let guard = self.config.teardown_guard();
        match tokio::time::timeout(guard, self.process_logging_output(false)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.channel.error_with_detail(
                    format!("Failed to collect {} output", self.session.tool().name()),
                    err.to_string(),
                );
                self.output_complete = false;
            }
            Err(_) => {
                self.channel.warning(format!(
                    "{} did not exit within {}s; force-stopping",
                    self.session.tool().name(),
                    guard.as_secs()
                ));
                let grace = self.config.stop_grace_period();
                if let Err(err) = self.session.stop(grace).await {
                    self.channel.error_with_detail(
                        format!("Failed to stop {}", self.session.tool().name()),
                        err.to_string(),
                    );
                }
                self.drain_new_lines();
            }
        }

        if let Err(err) = self.write_records_to_file() {
            self.channel.error_with_detail(
                format!(
                    "Failed to write {} report file",
                    self.session.tool().name()
                ),
                err.to_string(),
            );
        }
    }

    /// Stop the tool, then collect and check its output.
    pub async fn stop(&mut self) -> Result<i32> {
        let grace = self.config.stop_grace_period();
        let exit_code = self.session.stop(grace).await?;
        self.process_logging_output(false).await?;
        Ok(exit_code)
    }
}
