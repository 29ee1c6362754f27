//! Shared logging channel for test evidence.
//!
//! This is the domain-level channel test cases, the correlator and the
//! executor write to. It is distinct from `tracing`, which carries the
//! engine's own operational diagnostics: records on this channel are test
//! *evidence* and feed the verdict counters via the installed checker.
//!
//! There is no process-wide singleton. The channel is constructed by the
//! caller, wrapped in an `Arc` and passed explicitly to everything that
//! needs it.

use crate::types::{Phase, RunState, TestCaseState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Severity of one log record on the evidence channel.
///
/// `Step` marks the begin of a named test step and is informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
    Step,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
            Self::Step => "STEP",
        }
    }
}

/// One record on the evidence channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
    /// Underlying error rendered to text, for `Error`/`Fatal` records.
    pub error_detail: Option<String>,
}

impl LogRecord {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            message: message.into(),
            error_detail: None,
        }
    }

    pub fn with_detail(severity: Severity, message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            message: message.into(),
            error_detail: Some(detail.into()),
        }
    }
}

/// Typed control events, delivered alongside the record stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum ControlSignal {
    TestCaseStarted { test_case_name: String },
    TestCaseEnded { test_case_name: String },
    RunStateChanged { state: RunState },
    TestCaseStateChanged { state: TestCaseState },
    PhaseBegin { phase: Phase },
    PhaseEnd { phase: Phase },
    TestCaseDescription { text: String },
    TestCasePurpose { text: String },
    ToolLogWritten { path: PathBuf },
}

/// Receiver of the record and control streams, e.g. a console or file writer.
pub trait LogSink: Send {
    fn on_record(&self, record: &LogRecord);

    /// Control signals are informational for most sinks.
    fn on_control(&self, _signal: &ControlSignal) {}
}

/// Whether a checker stays installed after handling a control signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckerDisposition {
    Keep,
    Finished,
}

/// Inspects every record before the sinks see it. At most one checker is
/// installed at a time; it deregisters itself by returning `Finished`.
pub trait LogEntryChecker: Send {
    fn on_record(&mut self, record: &LogRecord);

    fn on_control(&mut self, signal: &ControlSignal) -> CheckerDisposition;
}

struct ChannelInner {
    sinks: Vec<Box<dyn LogSink>>,
    checker: Option<Box<dyn LogEntryChecker>>,
}

/// The shared evidence channel. Every record is delivered to the installed
/// checker first, then to all sinks in registration order.
pub struct LogChannel {
    inner: Mutex<ChannelInner>,
}

impl std::fmt::Debug for LogChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogChannel").finish_non_exhaustive()
    }
}

impl Default for LogChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl LogChannel {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ChannelInner {
                sinks: Vec::new(),
                checker: None,
            }),
        }
    }

    /// Convenience constructor for the common shared form.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn add_sink(&self, sink: Box<dyn LogSink>) {
        let mut inner = self.lock();
        inner.sinks.push(sink);
    }

    /// Install the run's checker. A still-installed previous checker is
    /// stale at this point; it is dropped so it cannot pollute the new
    /// run's counters.
    pub fn install_checker(&self, checker: Box<dyn LogEntryChecker>) {
        let mut inner = self.lock();
        if inner.checker.is_some() {
            tracing::warn!("replacing a still-installed log entry checker");
        }
        inner.checker = Some(checker);
    }

    pub fn has_checker(&self) -> bool {
        self.lock().checker.is_some()
    }

    /// Deliver one record: checker first, then sinks in order.
    pub fn log(&self, record: LogRecord) {
        let mut inner = self.lock();
        if let Some(checker) = inner.checker.as_mut() {
            checker.on_record(&record);
        }
        for sink in &inner.sinks {
            sink.on_record(&record);
        }
    }

    /// Deliver one control signal; the checker may deregister itself.
    pub fn control(&self, signal: ControlSignal) {
        let mut inner = self.lock();
        if let Some(checker) = inner.checker.as_mut() {
            if checker.on_control(&signal) == CheckerDisposition::Finished {
                inner.checker = None;
            }
        }
        for sink in &inner.sinks {
            sink.on_control(&signal);
        }
    }

    pub fn emit(&self, severity: Severity, message: impl Into<String>) {
        self.log(LogRecord::new(severity, message));
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.emit(Severity::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(Severity::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.emit(Severity::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(Severity::Error, message);
    }

    pub fn fatal(&self, message: impl Into<String>) {
        self.emit(Severity::Fatal, message);
    }

    pub fn step(&self, message: impl Into<String>) {
        self.emit(Severity::Step, message);
    }

    pub fn error_with_detail(&self, message: impl Into<String>, detail: impl Into<String>) {
        self.log(LogRecord::with_detail(Severity::Error, message, detail));
    }

    pub fn fatal_with_detail(&self, message: impl Into<String>, detail: impl Into<String>) {
        self.log(LogRecord::with_detail(Severity::Fatal, message, detail));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChannelInner> {
        // Sinks and checkers do not panic while holding the lock; recover
        // the guard rather than poisoning the whole channel.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Sink forwarding evidence records to `tracing`.
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl LogSink for ConsoleSink {
    fn on_record(&self, record: &LogRecord) {
        match record.severity {
            Severity::Debug => tracing::debug!(target: "evidence", "{}", record.message),
            Severity::Info | Severity::Step => {
                tracing::info!(target: "evidence", "{}", record.message);
            }
            Severity::Warning => tracing::warn!(target: "evidence", "{}", record.message),
            Severity::Error | Severity::Fatal => {
                if let Some(detail) = &record.error_detail {
                    tracing::error!(target: "evidence", detail = %detail, "{}", record.message);
                } else {
                    tracing::error!(target: "evidence", "{}", record.message);
                }
            }
        }
    }

    fn on_control(&self, signal: &ControlSignal) {
        tracing::debug!(target: "evidence", ?signal, "control signal");
    }
}

/// In-memory sink for tests; clones share the same buffers.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<LogRecord>>>,
    controls: Arc<Mutex<Vec<ControlSignal>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn controls(&self) -> Vec<ControlSignal> {
        self.controls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn contains_message(&self, needle: &str) -> bool {
        self.records()
            .iter()
            .any(|record| record.message.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn on_record(&self, record: &LogRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
    }

    fn on_control(&self, signal: &ControlSignal) {
        if let Ok(mut controls) = self.controls.lock() {
            controls.push(signal.clone());
        }
    }
}
