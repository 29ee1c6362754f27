pub mod config;
pub mod logging;
pub mod record;
pub mod types;

pub use config::{ConfigError, HarnessConfig};
pub use logging::{
    CheckerDisposition, ConsoleSink, ControlSignal, LogChannel, LogEntryChecker, LogRecord,
    LogSink, MemorySink, Severity,
};
pub use record::{ToolLogRecord, ToolLogSeverity};
pub use types::*;
