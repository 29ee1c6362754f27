//! harness-engine - test execution and evidence correlation
//!
//! Runs conformance test cases against external protocol tools: spawns and
//! supervises the tool processes, captures their output, answers timed
//! "was message M logged" queries and reconciles everything into a verdict
//! per test case.

pub mod checker;
pub mod control;
pub mod correlator;
pub mod executor;
pub mod session;

pub use checker::RunLogChecker;
pub use control::ExecutionControl;
pub use correlator::{CorrelatorError, LogCorrelator, MatchMode};
pub use executor::{PhaseError, TestCase, TestCaseExecutor, TestContext};
pub use session::{Capture, ProcessSession, SessionError};
