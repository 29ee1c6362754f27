//! Child process sessions for the external tools.
//!
//! A session owns exactly one child process. Output is either redirected to
//! a report file or captured line by line: one reader task per stream feeds
//! a single unbounded queue in arrival order, so the caller never blocks on
//! process I/O.

use harness_core::ToolKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{tool} exited during startup with code {exit_code}")]
    Startup { tool: &'static str, exit_code: i32 },
    #[error("{tool} executable not found: {command}")]
    CommandNotFound { tool: &'static str, command: String },
    #[error("process has not terminated")]
    NotTerminated,
    #[error("session has been released")]
    Released,
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Where the child's combined stdout/stderr goes.
#[derive(Debug, Clone)]
pub enum Capture {
    /// Line-by-line capture into the session's queue.
    Memory,
    /// Both streams appended to the file; nothing is queued.
    File(PathBuf),
}

/// One child process and its captured output.
#[derive(Debug)]
pub struct ProcessSession {
    tool: ToolKind,
    test_case_name: String,
    child: Option<Child>,
    line_rx: Option<mpsc::UnboundedReceiver<String>>,
    /// Lines pulled off the queue by a drain that was cut short before it
    /// could hand them to the caller.
    pending: Vec<String>,
    exit_code: Option<i32>,
    released: bool,
}

/// Exit code including death-by-signal (128 + signal number, so SIGTERM
/// shows up as 143).
fn status_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}

async fn read_lines_into(
    reader: impl tokio::io::AsyncRead + Unpin,
    tx: mpsc::UnboundedSender<String>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!(error = %err, "tool output stream closed with error");
                break;
            }
        }
    }
}

impl ProcessSession {
    /// Spawn the tool process.
    ///
    /// `kill_on_drop` is set so the child is reaped even if the engine
    /// aborts while the session is live. Fails with `Startup` if the child
    /// has already exited when the liveness check runs.
    pub fn spawn(
        tool: ToolKind,
        test_case_name: &str,
        program: &str,
        args: &[String],
        working_dir: Option<&Path>,
        capture: &Capture,
    ) -> Result<Self> {
        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        debug!(
            tool = tool.name(),
            test_case = test_case_name,
            command = %format!("{program} {}", args.join(" ")),
            working_dir = ?working_dir,
            "spawning tool process"
        );

        match capture {
            Capture::Memory => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
            Capture::File(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                let stderr_file = file.try_clone()?;
                cmd.stdout(Stdio::from(file)).stderr(Stdio::from(stderr_file));
            }
        }

        let mut child = cmd.spawn().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                SessionError::CommandNotFound {
                    tool: tool.name(),
                    command: program.to_string(),
                }
            } else {
                SessionError::Io(err)
            }
        })?;

        let line_rx = if matches!(capture, Capture::Memory) {
            let (tx, rx) = mpsc::unbounded_channel();
            if let Some(stdout) = child.stdout.take() {
                let tx = tx.clone();
                tokio::spawn(read_lines_into(stdout, tx));
            }
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(read_lines_into(stderr, tx));
            }
            Some(rx)
        } else {
            None
        };

        // Liveness check: a child that is already gone never got to serve.
        if let Some(status) = child.try_wait()? {
            return Err(SessionError::Startup {
                tool: tool.name(),
                exit_code: status_code(status),
            });
        }

        Ok(Self {
            tool,
            test_case_name: test_case_name.to_string(),
            child: Some(child),
            line_rx,
            pending: Vec::new(),
            exit_code: None,
            released: false,
        })
    }

    pub fn tool(&self) -> ToolKind {
        self.tool
    }

    pub fn test_case_name(&self) -> &str {
        &self.test_case_name
    }

    /// Whether the process is still alive. Records the exit code as a side
    /// effect when the process has just terminated.
    pub fn is_running(&mut self) -> bool {
        if self.exit_code.is_some() {
            return false;
        }
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                self.exit_code = Some(status_code(status));
                false
            }
            Ok(None) => true,
            Err(err) => {
                warn!(tool = self.tool.name(), error = %err, "try_wait failed");
                false
            }
        }
    }

    /// Block until the process exits, returning its exit code.
    pub async fn wait(&mut self) -> Result<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let child = self.child.as_mut().ok_or(SessionError::Released)?;
        let status = child.wait().await?;
        let code = status_code(status);
        self.exit_code = Some(code);
        Ok(code)
    }

    /// Block until the process exits or the timeout elapses.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<i32>> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Exit code of the terminated process; fails before termination.
    pub fn exit_code(&self) -> Result<i32> {
        self.exit_code.ok_or(SessionError::NotTerminated)
    }

    /// Request graceful termination: SIGTERM, wait up to `grace`, then
    /// force-kill. Returns the exit code.
    pub async fn stop(&mut self, grace: Duration) -> Result<i32> {
        if !self.is_running() {
            return self.wait().await;
        }

        #[cfg(unix)]
        {
            if let Some(pid) = self.child.as_ref().and_then(Child::id) {
                let pid = nix::unistd::Pid::from_raw(pid as i32);
                if let Err(err) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
                    warn!(tool = self.tool.name(), error = %err, "SIGTERM failed");
                }
            }
            if let Some(code) = self.wait_timeout(grace).await? {
                return Ok(code);
            }
            warn!(
                tool = self.tool.name(),
                grace_ms = grace.as_millis() as u64,
                "process ignored stop request; killing"
            );
        }
        #[cfg(not(unix))]
        let _ = grace;

        self.destroy().await
    }

    /// Force-kill immediately. Returns the exit code.
    pub async fn destroy(&mut self) -> Result<i32> {
        if let Some(child) = self.child.as_mut() {
            if self.exit_code.is_none() {
                child.kill().await?;
            }
        }
        self.wait().await
    }

    /// Pull all currently queued lines without blocking.
    pub fn drain_lines(&mut self) -> Vec<String> {
        let mut lines = std::mem::take(&mut self.pending);
        if let Some(rx) = self.line_rx.as_mut() {
            while let Ok(line) = rx.try_recv() {
                lines.push(line);
            }
        }
        lines
    }

    /// Wait for the process to exit, pull every remaining queued line and
    /// release the child handle. Idempotent: later calls return nothing.
    ///
    /// Cancellation-safe: lines go through `pending` and the receiver stays
    /// on the session, so a drain cut off at the await point keeps every
    /// line read so far available to later queries.
    pub async fn drain_and_cleanup(&mut self) -> Result<Vec<String>> {
        if self.released {
            return Ok(Vec::new());
        }

        let _ = self.wait().await?;

        // The reader tasks drop their senders once the pipes close, so a
        // blocking drain terminates when the last line is through.
        if let Some(rx) = self.line_rx.as_mut() {
            while let Some(line) = rx.recv().await {
                self.pending.push(line);
            }
        }
        self.line_rx = None;

        self.child = None;
        self.released = true;
        Ok(std::mem::take(&mut self.pending))
    }
}
