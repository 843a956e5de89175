//! Runs an external, long-lived process as a monitorable and cooperatively
//! cancellable unit of work.
//!
//! The [`Executor`] polls the child once per tick. On every tick it first asks
//! the caller whether the operation should stop; if not, it reports progress
//! and waits for at most one more tick. Cancellation is therefore honoured
//! within one poll interval, and the executor always waits for the child to
//! exit before returning so no orphaned process is left behind.
use crate::error::{Error, Result};
use std::fmt;
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// One polling tick.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long a process gets to honour SIGTERM before it is killed outright.
pub const DEFAULT_TERMINATION_GRACE: Duration = Duration::from_secs(10);

/// A program and its arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// The terminal state of one executor run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The process exited with status 0.
    Completed,
    /// The caller asked to stop and the process has exited.
    Cancelled,
    /// The process exited with a nonzero status or was killed by a signal.
    Failed,
}

/// What a finished process left behind. Created once per run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationResult {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub outcome: Outcome,
}

impl OperationResult {
    /// Describes a failed run of `program` as a [`Error::CommandFailed`].
    pub fn to_error(&self, program: &str) -> Error {
        Error::CommandFailed {
            program: program.to_string(),
            exit_code: self.exit_code,
            stderr: self.stderr.clone(),
        }
    }
}

/// Drains a child pipe on a background thread so a chatty process never
/// blocks on a full pipe buffer.
pub(crate) fn drain<R>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

/// Joins a drain thread and decodes what it collected.
pub(crate) fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|buf| String::from_utf8_lossy(&buf).trim_end().to_string())
        .unwrap_or_default()
}

/// Runs commands under the polling loop described in the module docs.
#[derive(Clone, Debug)]
pub struct Executor {
    poll_interval: Duration,
    termination_grace: Duration,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_TERMINATION_GRACE)
    }
}

impl Executor {
    pub fn new(poll_interval: Duration, termination_grace: Duration) -> Self {
        Self {
            poll_interval,
            termination_grace,
        }
    }

    /// Runs `spec` to completion or cancellation.
    ///
    /// `on_progress` is called once per tick while the process is running.
    /// `should_cancel` is checked before each progress call; once it returns
    /// `true` the process is asked to terminate and the run ends as
    /// [`Outcome::Cancelled`] after the process has exited.
    ///
    /// # Errors
    ///
    /// Only failures to launch or wait on the process are errors
    /// ([`Error::CommandNotFound`], [`Error::PermissionDenied`],
    /// [`Error::IoUnavailable`]). A nonzero exit is reported through
    /// [`Outcome::Failed`].
    pub fn run<P, C>(
        &self,
        spec: &CommandSpec,
        mut on_progress: P,
        mut should_cancel: C,
    ) -> Result<OperationResult>
    where
        P: FnMut(),
        C: FnMut() -> bool,
    {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::spawn(&spec.program, e))?;

        info!(command = %spec, pid = child.id(), "process started");

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            if let Some(status) = self.poll(&mut child, &spec.program, Duration::ZERO)? {
                break status;
            }

            if should_cancel() {
                warn!(command = %spec, "cancellation requested, terminating process");
                let status = self.terminate(&mut child, &spec.program)?;
                info!(command = %spec, ?status, "process exited after cancellation");
                return Ok(OperationResult {
                    exit_code: status.code(),
                    stdout: collect(stdout),
                    stderr: collect(stderr),
                    outcome: Outcome::Cancelled,
                });
            }

            on_progress();

            if let Some(status) = self.poll(&mut child, &spec.program, self.poll_interval)? {
                break status;
            }
        };

        let result = OperationResult {
            exit_code: status.code(),
            stdout: collect(stdout),
            stderr: collect(stderr),
            outcome: if status.success() {
                Outcome::Completed
            } else {
                Outcome::Failed
            },
        };

        match result.outcome {
            Outcome::Completed => info!(command = %spec, "process completed"),
            _ => warn!(
                command = %spec,
                exit_code = ?result.exit_code,
                stderr = %result.stderr,
                "process failed"
            ),
        }

        Ok(result)
    }

    /// Waits up to `timeout` for the child; `Duration::ZERO` only checks.
    fn poll(
        &self,
        child: &mut Child,
        program: &str,
        timeout: Duration,
    ) -> Result<Option<ExitStatus>> {
        let polled = if timeout.is_zero() {
            child.try_wait()
        } else {
            child.wait_timeout(timeout)
        };
        polled.map_err(|e| {
            let _ = child.kill();
            let _ = child.wait();
            Error::io(program, e)
        })
    }

    /// Asks the child to stop, escalating to a kill after the grace period,
    /// and reaps it.
    fn terminate(&self, child: &mut Child, program: &str) -> Result<ExitStatus> {
        request_termination(child);

        if let Some(status) = child
            .wait_timeout(self.termination_grace)
            .map_err(|e| Error::io(program, e))?
        {
            return Ok(status);
        }

        warn!(
            program,
            grace_secs = self.termination_grace.as_secs(),
            "process ignored termination request, killing"
        );
        if let Err(err) = child.kill() {
            debug!(program, %err, "kill failed, process may already be gone");
        }
        child.wait().map_err(|e| Error::io(program, e))
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Err(err) = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM) {
        debug!(pid = child.id(), %err, "SIGTERM not delivered");
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    let _ = child.kill();
}
