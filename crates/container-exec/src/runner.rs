use std::io;
use std::process::{Command, ExitStatus, Stdio};
use tracing::debug;

#[cfg(any(test, feature = "test-util"))]
use std::{fs, sync::Mutex};

#[cfg(unix)]
use crate::signals::SignalGuard;

/// How the runtime process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Exited(i32),
    Signaled(i32),
}

impl RunOutcome {
    /// Exit code as a POSIX shell would report it.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Exited(code) => *code,
            RunOutcome::Signaled(signal) => 128 + signal,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, RunOutcome::Exited(0))
    }
}

impl From<ExitStatus> for RunOutcome {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return RunOutcome::Exited(code);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return RunOutcome::Signaled(signal);
            }
        }

        RunOutcome::Exited(1)
    }
}

/// Runs an external program with inherited standard streams and waits for it.
pub trait ProcessRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<RunOutcome>;
}

/// Spawns real processes through [`std::process::Command`].
///
/// On unix, SIGINT, SIGTERM and SIGHUP received while the child runs do not
/// kill the caller. The child is told to stop and the call returns
/// [`RunOutcome::Signaled`] for the received signal, so callers still run
/// their cleanup.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<RunOutcome> {
        debug!(program, ?args, "spawning process");

        #[cfg(unix)]
        let guard = SignalGuard::install()?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;

        #[cfg(unix)]
        guard.watch(child.id());

        let outcome = RunOutcome::from(child.wait()?);

        #[cfg(unix)]
        if let Some(signal) = guard.received() {
            debug!(signal, child = ?outcome, "interrupted while runtime was running");
            return Ok(RunOutcome::Signaled(signal));
        }

        Ok(outcome)
    }
}

#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
    /// Contents of the `--env-file` argument at call time, if one was passed
    /// and readable.
    pub env_file_contents: Option<String>,
}

/// Test double that records every call and answers with a fixed outcome.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug)]
pub struct RecordingRunner {
    outcome: RunOutcome,
    calls: Mutex<Vec<RecordedCall>>,
}

#[cfg(any(test, feature = "test-util"))]
impl RecordingRunner {
    pub fn new(outcome: RunOutcome) -> Self {
        Self {
            outcome,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn exiting_with(code: i32) -> Self {
        Self::new(RunOutcome::Exited(code))
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

#[cfg(any(test, feature = "test-util"))]
impl ProcessRunner for RecordingRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<RunOutcome> {
        let env_file_contents = args
            .iter()
            .position(|a| a == "--env-file")
            .and_then(|idx| args.get(idx + 1))
            .and_then(|path| fs::read_to_string(path).ok());

        let call = RecordedCall {
            program: program.to_string(),
            args: args.to_vec(),
            env_file_contents,
        };
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        Ok(self.outcome)
    }
}
