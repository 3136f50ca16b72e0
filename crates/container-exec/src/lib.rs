pub mod env_file;
pub mod runner;
#[cfg(unix)]
mod signals;

pub use env_file::{
    python_bool, CleanupPolicy, EnvEntry, EnvFile, EnvFileBuilder, EnvFileError, SECRET_KEY,
    SQLITE_KEY,
};
pub use runner::{ProcessRunner, RunOutcome, SystemRunner};
#[cfg(any(test, feature = "test-util"))]
pub use runner::{RecordedCall, RecordingRunner};

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, instrument, warn};

pub const DEFAULT_RUNTIME: &str = "docker";
pub const DEFAULT_IMAGE: &str = "majority-judgment/api-python:latest";
pub const DEFAULT_COMMAND: &str = "pytest";

/// The runtime, image and in-container command for one test run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInvocation {
    pub runtime: String,
    pub image: String,
    pub command: Vec<String>,
}

impl Default for ContainerInvocation {
    fn default() -> Self {
        Self {
            runtime: DEFAULT_RUNTIME.to_string(),
            image: DEFAULT_IMAGE.to_string(),
            command: vec![DEFAULT_COMMAND.to_string()],
        }
    }
}

impl ContainerInvocation {
    pub fn validate(&self) -> Result<(), ExecError> {
        if self.runtime.trim().is_empty() {
            return Err(ExecError::InvalidInvocation {
                message: "Container runtime cannot be empty".to_string(),
            });
        }

        if self.image.trim().is_empty() {
            return Err(ExecError::InvalidInvocation {
                message: "Container image cannot be empty".to_string(),
            });
        }

        if self.command.is_empty() || self.command[0].trim().is_empty() {
            return Err(ExecError::InvalidInvocation {
                message: "Container command cannot be empty".to_string(),
            });
        }

        Ok(())
    }

    /// Arguments passed to the runtime binary.
    pub fn args(&self, env_file: &Path) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--env-file".to_string(),
            env_file.to_string_lossy().to_string(),
            self.image.clone(),
        ];
        args.extend(self.command.iter().cloned());
        args
    }

    /// Shell-quoted command line, suitable for printing.
    pub fn command_line(&self, env_file: &Path) -> String {
        let mut out = shell_quote(&self.runtime);
        for arg in self.args(env_file) {
            out.push(' ');
            out.push_str(&shell_quote(&arg));
        }
        out
    }
}

/// Everything needed to build the env-file and start the container.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub invocation: ContainerInvocation,
    pub secret: String,
    pub sqlite: bool,
    pub extra_env: Vec<EnvEntry>,
    pub cleanup: CleanupPolicy,
    pub dry_run: bool,
    /// Directory for the env-file; the host temp directory when unset.
    pub temp_dir: Option<PathBuf>,
}

impl RunPlan {
    pub fn new(invocation: ContainerInvocation, secret: impl Into<String>) -> Self {
        Self {
            invocation,
            secret: secret.into(),
            sqlite: true,
            extra_env: Vec::new(),
            cleanup: CleanupPolicy::default(),
            dry_run: false,
            temp_dir: None,
        }
    }

    pub fn env_file_builder(&self) -> Result<EnvFileBuilder, EnvFileError> {
        let mut builder = match &self.temp_dir {
            Some(dir) => EnvFileBuilder::new().in_dir(dir),
            None => EnvFileBuilder::new(),
        };
        builder.push(EnvEntry::new(SECRET_KEY, self.secret.as_str())?)?;
        builder.push(EnvEntry::new(SQLITE_KEY, python_bool(self.sqlite))?)?;
        for entry in &self.extra_env {
            builder.push(entry.clone())?;
        }
        Ok(builder)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// `None` for a dry run.
    pub outcome: Option<RunOutcome>,
    pub command_line: String,
    pub env_file: PathBuf,
    /// Set when the cleanup policy kept the env-file on disk.
    pub kept_env_file: Option<PathBuf>,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.outcome.map(|o| o.exit_code()).unwrap_or(0)
    }
}

/// Write the env-file, invoke the runtime once, then apply the cleanup policy.
///
/// The runtime's outcome is reported as-is; a non-zero exit is not an error.
#[instrument(skip_all, fields(runtime = %plan.invocation.runtime, image = %plan.invocation.image))]
pub fn execute(plan: &RunPlan, runner: &dyn ProcessRunner) -> Result<RunReport, ExecError> {
    plan.invocation.validate()?;

    let env_file = plan.env_file_builder()?.write()?;
    let env_path = env_file.path().to_path_buf();
    let args = plan.invocation.args(&env_path);
    let command_line = plan.invocation.command_line(&env_path);

    let outcome = if plan.dry_run {
        info!(%command_line, "dry run; runtime not invoked");
        Ok(None)
    } else {
        info!(%command_line, "starting container");
        runner
            .run(&plan.invocation.runtime, &args)
            .map(Some)
            .map_err(|source| ExecError::RuntimeSpawn {
                runtime: plan.invocation.runtime.clone(),
                source,
            })
    };

    let kept_env_file = env_file.release(plan.cleanup);
    let outcome = outcome?;

    match outcome {
        Some(outcome) if outcome.success() => info!("container exited successfully"),
        Some(outcome) => warn!(code = outcome.exit_code(), "container exited with failure"),
        None => {}
    }

    Ok(RunReport {
        outcome,
        command_line,
        env_file: env_path,
        kept_env_file,
    })
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Invalid container invocation: {message}")]
    InvalidInvocation { message: String },

    #[error("Failed to spawn container runtime '{runtime}': {source}")]
    RuntimeSpawn { runtime: String, source: io::Error },

    #[error(transparent)]
    EnvFile(#[from] EnvFileError),
}

impl ExecError {
    pub fn code(&self) -> &'static str {
        match self {
            ExecError::InvalidInvocation { .. } => "CONTAINER_EXEC_INVALID_INVOCATION",
            ExecError::RuntimeSpawn { .. } => "CONTAINER_EXEC_RUNTIME_ERROR",
            ExecError::EnvFile(_) => "CONTAINER_EXEC_ENV_FILE_ERROR",
        }
    }

    /// Process exit code a POSIX shell would use for the same failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExecError::RuntimeSpawn { source, .. } => match source.kind() {
                io::ErrorKind::NotFound => 127,
                io::ErrorKind::PermissionDenied => 126,
                _ => 1,
            },
            _ => 1,
        }
    }
}

fn shell_quote(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    let plain = arg
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}
