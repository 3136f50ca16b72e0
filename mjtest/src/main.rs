use anyhow::{Context, Result};
use clap::builder::BoolishValueParser;
use clap::Parser;
use config_loader::{load_settings, secret_provider, Overrides};
use container_exec::{execute, CleanupPolicy, EnvEntry, ExecError, SystemRunner};
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

/// Run the majority-judgment API test suite inside its container image.
#[derive(Parser, Debug)]
#[command(name = "mjtest", version)]
struct Cli {
    /// JSON settings file
    #[arg(long, env = "MJTEST_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Container runtime binary
    #[arg(long, env = "MJTEST_RUNTIME", value_name = "BIN")]
    runtime: Option<String>,

    /// Image reference to run
    #[arg(long, env = "MJTEST_IMAGE", value_name = "REF")]
    image: Option<String>,

    /// Value for SECRET; accepts secret://scope/key references
    #[arg(long, env = "MJTEST_SECRET", hide_env_values = true, value_name = "TOKEN")]
    secret: Option<String>,

    /// JSON secrets file consulted for api/secret and secret:// references
    #[arg(long, env = "MJTEST_SECRETS_FILE", value_name = "FILE")]
    secrets_file: Option<PathBuf>,

    /// Value of the SQLITE storage flag
    #[arg(long, env = "MJTEST_SQLITE", value_name = "BOOL", value_parser = BoolishValueParser::new())]
    sqlite: Option<bool>,

    /// What to do with the env-file afterwards: remove or keep
    #[arg(long, env = "MJTEST_CLEANUP", value_name = "POLICY")]
    cleanup: Option<CleanupPolicy>,

    /// Extra KEY=VALUE line for the env-file (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE")]
    env: Vec<EnvEntry>,

    /// Print the runtime command line instead of running it. The env-file is
    /// still subject to --cleanup, so pass `--cleanup keep` to reuse the command
    #[arg(long)]
    dry_run: bool,

    /// Command to run inside the container (default: pytest)
    #[arg(last = true, value_name = "COMMAND")]
    command: Vec<String>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            runtime: self.runtime.clone(),
            image: self.image.clone(),
            command: self.command.clone(),
            secret: self.secret.clone(),
            secrets_file: self.secrets_file.clone(),
            sqlite: self.sqlite,
            cleanup: self.cleanup,
            env: self.env.clone(),
        }
    }
}

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(cli: Cli) -> Result<i32> {
    let settings = load_settings(cli.config.as_deref(), cli.overrides())
        .context("Failed to load settings")?;
    let provider = secret_provider(&settings);
    let (mut plan, secret_source) = settings
        .into_plan(&provider)
        .context("Failed to resolve settings")?;
    plan.dry_run = cli.dry_run;
    tracing::debug!(source = %secret_source, "secret resolved");

    let report = execute(&plan, &SystemRunner).context("Container run failed")?;

    if plan.dry_run {
        println!("{}", report.command_line);
        if report.kept_env_file.is_none() {
            eprintln!(
                "env-file {} was removed; rerun with --cleanup keep to use this command",
                report.env_file.display()
            );
        }
    }
    if let Some(path) = &report.kept_env_file {
        eprintln!("env-file kept at {}", path.display());
    }

    Ok(report.exit_code())
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<ExecError>()
        .map(ExecError::exit_code)
        .unwrap_or(1)
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:?}", err);
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}
