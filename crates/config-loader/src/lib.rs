use container_exec::EnvFileError;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, instrument};

pub mod secrets;
pub mod settings;

pub use secrets::{LocalSecretProvider, SecretError, SecretProvider};
pub use settings::{
    Overrides, ResolvedSecret, SecretSource, Settings, SettingsFile, PLACEHOLDER_SECRET,
};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    ConfigFileNotFound { path: String },

    #[error("JSON parsing failed for {path}: {message}")]
    JsonParsingFailed { path: String, message: String },

    #[error("IO error: {message}")]
    IoError { message: String },

    #[error("Secret resolution failed: {error}")]
    SecretResolutionFailed {
        #[from]
        error: SecretError,
    },

    #[error("Invalid environment entry: {error}")]
    InvalidEnv {
        #[from]
        error: EnvFileError,
    },
}

/// Layer the optional settings file under `overrides`.
#[instrument(skip(overrides))]
pub fn load_settings(
    config_path: Option<&Path>,
    overrides: Overrides,
) -> Result<Settings, ConfigError> {
    let file = match config_path {
        Some(path) => SettingsFile::load(path)?,
        None => SettingsFile::default(),
    };
    let settings = Settings::layered(file, overrides);
    debug!(
        runtime = %settings.invocation.runtime,
        image = %settings.invocation.image,
        sqlite = settings.sqlite,
        cleanup = %settings.cleanup,
        extra_env = settings.env.len(),
        "settings resolved"
    );
    Ok(settings)
}

/// Provider for the effective settings: the configured secrets file if any,
/// otherwise `MJTEST_SECRETS_FILE` or `.mjtest/secrets.json`.
pub fn secret_provider(settings: &Settings) -> LocalSecretProvider {
    match &settings.secrets_file {
        Some(path) => LocalSecretProvider::with_secrets_file(path),
        None => LocalSecretProvider::new(),
    }
}
