use crate::secrets::{resolve_secret_ref, SecretError, SecretProvider};
use crate::ConfigError;
use container_exec::{CleanupPolicy, ContainerInvocation, EnvEntry, RunPlan};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Placeholder token used when no secret is supplied anywhere.
pub const PLACEHOLDER_SECRET: &str = "mysecrettoken";
pub const SECRET_SCOPE: &str = "api";
pub const SECRET_NAME: &str = "secret";

/// On-disk JSON settings. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SettingsFile {
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub sqlite: Option<bool>,
    #[serde(default)]
    pub cleanup: Option<CleanupPolicy>,
    #[serde(default)]
    pub env: Vec<EnvEntry>,
    #[serde(default)]
    pub secrets_file: Option<PathBuf>,
}

impl SettingsFile {
    #[instrument]
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::ConfigFileNotFound {
                path: path.to_string_lossy().to_string(),
            });
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            message: format!("Failed to read {}: {}", path.display(), e),
        })?;

        let settings: Self =
            serde_json::from_str(&content).map_err(|e| ConfigError::JsonParsingFailed {
                path: path.to_string_lossy().to_string(),
                message: e.to_string(),
            })?;

        debug!("Loaded settings file {:?}", path);
        Ok(settings)
    }
}

/// Values supplied on the command line or through `MJTEST_*` variables.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub runtime: Option<String>,
    pub image: Option<String>,
    pub command: Vec<String>,
    pub secret: Option<String>,
    pub secrets_file: Option<PathBuf>,
    pub sqlite: Option<bool>,
    pub cleanup: Option<CleanupPolicy>,
    pub env: Vec<EnvEntry>,
}

/// Effective settings after layering defaults, the settings file and overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub invocation: ContainerInvocation,
    pub secret: Option<String>,
    pub secrets_file: Option<PathBuf>,
    pub sqlite: bool,
    pub cleanup: CleanupPolicy,
    pub env: Vec<EnvEntry>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            invocation: ContainerInvocation::default(),
            secret: None,
            secrets_file: None,
            sqlite: true,
            cleanup: CleanupPolicy::default(),
            env: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretSource {
    Explicit,
    Provider,
    Placeholder,
}

impl fmt::Display for SecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretSource::Explicit => f.write_str("explicit"),
            SecretSource::Provider => f.write_str("secret-provider"),
            SecretSource::Placeholder => f.write_str("placeholder"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSecret {
    pub value: String,
    pub source: SecretSource,
}

impl Settings {
    pub fn layered(file: SettingsFile, overrides: Overrides) -> Self {
        let mut settings = Settings::default();

        if let Some(runtime) = non_blank(overrides.runtime).or(non_blank(file.runtime)) {
            settings.invocation.runtime = runtime;
        }
        if let Some(image) = overrides.image.or(file.image) {
            settings.invocation.image = image;
        }
        if !overrides.command.is_empty() {
            settings.invocation.command = overrides.command;
        } else if let Some(command) = file.command {
            settings.invocation.command = command;
        }

        settings.secret = non_blank(overrides.secret);
        settings.secrets_file = overrides.secrets_file.or(file.secrets_file);
        settings.sqlite = overrides.sqlite.or(file.sqlite).unwrap_or(true);
        settings.cleanup = overrides.cleanup.or(file.cleanup).unwrap_or_default();
        settings.env = file.env;
        settings.env.extend(overrides.env);

        settings
    }

    /// Explicit value (possibly a `secret://` reference), then the provider's
    /// `api/secret`, then the placeholder.
    pub fn resolve_secret<P: SecretProvider + ?Sized>(
        &self,
        provider: &P,
    ) -> Result<ResolvedSecret, ConfigError> {
        if let Some(explicit) = &self.secret {
            let value = resolve_secret_ref(explicit, provider)?;
            return Ok(ResolvedSecret {
                value,
                source: SecretSource::Explicit,
            });
        }

        match provider.resolve(SECRET_SCOPE, SECRET_NAME) {
            Ok(value) => Ok(ResolvedSecret {
                value,
                source: SecretSource::Provider,
            }),
            Err(SecretError::SecretNotFound { .. }) => Ok(ResolvedSecret {
                value: PLACEHOLDER_SECRET.to_string(),
                source: SecretSource::Placeholder,
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Extra env entries with `secret://` values replaced by their secrets.
    pub fn resolve_env<P: SecretProvider + ?Sized>(
        &self,
        provider: &P,
    ) -> Result<Vec<EnvEntry>, ConfigError> {
        self.env
            .iter()
            .map(|entry| -> Result<EnvEntry, ConfigError> {
                let value = resolve_secret_ref(entry.value(), provider)?;
                Ok(EnvEntry::new(entry.key(), value)?)
            })
            .collect()
    }

    pub fn into_plan<P: SecretProvider + ?Sized>(
        self,
        provider: &P,
    ) -> Result<(RunPlan, SecretSource), ConfigError> {
        let secret = self.resolve_secret(provider)?;
        let extra_env = self.resolve_env(provider)?;

        let mut plan = RunPlan::new(self.invocation, secret.value);
        plan.sqlite = self.sqlite;
        plan.cleanup = self.cleanup;
        plan.extra_env = extra_env;
        Ok((plan, secret.source))
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
