use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub const SECRETS_FILE_ENV: &str = "MJTEST_SECRETS_FILE";
const DEFAULT_SECRETS_FILE: &str = ".mjtest/secrets.json";

static NO_SECRETS: Lazy<HashMap<String, HashMap<String, String>>> = Lazy::new(HashMap::new);

static SECRET_URI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^secret://([^/]+)/(.+)$").expect("secret URI pattern is valid")
});

#[derive(Error, Debug, Clone)]
pub enum SecretError {
    #[error("Secret not found: {scope}/{key}")]
    SecretNotFound { scope: String, key: String },

    #[error("Failed to read secrets file: {path} - {message}")]
    SecretsFileError { path: String, message: String },

    #[error("Failed to parse secrets file: {message}")]
    SecretsParseError { message: String },
}

pub trait SecretProvider: Send + Sync {
    fn resolve(&self, scope: &str, key: &str) -> Result<String, SecretError>;
}

/// Looks secrets up in `SECRET_<SCOPE>_<KEY>` environment variables first,
/// then in a JSON file shaped as `{"<scope>": {"<key>": "<value>"}}`.
///
/// A file named by `--secrets-file` or `MJTEST_SECRETS_FILE` must load; a
/// broken `.mjtest/secrets.json` picked up implicitly is only warned about.
pub struct LocalSecretProvider {
    secrets_file_path: Option<PathBuf>,
    required: bool,
    cached_secrets: OnceCell<Result<HashMap<String, HashMap<String, String>>, SecretError>>,
}

impl LocalSecretProvider {
    pub fn new() -> Self {
        let from_env = env::var(SECRETS_FILE_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        match from_env {
            Some(path) => Self::with_secrets_file(path),
            None => {
                let default_path = PathBuf::from(DEFAULT_SECRETS_FILE);
                Self::build(default_path.exists().then_some(default_path), false)
            }
        }
    }

    pub fn with_secrets_file<P: Into<PathBuf>>(secrets_file_path: P) -> Self {
        Self::build(Some(secrets_file_path.into()), true)
    }

    pub(crate) fn build(secrets_file_path: Option<PathBuf>, required: bool) -> Self {
        Self {
            secrets_file_path,
            required,
            cached_secrets: OnceCell::new(),
        }
    }

    pub fn secrets_file(&self) -> Option<&Path> {
        self.secrets_file_path.as_deref()
    }

    fn load_secrets_from_file(
        &self,
    ) -> Result<HashMap<String, HashMap<String, String>>, SecretError> {
        let Some(path) = &self.secrets_file_path else {
            return Ok(HashMap::new());
        };
        debug!("Loading secrets from file: {:?}", path);

        let content = fs::read_to_string(path).map_err(|e| SecretError::SecretsFileError {
            path: path.to_string_lossy().to_string(),
            message: e.to_string(),
        })?;

        let parsed: Value =
            serde_json::from_str(&content).map_err(|e| SecretError::SecretsParseError {
                message: e.to_string(),
            })?;

        let mut secrets = HashMap::new();
        let Some(obj) = parsed.as_object() else {
            return Err(SecretError::SecretsParseError {
                message: "top level must be an object of scopes".to_string(),
            });
        };

        for (scope, scope_value) in obj {
            let Some(scope_obj) = scope_value.as_object() else {
                warn!("Ignoring non-object scope '{}' in secrets file", scope);
                continue;
            };
            let mut scope_secrets = HashMap::new();
            for (key, value) in scope_obj {
                match value.as_str() {
                    Some(s) => {
                        scope_secrets.insert(key.clone(), s.to_string());
                    }
                    // Values are never echoed, only their location.
                    None => warn!("Non-string value in secrets file for {}/{}", scope, key),
                }
            }
            secrets.insert(scope.clone(), scope_secrets);
        }

        Ok(secrets)
    }

    fn get_cached_secrets(
        &self,
    ) -> Result<&HashMap<String, HashMap<String, String>>, SecretError> {
        match self.cached_secrets.get_or_init(|| self.load_secrets_from_file()) {
            Ok(secrets) => Ok(secrets),
            Err(e) if self.required => Err(e.clone()),
            Err(e) => {
                warn!("Ignoring default secrets file: {}", e);
                Ok(&*NO_SECRETS)
            }
        }
    }
}

impl SecretProvider for LocalSecretProvider {
    fn resolve(&self, scope: &str, key: &str) -> Result<String, SecretError> {
        let env_var_name = secret_env_var(scope, key);

        if let Ok(value) = env::var(&env_var_name) {
            debug!(
                "Resolved secret {}/{} from environment variable {}",
                scope, key, env_var_name
            );
            return Ok(value);
        }

        if let Some(value) = self
            .get_cached_secrets()?
            .get(scope)
            .and_then(|scope_secrets| scope_secrets.get(key))
        {
            debug!("Resolved secret {}/{} from secrets file", scope, key);
            return Ok(value.clone());
        }

        Err(SecretError::SecretNotFound {
            scope: scope.to_string(),
            key: key.to_string(),
        })
    }
}

impl Default for LocalSecretProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Name of the environment variable consulted for `scope`/`key`.
pub fn secret_env_var(scope: &str, key: &str) -> String {
    format!(
        "SECRET_{}_{}",
        scope.to_uppercase().replace('-', "_"),
        key.to_uppercase().replace('-', "_")
    )
}

/// Splits a `secret://scope/key` reference; `None` for plain values.
pub fn parse_secret_uri(value: &str) -> Option<(&str, &str)> {
    let captures = SECRET_URI.captures(value)?;
    Some((captures.get(1)?.as_str(), captures.get(2)?.as_str()))
}

/// Returns `value` unchanged unless it is a `secret://` reference, in which
/// case the referenced secret is looked up.
pub fn resolve_secret_ref<P: SecretProvider + ?Sized>(
    value: &str,
    provider: &P,
) -> Result<String, SecretError> {
    match parse_secret_uri(value) {
        Some((scope, key)) => provider.resolve(scope, key),
        None => Ok(value.to_string()),
    }
}
