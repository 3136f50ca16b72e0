use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::{Builder, TempPath};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const SECRET_KEY: &str = "SECRET";
pub const SQLITE_KEY: &str = "SQLITE";

const FILE_PREFIX: &str = "mjtest-";
const FILE_SUFFIX: &str = ".env";

#[derive(Debug, Error)]
pub enum EnvFileError {
    #[error("Invalid env-file key '{key}': {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("Value for env-file key '{key}' must not contain line breaks")]
    InvalidValue { key: String },

    #[error("Env-file key '{key}' is set more than once")]
    DuplicateKey { key: String },

    #[error("Expected KEY=VALUE, got '{raw}'")]
    MalformedEntry { raw: String },

    #[error("Env-file path {path:?} is not valid UTF-8")]
    NonUtf8Path { path: PathBuf },

    #[error("Failed to write env-file: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// A single `KEY=VALUE` line destined for the container environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EnvEntry {
    key: String,
    value: String,
}

impl EnvEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Result<Self, EnvFileError> {
        let key = key.into();
        let value = value.into();
        validate_key(&key)?;
        if value.contains('\n') || value.contains('\r') {
            return Err(EnvFileError::InvalidValue { key });
        }
        Ok(Self { key, value })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for EnvEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

impl FromStr for EnvEntry {
    type Err = EnvFileError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| EnvFileError::MalformedEntry {
                raw: raw.to_string(),
            })?;
        Self::new(key, value)
    }
}

impl TryFrom<String> for EnvEntry {
    type Error = EnvFileError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<EnvEntry> for String {
    fn from(entry: EnvEntry) -> Self {
        entry.to_string()
    }
}

fn validate_key(key: &str) -> Result<(), EnvFileError> {
    let reason = if key.is_empty() {
        "key cannot be empty"
    } else if key.contains('=') {
        "key cannot contain '='"
    } else if key.chars().any(char::is_whitespace) {
        "key cannot contain whitespace"
    } else {
        return Ok(());
    };

    Err(EnvFileError::InvalidKey {
        key: key.to_string(),
        reason,
    })
}

/// Renders a Python-style boolean, which is what the containerized app expects.
pub fn python_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

/// What happens to the env-file once the runtime has returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupPolicy {
    #[default]
    Remove,
    Keep,
}

impl FromStr for CleanupPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "remove" => Ok(Self::Remove),
            "keep" => Ok(Self::Keep),
            other => Err(format!(
                "unknown cleanup policy '{}' (expected 'remove' or 'keep')",
                other
            )),
        }
    }
}

impl fmt::Display for CleanupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remove => f.write_str("remove"),
            Self::Keep => f.write_str("keep"),
        }
    }
}

/// Collects ordered env-file entries and writes them to a fresh temp file.
#[derive(Debug, Default)]
pub struct EnvFileBuilder {
    entries: Vec<EnvEntry>,
    dir: Option<PathBuf>,
}

impl EnvFileBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the file under `dir` instead of the host temp directory.
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn push(&mut self, entry: EnvEntry) -> Result<(), EnvFileError> {
        if self.entries.iter().any(|e| e.key == entry.key) {
            return Err(EnvFileError::DuplicateKey { key: entry.key });
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[EnvEntry] {
        &self.entries
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.to_string());
            out.push('\n');
        }
        out
    }

    pub fn write(self) -> Result<EnvFile, EnvFileError> {
        let mut builder = Builder::new();
        builder.prefix(FILE_PREFIX).suffix(FILE_SUFFIX);
        let mut file = match &self.dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };

        // The path is handed to the runtime as a string argument.
        if file.path().to_str().is_none() {
            return Err(EnvFileError::NonUtf8Path {
                path: file.path().to_path_buf(),
            });
        }

        {
            let mut writer = BufWriter::new(file.as_file_mut());
            writer.write_all(self.render().as_bytes())?;
            writer.flush()?;
        }
        file.as_file().sync_all()?;

        let path = file.into_temp_path();
        debug!(
            path = %path.display(),
            entries = self.entries.len(),
            "env-file written"
        );
        Ok(EnvFile { path })
    }
}

/// A written env-file. Dropping it without calling [`EnvFile::release`]
/// removes the file.
#[derive(Debug)]
pub struct EnvFile {
    path: TempPath,
}

impl EnvFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply the cleanup policy. Returns the persisted path for [`CleanupPolicy::Keep`].
    ///
    /// Cleanup failures are logged rather than returned so they never mask the
    /// runtime's exit status.
    pub fn release(self, policy: CleanupPolicy) -> Option<PathBuf> {
        match policy {
            CleanupPolicy::Remove => {
                let shown = self.path.display().to_string();
                if let Err(err) = self.path.close() {
                    warn!(path = %shown, error = %err, "failed to remove env-file");
                } else {
                    debug!(path = %shown, "env-file removed");
                }
                None
            }
            CleanupPolicy::Keep => match self.path.keep() {
                Ok(path) => {
                    info!(path = %path.display(), "env-file kept");
                    Some(path)
                }
                Err(err) => {
                    warn!(error = %err.error, "failed to persist env-file");
                    None
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn standard_builder(dir: &Path) -> EnvFileBuilder {
        let mut builder = EnvFileBuilder::new().in_dir(dir);
        builder
            .push(EnvEntry::new(SECRET_KEY, "mysecrettoken").unwrap())
            .unwrap();
        builder
            .push(EnvEntry::new(SQLITE_KEY, python_bool(true)).unwrap())
            .unwrap();
        builder
    }

    #[test]
    fn writes_secret_then_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = standard_builder(dir.path()).write().unwrap();

        let contents = fs::read_to_string(env_file.path()).unwrap();
        assert_eq!(contents, "SECRET=mysecrettoken\nSQLITE=True\n");
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn consecutive_builds_get_distinct_paths() {
        let dir = tempfile::tempdir().unwrap();
        let first = standard_builder(dir.path()).write().unwrap();
        let second = standard_builder(dir.path()).write().unwrap();

        assert_ne!(first.path(), second.path());
        assert!(first.path().exists());
        assert!(second.path().exists());
    }

    #[test]
    fn file_name_carries_prefix_and_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = standard_builder(dir.path()).write().unwrap();
        let name = env_file
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .to_string();
        assert!(name.starts_with("mjtest-"));
        assert!(name.ends_with(".env"));
    }

    #[test]
    fn remove_policy_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = standard_builder(dir.path()).write().unwrap();
        let path = env_file.path().to_path_buf();

        assert!(env_file.release(CleanupPolicy::Remove).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn keep_policy_persists_file() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = standard_builder(dir.path()).write().unwrap();
        let path = env_file.path().to_path_buf();

        let kept = env_file.release(CleanupPolicy::Keep).unwrap();
        assert_eq!(kept, path);
        assert!(path.exists());
    }

    #[test]
    fn dropping_env_file_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let env_file = standard_builder(dir.path()).write().unwrap();
            env_file.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn unwritable_dir_fails_before_anything_exists() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let result = standard_builder(&missing).write();
        assert!(matches!(result, Err(EnvFileError::Io { .. })));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn non_utf8_temp_dir_is_rejected_and_left_empty() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        let odd = dir.path().join(OsStr::from_bytes(b"tmp-\xff"));
        fs::create_dir(&odd).unwrap();

        let result = standard_builder(&odd).write();
        assert!(matches!(result, Err(EnvFileError::NonUtf8Path { .. })));
        assert_eq!(fs::read_dir(&odd).unwrap().count(), 0);
    }

    #[test]
    fn remove_policy_logs_without_shadowing_field_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = standard_builder(dir.path()).write().unwrap();
        let path = env_file.path().to_path_buf();

        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
        assert!(env_file.release(CleanupPolicy::Remove).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = standard_builder(dir.path());
        let err = builder
            .push(EnvEntry::new(SECRET_KEY, "other").unwrap())
            .unwrap_err();
        assert!(matches!(err, EnvFileError::DuplicateKey { ref key } if key == "SECRET"));
    }

    #[test]
    fn entry_parsing_splits_on_first_equals() {
        let entry: EnvEntry = "POSTGRES_PASSWORD=a=b".parse().unwrap();
        assert_eq!(entry.key(), "POSTGRES_PASSWORD");
        assert_eq!(entry.value(), "a=b");

        let empty: EnvEntry = "POSTGRES_PASSWORD=".parse().unwrap();
        assert_eq!(empty.value(), "");
    }

    #[test]
    fn entry_validation() {
        assert!(matches!(
            "novalue".parse::<EnvEntry>(),
            Err(EnvFileError::MalformedEntry { .. })
        ));
        assert!(matches!(
            "=value".parse::<EnvEntry>(),
            Err(EnvFileError::InvalidKey { .. })
        ));
        assert!(matches!(
            EnvEntry::new("MY KEY", "v"),
            Err(EnvFileError::InvalidKey { .. })
        ));
        assert!(matches!(
            EnvEntry::new("KEY", "line\nbreak"),
            Err(EnvFileError::InvalidValue { .. })
        ));
    }

    #[test]
    fn cleanup_policy_parses_case_insensitively() {
        assert_eq!("KEEP".parse::<CleanupPolicy>(), Ok(CleanupPolicy::Keep));
        assert_eq!(" remove ".parse::<CleanupPolicy>(), Ok(CleanupPolicy::Remove));
        assert!("shred".parse::<CleanupPolicy>().is_err());
    }

    #[test]
    fn entries_and_policy_use_plain_strings_in_json() {
        let entries: Vec<EnvEntry> =
            serde_json::from_str(r#"["POSTGRES_DB=mj", "MAX_VOTERS=1000000"]"#).unwrap();
        assert_eq!(entries[1].key(), "MAX_VOTERS");
        assert_eq!(
            serde_json::to_string(&entries).unwrap(),
            r#"["POSTGRES_DB=mj","MAX_VOTERS=1000000"]"#
        );

        assert!(serde_json::from_str::<Vec<EnvEntry>>(r#"["BROKEN"]"#).is_err());
        assert_eq!(
            serde_json::from_str::<CleanupPolicy>(r#""keep""#).unwrap(),
            CleanupPolicy::Keep
        );
    }

    #[test]
    fn python_bool_renders_capitalized() {
        assert_eq!(python_bool(true), "True");
        assert_eq!(python_bool(false), "False");
    }
}
