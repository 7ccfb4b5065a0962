//! Configuration file parser for ~/.config/dailyfeed/config.toml.
//!
//! The config file is optional and a missing file yields `Config::default()`.
//! Unknown keys are accepted, though we log a warning for each one since it
//! is most likely a typo. Two environment variables override the file:
//! `ASAP_UPDATE_FREQ` (seconds) and `LOG_RECIPIENTS` (comma-separated chat ids).
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::{Backoff, DEFAULT_WORKERS};
use crate::notify::template::{self, RenderError};
use crate::subscriber::{ChatId, Mode};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidOverride { name: &'static str, value: String },

    #[error("Invalid template templates.{name}: {source}")]
    InvalidTemplate {
        name: &'static str,
        source: RenderError,
    },
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Default message templates.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Templates {
    /// One ASAP message per entry
    pub asap: String,
    /// One line of a digest
    pub digest_entry: String,
    /// Opening lines of each digest message; only `{feed.*}` fields
    pub digest_header: String,
}

impl Default for Templates {
    fn default() -> Self {
        Self {
            asap: "[{entry.title}]({entry.link}) - {feed.title}".to_string(),
            digest_entry: "- ({entry.published}) [{entry.title}]({entry.link})".to_string(),
            digest_header: "*Daily digest from [{feed.title}]({feed.link})*\n---".to_string(),
        }
    }
}

impl Templates {
    /// Reject unknown placeholders and unbalanced braces. The digest header
    /// may only use `{feed.*}` fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("asap", self.asap.as_str(), true),
            ("digest_entry", self.digest_entry.as_str(), true),
            ("digest_header", self.digest_header.as_str(), false),
        ];
        for (name, text, allow_entry) in checks {
            template::validate(text, allow_entry)
                .map_err(|source| ConfigError::InvalidTemplate { name, source })?;
        }
        Ok(())
    }

    pub fn entry_template(&self, mode: Mode) -> &str {
        match mode {
            Mode::Asap => &self.asap,
            Mode::Digest => &self.digest_entry,
        }
    }
}

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Subscriber database. Defaults to `dailyfeed.db` next to the config file.
    pub database_path: Option<PathBuf>,

    /// Seconds between ASAP polls of one chat.
    pub asap_interval_secs: u64,

    /// Concurrent fetches per feed collection.
    pub max_workers: usize,

    /// Pause after a network, HTTP status or parse failure.
    pub error_backoff_secs: u64,

    /// Pause after a document whose entries lack publication times.
    pub missing_timestamp_backoff_secs: u64,

    /// Per-request HTTP timeout.
    pub request_timeout_secs: u64,

    pub user_agent: String,

    /// Chats that receive failure reports.
    pub operators: Vec<ChatId>,

    pub templates: Templates,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            asap_interval_secs: 300,
            max_workers: DEFAULT_WORKERS,
            error_backoff_secs: 24 * 60 * 60,
            missing_timestamp_backoff_secs: 6 * 60 * 60,
            request_timeout_secs: 30,
            user_agent: format!("dailyfeed/{}", env!("CARGO_PKG_VERSION")),
            operators: Vec::new(),
            templates: Templates::default(),
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 9] = [
        "database_path",
        "asap_interval_secs",
        "max_workers",
        "error_backoff_secs",
        "missing_timestamp_backoff_secs",
        "request_timeout_secs",
        "user_agent",
        "operators",
        "templates",
    ];

    /// Load configuration from a TOML file, then apply environment overrides.
    ///
    /// - Missing file → defaults
    /// - Empty file → defaults
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    /// - Invalid default templates → `Err(ConfigError::InvalidTemplate)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_file(path)?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    fn load_file(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        config.templates.validate()?;
        tracing::info!(
            path = %path.display(),
            asap_interval_secs = config.asap_interval_secs,
            operators = config.operators.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Apply `ASAP_UPDATE_FREQ` and `LOG_RECIPIENTS` from `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup("ASAP_UPDATE_FREQ") {
            self.asap_interval_secs = value
                .trim()
                .parse()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or(ConfigError::InvalidOverride {
                    name: "ASAP_UPDATE_FREQ",
                    value: value.clone(),
                })?;
        }

        if let Some(value) = lookup("LOG_RECIPIENTS") {
            self.operators = value
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| {
                    part.parse::<ChatId>().map_err(|_| ConfigError::InvalidOverride {
                        name: "LOG_RECIPIENTS",
                        value: value.clone(),
                    })
                })
                .collect::<Result<_, _>>()?;
        }

        Ok(())
    }

    pub fn asap_interval(&self) -> Duration {
        Duration::from_secs(self.asap_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            error: Duration::from_secs(self.error_backoff_secs),
            missing_timestamp: Duration::from_secs(self.missing_timestamp_backoff_secs),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn write_config(name: &str, content: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("dailyfeed_config_test_{name}"));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.asap_interval_secs, 300);
        assert_eq!(config.max_workers, 5);
        assert_eq!(config.backoff(), Backoff::default());
        assert!(config.operators.is_empty());
        assert!(config.database_path.is_none());
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/dailyfeed_test_nonexistent_config.toml");
        let config = Config::load_file(path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_whitespace_only_file_returns_default() {
        let (dir, path) = write_config("whitespace", "   \n  \n  ");
        assert_eq!(Config::load_file(&path).unwrap(), Config::default());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let (dir, path) = write_config("partial", "asap_interval_secs = 60\n[templates]\nasap = \"{entry.title}\"\n");

        let config = Config::load_file(&path).unwrap();
        assert_eq!(config.asap_interval_secs, 60);
        assert_eq!(config.templates.asap, "{entry.title}");
        assert_eq!(config.templates.digest_entry, Templates::default().digest_entry);
        assert_eq!(config.max_workers, 5);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_full_config() {
        let content = r#"
database_path = "/var/lib/dailyfeed/state.db"
asap_interval_secs = 120
max_workers = 8
error_backoff_secs = 3600
missing_timestamp_backoff_secs = 600
request_timeout_secs = 10
user_agent = "test-agent"
operators = [1, -100200]

[templates]
asap = "{entry.link}"
digest_entry = "* {entry.title}"
digest_header = "{feed.title}"
"#;
        let (dir, path) = write_config("full", content);

        let config = Config::load_file(&path).unwrap();
        assert_eq!(
            config.database_path.as_deref(),
            Some(Path::new("/var/lib/dailyfeed/state.db"))
        );
        assert_eq!(config.asap_interval(), Duration::from_secs(120));
        assert_eq!(config.max_workers, 8);
        assert_eq!(
            config.backoff(),
            Backoff {
                error: Duration::from_secs(3600),
                missing_timestamp: Duration::from_secs(600),
            }
        );
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.user_agent, "test-agent");
        assert_eq!(config.operators, vec![1, -100200]);
        assert_eq!(config.templates.entry_template(Mode::Asap), "{entry.link}");
        assert_eq!(config.templates.entry_template(Mode::Digest), "* {entry.title}");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let (dir, path) = write_config("invalid", "this is not [valid toml");

        let err = Config::load_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let (dir, path) = write_config("unknown", "max_workers = 2\ntheme = \"dark\"\n");
        assert_eq!(Config::load_file(&path).unwrap().max_workers, 2);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_default_templates_are_valid() {
        assert!(Templates::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_templates_rejected_at_load() {
        let (dir, path) = write_config("bad_entry", "[templates]\nasap = \"{entry.titel}\"\n");
        let err = Config::load_file(&path).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidTemplate {
                name: "asap",
                source: RenderError::UnknownField(_)
            }
        ));
        std::fs::remove_dir_all(&dir).ok();

        let (dir, path) = write_config("bad_brace", "[templates]\ndigest_entry = \"- {entry.title\"\n");
        assert!(matches!(
            Config::load_file(&path).unwrap_err(),
            ConfigError::InvalidTemplate { name: "digest_entry", .. }
        ));
        std::fs::remove_dir_all(&dir).ok();

        // Headers render once per feed and never see an entry
        let (dir, path) = write_config("bad_header", "[templates]\ndigest_header = \"{entry.title}\"\n");
        assert!(matches!(
            Config::load_file(&path).unwrap_err(),
            ConfigError::InvalidTemplate { name: "digest_header", .. }
        ));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_wrong_type_returns_error() {
        let (dir, path) = write_config("wrongtype", "operators = \"everyone\"\n");
        assert!(Config::load_file(&path).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_too_large_file_rejected() {
        let (dir, path) = write_config("too_large", &"a".repeat(1_048_577));

        let err = Config::load_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        assert!(err.to_string().contains("too large"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = Config {
            asap_interval_secs: 900,
            operators: vec![5],
            ..Config::default()
        };
        config
            .apply_overrides(env(&[("ASAP_UPDATE_FREQ", "60"), ("LOG_RECIPIENTS", "1, 2,,3")]))
            .unwrap();
        assert_eq!(config.asap_interval_secs, 60);
        assert_eq!(config.operators, vec![1, 2, 3]);
    }

    #[test]
    fn test_absent_env_leaves_config_untouched() {
        let mut config = Config::default();
        config.apply_overrides(env(&[])).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_invalid_env_values_rejected() {
        let mut config = Config::default();
        assert!(matches!(
            config.apply_overrides(env(&[("ASAP_UPDATE_FREQ", "often")])),
            Err(ConfigError::InvalidOverride { name: "ASAP_UPDATE_FREQ", .. })
        ));
        assert!(matches!(
            config.apply_overrides(env(&[("ASAP_UPDATE_FREQ", "0")])),
            Err(ConfigError::InvalidOverride { .. })
        ));
        assert!(matches!(
            config.apply_overrides(env(&[("LOG_RECIPIENTS", "1,admin")])),
            Err(ConfigError::InvalidOverride { name: "LOG_RECIPIENTS", .. })
        ));
    }
}
