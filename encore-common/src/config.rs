//! Bootstrap configuration
//!
//! Loaded once at startup from a TOML file in the per-user config
//! directory. These values cannot change while the player runs; runtime
//! state (volume, queue, modes) lives in the persisted session instead.
//!
//! A missing file means defaults. An unreadable or invalid file is an
//! error: misconfiguration should fail loudly at startup, not silently
//! fall back.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Directory name under the platform config dir (e.g. `~/.config/encore`)
pub const CONFIG_DIR_NAME: &str = "encore";
/// Bootstrap config file name
pub const CONFIG_FILE_NAME: &str = "config.toml";
/// Persisted session snapshot file name
pub const SESSION_FILE_NAME: &str = "session.json";
/// Detached background-session handle file name
pub const BACKGROUND_FILE_NAME: &str = "background.json";

/// Bootstrap configuration loaded from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Port for the command/state channel server
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer token required from remote observers.
    /// None disables authentication.
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Override for the session snapshot file location
    #[serde(default)]
    pub state_file: Option<PathBuf>,

    /// Debounce window for progress-only session saves, in seconds
    #[serde(default = "default_save_debounce_secs")]
    pub save_debounce_secs: u64,

    /// Number of attempts for a failing playback start
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay between playback retry attempts, in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// How long after end-of-stream a spurious backend pause event is
    /// ignored, in milliseconds.
    ///
    /// This is a workaround for mpv's idle transition, which reports
    /// `pause=true` while switching files; the window length tracks that
    /// backend's timing and carries no protocol meaning.
    #[serde(default = "default_pause_suppression_ms")]
    pub pause_suppression_ms: u64,

    /// Leave the audio process running on exit and record a
    /// background-session handle for later reattachment
    #[serde(default)]
    pub detach_on_exit: bool,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (stderr when not set)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_port() -> u16 {
    7531
}

fn default_save_debounce_secs() -> u64 {
    5
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1500
}

fn default_pause_suppression_ms() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        // An empty TOML document deserializes to all defaults.
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl Config {
    /// Load configuration from the given file, or from the default
    /// location when `path` is None.
    ///
    /// Missing file: defaults. Present but unreadable/invalid: error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };

        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Resolved session snapshot path (override or per-user default).
    pub fn session_file(&self) -> Result<PathBuf> {
        match &self.state_file {
            Some(p) => Ok(p.clone()),
            None => Ok(config_dir()?.join(SESSION_FILE_NAME)),
        }
    }

    /// Resolved background-session handle path, kept beside the snapshot.
    pub fn background_file(&self) -> Result<PathBuf> {
        match &self.state_file {
            Some(p) => {
                let dir = p.parent().unwrap_or_else(|| Path::new("."));
                Ok(dir.join(BACKGROUND_FILE_NAME))
            }
            None => Ok(config_dir()?.join(BACKGROUND_FILE_NAME)),
        }
    }

    pub fn save_debounce(&self) -> Duration {
        Duration::from_secs(self.save_debounce_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn pause_suppression(&self) -> Duration {
        Duration::from_millis(self.pause_suppression_ms)
    }
}

/// Per-user Encore config directory.
pub fn config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|d| d.join(CONFIG_DIR_NAME))
        .ok_or_else(|| Error::Config("could not determine user config directory".into()))
}

fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.port, 7531);
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.retry_delay_ms, 1500);
        assert_eq!(config.save_debounce_secs, 5);
        assert_eq!(config.pause_suppression_ms, 2000);
        assert!(config.auth_token.is_none());
        assert!(!config.detach_on_exit);
    }

    #[test]
    fn partial_file_fills_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "port = 9000").unwrap();
        writeln!(f, "auth_token = \"secret\"").unwrap();
        writeln!(f, "[logging]").unwrap();
        writeln!(f, "level = \"debug\"").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.retry_attempts, 3);
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn state_file_override_controls_background_path() {
        let config: Config = toml::from_str("state_file = \"/tmp/enc/session.json\"").unwrap();
        assert_eq!(
            config.session_file().unwrap(),
            PathBuf::from("/tmp/enc/session.json")
        );
        assert_eq!(
            config.background_file().unwrap(),
            PathBuf::from("/tmp/enc/background.json")
        );
    }
}
