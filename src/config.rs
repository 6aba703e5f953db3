use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pty::{default_shell, SpawnCommand, DEFAULT_TERM};
use crate::pump::PumpConfig;
use crate::session::{SessionConfig, SessionRegistry};

/// Server settings, loaded from TOML and then overridden from the command line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub terminal: TerminalSettings,
    pub pump: PumpSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Origins allowed to call the HTTP API cross-origin. Empty disables CORS.
    pub cors_origins: Vec<String>,
    pub max_sessions: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            cors_origins: Vec::new(),
            max_sessions: SessionRegistry::DEFAULT_MAX_SESSIONS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalSettings {
    /// Program to run. `$SHELL` (or `/bin/sh`) when unset.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub term: String,
    pub env: BTreeMap<String, String>,
    pub rows: u16,
    pub cols: u16,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            cwd: None,
            term: DEFAULT_TERM.to_string(),
            env: BTreeMap::new(),
            rows: 50,
            cols: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpSettings {
    pub poll_interval_ms: u64,
    pub chunk_size: usize,
    pub max_transient_errors: u32,
    /// Outbound messages buffered per session before the pump stops reading.
    pub channel_capacity: usize,
}

impl Default for PumpSettings {
    fn default() -> Self {
        let pump = PumpConfig::default();
        Self {
            poll_interval_ms: pump.poll_interval.as_millis() as u64,
            chunk_size: pump.chunk_size,
            max_transient_errors: pump.max_transient_errors,
            channel_capacity: 64,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to read config {}: {}", .0.display(), .1)]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config {}: {}", .0.display(), .1)]
    ParseFailed(PathBuf, #[source] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// `~/.config/webpty/config.toml`, when a config directory exists.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("webpty").join("config.toml"))
}

impl Settings {
    /// Load settings from a TOML file. Returns `None` if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let settings: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(settings))
    }

    /// Load from an explicitly requested file (which must exist), or from the
    /// default location if there is one, or fall back to defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path)?.ok_or_else(|| ConfigError::NotFound(path.to_path_buf()));
        }
        match default_config_path() {
            Some(path) => Ok(Self::load(&path)?.unwrap_or_default()),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.terminal.rows == 0 || self.terminal.cols == 0 {
            return Err(ConfigError::Invalid(
                "terminal rows and cols must be at least 1".into(),
            ));
        }
        if self.pump.chunk_size == 0 {
            return Err(ConfigError::Invalid("pump.chunk_size must be at least 1".into()));
        }
        if self.pump.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "pump.channel_capacity must be at least 1".into(),
            ));
        }
        if matches!(&self.terminal.command, Some(cmd) if cmd.trim().is_empty()) {
            return Err(ConfigError::Invalid("terminal.command is empty".into()));
        }
        Ok(())
    }

    pub fn spawn_command(&self) -> SpawnCommand {
        let program = self.terminal.command.clone().unwrap_or_else(default_shell);
        let mut command = SpawnCommand::new(program).args(self.terminal.args.iter().cloned());
        command.cwd = self.terminal.cwd.clone();
        command.term = self.terminal.term.clone();
        command.env = self
            .terminal
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        command
    }

    pub fn pump_config(&self) -> PumpConfig {
        PumpConfig {
            poll_interval: Duration::from_millis(self.pump.poll_interval_ms),
            chunk_size: self.pump.chunk_size,
            max_transient_errors: self.pump.max_transient_errors,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            command: self.spawn_command(),
            rows: self.terminal.rows,
            cols: self.terminal.cols,
            pump: self.pump_config(),
        }
    }
}

/// Warn if a config file is world-readable. Environment values for the child
/// may hold credentials.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "config file {} is world-readable (mode {:o}); consider restricting permissions to 600",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.server.port, 5000);
        assert_eq!(settings.terminal.rows, 50);
        assert_eq!(settings.pump.chunk_size, 20 * 1024);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            [server]
            host = "0.0.0.0"
            port = 8080
            cors_origins = ["http://localhost:3000"]
            max_sessions = 4

            [terminal]
            command = "bash"
            args = ["-l"]
            cwd = "/tmp"
            term = "xterm"
            rows = 24
            cols = 80

            [terminal.env]
            LANG = "C.UTF-8"

            [pump]
            poll_interval_ms = 5
            chunk_size = 4096
            max_transient_errors = 3
            channel_capacity = 16
        "#;
        let settings: Settings = toml::from_str(toml).unwrap();
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.cors_origins, vec!["http://localhost:3000"]);
        assert_eq!(settings.server.max_sessions, 4);

        let session = settings.session_config();
        assert_eq!(session.command.display(), "bash -l");
        assert_eq!(session.command.cwd.as_deref(), Some(Path::new("/tmp")));
        assert_eq!(session.command.term, "xterm");
        assert_eq!(
            session.command.env,
            vec![("LANG".to_string(), "C.UTF-8".to_string())]
        );
        assert_eq!((session.rows, session.cols), (24, 80));
        assert_eq!(session.pump.poll_interval, Duration::from_millis(5));
        assert_eq!(session.pump.chunk_size, 4096);
        assert_eq!(session.pump.max_transient_errors, 3);
        assert_eq!(settings.pump.channel_capacity, 16);
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let settings: Settings = toml::from_str("[server]\nport = 9000\n").unwrap();
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.terminal, TerminalSettings::default());
    }

    #[test]
    fn unset_command_falls_back_to_shell() {
        let settings = Settings::default();
        assert_eq!(settings.spawn_command().program, default_shell());
    }

    #[test]
    fn validate_rejects_zero_geometry() {
        let mut settings = Settings::default();
        settings.terminal.rows = 0;
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn validate_rejects_empty_command() {
        let mut settings = Settings::default();
        settings.terminal.command = Some("  ".into());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Settings::load(&dir.path().join("nope.toml")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn resolve_explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        assert!(matches!(
            Settings::resolve(Some(&path)),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();
        let err = Settings::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(..)));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[terminal]\ncommand = \"cat\"\n").unwrap();
        let settings = Settings::load(&path).unwrap().unwrap();
        assert_eq!(settings.terminal.command.as_deref(), Some("cat"));
    }

    #[test]
    fn world_readable_bits() {
        assert!(is_world_readable(0o644));
        assert!(is_world_readable(0o755));
        assert!(!is_world_readable(0o600));
        assert!(!is_world_readable(0o700));
    }
}
