// Configuration loading and parsing (config/server.toml).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },
}

// ---------------------------------------------------------------------------
// Assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub ws_port: u16,
    pub db_path: String,
    pub race: RaceConfig,
}

/// Timing and admission rules for race rooms.
#[derive(Debug, Clone)]
pub struct RaceConfig {
    /// Delay between the start condition being met and the race actually
    /// starting. The condition is re-checked when the countdown elapses.
    pub countdown_secs: u64,
    /// Minimum participant count required to arm the start countdown.
    pub min_players_to_start: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ws_port: 9090,
            db_path: "keysprint.db".into(),
            race: RaceConfig::default(),
        }
    }
}

impl Default for RaceConfig {
    fn default() -> Self {
        RaceConfig {
            countdown_secs: 5,
            min_players_to_start: 2,
        }
    }
}

// ---------------------------------------------------------------------------
// server.toml structs
// ---------------------------------------------------------------------------

/// Raw deserialization target for the server.toml file. Sections map onto
/// the assembled `Config`; every section and field is optional so a partial
/// file overrides only what it names.
#[derive(Debug, Clone, Deserialize, Default)]
struct ServerFile {
    #[serde(default)]
    websocket: WebsocketSection,
    #[serde(default)]
    race: RaceSection,
    #[serde(default)]
    database: DatabaseSection,
}

#[derive(Debug, Clone, Deserialize)]
struct WebsocketSection {
    port: u16,
}

impl Default for WebsocketSection {
    fn default() -> Self {
        WebsocketSection {
            port: Config::default().ws_port,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RaceSection {
    countdown_secs: u64,
    min_players_to_start: u32,
}

impl Default for RaceSection {
    fn default() -> Self {
        let race = RaceConfig::default();
        RaceSection {
            countdown_secs: race.countdown_secs,
            min_players_to_start: race.min_players_to_start,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DatabaseSection {
    path: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        DatabaseSection {
            path: Config::default().db_path,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load configuration from `config/server.toml` relative to `base_dir`.
///
/// A missing file yields the documented defaults; a present-but-invalid
/// file is an error (silently ignoring a typo'd config is worse than
/// refusing to start).
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let path = base_dir.join("config").join("server.toml");

    let file: ServerFile = if path.exists() {
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::ReadError {
            path: path.clone(),
            source: e,
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseError {
            path: path.clone(),
            source: e,
        })?
    } else {
        ServerFile::default()
    };

    let config = Config {
        ws_port: file.websocket.port,
        db_path: file.database.path,
        race: RaceConfig {
            countdown_secs: file.race.countdown_secs,
            min_players_to_start: file.race.min_players_to_start,
        },
    };

    validate(&config)?;

    Ok(config)
}

/// Load configuration from the current working directory.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|e| ConfigError::ReadError {
        path: PathBuf::from("."),
        source: e,
    })?;
    load_config_from(&cwd)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.race.countdown_secs == 0 {
        return Err(ConfigError::ValidationError {
            field: "race.countdown_secs".into(),
            message: "must be at least 1 second".into(),
        });
    }
    if config.race.min_players_to_start < 2 {
        return Err(ConfigError::ValidationError {
            field: "race.min_players_to_start".into(),
            message: "a race needs at least 2 players to start".into(),
        });
    }
    if config.db_path.is_empty() {
        return Err(ConfigError::ValidationError {
            field: "database.path".into(),
            message: "must not be empty".into(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, contents: &str) {
        let config_dir = dir.join("config");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(config_dir.join("server.toml"), contents).unwrap();
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(dir.path()).unwrap();
        assert_eq!(config.ws_port, 9090);
        assert_eq!(config.race.countdown_secs, 5);
        assert_eq!(config.race.min_players_to_start, 2);
        assert_eq!(config.db_path, "keysprint.db");
    }

    #[test]
    fn full_file_overrides_everything() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"
            [websocket]
            port = 4040

            [race]
            countdown_secs = 3
            min_players_to_start = 4

            [database]
            path = "races.db"
            "#,
        );
        let config = load_config_from(dir.path()).unwrap();
        assert_eq!(config.ws_port, 4040);
        assert_eq!(config.race.countdown_secs, 3);
        assert_eq!(config.race.min_players_to_start, 4);
        assert_eq!(config.db_path, "races.db");
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_sections() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"
            [websocket]
            port = 7777
            "#,
        );
        let config = load_config_from(dir.path()).unwrap();
        assert_eq!(config.ws_port, 7777);
        assert_eq!(config.race.countdown_secs, 5);
        assert_eq!(config.db_path, "keysprint.db");
    }

    #[test]
    fn zero_countdown_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"
            [race]
            countdown_secs = 0
            min_players_to_start = 2
            "#,
        );
        let err = load_config_from(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn garbage_toml_is_an_error_not_a_fallback() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "this is { not toml");
        let err = load_config_from(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }
}
