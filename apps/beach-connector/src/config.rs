//! Layered connector settings: built-in defaults, then an optional TOML file,
//! then environment variables and command-line flags.

use crate::connection::ConnectionTimings;
use crate::protocol::Credential;
use crate::telemetry::logging::{LogConfig, LogFormat, LogLevel};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_SERVER_URL: &str = "ws://localhost:8080/ws/connector";
pub const DEFAULT_CLIENT_ID: &str = "connector-001";
pub const DEFAULT_CLIENT_NAME: &str = "Beach Connector";
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_RETENTION_HOURS: u64 = 24;
pub const DEFAULT_SWEEP_INTERVAL_MINS: u64 = 60;

/// Tried in order when no config path is given.
pub const CONFIG_CANDIDATES: &[&str] = &["configs/connector.toml", "connector.toml"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorConfig {
    pub server_url: String,
    pub token: String,
    pub client_id: String,
    pub client_name: String,
    pub command_path: Option<String>,
    pub timeout: Duration,
    pub log: LogConfig,
    pub staging_dir: PathBuf,
    pub retention: Duration,
    pub sweep_interval: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            token: String::new(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            command_path: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            log: LogConfig::default(),
            staging_dir: std::env::temp_dir().join("beach-connector"),
            retention: Duration::from_secs(DEFAULT_RETENTION_HOURS * 3600),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_MINS * 60),
        }
    }
}

/// Values supplied by flags or their environment variables. `None` leaves the
/// lower layer untouched.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub server_url: Option<String>,
    pub token: Option<String>,
    pub client_id: Option<String>,
    pub client_name: Option<String>,
    pub command_path: Option<String>,
    pub timeout_secs: Option<u64>,
    pub log_level: Option<LogLevel>,
    pub log_format: Option<LogFormat>,
    pub log_file: Option<PathBuf>,
    pub staging_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    server: ServerSection,
    client: ClientSection,
    command: CommandSection,
    log: LogSection,
    staging: StagingSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ServerSection {
    url: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ClientSection {
    id: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct CommandSection {
    path: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct LogSection {
    level: Option<LogLevel>,
    format: Option<LogFormat>,
    file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct StagingSection {
    dir: Option<PathBuf>,
    retention_hours: Option<u64>,
    sweep_interval_mins: Option<u64>,
}

impl ConnectorConfig {
    /// Resolves the full configuration. An explicit `path` must exist; the
    /// default candidates are optional.
    pub fn load(path: Option<&Path>, overrides: Overrides) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => Some(read_file(path)?),
            None => discover(Path::new("."))?,
        };
        Self::resolve(file.unwrap_or_default(), overrides)
    }

    /// Like [`ConnectorConfig::load`] but parses `text` as the file layer.
    pub fn from_toml(text: &str, overrides: Overrides) -> Result<Self, ConfigError> {
        let file = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        Self::resolve(file, overrides)
    }

    fn resolve(file: FileConfig, overrides: Overrides) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let FileConfig {
            server,
            client,
            command,
            log,
            staging,
        } = file;

        set(&mut config.server_url, server.url);
        set(&mut config.token, server.token);
        set(&mut config.client_id, client.id);
        set(&mut config.client_name, client.name);
        if command.path.is_some() {
            config.command_path = command.path;
        }
        if let Some(secs) = command.timeout_secs {
            config.timeout = Duration::from_secs(secs);
        }
        set(&mut config.log.level, log.level);
        set(&mut config.log.format, log.format);
        if log.file.is_some() {
            config.log.file = log.file;
        }
        set(&mut config.staging_dir, staging.dir);
        if let Some(hours) = staging.retention_hours {
            config.retention = Duration::from_secs(hours.saturating_mul(3600));
        }
        if let Some(mins) = staging.sweep_interval_mins {
            config.sweep_interval = Duration::from_secs(mins.saturating_mul(60));
        }

        set(&mut config.server_url, overrides.server_url);
        set(&mut config.token, overrides.token);
        set(&mut config.client_id, overrides.client_id);
        set(&mut config.client_name, overrides.client_name);
        if overrides.command_path.is_some() {
            config.command_path = overrides.command_path;
        }
        if let Some(secs) = overrides.timeout_secs {
            config.timeout = Duration::from_secs(secs);
        }
        set(&mut config.log.level, overrides.log_level);
        set(&mut config.log.format, overrides.log_format);
        if overrides.log_file.is_some() {
            config.log.file = overrides.log_file;
        }
        set(&mut config.staging_dir, overrides.staging_dir);

        config.command_path = config
            .command_path
            .filter(|path| !path.trim().is_empty());
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.server_url.trim();
        if url.is_empty() {
            return Err(ConfigError::Invalid("server url is required".into()));
        }
        let parsed = Url::parse(url)
            .map_err(|err| ConfigError::Invalid(format!("server url '{url}' is malformed: {err}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(ConfigError::Invalid(format!(
                "server url must use ws or wss, got '{}'",
                parsed.scheme()
            )));
        }
        if self.token.trim().is_empty() {
            return Err(ConfigError::Invalid("auth token is required".into()));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid("command timeout must be positive".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid("staging sweep interval must be positive".into()));
        }
        Ok(())
    }

    pub fn credential(&self) -> Credential {
        Credential::new(&self.token, &self.client_id, &self.client_name)
    }

    pub fn timings(&self) -> ConnectionTimings {
        ConnectionTimings::default()
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn discover(base: &Path) -> Result<Option<FileConfig>, ConfigError> {
    for candidate in CONFIG_CANDIDATES {
        let path = base.join(candidate);
        if path.is_file() {
            tracing::debug!(target: "connector::config", path = %path.display(), "loading config file");
            return read_file(&path).map(Some);
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_token() -> Overrides {
        Overrides {
            token: Some("secret".into()),
            ..Overrides::default()
        }
    }

    #[test_timeout::timeout]
    fn defaults_apply_when_only_token_given() {
        let config = ConnectorConfig::from_toml("", with_token()).unwrap();
        assert_eq!(config.server_url, DEFAULT_SERVER_URL);
        assert_eq!(config.client_id, DEFAULT_CLIENT_ID);
        assert_eq!(config.client_name, DEFAULT_CLIENT_NAME);
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert_eq!(config.retention, Duration::from_secs(24 * 3600));
        assert_eq!(config.command_path, None);
        assert_eq!(config.log.level, LogLevel::Info);
        assert_eq!(config.log.format, LogFormat::Text);
    }

    #[test_timeout::timeout]
    fn file_values_override_defaults_and_flags_override_file() {
        let text = r#"
            [server]
            url = "wss://coordinator.example/ws/connector"
            token = "from-file"

            [client]
            id = "builder-7"

            [command]
            timeout_secs = 30

            [log]
            format = "json"

            [staging]
            retention_hours = 2
            sweep_interval_mins = 5
        "#;
        let overrides = Overrides {
            token: Some("from-flag".into()),
            timeout_secs: Some(45),
            ..Overrides::default()
        };
        let config = ConnectorConfig::from_toml(text, overrides).unwrap();
        assert_eq!(config.server_url, "wss://coordinator.example/ws/connector");
        assert_eq!(config.token, "from-flag");
        assert_eq!(config.client_id, "builder-7");
        assert_eq!(config.client_name, DEFAULT_CLIENT_NAME);
        assert_eq!(config.timeout, Duration::from_secs(45));
        assert_eq!(config.retention, Duration::from_secs(7200));
        assert_eq!(config.sweep_interval, Duration::from_secs(300));
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test_timeout::timeout]
    fn missing_token_is_rejected() {
        let err = ConnectorConfig::from_toml("", Overrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.contains("token")));
    }

    #[test_timeout::timeout]
    fn non_websocket_scheme_is_rejected() {
        let overrides = Overrides {
            server_url: Some("http://localhost:8080/ws".into()),
            ..with_token()
        };
        let err = ConnectorConfig::from_toml("", overrides).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.contains("ws or wss")));

        let malformed = Overrides {
            server_url: Some("::nope".into()),
            ..with_token()
        };
        assert!(ConnectorConfig::from_toml("", malformed).is_err());
    }

    #[test_timeout::timeout]
    fn zero_timeout_is_rejected() {
        let overrides = Overrides {
            timeout_secs: Some(0),
            ..with_token()
        };
        assert!(matches!(
            ConnectorConfig::from_toml("", overrides),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test_timeout::timeout]
    fn unknown_keys_fail_to_parse() {
        let err = ConnectorConfig::from_toml("[server]\nport = 1\n", with_token()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test_timeout::timeout]
    fn blank_command_path_counts_as_unset() {
        let overrides = Overrides {
            command_path: Some("  ".into()),
            ..with_token()
        };
        let config = ConnectorConfig::from_toml("", overrides).unwrap();
        assert_eq!(config.command_path, None);
    }

    #[test_timeout::timeout]
    fn discovery_prefers_configs_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("configs")).unwrap();
        fs::write(dir.path().join("configs/connector.toml"), "[client]\nid = \"a\"\n").unwrap();
        fs::write(dir.path().join("connector.toml"), "[client]\nid = \"b\"\n").unwrap();
        let found = discover(dir.path()).unwrap().unwrap();
        assert_eq!(found.client.id.as_deref(), Some("a"));

        let empty = tempfile::tempdir().unwrap();
        assert!(discover(empty.path()).unwrap().is_none());
    }

    #[test_timeout::timeout]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConnectorConfig::load(Some(&dir.path().join("absent.toml")), with_token())
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test_timeout::timeout]
    fn credential_carries_client_identity() {
        let config = ConnectorConfig::from_toml("", with_token()).unwrap();
        let credential = config.credential();
        assert_eq!(credential.token, "secret");
        assert_eq!(credential.client_id, DEFAULT_CLIENT_ID);
        assert_eq!(credential.client_type, "connector");
    }
}
