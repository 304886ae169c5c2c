use clap::{Args, Parser};
use std::path::PathBuf;

use crate::config::Overrides;
use crate::telemetry::logging::{LogFormat, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "beach-connector",
    about = "🏖️  Run coordinator-issued commands on this host over a persistent WebSocket",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        value_name = "PATH",
        env = "BEACH_CONNECTOR_CONFIG",
        help = "TOML config file (defaults to ./configs/connector.toml, then ./connector.toml)"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "URL",
        env = "BEACH_CONNECTOR_SERVER_URL",
        help = "Coordinator WebSocket endpoint (ws:// or wss://)"
    )]
    pub server_url: Option<String>,

    #[arg(
        long,
        env = "BEACH_CONNECTOR_TOKEN",
        hide_env_values = true,
        help = "Bearer token presented during the handshake and in the credential"
    )]
    pub token: Option<String>,

    #[arg(long, env = "BEACH_CONNECTOR_CLIENT_ID")]
    pub client_id: Option<String>,

    #[arg(long, env = "BEACH_CONNECTOR_CLIENT_NAME")]
    pub client_name: Option<String>,

    #[arg(
        long,
        value_name = "PROGRAM",
        env = "BEACH_CONNECTOR_COMMAND_PATH",
        help = "Fixed program that receives every command token as an argument"
    )]
    pub command_path: Option<String>,

    #[arg(
        long,
        value_name = "SECS",
        env = "BEACH_CONNECTOR_TIMEOUT_SECS",
        help = "Per-command wall-clock limit"
    )]
    pub timeout_secs: Option<u64>,

    #[arg(
        long,
        value_name = "DIR",
        env = "BEACH_CONNECTOR_STAGING_DIR",
        help = "Directory for files staged alongside commands"
    )]
    pub staging_dir: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone, Default)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "BEACH_CONNECTOR_LOG_LEVEL",
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: Option<LogLevel>,

    #[arg(
        long = "log-format",
        value_enum,
        env = "BEACH_CONNECTOR_LOG_FORMAT",
        help = "Log line format (text, json)"
    )]
    pub format: Option<LogFormat>,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "BEACH_CONNECTOR_LOG_FILE",
        help = "Append logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl Cli {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            server_url: self.server_url.clone(),
            token: self.token.clone(),
            client_id: self.client_id.clone(),
            client_name: self.client_name.clone(),
            command_path: self.command_path.clone(),
            timeout_secs: self.timeout_secs,
            log_level: self.logging.level,
            log_format: self.logging.format,
            log_file: self.logging.file.clone(),
            staging_dir: self.staging_dir.clone(),
        }
    }
}
