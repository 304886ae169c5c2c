use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;
use crate::executor::ProgramLookupError;
use crate::telemetry::logging::InitError;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Logging(#[from] InitError),
    #[error("failed to prepare staging directory {path:?}: {source}")]
    Staging {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    CommandPath(#[from] ProgramLookupError),
    #[error("inbound work queue was already claimed")]
    InboundClaimed,
    #[error("failed to install signal handlers: {0}")]
    Signals(std::io::Error),
}
