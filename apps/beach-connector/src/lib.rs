pub mod app;
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod protocol;
pub mod router;
pub mod shutdown;
pub mod telemetry;
