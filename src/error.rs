//! Error types for driver lifecycle and remote session handling.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrawlerError {
    #[error("chromedriver executable not found (set CHROMEDRIVER_PATH or install chromedriver)")]
    DriverNotFound,

    #[error("failed to spawn chromedriver: {0}")]
    DriverSpawn(#[source] std::io::Error),

    #[error("failed to stop chromedriver: {0}")]
    DriverStop(#[source] std::io::Error),

    #[error("chromedriver did not accept connections within {timeout:?}")]
    DriverUnavailable { timeout: Duration },

    #[error("failed to initialize TLS connector: {0}")]
    Connector(String),

    #[error("failed to create remote session: {0}")]
    NewSession(#[from] fantoccini::error::NewSessionError),

    #[error("timed out connecting to {endpoint} after {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    #[error("remote session request exceeded {timeout:?}")]
    RequestTimeout { timeout: Duration },

    #[error("remote session command failed: {0}")]
    Session(#[from] fantoccini::error::CmdError),
}

pub type Result<T> = std::result::Result<T, CrawlerError>;
