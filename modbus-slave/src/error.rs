use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[cfg(feature = "serial")]
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("server is shut down")]
    Closed,
}
