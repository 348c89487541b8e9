//! Startup configuration.
//!
//! ```yaml
//! lower_id: 1
//! upper_id: 4
//! offset_input_registers: 10000
//! offset_discrete_inputs: 10000
//! tcp:
//!   address: 0.0.0.0:1502
//! serial:
//!   - path: /dev/ttyUSB0
//!     baud_rate: 19200
//!     parity: even
//!     framing: fixed_prefix
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reassembler::Framing;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("slave id 0 is reserved for broadcast")]
    BroadcastId,

    #[error("lower slave id {lower} is above upper slave id {upper}")]
    InvalidIdRange { lower: u8, upper: u8 },

    #[error("request queue capacity must be at least 1")]
    QueueCapacity,

    #[error("serial port {path}: {reason}")]
    Serial { path: String, reason: String },
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub address: String,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:1502".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub path: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
    /// Per-read timeout; an empty read of this length is line silence.
    pub read_timeout_ms: u64,
    pub framing: Framing,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: "/dev/ttyUSB0".to_string(),
            baud_rate: 19200,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            read_timeout_ms: 5,
            framing: Framing::Silence,
        }
    }
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let reason = if self.baud_rate == 0 {
            "baud rate must be positive".to_string()
        } else if !(5..=8).contains(&self.data_bits) {
            format!("unsupported data bits {}", self.data_bits)
        } else if !(1..=2).contains(&self.stop_bits) {
            format!("unsupported stop bits {}", self.stop_bits)
        } else if self.read_timeout_ms == 0 {
            "read timeout must be positive".to_string()
        } else {
            return Ok(());
        };
        Err(ConfigError::Serial {
            path: self.path.clone(),
            reason,
        })
    }
}

/// Units served, alias offsets and transports of one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub lower_id: u8,
    pub upper_id: u8,
    /// Holding register `r >= offset` is mirrored into input register `r - offset`.
    pub offset_input_registers: u16,
    /// Coil `r >= offset` is mirrored into discrete input `r - offset`.
    pub offset_discrete_inputs: u16,
    /// Requests waiting for the router before producers block.
    pub queue_capacity: usize,
    pub tcp: Option<TcpConfig>,
    pub serial: Vec<SerialConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            lower_id: 1,
            upper_id: 1,
            offset_input_registers: 10000,
            offset_discrete_inputs: 10000,
            queue_capacity: 64,
            tcp: Some(TcpConfig::default()),
            serial: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lower_id == 0 {
            return Err(ConfigError::BroadcastId);
        }
        if self.lower_id > self.upper_id {
            return Err(ConfigError::InvalidIdRange {
                lower: self.lower_id,
                upper: self.upper_id,
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::QueueCapacity);
        }
        self.serial.iter().try_for_each(SerialConfig::validate)
    }
}
