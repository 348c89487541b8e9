//! A multi-unit Modbus slave (server) over TCP and serial RTU, built on [tokio](https://tokio.rs).
//!
//! ## Overview
//!
//! The server owns a contiguous range of unit ids. Each unit has the four Modbus
//! tables (coils, discrete inputs, holding registers and input registers) of 65536
//! entries each. Writes to holding registers and coils at or above configurable
//! offsets are mirrored into input registers and discrete inputs.
//!
//! Requests from every transport are funneled into one queue and executed one at a
//! time by a single router task, in arrival order:
//!
//! - the TCP transport accepts connections and splits the stream on MBAP headers,
//! - [`rtu`] runs a [`reassembler::Reassembler`] per serial port to cut frames out
//!   of the byte stream,
//! - [`function`] maps function codes to handlers working on [`memory::Memory`].
//!
//! Frames addressed to units outside the range get no response at all; malformed
//! frames are dropped; refused requests get a protocol exception response.
//!
//! ```no_run
//! use modbus_slave::{Server, ServerConfig};
//!
//! # async fn run() -> modbus_slave::Result<()> {
//! let config = ServerConfig::from_yaml_file("slave.yaml")?;
//! let server = Server::start(&config).await?;
//! tokio::signal::ctrl_c().await?;
//! server.close().await;
//! # Ok(())
//! # }
//! ```

/// Utilities for encoding from and decoding to Modbus registers and coils
pub mod codec;
/// Startup configuration loaded from YAML
pub mod config;
/// Modbus RTU CRC-16
pub mod crc;
mod error;
mod exception;
/// RTU and MBAP frames behind the common `Framer` trait
pub mod frame;
/// Function code handlers and their dispatch
pub mod function;
/// Coil and register tables of every served unit
pub mod memory;
/// Cutting RTU frames out of the serial byte stream
pub mod reassembler;
/// Serial line transport
pub mod rtu;
/// Request routing and server lifecycle
pub mod server;
mod tcp;

pub use config::{ServerConfig, SerialConfig, TcpConfig};
pub use error::{Error, Result};
pub use exception::Exception;
pub use frame::{FrameError, Framer, RtuFrame, TcpFrame};
pub use function::{Functions, Handler};
pub use memory::{BitTable, Memory, UnitIndex, WordTable};
pub use reassembler::Framing;
pub use server::{Request, Server};
