//! Error handling for the Modbus slave core.
//!
//! All protocol-level failures (bad addresses, bad values, missing slaves)
//! are mapped to wire-level exception responses inside the request handler;
//! the variants here cover everything that cannot be expressed as a Modbus
//! exception, plus the lookup errors the handler translates.

use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, ModbusError>;

/// Errors raised by the Modbus slave core
#[derive(Debug, Error)]
pub enum ModbusError {
    /// Request addressed to a slave id the server context does not hold
    #[error("No such slave: {0}")]
    NoSuchSlave(u8),

    /// Register access outside the configured block window
    #[error("Illegal data address: {address} (count {count})")]
    IllegalDataAddress { address: u16, count: u16 },

    /// Transport-level connection failure
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Invalid server or transport configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// serve_forever called on a running server, or a second server
    /// started before the active one was stopped
    #[error("Server already running: {0}")]
    AlreadyRunning(String),

    /// Stop requested while no server is registered as active
    #[error("No active server")]
    NoActiveServer,

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
