//! Multi-transport Modbus slave/server core.
//!
//! This crate implements the server side of the Modbus protocol: framers
//! for the four wire framings (MBAP socket, RTU, ASCII, TLS), a PDU codec
//! with the standard function codes plus a custom-code registry, an
//! in-memory register datastore, and async servers over TCP, TLS, UDP,
//! Unix domain sockets and serial lines.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use modbus_slave::{
//!     start_tcp_server, DataBlock, ServerConfig, ServerContext, SlaveContext,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let slave = SlaveContext::with_blocks(
//!         DataBlock::new(0, 100),
//!         DataBlock::filled(0, 100, true),
//!         DataBlock::new(0, 100),
//!         DataBlock::new(0, 100),
//!     );
//!     let context = Arc::new(ServerContext::single(slave));
//!     start_tcp_server(context, "0.0.0.0:502".parse()?, ServerConfig::default()).await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod framer;
pub mod identity;
pub mod pdu;
pub mod server;
pub mod store;

pub use error::{ModbusError, Result};
pub use framer::{Framer, FramerKind};
pub use identity::DeviceIdentity;
pub use pdu::{
    CustomFunction, ExceptionCode, FunctionCode, Request, RequestPdu, Response, ResponsePdu,
    ServerDecoder,
};
pub use server::{
    server_async_stop, server_stop, start_serial_server, start_tcp_server, start_tls_server,
    start_udp_server, start_unix_server, SerialConfig, SerialServer, ServerConfig, ServerHandle,
    TcpServer, TlsIdentity, TlsServer, UdpServer, UnixServer,
};
pub use store::{DataBlock, ServerContext, SlaveContext};
