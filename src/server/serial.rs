//! Modbus serial server (RTU or ASCII).
//!
//! One open port, one handler. If the line drops and `auto_reconnect` is
//! set, the port is reopened after `reconnect_delay_ms`; shutdown cancels
//! a pending reconnect. A port string of the form `socket:host:port`
//! switches to a TCP listener carrying the serial framing, which is how
//! virtualized serial setups are tested.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, warn};

use crate::error::{ModbusError, Result};
use crate::framer::FramerKind;
use crate::server::handler::run_stream_handler;
use crate::server::tcp::bind_listener;
use crate::server::{ServerConfig, ServerCore, ServerHandle};
use crate::store::ServerContext;

/// Serial line configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path, or `socket:host:port` for the TCP listener mode
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    /// "N", "E" or "O"
    pub parity: String,
    pub stop_bits: u8,
    pub timeout_ms: Option<u64>,
    /// Strip locally echoed bytes before framing (half-duplex dongles)
    pub handle_local_echo: bool,
    pub auto_reconnect: bool,
    pub reconnect_delay_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 19200,
            data_bits: 8,
            parity: "N".to_string(),
            stop_bits: 1,
            timeout_ms: None,
            handle_local_echo: false,
            auto_reconnect: false,
            reconnect_delay_ms: 2000,
        }
    }
}

impl SerialConfig {
    fn data_bits(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    fn stop_bits(&self) -> tokio_serial::StopBits {
        match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }

    fn parity(&self) -> tokio_serial::Parity {
        match self.parity.as_str() {
            "E" | "e" => tokio_serial::Parity::Even,
            "O" | "o" => tokio_serial::Parity::Odd,
            _ => tokio_serial::Parity::None,
        }
    }

    /// The `host:port` part when the port string selects listener mode.
    fn socket_address(&self) -> Option<&str> {
        self.port.strip_prefix("socket:")
    }
}

/// A Modbus server on a serial line.
pub struct SerialServer {
    core: ServerCore,
    config: SerialConfig,
    pending: tokio::sync::Mutex<Option<SerialStream>>,
    bound: std::sync::Mutex<Option<std::net::SocketAddr>>,
}

impl SerialServer {
    /// Create a serial server. The framing defaults to RTU when the
    /// common config still carries the socket framer.
    pub fn new(context: Arc<ServerContext>, serial: SerialConfig, mut config: ServerConfig) -> Self {
        if config.framer == FramerKind::Socket {
            config.framer = FramerKind::Rtu;
        }
        let handle_local_echo = serial.handle_local_echo;
        Self {
            core: ServerCore::new(context, config, handle_local_echo),
            config: serial,
            pending: tokio::sync::Mutex::new(None),
            bound: std::sync::Mutex::new(None),
        }
    }

    /// The bound address in `socket:` listener mode, available once
    /// serving has started.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        *self.bound.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open_port(&self) -> Result<SerialStream> {
        let mut builder = tokio_serial::new(self.config.port.as_str(), self.config.baud_rate)
            .data_bits(self.config.data_bits())
            .stop_bits(self.config.stop_bits())
            .parity(self.config.parity());
        if let Some(timeout_ms) = self.config.timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout_ms));
        }
        builder.open_native_async().map_err(|err| {
            ModbusError::ConnectionError(format!(
                "failed to open serial port {}: {err}",
                self.config.port
            ))
        })
    }

    /// Open the port ahead of `serve_forever`. With `auto_reconnect` a
    /// failure here only schedules the first reconnect attempt.
    pub async fn start(&self) -> Result<()> {
        if self.config.socket_address().is_some() {
            return Ok(());
        }
        match self.open_port() {
            Ok(stream) => {
                *self.pending.lock().await = Some(stream);
                Ok(())
            }
            Err(err) if self.config.auto_reconnect => {
                warn!(%err, "serial open failed, will reconnect");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub fn handle(&self) -> ServerHandle {
        self.core.handle()
    }

    pub async fn serving_started(&self) {
        self.core.wait_started().await;
    }

    /// Serve the line until shutdown, reconnecting when configured to.
    pub async fn serve_forever(&self) -> Result<()> {
        self.core.begin_serving("Serial")?;
        if let Some(listen) = self.config.socket_address() {
            return self.serve_socket(listen).await;
        }
        info!(port = %self.config.port, "Server(Serial) listening");
        self.core.mark_started();

        loop {
            let stream = match self.pending.lock().await.take() {
                Some(stream) => Ok(stream),
                None => self.open_port(),
            };
            match stream {
                Ok(stream) => {
                    run_stream_handler(
                        stream,
                        self.config.port.clone(),
                        self.core.state.clone(),
                        self.core.connections.clone(),
                        self.core.cancel.child_token(),
                    )
                    .await;
                }
                Err(err) => {
                    error!(%err, "serial connection failed");
                    if !self.config.auto_reconnect {
                        self.core.mark_done();
                        return Err(err);
                    }
                }
            }
            if self.core.cancel.is_cancelled() || !self.config.auto_reconnect {
                break;
            }
            debug!(
                delay_ms = self.config.reconnect_delay_ms,
                "scheduling serial reconnect"
            );
            tokio::select! {
                _ = self.core.cancel.cancelled() => break,
                _ = sleep(Duration::from_millis(self.config.reconnect_delay_ms)) => {}
            }
        }

        self.core.mark_done();
        info!("Server(Serial) graceful shutdown");
        Ok(())
    }

    /// Listener mode for `socket:host:port` port strings.
    async fn serve_socket(&self, listen: &str) -> Result<()> {
        let addr = match listen.parse() {
            Ok(addr) => addr,
            Err(err) => {
                self.core.mark_done();
                return Err(ModbusError::ConfigError(format!(
                    "bad socket address {listen}: {err}"
                )));
            }
        };
        let listener = match bind_listener(addr, true, 20) {
            Ok(listener) => listener,
            Err(err) => {
                self.core.mark_done();
                return Err(err);
            }
        };
        *self
            .bound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = listener.local_addr().ok();
        self.core.mark_started();
        info!(%addr, "Server(Serial) listening on socket");

        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.core.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tasks.spawn(run_stream_handler(
                            stream,
                            peer.to_string(),
                            self.core.state.clone(),
                            self.core.connections.clone(),
                            self.core.cancel.child_token(),
                        ));
                    }
                    Err(err) => {
                        error!(%err, "accept failed, stopping listener");
                        break;
                    }
                },
            }
        }

        self.core.cancel_connections();
        while tasks.join_next().await.is_some() {}
        drop(listener);
        self.core.mark_done();
        info!("Server(Serial) graceful shutdown");
        Ok(())
    }

    /// Stop serving; cancels a pending reconnect and closes the port.
    pub async fn shutdown(&self) {
        self.core.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, 19200);
        assert_eq!(config.data_bits, 8);
        assert_eq!(config.parity, "N");
        assert_eq!(config.stop_bits, 1);
        assert_eq!(config.reconnect_delay_ms, 2000);
        assert!(!config.auto_reconnect);
        assert!(!config.handle_local_echo);
    }

    #[test]
    fn test_socket_address_detection() {
        let config = SerialConfig {
            port: "socket:127.0.0.1:5020".to_string(),
            ..Default::default()
        };
        assert_eq!(config.socket_address(), Some("127.0.0.1:5020"));
        assert_eq!(SerialConfig::default().socket_address(), None);
    }

    #[test]
    fn test_parity_mapping() {
        for (text, parity) in [
            ("N", tokio_serial::Parity::None),
            ("E", tokio_serial::Parity::Even),
            ("O", tokio_serial::Parity::Odd),
        ] {
            let config = SerialConfig {
                parity: text.to_string(),
                ..Default::default()
            };
            assert_eq!(config.parity(), parity);
        }
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: SerialConfig =
            serde_json::from_str(r#"{"port": "/dev/ttyUSB0", "auto_reconnect": true}"#)
                .expect("valid config");
        assert_eq!(config.port, "/dev/ttyUSB0");
        assert!(config.auto_reconnect);
        assert_eq!(config.baud_rate, 19200);
    }
}
