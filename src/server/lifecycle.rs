//! Server lifecycle: start helpers and the process-wide stop surface.
//!
//! One server per process may be registered as the active server; the
//! `start_*_server` functions fill the slot for their whole run and the
//! stop helpers drive shutdown through it, including from a thread that
//! is not running the event loop.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ModbusError, Result};
use crate::server::{
    SerialConfig, SerialServer, ServerConfig, TcpServer, TlsIdentity, TlsServer, UdpServer,
    UnixServer,
};
use crate::store::ServerContext;

/// Remote control for a running server: trigger shutdown, await the
/// lifecycle signals.
#[derive(Clone)]
pub struct ServerHandle {
    cancel: CancellationToken,
    started: watch::Receiver<bool>,
    done: watch::Receiver<bool>,
}

impl ServerHandle {
    pub(crate) fn new(
        cancel: CancellationToken,
        started: watch::Receiver<bool>,
        done: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cancel,
            started,
            done,
        }
    }

    /// Request shutdown. Safe to call from any thread.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the server is listening.
    pub async fn wait_started(&self) {
        wait_signal(&self.started).await;
    }

    /// Resolves once shutdown has completed.
    pub async fn wait_done(&self) {
        wait_signal(&self.done).await;
    }

    /// Block until shutdown has completed or `timeout` elapsed. For
    /// threads that are not running the event loop.
    pub fn wait_done_blocking(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut rx = self.done.clone();
        while !*rx.borrow_and_update() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        true
    }
}

async fn wait_signal(rx: &watch::Receiver<bool>) {
    let mut rx = rx.clone();
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

static ACTIVE_SERVER: Mutex<Option<ServerHandle>> = Mutex::new(None);

fn active_slot() -> MutexGuard<'static, Option<ServerHandle>> {
    match ACTIVE_SERVER.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn register_active(handle: ServerHandle) -> Result<()> {
    let mut slot = active_slot();
    if slot.is_some() {
        return Err(ModbusError::AlreadyRunning(
            "another server is already registered as active".to_string(),
        ));
    }
    *slot = Some(handle);
    Ok(())
}

fn clear_active() {
    *active_slot() = None;
}

/// Register the server as active, run it to completion, release the slot.
async fn run_server<F>(handle: ServerHandle, serve: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    register_active(handle)?;
    let result = serve.await;
    clear_active();
    result
}

/// Start a Modbus TCP server and run it until shutdown.
pub async fn start_tcp_server(
    context: Arc<ServerContext>,
    addr: SocketAddr,
    config: ServerConfig,
) -> Result<()> {
    let server = TcpServer::new(context, addr, config);
    run_server(server.handle(), server.serve_forever()).await
}

/// Start a Modbus TLS server and run it until shutdown.
pub async fn start_tls_server(
    context: Arc<ServerContext>,
    addr: SocketAddr,
    identity: TlsIdentity,
    config: ServerConfig,
) -> Result<()> {
    let server = TlsServer::new(context, addr, identity, config);
    run_server(server.handle(), server.serve_forever()).await
}

/// Start a Modbus UDP server and run it until shutdown.
pub async fn start_udp_server(
    context: Arc<ServerContext>,
    addr: SocketAddr,
    config: ServerConfig,
) -> Result<()> {
    let server = UdpServer::new(context, addr, config);
    run_server(server.handle(), server.serve_forever()).await
}

/// Start a Modbus server on a Unix socket and run it until shutdown.
pub async fn start_unix_server(
    context: Arc<ServerContext>,
    path: impl Into<PathBuf>,
    config: ServerConfig,
) -> Result<()> {
    let server = UnixServer::new(context, path, config);
    run_server(server.handle(), server.serve_forever()).await
}

/// Start a Modbus serial server and run it until shutdown.
pub async fn start_serial_server(
    context: Arc<ServerContext>,
    serial: SerialConfig,
    config: ServerConfig,
) -> Result<()> {
    let server = SerialServer::new(context, serial, config);
    server.start().await?;
    run_server(server.handle(), server.serve_forever()).await
}

/// Shut down the active server and wait for it to finish.
pub async fn server_async_stop() -> Result<()> {
    let handle = active_slot().take().ok_or(ModbusError::NoActiveServer)?;
    debug!("stopping active server");
    handle.stop();
    handle.wait_done().await;
    Ok(())
}

/// Shut down the active server from a foreign thread.
pub fn server_stop() -> Result<()> {
    let handle = active_slot().take().ok_or(ModbusError::NoActiveServer)?;
    debug!("stopping active server");
    handle.stop();
    if !handle.wait_done_blocking(Duration::from_secs(10)) {
        return Err(ModbusError::ConnectionError(
            "server did not stop within 10s".to_string(),
        ));
    }
    Ok(())
}
