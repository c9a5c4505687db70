//! Multi-transport Modbus server.
//!
//! One shared protocol core drives five transport adapters: TCP, TLS,
//! UDP, Unix domain sockets and serial (RTU or ASCII). Each accepted
//! connection gets its own handler task owning its framer; the datastore
//! is the only state shared between handlers.

mod handler;
mod lifecycle;
mod serial;
mod tcp;
mod tls;
mod udp;
mod unix;

pub use lifecycle::{
    server_async_stop, server_stop, start_serial_server, start_tcp_server, start_tls_server,
    start_udp_server, start_unix_server, ServerHandle,
};
pub use serial::{SerialConfig, SerialServer};
pub use tcp::TcpServer;
pub use tls::{TlsIdentity, TlsServer};
pub use udp::UdpServer;
pub use unix::UnixServer;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{ModbusError, Result};
use crate::framer::FramerKind;
use crate::identity::DeviceIdentity;
use crate::pdu::{CustomFunction, Request, Response, ServerDecoder};
use crate::store::ServerContext;

/// Hook that may replace a response before it is framed. The second
/// element of the return value skips framing entirely and sends the PDU
/// bytes raw.
pub type ResponseManipulator = Arc<dyn Fn(Response) -> (Response, bool) + Send + Sync>;

/// Observation hook called with every dispatched request and, for UDP,
/// the peer it came from.
pub type RequestTracer = Arc<dyn Fn(&Request, Option<SocketAddr>) + Send + Sync>;

/// Behavior knobs shared by every server type.
#[derive(Default)]
pub struct ServerConfig {
    pub framer: FramerKind,
    pub identity: DeviceIdentity,
    /// Drop requests for unknown slave ids instead of answering with a
    /// gateway-no-response exception
    pub ignore_missing_slaves: bool,
    /// Treat slave id 0 as broadcast: execute on every slave, answer never
    pub broadcast_enable: bool,
    pub response_manipulator: Option<ResponseManipulator>,
    pub request_tracer: Option<RequestTracer>,
    /// Custom function codes, registered before the server starts
    pub custom_functions: Vec<Arc<dyn CustomFunction>>,
}

/// Immutable server-wide state shared with every handler task.
pub(crate) struct ServerState {
    pub context: Arc<ServerContext>,
    pub decoder: Arc<ServerDecoder>,
    pub identity: DeviceIdentity,
    pub framer_kind: FramerKind,
    pub ignore_missing_slaves: bool,
    pub broadcast_enable: bool,
    pub handle_local_echo: bool,
    pub response_manipulator: Option<ResponseManipulator>,
    pub request_tracer: Option<RequestTracer>,
}

impl ServerState {
    fn new(context: Arc<ServerContext>, config: ServerConfig, handle_local_echo: bool) -> Self {
        // snapshot the registry; registrations after start have no effect
        let mut decoder = ServerDecoder::new();
        for function in config.custom_functions {
            decoder.register(function);
        }
        Self {
            context,
            decoder: Arc::new(decoder),
            identity: config.identity,
            framer_kind: config.framer,
            ignore_missing_slaves: config.ignore_missing_slaves,
            broadcast_enable: config.broadcast_enable,
            handle_local_echo,
            response_manipulator: config.response_manipulator,
            request_tracer: config.request_tracer,
        }
    }

    /// Slave ids the framer may accept, id 0 included when broadcast is on.
    pub fn allowed_slaves(&self) -> Vec<u8> {
        let mut slaves = self.context.slaves();
        if self.broadcast_enable && !slaves.contains(&0) {
            slaves.push(0);
        }
        slaves
    }
}

/// Live peers, keyed by client address. Values are per-connection
/// cancellation tokens; handler tasks register themselves on entry and
/// deregister on exit.
pub(crate) type ConnectionMap = Arc<Mutex<HashMap<String, CancellationToken>>>;

fn lock_connections(
    connections: &Mutex<HashMap<String, CancellationToken>>,
) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
    match connections.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One-shot boolean signal backed by a watch channel.
pub(crate) struct Signal {
    tx: watch::Sender<bool>,
}

impl Signal {
    fn new() -> Self {
        Self {
            tx: watch::channel(false).0,
        }
    }

    fn set(&self) {
        // send_replace so the value sticks even with no receiver yet
        self.tx.send_replace(true);
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Plumbing common to all five server types: shared state, the live
/// connection registry, shutdown token and the lifecycle signals.
pub(crate) struct ServerCore {
    pub state: Arc<ServerState>,
    pub connections: ConnectionMap,
    pub cancel: CancellationToken,
    serving_started: Signal,
    serving_done: Signal,
    running: AtomicBool,
}

impl ServerCore {
    fn new(context: Arc<ServerContext>, config: ServerConfig, handle_local_echo: bool) -> Self {
        Self {
            state: Arc::new(ServerState::new(context, config, handle_local_echo)),
            connections: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
            serving_started: Signal::new(),
            serving_done: Signal::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Guard against serve_forever re-entry.
    fn begin_serving(&self, what: &str) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ModbusError::AlreadyRunning(format!(
                "serve_forever called twice on the {what} server"
            )));
        }
        Ok(())
    }

    fn mark_started(&self) {
        self.serving_started.set();
    }

    fn mark_done(&self) {
        self.serving_done.set();
    }

    /// Cancel every live handler. Iterates a snapshot; the handlers
    /// deregister themselves as they wind down.
    fn cancel_connections(&self) {
        let snapshot: Vec<(String, CancellationToken)> = lock_connections(&self.connections)
            .iter()
            .map(|(peer, token)| (peer.clone(), token.clone()))
            .collect();
        for (peer, token) in snapshot {
            warn!(%peer, "aborting active session");
            token.cancel();
        }
    }

    /// Handle for stopping this server from anywhere.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle::new(
            self.cancel.clone(),
            self.serving_started.subscribe(),
            self.serving_done.subscribe(),
        )
    }

    /// Resolves once the listener is ready.
    pub async fn wait_started(&self) {
        self.serving_started.wait().await;
    }

    /// Resolves once shutdown has completed.
    pub async fn wait_done(&self) {
        self.serving_done.wait().await;
    }

    /// Request shutdown and wait for the serve loop to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if self.running.load(Ordering::SeqCst) {
            self.wait_done().await;
        }
    }
}
