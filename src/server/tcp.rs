//! Modbus TCP server.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::error::Result;
use crate::server::handler::run_stream_handler;
use crate::server::{ServerConfig, ServerCore, ServerHandle};
use crate::store::ServerContext;

pub(crate) const DEFAULT_BACKLOG: u32 = 20;

/// Bind a TCP listener with explicit socket options.
pub(crate) fn bind_listener(
    addr: SocketAddr,
    allow_reuse_address: bool,
    backlog: u32,
) -> Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    if allow_reuse_address {
        socket.set_reuse_address(true)?;
    }
    socket.set_nodelay(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;
    Ok(TcpListener::from_std(socket.into())?)
}

/// A Modbus server listening on a TCP socket, speaking MBAP framing.
pub struct TcpServer {
    core: ServerCore,
    addr: SocketAddr,
    allow_reuse_address: bool,
    backlog: u32,
    bound: Mutex<Option<SocketAddr>>,
}

impl TcpServer {
    pub fn new(context: Arc<ServerContext>, addr: SocketAddr, config: ServerConfig) -> Self {
        Self {
            core: ServerCore::new(context, config, false),
            addr,
            allow_reuse_address: false,
            backlog: DEFAULT_BACKLOG,
            bound: Mutex::new(None),
        }
    }

    /// Override listener socket options.
    pub fn with_socket_options(mut self, allow_reuse_address: bool, backlog: u32) -> Self {
        self.allow_reuse_address = allow_reuse_address;
        self.backlog = backlog;
        self
    }

    /// The bound address, available once serving has started. Useful when
    /// binding to port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Handle for stopping this server from another task or thread.
    pub fn handle(&self) -> ServerHandle {
        self.core.handle()
    }

    /// Resolves once the listener is accepting connections.
    pub async fn serving_started(&self) {
        self.core.wait_started().await;
    }

    /// Accept and serve connections until shutdown.
    pub async fn serve_forever(&self) -> Result<()> {
        self.core.begin_serving("TCP")?;
        let listener = match bind_listener(self.addr, self.allow_reuse_address, self.backlog) {
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
        info!(addr = %self.addr, "Server(TCP) listening");

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
        info!("Server(TCP) graceful shutdown");
        Ok(())
    }

    /// Stop serving, close every live connection, release the listener.
    pub async fn shutdown(&self) {
        self.core.shutdown().await;
    }
}
