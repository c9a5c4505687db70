//! Modbus UDP server.
//!
//! A single datagram endpoint acts as the one handler for every peer:
//! each received datagram carries its peer address, and responses go back
//! with `send_to`. Framing errors reset the accumulator instead of
//! tearing anything down.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tracing::{error, info};

use crate::error::Result;
use crate::server::handler::dispatch;
use crate::server::{ServerConfig, ServerCore, ServerHandle};
use crate::store::ServerContext;

const MAX_DATAGRAM_SIZE: usize = 2048;

/// A Modbus server on a UDP endpoint, speaking MBAP framing.
pub struct UdpServer {
    core: ServerCore,
    addr: SocketAddr,
    bound: Mutex<Option<SocketAddr>>,
}

impl UdpServer {
    pub fn new(context: Arc<ServerContext>, addr: SocketAddr, config: ServerConfig) -> Self {
        Self {
            core: ServerCore::new(context, config, false),
            addr,
            bound: Mutex::new(None),
        }
    }

    /// The bound address, available once serving has started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn handle(&self) -> ServerHandle {
        self.core.handle()
    }

    pub async fn serving_started(&self) {
        self.core.wait_started().await;
    }

    /// Serve datagrams until shutdown.
    pub async fn serve_forever(&self) -> Result<()> {
        self.core.begin_serving("UDP")?;
        let socket = match UdpSocket::bind(self.addr).await {
            Ok(socket) => socket,
            Err(err) => {
                self.core.mark_done();
                return Err(err.into());
            }
        };
        *self
            .bound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = socket.local_addr().ok();
        self.core.mark_started();
        info!(addr = %self.addr, "Server(UDP) listening");

        let state = &self.core.state;
        let mut framer = state.framer_kind.make_framer(state.decoder.clone());
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, peer) = tokio::select! {
                _ = self.core.cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(err) => {
                        // e.g. an ICMP error surfaced for an earlier send
                        error!(%err, "datagram receive error");
                        framer.reset_frame();
                        continue;
                    }
                },
            };

            let slaves = state.allowed_slaves();
            let single = state.context.is_single();
            let mut requests = Vec::new();
            framer.process_incoming(&buf[..len], &slaves, single, &mut |request| {
                requests.push(request)
            });
            for request in requests {
                if let Some(packet) = dispatch(state, &framer, request, Some(peer)) {
                    if let Err(err) = socket.send_to(&packet, peer).await {
                        error!(%peer, %err, "datagram send failed");
                    }
                }
            }
        }

        self.core.mark_done();
        info!("Server(UDP) graceful shutdown");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.core.shutdown().await;
    }
}
