//! Modbus server on a Unix domain socket, speaking MBAP framing.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::error::Result;
use crate::server::handler::run_stream_handler;
use crate::server::{ServerConfig, ServerCore, ServerHandle};
use crate::store::ServerContext;

pub struct UnixServer {
    core: ServerCore,
    path: PathBuf,
}

impl UnixServer {
    pub fn new(context: Arc<ServerContext>, path: impl Into<PathBuf>, config: ServerConfig) -> Self {
        Self {
            core: ServerCore::new(context, config, false),
            path: path.into(),
        }
    }

    pub fn handle(&self) -> ServerHandle {
        self.core.handle()
    }

    pub async fn serving_started(&self) {
        self.core.wait_started().await;
    }

    /// Accept and serve connections until shutdown.
    pub async fn serve_forever(&self) -> Result<()> {
        self.core.begin_serving("Unix")?;
        // a previous unclean shutdown may have left the socket file behind
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
        let listener = match UnixListener::bind(&self.path) {
            Ok(listener) => listener,
            Err(err) => {
                self.core.mark_done();
                return Err(err.into());
            }
        };
        self.core.mark_started();
        info!(path = %self.path.display(), "Server(Unix) listening");

        // unix peers are usually unnamed; key them by accept order
        let peer_seq = AtomicU64::new(0);
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.core.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let peer = format!("unix#{}", peer_seq.fetch_add(1, Ordering::Relaxed));
                        tasks.spawn(run_stream_handler(
                            stream,
                            peer,
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
        let _ = std::fs::remove_file(&self.path);
        self.core.mark_done();
        info!("Server(Unix) graceful shutdown");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.core.shutdown().await;
    }
}
