//! Modbus Security (TLS) server.
//!
//! Serves the header-less TLS framing over TLS 1.2+ connections. The
//! certificate material is either a prebuilt rustls configuration or a
//! cert/key file pair; client certificates can be required, verified
//! against the server's own certificate chain.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig as RustlsServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use crate::error::{ModbusError, Result};
use crate::framer::FramerKind;
use crate::server::handler::run_stream_handler;
use crate::server::tcp::{bind_listener, DEFAULT_BACKLOG};
use crate::server::{ServerConfig, ServerCore, ServerHandle};
use crate::store::ServerContext;

/// TLS material for the listener.
#[derive(Clone)]
pub enum TlsIdentity {
    /// A fully configured rustls server context
    Context(Arc<RustlsServerConfig>),
    /// Build a context from PEM files
    CertKey {
        cert_path: PathBuf,
        key_path: PathBuf,
        /// Require and verify a client certificate against the server's
        /// own certificate chain
        require_client_cert: bool,
    },
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|err| ModbusError::ConfigError(format!("invalid certificate file: {err}")))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|err| ModbusError::ConfigError(format!("invalid key file: {err}")))?
        .ok_or_else(|| ModbusError::ConfigError("no private key found".to_string()))
}

impl TlsIdentity {
    fn acceptor(&self) -> Result<TlsAcceptor> {
        let config = match self {
            TlsIdentity::Context(config) => config.clone(),
            TlsIdentity::CertKey {
                cert_path,
                key_path,
                require_client_cert,
            } => {
                let certs = load_certs(cert_path)?;
                let key = load_key(key_path)?;
                let builder = RustlsServerConfig::builder();
                let config = if *require_client_cert {
                    let mut roots = RootCertStore::empty();
                    for cert in &certs {
                        roots
                            .add(cert.clone())
                            .map_err(|err| ModbusError::ConfigError(err.to_string()))?;
                    }
                    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                        .build()
                        .map_err(|err| ModbusError::ConfigError(err.to_string()))?;
                    builder
                        .with_client_cert_verifier(verifier)
                        .with_single_cert(certs, key)
                } else {
                    builder.with_no_client_auth().with_single_cert(certs, key)
                }
                .map_err(|err| ModbusError::ConfigError(err.to_string()))?;
                Arc::new(config)
            }
        };
        Ok(TlsAcceptor::from(config))
    }
}

/// A Modbus server on a TLS listener.
pub struct TlsServer {
    core: ServerCore,
    addr: SocketAddr,
    identity: TlsIdentity,
    allow_reuse_address: bool,
    backlog: u32,
    bound: Mutex<Option<SocketAddr>>,
}

impl TlsServer {
    /// Create a TLS server. The framing defaults to the header-less TLS
    /// framer when the common config still carries the socket framer.
    pub fn new(
        context: Arc<ServerContext>,
        addr: SocketAddr,
        identity: TlsIdentity,
        mut config: ServerConfig,
    ) -> Self {
        if config.framer == FramerKind::Socket {
            config.framer = FramerKind::Tls;
        }
        Self {
            core: ServerCore::new(context, config, false),
            addr,
            identity,
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

    /// Accept and serve TLS connections until shutdown.
    pub async fn serve_forever(&self) -> Result<()> {
        self.core.begin_serving("TLS")?;
        let setup = self
            .identity
            .acceptor()
            .and_then(|acceptor| {
                bind_listener(self.addr, self.allow_reuse_address, self.backlog)
                    .map(|listener| (acceptor, listener))
            });
        let (acceptor, listener) = match setup {
            Ok(ready) => ready,
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
        info!(addr = %self.addr, "Server(TLS) listening");

        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.core.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let acceptor = acceptor.clone();
                        let state = self.core.state.clone();
                        let connections = self.core.connections.clone();
                        let cancel = self.core.cancel.child_token();
                        // the handshake runs in the connection task so a
                        // slow client cannot stall the accept loop; it
                        // races the shutdown token because the peer is
                        // not registered for cancellation until the
                        // handler starts
                        tasks.spawn(async move {
                            let tls_stream = tokio::select! {
                                _ = cancel.cancelled() => {
                                    debug!(%peer, "shutdown during TLS handshake");
                                    return;
                                }
                                accepted = acceptor.accept(stream) => match accepted {
                                    Ok(tls_stream) => tls_stream,
                                    Err(err) => {
                                        debug!(%peer, %err, "TLS handshake failed");
                                        return;
                                    }
                                },
                            };
                            run_stream_handler(
                                tls_stream,
                                peer.to_string(),
                                state,
                                connections,
                                cancel,
                            )
                            .await;
                        });
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
        info!("Server(TLS) graceful shutdown");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.core.shutdown().await;
    }
}
