//! Per-connection request handling.
//!
//! A handler task owns its framer and its transport handle; it pumps
//! received chunks through the framer, executes each decoded request
//! against the datastore and writes the framed responses back in arrival
//! order. All per-request failures become Modbus exception responses here
//! and never escape the task.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::ModbusError;
use crate::framer::Framer;
use crate::pdu::{execute, ExceptionCode, ExecuteEnv, Request, RequestPdu, Response, ResponsePdu};

use super::{lock_connections, ConnectionMap, ServerState};

const READ_CHUNK_SIZE: usize = 2048;

/// Dispatch one decoded request, returning the bytes to put on the wire
/// (`None` for broadcast, ignored slaves and suppressed responses).
pub(crate) fn dispatch(
    state: &ServerState,
    framer: &Framer,
    request: Request,
    peer: Option<SocketAddr>,
) -> Option<Vec<u8>> {
    if let Some(tracer) = &state.request_tracer {
        tracer(&request, peer);
    }

    let env = ExecuteEnv {
        decoder: &state.decoder,
        identity: &state.identity,
    };

    if state.broadcast_enable && request.slave_id == 0 {
        // execute on every slave context; responses are never emitted
        if state.context.is_single() {
            let _ = state
                .context
                .with_slave(0, |slave| execute(&request.pdu, 0, slave, &env));
        } else {
            for slave_id in state.context.slaves() {
                let _ = state
                    .context
                    .with_slave(slave_id, |slave| execute(&request.pdu, slave_id, slave, &env));
            }
        }
        return None;
    }

    let pdu = match state
        .context
        .with_slave(request.slave_id, |slave| {
            execute(&request.pdu, request.slave_id, slave, &env)
        }) {
        Ok(pdu) => pdu,
        Err(ModbusError::NoSuchSlave(slave_id)) => {
            error!(slave_id, "requested slave does not exist");
            if state.ignore_missing_slaves {
                // the client will simply time out waiting for a response
                return None;
            }
            ResponsePdu::exception(request.pdu.function_code(), ExceptionCode::GatewayNoResponse)
        }
        Err(err) => {
            error!(%err, "datastore unable to fulfill request");
            ResponsePdu::exception(request.pdu.function_code(), ExceptionCode::SlaveFailure)
        }
    };

    // silent function codes execute but never answer; only custom
    // registrations can opt in to that, every built-in responds
    let should_respond = match &request.pdu {
        RequestPdu::Custom { function, .. } => state
            .decoder
            .custom(*function)
            .map_or(true, |handler| handler.should_respond()),
        _ => true,
    };
    let response = Response {
        transaction_id: request.transaction_id,
        slave_id: request.slave_id,
        pdu,
        should_respond,
    };
    // suppression happens before the manipulator ever sees the response
    if !response.should_respond {
        debug!("skipping response");
        return None;
    }

    match &state.response_manipulator {
        Some(manipulator) => {
            let (response, skip_encoding) = manipulator(response);
            if skip_encoding {
                Some(response.pdu.encode())
            } else {
                Some(framer.build_packet(&response))
            }
        }
        None => Some(framer.build_packet(&response)),
    }
}

/// Strip a locally echoed transmission from an incoming chunk.
///
/// Returns the bytes that remain after removing the echo of `sent`.
/// A chunk that is only a prefix of the pending echo consumes that much
/// of it and yields nothing; bytes that match nothing clear the pending
/// echo and pass through untouched.
pub(crate) fn strip_local_echo(sent: &mut Vec<u8>, data: &[u8]) -> Vec<u8> {
    if sent.is_empty() {
        return data.to_vec();
    }
    if let Some(pos) = find_subslice(data, sent) {
        let mut remaining = data[..pos].to_vec();
        remaining.extend_from_slice(&data[pos + sent.len()..]);
        sent.clear();
        remaining
    } else if sent.starts_with(data) {
        sent.drain(..data.len());
        Vec::new()
    } else {
        sent.clear();
        data.to_vec()
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Run one stream conversation until the peer disconnects, an error
/// forces the socket closed, or the server shuts the connection down.
///
/// The task registers itself in `connections` on entry and deregisters on
/// every exit path.
pub(crate) async fn run_stream_handler<S>(
    mut stream: S,
    peer: String,
    state: Arc<ServerState>,
    connections: ConnectionMap,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!(%peer, "peer opened");
    lock_connections(&connections).insert(peer.clone(), cancel.clone());

    let mut framer = state.framer_kind.make_framer(state.decoder.clone());
    let mut sent: Vec<u8> = Vec::new();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(%peer, "handler canceled");
                break;
            }
            read = stream.read(&mut buf) => read,
        };
        let data = match read {
            Ok(0) => {
                debug!(%peer, "peer closed connection");
                break;
            }
            Ok(n) => &buf[..n],
            Err(err) => {
                error!(%peer, %err, "read failed, closing connection");
                break;
            }
        };

        let data = if state.handle_local_echo {
            let stripped = strip_local_echo(&mut sent, data);
            if stripped.is_empty() {
                continue;
            }
            stripped
        } else {
            data.to_vec()
        };
        debug!(%peer, data = %hex::encode(&data), "handling data");

        let slaves = state.allowed_slaves();
        let single = state.context.is_single();
        let mut requests = Vec::new();
        framer.process_incoming(&data, &slaves, single, &mut |request| requests.push(request));

        let mut closed = false;
        for request in requests {
            if let Some(packet) = dispatch(&state, &framer, request, None) {
                debug!(%peer, packet = %hex::encode(&packet), "send");
                if let Err(err) = stream.write_all(&packet).await {
                    error!(%peer, %err, "write failed, closing connection");
                    closed = true;
                    break;
                }
                if state.handle_local_echo {
                    sent = packet;
                }
            }
        }
        if closed {
            break;
        }
    }

    lock_connections(&connections).remove(&peer);
    debug!(%peer, "peer closed");
}
