//! Framer for Modbus Security (TLS) connections.
//!
//! TLS records already delimit messages, so the PDU travels bare: no MBAP
//! header, no CRC. Each delivered chunk is taken as exactly one PDU. The
//! transaction and unit ids do not exist in this framing and are fixed
//! at 0.

use std::sync::Arc;

use crate::pdu::{Request, Response, ServerDecoder};

#[derive(Debug)]
pub struct TlsFramer {
    decoder: Arc<ServerDecoder>,
}

impl TlsFramer {
    pub fn new(decoder: Arc<ServerDecoder>) -> Self {
        Self { decoder }
    }

    pub fn process_incoming(
        &mut self,
        data: &[u8],
        slaves: &[u8],
        single: bool,
        on_request: &mut dyn FnMut(Request),
    ) {
        if data.is_empty() {
            return;
        }
        let pdu = self.decoder.decode(data);
        if super::accepts_slave(0, slaves, single) {
            on_request(Request {
                transaction_id: 0,
                slave_id: 0,
                pdu,
            });
        }
    }

    pub fn build_packet(&self, response: &Response) -> Vec<u8> {
        response.pdu.encode()
    }

    /// Nothing is buffered; records are self-delimiting.
    pub fn reset_frame(&mut self) {}
}
