//! MBAP (socket) framer, used by the TCP, UDP and Unix transports.
//!
//! Header layout: transaction id (u16 BE), protocol id (u16 BE, must be
//! 0), length (u16 BE, unit id plus PDU), unit id (u8).

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tracing::debug;

use crate::pdu::{Request, Response, ServerDecoder, MAX_PDU_SIZE};

const MBAP_HEADER_SIZE: usize = 7;

#[derive(Debug)]
pub struct SocketFramer {
    decoder: Arc<ServerDecoder>,
    buffer: BytesMut,
}

impl SocketFramer {
    pub fn new(decoder: Arc<ServerDecoder>) -> Self {
        Self {
            decoder,
            buffer: BytesMut::new(),
        }
    }

    pub fn process_incoming(
        &mut self,
        data: &[u8],
        slaves: &[u8],
        single: bool,
        on_request: &mut dyn FnMut(Request),
    ) {
        self.buffer.extend_from_slice(data);
        // a full header plus at least the function code byte
        while self.buffer.len() >= MBAP_HEADER_SIZE + 1 {
            let transaction_id = u16::from_be_bytes([self.buffer[0], self.buffer[1]]);
            let protocol_id = u16::from_be_bytes([self.buffer[2], self.buffer[3]]);
            let length = u16::from_be_bytes([self.buffer[4], self.buffer[5]]) as usize;
            let unit_id = self.buffer[6];

            if protocol_id != 0 || length < 2 || length > MAX_PDU_SIZE + 1 {
                debug!(protocol_id, length, "bad MBAP header, dropping buffer");
                self.reset_frame();
                return;
            }
            let frame_len = MBAP_HEADER_SIZE + length - 1;
            if self.buffer.len() < frame_len {
                return;
            }

            let pdu = self.decoder.decode(&self.buffer[MBAP_HEADER_SIZE..frame_len]);
            if super::accepts_slave(unit_id, slaves, single) {
                on_request(Request {
                    transaction_id,
                    slave_id: unit_id,
                    pdu,
                });
            }
            self.buffer.advance(frame_len);
        }
    }

    pub fn build_packet(&self, response: &Response) -> Vec<u8> {
        let pdu = response.pdu.encode();
        let mut packet = Vec::with_capacity(MBAP_HEADER_SIZE + pdu.len());
        packet.extend_from_slice(&response.transaction_id.to_be_bytes());
        packet.extend_from_slice(&0u16.to_be_bytes());
        packet.extend_from_slice(&(pdu.len() as u16 + 1).to_be_bytes());
        packet.push(response.slave_id);
        packet.extend_from_slice(&pdu);
        packet
    }

    pub fn reset_frame(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{ExceptionCode, FunctionCode, RequestPdu, ResponsePdu};

    fn collect(framer: &mut SocketFramer, data: &[u8]) -> Vec<Request> {
        let mut requests = Vec::new();
        framer.process_incoming(data, &[1], false, &mut |req| requests.push(req));
        requests
    }

    #[test]
    fn test_single_frame() {
        let mut framer = SocketFramer::new(Arc::new(ServerDecoder::new()));
        let requests = collect(
            &mut framer,
            &[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x01, 0x00, 0x01, 0x00, 0x01],
        );
        assert_eq!(
            requests,
            vec![Request {
                transaction_id: 1,
                slave_id: 1,
                pdu: RequestPdu::ReadCoils { address: 1, count: 1 },
            }]
        );
    }

    #[test]
    fn test_split_arrival() {
        let mut framer = SocketFramer::new(Arc::new(ServerDecoder::new()));
        let frame = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x02];

        assert!(collect(&mut framer, &frame[..9]).is_empty());
        let requests = collect(&mut framer, &frame[9..]);
        assert_eq!(requests.len(), 1);
    }

    #[test]
    fn test_two_frames_one_chunk() {
        let mut framer = SocketFramer::new(Arc::new(ServerDecoder::new()));
        let mut data = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x01, 0x00, 0x00, 0x00, 0x01];
        data.extend_from_slice(&[0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x02, 0x00, 0x00, 0x00, 0x01]);

        let requests = collect(&mut framer, &data);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].transaction_id, 1);
        assert_eq!(requests[1].transaction_id, 2);
    }

    #[test]
    fn test_bad_protocol_id_resets() {
        let mut framer = SocketFramer::new(Arc::new(ServerDecoder::new()));
        let requests = collect(
            &mut framer,
            &[0x00, 0x01, 0x00, 0x07, 0x00, 0x06, 0x01, 0x01, 0x00, 0x00, 0x00, 0x01],
        );
        assert!(requests.is_empty());

        // the framer recovers for the next clean frame
        let requests = collect(
            &mut framer,
            &[0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x01, 0x00, 0x00, 0x00, 0x01],
        );
        assert_eq!(requests.len(), 1);
    }

    #[test]
    fn test_foreign_slave_discarded() {
        let mut framer = SocketFramer::new(Arc::new(ServerDecoder::new()));
        let requests = collect(
            &mut framer,
            &[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x09, 0x01, 0x00, 0x00, 0x00, 0x01],
        );
        assert!(requests.is_empty());
    }

    #[test]
    fn test_unknown_function_decodes_invalid() {
        let mut framer = SocketFramer::new(Arc::new(ServerDecoder::new()));
        let requests = collect(
            &mut framer,
            &[0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x01, 0x63],
        );
        assert_eq!(
            requests[0].pdu,
            RequestPdu::Invalid {
                function: 0x63,
                exception: ExceptionCode::IllegalFunction
            }
        );
    }

    #[test]
    fn test_build_packet_round_trip() {
        let framer = SocketFramer::new(Arc::new(ServerDecoder::new()));
        let packet = framer.build_packet(&Response {
            transaction_id: 1,
            slave_id: 1,
            pdu: ResponsePdu::Bits {
                function: FunctionCode::ReadCoils,
                values: vec![true],
            },
            should_respond: true,
        });
        assert_eq!(
            packet,
            vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x04, 0x01, 0x01, 0x01, 0x01]
        );
    }
}
