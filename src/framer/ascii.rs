//! ASCII framer for serial lines.
//!
//! Frames are `':' hex(slave_id | pdu | lrc) CR LF`. The LRC is the
//! two's complement of the 8-bit sum of the binary payload. Anything
//! before a start colon is noise and gets dropped; frames with a bad LRC
//! or bad hex are discarded through their terminator without a reply.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tracing::debug;

use crate::pdu::{Request, Response, ServerDecoder};

const FRAME_START: u8 = b':';
const FRAME_END: &[u8] = b"\r\n";

/// Longitudinal redundancy check over the binary payload.
pub fn lrc(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, &byte| acc.wrapping_add(byte));
    sum.wrapping_neg()
}

#[derive(Debug)]
pub struct AsciiFramer {
    decoder: Arc<ServerDecoder>,
    buffer: BytesMut,
}

impl AsciiFramer {
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
        loop {
            // drop noise ahead of the start marker
            match self.buffer.iter().position(|&b| b == FRAME_START) {
                Some(start) => self.buffer.advance(start),
                None => {
                    self.buffer.clear();
                    return;
                }
            }
            let Some(end) = find_terminator(&self.buffer) else {
                return;
            };

            let frame = &self.buffer[1..end];
            if let Some((slave_id, pdu_bytes)) = decode_ascii_payload(frame) {
                let pdu = self.decoder.decode(&pdu_bytes);
                if super::accepts_slave(slave_id, slaves, single) {
                    on_request(Request {
                        transaction_id: 0,
                        slave_id,
                        pdu,
                    });
                }
            } else {
                debug!("discarding ASCII frame with bad hex or LRC");
            }
            self.buffer.advance(end + FRAME_END.len());
        }
    }

    pub fn build_packet(&self, response: &Response) -> Vec<u8> {
        let mut payload = vec![response.slave_id];
        payload.extend_from_slice(&response.pdu.encode());
        payload.push(lrc(&payload));

        let mut packet = Vec::with_capacity(payload.len() * 2 + 3);
        packet.push(FRAME_START);
        packet.extend_from_slice(hex::encode_upper(&payload).as_bytes());
        packet.extend_from_slice(FRAME_END);
        packet
    }

    pub fn reset_frame(&mut self) {
        self.buffer.clear();
    }
}

fn find_terminator(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(FRAME_END.len())
        .position(|window| window == FRAME_END)
}

/// Hex-decode a frame body and verify its trailing LRC. Returns the slave
/// id and the PDU bytes.
fn decode_ascii_payload(frame: &[u8]) -> Option<(u8, Vec<u8>)> {
    if frame.len() < 4 || frame.len() % 2 != 0 {
        return None;
    }
    let text = std::str::from_utf8(frame).ok()?;
    let payload = hex::decode(text).ok()?;

    let (received, body) = payload.split_last()?;
    if lrc(body) != *received {
        return None;
    }
    let (&slave_id, pdu) = body.split_first()?;
    Some((slave_id, pdu.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{FunctionCode, RequestPdu, ResponsePdu};

    fn request_frame(slave_id: u8, pdu: &[u8]) -> Vec<u8> {
        let mut payload = vec![slave_id];
        payload.extend_from_slice(pdu);
        payload.push(lrc(&payload));

        let mut frame = vec![FRAME_START];
        frame.extend_from_slice(hex::encode_upper(&payload).as_bytes());
        frame.extend_from_slice(FRAME_END);
        frame
    }

    fn collect(framer: &mut AsciiFramer, data: &[u8]) -> Vec<Request> {
        let mut requests = Vec::new();
        framer.process_incoming(data, &[1], false, &mut |req| requests.push(req));
        requests
    }

    #[test]
    fn test_lrc_closure() {
        let payload = [0x01u8, 0x03, 0x00, 0x01, 0x00, 0x02];
        let check = lrc(&payload);
        let sum = payload
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_add(b))
            .wrapping_add(check);
        assert_eq!(sum, 0);
    }

    #[test]
    fn test_single_frame() {
        let mut framer = AsciiFramer::new(Arc::new(ServerDecoder::new()));
        let requests = collect(&mut framer, &request_frame(1, &[0x03, 0x00, 0x01, 0x00, 0x02]));
        assert_eq!(
            requests,
            vec![Request {
                transaction_id: 0,
                slave_id: 1,
                pdu: RequestPdu::ReadHoldingRegisters { address: 1, count: 2 },
            }]
        );
    }

    #[test]
    fn test_noise_before_start() {
        let mut framer = AsciiFramer::new(Arc::new(ServerDecoder::new()));
        let mut data = b"garbage".to_vec();
        data.extend_from_slice(&request_frame(1, &[0x01, 0x00, 0x00, 0x00, 0x01]));

        assert_eq!(collect(&mut framer, &data).len(), 1);
    }

    #[test]
    fn test_bad_lrc_discarded() {
        let mut framer = AsciiFramer::new(Arc::new(ServerDecoder::new()));
        let mut bad = request_frame(1, &[0x03, 0x00, 0x01, 0x00, 0x02]);
        // corrupt one hex digit of the address field
        bad[5] = if bad[5] == b'0' { b'1' } else { b'0' };

        let mut data = bad;
        data.extend_from_slice(&request_frame(1, &[0x01, 0x00, 0x00, 0x00, 0x01]));

        let requests = collect(&mut framer, &data);
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].pdu,
            RequestPdu::ReadCoils { address: 0, count: 1 }
        );
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut framer = AsciiFramer::new(Arc::new(ServerDecoder::new()));
        let frame = request_frame(1, &[0x01, 0x00, 0x00, 0x00, 0x01]);

        assert!(collect(&mut framer, &frame[..6]).is_empty());
        assert_eq!(collect(&mut framer, &frame[6..]).len(), 1);
    }

    #[test]
    fn test_build_packet() {
        let framer = AsciiFramer::new(Arc::new(ServerDecoder::new()));
        let packet = framer.build_packet(&Response {
            transaction_id: 0,
            slave_id: 1,
            pdu: ResponsePdu::WriteSingle {
                function: FunctionCode::WriteSingleRegister,
                address: 1,
                value: 3,
            },
            should_respond: true,
        });
        assert_eq!(packet, b":010600010003F5\r\n".to_vec());
    }
}
