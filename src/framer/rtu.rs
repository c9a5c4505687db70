//! RTU framer for binary serial lines.
//!
//! Frames carry no length field; the expected length is inferred from the
//! function code. A CRC mismatch drops a single leading byte and rescans,
//! so a corrupted frame never takes a following good frame down with it.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tracing::debug;

use crate::pdu::{FrameHint, Request, Response, ServerDecoder};

/// CRC16 as used by Modbus RTU: polynomial 0xA001 (reflected 0x8005),
/// initial value 0xFFFF, transmitted little-endian.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0xFFFFu16;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

#[derive(Debug)]
pub struct RtuFramer {
    decoder: Arc<ServerDecoder>,
    buffer: BytesMut,
}

impl RtuFramer {
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
        // shortest possible frame: slave id, function code, CRC
        while self.buffer.len() >= 4 {
            let frame_len = match self.decoder.rtu_frame_length(&self.buffer) {
                FrameHint::Length(len) => len,
                FrameHint::NeedMore => return,
                FrameHint::Unknown => {
                    // not a frame start we recognize; resync one byte at a time
                    self.buffer.advance(1);
                    continue;
                }
            };
            if self.buffer.len() < frame_len {
                return;
            }

            let frame = &self.buffer[..frame_len];
            let received = u16::from_le_bytes([frame[frame_len - 2], frame[frame_len - 1]]);
            if crc16(&frame[..frame_len - 2]) != received {
                debug!(
                    expected = crc16(&frame[..frame_len - 2]),
                    received, "CRC mismatch, resyncing"
                );
                self.buffer.advance(1);
                continue;
            }

            let slave_id = frame[0];
            let pdu = self.decoder.decode(&frame[1..frame_len - 2]);
            if super::accepts_slave(slave_id, slaves, single) {
                on_request(Request {
                    transaction_id: 0,
                    slave_id,
                    pdu,
                });
            }
            self.buffer.advance(frame_len);
        }
    }

    pub fn build_packet(&self, response: &Response) -> Vec<u8> {
        let pdu = response.pdu.encode();
        let mut packet = Vec::with_capacity(pdu.len() + 3);
        packet.push(response.slave_id);
        packet.extend_from_slice(&pdu);
        let crc = crc16(&packet);
        packet.extend_from_slice(&crc.to_le_bytes());
        packet
    }

    pub fn reset_frame(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{FunctionCode, RequestPdu, ResponsePdu};

    fn request_frame(slave_id: u8, pdu: &[u8]) -> Vec<u8> {
        let mut frame = vec![slave_id];
        frame.extend_from_slice(pdu);
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    fn collect(framer: &mut RtuFramer, data: &[u8]) -> Vec<Request> {
        let mut requests = Vec::new();
        framer.process_incoming(data, &[1], false, &mut |req| requests.push(req));
        requests
    }

    #[test]
    fn test_crc16_known_value() {
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x01, 0x00, 0x02]), 0x95C4);
    }

    #[test]
    fn test_single_frame() {
        let mut framer = RtuFramer::new(Arc::new(ServerDecoder::new()));
        let frame = request_frame(1, &[0x03, 0x00, 0x01, 0x00, 0x02]);

        let requests = collect(&mut framer, &frame);
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
    fn test_byte_at_a_time_arrival() {
        let mut framer = RtuFramer::new(Arc::new(ServerDecoder::new()));
        let frame = request_frame(1, &[0x01, 0x00, 0x00, 0x00, 0x08]);

        let mut requests = Vec::new();
        for &byte in &frame {
            framer.process_incoming(&[byte], &[1], false, &mut |req| requests.push(req));
        }
        assert_eq!(requests.len(), 1);
    }

    #[test]
    fn test_resync_after_bad_crc() {
        let mut framer = RtuFramer::new(Arc::new(ServerDecoder::new()));
        let good = request_frame(1, &[0x03, 0x00, 0x01, 0x00, 0x02]);
        let mut bad = good.clone();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;

        let mut data = good.clone();
        data.extend_from_slice(&bad);
        data.extend_from_slice(&good);

        let requests = collect(&mut framer, &data);
        assert_eq!(requests.len(), 2);
        // resync consumed the corrupted frame completely
        assert!(collect(&mut framer, &[]).is_empty());
    }

    #[test]
    fn test_garbage_prefix_resync() {
        let mut framer = RtuFramer::new(Arc::new(ServerDecoder::new()));
        let mut data = vec![0xDE, 0xAD, 0xBE];
        data.extend_from_slice(&request_frame(1, &[0x03, 0x00, 0x01, 0x00, 0x02]));

        let requests = collect(&mut framer, &data);
        assert_eq!(requests.len(), 1);
    }

    #[test]
    fn test_foreign_slave_consumed_silently() {
        let mut framer = RtuFramer::new(Arc::new(ServerDecoder::new()));
        let mut data = request_frame(9, &[0x03, 0x00, 0x01, 0x00, 0x02]);
        data.extend_from_slice(&request_frame(1, &[0x03, 0x00, 0x01, 0x00, 0x02]));

        let requests = collect(&mut framer, &data);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].slave_id, 1);
    }

    #[test]
    fn test_build_packet_crc_closure() {
        let framer = RtuFramer::new(Arc::new(ServerDecoder::new()));
        let packet = framer.build_packet(&Response {
            transaction_id: 0,
            slave_id: 1,
            pdu: ResponsePdu::Registers {
                function: FunctionCode::ReadHoldingRegisters,
                values: vec![0x1234],
            },
            should_respond: true,
        });

        let body_len = packet.len() - 2;
        let crc = u16::from_le_bytes([packet[body_len], packet[body_len + 1]]);
        assert_eq!(crc16(&packet[..body_len]), crc);

        // any single-bit flip invalidates the CRC
        let mut corrupted = packet.clone();
        corrupted[1] ^= 0x01;
        assert_ne!(crc16(&corrupted[..body_len]), crc);
    }
}
