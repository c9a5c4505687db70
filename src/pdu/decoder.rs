//! Server-side request decoding.
//!
//! [`ServerDecoder`] holds the function-code registry: the built-in
//! decoders plus any custom functions registered before server start.
//! Decoding never fails; frames that cannot be decoded yield
//! [`RequestPdu::Invalid`], which executes straight to the matching
//! exception response.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::pdu::{unpack_bits, ExceptionCode, FileRecord, RequestPdu};
use crate::store::SlaveContext;

/// A user-registered function code.
///
/// Registration happens on the [`ServerDecoder`] before the server is
/// started; the running server takes a snapshot and the registry is
/// effectively read-only afterwards.
pub trait CustomFunction: Send + Sync {
    /// The function code this handler serves.
    fn function_code(&self) -> u8;

    /// Execute the request payload against a slave context and return the
    /// response payload (the bytes following the function code).
    fn execute(&self, data: &[u8], context: &mut SlaveContext) -> Result<Vec<u8>>;

    /// Whether responses for this function reach the wire. Silent write
    /// acks return false; the request still executes, but nothing is
    /// sent back, exceptions included.
    fn should_respond(&self) -> bool {
        true
    }

    /// Expected PDU length (function code byte included) given a prefix of
    /// the PDU, for RTU length inference. `None` means undeterminable, in
    /// which case the RTU framer falls back to byte-wise resync.
    fn rtu_pdu_length(&self, prefix: &[u8]) -> Option<usize> {
        let _ = prefix;
        None
    }
}

/// RTU length inference result for a buffered frame prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameHint {
    /// Full frame length in bytes, slave id and CRC included
    Length(usize),
    /// More bytes are needed before the length is known
    NeedMore,
    /// The function code is unknown; the frame cannot be sized
    Unknown,
}

/// Function-code registry mapping wire bytes to [`RequestPdu`] values.
#[derive(Clone, Default)]
pub struct ServerDecoder {
    custom: HashMap<u8, Arc<dyn CustomFunction>>,
}

impl ServerDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom function code. Replaces any earlier registration
    /// for the same code; built-in codes cannot be overridden.
    pub fn register(&mut self, function: Arc<dyn CustomFunction>) {
        self.custom.insert(function.function_code(), function);
    }

    /// Look up a registered custom function.
    pub fn custom(&self, code: u8) -> Option<&Arc<dyn CustomFunction>> {
        self.custom.get(&code)
    }

    /// Decode a PDU (function code byte plus data).
    pub fn decode(&self, pdu: &[u8]) -> RequestPdu {
        let Some((&function, data)) = pdu.split_first() else {
            return RequestPdu::Invalid {
                function: 0,
                exception: ExceptionCode::IllegalDataValue,
            };
        };
        match decode_builtin(function, data) {
            Some(Ok(decoded)) => decoded,
            Some(Err(exception)) => RequestPdu::Invalid { function, exception },
            None => {
                if self.custom.contains_key(&function) {
                    RequestPdu::Custom {
                        function,
                        data: data.to_vec(),
                    }
                } else {
                    RequestPdu::Invalid {
                        function,
                        exception: ExceptionCode::IllegalFunction,
                    }
                }
            }
        }
    }

    /// Infer the full RTU frame length from a buffered prefix.
    ///
    /// `frame` starts at the slave id byte; the returned length includes
    /// slave id and trailing CRC. Fixed-size functions resolve from the
    /// function code alone, the rest embed a byte-count field at a known
    /// offset.
    pub fn rtu_frame_length(&self, frame: &[u8]) -> FrameHint {
        if frame.len() < 2 {
            return FrameHint::NeedMore;
        }
        let function = frame[1];
        match function {
            0x01..=0x06 | 0x08 => FrameHint::Length(8),
            0x07 | 0x11 => FrameHint::Length(4),
            0x0F | 0x10 => match frame.get(6) {
                Some(&byte_count) => FrameHint::Length(9 + byte_count as usize),
                None => FrameHint::NeedMore,
            },
            0x14 | 0x15 => match frame.get(2) {
                Some(&byte_count) => FrameHint::Length(5 + byte_count as usize),
                None => FrameHint::NeedMore,
            },
            0x16 => FrameHint::Length(10),
            0x17 => match frame.get(10) {
                Some(&byte_count) => FrameHint::Length(13 + byte_count as usize),
                None => FrameHint::NeedMore,
            },
            0x18 => FrameHint::Length(6),
            0x2B => FrameHint::Length(7),
            other => match self.custom.get(&other) {
                Some(handler) => match handler.rtu_pdu_length(&frame[1..]) {
                    Some(pdu_len) => FrameHint::Length(pdu_len + 3),
                    None => FrameHint::Unknown,
                },
                None => FrameHint::Unknown,
            },
        }
    }
}

impl std::fmt::Debug for ServerDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut codes: Vec<u8> = self.custom.keys().copied().collect();
        codes.sort_unstable();
        f.debug_struct("ServerDecoder")
            .field("custom", &codes)
            .finish()
    }
}

type DecodeResult = std::result::Result<RequestPdu, ExceptionCode>;

/// Decode a built-in function code. `None` means the code has no built-in
/// decoder and must be resolved through the custom registry.
fn decode_builtin(function: u8, data: &[u8]) -> Option<DecodeResult> {
    let decoded = match function {
        0x01 => two_words(data).map(|(address, count)| RequestPdu::ReadCoils { address, count }),
        0x02 => two_words(data)
            .map(|(address, count)| RequestPdu::ReadDiscreteInputs { address, count }),
        0x03 => two_words(data)
            .map(|(address, count)| RequestPdu::ReadHoldingRegisters { address, count }),
        0x04 => two_words(data)
            .map(|(address, count)| RequestPdu::ReadInputRegisters { address, count }),
        0x05 => {
            two_words(data).map(|(address, value)| RequestPdu::WriteSingleCoil { address, value })
        }
        0x06 => two_words(data)
            .map(|(address, value)| RequestPdu::WriteSingleRegister { address, value }),
        0x07 => expect_empty(data).map(|_| RequestPdu::ReadExceptionStatus),
        0x08 => {
            if data.len() < 2 {
                Err(ExceptionCode::IllegalDataValue)
            } else {
                Ok(RequestPdu::Diagnostics {
                    sub_function: be_u16(&data[0..2]),
                    data: data[2..].to_vec(),
                })
            }
        }
        0x0F => decode_write_multiple_coils(data),
        0x10 => decode_write_multiple_registers(data),
        0x11 => expect_empty(data).map(|_| RequestPdu::ReportSlaveId),
        0x14 => decode_read_file_record(data),
        0x15 => decode_write_file_record(data),
        0x16 => {
            if data.len() != 6 {
                Err(ExceptionCode::IllegalDataValue)
            } else {
                Ok(RequestPdu::MaskWriteRegister {
                    address: be_u16(&data[0..2]),
                    and_mask: be_u16(&data[2..4]),
                    or_mask: be_u16(&data[4..6]),
                })
            }
        }
        0x17 => decode_read_write_multiple(data),
        0x18 => {
            if data.len() != 2 {
                Err(ExceptionCode::IllegalDataValue)
            } else {
                Ok(RequestPdu::ReadFifoQueue {
                    address: be_u16(&data[0..2]),
                })
            }
        }
        0x2B => {
            if data.len() != 3 {
                Err(ExceptionCode::IllegalDataValue)
            } else if data[0] != 0x0E {
                // only the device-identification MEI type is served
                Err(ExceptionCode::IllegalFunction)
            } else {
                Ok(RequestPdu::ReadDeviceIdentification {
                    read_code: data[1],
                    object_id: data[2],
                })
            }
        }
        _ => return None,
    };
    Some(decoded)
}

fn be_u16(data: &[u8]) -> u16 {
    u16::from_be_bytes([data[0], data[1]])
}

fn two_words(data: &[u8]) -> std::result::Result<(u16, u16), ExceptionCode> {
    if data.len() != 4 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok((be_u16(&data[0..2]), be_u16(&data[2..4])))
}

fn expect_empty(data: &[u8]) -> std::result::Result<(), ExceptionCode> {
    if data.is_empty() {
        Ok(())
    } else {
        Err(ExceptionCode::IllegalDataValue)
    }
}

fn decode_write_multiple_coils(data: &[u8]) -> DecodeResult {
    if data.len() < 5 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    let address = be_u16(&data[0..2]);
    let count = be_u16(&data[2..4]);
    let byte_count = data[4] as usize;
    if data.len() != 5 + byte_count || byte_count != (count as usize).div_ceil(8) {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok(RequestPdu::WriteMultipleCoils {
        address,
        count,
        values: unpack_bits(&data[5..], count),
    })
}

fn decode_write_multiple_registers(data: &[u8]) -> DecodeResult {
    if data.len() < 5 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    let address = be_u16(&data[0..2]);
    let count = be_u16(&data[2..4]);
    let byte_count = data[4] as usize;
    if data.len() != 5 + byte_count || byte_count != count as usize * 2 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    let values = data[5..].chunks_exact(2).map(be_u16).collect();
    Ok(RequestPdu::WriteMultipleRegisters { address, values })
}

fn decode_read_file_record(data: &[u8]) -> DecodeResult {
    let Some((&byte_count, body)) = data.split_first() else {
        return Err(ExceptionCode::IllegalDataValue);
    };
    if body.len() != byte_count as usize || byte_count % 7 != 0 || byte_count == 0 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    let mut records = Vec::new();
    for chunk in body.chunks_exact(7) {
        if chunk[0] != 0x06 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        records.push(FileRecord {
            file_number: be_u16(&chunk[1..3]),
            record_number: be_u16(&chunk[3..5]),
            record_length: be_u16(&chunk[5..7]),
            values: Vec::new(),
        });
    }
    Ok(RequestPdu::ReadFileRecord { records })
}

fn decode_write_file_record(data: &[u8]) -> DecodeResult {
    let Some((&byte_count, mut body)) = data.split_first() else {
        return Err(ExceptionCode::IllegalDataValue);
    };
    if body.len() != byte_count as usize || byte_count == 0 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    let mut records = Vec::new();
    while !body.is_empty() {
        if body.len() < 7 || body[0] != 0x06 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let record_length = be_u16(&body[5..7]) as usize;
        let end = 7 + record_length * 2;
        if body.len() < end {
            return Err(ExceptionCode::IllegalDataValue);
        }
        records.push(FileRecord {
            file_number: be_u16(&body[1..3]),
            record_number: be_u16(&body[3..5]),
            record_length: record_length as u16,
            values: body[7..end].chunks_exact(2).map(be_u16).collect(),
        });
        body = &body[end..];
    }
    Ok(RequestPdu::WriteFileRecord { records })
}

fn decode_read_write_multiple(data: &[u8]) -> DecodeResult {
    if data.len() < 9 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    let read_address = be_u16(&data[0..2]);
    let read_count = be_u16(&data[2..4]);
    let write_address = be_u16(&data[4..6]);
    let write_count = be_u16(&data[6..8]);
    let byte_count = data[8] as usize;
    if data.len() != 9 + byte_count || byte_count != write_count as usize * 2 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    let values = data[9..].chunks_exact(2).map(be_u16).collect();
    Ok(RequestPdu::ReadWriteMultipleRegisters {
        read_address,
        read_count,
        write_address,
        values,
    })
}
