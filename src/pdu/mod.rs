//! Modbus PDU (Protocol Data Unit) model.
//!
//! Requests and responses are modeled as enums over the supported function
//! codes, with the addressing metadata (transaction id, slave id) carried
//! alongside in [`Request`] and [`Response`].

mod decoder;
mod execute;

pub use decoder::{CustomFunction, FrameHint, ServerDecoder};
pub use execute::{execute, ExecuteEnv};

use serde::{Deserialize, Serialize};

/// Largest PDU allowed on the wire (function code byte included).
pub const MAX_PDU_SIZE: usize = 253;

/// Quantity bounds per function code
pub const MAX_READ_BITS: u16 = 2000;
pub const MAX_READ_REGISTERS: u16 = 125;
pub const MAX_WRITE_BITS: u16 = 1968;
pub const MAX_WRITE_REGISTERS: u16 = 123;
pub const MAX_RW_WRITE_REGISTERS: u16 = 121;
pub const MAX_FIFO_COUNT: u16 = 31;

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FunctionCode {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
    WriteSingleRegister,
    ReadExceptionStatus,
    Diagnostics,
    WriteMultipleCoils,
    WriteMultipleRegisters,
    ReportSlaveId,
    ReadFileRecord,
    WriteFileRecord,
    MaskWriteRegister,
    ReadWriteMultipleRegisters,
    ReadFifoQueue,
    ReadDeviceIdentification,
    Custom(u8),
}

impl From<u8> for FunctionCode {
    fn from(code: u8) -> Self {
        match code {
            0x01 => FunctionCode::ReadCoils,
            0x02 => FunctionCode::ReadDiscreteInputs,
            0x03 => FunctionCode::ReadHoldingRegisters,
            0x04 => FunctionCode::ReadInputRegisters,
            0x05 => FunctionCode::WriteSingleCoil,
            0x06 => FunctionCode::WriteSingleRegister,
            0x07 => FunctionCode::ReadExceptionStatus,
            0x08 => FunctionCode::Diagnostics,
            0x0F => FunctionCode::WriteMultipleCoils,
            0x10 => FunctionCode::WriteMultipleRegisters,
            0x11 => FunctionCode::ReportSlaveId,
            0x14 => FunctionCode::ReadFileRecord,
            0x15 => FunctionCode::WriteFileRecord,
            0x16 => FunctionCode::MaskWriteRegister,
            0x17 => FunctionCode::ReadWriteMultipleRegisters,
            0x18 => FunctionCode::ReadFifoQueue,
            0x2B => FunctionCode::ReadDeviceIdentification,
            other => FunctionCode::Custom(other),
        }
    }
}

impl From<FunctionCode> for u8 {
    fn from(code: FunctionCode) -> Self {
        match code {
            FunctionCode::ReadCoils => 0x01,
            FunctionCode::ReadDiscreteInputs => 0x02,
            FunctionCode::ReadHoldingRegisters => 0x03,
            FunctionCode::ReadInputRegisters => 0x04,
            FunctionCode::WriteSingleCoil => 0x05,
            FunctionCode::WriteSingleRegister => 0x06,
            FunctionCode::ReadExceptionStatus => 0x07,
            FunctionCode::Diagnostics => 0x08,
            FunctionCode::WriteMultipleCoils => 0x0F,
            FunctionCode::WriteMultipleRegisters => 0x10,
            FunctionCode::ReportSlaveId => 0x11,
            FunctionCode::ReadFileRecord => 0x14,
            FunctionCode::WriteFileRecord => 0x15,
            FunctionCode::MaskWriteRegister => 0x16,
            FunctionCode::ReadWriteMultipleRegisters => 0x17,
            FunctionCode::ReadFifoQueue => 0x18,
            FunctionCode::ReadDeviceIdentification => 0x2B,
            FunctionCode::Custom(code) => code,
        }
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    SlaveFailure = 0x04,
    GatewayPathUnavailable = 0x0A,
    GatewayNoResponse = 0x0B,
}

impl From<ExceptionCode> for u8 {
    fn from(code: ExceptionCode) -> Self {
        code as u8
    }
}

/// One record reference of a file-record request (reference type 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub file_number: u16,
    pub record_number: u16,
    /// Record length in words for reads; ignored for writes where
    /// `values` carries the data
    pub record_length: u16,
    pub values: Vec<u16>,
}

/// Decoded request payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPdu {
    ReadCoils { address: u16, count: u16 },
    ReadDiscreteInputs { address: u16, count: u16 },
    ReadHoldingRegisters { address: u16, count: u16 },
    ReadInputRegisters { address: u16, count: u16 },
    /// `value` is the raw wire value; 0xFF00 means on, 0x0000 means off
    WriteSingleCoil { address: u16, value: u16 },
    WriteSingleRegister { address: u16, value: u16 },
    ReadExceptionStatus,
    Diagnostics { sub_function: u16, data: Vec<u8> },
    WriteMultipleCoils { address: u16, count: u16, values: Vec<bool> },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
    ReportSlaveId,
    ReadFileRecord { records: Vec<FileRecord> },
    WriteFileRecord { records: Vec<FileRecord> },
    MaskWriteRegister { address: u16, and_mask: u16, or_mask: u16 },
    ReadWriteMultipleRegisters {
        read_address: u16,
        read_count: u16,
        write_address: u16,
        values: Vec<u16>,
    },
    ReadFifoQueue { address: u16 },
    ReadDeviceIdentification { read_code: u8, object_id: u8 },
    /// Registered custom function code; payload handled by its handler
    Custom { function: u8, data: Vec<u8> },
    /// Undecodable frame in a length-delimited framing; executes straight
    /// to the carried exception
    Invalid { function: u8, exception: ExceptionCode },
}

impl RequestPdu {
    /// Function code of this request.
    pub fn function_code(&self) -> u8 {
        match self {
            RequestPdu::ReadCoils { .. } => 0x01,
            RequestPdu::ReadDiscreteInputs { .. } => 0x02,
            RequestPdu::ReadHoldingRegisters { .. } => 0x03,
            RequestPdu::ReadInputRegisters { .. } => 0x04,
            RequestPdu::WriteSingleCoil { .. } => 0x05,
            RequestPdu::WriteSingleRegister { .. } => 0x06,
            RequestPdu::ReadExceptionStatus => 0x07,
            RequestPdu::Diagnostics { .. } => 0x08,
            RequestPdu::WriteMultipleCoils { .. } => 0x0F,
            RequestPdu::WriteMultipleRegisters { .. } => 0x10,
            RequestPdu::ReportSlaveId => 0x11,
            RequestPdu::ReadFileRecord { .. } => 0x14,
            RequestPdu::WriteFileRecord { .. } => 0x15,
            RequestPdu::MaskWriteRegister { .. } => 0x16,
            RequestPdu::ReadWriteMultipleRegisters { .. } => 0x17,
            RequestPdu::ReadFifoQueue { .. } => 0x18,
            RequestPdu::ReadDeviceIdentification { .. } => 0x2B,
            RequestPdu::Custom { function, .. } => *function,
            RequestPdu::Invalid { function, .. } => *function,
        }
    }
}

/// Response payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePdu {
    /// Read-coils / read-discrete-inputs reply
    Bits { function: FunctionCode, values: Vec<bool> },
    /// Read-holding / read-input / read-write reply
    Registers { function: FunctionCode, values: Vec<u16> },
    /// Write-single-coil / write-single-register echo
    WriteSingle { function: FunctionCode, address: u16, value: u16 },
    /// Write-multiple-coils / write-multiple-registers ack
    WriteMultiple { function: FunctionCode, address: u16, count: u16 },
    ExceptionStatus { status: u8 },
    Diagnostics { sub_function: u16, data: Vec<u8> },
    ReportSlaveId { slave_id: u8, running: bool, additional: Vec<u8> },
    ReadFileRecord { records: Vec<Vec<u16>> },
    WriteFileRecord { records: Vec<FileRecord> },
    MaskWriteRegister { address: u16, and_mask: u16, or_mask: u16 },
    ReadFifoQueue { values: Vec<u16> },
    DeviceIdentification {
        read_code: u8,
        conformity: u8,
        objects: Vec<(u8, Vec<u8>)>,
    },
    Custom { function: u8, data: Vec<u8> },
    /// Exception reply; `function` is the original code without the 0x80 bit
    Exception { function: u8, exception: ExceptionCode },
}

impl ResponsePdu {
    /// Build an exception reply for `function`.
    pub fn exception(function: u8, exception: ExceptionCode) -> Self {
        ResponsePdu::Exception {
            function: function & 0x7F,
            exception,
        }
    }

    /// Function code as it appears on the wire (0x80 bit set for
    /// exceptions).
    pub fn function_code(&self) -> u8 {
        match self {
            ResponsePdu::Bits { function, .. }
            | ResponsePdu::Registers { function, .. }
            | ResponsePdu::WriteSingle { function, .. }
            | ResponsePdu::WriteMultiple { function, .. } => (*function).into(),
            ResponsePdu::ExceptionStatus { .. } => 0x07,
            ResponsePdu::Diagnostics { .. } => 0x08,
            ResponsePdu::ReportSlaveId { .. } => 0x11,
            ResponsePdu::ReadFileRecord { .. } => 0x14,
            ResponsePdu::WriteFileRecord { .. } => 0x15,
            ResponsePdu::MaskWriteRegister { .. } => 0x16,
            ResponsePdu::ReadFifoQueue { .. } => 0x18,
            ResponsePdu::DeviceIdentification { .. } => 0x2B,
            ResponsePdu::Custom { function, .. } => *function,
            ResponsePdu::Exception { function, .. } => *function | 0x80,
        }
    }

    /// Encode the payload including the function code byte.
    pub fn encode(&self) -> Vec<u8> {
        let mut pdu = vec![self.function_code()];
        match self {
            ResponsePdu::Bits { values, .. } => {
                let data = pack_bits(values);
                pdu.push(data.len() as u8);
                pdu.extend_from_slice(&data);
            }
            ResponsePdu::Registers { values, .. } => {
                pdu.push((values.len() * 2) as u8);
                for value in values {
                    pdu.extend_from_slice(&value.to_be_bytes());
                }
            }
            ResponsePdu::WriteSingle { address, value, .. } => {
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&value.to_be_bytes());
            }
            ResponsePdu::WriteMultiple { address, count, .. } => {
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&count.to_be_bytes());
            }
            ResponsePdu::ExceptionStatus { status } => pdu.push(*status),
            ResponsePdu::Diagnostics { sub_function, data } => {
                pdu.extend_from_slice(&sub_function.to_be_bytes());
                pdu.extend_from_slice(data);
            }
            ResponsePdu::ReportSlaveId {
                slave_id,
                running,
                additional,
            } => {
                pdu.push((2 + additional.len()) as u8);
                pdu.push(*slave_id);
                pdu.push(if *running { 0xFF } else { 0x00 });
                pdu.extend_from_slice(additional);
            }
            ResponsePdu::ReadFileRecord { records } => {
                let total: usize = records.iter().map(|r| 2 + r.len() * 2).sum();
                pdu.push(total as u8);
                for record in records {
                    pdu.push((1 + record.len() * 2) as u8);
                    pdu.push(0x06);
                    for word in record {
                        pdu.extend_from_slice(&word.to_be_bytes());
                    }
                }
            }
            ResponsePdu::WriteFileRecord { records } => {
                let total: usize = records.iter().map(|r| 7 + r.values.len() * 2).sum();
                pdu.push(total as u8);
                for record in records {
                    pdu.push(0x06);
                    pdu.extend_from_slice(&record.file_number.to_be_bytes());
                    pdu.extend_from_slice(&record.record_number.to_be_bytes());
                    pdu.extend_from_slice(&(record.values.len() as u16).to_be_bytes());
                    for word in &record.values {
                        pdu.extend_from_slice(&word.to_be_bytes());
                    }
                }
            }
            ResponsePdu::MaskWriteRegister {
                address,
                and_mask,
                or_mask,
            } => {
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&and_mask.to_be_bytes());
                pdu.extend_from_slice(&or_mask.to_be_bytes());
            }
            ResponsePdu::ReadFifoQueue { values } => {
                // fc 24 carries 16-bit byte count and fifo count fields
                pdu.extend_from_slice(&((values.len() as u16 * 2) + 2).to_be_bytes());
                pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
                for value in values {
                    pdu.extend_from_slice(&value.to_be_bytes());
                }
            }
            ResponsePdu::DeviceIdentification {
                read_code,
                conformity,
                objects,
            } => {
                pdu.push(0x0E);
                pdu.push(*read_code);
                pdu.push(*conformity);
                pdu.push(0x00); // more follows
                pdu.push(0x00); // next object id
                pdu.push(objects.len() as u8);
                for (id, value) in objects {
                    pdu.push(*id);
                    pdu.push(value.len() as u8);
                    pdu.extend_from_slice(value);
                }
            }
            ResponsePdu::Custom { data, .. } => pdu.extend_from_slice(data),
            ResponsePdu::Exception { exception, .. } => pdu.push((*exception).into()),
        }
        pdu
    }
}

/// A decoded request with addressing metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Transaction id from the MBAP header; 0 on RTU/ASCII/TLS
    pub transaction_id: u16,
    pub slave_id: u8,
    pub pdu: RequestPdu,
}

/// A response ready for framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub transaction_id: u16,
    pub slave_id: u8,
    pub pdu: ResponsePdu,
    /// False for silent function codes; such responses never reach the
    /// wire (broadcast requests are suppressed before a response exists)
    pub should_respond: bool,
}

/// Pack booleans into bytes, LSB first, as the bit read replies require.
pub fn pack_bits(values: &[bool]) -> Vec<u8> {
    let mut data = vec![0u8; values.len().div_ceil(8)];
    for (i, &value) in values.iter().enumerate() {
        if value {
            data[i / 8] |= 1 << (i % 8);
        }
    }
    data
}

/// Unpack `count` booleans from byte-packed data.
pub fn unpack_bits(data: &[u8], count: u16) -> Vec<bool> {
    (0..count as usize)
        .map(|i| data.get(i / 8).is_some_and(|byte| byte >> (i % 8) & 1 != 0))
        .collect()
}
