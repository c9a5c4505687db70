//! Request execution against a slave context.
//!
//! Every request resolves to a response PDU; protocol violations become
//! exception PDUs here and are never propagated as errors.

use tracing::debug;

use crate::error::ModbusError;
use crate::identity::DeviceIdentity;
use crate::pdu::{
    ExceptionCode, FunctionCode, RequestPdu, ResponsePdu, ServerDecoder, MAX_FIFO_COUNT,
    MAX_READ_BITS, MAX_READ_REGISTERS, MAX_RW_WRITE_REGISTERS, MAX_WRITE_BITS,
    MAX_WRITE_REGISTERS,
};
use crate::store::SlaveContext;

/// Server-wide data a request execution may need beyond the slave context.
pub struct ExecuteEnv<'a> {
    pub decoder: &'a ServerDecoder,
    pub identity: &'a DeviceIdentity,
}

/// Execute `pdu` against `context`, producing a normal or exception reply.
///
/// Validation order per operation: quantity and value bounds first
/// (exception 3), then the address window (exception 2), then the access
/// itself (internal failures map to exception 4).
pub fn execute(
    pdu: &RequestPdu,
    slave_id: u8,
    context: &mut SlaveContext,
    env: &ExecuteEnv<'_>,
) -> ResponsePdu {
    let function = pdu.function_code();
    match try_execute(pdu, slave_id, context, env) {
        Ok(response) => response,
        Err(exception) => {
            debug!(function, code = u8::from(exception), "request raised exception");
            ResponsePdu::exception(function, exception)
        }
    }
}

type ExecResult = std::result::Result<ResponsePdu, ExceptionCode>;

fn try_execute(
    pdu: &RequestPdu,
    slave_id: u8,
    context: &mut SlaveContext,
    env: &ExecuteEnv<'_>,
) -> ExecResult {
    match pdu {
        RequestPdu::ReadCoils { address, count } => {
            check_count(*count, MAX_READ_BITS)?;
            let values = context.co.read(*address, *count).map_err(access_error)?;
            Ok(ResponsePdu::Bits {
                function: FunctionCode::ReadCoils,
                values,
            })
        }
        RequestPdu::ReadDiscreteInputs { address, count } => {
            check_count(*count, MAX_READ_BITS)?;
            let values = context.di.read(*address, *count).map_err(access_error)?;
            Ok(ResponsePdu::Bits {
                function: FunctionCode::ReadDiscreteInputs,
                values,
            })
        }
        RequestPdu::ReadHoldingRegisters { address, count } => {
            check_count(*count, MAX_READ_REGISTERS)?;
            let values = context.hr.read(*address, *count).map_err(access_error)?;
            Ok(ResponsePdu::Registers {
                function: FunctionCode::ReadHoldingRegisters,
                values,
            })
        }
        RequestPdu::ReadInputRegisters { address, count } => {
            check_count(*count, MAX_READ_REGISTERS)?;
            let values = context.ir.read(*address, *count).map_err(access_error)?;
            Ok(ResponsePdu::Registers {
                function: FunctionCode::ReadInputRegisters,
                values,
            })
        }
        RequestPdu::WriteSingleCoil { address, value } => {
            let state = match *value {
                0xFF00 => true,
                0x0000 => false,
                _ => return Err(ExceptionCode::IllegalDataValue),
            };
            context.co.set(*address, state).map_err(access_error)?;
            Ok(ResponsePdu::WriteSingle {
                function: FunctionCode::WriteSingleCoil,
                address: *address,
                value: *value,
            })
        }
        RequestPdu::WriteSingleRegister { address, value } => {
            context.hr.set(*address, *value).map_err(access_error)?;
            Ok(ResponsePdu::WriteSingle {
                function: FunctionCode::WriteSingleRegister,
                address: *address,
                value: *value,
            })
        }
        RequestPdu::ReadExceptionStatus => Ok(ResponsePdu::ExceptionStatus {
            status: context.exception_status,
        }),
        RequestPdu::Diagnostics { sub_function, data } => {
            // sub-function 0 is return-query-data; nothing else is served
            if *sub_function != 0 {
                return Err(ExceptionCode::IllegalFunction);
            }
            Ok(ResponsePdu::Diagnostics {
                sub_function: 0,
                data: data.clone(),
            })
        }
        RequestPdu::WriteMultipleCoils {
            address,
            count,
            values,
        } => {
            check_count(*count, MAX_WRITE_BITS)?;
            context.co.write(*address, values).map_err(access_error)?;
            Ok(ResponsePdu::WriteMultiple {
                function: FunctionCode::WriteMultipleCoils,
                address: *address,
                count: *count,
            })
        }
        RequestPdu::WriteMultipleRegisters { address, values } => {
            check_count(values.len() as u16, MAX_WRITE_REGISTERS)?;
            context.hr.write(*address, values).map_err(access_error)?;
            Ok(ResponsePdu::WriteMultiple {
                function: FunctionCode::WriteMultipleRegisters,
                address: *address,
                count: values.len() as u16,
            })
        }
        RequestPdu::ReportSlaveId => Ok(ResponsePdu::ReportSlaveId {
            slave_id,
            running: true,
            additional: env.identity.summary().into_bytes(),
        }),
        RequestPdu::ReadFileRecord { records } => {
            let mut data = Vec::with_capacity(records.len());
            for record in records {
                if record.record_length == 0 || record.record_length > 124 {
                    return Err(ExceptionCode::IllegalDataValue);
                }
                let words = context
                    .read_file_record(record.file_number, record.record_number, record.record_length)
                    .map_err(access_error)?;
                data.push(words);
            }
            Ok(ResponsePdu::ReadFileRecord { records: data })
        }
        RequestPdu::WriteFileRecord { records } => {
            for record in records {
                context.write_file_record(record.file_number, record.record_number, &record.values);
            }
            Ok(ResponsePdu::WriteFileRecord {
                records: records.clone(),
            })
        }
        RequestPdu::MaskWriteRegister {
            address,
            and_mask,
            or_mask,
        } => {
            let current = context.hr.get(*address).map_err(access_error)?;
            let masked = (current & and_mask) | (or_mask & !and_mask);
            context.hr.set(*address, masked).map_err(access_error)?;
            Ok(ResponsePdu::MaskWriteRegister {
                address: *address,
                and_mask: *and_mask,
                or_mask: *or_mask,
            })
        }
        RequestPdu::ReadWriteMultipleRegisters {
            read_address,
            read_count,
            write_address,
            values,
        } => {
            check_count(*read_count, MAX_READ_REGISTERS)?;
            check_count(values.len() as u16, MAX_RW_WRITE_REGISTERS)?;
            // the write is performed before the read
            context.hr.write(*write_address, values).map_err(access_error)?;
            let read = context.hr.read(*read_address, *read_count).map_err(access_error)?;
            Ok(ResponsePdu::Registers {
                function: FunctionCode::ReadWriteMultipleRegisters,
                values: read,
            })
        }
        RequestPdu::ReadFifoQueue { address } => {
            let count = context.hr.get(*address).map_err(access_error)?;
            if count > MAX_FIFO_COUNT {
                return Err(ExceptionCode::IllegalDataValue);
            }
            let values = context
                .hr
                .read(address.wrapping_add(1), count)
                .map_err(access_error)?;
            Ok(ResponsePdu::ReadFifoQueue { values })
        }
        RequestPdu::ReadDeviceIdentification { read_code, object_id } => {
            if !(1..=4).contains(read_code) {
                return Err(ExceptionCode::IllegalDataValue);
            }
            let objects = env
                .identity
                .objects(*read_code, *object_id)
                .ok_or(ExceptionCode::IllegalDataAddress)?;
            Ok(ResponsePdu::DeviceIdentification {
                read_code: *read_code,
                conformity: 0x83,
                objects: objects
                    .into_iter()
                    .map(|(id, value)| (id, value.into_bytes()))
                    .collect(),
            })
        }
        RequestPdu::Custom { function, data } => {
            let handler = env
                .decoder
                .custom(*function)
                .ok_or(ExceptionCode::IllegalFunction)?;
            let payload = handler.execute(data, context).map_err(access_error)?;
            Ok(ResponsePdu::Custom {
                function: *function,
                data: payload,
            })
        }
        RequestPdu::Invalid { exception, .. } => Err(*exception),
    }
}

fn check_count(count: u16, max: u16) -> std::result::Result<(), ExceptionCode> {
    if count == 0 || count > max {
        Err(ExceptionCode::IllegalDataValue)
    } else {
        Ok(())
    }
}

/// Map a datastore failure to its wire exception.
fn access_error(err: ModbusError) -> ExceptionCode {
    match err {
        ModbusError::IllegalDataAddress { .. } => ExceptionCode::IllegalDataAddress,
        _ => ExceptionCode::SlaveFailure,
    }
}
