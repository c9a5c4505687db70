//! In-memory register datastore.
//!
//! A [`SlaveContext`] bundles the four Modbus banks (discrete inputs,
//! coils, input registers, holding registers) for one slave id. A
//! [`ServerContext`] routes requests either to a single context regardless
//! of the addressed slave id, or to one context per known id.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::{ModbusError, Result};

/// Contiguous register window with `[base, base + len)` validity.
///
/// Two instantiations are used: `DataBlock<bool>` for the bit banks and
/// `DataBlock<u16>` for the word banks.
#[derive(Debug, Clone)]
pub struct DataBlock<T> {
    base: u16,
    values: Vec<T>,
}

impl<T: Copy + Default> DataBlock<T> {
    /// Create a block of `size` default values starting at `base`.
    pub fn new(base: u16, size: u16) -> Self {
        Self {
            base,
            values: vec![T::default(); size as usize],
        }
    }

    /// Create a block filled with `value`.
    pub fn filled(base: u16, size: u16, value: T) -> Self {
        Self {
            base,
            values: vec![value; size as usize],
        }
    }

    /// Create a block from explicit values.
    pub fn from_values(base: u16, values: Vec<T>) -> Self {
        Self { base, values }
    }

    /// First valid address.
    pub fn base(&self) -> u16 {
        self.base
    }

    /// Number of addressable values.
    pub fn len(&self) -> u16 {
        self.values.len() as u16
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True iff `[address, address + count)` lies inside the block.
    pub fn validate(&self, address: u16, count: u16) -> bool {
        let end = address as u32 + count as u32;
        address >= self.base && end <= self.base as u32 + self.values.len() as u32
    }

    /// Read `count` values starting at `address`.
    pub fn read(&self, address: u16, count: u16) -> Result<Vec<T>> {
        if !self.validate(address, count) {
            return Err(ModbusError::IllegalDataAddress { address, count });
        }
        let start = (address - self.base) as usize;
        Ok(self.values[start..start + count as usize].to_vec())
    }

    /// Write a run of values starting at `address`.
    pub fn write(&mut self, address: u16, values: &[T]) -> Result<()> {
        if !self.validate(address, values.len() as u16) {
            return Err(ModbusError::IllegalDataAddress {
                address,
                count: values.len() as u16,
            });
        }
        let start = (address - self.base) as usize;
        self.values[start..start + values.len()].copy_from_slice(values);
        Ok(())
    }

    /// Read a single value.
    pub fn get(&self, address: u16) -> Result<T> {
        Ok(self.read(address, 1)?[0])
    }

    /// Write a single value.
    pub fn set(&mut self, address: u16, value: T) -> Result<()> {
        self.write(address, &[value])
    }
}

/// The four register banks plus device-local state for one slave.
#[derive(Debug)]
pub struct SlaveContext {
    /// Discrete inputs, read-only for Modbus clients
    pub di: DataBlock<bool>,
    /// Coils, read/write
    pub co: DataBlock<bool>,
    /// Input registers, read-only for Modbus clients
    pub ir: DataBlock<u16>,
    /// Holding registers, read/write
    pub hr: DataBlock<u16>,
    /// Status byte served by read-exception-status (fc 7)
    pub exception_status: u8,
    /// File store for the file-record functions (fc 20/21), keyed by
    /// file number; records are 16-bit words
    files: HashMap<u16, Vec<u16>>,
}

impl SlaveContext {
    /// Create a context with all four banks spanning `[0, size)`.
    pub fn new(size: u16) -> Self {
        Self {
            di: DataBlock::new(0, size),
            co: DataBlock::new(0, size),
            ir: DataBlock::new(0, size),
            hr: DataBlock::new(0, size),
            exception_status: 0,
            files: HashMap::new(),
        }
    }

    /// Create a context from explicit banks.
    pub fn with_blocks(
        di: DataBlock<bool>,
        co: DataBlock<bool>,
        ir: DataBlock<u16>,
        hr: DataBlock<u16>,
    ) -> Self {
        Self {
            di,
            co,
            ir,
            hr,
            exception_status: 0,
            files: HashMap::new(),
        }
    }

    /// Read `count` words of file `file_number` starting at `record_number`.
    pub fn read_file_record(
        &self,
        file_number: u16,
        record_number: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let file = self
            .files
            .get(&file_number)
            .ok_or(ModbusError::IllegalDataAddress {
                address: record_number,
                count,
            })?;
        let start = record_number as usize;
        let end = start + count as usize;
        if end > file.len() {
            return Err(ModbusError::IllegalDataAddress {
                address: record_number,
                count,
            });
        }
        Ok(file[start..end].to_vec())
    }

    /// Write words into file `file_number`, growing it as needed.
    pub fn write_file_record(&mut self, file_number: u16, record_number: u16, values: &[u16]) {
        let file = self.files.entry(file_number).or_default();
        let end = record_number as usize + values.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[record_number as usize..end].copy_from_slice(values);
    }
}

enum Routing {
    /// All requests route to the one context regardless of slave id
    Single(Mutex<SlaveContext>),
    /// Requests route by slave id; unknown ids raise `NoSuchSlave`
    Multi(HashMap<u8, Mutex<SlaveContext>>),
}

/// The datastore shared by every connection of one server.
///
/// Each slave context sits behind its own mutex, held only for the
/// duration of a single request execution.
pub struct ServerContext {
    routing: Routing,
}

impl ServerContext {
    /// Single-slave context: every request is served by `context`.
    pub fn single(context: SlaveContext) -> Self {
        Self {
            routing: Routing::Single(Mutex::new(context)),
        }
    }

    /// Multi-slave context from `(slave_id, context)` pairs.
    pub fn with_slaves(slaves: impl IntoIterator<Item = (u8, SlaveContext)>) -> Self {
        Self {
            routing: Routing::Multi(
                slaves
                    .into_iter()
                    .map(|(id, ctx)| (id, Mutex::new(ctx)))
                    .collect(),
            ),
        }
    }

    /// True when running in single-slave mode.
    pub fn is_single(&self) -> bool {
        matches!(self.routing, Routing::Single(_))
    }

    /// The known slave ids. Empty for single-slave mode, where the framer
    /// accepts every id.
    pub fn slaves(&self) -> Vec<u8> {
        match &self.routing {
            Routing::Single(_) => Vec::new(),
            Routing::Multi(map) => {
                let mut ids: Vec<u8> = map.keys().copied().collect();
                ids.sort_unstable();
                ids
            }
        }
    }

    /// Run `f` against the context owning `slave_id`.
    pub fn with_slave<R>(
        &self,
        slave_id: u8,
        f: impl FnOnce(&mut SlaveContext) -> R,
    ) -> Result<R> {
        match &self.routing {
            Routing::Single(ctx) => Ok(f(&mut lock(ctx))),
            Routing::Multi(map) => {
                let ctx = map.get(&slave_id).ok_or(ModbusError::NoSuchSlave(slave_id))?;
                Ok(f(&mut lock(ctx)))
            }
        }
    }
}

fn lock(ctx: &Mutex<SlaveContext>) -> MutexGuard<'_, SlaveContext> {
    match ctx.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
