//! Per-unit data tables.
//!
//! Every slave unit owns four tables of [`TABLE_LEN`] entries. Writes to coils and
//! holding registers at or beyond the configured offsets are mirrored into the
//! discrete inputs and input registers within the same call.

use std::ops::Range;

use crate::codec::{Address, Word};
use crate::exception::Exception;

/// Entries per table, one for each 16-bit address.
pub const TABLE_LEN: usize = 65536;

/// Single-bit tables.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BitTable {
    Coils,
    DiscreteInputs,
}

/// 16-bit register tables.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WordTable {
    HoldingRegisters,
    InputRegisters,
}

/// Position of a unit in [`Memory`], obtained from [`Memory::resolve`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UnitIndex(usize);

/// Raw tables of one slave unit.
#[derive(Debug, Clone)]
pub struct SlaveMemory {
    discrete_inputs: Box<[bool]>,
    coils: Box<[bool]>,
    holding_registers: Box<[Word]>,
    input_registers: Box<[Word]>,
}

impl Default for SlaveMemory {
    fn default() -> Self {
        Self {
            discrete_inputs: vec![false; TABLE_LEN].into_boxed_slice(),
            coils: vec![false; TABLE_LEN].into_boxed_slice(),
            holding_registers: vec![0; TABLE_LEN].into_boxed_slice(),
            input_registers: vec![0; TABLE_LEN].into_boxed_slice(),
        }
    }
}

impl SlaveMemory {
    fn bits(&self, table: BitTable) -> &[bool] {
        match table {
            BitTable::Coils => &self.coils,
            BitTable::DiscreteInputs => &self.discrete_inputs,
        }
    }

    fn words(&self, table: WordTable) -> &[Word] {
        match table {
            WordTable::HoldingRegisters => &self.holding_registers,
            WordTable::InputRegisters => &self.input_registers,
        }
    }
}

/// Memory of every unit served, ordered by `upper_id - slave_id`.
#[derive(Debug, Clone)]
pub struct Memory {
    slaves: Vec<SlaveMemory>,
    lower_id: u8,
    upper_id: u8,
    offset_input_registers: Address,
    offset_discrete_inputs: Address,
}

impl Memory {
    /// Allocate tables for units `lower_id..=upper_id`. An inverted range serves no unit.
    pub fn new(
        lower_id: u8,
        upper_id: u8,
        offset_input_registers: Address,
        offset_discrete_inputs: Address,
    ) -> Self {
        let units = if lower_id <= upper_id {
            (upper_id - lower_id) as usize + 1
        } else {
            0
        };
        Self {
            slaves: vec![SlaveMemory::default(); units],
            lower_id,
            upper_id,
            offset_input_registers,
            offset_discrete_inputs,
        }
    }

    /// Index of the unit answering to `slave_id`, or `None` if it is not served here.
    pub fn resolve(&self, slave_id: u8) -> Option<UnitIndex> {
        if slave_id < self.lower_id || slave_id > self.upper_id {
            return None;
        }
        Some(UnitIndex((self.upper_id - slave_id) as usize))
    }

    pub fn unit_count(&self) -> usize {
        self.slaves.len()
    }

    pub fn offset_input_registers(&self) -> Address {
        self.offset_input_registers
    }

    pub fn offset_discrete_inputs(&self) -> Address {
        self.offset_discrete_inputs
    }

    pub fn read_bits(
        &self,
        unit: UnitIndex,
        table: BitTable,
        start: Address,
        cnt: usize,
    ) -> Result<Vec<bool>, Exception> {
        let range = table_range(start, cnt)?;
        Ok(self.slave(unit)?.bits(table)[range].to_vec())
    }

    pub fn read_words(
        &self,
        unit: UnitIndex,
        table: WordTable,
        start: Address,
        cnt: usize,
    ) -> Result<Vec<Word>, Exception> {
        let range = table_range(start, cnt)?;
        Ok(self.slave(unit)?.words(table)[range].to_vec())
    }

    pub fn write_bit(
        &mut self,
        unit: UnitIndex,
        table: BitTable,
        addr: Address,
        value: bool,
    ) -> Result<(), Exception> {
        self.write_bits(unit, table, addr, &[value])
    }

    pub fn write_word(
        &mut self,
        unit: UnitIndex,
        table: WordTable,
        addr: Address,
        value: Word,
    ) -> Result<(), Exception> {
        self.write_words(unit, table, addr, &[value])
    }

    /// Write consecutive bits. Nothing is written if any address is out of range.
    pub fn write_bits(
        &mut self,
        unit: UnitIndex,
        table: BitTable,
        start: Address,
        values: &[bool],
    ) -> Result<(), Exception> {
        let range = table_range(start, values.len())?;
        let offset = self.offset_discrete_inputs as usize;
        let slave = self.slave_mut(unit)?;

        match table {
            BitTable::Coils => {
                slave.coils[range.clone()].copy_from_slice(values);
                for (addr, &value) in range.zip(values) {
                    if addr >= offset {
                        slave.discrete_inputs[addr - offset] = value;
                    }
                }
            }
            BitTable::DiscreteInputs => slave.discrete_inputs[range].copy_from_slice(values),
        }
        Ok(())
    }

    /// Write consecutive registers. Nothing is written if any address is out of range.
    pub fn write_words(
        &mut self,
        unit: UnitIndex,
        table: WordTable,
        start: Address,
        values: &[Word],
    ) -> Result<(), Exception> {
        let range = table_range(start, values.len())?;
        let offset = self.offset_input_registers as usize;
        let slave = self.slave_mut(unit)?;

        match table {
            WordTable::HoldingRegisters => {
                slave.holding_registers[range.clone()].copy_from_slice(values);
                for (addr, &value) in range.zip(values) {
                    if addr >= offset {
                        slave.input_registers[addr - offset] = value;
                    }
                }
            }
            WordTable::InputRegisters => slave.input_registers[range].copy_from_slice(values),
        }
        Ok(())
    }

    fn slave(&self, unit: UnitIndex) -> Result<&SlaveMemory, Exception> {
        self.slaves.get(unit.0).ok_or(Exception::SlaveDeviceFailure)
    }

    fn slave_mut(&mut self, unit: UnitIndex) -> Result<&mut SlaveMemory, Exception> {
        self.slaves.get_mut(unit.0).ok_or(Exception::SlaveDeviceFailure)
    }
}

/// Table indices for `cnt` entries from `start`, rejecting ranges past the last address.
fn table_range(start: Address, cnt: usize) -> Result<Range<usize>, Exception> {
    let start = start as usize;
    let end = start + cnt;
    if end > TABLE_LEN {
        return Err(Exception::IllegalDataAddress);
    }
    Ok(start..end)
}
