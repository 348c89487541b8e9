//! Function code dispatch and the built-in handlers.

use std::collections::HashMap;
use std::fmt;

use log::warn;

use crate::codec::{self, Address, Quantity};
use crate::exception::Exception;
use crate::frame::Framer;
use crate::memory::{BitTable, Memory, UnitIndex, WordTable};

pub const READ_COILS: u8 = 0x01;
pub const READ_DISCRETE_INPUTS: u8 = 0x02;
pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const READ_INPUT_REGISTERS: u8 = 0x04;
pub const WRITE_SINGLE_COIL: u8 = 0x05;
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

const MAX_READ_BITS: usize = 2000;
const MAX_READ_WORDS: usize = 125;
const MAX_WRITE_BITS: usize = 1968;
const MAX_WRITE_WORDS: usize = 123;

/// PDU limit of 253 bytes less the function code.
pub const MAX_PAYLOAD_LEN: usize = 252;

/// Handler for one function code.
///
/// Gets the memory of the addressed unit and the decoded request; returns the
/// response payload (everything after the function code) or the exception to report.
pub type Handler =
    Box<dyn Fn(&mut Memory, UnitIndex, &dyn Framer) -> Result<Vec<u8>, Exception> + Send + Sync>;

/// Function code to handler mapping. Codes without a handler answer `IllegalFunction`.
pub struct Functions {
    handlers: HashMap<u8, Handler>,
}

impl Default for Functions {
    /// Functions 1 to 6, 15 and 16.
    fn default() -> Self {
        let mut functions = Self::empty();
        functions.register(READ_COILS, read_coils);
        functions.register(READ_DISCRETE_INPUTS, read_discrete_inputs);
        functions.register(READ_HOLDING_REGISTERS, read_holding_registers);
        functions.register(READ_INPUT_REGISTERS, read_input_registers);
        functions.register(WRITE_SINGLE_COIL, write_single_coil);
        functions.register(WRITE_SINGLE_REGISTER, write_single_register);
        functions.register(WRITE_MULTIPLE_COILS, write_multiple_coils);
        functions.register(WRITE_MULTIPLE_REGISTERS, write_multiple_registers);
        functions
    }
}

impl fmt::Debug for Functions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut codes: Vec<_> = self.handlers.keys().copied().collect();
        codes.sort_unstable();
        f.debug_struct("Functions").field("codes", &codes).finish()
    }
}

impl Functions {
    /// A table without any handler.
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Install or replace the handler for `code`.
    pub fn register<F>(&mut self, code: u8, handler: F)
    where
        F: Fn(&mut Memory, UnitIndex, &dyn Framer) -> Result<Vec<u8>, Exception>
            + Send
            + Sync
            + 'static,
    {
        self.insert(code, Box::new(handler));
    }

    pub(crate) fn insert(&mut self, code: u8, handler: Handler) {
        self.handlers.insert(code, handler);
    }

    pub fn contains(&self, code: u8) -> bool {
        self.handlers.contains_key(&code)
    }

    /// Execute `request` against `unit` and build the matching response frame.
    pub fn dispatch(
        &self,
        memory: &mut Memory,
        unit: UnitIndex,
        request: &dyn Framer,
    ) -> Box<dyn Framer> {
        let result = match self.handlers.get(&request.function()) {
            Some(handler) => handler(memory, unit, request),
            None => Err(Exception::IllegalFunction),
        };

        let mut response = request.copy_as_response();
        match result {
            Ok(payload) if payload.len() > MAX_PAYLOAD_LEN => {
                warn!(
                    "handler for function {:#04x} returned {} bytes, limit is {MAX_PAYLOAD_LEN}",
                    request.function(),
                    payload.len()
                );
                response.set_exception(Exception::SlaveDeviceFailure);
            }
            Ok(payload) => response.set_payload(payload),
            Err(exception) => response.set_exception(exception),
        }
        response
    }
}

/// Start address and quantity of a read or write-multiple request.
fn address_and_quantity(payload: &[u8]) -> Result<(Address, Quantity), Exception> {
    match (codec::word_at(payload, 0), codec::word_at(payload, 2)) {
        (Some(addr), Some(cnt)) => Ok((addr, cnt)),
        _ => Err(Exception::IllegalDataValue),
    }
}

/// Address and value of a write-single request.
fn address_and_value(payload: &[u8]) -> Result<(Address, u16), Exception> {
    address_and_quantity(payload)
}

fn check_address(addr: Address, cnt: usize) -> Result<(), Exception> {
    if addr as usize + cnt > crate::memory::TABLE_LEN {
        return Err(Exception::IllegalDataAddress);
    }
    Ok(())
}

fn check_quantity(cnt: usize, max: usize) -> Result<(), Exception> {
    if cnt == 0 || cnt > max {
        return Err(Exception::IllegalDataValue);
    }
    Ok(())
}

/// Bytes following the byte-count field, which must announce exactly `expected` bytes.
fn counted_values(payload: &[u8], expected: usize) -> Result<&[u8], Exception> {
    let byte_count = *payload.get(4).ok_or(Exception::IllegalDataValue)? as usize;
    if byte_count != expected || payload.len() < 5 + byte_count {
        return Err(Exception::IllegalDataValue);
    }
    Ok(&payload[5..5 + byte_count])
}

fn read_bits(
    memory: &Memory,
    unit: UnitIndex,
    table: BitTable,
    request: &dyn Framer,
) -> Result<Vec<u8>, Exception> {
    let (addr, cnt) = address_and_quantity(request.payload())?;
    check_address(addr, cnt as usize)?;
    check_quantity(cnt as usize, MAX_READ_BITS)?;

    let bits = memory.read_bits(unit, table, addr, cnt as usize)?;
    let packed = codec::pack_bits(&bits);
    let mut data = Vec::with_capacity(1 + packed.len());
    data.push(packed.len() as u8);
    data.extend(packed);
    Ok(data)
}

fn read_words(
    memory: &Memory,
    unit: UnitIndex,
    table: WordTable,
    request: &dyn Framer,
) -> Result<Vec<u8>, Exception> {
    let (addr, cnt) = address_and_quantity(request.payload())?;
    check_address(addr, cnt as usize)?;
    check_quantity(cnt as usize, MAX_READ_WORDS)?;

    let words = memory.read_words(unit, table, addr, cnt as usize)?;
    let mut data = Vec::with_capacity(1 + words.len() * 2);
    data.push((words.len() * 2) as u8);
    data.extend(codec::words_to_be_bytes(&words));
    Ok(data)
}

/// Function 1.
pub fn read_coils(
    memory: &mut Memory,
    unit: UnitIndex,
    request: &dyn Framer,
) -> Result<Vec<u8>, Exception> {
    read_bits(memory, unit, BitTable::Coils, request)
}

/// Function 2.
pub fn read_discrete_inputs(
    memory: &mut Memory,
    unit: UnitIndex,
    request: &dyn Framer,
) -> Result<Vec<u8>, Exception> {
    read_bits(memory, unit, BitTable::DiscreteInputs, request)
}

/// Function 3.
pub fn read_holding_registers(
    memory: &mut Memory,
    unit: UnitIndex,
    request: &dyn Framer,
) -> Result<Vec<u8>, Exception> {
    read_words(memory, unit, WordTable::HoldingRegisters, request)
}

/// Function 4.
pub fn read_input_registers(
    memory: &mut Memory,
    unit: UnitIndex,
    request: &dyn Framer,
) -> Result<Vec<u8>, Exception> {
    read_words(memory, unit, WordTable::InputRegisters, request)
}

/// Function 5. `0xFF00` switches the coil on, `0x0000` off; any other nonzero value
/// also counts as on.
pub fn write_single_coil(
    memory: &mut Memory,
    unit: UnitIndex,
    request: &dyn Framer,
) -> Result<Vec<u8>, Exception> {
    let (addr, value) = address_and_value(request.payload())?;
    memory.write_bit(unit, BitTable::Coils, addr, value != 0)?;
    Ok(request.payload()[..4].to_vec())
}

/// Function 6.
pub fn write_single_register(
    memory: &mut Memory,
    unit: UnitIndex,
    request: &dyn Framer,
) -> Result<Vec<u8>, Exception> {
    let (addr, value) = address_and_value(request.payload())?;
    memory.write_word(unit, WordTable::HoldingRegisters, addr, value)?;
    Ok(request.payload()[..4].to_vec())
}

/// Function 15.
pub fn write_multiple_coils(
    memory: &mut Memory,
    unit: UnitIndex,
    request: &dyn Framer,
) -> Result<Vec<u8>, Exception> {
    let payload = request.payload();
    let (addr, cnt) = address_and_quantity(payload)?;
    let cnt = cnt as usize;
    check_address(addr, cnt)?;
    check_quantity(cnt, MAX_WRITE_BITS)?;

    let packed = counted_values(payload, codec::packed_len(cnt))?;
    let bits = codec::unpack_bits(packed, cnt).ok_or(Exception::IllegalDataValue)?;
    memory.write_bits(unit, BitTable::Coils, addr, &bits)?;
    Ok(payload[..4].to_vec())
}

/// Function 16.
pub fn write_multiple_registers(
    memory: &mut Memory,
    unit: UnitIndex,
    request: &dyn Framer,
) -> Result<Vec<u8>, Exception> {
    let payload = request.payload();
    let (addr, cnt) = address_and_quantity(payload)?;
    let cnt = cnt as usize;
    check_address(addr, cnt)?;
    check_quantity(cnt, MAX_WRITE_WORDS)?;

    let bytes = counted_values(payload, cnt * 2)?;
    let words = codec::be_bytes_to_words(bytes);
    memory.write_words(unit, WordTable::HoldingRegisters, addr, &words)?;
    Ok(payload[..4].to_vec())
}
