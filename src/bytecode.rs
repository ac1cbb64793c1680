//! Bytecode reader: decodes a function's header, byte stream, and constant
//! pool from host memory (spec §3 "Function descriptor", §4.2).

use crate::host::{FunctionOffsets, Host};
use crate::{JitError, JitResult, MAX_BYTECODE_LEN};

/// Tag values for constant-pool entries. Each entry is a fixed 8 bytes: a
/// 4-byte payload followed by a 4-byte tag (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstTag {
    Integer,
    Boolean,
    Null,
    Undefined,
    Float64,
}

impl ConstTag {
    fn from_u32(tag: u32) -> Option<ConstTag> {
        match tag {
            0 => Some(ConstTag::Integer),
            1 => Some(ConstTag::Boolean),
            2 => Some(ConstTag::Null),
            3 => Some(ConstTag::Undefined),
            4 => Some(ConstTag::Float64),
            _ => None,
        }
    }
}

/// A decoded constant-pool entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstValue {
    Integer(i32),
    Boolean(bool),
    Null,
    Undefined,
    Float64(f64),
}

/// A read-only view over one function's bytecode, locals/args counts, and
/// constant pool, built by probing host memory through the offsets table.
///
/// Construction fails (the caller bails) if any required probe fails, or if
/// the declared bytecode length is zero or exceeds [`MAX_BYTECODE_LEN`].
#[derive(Debug)]
pub struct BytecodeReader {
    pub function_address: u32,
    pub arg_count: u16,
    pub local_count: u16,
    code: Vec<u8>,
    const_pool: Vec<u8>,
    const_count: u16,
}

impl BytecodeReader {
    pub fn new(host: &dyn Host, function_address: u32) -> JitResult<Self> {
        let FunctionOffsets {
            bytecode_ptr,
            bytecode_len,
            arg_count,
            local_count,
            const_pool_ptr,
            const_pool_count,
            ..
        } = host.function_offsets();

        let read_u32 = |field_off: u32| -> JitResult<u32> {
            let addr = function_address + field_off;
            let bytes = host
                .read_physical_memory(addr, 4)
                .ok_or(JitError::ProbeFailed { address: addr, length: 4 })?;
            Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
        };
        let read_u16 = |field_off: u32| -> JitResult<u16> {
            let addr = function_address + field_off;
            let bytes = host
                .read_physical_memory(addr, 2)
                .ok_or(JitError::ProbeFailed { address: addr, length: 2 })?;
            Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
        };

        let code_ptr = read_u32(bytecode_ptr)?;
        let code_len = read_u32(bytecode_len)?;
        if code_len == 0 || code_len > MAX_BYTECODE_LEN {
            return Err(JitError::BytecodeInvalid(format!(
                "bytecode length {code_len} is zero or exceeds {MAX_BYTECODE_LEN}"
            )));
        }
        let code = host
            .read_physical_memory(code_ptr, code_len)
            .ok_or(JitError::ProbeFailed { address: code_ptr, length: code_len })?;

        let args = read_u16(arg_count)?;
        let locals = read_u16(local_count)?;

        let pool_ptr = read_u32(const_pool_ptr)?;
        let pool_count = read_u16(const_pool_count)?;
        let pool_bytes = pool_count as u32 * 8;
        let const_pool = if pool_bytes == 0 {
            Vec::new()
        } else {
            host.read_physical_memory(pool_ptr, pool_bytes)
                .ok_or(JitError::ProbeFailed { address: pool_ptr, length: pool_bytes })?
        };

        Ok(BytecodeReader {
            function_address,
            arg_count: args,
            local_count: locals,
            code,
            const_pool,
            const_count: pool_count,
        })
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.code
    }

    pub fn u8_at(&self, offset: usize) -> Option<u8> {
        self.code.get(offset).copied()
    }

    pub fn i8_at(&self, offset: usize) -> Option<i8> {
        self.u8_at(offset).map(|b| b as i8)
    }

    pub fn u16_at(&self, offset: usize) -> Option<u16> {
        let s = self.code.get(offset..offset + 2)?;
        Some(u16::from_le_bytes(s.try_into().unwrap()))
    }

    pub fn i16_at(&self, offset: usize) -> Option<i16> {
        self.u16_at(offset).map(|v| v as i16)
    }

    pub fn u32_at(&self, offset: usize) -> Option<u32> {
        let s = self.code.get(offset..offset + 4)?;
        Some(u32::from_le_bytes(s.try_into().unwrap()))
    }

    pub fn i32_at(&self, offset: usize) -> Option<i32> {
        self.u32_at(offset).map(|v| v as i32)
    }

    pub fn const_count(&self) -> u16 {
        self.const_count
    }

    /// Decodes constant-pool entry `index` (payload, then tag).
    pub fn const_at(&self, index: u32) -> JitResult<ConstValue> {
        if index >= self.const_count as u32 {
            return Err(JitError::InvalidConstant { index });
        }
        let base = index as usize * 8;
        let payload = u32::from_le_bytes(self.const_pool[base..base + 4].try_into().unwrap());
        let tag_raw = u32::from_le_bytes(self.const_pool[base + 4..base + 8].try_into().unwrap());
        let tag = ConstTag::from_u32(tag_raw).ok_or(JitError::UnsupportedConstantTag { index })?;
        Ok(match tag {
            ConstTag::Integer => ConstValue::Integer(payload as i32),
            ConstTag::Boolean => ConstValue::Boolean(payload != 0),
            ConstTag::Null => ConstValue::Null,
            ConstTag::Undefined => ConstValue::Undefined,
            ConstTag::Float64 => {
                // Unlike every other tag, a float64 entry uses the full 8-byte
                // slot as the value itself rather than a 4-byte payload.
                let bits = u64::from_le_bytes(self.const_pool[base..base + 8].try_into().unwrap());
                ConstValue::Float64(f64::from_bits(bits))
            }
        })
    }
}
