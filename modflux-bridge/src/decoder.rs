//! Register decoding.
//!
//! Multi-register values are assembled from 16-bit words according to a
//! [`WordOrder`]. The default, [`WordOrder::Big`], puts the most significant
//! register first (the first word read is the high word). Bytes within a
//! register are always big-endian, as Modbus transmits them.

use modflux_common::FieldValue;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Data type interpretation for input registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Unsigned 16-bit integer (1 register)
    U16,
    /// Signed 16-bit integer (1 register)
    I16,
    /// Unsigned 32-bit integer (2 registers)
    U32,
    /// Signed 32-bit integer (2 registers)
    I32,
    /// IEEE 754 single precision float (2 registers)
    F32,
    /// Unsigned 64-bit integer (4 registers)
    U64,
    /// Signed 64-bit integer (4 registers)
    I64,
    /// IEEE 754 double precision float (4 registers)
    F64,
}

impl DataType {
    /// Number of 16-bit registers occupied by this type.
    pub fn word_count(&self) -> u16 {
        match self {
            DataType::U16 | DataType::I16 => 1,
            DataType::U32 | DataType::I32 | DataType::F32 => 2,
            DataType::U64 | DataType::I64 | DataType::F64 => 4,
        }
    }

    /// Return the string name for this data type.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::U16 => "u16",
            DataType::I16 => "i16",
            DataType::U32 => "u32",
            DataType::I32 => "i32",
            DataType::F32 => "f32",
            DataType::U64 => "u64",
            DataType::I64 => "i64",
            DataType::F64 => "f64",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order of registers within a multi-register value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WordOrder {
    /// Most significant register first.
    #[default]
    Big,
    /// Least significant register first ("word swapped").
    Little,
}

/// A decoded register value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        match value {
            Value::U16(v) => FieldValue::Unsigned(v.into()),
            Value::I16(v) => FieldValue::Integer(v.into()),
            Value::U32(v) => FieldValue::Unsigned(v.into()),
            Value::I32(v) => FieldValue::Integer(v.into()),
            Value::F32(v) => FieldValue::Float(v.into()),
            Value::U64(v) => FieldValue::Unsigned(v),
            Value::I64(v) => FieldValue::Integer(v),
            Value::F64(v) => FieldValue::Float(v),
        }
    }
}

/// Decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("{data_type} needs {expected} register(s), got {got}")]
    LengthMismatch {
        data_type: DataType,
        expected: u16,
        got: usize,
    },
}

/// Decode the registers of one field.
///
/// `words` must hold exactly `data_type.word_count()` registers.
pub fn decode(words: &[u16], data_type: DataType, order: WordOrder) -> Result<Value, DecodeError> {
    let expected = data_type.word_count();
    if words.len() != usize::from(expected) {
        return Err(DecodeError::LengthMismatch {
            data_type,
            expected,
            got: words.len(),
        });
    }

    let raw = assemble(words, order);

    let value = match data_type {
        DataType::U16 => Value::U16(raw as u16),
        DataType::I16 => Value::I16(raw as u16 as i16),
        DataType::U32 => Value::U32(raw as u32),
        DataType::I32 => Value::I32(raw as u32 as i32),
        DataType::F32 => Value::F32(f32::from_bits(raw as u32)),
        DataType::U64 => Value::U64(raw),
        DataType::I64 => Value::I64(raw as i64),
        DataType::F64 => Value::F64(f64::from_bits(raw)),
    };

    Ok(value)
}

/// Concatenate registers into one integer, most significant register first.
fn assemble(words: &[u16], order: WordOrder) -> u64 {
    let push = |acc: u64, w: &u16| (acc << 16) | u64::from(*w);
    match order {
        WordOrder::Big => words.iter().fold(0, push),
        WordOrder::Little => words.iter().rev().fold(0, push),
    }
}
