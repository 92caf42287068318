//! Signal types and values.
//!
//! Widths follow the 8-bit target the protocol was defined on: `int` and
//! `unsigned int` are 16 bits, `long` and `unsigned long` are 32 bits. Values
//! go on the wire little-endian, which is the native order of every device
//! the protocol runs on.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};

/// The type of a registered signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    /// Boolean, one byte on the wire.
    Bool,
    /// Unsigned 8-bit integer.
    Byte,
    /// Signed 16-bit integer.
    Short,
    /// Signed 16-bit integer (the target's `int`).
    Int,
    /// Unsigned 16-bit integer.
    UnsignedInt,
    /// Signed 32-bit integer.
    Long,
    /// Unsigned 32-bit integer.
    UnsignedLong,
    /// IEEE 754 single precision.
    Float,
    /// IEEE 754 double precision.
    Double,
}

impl SignalType {
    /// All types in tag order.
    pub const ALL: [SignalType; 9] = [
        SignalType::Bool,
        SignalType::Byte,
        SignalType::Short,
        SignalType::Int,
        SignalType::UnsignedInt,
        SignalType::Long,
        SignalType::UnsignedLong,
        SignalType::Float,
        SignalType::Double,
    ];

    /// The type tag carried in symbol-list telegrams.
    pub const fn tag(self) -> u8 {
        match self {
            SignalType::Bool => 0x0,
            SignalType::Byte => 0x1,
            SignalType::Short => 0x2,
            SignalType::Int => 0x3,
            SignalType::UnsignedInt => 0x4,
            SignalType::Long => 0x5,
            SignalType::UnsignedLong => 0x6,
            SignalType::Float => 0x7,
            SignalType::Double => 0x8,
        }
    }

    /// Parse a type tag.
    pub fn from_tag(tag: u8) -> ProtocolResult<Self> {
        SignalType::ALL
            .get(tag as usize)
            .copied()
            .ok_or(ProtocolError::UnknownSignalType(tag))
    }

    /// Payload width of a value of this type in a data telegram.
    pub const fn width(self) -> usize {
        match self {
            SignalType::Bool | SignalType::Byte => 1,
            SignalType::Short | SignalType::Int | SignalType::UnsignedInt => 2,
            SignalType::Long | SignalType::UnsignedLong | SignalType::Float => 4,
            SignalType::Double => 8,
        }
    }

    /// Lowercase name used in logs and bench files.
    pub const fn as_str(self) -> &'static str {
        match self {
            SignalType::Bool => "bool",
            SignalType::Byte => "byte",
            SignalType::Short => "short",
            SignalType::Int => "int",
            SignalType::UnsignedInt => "unsigned_int",
            SignalType::Long => "long",
            SignalType::UnsignedLong => "unsigned_long",
            SignalType::Float => "float",
            SignalType::Double => "double",
        }
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A signal value read from its binding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalValue {
    /// A `bool` signal.
    Bool(bool),
    /// A `byte` signal.
    Byte(u8),
    /// A `short` signal.
    Short(i16),
    /// An `int` signal, 16 bits wide.
    Int(i16),
    /// An `unsigned int` signal, 16 bits wide.
    UnsignedInt(u16),
    /// A `long` signal, 32 bits wide.
    Long(i32),
    /// An `unsigned long` signal, 32 bits wide.
    UnsignedLong(u32),
    /// A `float` signal.
    Float(f32),
    /// A `double` signal.
    Double(f64),
}

impl SignalValue {
    /// The type of this value.
    pub const fn signal_type(&self) -> SignalType {
        match self {
            SignalValue::Bool(_) => SignalType::Bool,
            SignalValue::Byte(_) => SignalType::Byte,
            SignalValue::Short(_) => SignalType::Short,
            SignalValue::Int(_) => SignalType::Int,
            SignalValue::UnsignedInt(_) => SignalType::UnsignedInt,
            SignalValue::Long(_) => SignalType::Long,
            SignalValue::UnsignedLong(_) => SignalType::UnsignedLong,
            SignalValue::Float(_) => SignalType::Float,
            SignalValue::Double(_) => SignalType::Double,
        }
    }

    /// Encode into a stack buffer, returning the buffer and the used width.
    pub fn to_wire(&self) -> ([u8; 8], usize) {
        let mut buf = [0u8; 8];
        let width = self.signal_type().width();
        match *self {
            SignalValue::Bool(v) => buf[0] = v as u8,
            SignalValue::Byte(v) => buf[0] = v,
            SignalValue::Short(v) | SignalValue::Int(v) => buf[..2].copy_from_slice(&v.to_le_bytes()),
            SignalValue::UnsignedInt(v) => buf[..2].copy_from_slice(&v.to_le_bytes()),
            SignalValue::Long(v) => buf[..4].copy_from_slice(&v.to_le_bytes()),
            SignalValue::UnsignedLong(v) => buf[..4].copy_from_slice(&v.to_le_bytes()),
            SignalValue::Float(v) => buf[..4].copy_from_slice(&v.to_le_bytes()),
            SignalValue::Double(v) => buf.copy_from_slice(&v.to_le_bytes()),
        }
        (buf, width)
    }

    /// Decode a value of the given type from exactly `ty.width()` bytes.
    pub fn from_wire(ty: SignalType, bytes: &[u8]) -> ProtocolResult<Self> {
        if bytes.len() != ty.width() {
            return Err(ProtocolError::InvalidTelegram(format!(
                "{} value needs {} bytes, got {}",
                ty,
                ty.width(),
                bytes.len()
            )));
        }
        let value = match ty {
            SignalType::Bool => SignalValue::Bool(bytes[0] != 0),
            SignalType::Byte => SignalValue::Byte(bytes[0]),
            SignalType::Short => SignalValue::Short(i16::from_le_bytes([bytes[0], bytes[1]])),
            SignalType::Int => SignalValue::Int(i16::from_le_bytes([bytes[0], bytes[1]])),
            SignalType::UnsignedInt => {
                SignalValue::UnsignedInt(u16::from_le_bytes([bytes[0], bytes[1]]))
            }
            SignalType::Long => {
                SignalValue::Long(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            SignalType::UnsignedLong => SignalValue::UnsignedLong(u32::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ])),
            SignalType::Float => {
                SignalValue::Float(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            SignalType::Double => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                SignalValue::Double(f64::from_le_bytes(raw))
            }
        };
        Ok(value)
    }

    /// Convert to `f64`, for display and plotting.
    pub fn as_f64(&self) -> f64 {
        match *self {
            SignalValue::Bool(v) => v as u8 as f64,
            SignalValue::Byte(v) => v as f64,
            SignalValue::Short(v) | SignalValue::Int(v) => v as f64,
            SignalValue::UnsignedInt(v) => v as f64,
            SignalValue::Long(v) => v as f64,
            SignalValue::UnsignedLong(v) => v as f64,
            SignalValue::Float(v) => v as f64,
            SignalValue::Double(v) => v,
        }
    }
}
