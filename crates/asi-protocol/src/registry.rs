//! The signal registry.
//!
//! Signals are kept in registration order and that order is the signal index
//! on the wire. Hosts cache symbol lists by index, so the registry only ever
//! appends; [`SignalRegistry::clear`] is the one operation that shrinks it.

use crate::error::{ProtocolError, ProtocolResult};
use crate::types::{SignalType, SignalValue};

type Reader<T> = Box<dyn Fn() -> T + Send + Sync>;

/// A typed accessor for a value owned by the embedding application.
///
/// The type of a signal is fixed by the variant, so a binding can never be
/// read back as a different type. Closures usually capture a shared cell
/// (`Arc<AtomicU32>`, a lock, ...) holding the live value.
pub enum SignalBinding {
    /// Reads a `bool`.
    Bool(Reader<bool>),
    /// Reads a `byte`.
    Byte(Reader<u8>),
    /// Reads a `short`.
    Short(Reader<i16>),
    /// Reads a 16-bit `int`.
    Int(Reader<i16>),
    /// Reads a 16-bit `unsigned int`.
    UnsignedInt(Reader<u16>),
    /// Reads a 32-bit `long`.
    Long(Reader<i32>),
    /// Reads a 32-bit `unsigned long`.
    UnsignedLong(Reader<u32>),
    /// Reads a `float`.
    Float(Reader<f32>),
    /// Reads a `double`.
    Double(Reader<f64>),
}

impl SignalBinding {
    /// Bind a `bool` signal.
    pub fn bool(f: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        SignalBinding::Bool(Box::new(f))
    }

    /// Bind a `byte` signal.
    pub fn byte(f: impl Fn() -> u8 + Send + Sync + 'static) -> Self {
        SignalBinding::Byte(Box::new(f))
    }

    /// Bind a `short` signal.
    pub fn short(f: impl Fn() -> i16 + Send + Sync + 'static) -> Self {
        SignalBinding::Short(Box::new(f))
    }

    /// Bind an `int` signal.
    pub fn int(f: impl Fn() -> i16 + Send + Sync + 'static) -> Self {
        SignalBinding::Int(Box::new(f))
    }

    /// Bind an `unsigned int` signal.
    pub fn unsigned_int(f: impl Fn() -> u16 + Send + Sync + 'static) -> Self {
        SignalBinding::UnsignedInt(Box::new(f))
    }

    /// Bind a `long` signal.
    pub fn long(f: impl Fn() -> i32 + Send + Sync + 'static) -> Self {
        SignalBinding::Long(Box::new(f))
    }

    /// Bind an `unsigned long` signal.
    pub fn unsigned_long(f: impl Fn() -> u32 + Send + Sync + 'static) -> Self {
        SignalBinding::UnsignedLong(Box::new(f))
    }

    /// Bind a `float` signal.
    pub fn float(f: impl Fn() -> f32 + Send + Sync + 'static) -> Self {
        SignalBinding::Float(Box::new(f))
    }

    /// Bind a `double` signal.
    pub fn double(f: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        SignalBinding::Double(Box::new(f))
    }

    /// Bind a signal of type `ty` to a numeric source, converting on read.
    ///
    /// Integer conversions saturate at the bounds of the target type.
    pub fn from_f64_source(ty: SignalType, source: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        match ty {
            SignalType::Bool => Self::bool(move || source() != 0.0),
            SignalType::Byte => Self::byte(move || source() as u8),
            SignalType::Short => Self::short(move || source() as i16),
            SignalType::Int => Self::int(move || source() as i16),
            SignalType::UnsignedInt => Self::unsigned_int(move || source() as u16),
            SignalType::Long => Self::long(move || source() as i32),
            SignalType::UnsignedLong => Self::unsigned_long(move || source() as u32),
            SignalType::Float => Self::float(move || source() as f32),
            SignalType::Double => Self::double(source),
        }
    }

    /// The type this binding produces.
    pub fn signal_type(&self) -> SignalType {
        match self {
            SignalBinding::Bool(_) => SignalType::Bool,
            SignalBinding::Byte(_) => SignalType::Byte,
            SignalBinding::Short(_) => SignalType::Short,
            SignalBinding::Int(_) => SignalType::Int,
            SignalBinding::UnsignedInt(_) => SignalType::UnsignedInt,
            SignalBinding::Long(_) => SignalType::Long,
            SignalBinding::UnsignedLong(_) => SignalType::UnsignedLong,
            SignalBinding::Float(_) => SignalType::Float,
            SignalBinding::Double(_) => SignalType::Double,
        }
    }

    /// Read the current value.
    pub fn read(&self) -> SignalValue {
        match self {
            SignalBinding::Bool(f) => SignalValue::Bool(f()),
            SignalBinding::Byte(f) => SignalValue::Byte(f()),
            SignalBinding::Short(f) => SignalValue::Short(f()),
            SignalBinding::Int(f) => SignalValue::Int(f()),
            SignalBinding::UnsignedInt(f) => SignalValue::UnsignedInt(f()),
            SignalBinding::Long(f) => SignalValue::Long(f()),
            SignalBinding::UnsignedLong(f) => SignalValue::UnsignedLong(f()),
            SignalBinding::Float(f) => SignalValue::Float(f()),
            SignalBinding::Double(f) => SignalValue::Double(f()),
        }
    }
}

impl std::fmt::Debug for SignalBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SignalBinding::{}", self.signal_type())
    }
}

/// A registered signal.
#[derive(Debug)]
pub struct Signal {
    name: String,
    binding: SignalBinding,
}

impl Signal {
    /// Name as it appears on the wire, prefix included.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type fixed at registration.
    pub fn signal_type(&self) -> SignalType {
        self.binding.signal_type()
    }

    /// Read the current value from the binding.
    pub fn read(&self) -> SignalValue {
        self.binding.read()
    }
}

/// Ordered, fixed-capacity list of signals.
#[derive(Debug)]
pub struct SignalRegistry {
    signals: Vec<Signal>,
    capacity: usize,
    name_prefix: String,
}

impl SignalRegistry {
    /// Largest capacity addressable by the 16-bit index on the wire.
    pub const MAX_CAPACITY: usize = u16::MAX as usize + 1;

    /// Create a registry holding at most `capacity` signals.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(Self::MAX_CAPACITY);
        SignalRegistry {
            signals: Vec::with_capacity(capacity),
            capacity,
            name_prefix: String::new(),
        }
    }

    /// Prefix every name registered from now on, e.g. `S5_`.
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Append a signal and return its index.
    pub fn register(&mut self, name: &str, binding: SignalBinding) -> ProtocolResult<usize> {
        if self.signals.len() >= self.capacity {
            return Err(ProtocolError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        if name.bytes().any(|b| matches!(b, 0x00 | b'\r' | b'\n')) {
            return Err(ProtocolError::InvalidSignalName(name.to_string()));
        }

        let index = self.signals.len();
        self.signals.push(Signal {
            name: format!("{}{}", self.name_prefix, name),
            binding,
        });
        Ok(index)
    }

    /// Drop every signal. Indices restart at zero.
    pub fn clear(&mut self) {
        self.signals.clear();
    }

    /// Signal at `index`.
    pub fn get(&self, index: usize) -> ProtocolResult<&Signal> {
        self.signals.get(index).ok_or(ProtocolError::IndexOutOfRange {
            index,
            count: self.signals.len(),
        })
    }

    /// Number of registered signals.
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    /// Whether no signal is registered.
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// Maximum number of signals.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Signals in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Signal> {
        self.signals.iter()
    }
}
