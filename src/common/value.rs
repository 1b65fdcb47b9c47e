//! Typed, versioned values stored in the DHT.

use bytes::Bytes;
use std::{
    collections::HashMap,
    fmt::{self, Debug, Display, Formatter},
};

use crate::common::messages::MessageError;

/// Maximum size of a single value payload. Values are length prefixed with a `u16`.
pub const MAX_VALUE_SIZE: usize = u16::MAX as usize;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Four character type tag of a value.
pub struct ValueType(pub u32);

impl ValueType {
    /// Matches any type in lookups.
    pub const ANY: ValueType = ValueType(0x2a2a_2a2a); // "****"
    pub const BINARY: ValueType = ValueType(0x4249_4e41); // "BINA"
    pub const TEXT: ValueType = ValueType(0x5445_5854); // "TEXT"
    pub const TEST: ValueType = ValueType(0x5445_5354); // "TEST"

    pub const fn from_tag(tag: [u8; 4]) -> ValueType {
        ValueType(u32::from_be_bytes(tag))
    }

    pub fn tag(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl Display for ValueType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.tag()))
    }
}

impl Debug for ValueType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ValueType({})", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const ZERO: Version = Version { major: 0, minor: 0 };

    pub fn new(major: u8, minor: u8) -> Self {
        Version { major, minor }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// An opaque value payload with its type and version.
pub struct DhtValue {
    value_type: ValueType,
    version: Version,
    bytes: Bytes,
}

impl DhtValue {
    pub fn new(value_type: ValueType, version: Version, bytes: impl Into<Bytes>) -> Self {
        DhtValue {
            value_type,
            version,
            bytes: bytes.into(),
        }
    }

    /// An empty value, storing it removes any existing value.
    pub fn empty() -> Self {
        DhtValue::new(ValueType::BINARY, Version::ZERO, Bytes::new())
    }

    // === Getters ===

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

/// Builds [DhtValue]s of one [ValueType] from their wire form.
pub trait ValueFactory: Debug + Send + Sync {
    fn create(
        &self,
        value_type: ValueType,
        version: Version,
        bytes: Bytes,
    ) -> Result<DhtValue, MessageError>;
}

#[derive(Debug, Clone, Copy, Default)]
/// Accepts any payload as is.
pub struct DefaultValueFactory;

impl ValueFactory for DefaultValueFactory {
    fn create(
        &self,
        value_type: ValueType,
        version: Version,
        bytes: Bytes,
    ) -> Result<DhtValue, MessageError> {
        Ok(DhtValue::new(value_type, version, bytes))
    }
}

#[derive(Debug, Clone, Copy, Default)]
/// Only accepts valid UTF-8 payloads.
pub struct TextValueFactory;

impl ValueFactory for TextValueFactory {
    fn create(
        &self,
        value_type: ValueType,
        version: Version,
        bytes: Bytes,
    ) -> Result<DhtValue, MessageError> {
        if std::str::from_utf8(&bytes).is_err() {
            return Err(MessageError::Malformed("text value is not valid utf-8"));
        }

        Ok(DhtValue::new(value_type, version, bytes))
    }
}

#[derive(Debug)]
/// Explicit registry of value factories by type, owned by the node that uses it.
pub struct ValueFactoryRegistry {
    factories: HashMap<ValueType, Box<dyn ValueFactory>>,
    default: Box<dyn ValueFactory>,
}

impl ValueFactoryRegistry {
    /// Registry with the [DefaultValueFactory] as fallback and no explicit entries.
    pub fn new() -> Self {
        ValueFactoryRegistry {
            factories: HashMap::new(),
            default: Box::new(DefaultValueFactory),
        }
    }

    /// Registers a factory for a value type, returning the one it replaced.
    pub fn register(
        &mut self,
        value_type: ValueType,
        factory: Box<dyn ValueFactory>,
    ) -> Option<Box<dyn ValueFactory>> {
        self.factories.insert(value_type, factory)
    }

    pub fn is_registered(&self, value_type: ValueType) -> bool {
        self.factories.contains_key(&value_type)
    }

    pub fn create(
        &self,
        value_type: ValueType,
        version: Version,
        bytes: Bytes,
    ) -> Result<DhtValue, MessageError> {
        self.factories
            .get(&value_type)
            .unwrap_or(&self.default)
            .create(value_type, version, bytes)
    }
}

impl Default for ValueFactoryRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(ValueType::TEXT, Box::new(TextValueFactory));
        registry
    }
}
