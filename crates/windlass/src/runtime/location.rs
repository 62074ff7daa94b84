//! Typed storage cells

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::instance::InstanceId;

/// Runtime type descriptor for values flowing through locations
///
/// Generic activity signatures are erased to a kind plus a boxed
/// `serde_json::Value`; kind checks happen at bind time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// Matches any value
    #[default]
    Any,

    /// Boolean
    Bool,

    /// Integer number
    Integer,

    /// Floating-point number
    Float,

    /// UTF-8 string
    String,

    /// JSON object
    Object,

    /// JSON array
    Array,
}

impl ValueKind {
    /// Infer the kind of a concrete value
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Any,
            Value::Bool(_) => Self::Bool,
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::Integer,
            Value::Number(_) => Self::Float,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
        }
    }

    /// Whether a concrete value is storable in a location of this kind
    ///
    /// `Null` is the empty value and is accepted everywhere.
    pub fn accepts(&self, value: &Value) -> bool {
        if value.is_null() {
            return true;
        }
        match self {
            Self::Any => true,
            Self::Float => matches!(ValueKind::of(value), Self::Float | Self::Integer),
            kind => ValueKind::of(value) == *kind,
        }
    }

    /// Bind-time compatibility between a producer and a consumer kind
    pub fn is_compatible_with(&self, other: &ValueKind) -> bool {
        matches!(
            (self, other),
            (Self::Any, _) | (_, Self::Any) | (Self::Integer, Self::Float)
        ) || self == other
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Any => "any",
            Self::Bool => "bool",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::String => "string",
            Self::Object => "object",
            Self::Array => "array",
        };
        write!(f, "{name}")
    }
}

/// Reference to a location slot in another instance's environment
///
/// Cross-environment links are ids, never pointers, so the whole runtime
/// state stays serializable and back-references never own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRef {
    /// Instance whose environment owns the slot
    pub instance: InstanceId,

    /// Slot index within that environment
    pub slot: u32,
}

/// A mutable, typed storage cell
///
/// Out/InOut arguments whose producer handed back an intermediate
/// reference alias another cell instead of holding a value; reads and
/// writes follow the alias through the instance map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    /// Kind of values this cell stores
    pub kind: ValueKind,

    /// Current value (ignored while `alias` is set)
    pub value: Value,

    /// Forwarding target for reference-bound arguments
    pub alias: Option<LocationRef>,

    /// Minted during temporary resolution
    pub is_temporary: bool,

    /// Buffer gets until the temporary collapses
    pub buffer_gets_on_collapse: bool,
}

impl Location {
    /// Create an empty cell of the given kind
    pub fn new(kind: ValueKind) -> Self {
        Self {
            kind,
            value: Value::Null,
            alias: None,
            is_temporary: false,
            buffer_gets_on_collapse: false,
        }
    }

    /// Create a cell holding an initial value
    pub fn with_value(kind: ValueKind, value: Value) -> Self {
        Self {
            kind,
            value,
            alias: None,
            is_temporary: false,
            buffer_gets_on_collapse: false,
        }
    }

    /// Create a cell forwarding to another location
    pub fn alias_to(kind: ValueKind, target: LocationRef) -> Self {
        Self {
            kind,
            value: Value::Null,
            alias: Some(target),
            is_temporary: false,
            buffer_gets_on_collapse: false,
        }
    }

    /// Mark as a temporary minted during out/inout resolution
    pub fn temporary(mut self) -> Self {
        self.is_temporary = true;
        self.buffer_gets_on_collapse = true;
        self
    }
}
