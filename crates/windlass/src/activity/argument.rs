//! Runtime arguments: typed, directional bindings on an activity

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::runtime::environment::EnvSlot;
use crate::runtime::location::ValueKind;

use super::ActivityRef;

/// Data flow direction of an argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Value flows into the activity
    In,

    /// Activity writes a result outward
    Out,

    /// Both directions through one location
    InOut,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::In => write!(f, "in"),
            Self::Out => write!(f, "out"),
            Self::InOut => write!(f, "in_out"),
        }
    }
}

/// A declared runtime argument
///
/// Held by the activity author and registered through
/// `ActivityMetadata::add_argument` during the caching walk. Creating an
/// argument with no bound expression is legal (an empty binding); the
/// runtime then mints a fresh location for it.
///
/// After a successful walk the argument carries the environment slot it
/// resolves to at runtime.
pub struct Argument {
    name: String,
    direction: Direction,
    kind: ValueKind,
    expression: Option<ActivityRef>,
    slot: Mutex<Option<EnvSlot>>,
}

impl Argument {
    /// Declare an In argument
    pub fn input(name: impl Into<String>, kind: ValueKind) -> Self {
        Self::new(name, Direction::In, kind)
    }

    /// Declare an Out argument
    pub fn output(name: impl Into<String>, kind: ValueKind) -> Self {
        Self::new(name, Direction::Out, kind)
    }

    /// Declare an InOut argument
    pub fn in_out(name: impl Into<String>, kind: ValueKind) -> Self {
        Self::new(name, Direction::InOut, kind)
    }

    fn new(name: impl Into<String>, direction: Direction, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            direction,
            kind,
            expression: None,
            slot: Mutex::new(None),
        }
    }

    /// Bind an expression to this argument
    ///
    /// For In arguments the expression produces the value; for Out/InOut
    /// arguments it must be a location expression naming the cell to
    /// write through.
    pub fn bind(mut self, expression: ActivityRef) -> Self {
        self.expression = Some(expression);
        self
    }

    /// Argument name, unique within the declaring activity
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Data flow direction
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Value kind of the bound location
    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// The bound expression, if any
    pub fn expression(&self) -> Option<&ActivityRef> {
        self.expression.as_ref()
    }

    /// Environment slot assigned by the walker
    pub fn slot(&self) -> Option<EnvSlot> {
        *self.slot.lock()
    }

    pub(crate) fn set_slot(&self, slot: EnvSlot) {
        *self.slot.lock() = Some(slot);
    }
}

impl std::fmt::Debug for Argument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Argument")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("kind", &self.kind)
            .field("bound", &self.expression.is_some())
            .field("slot", &*self.slot.lock())
            .finish()
    }
}

/// Shared handle to an argument declaration
pub type ArgumentHandle = Arc<Argument>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::expressions::Literal;
    use crate::tree::ActivityId;
    use serde_json::json;

    #[test]
    fn test_empty_binding_is_legal() {
        let arg = Argument::input("Input", ValueKind::Integer);
        assert!(arg.expression().is_none());
        assert_eq!(arg.direction(), Direction::In);
        assert!(arg.slot().is_none());
    }

    #[test]
    fn test_bound_argument() {
        let arg = Argument::input("Input", ValueKind::Integer)
            .bind(Arc::new(Literal::new("seven", json!(7))));
        assert!(arg.expression().is_some());
    }

    #[test]
    fn test_slot_stamping() {
        let arg = Argument::output("Result", ValueKind::String);
        let slot = EnvSlot {
            owner: ActivityId::new(3),
            index: 1,
        };
        arg.set_slot(slot);
        assert_eq!(arg.slot(), Some(slot));
    }
}
