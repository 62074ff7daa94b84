//! Runtime variables: named storage declared into a scope

use std::sync::Arc;

use parking_lot::Mutex;

use crate::runtime::environment::EnvSlot;
use crate::runtime::location::ValueKind;

use super::ActivityRef;

/// A declared variable
///
/// Public variables are visible to the declaring activity's consumers;
/// implementation variables only to its implementation children. Which
/// collection a variable lands in is decided at registration time
/// (`add_variable` vs `add_implementation_variable`).
pub struct Variable {
    name: Option<String>,
    kind: ValueKind,
    default: Option<ActivityRef>,
    mapped: bool,
    slot: Mutex<Option<EnvSlot>>,
}

impl Variable {
    /// Declare a named variable
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: Some(name.into()),
            kind,
            default: None,
            mapped: false,
            slot: Mutex::new(None),
        }
    }

    /// Declare an unnamed variable (reachable only through its handle)
    pub fn unnamed(kind: ValueKind) -> Self {
        Self {
            name: None,
            kind,
            default: None,
            mapped: false,
            slot: Mutex::new(None),
        }
    }

    /// Bind a default-value expression
    pub fn with_default(mut self, expression: ActivityRef) -> Self {
        self.default = Some(expression);
        self
    }

    /// Mark the variable for persistence under `VariablesPath/<name>`
    pub fn mapped(mut self) -> Self {
        self.mapped = true;
        self
    }

    /// Variable name, if any
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Value kind
    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Default expression, if any
    pub fn default(&self) -> Option<&ActivityRef> {
        self.default.as_ref()
    }

    /// Whether the variable persists under `VariablesPath/<name>`
    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    /// Environment slot assigned by the walker
    pub fn slot(&self) -> Option<EnvSlot> {
        *self.slot.lock()
    }

    pub(crate) fn set_slot(&self, slot: EnvSlot) {
        *self.slot.lock() = Some(slot);
    }
}

impl std::fmt::Debug for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Variable")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("has_default", &self.default.is_some())
            .field("mapped", &self.mapped)
            .field("slot", &*self.slot.lock())
            .finish()
    }
}

/// Shared handle to a variable declaration
pub type VariableHandle = Arc<Variable>;
