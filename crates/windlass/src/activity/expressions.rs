//! Minimal expression activities
//!
//! Expressions are ordinary activities with a result slot. This module
//! carries just enough of them to express argument bindings and variable
//! defaults; anything richer is an external concern.

use serde_json::Value;

use crate::runtime::context::ActivityContext;
use crate::runtime::fault::ActivityFailure;
use crate::runtime::location::ValueKind;

use super::metadata::ActivityMetadata;
use super::variable::VariableHandle;
use super::{Activity, ActivityCore};

/// A constant value
///
/// Resolves synchronously through the fast path, so binding a literal
/// never costs a scheduler round-trip.
pub struct Literal {
    core: ActivityCore,
    value: Value,
}

impl Literal {
    pub fn new(display_name: impl Into<String>, value: Value) -> Self {
        Self {
            core: ActivityCore::new(display_name),
            value,
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

impl Activity for Literal {
    fn core(&self) -> &ActivityCore {
        &self.core
    }

    fn cache_metadata(&self, meta: &mut ActivityMetadata) {
        meta.set_result_kind(ValueKind::of(&self.value));
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), ActivityFailure> {
        ctx.set_result(self.value.clone())
    }

    fn try_populate(&self) -> Option<Value> {
        Some(self.value.clone())
    }
}

/// Reads a variable from the enclosing scope
pub struct VariableValue {
    core: ActivityCore,
    variable: VariableHandle,
}

impl VariableValue {
    pub fn new(display_name: impl Into<String>, variable: VariableHandle) -> Self {
        Self {
            core: ActivityCore::new(display_name),
            variable,
        }
    }
}

impl Activity for VariableValue {
    fn core(&self) -> &ActivityCore {
        &self.core
    }

    fn cache_metadata(&self, meta: &mut ActivityMetadata) {
        meta.set_result_kind(self.variable.kind());
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), ActivityFailure> {
        let value = ctx.variable_value(&self.variable)?;
        ctx.set_result(value)
    }
}

/// Produces the location of a variable, for Out/InOut bindings
pub struct VariableReference {
    core: ActivityCore,
    variable: VariableHandle,
}

impl VariableReference {
    pub fn new(display_name: impl Into<String>, variable: VariableHandle) -> Self {
        Self {
            core: ActivityCore::new(display_name),
            variable,
        }
    }
}

impl Activity for VariableReference {
    fn core(&self) -> &ActivityCore {
        &self.core
    }

    fn cache_metadata(&self, meta: &mut ActivityMetadata) {
        meta.set_result_kind(self.variable.kind());
    }

    fn execute(&self, _ctx: &mut ActivityContext<'_>) -> Result<(), ActivityFailure> {
        // Location bindings collapse at resolution time; nothing runs.
        Ok(())
    }

    fn referenced_variable(&self) -> Option<&VariableHandle> {
        Some(&self.variable)
    }

    fn is_location_expression(&self) -> bool {
        true
    }
}

/// Reads a named argument from the enclosing scope
pub struct ArgumentValue {
    core: ActivityCore,
    name: String,
}

impl ArgumentValue {
    pub fn new(display_name: impl Into<String>, argument_name: impl Into<String>) -> Self {
        Self {
            core: ActivityCore::new(display_name),
            name: argument_name.into(),
        }
    }
}

impl Activity for ArgumentValue {
    fn core(&self) -> &ActivityCore {
        &self.core
    }

    fn cache_metadata(&self, meta: &mut ActivityMetadata) {
        meta.set_result_kind(ValueKind::Any);
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), ActivityFailure> {
        let value = ctx.resolved_reference_value()?;
        ctx.set_result(value)
    }

    fn referenced_argument(&self) -> Option<&str> {
        Some(&self.name)
    }
}

/// Produces the location of a named argument in the enclosing scope
///
/// This is the reference-argument form: binding it to an Out/InOut
/// argument writes the producer's result straight through to the
/// enclosing argument's cell.
pub struct ArgumentReference {
    core: ActivityCore,
    name: String,
}

impl ArgumentReference {
    pub fn new(display_name: impl Into<String>, argument_name: impl Into<String>) -> Self {
        Self {
            core: ActivityCore::new(display_name),
            name: argument_name.into(),
        }
    }
}

impl Activity for ArgumentReference {
    fn core(&self) -> &ActivityCore {
        &self.core
    }

    fn cache_metadata(&self, meta: &mut ActivityMetadata) {
        meta.set_result_kind(ValueKind::Any);
    }

    fn execute(&self, _ctx: &mut ActivityContext<'_>) -> Result<(), ActivityFailure> {
        Ok(())
    }

    fn referenced_argument(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn is_location_expression(&self) -> bool {
        true
    }
}
