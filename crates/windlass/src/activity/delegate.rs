//! Activity delegates: callable sub-trees with their own parameters

use std::sync::Arc;

use parking_lot::Mutex;

use crate::runtime::environment::EnvSlot;
use crate::runtime::location::ValueKind;

use super::argument::Direction;
use super::ActivityRef;

/// A parameter declared by a delegate
///
/// Delegate parameters behave like variables scoped to the handler: when
/// the delegate is scheduled, the caller's values are declared into the
/// handler instance's environment under these slots.
pub struct DelegateParam {
    name: String,
    direction: Direction,
    kind: ValueKind,
    slot: Mutex<Option<EnvSlot>>,
}

impl DelegateParam {
    /// Declare an In parameter
    pub fn input(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            direction: Direction::In,
            kind,
            slot: Mutex::new(None),
        }
    }

    /// Declare an Out parameter
    pub fn output(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Out,
            kind,
            slot: Mutex::new(None),
        }
    }

    /// Parameter name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Data flow direction
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Value kind
    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Environment slot assigned by the walker
    pub fn slot(&self) -> Option<EnvSlot> {
        *self.slot.lock()
    }

    pub(crate) fn set_slot(&self, slot: EnvSlot) {
        *self.slot.lock() = Some(slot);
    }
}

impl std::fmt::Debug for DelegateParam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegateParam")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("kind", &self.kind)
            .finish()
    }
}

/// A delegate: an optional handler activity plus bound parameters
///
/// Delegates register through one of the three metadata collections
/// (public, imported, implementation), mirroring child registration.
pub struct ActivityDelegate {
    display_name: String,
    handler: Option<ActivityRef>,
    params: Vec<Arc<DelegateParam>>,
}

impl ActivityDelegate {
    /// Create a delegate with no handler
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            handler: None,
            params: vec![],
        }
    }

    /// Set the handler activity
    pub fn with_handler(mut self, handler: ActivityRef) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Add a parameter
    pub fn with_param(mut self, param: Arc<DelegateParam>) -> Self {
        self.params.push(param);
        self
    }

    /// Display name
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Handler activity, if any
    pub fn handler(&self) -> Option<&ActivityRef> {
        self.handler.as_ref()
    }

    /// Declared parameters, in order
    pub fn params(&self) -> &[Arc<DelegateParam>] {
        &self.params
    }
}

impl std::fmt::Debug for ActivityDelegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityDelegate")
            .field("display_name", &self.display_name)
            .field("has_handler", &self.handler.is_some())
            .field("params", &self.params.len())
            .finish()
    }
}

/// Which metadata collection a delegate was registered into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegateCollection {
    Public,
    Imported,
    Implementation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delegate_without_handler() {
        let delegate = ActivityDelegate::new("OnFault");
        assert!(delegate.handler().is_none());
        assert_eq!(delegate.display_name(), "OnFault");
    }

    #[test]
    fn test_params_ordered() {
        let delegate = ActivityDelegate::new("Body")
            .with_param(Arc::new(DelegateParam::input("item", ValueKind::Any)))
            .with_param(Arc::new(DelegateParam::input("index", ValueKind::Integer)));

        let names: Vec<_> = delegate.params().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["item", "index"]);
    }
}
