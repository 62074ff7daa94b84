//! Host event handlers
//!
//! All handlers are single-cast: assigning over an existing handler is
//! rejected; clear first to replace.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::runtime::bookmark::BookmarkInfo;
use crate::runtime::fault::ActivityFailure;
use crate::runtime::instance::InstanceState;

/// Payload of the Completed handler
#[derive(Debug, Clone)]
pub struct CompletedInfo {
    /// Closed, Canceled, or Faulted
    pub state: InstanceState,

    /// Root outputs, when the workflow closed
    pub outputs: BTreeMap<String, Value>,

    /// The fault, when the workflow faulted
    pub failure: Option<ActivityFailure>,
}

/// What the host does after PersistableIdle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistableIdleAction {
    /// Stay loaded, do nothing
    None,

    /// Persist and stay loaded
    Persist,

    /// Persist and unload
    Unload,
}

/// What the host does with an unhandled fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnhandledExceptionAction {
    /// Tear the instance down immediately
    Abort,

    /// Request cancellation and keep running
    Cancel,

    /// Complete the workflow as Faulted
    Terminate,

    /// Swallow the fault; the faulting subtree is already gone
    Ignore,
}

/// Payload of the UnhandledException handler
#[derive(Debug, Clone)]
pub struct UnhandledExceptionInfo {
    /// Display name of the faulting activity
    pub source_display_name: String,

    /// Global workflow instance id, when one has been allocated
    pub instance_id: Option<Uuid>,

    /// The failure, stamped with its source
    pub failure: ActivityFailure,
}

/// Errors from handler assignment
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Handlers are single-cast
    #[error("the {0} handler is already assigned")]
    AlreadyAssigned(&'static str),
}

type CompletedHandler = Arc<dyn Fn(&CompletedInfo) + Send + Sync>;
type IdleHandler = Arc<dyn Fn(&[BookmarkInfo]) + Send + Sync>;
type PersistableIdleHandler =
    Arc<dyn Fn(&[BookmarkInfo]) -> PersistableIdleAction + Send + Sync>;
type UnloadedHandler = Arc<dyn Fn() + Send + Sync>;
type AbortedHandler = Arc<dyn Fn(&str) + Send + Sync>;
type UnhandledExceptionHandler =
    Arc<dyn Fn(&UnhandledExceptionInfo) -> UnhandledExceptionAction + Send + Sync>;

/// The host's handler slots
#[derive(Default)]
pub struct HandlerTable {
    completed: Mutex<Option<CompletedHandler>>,
    idle: Mutex<Option<IdleHandler>>,
    persistable_idle: Mutex<Option<PersistableIdleHandler>>,
    unloaded: Mutex<Option<UnloadedHandler>>,
    aborted: Mutex<Option<AbortedHandler>>,
    unhandled_exception: Mutex<Option<UnhandledExceptionHandler>>,
}

macro_rules! handler_slot {
    ($set:ident, $clear:ident, $get:ident, $field:ident, $ty:ty, $name:literal) => {
        pub(crate) fn $set(&self, handler: $ty) -> Result<(), HandlerError> {
            let mut slot = self.$field.lock();
            if slot.is_some() {
                return Err(HandlerError::AlreadyAssigned($name));
            }
            *slot = Some(handler);
            Ok(())
        }

        #[allow(dead_code)]
        pub(crate) fn $clear(&self) {
            *self.$field.lock() = None;
        }

        pub(crate) fn $get(&self) -> Option<$ty> {
            self.$field.lock().clone()
        }
    };
}

impl HandlerTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    handler_slot!(set_completed, clear_completed, completed, completed, CompletedHandler, "completed");
    handler_slot!(set_idle, clear_idle, idle, idle, IdleHandler, "idle");
    handler_slot!(
        set_persistable_idle,
        clear_persistable_idle,
        persistable_idle,
        persistable_idle,
        PersistableIdleHandler,
        "persistable idle"
    );
    handler_slot!(set_unloaded, clear_unloaded, unloaded, unloaded, UnloadedHandler, "unloaded");
    handler_slot!(set_aborted, clear_aborted, aborted, aborted, AbortedHandler, "aborted");
    handler_slot!(
        set_unhandled_exception,
        clear_unhandled_exception,
        unhandled_exception,
        unhandled_exception,
        UnhandledExceptionHandler,
        "unhandled exception"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_assignment_rejected() {
        let table = HandlerTable::new();
        table.set_idle(Arc::new(|_| {})).unwrap();

        let err = table.set_idle(Arc::new(|_| {})).unwrap_err();
        assert!(matches!(err, HandlerError::AlreadyAssigned("idle")));
    }

    #[test]
    fn test_clear_then_reassign() {
        let table = HandlerTable::new();
        table.set_completed(Arc::new(|_| {})).unwrap();
        table.clear_completed();
        table.set_completed(Arc::new(|_| {})).unwrap();
    }

    #[test]
    fn test_get_returns_assigned() {
        let table = HandlerTable::new();
        assert!(table.unhandled_exception().is_none());

        table
            .set_unhandled_exception(Arc::new(|_| UnhandledExceptionAction::Cancel))
            .unwrap();
        let handler = table.unhandled_exception().unwrap();
        let info = UnhandledExceptionInfo {
            source_display_name: "X".into(),
            instance_id: None,
            failure: ActivityFailure::new("boom"),
        };
        assert_eq!(handler(&info), UnhandledExceptionAction::Cancel);
    }
}
