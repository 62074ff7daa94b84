//! Live activity invocations

use serde::{Deserialize, Serialize};

use crate::tree::ActivityId;

use super::environment::LocationEnvironment;
use super::location::LocationRef;

/// Serialized id of an activity instance
///
/// Assigned monotonically by the instance map; never collides within a
/// map and survives persistence round-trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(u64);

impl InstanceId {
    /// Wrap a raw id (1-based)
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw id value
    pub fn get(&self) -> u64 {
        self.0
    }

    pub(crate) fn index(&self) -> usize {
        (self.0 - 1) as usize
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution substate of an instance, from creation to its body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Substate {
    /// Registered, nothing resolved yet
    Created,

    /// Ready to execute without resolution (no symbols of its own)
    Initialized,

    /// Argument resolution in progress
    ResolvingArguments,

    /// Variable resolution in progress
    ResolvingVariables,

    /// Resolution done, body not yet entered
    PreExecuting,

    /// Body entered
    Executing,

    /// Cancellation in progress
    Canceling,
}

/// Terminal progression of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Still live
    Executing,

    /// Completed cleanly
    Closed,

    /// Completed after observing cancellation
    Canceled,

    /// Completed with a fault
    Faulted,
}

impl InstanceState {
    /// Whether the instance has completed
    pub fn is_completed(&self) -> bool {
        !matches!(self, Self::Executing)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Executing => write!(f, "executing"),
            Self::Closed => write!(f, "closed"),
            Self::Canceled => write!(f, "canceled"),
            Self::Faulted => write!(f, "faulted"),
        }
    }
}

/// What happens when this instance completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Continuation {
    /// The root: completion finishes the workflow
    Root,

    /// Notify the parent's completion callback
    NotifyParent,

    /// Resume the parent's argument resolution at the given index
    ResumeArguments { next: usize },

    /// Resume the parent's variable resolution at the given index
    ResumeVariables { next: usize },
}

/// One live invocation of an activity
///
/// Everything here is ids and plain data; the whole struct serializes
/// into the executor snapshot at quiescence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityInstance {
    /// Serialized id
    pub id: InstanceId,

    /// Definition id in the cached tree
    pub activity: ActivityId,

    /// Parent invocation
    pub parent: Option<InstanceId>,

    /// Live children, scheduling order
    pub children: Vec<InstanceId>,

    /// Execution substate
    pub substate: Substate,

    /// Terminal progression
    pub state: InstanceState,

    /// Outstanding work items, cancelation contexts, and blocking
    /// bookmarks; the instance never completes while this is non-zero
    pub busy_count: u32,

    /// Blocking bookmarks owned by this instance
    pub blocking_bookmark_count: u32,

    /// Cancellation was requested (at most once)
    pub cancel_requested: bool,

    /// Default cancellation is draining this instance
    pub performing_default_cancelation: bool,

    /// The instance observed cancellation and will close as Canceled
    pub marked_canceled: bool,

    /// The body has been entered
    pub has_executed: bool,

    /// Own environment; `None` when the parent's is shared
    pub environment: Option<LocationEnvironment>,

    /// Where this instance's result lands, if it produces one
    pub result_location: Option<LocationRef>,

    /// What completion does
    pub completion_continuation: Continuation,

    /// Reserved completion-bookmark reference
    pub completion_bookmark: Option<u64>,

    /// Reserved fault-bookmark reference
    pub fault_bookmark: Option<u64>,
}

impl ActivityInstance {
    /// Create a fresh instance in `Created`
    pub fn new(
        id: InstanceId,
        activity: ActivityId,
        parent: Option<InstanceId>,
        continuation: Continuation,
    ) -> Self {
        Self {
            id,
            activity,
            parent,
            children: vec![],
            substate: Substate::Created,
            state: InstanceState::Executing,
            busy_count: 0,
            blocking_bookmark_count: 0,
            cancel_requested: false,
            performing_default_cancelation: false,
            marked_canceled: false,
            has_executed: false,
            environment: None,
            result_location: None,
            completion_continuation: continuation,
            completion_bookmark: None,
            fault_bookmark: None,
        }
    }

    /// Whether the instance has reached a terminal state
    pub fn is_completed(&self) -> bool {
        self.state.is_completed()
    }

    /// Request cancellation; returns false when already requested
    pub fn request_cancel(&mut self) -> bool {
        if self.cancel_requested {
            return false;
        }
        self.cancel_requested = true;
        true
    }

    pub(crate) fn increment_busy(&mut self) {
        self.busy_count += 1;
    }

    pub(crate) fn decrement_busy(&mut self) {
        debug_assert!(self.busy_count > 0, "busy count underflow");
        self.busy_count = self.busy_count.saturating_sub(1);
    }

    pub(crate) fn add_bookmark(&mut self, blocking: bool) {
        if blocking {
            self.blocking_bookmark_count += 1;
            self.increment_busy();
        }
    }

    pub(crate) fn remove_bookmark(&mut self, blocking: bool) {
        if blocking {
            debug_assert!(self.blocking_bookmark_count > 0);
            self.blocking_bookmark_count = self.blocking_bookmark_count.saturating_sub(1);
            self.decrement_busy();
        }
    }

    /// Whether only blocking bookmarks keep this instance busy
    pub fn only_bookmarks_remain(&self) -> bool {
        self.busy_count == self.blocking_bookmark_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> ActivityInstance {
        ActivityInstance::new(
            InstanceId::new(1),
            ActivityId::new(1),
            None,
            Continuation::Root,
        )
    }

    #[test]
    fn test_cancel_requested_once() {
        let mut inst = instance();
        assert!(inst.request_cancel());
        assert!(!inst.request_cancel());
        assert!(inst.cancel_requested);
    }

    #[test]
    fn test_bookmark_accounting() {
        let mut inst = instance();
        inst.add_bookmark(true);
        inst.add_bookmark(false);

        assert_eq!(inst.blocking_bookmark_count, 1);
        assert_eq!(inst.busy_count, 1);
        assert!(inst.only_bookmarks_remain());

        inst.remove_bookmark(true);
        assert_eq!(inst.busy_count, 0);
        assert_eq!(inst.blocking_bookmark_count, 0);
    }

    #[test]
    fn test_blocking_bookmarks_bounded_by_busy() {
        let mut inst = instance();
        inst.increment_busy();
        inst.add_bookmark(true);
        assert!(inst.blocking_bookmark_count <= inst.busy_count);
        assert!(!inst.only_bookmarks_remain());
    }

    #[test]
    fn test_state_roundtrip() {
        let inst = instance();
        let round: ActivityInstance =
            serde_json::from_str(&serde_json::to_string(&inst).unwrap()).unwrap();
        assert_eq!(round.id, inst.id);
        assert_eq!(round.substate, Substate::Created);
        assert_eq!(round.state, InstanceState::Executing);
    }
}
