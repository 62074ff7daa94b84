//! Activity definitions: composable, cacheable units of work

pub mod argument;
pub mod delegate;
pub mod expressions;
pub mod metadata;
pub mod variable;

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::runtime::bookmark::Bookmark;
use crate::runtime::context::ActivityContext;
use crate::runtime::fault::ActivityFailure;
use crate::runtime::instance::{InstanceId, InstanceState};
use crate::tree::ActivityId;

pub use argument::{Argument, ArgumentHandle, Direction};
pub use delegate::{ActivityDelegate, DelegateCollection, DelegateParam};
pub use expressions::{ArgumentReference, ArgumentValue, Literal, VariableReference, VariableValue};
pub use metadata::{ActivityMetadata, Constraint, ConstraintContext};
pub use variable::{Variable, VariableHandle};

/// Shared handle to an activity definition
pub type ActivityRef = Arc<dyn Activity>;

/// Association of an activity with the root that cached it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStamp {
    /// Sequence number of the owning root's caching walk
    pub root: u64,

    /// Id assigned within the root's id space
    pub id: ActivityId,
}

/// Identity cell embedded in every activity
///
/// Holds the display name and the cache stamp written by the tree
/// walker. The stamp is how the walker detects an activity already
/// associated with a different root.
pub struct ActivityCore {
    display_name: String,
    stamp: Mutex<Option<CacheStamp>>,
}

impl ActivityCore {
    /// Create a core with the given display name
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            stamp: Mutex::new(None),
        }
    }

    /// Display name of the activity
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Id assigned by the caching walk, if any
    pub fn id(&self) -> Option<ActivityId> {
        self.stamp.lock().map(|s| s.id)
    }

    /// Full cache stamp, if any
    pub fn stamp(&self) -> Option<CacheStamp> {
        *self.stamp.lock()
    }

    pub(crate) fn set_stamp(&self, stamp: CacheStamp) {
        *self.stamp.lock() = Some(stamp);
    }
}

impl std::fmt::Debug for ActivityCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityCore")
            .field("display_name", &self.display_name)
            .field("stamp", &*self.stamp.lock())
            .finish()
    }
}

/// Summary of a completed child invocation, handed to the parent
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CompletedChild {
    /// Serialized id of the completed invocation
    pub instance: InstanceId,

    /// Definition id of the completed activity
    pub activity: ActivityId,

    /// Display name of the completed activity
    pub display_name: String,

    /// Terminal state the child reached
    pub state: InstanceState,

    /// The child's result value, when it produced one
    pub result: Option<Value>,
}

/// A unit of work with typed inputs/outputs and child structure
///
/// Implementors embed an [`ActivityCore`], declare structure in
/// [`cache_metadata`](Activity::cache_metadata), and do their work in
/// [`execute`](Activity::execute). All scheduling callbacks dispatch back
/// through trait methods rather than stored closures, so a suspended
/// instance survives persistence and resumes in another process.
pub trait Activity: Send + Sync + 'static {
    /// The embedded identity cell
    fn core(&self) -> &ActivityCore;

    /// Declare children, arguments, variables, delegates, constraints
    ///
    /// Called once per caching walk. The declared structure is immutable
    /// afterwards.
    fn cache_metadata(&self, meta: &mut ActivityMetadata);

    /// Run the activity body
    ///
    /// The body runs cooperatively: schedule children, create bookmarks,
    /// or complete by returning. Errors become runtime faults surfaced
    /// through the host's unhandled-exception path.
    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), ActivityFailure>;

    /// React to a cancellation request
    ///
    /// The default performs default cancellation: mark the instance
    /// canceled and cascade the request to live children.
    fn cancel(&self, ctx: &mut ActivityContext<'_>) {
        ctx.default_cancel();
    }

    /// A scheduled child or delegate handler completed
    fn on_child_completed(
        &self,
        _ctx: &mut ActivityContext<'_>,
        _child: &CompletedChild,
    ) -> Result<(), ActivityFailure> {
        Ok(())
    }

    /// One of this activity's bookmarks was resumed
    fn on_bookmark_resumed(
        &self,
        _ctx: &mut ActivityContext<'_>,
        _bookmark: &Bookmark,
        _value: Value,
    ) -> Result<(), ActivityFailure> {
        Ok(())
    }

    /// Synchronous fast path for expression activities
    ///
    /// Returning `Some` lets argument and variable-default resolution
    /// complete without a scheduler round-trip.
    fn try_populate(&self) -> Option<Value> {
        None
    }

    /// Name of the enclosing-scope argument this expression reads or
    /// writes, for reference expressions
    fn referenced_argument(&self) -> Option<&str> {
        None
    }

    /// The variable whose location this expression produces, for
    /// variable-reference expressions
    fn referenced_variable(&self) -> Option<&variable::VariableHandle> {
        None
    }

    /// Whether this expression produces a location rather than a value
    ///
    /// Out/InOut argument bindings require a location expression.
    fn is_location_expression(&self) -> bool {
        false
    }
}
