//! The runtime: live instances, the scheduler, bookmarks, environments

pub mod bookmark;
pub mod context;
pub mod environment;
pub mod executor;
pub mod fault;
pub mod instance;
pub mod instance_map;
pub mod location;
pub mod work_item;

pub use bookmark::{
    Bookmark, BookmarkInfo, BookmarkManager, BookmarkOptions, BookmarkResumptionResult,
};
pub use context::ActivityContext;
pub use environment::{EnvSlot, LocationEnvironment};
pub use executor::{CompletionInfo, Executor, ExecutorSnapshot, PendingFault, RunOutcome};
pub use fault::{ActivityFailure, FaultSource};
pub use instance::{ActivityInstance, Continuation, InstanceId, InstanceState, Substate};
pub use instance_map::{InstanceMap, InstanceMapSnapshot};
pub use location::{Location, LocationRef, ValueKind};
pub use work_item::WorkItem;
