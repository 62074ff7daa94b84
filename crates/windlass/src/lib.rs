//! # Windlass
//!
//! A durable workflow runtime: hosts load a declarative tree of
//! activities, schedule their execution cooperatively, let them suspend
//! on named bookmarks, persist instance state to an external store, and
//! resume instances later, possibly in another process.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkflowHost                          │
//! │  (serializes free-threaded operations, raises events)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Executor                             │
//! │  (single-threaded scheduler: instances, bookmarks, faults)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │               PersistenceManager / InstanceStore            │
//! │  (snapshot saves, lock ownership, load and resume)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Definitions pass through the caching walk
//! ([`tree::walker::cache_root`]) exactly once per root: ids are
//! assigned, arguments and variables are validated and slotted, and the
//! resulting [`tree::ActivityTree`] is immutable from then on.
//!
//! ## Example
//!
//! ```ignore
//! use windlass::prelude::*;
//!
//! let host = WorkflowHost::builder(my_root_activity())
//!     .store(Arc::new(InMemoryInstanceStore::new()))
//!     .build();
//!
//! host.on_completed(|info| println!("done: {}", info.state))?;
//! host.run().await?;
//! host.resume_bookmark("approval", json!({"approved": true})).await?;
//! ```

pub mod activity;
pub mod host;
pub mod persistence;
pub mod runtime;
pub mod tracking;
pub mod tree;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{
        Activity, ActivityCore, ActivityDelegate, ActivityMetadata, ActivityRef, Argument,
        ArgumentReference, ArgumentValue, CompletedChild, Constraint, DelegateParam, Direction,
        Literal, Variable, VariableReference, VariableValue,
    };
    pub use crate::host::handlers::{
        CompletedInfo, PersistableIdleAction, UnhandledExceptionAction, UnhandledExceptionInfo,
    };
    pub use crate::host::{HostBuilder, HostConfig, HostError, HostState, WorkflowHost};
    pub use crate::persistence::{
        DefinitionIdentity, IdentityFilter, InMemoryInstanceStore, InstanceStore,
        PersistenceModule, WorkflowStatus,
    };
    pub use crate::runtime::{
        ActivityContext, ActivityFailure, Bookmark, BookmarkInfo, BookmarkOptions,
        BookmarkResumptionResult, InstanceId, InstanceState, ValueKind,
    };
    pub use crate::tracking::{TrackingParticipant, TrackingRecord};
    pub use crate::tree::walker::{cache_root, CacheOptions};
    pub use crate::tree::{ActivityId, ActivityTree};
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityCore, ActivityMetadata, ActivityRef};
pub use host::{HostBuilder, HostConfig, HostError, HostState, WorkflowHost};
pub use persistence::{InMemoryInstanceStore, InstanceStore, PersistenceModule};
pub use runtime::{
    ActivityContext, ActivityFailure, Bookmark, BookmarkResumptionResult, InstanceState, ValueKind,
};
pub use tree::{ActivityId, ActivityTree};
