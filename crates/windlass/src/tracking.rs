//! Tracking records and the participant sink
//!
//! The scheduler buffers records during a turn; the host flushes the
//! buffer to registered participants before idle is observable, before
//! persistence, and at completion. The sink itself is an external
//! collaborator behind [`TrackingParticipant`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::runtime::instance::InstanceId;
use crate::tree::ActivityId;

/// Well-known record state names
pub mod states {
    pub const STARTED: &str = "started";
    pub const SCHEDULED: &str = "scheduled";
    pub const EXECUTING: &str = "executing";
    pub const CLOSED: &str = "closed";
    pub const CANCELED: &str = "canceled";
    pub const FAULTED: &str = "faulted";
    pub const COMPLETED: &str = "completed";
    pub const TERMINATED: &str = "terminated";
    pub const ABORTED: &str = "aborted";
    pub const UNLOADED: &str = "unloaded";
    pub const IDLE: &str = "idle";
    pub const PERSISTED: &str = "persisted";
}

/// One emitted tracking record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrackingRecord {
    /// Workflow-level state change
    WorkflowInstance {
        /// One of [`states`]
        state: String,
    },

    /// Activity-instance state change
    ActivityState {
        /// Display name of the activity
        display_name: String,

        /// Definition id
        activity: ActivityId,

        /// Invocation id
        instance: InstanceId,

        /// One of [`states`]
        state: String,
    },

    /// A bookmark was resumed
    BookmarkResumption {
        /// Bookmark name or anonymous id rendering
        bookmark: String,

        /// Owning invocation
        owner: InstanceId,
    },
}

impl TrackingRecord {
    /// Workflow-level record
    pub fn workflow(state: &str) -> Self {
        Self::WorkflowInstance {
            state: state.to_string(),
        }
    }

    /// Activity-instance record
    pub fn activity(
        display_name: impl Into<String>,
        activity: ActivityId,
        instance: InstanceId,
        state: &str,
    ) -> Self {
        Self::ActivityState {
            display_name: display_name.into(),
            activity,
            instance,
            state: state.to_string(),
        }
    }

    /// Bookmark-resumption record
    pub fn bookmark(bookmark: impl Into<String>, owner: InstanceId) -> Self {
        Self::BookmarkResumption {
            bookmark: bookmark.into(),
            owner,
        }
    }
}

/// A tracking sink
///
/// Participants receive whole batches at flush points. A participant
/// that stalls past the host's tracking timeout surfaces a timeout to
/// the operation that required the flush.
#[async_trait]
pub trait TrackingParticipant: Send + Sync + 'static {
    /// Receive a flushed batch, in emission order
    async fn track(&self, records: &[TrackingRecord]) -> anyhow::Result<()>;
}
