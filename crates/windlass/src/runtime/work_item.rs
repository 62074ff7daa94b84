//! Scheduler work items

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::activity::CompletedChild;

use super::bookmark::Bookmark;
use super::instance::{Continuation, InstanceId};

/// One unit of scheduler work
///
/// Work items drain FIFO; each runs against a single owning instance
/// whose busy count covers the item from enqueue to completion. The
/// argument-resolution continuation rides on completion callbacks so a
/// resolution that went asynchronous picks up at the next index.
///
/// Everything here is ids and plain data, so a paused queue persists
/// with the rest of the executor snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkItem {
    /// Drive an instance through resolution into its body
    ExecuteBody { instance: InstanceId },

    /// A child completed; dispatch the parent's continuation
    CompletionCallback {
        parent: InstanceId,
        child: CompletedChild,
        continuation: Continuation,
    },

    /// Deliver a resumed bookmark's value to its owner
    BookmarkCallback {
        owner: InstanceId,
        bookmark: Bookmark,
        value: Value,
    },

    /// Deliver a cancellation request to an instance
    CancelActivity { instance: InstanceId },
}

impl WorkItem {
    /// The instance whose busy count covers this item
    pub fn owner(&self) -> InstanceId {
        match self {
            Self::ExecuteBody { instance } => *instance,
            Self::CompletionCallback { parent, .. } => *parent,
            Self::BookmarkCallback { owner, .. } => *owner,
            Self::CancelActivity { instance } => *instance,
        }
    }
}
