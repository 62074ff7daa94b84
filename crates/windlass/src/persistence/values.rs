//! The persisted record: named values with save options

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved and metadata key names
pub mod keys {
    /// Serialized executor snapshot; required in every save
    pub const WORKFLOW: &str = "Workflow";

    /// Workflow status at save time
    pub const STATUS: &str = "Status";

    /// Live bookmark descriptors (write-only)
    pub const BOOKMARKS: &str = "Bookmarks";

    /// UTC timestamp of the save (write-only)
    pub const LAST_UPDATE: &str = "LastUpdate";

    /// Serialized fault; present iff status is Faulted
    pub const EXCEPTION: &str = "Exception";

    /// Prefix for mapped variable values
    pub const VARIABLES_PATH: &str = "VariablesPath";

    /// Prefix for completed outputs
    pub const OUTPUT_PATH: &str = "OutputPath";

    /// Owner metadata: identifies this runtime
    pub const INSTANCE_TYPE: &str = "InstanceType";

    /// Owner metadata: versioned definition identity
    pub const DEFINITION_IDENTITY: &str = "DefinitionIdentity";

    /// Owner metadata: identity match policy
    pub const DEFINITION_IDENTITY_FILTER: &str = "DefinitionIdentityFilter";

    /// The constant stored under [`INSTANCE_TYPE`]
    pub const INSTANCE_TYPE_VALUE: &str = "windlass-workflow";

    /// Qualified key under a path prefix
    pub fn path(prefix: &str, name: &str) -> String {
        format!("{prefix}/{name}")
    }
}

/// Save options attached to a persisted value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueOptions {
    /// The value may be absent on load
    pub optional: bool,

    /// Written to the store but never read back
    pub write_only: bool,
}

/// One persisted value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceValue {
    /// The value itself
    pub value: Value,

    /// Save options
    pub options: ValueOptions,
}

impl InstanceValue {
    /// A required, readable value
    pub fn read_write(value: Value) -> Self {
        Self {
            value,
            options: ValueOptions::default(),
        }
    }

    /// An optional, write-only value
    pub fn write_only(value: Value) -> Self {
        Self {
            value,
            options: ValueOptions {
                optional: true,
                write_only: true,
            },
        }
    }

    /// An optional, readable value
    pub fn optional(value: Value) -> Self {
        Self {
            value,
            options: ValueOptions {
                optional: true,
                write_only: false,
            },
        }
    }
}

/// Ordered mapping from qualified names to persisted values
pub type PersistedValues = BTreeMap<String, InstanceValue>;

/// Workflow status written under [`keys::STATUS`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Saved while the scheduler still had runnable work
    Executing,

    /// Quiescent with resumable bookmarks
    Idle,

    /// Completed with a fault
    Faulted,

    /// Completed cleanly
    Closed,

    /// Completed after cancellation
    Canceled,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Executing => write!(f, "executing"),
            Self::Idle => write!(f, "idle"),
            Self::Faulted => write!(f, "faulted"),
            Self::Closed => write!(f, "closed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}
