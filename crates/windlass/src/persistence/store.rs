//! The instance store contract
//!
//! Concrete drivers live out-of-tree; the crate ships the command set,
//! the views they return, and an in-memory implementation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::values::PersistedValues;

/// Errors from store commands
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// No instance with this id
    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// No such owner
    #[error("owner not found: {0}")]
    OwnerNotFound(Uuid),

    /// Another owner holds the instance lock
    #[error("instance {0} is locked by a different owner")]
    InstanceLockedByDifferentOwner(Uuid),

    /// The instance already completed
    #[error("instance {0} has already completed")]
    InstanceCompleted(Uuid),

    /// The command was malformed for this store
    #[error("invalid store command: {0}")]
    InvalidCommand(String),

    /// Transient store failure; the command may be retried
    #[error("transient store error: {0}")]
    Transient(String),

    /// The command did not finish within its timeout
    #[error("store command timed out")]
    Timeout,
}

impl StoreError {
    /// Whether retrying the same command may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout)
    }
}

/// Versioned identity of a workflow definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionIdentity {
    /// Definition name
    pub name: String,

    /// Version string, if any
    pub version: Option<String>,

    /// Owning package, if any
    pub package: Option<String>,
}

impl DefinitionIdentity {
    /// Identity with just a name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            package: None,
        }
    }

    /// Set the version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Whether a stored identity satisfies `filter` against this one
    pub fn matches(&self, stored: &DefinitionIdentity, filter: IdentityFilter) -> bool {
        match filter {
            IdentityFilter::Any => true,
            IdentityFilter::Exact => self == stored,
            IdentityFilter::AnyRevision => {
                self.name == stored.name && self.package == stored.package
            }
        }
    }
}

impl std::fmt::Display for DefinitionIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(version) = &self.version {
            write!(f, "; {version}")?;
        }
        Ok(())
    }
}

/// How stored identities are matched on load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityFilter {
    /// Identities must match exactly
    #[default]
    Exact,

    /// Any identity is acceptable
    Any,

    /// Name and package must match; any revision is acceptable
    AnyRevision,
}

/// Handle binding an owner to an instance id
///
/// Freeing the handle is how abort wins races against in-flight store
/// commands: commands check the flag after acquiring their target.
#[derive(Debug)]
pub struct InstanceHandle {
    /// Handle id
    pub id: Uuid,

    /// Owner this handle acts for
    pub owner: Uuid,

    /// Instance this handle is bound to, if bound
    pub instance: Option<Uuid>,

    freed: AtomicBool,
}

impl InstanceHandle {
    /// Create a handle for an owner
    pub fn new(owner: Uuid, instance: Option<Uuid>) -> Self {
        Self {
            id: Uuid::now_v7(),
            owner,
            instance,
            freed: AtomicBool::new(false),
        }
    }

    /// Free the handle; subsequent commands on it fail
    pub fn free(&self) {
        self.freed.store(true, Ordering::SeqCst);
    }

    /// Whether the handle has been freed
    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::SeqCst)
    }
}

/// The view a load or save returns
#[derive(Debug, Clone)]
pub struct InstanceView {
    /// Instance id
    pub instance_id: Uuid,

    /// Readable persisted values (write-only values are filtered out)
    pub instance_data: PersistedValues,

    /// Owner currently associated with the instance
    pub instance_owner: Option<Uuid>,

    /// Whether this handle now holds the instance lock
    pub is_bound_to_lock: bool,
}

/// The save command
#[derive(Debug, Clone)]
pub struct SaveWorkflowCommand {
    /// Full instance data to write
    pub instance_data: PersistedValues,

    /// Metadata entries to merge
    pub instance_metadata_changes: PersistedValues,

    /// Release the lock after writing
    pub unlock: bool,

    /// Mark the instance completed
    pub complete: bool,
}

/// External instance store
///
/// Implementations must be thread-safe; every command carries a timeout
/// the driver is expected to honor.
#[async_trait]
pub trait InstanceStore: Send + Sync + 'static {
    /// Create an owner with the given metadata, returning its id
    async fn create_owner(
        &self,
        metadata: PersistedValues,
        timeout: Duration,
    ) -> Result<Uuid, StoreError>;

    /// Delete an owner and release everything it holds
    async fn delete_owner(
        &self,
        handle: &InstanceHandle,
        timeout: Duration,
    ) -> Result<(), StoreError>;

    /// Write instance state
    async fn save_workflow(
        &self,
        handle: &InstanceHandle,
        command: SaveWorkflowCommand,
        timeout: Duration,
    ) -> Result<(), StoreError>;

    /// Read instance state, taking the lock for this handle's owner
    async fn load_workflow(
        &self,
        handle: &InstanceHandle,
        timeout: Duration,
    ) -> Result<InstanceView, StoreError>;

    /// Pick up any runnable instance for this handle's owner
    async fn try_load_runnable_workflow(
        &self,
        handle: &InstanceHandle,
        timeout: Duration,
    ) -> Result<Option<InstanceView>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_filters() {
        let current = DefinitionIdentity::named("orders").with_version("2.0");
        let stored_v1 = DefinitionIdentity::named("orders").with_version("1.0");
        let other = DefinitionIdentity::named("billing").with_version("2.0");

        assert!(current.matches(&current.clone(), IdentityFilter::Exact));
        assert!(!current.matches(&stored_v1, IdentityFilter::Exact));
        assert!(current.matches(&stored_v1, IdentityFilter::AnyRevision));
        assert!(!current.matches(&other, IdentityFilter::AnyRevision));
        assert!(current.matches(&other, IdentityFilter::Any));
    }

    #[test]
    fn test_handle_free_is_sticky() {
        let handle = InstanceHandle::new(Uuid::now_v7(), None);
        assert!(!handle.is_freed());
        handle.free();
        assert!(handle.is_freed());
        handle.free();
        assert!(handle.is_freed());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(StoreError::Timeout.is_retryable());
        assert!(StoreError::Transient("connection reset".into()).is_retryable());
        assert!(!StoreError::InstanceCompleted(Uuid::now_v7()).is_retryable());
    }
}
