//! The per-host façade over the external instance store
//!
//! Owns the store handle and the owner identity, and sequences
//! initialize, lock, save, load, unlock, and owner deletion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use super::pipeline::PersistenceError;
use super::store::{
    DefinitionIdentity, IdentityFilter, InstanceHandle, InstanceStore, InstanceView,
    SaveWorkflowCommand, StoreError,
};
use super::values::{keys, InstanceValue, PersistedValues};

/// Which kind of save is being issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOperation {
    /// Persist and keep the lock
    Save,

    /// Persist and release the lock
    Unload,

    /// Persist and mark the instance completed
    Complete,
}

/// Lifecycle of the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// No store handle yet
    Uninitialized,

    /// Handle bound to an owner; the instance may not be locked yet
    Initialized,

    /// The store granted exclusive access to the instance
    Locked,

    /// Handle freed; all further operations fail or no-op
    Aborted,
}

/// Store handle and ownership lifecycle for one host
pub struct PersistenceManager {
    store: Arc<dyn InstanceStore>,
    state: ManagerState,
    handle: Option<Arc<InstanceHandle>>,
    instance_id: Option<Uuid>,
    identity: Option<DefinitionIdentity>,
    identity_filter: IdentityFilter,
    aborted: AtomicBool,
}

impl PersistenceManager {
    /// Create an uninitialized manager over a store
    pub fn new(store: Arc<dyn InstanceStore>) -> Self {
        Self {
            store,
            state: ManagerState::Uninitialized,
            handle: None,
            instance_id: None,
            identity: None,
            identity_filter: IdentityFilter::default(),
            aborted: AtomicBool::new(false),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ManagerState {
        self.state
    }

    /// The global instance id, allocated lazily on first observation
    pub fn instance_id(&mut self) -> Uuid {
        *self.instance_id.get_or_insert_with(Uuid::now_v7)
    }

    /// Bind to an existing instance id (load paths)
    pub fn bind_instance(&mut self, instance_id: Uuid) {
        self.instance_id = Some(instance_id);
    }

    /// The definition identity saved with the owner, if any
    pub fn identity(&self) -> Option<&DefinitionIdentity> {
        self.identity.as_ref()
    }

    /// Create the owner and allocate the real instance handle
    pub async fn initialize(
        &mut self,
        identity: Option<DefinitionIdentity>,
        identity_filter: IdentityFilter,
        timeout: Duration,
    ) -> Result<(), PersistenceError> {
        if self.aborted.load(Ordering::SeqCst) {
            return Err(PersistenceError::Aborted);
        }
        if self.state != ManagerState::Uninitialized {
            return Ok(());
        }

        let mut metadata = PersistedValues::new();
        metadata.insert(
            keys::INSTANCE_TYPE.to_string(),
            InstanceValue::read_write(json!(keys::INSTANCE_TYPE_VALUE)),
        );
        if let Some(identity) = &identity {
            metadata.insert(
                keys::DEFINITION_IDENTITY.to_string(),
                InstanceValue::read_write(serde_json::to_value(identity).map_err(|e| {
                    PersistenceError::Malformed(e.to_string())
                })?),
            );
            metadata.insert(
                keys::DEFINITION_IDENTITY_FILTER.to_string(),
                InstanceValue::read_write(serde_json::to_value(identity_filter).map_err(
                    |e| PersistenceError::Malformed(e.to_string()),
                )?),
            );
        }

        let owner = self.guarded(self.store.create_owner(metadata, timeout), timeout).await?;
        let instance_id = self.instance_id();
        let handle = Arc::new(InstanceHandle::new(owner, Some(instance_id)));

        // Abort may race handle creation across threads; the freed
        // handle wins.
        if self.aborted.load(Ordering::SeqCst) {
            handle.free();
            return Err(PersistenceError::Aborted);
        }

        debug!(%owner, %instance_id, "persistence manager initialized");
        self.handle = Some(handle);
        self.identity = identity;
        self.identity_filter = identity_filter;
        self.state = ManagerState::Initialized;
        Ok(())
    }

    /// Perform the initial metadata-only save, taking the lock
    pub async fn ensure_readiness(&mut self, timeout: Duration) -> Result<(), PersistenceError> {
        match self.state {
            ManagerState::Locked => return Ok(()),
            ManagerState::Uninitialized => return Err(PersistenceError::NotInitialized),
            ManagerState::Aborted => return Err(PersistenceError::Aborted),
            ManagerState::Initialized => {}
        }
        let handle = self.require_handle()?;
        let command = SaveWorkflowCommand {
            instance_data: PersistedValues::new(),
            instance_metadata_changes: self.instance_metadata(),
            unlock: false,
            complete: false,
        };
        self.guarded(self.store.save_workflow(&handle, command, timeout), timeout)
            .await?;
        self.state = ManagerState::Locked;
        Ok(())
    }

    /// Write current state
    pub async fn save(
        &mut self,
        values: PersistedValues,
        operation: SaveOperation,
        timeout: Duration,
    ) -> Result<(), PersistenceError> {
        self.ensure_readiness(timeout).await?;
        let handle = self.require_handle()?;
        let command = SaveWorkflowCommand {
            instance_data: values,
            instance_metadata_changes: PersistedValues::new(),
            unlock: matches!(operation, SaveOperation::Unload),
            complete: matches!(operation, SaveOperation::Complete),
        };
        self.guarded(self.store.save_workflow(&handle, command, timeout), timeout)
            .await?;
        if !matches!(operation, SaveOperation::Save) {
            self.state = ManagerState::Initialized;
        }
        Ok(())
    }

    /// Read the bound instance, taking the lock
    pub async fn load(&mut self, timeout: Duration) -> Result<InstanceView, PersistenceError> {
        let handle = self.require_handle()?;
        let view = self
            .guarded(self.store.load_workflow(&handle, timeout), timeout)
            .await?;
        if view.is_bound_to_lock {
            self.state = ManagerState::Locked;
        }
        Ok(view)
    }

    /// Pick up any runnable instance for the owner
    pub async fn try_load_runnable(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<InstanceView>, PersistenceError> {
        let handle = self.require_handle()?;
        let view = self
            .guarded(self.store.try_load_runnable_workflow(&handle, timeout), timeout)
            .await?;
        if let Some(view) = &view {
            // Rebind the handle to the instance the store picked.
            self.instance_id = Some(view.instance_id);
            self.handle = Some(Arc::new(InstanceHandle::new(
                handle.owner,
                Some(view.instance_id),
            )));
            self.state = ManagerState::Locked;
        }
        Ok(view)
    }

    /// Release the lock without writing instance data
    pub async fn unlock(&mut self, timeout: Duration) -> Result<(), PersistenceError> {
        if self.state != ManagerState::Locked {
            return Ok(());
        }
        let handle = self.require_handle()?;
        let command = SaveWorkflowCommand {
            instance_data: PersistedValues::new(),
            instance_metadata_changes: PersistedValues::new(),
            unlock: true,
            complete: false,
        };
        self.guarded(self.store.save_workflow(&handle, command, timeout), timeout)
            .await?;
        self.state = ManagerState::Initialized;
        Ok(())
    }

    /// Remove the owner; best-effort
    pub async fn delete_owner(&mut self, timeout: Duration) {
        let Some(handle) = self.handle.clone() else {
            return;
        };
        match self
            .guarded(self.store.delete_owner(&handle, timeout), timeout)
            .await
        {
            Ok(()) => {}
            Err(PersistenceError::Store(
                StoreError::InvalidCommand(_) | StoreError::OwnerNotFound(_) | StoreError::Timeout,
            )) => {}
            Err(e) => {
                warn!("delete owner failed: {e}");
            }
        }
    }

    /// Free the handle; all further operations fail fast
    pub fn abort(&mut self) {
        self.aborted.store(true, Ordering::SeqCst);
        if let Some(handle) = &self.handle {
            handle.free();
        }
        self.state = ManagerState::Aborted;
    }

    fn instance_metadata(&self) -> PersistedValues {
        let mut metadata = PersistedValues::new();
        metadata.insert(
            keys::INSTANCE_TYPE.to_string(),
            InstanceValue::read_write(json!(keys::INSTANCE_TYPE_VALUE)),
        );
        metadata
    }

    fn require_handle(&self) -> Result<Arc<InstanceHandle>, PersistenceError> {
        if self.state == ManagerState::Aborted || self.aborted.load(Ordering::SeqCst) {
            return Err(PersistenceError::Aborted);
        }
        let handle = self.handle.clone().ok_or(PersistenceError::NotInitialized)?;
        if handle.is_freed() {
            return Err(PersistenceError::Aborted);
        }
        Ok(handle)
    }

    async fn guarded<T>(
        &self,
        operation: impl std::future::Future<Output = Result<T, StoreError>>,
        timeout: Duration,
    ) -> Result<T, PersistenceError> {
        match tokio::time::timeout(timeout, operation).await {
            Ok(result) => result.map_err(PersistenceError::Store),
            Err(_) => Err(PersistenceError::Store(StoreError::Timeout)),
        }
    }
}
