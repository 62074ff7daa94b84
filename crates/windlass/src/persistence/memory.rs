//! In-memory implementation of the instance store
//!
//! Implements the full contract, lock ownership included, so hosts and
//! tests exercise the same semantics an external driver provides.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::{
    InstanceHandle, InstanceStore, InstanceView, SaveWorkflowCommand, StoreError,
};
use super::values::PersistedValues;

#[allow(dead_code)] // Fields stored for inspection/future use
struct OwnerRecord {
    metadata: PersistedValues,
    created_at: DateTime<Utc>,
}

struct StoredInstance {
    data: PersistedValues,
    metadata: PersistedValues,
    locked_by: Option<Uuid>,
    completed: bool,
    updated_at: DateTime<Utc>,
}

/// In-memory instance store
///
/// # Example
///
/// ```
/// use windlass::persistence::InMemoryInstanceStore;
///
/// let store = InMemoryInstanceStore::new();
/// ```
#[derive(Default)]
pub struct InMemoryInstanceStore {
    owners: RwLock<HashMap<Uuid, OwnerRecord>>,
    instances: RwLock<HashMap<Uuid, StoredInstance>>,
}

impl InMemoryInstanceStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of owners
    pub fn owner_count(&self) -> usize {
        self.owners.read().len()
    }

    /// Number of stored instances
    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    /// Stored data for an instance, for assertions in tests
    pub fn instance_data(&self, instance_id: Uuid) -> Option<PersistedValues> {
        self.instances.read().get(&instance_id).map(|i| i.data.clone())
    }

    /// Clear everything
    pub fn clear(&self) {
        self.owners.write().clear();
        self.instances.write().clear();
    }

    fn check_handle(&self, handle: &InstanceHandle) -> Result<(), StoreError> {
        if handle.is_freed() {
            return Err(StoreError::InvalidCommand("handle is freed".into()));
        }
        if !self.owners.read().contains_key(&handle.owner) {
            return Err(StoreError::OwnerNotFound(handle.owner));
        }
        Ok(())
    }

    fn view(instance_id: Uuid, stored: &StoredInstance, locked: bool) -> InstanceView {
        let instance_data: PersistedValues = stored
            .data
            .iter()
            .filter(|(_, v)| !v.options.write_only)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        InstanceView {
            instance_id,
            instance_data,
            instance_owner: stored.locked_by,
            is_bound_to_lock: locked,
        }
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn create_owner(
        &self,
        metadata: PersistedValues,
        _timeout: Duration,
    ) -> Result<Uuid, StoreError> {
        let owner_id = Uuid::now_v7();
        self.owners.write().insert(
            owner_id,
            OwnerRecord {
                metadata,
                created_at: Utc::now(),
            },
        );
        Ok(owner_id)
    }

    async fn delete_owner(
        &self,
        handle: &InstanceHandle,
        _timeout: Duration,
    ) -> Result<(), StoreError> {
        if handle.is_freed() {
            return Err(StoreError::InvalidCommand("handle is freed".into()));
        }
        let removed = self.owners.write().remove(&handle.owner);
        if removed.is_none() {
            return Err(StoreError::OwnerNotFound(handle.owner));
        }
        // Release every lock the owner held.
        for stored in self.instances.write().values_mut() {
            if stored.locked_by == Some(handle.owner) {
                stored.locked_by = None;
            }
        }
        Ok(())
    }

    async fn save_workflow(
        &self,
        handle: &InstanceHandle,
        command: SaveWorkflowCommand,
        _timeout: Duration,
    ) -> Result<(), StoreError> {
        self.check_handle(handle)?;
        let instance_id = handle
            .instance
            .ok_or_else(|| StoreError::InvalidCommand("handle is not bound to an instance".into()))?;

        let mut instances = self.instances.write();
        let stored = instances.entry(instance_id).or_insert_with(|| StoredInstance {
            data: PersistedValues::new(),
            metadata: PersistedValues::new(),
            locked_by: None,
            completed: false,
            updated_at: Utc::now(),
        });

        if let Some(holder) = stored.locked_by {
            if holder != handle.owner {
                return Err(StoreError::InstanceLockedByDifferentOwner(instance_id));
            }
        }
        if stored.completed {
            return Err(StoreError::InstanceCompleted(instance_id));
        }

        // Unlock-only saves carry no data; keep the stored record.
        if !command.instance_data.is_empty() {
            stored.data = command.instance_data;
        }
        stored
            .metadata
            .extend(command.instance_metadata_changes);
        stored.completed = command.complete;
        stored.locked_by = if command.unlock || command.complete {
            None
        } else {
            Some(handle.owner)
        };
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn load_workflow(
        &self,
        handle: &InstanceHandle,
        _timeout: Duration,
    ) -> Result<InstanceView, StoreError> {
        self.check_handle(handle)?;
        let instance_id = handle
            .instance
            .ok_or_else(|| StoreError::InvalidCommand("handle is not bound to an instance".into()))?;

        let mut instances = self.instances.write();
        let stored = instances
            .get_mut(&instance_id)
            .ok_or(StoreError::InstanceNotFound(instance_id))?;

        if stored.completed {
            return Err(StoreError::InstanceCompleted(instance_id));
        }
        if let Some(holder) = stored.locked_by {
            if holder != handle.owner {
                return Err(StoreError::InstanceLockedByDifferentOwner(instance_id));
            }
        }
        stored.locked_by = Some(handle.owner);
        Ok(Self::view(instance_id, stored, true))
    }

    async fn try_load_runnable_workflow(
        &self,
        handle: &InstanceHandle,
        _timeout: Duration,
    ) -> Result<Option<InstanceView>, StoreError> {
        self.check_handle(handle)?;

        let mut instances = self.instances.write();
        let mut candidates: Vec<(&Uuid, &StoredInstance)> = instances
            .iter()
            .filter(|(_, stored)| !stored.completed && stored.locked_by.is_none())
            .collect();
        candidates.sort_by_key(|(_, stored)| stored.updated_at);
        let Some(instance_id) = candidates.first().map(|(id, _)| **id) else {
            return Ok(None);
        };

        let stored = instances
            .get_mut(&instance_id)
            .ok_or(StoreError::InstanceNotFound(instance_id))?;
        stored.locked_by = Some(handle.owner);
        Ok(Some(Self::view(instance_id, stored, true)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::values::InstanceValue;
    use super::*;
    use serde_json::json;

    const T: Duration = Duration::from_secs(5);

    async fn owner_handle(store: &InMemoryInstanceStore, instance: Option<Uuid>) -> InstanceHandle {
        let owner = store.create_owner(PersistedValues::new(), T).await.unwrap();
        InstanceHandle::new(owner, instance)
    }

    fn sample_data() -> PersistedValues {
        let mut data = PersistedValues::new();
        data.insert("Workflow".into(), InstanceValue::read_write(json!({"x": 1})));
        data.insert("Bookmarks".into(), InstanceValue::write_only(json!(["k"])));
        data
    }

    #[tokio::test]
    async fn test_save_then_load_filters_write_only() {
        let store = InMemoryInstanceStore::new();
        let instance_id = Uuid::now_v7();
        let handle = owner_handle(&store, Some(instance_id)).await;

        store
            .save_workflow(
                &handle,
                SaveWorkflowCommand {
                    instance_data: sample_data(),
                    instance_metadata_changes: PersistedValues::new(),
                    unlock: true,
                    complete: false,
                },
                T,
            )
            .await
            .unwrap();

        let view = store.load_workflow(&handle, T).await.unwrap();
        assert!(view.instance_data.contains_key("Workflow"));
        assert!(!view.instance_data.contains_key("Bookmarks"));
        assert!(view.is_bound_to_lock);
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let store = InMemoryInstanceStore::new();
        let instance_id = Uuid::now_v7();
        let first = owner_handle(&store, Some(instance_id)).await;

        // First owner saves without unlocking.
        store
            .save_workflow(
                &first,
                SaveWorkflowCommand {
                    instance_data: sample_data(),
                    instance_metadata_changes: PersistedValues::new(),
                    unlock: false,
                    complete: false,
                },
                T,
            )
            .await
            .unwrap();

        let second = owner_handle(&store, Some(instance_id)).await;
        let err = store.load_workflow(&second, T).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InstanceLockedByDifferentOwner(_)
        ));
    }

    #[tokio::test]
    async fn test_completed_instance_rejects_load() {
        let store = InMemoryInstanceStore::new();
        let instance_id = Uuid::now_v7();
        let handle = owner_handle(&store, Some(instance_id)).await;

        store
            .save_workflow(
                &handle,
                SaveWorkflowCommand {
                    instance_data: sample_data(),
                    instance_metadata_changes: PersistedValues::new(),
                    unlock: false,
                    complete: true,
                },
                T,
            )
            .await
            .unwrap();

        let err = store.load_workflow(&handle, T).await.unwrap_err();
        assert!(matches!(err, StoreError::InstanceCompleted(_)));
    }

    #[tokio::test]
    async fn test_try_load_runnable_picks_unlocked() {
        let store = InMemoryInstanceStore::new();
        let instance_id = Uuid::now_v7();
        let saver = owner_handle(&store, Some(instance_id)).await;

        store
            .save_workflow(
                &saver,
                SaveWorkflowCommand {
                    instance_data: sample_data(),
                    instance_metadata_changes: PersistedValues::new(),
                    unlock: true,
                    complete: false,
                },
                T,
            )
            .await
            .unwrap();

        let loader = owner_handle(&store, None).await;
        let view = store
            .try_load_runnable_workflow(&loader, T)
            .await
            .unwrap()
            .expect("should find runnable instance");
        assert_eq!(view.instance_id, instance_id);

        // The instance is now locked; a second query finds nothing.
        let another = owner_handle(&store, None).await;
        assert!(store
            .try_load_runnable_workflow(&another, T)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_freed_handle_rejected() {
        let store = InMemoryInstanceStore::new();
        let handle = owner_handle(&store, Some(Uuid::now_v7())).await;
        handle.free();

        let err = store.load_workflow(&handle, T).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidCommand(_)));
    }

    #[tokio::test]
    async fn test_delete_owner_releases_locks() {
        let store = InMemoryInstanceStore::new();
        let instance_id = Uuid::now_v7();
        let handle = owner_handle(&store, Some(instance_id)).await;

        store
            .save_workflow(
                &handle,
                SaveWorkflowCommand {
                    instance_data: sample_data(),
                    instance_metadata_changes: PersistedValues::new(),
                    unlock: false,
                    complete: false,
                },
                T,
            )
            .await
            .unwrap();

        store.delete_owner(&handle, T).await.unwrap();
        assert_eq!(store.owner_count(), 0);

        // Lock released; a new owner can pick the instance up.
        let fresh = owner_handle(&store, Some(instance_id)).await;
        let view = store.load_workflow(&fresh, T).await.unwrap();
        assert!(view.is_bound_to_lock);
    }
}
