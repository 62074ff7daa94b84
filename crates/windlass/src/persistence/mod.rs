//! Persistence: the pipeline, the manager, and the store contract

pub mod manager;
pub mod memory;
pub mod pipeline;
pub mod store;
pub mod values;

pub use manager::{ManagerState, PersistenceManager, SaveOperation};
pub use memory::InMemoryInstanceStore;
pub use pipeline::{
    DependentClone, PersistenceError, PersistenceModule, PersistencePipeline, Transaction,
};
pub use store::{
    DefinitionIdentity, IdentityFilter, InstanceHandle, InstanceStore, InstanceView,
    SaveWorkflowCommand, StoreError,
};
pub use values::{keys, InstanceValue, PersistedValues, ValueOptions, WorkflowStatus};
