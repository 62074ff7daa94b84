//! The persistence pipeline: Collect, Map, Save, Publish
//!
//! Modules plug extra state in and out of every save and load. The
//! pipeline runs stages in order across all modules and resolves abort
//! races through a barrier-guarded flag checked between module calls.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::store::StoreError;
use super::values::PersistedValues;

/// Errors from persistence operations
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Store-level failure; may be retryable
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The host aborted while the pipeline was mid-save
    #[error("persistence was canceled by abort")]
    Canceled,

    /// Fatal: the persisted record does not fit this runtime version
    #[error("persisted state version mismatch: {0}")]
    VersionMismatch(String),

    /// Fatal: the stored definition identity does not match
    #[error("definition identity mismatch: {0}")]
    IdentityMismatch(String),

    /// A persistence module failed
    #[error("persistence module error: {0}")]
    Module(#[source] anyhow::Error),

    /// The manager has no store handle yet
    #[error("the persistence manager is not initialized")]
    NotInitialized,

    /// The manager was aborted; the handle is freed
    #[error("the persistence manager is aborted")]
    Aborted,

    /// A required value was absent from the record
    #[error("persisted record is missing required value '{0}'")]
    MissingValue(String),

    /// The record could not be decoded
    #[error("persisted record is malformed: {0}")]
    Malformed(String),
}

impl PersistenceError {
    /// Whether the failed operation may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_retryable())
    }
}

/// An ambient transaction a save may run under
///
/// A save in progress holds a dependent clone; the transaction cannot
/// commit until every dependent completes.
#[derive(Debug)]
pub struct Transaction {
    id: Uuid,
    dependents: AtomicUsize,
    committed: AtomicBool,
}

impl Transaction {
    /// Open a transaction
    pub fn new() -> Self {
        Self {
            id: Uuid::now_v7(),
            dependents: AtomicUsize::new(0),
            committed: AtomicBool::new(false),
        }
    }

    /// Transaction id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Take a dependent clone that blocks commit while alive
    pub fn create_dependent(&self) -> DependentClone<'_> {
        self.dependents.fetch_add(1, Ordering::SeqCst);
        DependentClone { transaction: self }
    }

    /// Attempt to commit; fails while dependents are alive
    pub fn try_commit(&self) -> bool {
        if self.dependents.load(Ordering::SeqCst) > 0 {
            return false;
        }
        self.committed.store(true, Ordering::SeqCst);
        true
    }

    /// Whether the transaction committed
    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds a transaction open on behalf of an in-flight save
#[derive(Debug)]
pub struct DependentClone<'a> {
    transaction: &'a Transaction,
}

impl Drop for DependentClone<'_> {
    fn drop(&mut self) {
        self.transaction.dependents.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A pluggable participant in saves and loads
#[async_trait]
pub trait PersistenceModule: Send + Sync + 'static {
    /// Contribute values: `(read_write, write_only)`
    fn collect_values(&self) -> (PersistedValues, PersistedValues) {
        (PersistedValues::new(), PersistedValues::new())
    }

    /// Transform or augment the collected values
    fn map_values(&self, _values: &PersistedValues) -> PersistedValues {
        PersistedValues::new()
    }

    /// Whether this module's save must run under a transaction
    fn is_save_transaction_required(&self) -> bool {
        false
    }

    /// Whether this module's load must run under a transaction
    fn is_load_transaction_required(&self) -> bool {
        false
    }

    /// Write module state to its own back-end
    async fn save(
        &self,
        _values: &PersistedValues,
        _transaction: Option<&Transaction>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Notified after the store save commits
    async fn publish(&self, _values: &PersistedValues) -> anyhow::Result<()> {
        Ok(())
    }

    /// Claim recognized keys from a loaded record
    fn load(&self, _values: &PersistedValues) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Runs the module stages for one host
pub struct PersistencePipeline {
    modules: Vec<Arc<dyn PersistenceModule>>,
    aborted: AtomicBool,
}

impl PersistencePipeline {
    /// Create an empty pipeline
    pub fn new() -> Self {
        Self {
            modules: vec![],
            aborted: AtomicBool::new(false),
        }
    }

    /// Register a module
    pub fn add_module(&mut self, module: Arc<dyn PersistenceModule>) {
        self.modules.push(module);
    }

    /// Number of registered modules
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Abort the pipeline; in-flight saves return a cancellation
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    /// Whether the pipeline has been aborted
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Whether any module demands a save transaction
    pub fn is_save_transaction_required(&self) -> bool {
        self.modules.iter().any(|m| m.is_save_transaction_required())
    }

    /// Whether any module demands a load transaction
    pub fn is_load_transaction_required(&self) -> bool {
        self.modules.iter().any(|m| m.is_load_transaction_required())
    }

    /// Stage 1 and 2: collect module values onto `core`, then map
    pub fn collect_and_map(&self, mut core: PersistedValues) -> PersistedValues {
        for module in &self.modules {
            let (read_write, write_only) = module.collect_values();
            core.extend(read_write);
            for (key, mut value) in write_only {
                value.options.write_only = true;
                value.options.optional = true;
                core.insert(key, value);
            }
        }
        let mut mapped = PersistedValues::new();
        for module in &self.modules {
            mapped.extend(module.map_values(&core));
        }
        core.extend(mapped);
        core
    }

    /// Stage 3: module saves, with the abort race resolved between calls
    pub async fn save_all(
        &self,
        values: &PersistedValues,
        transaction: Option<&Transaction>,
    ) -> Result<(), PersistenceError> {
        for module in &self.modules {
            if self.is_aborted() {
                return Err(PersistenceError::Canceled);
            }
            module
                .save(values, transaction)
                .await
                .map_err(PersistenceError::Module)?;
        }
        Ok(())
    }

    /// Stage 4: notify modules after the store save committed
    pub async fn publish_all(&self, values: &PersistedValues) -> Result<(), PersistenceError> {
        for module in &self.modules {
            if self.is_aborted() {
                return Err(PersistenceError::Canceled);
            }
            module
                .publish(values)
                .await
                .map_err(PersistenceError::Module)?;
        }
        Ok(())
    }

    /// Load stage: modules claim keys they recognize
    pub fn load_all(&self, values: &PersistedValues) -> Result<(), PersistenceError> {
        for module in &self.modules {
            module.load(values).map_err(PersistenceError::Module)?;
        }
        Ok(())
    }
}

impl Default for PersistencePipeline {
    fn default() -> Self {
        Self::new()
    }
}
