//! The workflow host
//!
//! Free-threaded callers on one side, a strictly single-threaded
//! scheduler on the other. The operation queue is the airlock: every
//! host operation enqueues, a single service pump drains the queue,
//! runs the scheduler, and raises events, and the scheduler is never
//! re-entered while running.

pub mod handlers;
pub mod operation;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::activity::{ActivityRef, Direction};
use crate::persistence::manager::{PersistenceManager, SaveOperation};
use crate::persistence::pipeline::{
    PersistenceError, PersistenceModule, PersistencePipeline, Transaction,
};
use crate::persistence::store::{DefinitionIdentity, IdentityFilter, InstanceStore};
use crate::persistence::values::{keys, InstanceValue, PersistedValues, WorkflowStatus};
use crate::runtime::bookmark::{Bookmark, BookmarkInfo, BookmarkResumptionResult};
use crate::runtime::executor::{Executor, ExecutorSnapshot, RunOutcome};
use crate::runtime::fault::ActivityFailure;
use crate::runtime::instance::InstanceState;
use crate::runtime::location::ValueKind;
use crate::tracking::TrackingParticipant;
use crate::tree::validation::ValidationFailure;
use crate::tree::walker::{cache_root, CacheOptions};

use handlers::{
    CompletedInfo, HandlerError, HandlerTable, PersistableIdleAction, UnhandledExceptionAction,
    UnhandledExceptionInfo,
};
use operation::{
    InstanceOperation, OperationKind, OperationOutcome, OperationResult, PendingQueue,
};

/// Host configuration
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Default timeout for host operation waits
    pub operation_timeout: Duration,

    /// Timeout for internal persistence operations (effectively
    /// unbounded by default)
    pub persist_timeout: Duration,

    /// Timeout for one tracking participant flush
    pub track_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30),
            persist_timeout: Duration::from_secs(60 * 60 * 24 * 365),
            track_timeout: Duration::from_secs(30),
        }
    }
}

impl HostConfig {
    /// Set the default operation timeout
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the internal persistence timeout
    pub fn with_persist_timeout(mut self, timeout: Duration) -> Self {
        self.persist_timeout = timeout;
        self
    }

    /// Set the tracking flush timeout
    pub fn with_track_timeout(mut self, timeout: Duration) -> Self {
        self.track_timeout = timeout;
        self
    }
}

/// Host lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// Constructed (or loaded); Run has not been requested
    Created,

    /// Run was requested; the scheduler advances at service points
    Runnable,

    /// The workflow reached a terminal state and Completed was raised
    Completed,

    /// The instance was persisted and unloaded
    Unloaded,

    /// The instance was aborted; operations fail fast
    Aborted,
}

/// Errors surfaced by host operations
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The definition failed the caching walk
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationFailure),

    /// The wait expired and the operation was removed unserviced
    #[error("the operation timed out")]
    Timeout,

    /// The workflow has already completed
    #[error("the workflow has already completed")]
    Completed,

    /// The instance was unloaded; load it again first
    #[error("the workflow instance is unloaded")]
    Unloaded,

    /// The instance was aborted
    #[error("the workflow instance was aborted: {reason}")]
    Aborted {
        /// Why the instance aborted
        reason: String,
    },

    /// Host operations cannot be issued from handler frames
    #[error("host operations cannot be issued from a handler")]
    OperationFromHandler,

    /// The operation needs a store and none is configured
    #[error("no instance store is configured")]
    NoInstanceStore,

    /// An input name does not match any root In argument
    #[error("unknown workflow input '{0}'")]
    UnknownInput(String),

    /// An input value does not fit the argument's kind
    #[error("workflow input '{name}' rejects value of kind {found}")]
    InputKindMismatch {
        /// Argument name
        name: String,
        /// Kind of the offered value
        found: ValueKind,
    },

    /// A tracking participant stalled past the tracking timeout
    #[error("tracking flush timed out")]
    TrackingTimeout,

    /// Persistence failed
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// The service pump dropped the operation without a result
    #[error("the operation channel closed unexpectedly")]
    ChannelClosed,
}

/// Builds a [`WorkflowHost`]
pub struct HostBuilder {
    definition: ActivityRef,
    inputs: BTreeMap<String, Value>,
    config: HostConfig,
    store: Option<Arc<dyn InstanceStore>>,
    identity: Option<DefinitionIdentity>,
    identity_filter: IdentityFilter,
    modules: Vec<Arc<dyn PersistenceModule>>,
    participants: Vec<Arc<dyn TrackingParticipant>>,
}

impl HostBuilder {
    /// Start building a host for a definition
    pub fn new(definition: ActivityRef) -> Self {
        Self {
            definition,
            inputs: BTreeMap::new(),
            config: HostConfig::default(),
            store: None,
            identity: None,
            identity_filter: IdentityFilter::default(),
            modules: vec![],
            participants: vec![],
        }
    }

    /// Add one workflow input
    pub fn input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    /// Replace the workflow inputs
    pub fn inputs(mut self, inputs: BTreeMap<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Set the host configuration
    pub fn config(mut self, config: HostConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach an instance store
    pub fn store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the definition identity and its match policy
    pub fn identity(mut self, identity: DefinitionIdentity, filter: IdentityFilter) -> Self {
        self.identity = Some(identity);
        self.identity_filter = filter;
        self
    }

    /// Register a persistence module
    pub fn module(mut self, module: Arc<dyn PersistenceModule>) -> Self {
        self.modules.push(module);
        self
    }

    /// Register a tracking participant
    pub fn participant(mut self, participant: Arc<dyn TrackingParticipant>) -> Self {
        self.participants.push(participant);
        self
    }

    /// Build a fresh host
    pub fn build(self) -> WorkflowHost {
        let mut pipeline = PersistencePipeline::new();
        for module in self.modules {
            pipeline.add_module(module);
        }
        WorkflowHost {
            shared: Arc::new(HostShared {
                definition: self.definition,
                inputs: self.inputs,
                config: self.config,
                identity: self.identity,
                identity_filter: self.identity_filter,
                store: self.store,
                pipeline: Arc::new(pipeline),
                participants: self.participants,
                handlers: HandlerTable::new(),
                core: Mutex::new(HostCore::new()),
                executor: Mutex::new(None),
                manager: AsyncMutex::new(None),
                pause_flag: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    /// Load a persisted instance by id
    pub async fn load(self, instance_id: Uuid) -> Result<WorkflowHost, HostError> {
        let store = self.store.clone().ok_or(HostError::NoInstanceStore)?;
        let mut manager = PersistenceManager::new(store);
        manager.bind_instance(instance_id);
        manager
            .initialize(
                self.identity.clone(),
                self.identity_filter,
                self.config.persist_timeout,
            )
            .await?;
        let view = manager.load(self.config.persist_timeout).await?;
        self.hydrate(manager, view.instance_id, view.instance_data)
    }

    /// Load any runnable instance for a fresh owner
    pub async fn load_runnable(self) -> Result<Option<WorkflowHost>, HostError> {
        let store = self.store.clone().ok_or(HostError::NoInstanceStore)?;
        let mut manager = PersistenceManager::new(store);
        manager
            .initialize(
                self.identity.clone(),
                self.identity_filter,
                self.config.persist_timeout,
            )
            .await?;
        let Some(view) = manager.try_load_runnable(self.config.persist_timeout).await? else {
            return Ok(None);
        };
        self.hydrate(manager, view.instance_id, view.instance_data)
            .map(Some)
    }

    fn hydrate(
        self,
        manager: PersistenceManager,
        instance_id: Uuid,
        values: PersistedValues,
    ) -> Result<WorkflowHost, HostError> {
        // Identity gate first: a mismatched definition must not touch
        // the record.
        if let (Some(current), Some(stored)) =
            (&self.identity, values.get(keys::DEFINITION_IDENTITY))
        {
            let stored: DefinitionIdentity = serde_json::from_value(stored.value.clone())
                .map_err(|e| PersistenceError::Malformed(e.to_string()))?;
            if !current.matches(&stored, self.identity_filter) {
                return Err(PersistenceError::IdentityMismatch(format!(
                    "loaded '{stored}', host has '{current}'"
                ))
                .into());
            }
        }

        let mut pipeline = PersistencePipeline::new();
        for module in &self.modules {
            pipeline.add_module(module.clone());
        }
        // Modules claim their keys before the tree is rehydrated.
        pipeline.load_all(&values)?;

        let blob = values
            .get(keys::WORKFLOW)
            .ok_or_else(|| PersistenceError::MissingValue(keys::WORKFLOW.to_string()))?;
        let snapshot: ExecutorSnapshot = serde_json::from_value(blob.value.clone())
            .map_err(|e| PersistenceError::Malformed(e.to_string()))?;

        let tree = Arc::new(cache_root(&self.definition, CacheOptions::default())?);
        let pause_flag = Arc::new(AtomicBool::new(false));
        let executor = Executor::restore(tree, snapshot, pause_flag.clone());

        let mut core = HostCore::new();
        core.initialized = true;
        core.instance_id = Some(instance_id);

        info!(%instance_id, "workflow instance loaded");
        Ok(WorkflowHost {
            shared: Arc::new(HostShared {
                definition: self.definition,
                inputs: self.inputs,
                config: self.config,
                identity: self.identity,
                identity_filter: self.identity_filter,
                store: self.store,
                pipeline: Arc::new(pipeline),
                participants: self.participants,
                handlers: HandlerTable::new(),
                core: Mutex::new(core),
                executor: Mutex::new(Some(executor)),
                manager: AsyncMutex::new(Some(manager)),
                pause_flag,
            }),
        })
    }
}

/// State under the host's single coarse lock
struct HostCore {
    state: HostState,
    initialized: bool,
    busy: bool,
    action_count: u64,
    pending_unenqueued: u32,
    pending: PendingQueue,
    has_raised_completed: bool,
    executed_since_idle: bool,
    handler_thread: Option<ThreadId>,
    abort_reason: Option<String>,
    instance_id: Option<Uuid>,
}

impl HostCore {
    fn new() -> Self {
        Self {
            state: HostState::Created,
            initialized: false,
            busy: false,
            action_count: 0,
            pending_unenqueued: 0,
            pending: PendingQueue::new(),
            has_raised_completed: false,
            executed_since_idle: false,
            handler_thread: None,
            abort_reason: None,
            instance_id: None,
        }
    }
}

struct HostShared {
    definition: ActivityRef,
    inputs: BTreeMap<String, Value>,
    config: HostConfig,
    identity: Option<DefinitionIdentity>,
    identity_filter: IdentityFilter,
    store: Option<Arc<dyn InstanceStore>>,
    pipeline: Arc<PersistencePipeline>,
    participants: Vec<Arc<dyn TrackingParticipant>>,
    handlers: HandlerTable,
    core: Mutex<HostCore>,
    // Touched only by the service pump while it holds `busy`.
    executor: Mutex<Option<Executor>>,
    manager: AsyncMutex<Option<PersistenceManager>>,
    pause_flag: Arc<AtomicBool>,
}

enum Decision {
    Operation(Arc<InstanceOperation>),
    RunScheduler,
    RaiseIdle(Vec<BookmarkInfo>),
    Done,
}

/// The host for one workflow instance
///
/// Cheap to clone; all clones drive the same instance.
///
/// # Example
///
/// ```ignore
/// let host = WorkflowHost::builder(root)
///     .store(Arc::new(InMemoryInstanceStore::new()))
///     .build();
/// host.on_completed(|info| println!("{:?}", info.state))?;
/// host.run().await?;
/// ```
#[derive(Clone)]
pub struct WorkflowHost {
    shared: Arc<HostShared>,
}

impl WorkflowHost {
    /// Host a definition with defaults
    pub fn new(definition: ActivityRef) -> Self {
        Self::builder(definition).build()
    }

    /// Start building a host
    pub fn builder(definition: ActivityRef) -> HostBuilder {
        HostBuilder::new(definition)
    }

    /// Current lifecycle state
    pub fn state(&self) -> HostState {
        self.shared.core.lock().state
    }

    /// Global instance id, once one has been allocated or loaded
    pub fn instance_id(&self) -> Option<Uuid> {
        self.shared.core.lock().instance_id
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    /// Assign the Completed handler
    pub fn on_completed(
        &self,
        handler: impl Fn(&CompletedInfo) + Send + Sync + 'static,
    ) -> Result<(), HandlerError> {
        self.shared.handlers.set_completed(Arc::new(handler))
    }

    /// Assign the Idle handler
    pub fn on_idle(
        &self,
        handler: impl Fn(&[BookmarkInfo]) + Send + Sync + 'static,
    ) -> Result<(), HandlerError> {
        self.shared.handlers.set_idle(Arc::new(handler))
    }

    /// Assign the PersistableIdle handler
    pub fn on_persistable_idle(
        &self,
        handler: impl Fn(&[BookmarkInfo]) -> PersistableIdleAction + Send + Sync + 'static,
    ) -> Result<(), HandlerError> {
        self.shared.handlers.set_persistable_idle(Arc::new(handler))
    }

    /// Assign the Unloaded handler
    pub fn on_unloaded(
        &self,
        handler: impl Fn() + Send + Sync + 'static,
    ) -> Result<(), HandlerError> {
        self.shared.handlers.set_unloaded(Arc::new(handler))
    }

    /// Assign the Aborted handler
    pub fn on_aborted(
        &self,
        handler: impl Fn(&str) + Send + Sync + 'static,
    ) -> Result<(), HandlerError> {
        self.shared.handlers.set_aborted(Arc::new(handler))
    }

    /// Assign the UnhandledException handler
    ///
    /// Without one, unhandled faults terminate the workflow.
    pub fn on_unhandled_exception(
        &self,
        handler: impl Fn(&UnhandledExceptionInfo) -> UnhandledExceptionAction + Send + Sync + 'static,
    ) -> Result<(), HandlerError> {
        self.shared
            .handlers
            .set_unhandled_exception(Arc::new(handler))
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Start or resume execution
    pub async fn run(&self) -> Result<(), HostError> {
        self.run_timeout(self.shared.config.operation_timeout).await
    }

    /// Start or resume execution, waiting at most `timeout`
    #[instrument(skip(self))]
    pub async fn run_timeout(&self, timeout: Duration) -> Result<(), HostError> {
        self.shared.submit(OperationKind::Run, timeout).await?;
        Ok(())
    }

    /// Request cancellation of the workflow
    pub async fn cancel(&self) -> Result<(), HostError> {
        self.cancel_timeout(self.shared.config.operation_timeout)
            .await
    }

    /// Request cancellation, waiting at most `timeout`
    #[instrument(skip(self))]
    pub async fn cancel_timeout(&self, timeout: Duration) -> Result<(), HostError> {
        self.shared.submit(OperationKind::Cancel, timeout).await?;
        Ok(())
    }

    /// Complete the workflow as Faulted with a reason
    pub async fn terminate(&self, reason: impl Into<String>) -> Result<(), HostError> {
        self.terminate_timeout(reason, self.shared.config.operation_timeout)
            .await
    }

    /// Terminate, waiting at most `timeout`
    pub async fn terminate_timeout(
        &self,
        reason: impl Into<String>,
        timeout: Duration,
    ) -> Result<(), HostError> {
        self.shared
            .submit(
                OperationKind::Terminate {
                    reason: reason.into(),
                },
                timeout,
            )
            .await?;
        Ok(())
    }

    /// Persist the instance at its next quiescent point
    pub async fn persist(&self) -> Result<(), HostError> {
        self.persist_timeout(self.shared.config.operation_timeout)
            .await
    }

    /// Persist, waiting at most `timeout`
    #[instrument(skip(self))]
    pub async fn persist_timeout(&self, timeout: Duration) -> Result<(), HostError> {
        self.shared.submit(OperationKind::Persist, timeout).await?;
        Ok(())
    }

    /// Persist and unload the instance at its next quiescent point
    pub async fn unload(&self) -> Result<(), HostError> {
        self.unload_timeout(self.shared.config.operation_timeout)
            .await
    }

    /// Unload, waiting at most `timeout`
    #[instrument(skip(self))]
    pub async fn unload_timeout(&self, timeout: Duration) -> Result<(), HostError> {
        self.shared.submit(OperationKind::Unload, timeout).await?;
        Ok(())
    }

    /// Deliver a value to a named bookmark
    pub async fn resume_bookmark(
        &self,
        name: impl Into<String>,
        value: Value,
    ) -> Result<BookmarkResumptionResult, HostError> {
        self.resume_bookmark_timeout(
            Bookmark::named(name),
            value,
            self.shared.config.operation_timeout,
        )
        .await
    }

    /// Deliver a value to a bookmark, waiting at most `timeout`
    #[instrument(skip(self, value))]
    pub async fn resume_bookmark_timeout(
        &self,
        bookmark: Bookmark,
        value: Value,
        timeout: Duration,
    ) -> Result<BookmarkResumptionResult, HostError> {
        let shared = &self.shared;
        // An implicit run may be needed first; the pending-unenqueued
        // guard keeps Idle from firing between the run and the resume.
        let needs_run = {
            let core = shared.core.lock();
            matches!(core.state, HostState::Created)
        };
        if needs_run {
            shared.core.lock().pending_unenqueued += 1;
        }
        let result = shared
            .resume_with_implicit_run(needs_run, bookmark, value, timeout)
            .await;
        if needs_run {
            shared.core.lock().pending_unenqueued -= 1;
        }
        result
    }

    /// Enumerate the instance's live bookmarks
    pub async fn get_bookmarks(&self) -> Result<Vec<BookmarkInfo>, HostError> {
        match self
            .shared
            .submit(
                OperationKind::GetBookmarks,
                self.shared.config.operation_timeout,
            )
            .await?
        {
            OperationOutcome::Bookmarks(bookmarks) => Ok(bookmarks),
            _ => Ok(vec![]),
        }
    }

    /// Abort the instance immediately, bypassing the operation queue
    #[instrument(skip_all)]
    pub async fn abort(&self, reason: impl Into<String>) {
        self.shared.do_abort(reason.into()).await;
    }
}

impl HostShared {
    // =========================================================================
    // Enqueue / wait
    // =========================================================================

    async fn submit(
        self: &Arc<Self>,
        kind: OperationKind,
        timeout: Duration,
    ) -> Result<OperationOutcome, HostError> {
        self.check_not_in_handler()?;
        let (op, mut rx) = InstanceOperation::new(kind);
        self.enqueue(op.clone(), false);

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HostError::ChannelClosed),
            Err(_elapsed) => {
                // Removal succeeding means the operation was never
                // notified; otherwise it is being serviced and the wait
                // must complete.
                if self.core.lock().pending.remove(&op) {
                    Err(HostError::Timeout)
                } else {
                    match rx.await {
                        Ok(result) => result,
                        Err(_) => Err(HostError::ChannelClosed),
                    }
                }
            }
        }
    }

    fn enqueue(self: &Arc<Self>, op: Arc<InstanceOperation>, push_front: bool) {
        let mut core = self.core.lock();
        op.stamp(core.action_count);
        debug!(op = op.kind.name(), action_id = op.action_id(), "operation enqueued");
        if push_front {
            core.pending.push_front(op.clone());
        } else {
            core.pending.push_back(op.clone());
        }

        if core.busy {
            if op.interrupts_scheduler && core.initialized {
                self.pause_flag.store(true, Ordering::SeqCst);
            }
        } else {
            core.busy = true;
            let shared = self.clone();
            tokio::spawn(async move {
                shared.service_loop().await;
            });
        }
    }

    async fn resume_with_implicit_run(
        self: &Arc<Self>,
        needs_run: bool,
        bookmark: Bookmark,
        value: Value,
        timeout: Duration,
    ) -> Result<BookmarkResumptionResult, HostError> {
        if needs_run {
            match self.submit(OperationKind::Run, timeout).await {
                Ok(_) | Err(HostError::Completed) => {}
                Err(e) => return Err(e),
            }
        }
        match self
            .submit(OperationKind::ResumeBookmark { bookmark, value }, timeout)
            .await?
        {
            OperationOutcome::Resumption(result) => Ok(result),
            _ => Ok(BookmarkResumptionResult::NotFound),
        }
    }

    fn check_not_in_handler(&self) -> Result<(), HostError> {
        if self.core.lock().handler_thread == Some(std::thread::current().id()) {
            return Err(HostError::OperationFromHandler);
        }
        Ok(())
    }

    // =========================================================================
    // The service pump
    // =========================================================================

    async fn service_loop(self: Arc<Self>) {
        loop {
            if let Some(info) = self.take_completed_to_raise() {
                self.raise_completed(info).await;
                continue;
            }

            match self.next_decision() {
                Decision::Operation(op) => {
                    if op.requires_initialized {
                        if let Err(e) = self.ensure_initialized() {
                            op.notify(Err(e));
                            continue;
                        }
                    }
                    let result = self.execute_operation(&op.kind).await;
                    op.notify(result);
                }
                Decision::RunScheduler => {
                    self.run_scheduler().await;
                }
                Decision::RaiseIdle(bookmarks) => {
                    self.raise_idle(bookmarks).await;
                }
                Decision::Done => return,
            }
        }
    }

    /// Pick the next piece of work while still synchronous
    fn next_decision(&self) -> Decision {
        // Executor stats first; only this pump mutates the executor, so
        // they cannot go stale under us.
        let (has_work, is_complete) = {
            let guard = self.executor.lock();
            match guard.as_ref() {
                Some(exec) => (exec.has_pending_work(), exec.completion().is_some()),
                None => (false, false),
            }
        };

        let mut core = self.core.lock();
        let state = core.state;
        let initialized = core.initialized;
        let quiescent = !has_work;

        if let Some(op) = core.pending.take_first_runnable(|op| {
            op_can_run(op, state, is_complete, quiescent)
        }) {
            core.action_count += 1;
            return Decision::Operation(op);
        }

        let should_run_now =
            state == HostState::Runnable && has_work && !is_complete;
        if should_run_now {
            core.action_count += 1;
            return Decision::RunScheduler;
        }

        let should_raise_idle_now = core.executed_since_idle
            && initialized
            && state == HostState::Runnable
            && quiescent
            && !is_complete
            && core.pending_unenqueued == 0;
        if should_raise_idle_now {
            core.executed_since_idle = false;
            drop(core);
            let bookmarks = {
                let guard = self.executor.lock();
                guard
                    .as_ref()
                    .map(|exec| exec.bookmark_infos())
                    .unwrap_or_default()
            };
            return Decision::RaiseIdle(bookmarks);
        }

        core.busy = false;
        Decision::Done
    }

    fn ensure_initialized(&self) -> Result<(), HostError> {
        if self.core.lock().initialized {
            return Ok(());
        }

        let tree = Arc::new(cache_root(&self.definition, CacheOptions::default())?);

        // Validate the host inputs against the root's In arguments.
        let root_node = tree.node(tree.root());
        for (name, value) in &self.inputs {
            let argument = root_node
                .arguments
                .iter()
                .find(|a| a.direction == Direction::In && &a.name == name)
                .ok_or_else(|| HostError::UnknownInput(name.clone()))?;
            if !argument.kind.accepts(value) {
                return Err(HostError::InputKindMismatch {
                    name: name.clone(),
                    found: ValueKind::of(value),
                });
            }
        }

        let executor = Executor::new(tree, self.inputs.clone(), self.pause_flag.clone());
        *self.executor.lock() = Some(executor);
        self.core.lock().initialized = true;
        debug!("workflow instance initialized");
        Ok(())
    }

    async fn execute_operation(&self, kind: &OperationKind) -> OperationResult {
        // Terminal-state dispatch.
        let state = self.core.lock().state;
        match state {
            HostState::Aborted => {
                let reason = self
                    .core
                    .lock()
                    .abort_reason
                    .clone()
                    .unwrap_or_else(|| "aborted".to_string());
                return Err(HostError::Aborted { reason });
            }
            HostState::Unloaded => return Err(HostError::Unloaded),
            HostState::Completed => {
                return match kind {
                    // Resuming a bookmark on a completed instance
                    // reports NotFound, silently.
                    OperationKind::ResumeBookmark { .. } => Ok(OperationOutcome::Resumption(
                        BookmarkResumptionResult::NotFound,
                    )),
                    OperationKind::GetBookmarks => Ok(OperationOutcome::Bookmarks(vec![])),
                    _ => Err(HostError::Completed),
                };
            }
            HostState::Created | HostState::Runnable => {}
        }

        match kind {
            OperationKind::Run => {
                {
                    let mut guard = self.executor.lock();
                    if let Some(exec) = guard.as_mut() {
                        if !exec.has_started() {
                            exec.start();
                        }
                    }
                }
                self.core.lock().state = HostState::Runnable;
                Ok(OperationOutcome::Done)
            }
            OperationKind::Cancel => {
                {
                    let mut guard = self.executor.lock();
                    if let Some(exec) = guard.as_mut() {
                        if !exec.has_started() {
                            exec.start();
                        }
                        exec.cancel_root();
                    }
                }
                self.core.lock().state = HostState::Runnable;
                Ok(OperationOutcome::Done)
            }
            OperationKind::Terminate { reason } => {
                {
                    let mut guard = self.executor.lock();
                    if let Some(exec) = guard.as_mut() {
                        exec.terminate(ActivityFailure::new(reason.clone()));
                    }
                }
                self.core.lock().state = HostState::Runnable;
                Ok(OperationOutcome::Done)
            }
            OperationKind::Persist => {
                self.do_persist(SaveOperation::Save).await?;
                Ok(OperationOutcome::Done)
            }
            OperationKind::Unload => {
                self.do_persist(SaveOperation::Unload).await?;
                self.mark_unloaded();
                Ok(OperationOutcome::Done)
            }
            OperationKind::ResumeBookmark { bookmark, value } => {
                let result = {
                    let mut guard = self.executor.lock();
                    match guard.as_mut() {
                        Some(exec) => exec.resume_bookmark(bookmark, value.clone()),
                        None => BookmarkResumptionResult::NotFound,
                    }
                };
                if result == BookmarkResumptionResult::Success {
                    self.core.lock().state = HostState::Runnable;
                }
                Ok(OperationOutcome::Resumption(result))
            }
            OperationKind::GetBookmarks => {
                let bookmarks = {
                    let guard = self.executor.lock();
                    guard
                        .as_ref()
                        .map(|exec| exec.bookmark_infos())
                        .unwrap_or_default()
                };
                Ok(OperationOutcome::Bookmarks(bookmarks))
            }
        }
    }

    async fn run_scheduler(&self) {
        let outcome = {
            let mut guard = self.executor.lock();
            match guard.as_mut() {
                Some(exec) => exec.run(),
                None => return,
            }
        };
        self.core.lock().executed_since_idle = true;

        match outcome {
            RunOutcome::Idle => {
                // Tracking flushes before idle becomes observable.
                if let Err(e) = self.flush_tracking().await {
                    warn!("tracking flush failed at idle: {e}");
                }
            }
            RunOutcome::Completed | RunOutcome::Paused => {}
            RunOutcome::Faulted => self.handle_unhandled_fault().await,
        }
    }

    async fn handle_unhandled_fault(&self) {
        let fault = {
            let mut guard = self.executor.lock();
            guard.as_mut().and_then(|exec| exec.take_pending_fault())
        };
        let Some(fault) = fault else {
            return;
        };

        let info = UnhandledExceptionInfo {
            source_display_name: fault
                .failure
                .source
                .as_ref()
                .map(|s| s.display_name.clone())
                .unwrap_or_default(),
            instance_id: self.core.lock().instance_id,
            failure: fault.failure.clone(),
        };
        warn!(source = %info.source_display_name, "unhandled exception: {}", info.failure.message);

        let action = match self.handlers.unhandled_exception() {
            Some(handler) => match self.invoke(|| handler(&info)) {
                Ok(action) => action,
                Err(()) => {
                    self.do_abort("unhandled-exception handler failed".to_string())
                        .await;
                    return;
                }
            },
            None => UnhandledExceptionAction::Terminate,
        };

        match action {
            UnhandledExceptionAction::Abort => {
                self.do_abort(info.failure.message.clone()).await;
            }
            UnhandledExceptionAction::Cancel => {
                let mut guard = self.executor.lock();
                if let Some(exec) = guard.as_mut() {
                    exec.cancel_root();
                }
            }
            UnhandledExceptionAction::Terminate => {
                let mut guard = self.executor.lock();
                if let Some(exec) = guard.as_mut() {
                    exec.terminate(fault.failure);
                }
            }
            UnhandledExceptionAction::Ignore => {
                let mut guard = self.executor.lock();
                if let Some(exec) = guard.as_mut() {
                    exec.ignore_fault(fault);
                }
            }
        }
    }

    // =========================================================================
    // Event raising
    // =========================================================================

    fn take_completed_to_raise(&self) -> Option<CompletedInfo> {
        let completion = {
            let guard = self.executor.lock();
            guard.as_ref().and_then(|exec| exec.completion().cloned())
        }?;
        let mut core = self.core.lock();
        if !core.initialized
            || core.has_raised_completed
            || matches!(core.state, HostState::Aborted | HostState::Unloaded)
        {
            return None;
        }
        core.has_raised_completed = true;
        core.state = HostState::Completed;
        Some(CompletedInfo {
            state: completion.state,
            outputs: completion.outputs,
            failure: completion.failure,
        })
    }

    async fn raise_completed(&self, info: CompletedInfo) {
        info!(state = %info.state, "workflow completed");

        // Stage one: flush tracking, then the handler.
        if let Err(e) = self.flush_tracking().await {
            warn!("tracking flush failed at completion: {e}");
        }
        if let Some(handler) = self.handlers.completed() {
            if self.invoke(|| handler(&info)).is_err() {
                self.do_abort("completed handler failed".to_string()).await;
                return;
            }
        }

        // Stage two: persist-and-unload when a store is configured.
        if self.store.is_some() {
            match self.do_persist(SaveOperation::Complete).await {
                Ok(()) => {
                    let mut guard = self.manager.lock().await;
                    if let Some(manager) = guard.as_mut() {
                        manager.delete_owner(self.config.persist_timeout).await;
                    }
                }
                Err(e) => warn!("completion persist failed: {e}"),
            }
            if let Some(handler) = self.handlers.unloaded() {
                let _ = self.invoke(|| handler());
            }
        }
    }

    async fn raise_idle(&self, bookmarks: Vec<BookmarkInfo>) {
        debug!(bookmarks = bookmarks.len(), "raising idle");
        if let Some(handler) = self.handlers.idle() {
            if self.invoke(|| handler(&bookmarks)).is_err() {
                self.do_abort("idle handler failed".to_string()).await;
                return;
            }
        }

        let Some(handler) = self.handlers.persistable_idle() else {
            return;
        };
        let action = match self.invoke(|| handler(&bookmarks)) {
            Ok(action) => action,
            Err(()) => {
                self.do_abort("persistable-idle handler failed".to_string())
                    .await;
                return;
            }
        };
        match action {
            PersistableIdleAction::None => {}
            PersistableIdleAction::Persist => {
                if let Err(e) = self.do_persist(SaveOperation::Save).await {
                    self.do_abort(format!("persist at idle failed: {e}")).await;
                }
            }
            PersistableIdleAction::Unload => {
                match self.do_persist(SaveOperation::Unload).await {
                    Ok(()) => self.mark_unloaded(),
                    Err(e) => self.do_abort(format!("unload at idle failed: {e}")).await,
                }
            }
        }
    }

    fn mark_unloaded(&self) {
        self.core.lock().state = HostState::Unloaded;
        info!("workflow instance unloaded");
        if let Some(handler) = self.handlers.unloaded() {
            let _ = self.invoke(|| handler());
        }
    }

    async fn do_abort(&self, reason: String) {
        {
            let mut core = self.core.lock();
            if core.state == HostState::Aborted {
                return;
            }
            core.state = HostState::Aborted;
            core.abort_reason = Some(reason.clone());
        }
        warn!("aborting workflow instance: {reason}");

        // Pending operations are canceled, not left hanging.
        let drained = self.core.lock().pending.drain();
        for op in drained {
            op.notify(Err(HostError::Aborted {
                reason: reason.clone(),
            }));
        }

        self.pipeline.abort();
        {
            let mut guard = self.executor.lock();
            if let Some(exec) = guard.as_mut() {
                exec.abort();
            }
        }
        {
            let mut guard = self.manager.lock().await;
            if let Some(manager) = guard.as_mut() {
                manager.abort();
            }
        }

        if let Some(handler) = self.handlers.aborted() {
            let _ = self.invoke(|| handler(&reason));
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    async fn do_persist(&self, operation: SaveOperation) -> Result<(), HostError> {
        let Some(store) = self.store.clone() else {
            return Err(HostError::NoInstanceStore);
        };

        // Strict ordering: tracking flushes before anything is saved.
        self.flush_tracking().await?;

        let core_values = self.build_instance_values()?;
        let values = self.pipeline.collect_and_map(core_values);

        let transaction = if self.pipeline.is_save_transaction_required() {
            Some(Transaction::new())
        } else {
            None
        };
        let dependent = transaction.as_ref().map(|t| t.create_dependent());

        // Module saves land before the store save (which may unlock).
        self.pipeline
            .save_all(&values, transaction.as_ref())
            .await
            .map_err(HostError::from)?;

        {
            let mut guard = self.manager.lock().await;
            let manager = guard.get_or_insert_with(|| PersistenceManager::new(store));
            manager
                .initialize(
                    self.identity.clone(),
                    self.identity_filter,
                    self.config.persist_timeout,
                )
                .await?;
            manager
                .save(values.clone(), operation, self.config.persist_timeout)
                .await?;
            self.core.lock().instance_id = Some(manager.instance_id());
        }

        drop(dependent);
        if let Some(transaction) = &transaction {
            transaction.try_commit();
        }

        // Publish only after the store save committed.
        self.pipeline.publish_all(&values).await?;

        if self.pipeline.is_aborted() {
            return Err(PersistenceError::Canceled.into());
        }
        debug!(?operation, "instance persisted");
        Ok(())
    }

    fn build_instance_values(&self) -> Result<PersistedValues, HostError> {
        let (snapshot, completion, bookmarks, mapped, has_work) = {
            let guard = self.executor.lock();
            let exec = guard
                .as_ref()
                .ok_or(HostError::Persistence(PersistenceError::NotInitialized))?;
            (
                exec.snapshot(),
                exec.completion().cloned(),
                exec.bookmark_infos(),
                exec.mapped_root_variables(),
                exec.has_pending_work(),
            )
        };

        let status = match &completion {
            Some(c) => match c.state {
                InstanceState::Closed => WorkflowStatus::Closed,
                InstanceState::Canceled => WorkflowStatus::Canceled,
                _ => WorkflowStatus::Faulted,
            },
            // A save while runnable work is queued records Executing.
            None if has_work => WorkflowStatus::Executing,
            None => WorkflowStatus::Idle,
        };

        let malformed =
            |e: serde_json::Error| HostError::Persistence(PersistenceError::Malformed(e.to_string()));

        let mut values = PersistedValues::new();
        values.insert(
            keys::WORKFLOW.to_string(),
            InstanceValue::read_write(serde_json::to_value(&snapshot).map_err(malformed)?),
        );
        values.insert(
            keys::STATUS.to_string(),
            InstanceValue::read_write(serde_json::to_value(status).map_err(malformed)?),
        );
        if !bookmarks.is_empty() {
            values.insert(
                keys::BOOKMARKS.to_string(),
                InstanceValue::write_only(serde_json::to_value(&bookmarks).map_err(malformed)?),
            );
        }
        values.insert(
            keys::LAST_UPDATE.to_string(),
            InstanceValue::write_only(
                serde_json::to_value(chrono::Utc::now()).map_err(malformed)?,
            ),
        );
        if let Some(completion) = &completion {
            if let Some(failure) = &completion.failure {
                values.insert(
                    keys::EXCEPTION.to_string(),
                    InstanceValue::read_write(serde_json::to_value(failure).map_err(malformed)?),
                );
            }
            if completion.state == InstanceState::Closed {
                for (name, value) in &completion.outputs {
                    values.insert(
                        keys::path(keys::OUTPUT_PATH, name),
                        InstanceValue::read_write(value.clone()),
                    );
                }
            }
        }
        for (name, value) in mapped {
            values.insert(
                keys::path(keys::VARIABLES_PATH, &name),
                InstanceValue::optional(value),
            );
        }
        if let Some(identity) = &self.identity {
            values.insert(
                keys::DEFINITION_IDENTITY.to_string(),
                InstanceValue::optional(serde_json::to_value(identity).map_err(malformed)?),
            );
        }
        Ok(values)
    }

    async fn flush_tracking(&self) -> Result<(), HostError> {
        let records = {
            let mut guard = self.executor.lock();
            match guard.as_mut() {
                Some(exec) => exec.take_tracking(),
                None => return Ok(()),
            }
        };
        if records.is_empty() || self.participants.is_empty() {
            return Ok(());
        }

        for participant in &self.participants {
            match tokio::time::timeout(self.config.track_timeout, participant.track(&records))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("tracking participant failed: {e}"),
                Err(_) => return Err(HostError::TrackingTimeout),
            }
        }
        Ok(())
    }

    // =========================================================================
    // Handler frames
    // =========================================================================

    fn invoke<R>(&self, f: impl FnOnce() -> R) -> Result<R, ()> {
        {
            self.core.lock().handler_thread = Some(std::thread::current().id());
        }
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
        {
            self.core.lock().handler_thread = None;
        }
        result.map_err(|_| ())
    }
}

fn op_can_run(
    op: &InstanceOperation,
    state: HostState,
    is_complete: bool,
    quiescent: bool,
) -> bool {
    // Terminal states dispatch immediately so the waiter gets the
    // terminal error (or NotFound, for bookmark resumption).
    if matches!(
        state,
        HostState::Completed | HostState::Aborted | HostState::Unloaded
    ) || is_complete
    {
        return true;
    }
    match op.kind {
        // Persist and Unload run at any pause point; a save with
        // runnable work still queued records status Executing.
        OperationKind::Run
        | OperationKind::Cancel
        | OperationKind::Terminate { .. }
        | OperationKind::GetBookmarks
        | OperationKind::Persist
        | OperationKind::Unload => true,
        OperationKind::ResumeBookmark { .. } => quiescent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builders() {
        let config = HostConfig::default()
            .with_operation_timeout(Duration::from_secs(5))
            .with_track_timeout(Duration::from_millis(250));
        assert_eq!(config.operation_timeout, Duration::from_secs(5));
        assert_eq!(config.track_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_resume_is_gated_on_quiescence() {
        let (resume, _rx) = InstanceOperation::new(OperationKind::ResumeBookmark {
            bookmark: Bookmark::named("k"),
            value: serde_json::json!(1),
        });
        assert!(!op_can_run(&resume, HostState::Runnable, false, false));
        assert!(op_can_run(&resume, HostState::Runnable, false, true));

        // Terminal states always dispatch.
        assert!(op_can_run(&resume, HostState::Completed, true, false));
    }

    #[test]
    fn test_persist_runs_at_any_pause_point() {
        let (persist, _rx) = InstanceOperation::new(OperationKind::Persist);
        assert!(op_can_run(&persist, HostState::Runnable, false, false));
        assert!(op_can_run(&persist, HostState::Created, false, true));
    }

    #[test]
    fn test_handler_double_assignment_rejected_through_host() {
        struct Nothing {
            core: crate::activity::ActivityCore,
        }
        impl crate::activity::Activity for Nothing {
            fn core(&self) -> &crate::activity::ActivityCore {
                &self.core
            }
            fn cache_metadata(&self, _meta: &mut crate::activity::ActivityMetadata) {}
            fn execute(
                &self,
                _ctx: &mut crate::runtime::ActivityContext<'_>,
            ) -> Result<(), ActivityFailure> {
                Ok(())
            }
        }

        let host = WorkflowHost::new(Arc::new(Nothing {
            core: crate::activity::ActivityCore::new("Nothing"),
        }));
        host.on_completed(|_| {}).expect("first assignment");
        assert!(host.on_completed(|_| {}).is_err());
    }
}
