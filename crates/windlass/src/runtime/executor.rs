//! The cooperative scheduler
//!
//! Single-threaded: at most one activity runs at a time, to a
//! cooperative yield (an expression scheduled, a bookmark created,
//! completion). Work items drain FIFO; children complete before their
//! parent observes completion; sibling order is insertion order.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::activity::delegate::ActivityDelegate;
use crate::activity::CompletedChild;
use crate::tracking::{states, TrackingRecord};
use crate::tree::{ActivityId, ActivityTree};

use super::bookmark::{
    Bookmark, BookmarkInfo, BookmarkManager, BookmarkManagerSnapshot, BookmarkOptions,
    BookmarkResumptionResult, ResumeLookup,
};
use super::context::ActivityContext;
use super::environment::{EnvSlot, LocationEnvironment};
use super::fault::{ActivityFailure, FaultSource};
use super::instance::{
    ActivityInstance, Continuation, InstanceId, InstanceState, Substate,
};
use super::instance_map::{InstanceMap, InstanceMapSnapshot};
use super::location::{Location, LocationRef};
use super::work_item::WorkItem;

/// Why a scheduler run stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The queue drained
    Idle,

    /// The workflow reached a terminal state
    Completed,

    /// A host operation asked for a pause at a safe point
    Paused,

    /// An activity body faulted; the host must decide
    Faulted,
}

/// Terminal outcome of the whole workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionInfo {
    /// Closed, Canceled, or Faulted
    pub state: InstanceState,

    /// Root out/inout argument values, by name
    pub outputs: BTreeMap<String, Value>,

    /// The fault, when state is Faulted
    pub failure: Option<ActivityFailure>,
}

/// An unhandled fault awaiting the host's decision
#[derive(Debug, Clone)]
pub struct PendingFault {
    /// The failure, stamped with its source
    pub failure: ActivityFailure,

    /// The faulting subtree was rooted at the workflow root
    pub source_was_root: bool,
}

/// The work-item scheduler and its live state
pub struct Executor {
    tree: Arc<ActivityTree>,
    instances: InstanceMap,
    bookmarks: BookmarkManager,
    queue: VecDeque<WorkItem>,
    root_instance: Option<InstanceId>,
    inputs: BTreeMap<String, Value>,
    completion: Option<CompletionInfo>,
    pending_fault: Option<PendingFault>,
    pause_requested: Arc<AtomicBool>,
    tracking: Vec<TrackingRecord>,
}

impl Executor {
    /// Create an executor over a cached tree
    pub fn new(
        tree: Arc<ActivityTree>,
        inputs: BTreeMap<String, Value>,
        pause_requested: Arc<AtomicBool>,
    ) -> Self {
        Self {
            tree,
            instances: InstanceMap::new(),
            bookmarks: BookmarkManager::new(),
            queue: VecDeque::new(),
            root_instance: None,
            inputs,
            completion: None,
            pending_fault: None,
            pause_requested,
            tracking: vec![],
        }
    }

    /// Rebuild an executor from a persisted snapshot
    pub fn restore(
        tree: Arc<ActivityTree>,
        snapshot: ExecutorSnapshot,
        pause_requested: Arc<AtomicBool>,
    ) -> Self {
        Self {
            tree,
            instances: InstanceMap::restore(snapshot.instances),
            bookmarks: BookmarkManager::restore(snapshot.bookmarks),
            queue: VecDeque::from(snapshot.queue),
            root_instance: snapshot.root_instance,
            inputs: snapshot.inputs,
            completion: snapshot.completion,
            pending_fault: None,
            pause_requested,
            tracking: vec![],
        }
    }

    /// The cached tree this executor drives
    pub fn tree(&self) -> &Arc<ActivityTree> {
        &self.tree
    }

    /// Schedule the root invocation
    pub fn start(&mut self) {
        debug_assert!(self.root_instance.is_none(), "root already scheduled");
        self.tracking.push(TrackingRecord::workflow(states::STARTED));
        let root = self.schedule_instance(self.tree.root(), None, None, Continuation::Root);
        self.root_instance = Some(root);
    }

    /// Whether the root has been scheduled (or restored)
    pub fn has_started(&self) -> bool {
        self.root_instance.is_some()
    }

    /// Drain work items until idle, completion, a pause, or a fault
    pub fn run(&mut self) -> RunOutcome {
        loop {
            if self.completion.is_some() {
                return RunOutcome::Completed;
            }
            if self.pending_fault.is_some() {
                return RunOutcome::Faulted;
            }
            if self.pause_requested.swap(false, Ordering::SeqCst) && !self.queue.is_empty() {
                return RunOutcome::Paused;
            }
            let Some(item) = self.queue.pop_front() else {
                return RunOutcome::Idle;
            };
            self.dispatch(item);
        }
    }

    /// No runnable work remains
    pub fn is_quiescent(&self) -> bool {
        self.queue.is_empty() && self.pending_fault.is_none()
    }

    /// Work items are queued
    pub fn has_pending_work(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Terminal outcome, once reached
    pub fn completion(&self) -> Option<&CompletionInfo> {
        self.completion.as_ref()
    }

    /// Take the pending unhandled fault, if any
    pub fn take_pending_fault(&mut self) -> Option<PendingFault> {
        self.pending_fault.take()
    }

    /// Resolve an ignored fault: a faulted root still completes
    pub fn ignore_fault(&mut self, fault: PendingFault) {
        if fault.source_was_root && self.completion.is_none() {
            self.completion = Some(CompletionInfo {
                state: InstanceState::Faulted,
                outputs: BTreeMap::new(),
                failure: Some(fault.failure),
            });
        }
    }

    /// Drain buffered tracking records
    pub fn take_tracking(&mut self) -> Vec<TrackingRecord> {
        std::mem::take(&mut self.tracking)
    }

    /// Live bookmarks with their owners' display names
    pub fn bookmark_infos(&self) -> Vec<BookmarkInfo> {
        self.bookmarks
            .records()
            .iter()
            .map(|record| {
                let owner_display_name = self
                    .instances
                    .get(record.owner)
                    .map(|inst| self.tree.node(inst.activity).display_name.clone())
                    .unwrap_or_default();
                BookmarkInfo {
                    bookmark: record.bookmark.clone(),
                    owner_display_name,
                }
            })
            .collect()
    }

    /// Mapped root variables for persistence, by name
    pub fn mapped_root_variables(&self) -> BTreeMap<String, Value> {
        let mut mapped = BTreeMap::new();
        let Some(root) = self.root_instance else {
            return mapped;
        };
        if !self.instances.contains(root) {
            return mapped;
        }
        for cached in &self.tree.node(self.tree.root()).variables {
            if cached.mapped {
                if let (Some(name), Ok(value)) = (
                    cached.name.clone(),
                    self.read_slot(root, cached.slot),
                ) {
                    mapped.insert(name, value);
                }
            }
        }
        mapped
    }

    // =========================================================================
    // Host-driven transitions
    // =========================================================================

    /// Request cancellation of the root invocation
    ///
    /// A second request while one is pending is a no-op.
    pub fn cancel_root(&mut self) {
        let Some(root) = self.root_instance else {
            return;
        };
        if self.completion.is_some() || !self.instances.contains(root) {
            return;
        }
        let requested = self
            .instances
            .get_mut(root)
            .map(|inst| inst.request_cancel())
            .unwrap_or(false);
        if requested {
            debug!(%root, "cancellation requested");
            self.enqueue(WorkItem::CancelActivity { instance: root });
        }
    }

    /// Tear the instance tree down and complete as Faulted
    pub fn terminate(&mut self, failure: ActivityFailure) {
        if self.completion.is_some() {
            return;
        }
        debug!("terminating workflow");
        self.tracking
            .push(TrackingRecord::workflow(states::TERMINATED));
        if let Some(root) = self.root_instance {
            if self.instances.contains(root) {
                self.abort_subtree(root, InstanceState::Faulted);
            }
        }
        self.queue.clear();
        self.pending_fault = None;
        self.completion = Some(CompletionInfo {
            state: InstanceState::Faulted,
            outputs: BTreeMap::new(),
            failure: Some(failure),
        });
    }

    /// Best-effort teardown without a completion outcome
    pub fn abort(&mut self) {
        self.tracking.push(TrackingRecord::workflow(states::ABORTED));
        if let Some(root) = self.root_instance {
            if self.instances.contains(root) {
                self.abort_subtree(root, InstanceState::Faulted);
            }
        }
        self.queue.clear();
        self.pending_fault = None;
    }

    /// Arm delivery of `value` to a bookmark
    pub fn resume_bookmark(
        &mut self,
        selector: &Bookmark,
        value: Value,
    ) -> BookmarkResumptionResult {
        match self.bookmarks.begin_resume(selector) {
            ResumeLookup::NotFound => BookmarkResumptionResult::NotFound,
            ResumeLookup::NotReady => BookmarkResumptionResult::NotReady,
            ResumeLookup::Found(record) => {
                if let Some(inst) = self.instances.get_mut(record.owner) {
                    inst.remove_bookmark(!record.options.non_blocking);
                }
                self.tracking.push(TrackingRecord::bookmark(
                    record.bookmark.to_string(),
                    record.owner,
                ));
                self.enqueue(WorkItem::BookmarkCallback {
                    owner: record.owner,
                    bookmark: record.bookmark,
                    value,
                });
                BookmarkResumptionResult::Success
            }
        }
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    pub(crate) fn schedule_instance(
        &mut self,
        activity: ActivityId,
        parent: Option<InstanceId>,
        result_location: Option<LocationRef>,
        continuation: Continuation,
    ) -> InstanceId {
        let node = self.tree.node(activity);
        let total_symbols = node.total_symbol_count();
        let display_name = node.display_name.clone();

        let id = self.instances.register(|id| {
            let mut inst = ActivityInstance::new(id, activity, parent, continuation);
            inst.result_location = result_location;
            if total_symbols > 0 {
                inst.environment = Some(LocationEnvironment::new(activity, total_symbols));
                inst.substate = Substate::ResolvingArguments;
            } else {
                inst.substate = Substate::Initialized;
            }
            inst
        });

        if let Some(p) = parent {
            if let Some(parent_inst) = self.instances.get_mut(p) {
                parent_inst.children.push(id);
            }
        }

        self.tracking.push(TrackingRecord::activity(
            display_name,
            activity,
            id,
            states::SCHEDULED,
        ));
        self.enqueue(WorkItem::ExecuteBody { instance: id });
        id
    }

    pub(crate) fn schedule_delegate(
        &mut self,
        parent_instance: InstanceId,
        parent_activity: ActivityId,
        delegate: &Arc<ActivityDelegate>,
        inputs: Vec<Value>,
    ) -> Result<InstanceId, ActivityFailure> {
        let handler = self
            .tree
            .node(parent_activity)
            .delegates
            .iter()
            .find(|d| Arc::ptr_eq(&d.delegate, delegate))
            .ok_or_else(|| {
                ActivityFailure::new(format!(
                    "delegate '{}' is not declared by this activity",
                    delegate.display_name()
                ))
            })?
            .handler
            .ok_or_else(|| {
                ActivityFailure::new(format!(
                    "delegate '{}' has no handler",
                    delegate.display_name()
                ))
            })?;

        let id = self.schedule_instance(handler, Some(parent_instance), None, Continuation::NotifyParent);

        // Declare parameter locations in the handler's environment.
        let mut inputs = inputs.into_iter();
        for param in delegate.params() {
            let slot = param.slot().ok_or_else(|| {
                ActivityFailure::new(format!("delegate parameter '{}' is not cached", param.name()))
            })?;
            let location = match param.direction() {
                crate::activity::Direction::In => {
                    let value = inputs.next().unwrap_or(Value::Null);
                    if !param.kind().accepts(&value) {
                        return Err(ActivityFailure::new(format!(
                            "delegate parameter '{}' rejects value of kind {}",
                            param.name(),
                            crate::runtime::location::ValueKind::of(&value)
                        )));
                    }
                    Location::with_value(param.kind(), value)
                }
                _ => Location::new(param.kind()),
            };
            if let Some(env) = self
                .instances
                .get_mut(id)
                .and_then(|inst| inst.environment.as_mut())
            {
                env.declare(slot.index, location);
            }
        }
        Ok(id)
    }

    fn enqueue(&mut self, item: WorkItem) {
        if let Some(inst) = self.instances.get_mut(item.owner()) {
            inst.increment_busy();
        }
        self.queue.push_back(item);
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn dispatch(&mut self, item: WorkItem) {
        let owner = item.owner();
        match item {
            WorkItem::ExecuteBody { instance } => self.advance(instance),
            WorkItem::CompletionCallback {
                parent,
                child,
                continuation,
            } => self.run_completion_callback(parent, child, continuation),
            WorkItem::BookmarkCallback {
                owner,
                bookmark,
                value,
            } => self.run_bookmark_callback(owner, bookmark, value),
            WorkItem::CancelActivity { instance } => self.run_cancel(instance),
        }

        if self.instances.contains(owner) {
            if let Some(inst) = self.instances.get_mut(owner) {
                inst.decrement_busy();
            }
            self.evaluate(owner);
        }
    }

    /// Drive an instance through resolution into its body
    fn advance(&mut self, id: InstanceId) {
        let Some(inst) = self.instances.get(id) else {
            return;
        };
        if inst.is_completed() || (inst.cancel_requested && !inst.has_executed) {
            return;
        }
        match inst.substate {
            Substate::Created | Substate::Initialized | Substate::ResolvingArguments => {
                if self.resolve_arguments(id, 0) && self.resolve_variables(id, 0) {
                    self.enter_body(id);
                }
            }
            Substate::ResolvingVariables | Substate::PreExecuting => {
                if self.resolve_variables(id, 0) {
                    self.enter_body(id);
                }
            }
            Substate::Executing | Substate::Canceling => {}
        }
    }

    /// Resolve arguments from `start`; false when resolution went async
    fn resolve_arguments(&mut self, id: InstanceId, start: usize) -> bool {
        let tree = self.tree.clone();
        let Some(inst) = self.instances.get(id) else {
            return false;
        };
        let activity = inst.activity;
        let is_root = inst.parent.is_none();
        let node = tree.node(activity);

        for (index, bound) in node.arguments.iter().enumerate().skip(start) {
            // Host inputs override the root's In bindings.
            if is_root && bound.direction == crate::activity::Direction::In {
                if let Some(value) = self.inputs.get(&bound.name).cloned() {
                    self.declare_slot(id, bound.slot, Location::with_value(bound.kind, value));
                    continue;
                }
            }

            match bound.expression {
                None => {
                    let location = match bound.direction {
                        crate::activity::Direction::In => Location::new(bound.kind),
                        _ => Location::new(bound.kind).temporary(),
                    };
                    self.declare_slot(id, bound.slot, location);
                }
                Some(expr_id) => {
                    let expr_node = tree.node(expr_id);
                    if expr_node.activity.is_location_expression() {
                        if let Err(failure) = self.bind_location_argument(id, bound.slot, bound.kind, expr_id)
                        {
                            self.handle_fault(failure, id);
                            return false;
                        }
                    } else if let Some(value) = expr_node.activity.try_populate() {
                        self.declare_slot(id, bound.slot, Location::with_value(bound.kind, value));
                    } else {
                        // Asynchronous binding: mint the cell, schedule the
                        // expression, and resume at the next argument.
                        self.declare_slot(id, bound.slot, Location::new(bound.kind));
                        if let Some(inst) = self.instances.get_mut(id) {
                            inst.substate = Substate::ResolvingArguments;
                        }
                        self.schedule_instance(
                            expr_id,
                            Some(id),
                            Some(LocationRef {
                                instance: id,
                                slot: bound.slot.index,
                            }),
                            Continuation::ResumeArguments { next: index + 1 },
                        );
                        return false;
                    }
                }
            }
        }

        if let Some(inst) = self.instances.get_mut(id) {
            inst.substate = Substate::ResolvingVariables;
        }
        true
    }

    /// Alias an out/inout argument slot to the expression's target cell
    fn bind_location_argument(
        &mut self,
        id: InstanceId,
        slot: EnvSlot,
        kind: crate::runtime::location::ValueKind,
        expr_id: ActivityId,
    ) -> Result<(), ActivityFailure> {
        let tree = self.tree.clone();
        let expr_node = tree.node(expr_id);

        let target_slot = if let Some(resolved) = expr_node.resolved_reference {
            resolved
        } else if let Some(variable) = expr_node.activity.referenced_variable() {
            variable.slot().ok_or_else(|| {
                ActivityFailure::new("referenced variable is not cached")
            })?
        } else {
            return Err(ActivityFailure::new(
                "location expression has no resolvable target",
            ));
        };

        // The expression evaluates in the enclosing scope.
        let base = self
            .instances
            .get(id)
            .and_then(|inst| inst.parent)
            .unwrap_or(id);
        let target = self.resolve_env_slot(base, target_slot).ok_or_else(|| {
            ActivityFailure::new("referenced location is not in scope")
        })?;

        let mut location = Location::alias_to(kind, target);
        if self
            .location_cell(target)
            .map(|cell| cell.is_temporary)
            .unwrap_or(false)
        {
            location.buffer_gets_on_collapse = true;
        }
        self.declare_slot(id, slot, location);
        Ok(())
    }

    /// Resolve variables from `start`; false when a default went async
    fn resolve_variables(&mut self, id: InstanceId, start: usize) -> bool {
        let tree = self.tree.clone();
        let Some(inst) = self.instances.get(id) else {
            return false;
        };
        let node = tree.node(inst.activity);
        let public_len = node.variables.len();
        let total = public_len + node.implementation_variables.len();

        for index in start..total {
            let cached = if index < public_len {
                &node.variables[index]
            } else {
                &node.implementation_variables[index - public_len]
            };

            match cached.default {
                None => self.declare_slot(id, cached.slot, Location::new(cached.kind)),
                Some(expr_id) => {
                    let expr_node = tree.node(expr_id);
                    if let Some(value) = expr_node.activity.try_populate() {
                        self.declare_slot(
                            id,
                            cached.slot,
                            Location::with_value(cached.kind, value),
                        );
                    } else {
                        self.declare_slot(id, cached.slot, Location::new(cached.kind));
                        if let Some(inst) = self.instances.get_mut(id) {
                            inst.substate = Substate::ResolvingVariables;
                        }
                        self.schedule_instance(
                            expr_id,
                            Some(id),
                            Some(LocationRef {
                                instance: id,
                                slot: cached.slot.index,
                            }),
                            Continuation::ResumeVariables { next: index + 1 },
                        );
                        return false;
                    }
                }
            }
        }

        if let Some(inst) = self.instances.get_mut(id) {
            inst.substate = Substate::PreExecuting;
        }
        true
    }

    /// Enter the activity body
    fn enter_body(&mut self, id: InstanceId) {
        let Some(inst) = self.instances.get_mut(id) else {
            return;
        };
        inst.substate = Substate::Executing;
        inst.has_executed = true;
        let activity_id = inst.activity;

        let node = self.tree.clone();
        let node = node.node(activity_id);
        self.tracking.push(TrackingRecord::activity(
            node.display_name.clone(),
            activity_id,
            id,
            states::EXECUTING,
        ));

        let activity = node.activity.clone();
        let mut ctx = ActivityContext::new(self, id, activity_id);
        if let Err(failure) = activity.execute(&mut ctx) {
            self.handle_fault(failure, id);
        }
    }

    fn run_completion_callback(
        &mut self,
        parent: InstanceId,
        child: CompletedChild,
        continuation: Continuation,
    ) {
        if !self.instances.contains(parent) {
            return;
        }
        match continuation {
            Continuation::Root => {}
            Continuation::NotifyParent => {
                let activity_id = self
                    .instances
                    .get(parent)
                    .map(|inst| inst.activity)
                    .unwrap_or_else(|| self.tree.root());
                let activity = self.tree.node(activity_id).activity.clone();
                let mut ctx = ActivityContext::new(self, parent, activity_id);
                if let Err(failure) = activity.on_child_completed(&mut ctx, &child) {
                    self.handle_fault(failure, parent);
                }
            }
            Continuation::ResumeArguments { next } => {
                let proceed = self
                    .instances
                    .get(parent)
                    .map(|inst| !inst.cancel_requested)
                    .unwrap_or(false)
                    && child.state == InstanceState::Closed;
                if proceed && self.resolve_arguments(parent, next) && self.resolve_variables(parent, 0)
                {
                    self.enter_body(parent);
                }
            }
            Continuation::ResumeVariables { next } => {
                let proceed = self
                    .instances
                    .get(parent)
                    .map(|inst| !inst.cancel_requested)
                    .unwrap_or(false)
                    && child.state == InstanceState::Closed;
                if proceed && self.resolve_variables(parent, next) {
                    self.enter_body(parent);
                }
            }
        }
    }

    fn run_bookmark_callback(&mut self, owner: InstanceId, bookmark: Bookmark, value: Value) {
        let Some(inst) = self.instances.get(owner) else {
            return;
        };
        let activity_id = inst.activity;
        let activity = self.tree.node(activity_id).activity.clone();
        let mut ctx = ActivityContext::new(self, owner, activity_id);
        if let Err(failure) = activity.on_bookmark_resumed(&mut ctx, &bookmark, value) {
            self.handle_fault(failure, owner);
        }
    }

    fn run_cancel(&mut self, id: InstanceId) {
        let Some(inst) = self.instances.get(id) else {
            return;
        };
        if inst.is_completed() {
            return;
        }
        if inst.has_executed {
            if inst.substate != Substate::Canceling {
                let activity_id = inst.activity;
                let activity = self.tree.node(activity_id).activity.clone();
                let mut ctx = ActivityContext::new(self, id, activity_id);
                activity.cancel(&mut ctx);
            }
        } else {
            // Cancel before the body: tear down in-flight resolution.
            if let Some(inst) = self.instances.get_mut(id) {
                inst.substate = Substate::Canceling;
                inst.marked_canceled = true;
                inst.performing_default_cancelation = true;
            }
            self.cancel_children(id);
        }
    }

    pub(crate) fn cancel_children(&mut self, id: InstanceId) {
        let children: Vec<InstanceId> = self
            .instances
            .get(id)
            .map(|inst| inst.children.clone())
            .unwrap_or_default();
        for child in children {
            let requested = self
                .instances
                .get_mut(child)
                .map(|inst| inst.request_cancel())
                .unwrap_or(false);
            if requested {
                self.enqueue(WorkItem::CancelActivity { instance: child });
            }
        }
    }

    pub(crate) fn default_cancel(&mut self, id: InstanceId) {
        if let Some(inst) = self.instances.get_mut(id) {
            inst.performing_default_cancelation = true;
            inst.marked_canceled = true;
            inst.substate = Substate::Canceling;
        }
        self.cancel_children(id);
    }

    pub(crate) fn mark_canceled(&mut self, id: InstanceId) {
        if let Some(inst) = self.instances.get_mut(id) {
            inst.marked_canceled = true;
        }
    }

    // =========================================================================
    // State evaluation
    // =========================================================================

    /// The per-turn evaluator: decide whether `id` completes now
    fn evaluate(&mut self, id: InstanceId) {
        let Some(inst) = self.instances.get(id) else {
            return;
        };
        if inst.is_completed() {
            return;
        }

        if !inst.has_executed {
            if inst.cancel_requested {
                if !inst.performing_default_cancelation {
                    if let Some(inst) = self.instances.get_mut(id) {
                        inst.performing_default_cancelation = true;
                        inst.marked_canceled = true;
                        inst.substate = Substate::Canceling;
                    }
                    self.cancel_children(id);
                }
                let drained = self
                    .instances
                    .get(id)
                    .map(|inst| inst.busy_count == 0 && inst.children.is_empty())
                    .unwrap_or(false);
                if drained {
                    self.complete(id, InstanceState::Canceled);
                }
            }
            // Otherwise resolution continuations drive progress.
            return;
        }

        if inst.busy_count == 0 && inst.children.is_empty() {
            let state = if inst.marked_canceled {
                InstanceState::Canceled
            } else {
                InstanceState::Closed
            };
            self.complete(id, state);
            return;
        }

        // During default cancellation, once only blocking bookmarks
        // remain, purge them and close as Canceled.
        if inst.performing_default_cancelation
            && inst.children.is_empty()
            && inst.blocking_bookmark_count > 0
            && inst.only_bookmarks_remain()
        {
            let purged = self.bookmarks.purge_owner(id);
            if let Some(inst) = self.instances.get_mut(id) {
                for record in &purged {
                    inst.remove_bookmark(!record.options.non_blocking);
                }
            }
            self.complete(id, InstanceState::Canceled);
        }
    }

    /// Finish an instance: record its outcome, unregister it, and hand
    /// completion to the parent (or the workflow)
    fn complete(&mut self, id: InstanceId, state: InstanceState) {
        // Release any non-blocking bookmarks still registered.
        let purged = self.bookmarks.purge_owner(id);
        if let Some(inst) = self.instances.get_mut(id) {
            for record in &purged {
                inst.remove_bookmark(!record.options.non_blocking);
            }
        }

        let Some(inst) = self.instances.get(id) else {
            return;
        };
        let activity_id = inst.activity;
        let display_name = self.tree.node(activity_id).display_name.clone();
        let result = if state == InstanceState::Closed {
            inst.result_location
                .and_then(|loc| self.read_location(loc).ok())
        } else {
            None
        };

        let track_state = match state {
            InstanceState::Closed => states::CLOSED,
            InstanceState::Canceled => states::CANCELED,
            _ => states::FAULTED,
        };
        self.tracking.push(TrackingRecord::activity(
            display_name.clone(),
            activity_id,
            id,
            track_state,
        ));

        // The root's outputs must be read before its environment goes.
        let is_root = self.root_instance == Some(id);
        let outputs = if is_root && state == InstanceState::Closed {
            self.collect_root_outputs()
        } else {
            BTreeMap::new()
        };

        if let Some(inst) = self.instances.get_mut(id) {
            inst.state = state;
        }
        let Some(removed) = self.instances.remove(id) else {
            return;
        };

        if let Some(parent) = removed.parent {
            if let Some(parent_inst) = self.instances.get_mut(parent) {
                parent_inst.children.retain(|c| *c != id);
            }
            let child = CompletedChild {
                instance: id,
                activity: removed.activity,
                display_name,
                state,
                result,
            };
            self.enqueue(WorkItem::CompletionCallback {
                parent,
                child,
                continuation: removed.completion_continuation,
            });
        } else if is_root {
            let track = match state {
                InstanceState::Closed => states::COMPLETED,
                InstanceState::Canceled => states::CANCELED,
                _ => states::FAULTED,
            };
            self.tracking.push(TrackingRecord::workflow(track));
            self.completion = Some(CompletionInfo {
                state,
                outputs,
                failure: None,
            });
        }
    }

    /// Turn a body failure into an unhandled fault for the host
    fn handle_fault(&mut self, failure: ActivityFailure, source: InstanceId) {
        let (activity_id, parent, continuation) = match self.instances.get(source) {
            Some(inst) => (inst.activity, inst.parent, inst.completion_continuation),
            None => return,
        };
        let display_name = self.tree.node(activity_id).display_name.clone();
        let failure = failure.with_source(FaultSource {
            activity: activity_id,
            instance: source,
            display_name: display_name.clone(),
        });

        warn!(%source, activity = %activity_id, "activity faulted: {}", failure.message);
        self.tracking.push(TrackingRecord::activity(
            display_name.clone(),
            activity_id,
            source,
            states::FAULTED,
        ));

        let source_was_root = self.root_instance == Some(source);
        self.abort_subtree(source, InstanceState::Faulted);

        if let Some(parent) = parent {
            if self.instances.contains(parent) {
                let child = CompletedChild {
                    instance: source,
                    activity: activity_id,
                    display_name,
                    state: InstanceState::Faulted,
                    result: None,
                };
                self.enqueue(WorkItem::CompletionCallback {
                    parent,
                    child,
                    continuation,
                });
            }
        }

        self.pending_fault = Some(PendingFault {
            failure,
            source_was_root,
        });
    }

    /// Post-order teardown of a subtree; best-effort, errors swallowed
    fn abort_subtree(&mut self, root_of: InstanceId, final_state: InstanceState) {
        let mut order = vec![];
        let mut stack = vec![root_of];
        while let Some(id) = stack.pop() {
            order.push(id);
            if let Some(inst) = self.instances.get(id) {
                stack.extend(inst.children.iter().copied());
            }
        }

        let parent = self.instances.get(root_of).and_then(|inst| inst.parent);

        for id in order.into_iter().rev() {
            self.bookmarks.purge_owner(id);
            if let Some(inst) = self.instances.get_mut(id) {
                inst.state = final_state;
            }
            self.instances.remove(id);
        }

        if let Some(parent) = parent {
            if let Some(parent_inst) = self.instances.get_mut(parent) {
                parent_inst.children.retain(|c| *c != root_of);
            }
        }
    }

    fn collect_root_outputs(&self) -> BTreeMap<String, Value> {
        let mut outputs = BTreeMap::new();
        let Some(root) = self.root_instance else {
            return outputs;
        };
        for bound in &self.tree.node(self.tree.root()).arguments {
            if matches!(
                bound.direction,
                crate::activity::Direction::Out | crate::activity::Direction::InOut
            ) {
                if let Ok(value) = self.read_slot(root, bound.slot) {
                    outputs.insert(bound.name.clone(), value);
                }
            }
        }
        outputs
    }

    // =========================================================================
    // Locations
    // =========================================================================

    fn declare_slot(&mut self, id: InstanceId, slot: EnvSlot, location: Location) {
        if let Some(env) = self
            .instances
            .get_mut(id)
            .and_then(|inst| inst.environment.as_mut())
        {
            env.declare(slot.index, location);
        }
    }

    /// Find the environment hosting `slot`, walking up from `from`
    pub(crate) fn resolve_env_slot(
        &self,
        from: InstanceId,
        slot: EnvSlot,
    ) -> Option<LocationRef> {
        let mut current = Some(from);
        while let Some(id) = current {
            let inst = self.instances.get(id)?;
            if let Some(env) = &inst.environment {
                if env.owner == slot.owner {
                    return Some(LocationRef {
                        instance: id,
                        slot: slot.index,
                    });
                }
            }
            current = inst.parent;
        }
        None
    }

    fn location_cell(&self, location: LocationRef) -> Option<&Location> {
        self.instances
            .get(location.instance)?
            .environment
            .as_ref()?
            .get(location.slot)
    }

    /// Read a location, following aliases
    pub(crate) fn read_location(&self, location: LocationRef) -> Result<Value, ActivityFailure> {
        let mut current = location;
        for _ in 0..32 {
            let cell = self.location_cell(current).ok_or_else(|| {
                ActivityFailure::new("location is no longer available")
            })?;
            match cell.alias {
                Some(next) => current = next,
                None => return Ok(cell.value.clone()),
            }
        }
        Err(ActivityFailure::new("location alias chain too deep"))
    }

    /// Write a location, following aliases and checking the cell's kind
    pub(crate) fn write_location(
        &mut self,
        location: LocationRef,
        value: Value,
    ) -> Result<(), ActivityFailure> {
        let mut current = location;
        for _ in 0..32 {
            let cell = self.location_cell(current).ok_or_else(|| {
                ActivityFailure::new("location is no longer available")
            })?;
            match cell.alias {
                Some(next) => current = next,
                None => {
                    let kind = cell.kind;
                    if !kind.accepts(&value) {
                        return Err(ActivityFailure::new(format!(
                            "location of kind {kind} rejects value of kind {}",
                            crate::runtime::location::ValueKind::of(&value)
                        )));
                    }
                    let cell = self
                        .instances
                        .get_mut(current.instance)
                        .and_then(|inst| inst.environment.as_mut())
                        .and_then(|env| env.get_mut(current.slot))
                        .ok_or_else(|| ActivityFailure::new("location is no longer available"))?;
                    cell.value = value;
                    return Ok(());
                }
            }
        }
        Err(ActivityFailure::new("location alias chain too deep"))
    }

    /// Read a declared symbol visible from `from`
    pub(crate) fn read_slot(
        &self,
        from: InstanceId,
        slot: EnvSlot,
    ) -> Result<Value, ActivityFailure> {
        let location = self.resolve_env_slot(from, slot).ok_or_else(|| {
            ActivityFailure::new("symbol is not in scope")
        })?;
        self.read_location(location)
    }

    /// Write a declared symbol visible from `from`
    pub(crate) fn write_slot(
        &mut self,
        from: InstanceId,
        slot: EnvSlot,
        value: Value,
    ) -> Result<(), ActivityFailure> {
        let location = self.resolve_env_slot(from, slot).ok_or_else(|| {
            ActivityFailure::new("symbol is not in scope")
        })?;
        self.write_location(location, value)
    }

    pub(crate) fn create_bookmark(
        &mut self,
        owner: InstanceId,
        name: Option<String>,
        options: BookmarkOptions,
    ) -> Result<Bookmark, ActivityFailure> {
        let bookmark = self
            .bookmarks
            .create(owner, name, None, options)
            .map_err(|e| ActivityFailure::new(e.to_string()))?;
        if let Some(inst) = self.instances.get_mut(owner) {
            inst.add_bookmark(!options.non_blocking);
        }
        Ok(bookmark)
    }

    pub(crate) fn remove_bookmark(&mut self, owner: InstanceId, selector: &Bookmark) -> bool {
        match self.bookmarks.remove(selector, owner) {
            Some(record) => {
                if let Some(inst) = self.instances.get_mut(owner) {
                    inst.remove_bookmark(!record.options.non_blocking);
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn instance(&self, id: InstanceId) -> Option<&ActivityInstance> {
        self.instances.get(id)
    }

    pub(crate) fn is_schedulable_child(&self, parent: ActivityId, child: ActivityId) -> bool {
        self.tree.node(parent).is_schedulable_child(child)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Snapshot the paused executor for persistence
    ///
    /// The queue persists too, so a save taken at a pause point with
    /// runnable work still queued round-trips faithfully.
    pub fn snapshot(&self) -> ExecutorSnapshot {
        ExecutorSnapshot {
            instances: self.instances.snapshot(),
            bookmarks: self.bookmarks.snapshot(),
            queue: self.queue.iter().cloned().collect(),
            root_instance: self.root_instance,
            completion: self.completion.clone(),
            inputs: self.inputs.clone(),
        }
    }
}

/// Serialized executor state: the reserved "Workflow" persistence value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSnapshot {
    /// Live instances and the id watermark
    pub instances: InstanceMapSnapshot,

    /// Live bookmarks
    pub bookmarks: BookmarkManagerSnapshot,

    /// Work items still queued at the pause point
    pub queue: Vec<WorkItem>,

    /// The root invocation
    pub root_instance: Option<InstanceId>,

    /// Terminal outcome, when already reached
    pub completion: Option<CompletionInfo>,

    /// Host inputs the workflow started with
    pub inputs: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{
        Activity, ActivityCore, ActivityMetadata, ActivityRef, Argument, ArgumentHandle, Literal,
    };
    use crate::runtime::context::ActivityContext;
    use crate::runtime::location::ValueKind;
    use crate::tree::walker::{cache_root, CacheOptions};
    use parking_lot::Mutex;
    use serde_json::json;

    fn build(root: &ActivityRef) -> Executor {
        let tree = Arc::new(cache_root(root, CacheOptions::default()).expect("should cache"));
        Executor::new(tree, BTreeMap::new(), Arc::new(AtomicBool::new(false)))
    }

    struct NoOp {
        core: ActivityCore,
    }

    impl NoOp {
        fn new(name: &str) -> ActivityRef {
            Arc::new(Self {
                core: ActivityCore::new(name),
            })
        }
    }

    impl Activity for NoOp {
        fn core(&self) -> &ActivityCore {
            &self.core
        }
        fn cache_metadata(&self, _meta: &mut ActivityMetadata) {}
        fn execute(&self, _ctx: &mut ActivityContext<'_>) -> Result<(), ActivityFailure> {
            Ok(())
        }
    }

    /// Runs its children one after another
    struct Step {
        core: ActivityCore,
        steps: Vec<ActivityRef>,
    }

    impl Step {
        fn new(name: &str, steps: Vec<ActivityRef>) -> ActivityRef {
            Arc::new(Self {
                core: ActivityCore::new(name),
                steps,
            })
        }

        fn position_of(&self, activity: ActivityId) -> Option<usize> {
            self.steps
                .iter()
                .position(|s| s.core().id() == Some(activity))
        }
    }

    impl Activity for Step {
        fn core(&self) -> &ActivityCore {
            &self.core
        }

        fn cache_metadata(&self, meta: &mut ActivityMetadata) {
            for step in &self.steps {
                meta.add_child(step);
            }
        }

        fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), ActivityFailure> {
            if let Some(first) = self.steps.first() {
                ctx.schedule(first)?;
            }
            Ok(())
        }

        fn on_child_completed(
            &self,
            ctx: &mut ActivityContext<'_>,
            child: &crate::activity::CompletedChild,
        ) -> Result<(), ActivityFailure> {
            if child.state != InstanceState::Closed {
                return Ok(());
            }
            if let Some(done) = self.position_of(child.activity) {
                if let Some(next) = self.steps.get(done + 1) {
                    ctx.schedule(next)?;
                }
            }
            Ok(())
        }
    }

    /// Creates a bookmark and completes once it resumes
    struct Suspend {
        core: ActivityCore,
        bookmark_name: String,
        received: Arc<Mutex<Option<Value>>>,
    }

    impl Suspend {
        fn new(name: &str, bookmark_name: &str) -> (ActivityRef, Arc<Mutex<Option<Value>>>) {
            let received = Arc::new(Mutex::new(None));
            let activity: ActivityRef = Arc::new(Self {
                core: ActivityCore::new(name),
                bookmark_name: bookmark_name.to_string(),
                received: received.clone(),
            });
            (activity, received)
        }
    }

    impl Activity for Suspend {
        fn core(&self) -> &ActivityCore {
            &self.core
        }
        fn cache_metadata(&self, _meta: &mut ActivityMetadata) {}
        fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), ActivityFailure> {
            ctx.create_bookmark(self.bookmark_name.clone())?;
            Ok(())
        }
        fn on_bookmark_resumed(
            &self,
            _ctx: &mut ActivityContext<'_>,
            _bookmark: &Bookmark,
            value: Value,
        ) -> Result<(), ActivityFailure> {
            *self.received.lock() = Some(value);
            Ok(())
        }
    }

    struct Failing {
        core: ActivityCore,
    }

    impl Activity for Failing {
        fn core(&self) -> &ActivityCore {
            &self.core
        }
        fn cache_metadata(&self, _meta: &mut ActivityMetadata) {}
        fn execute(&self, _ctx: &mut ActivityContext<'_>) -> Result<(), ActivityFailure> {
            Err(ActivityFailure::new("deliberate failure"))
        }
    }

    struct ReadInput {
        core: ActivityCore,
        input: ArgumentHandle,
        seen: Arc<Mutex<Option<Value>>>,
    }

    impl Activity for ReadInput {
        fn core(&self) -> &ActivityCore {
            &self.core
        }
        fn cache_metadata(&self, meta: &mut ActivityMetadata) {
            meta.add_argument(&self.input);
        }
        fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), ActivityFailure> {
            *self.seen.lock() = Some(ctx.argument_value(&self.input)?);
            Ok(())
        }
    }

    #[test]
    fn test_sequence_runs_children_in_order_and_completes() {
        let root = Step::new("Root", vec![NoOp::new("A"), NoOp::new("B")]);
        let mut exec = build(&root);
        exec.start();

        assert_eq!(exec.run(), RunOutcome::Completed);
        let completion = exec.completion().expect("should complete");
        assert_eq!(completion.state, InstanceState::Closed);
        assert!(completion.outputs.is_empty());
        assert_eq!(exec.bookmark_infos().len(), 0);
    }

    #[test]
    fn test_bookmark_suspends_then_resumes() {
        let (root, received) = Suspend::new("Root", "k");
        let mut exec = build(&root);
        exec.start();

        assert_eq!(exec.run(), RunOutcome::Idle);
        assert_eq!(exec.bookmark_infos().len(), 1);

        // Blocking bookmark accounting holds the instance open.
        let root_inst = exec.instance(InstanceId::new(1)).unwrap();
        assert_eq!(root_inst.busy_count, 1);
        assert_eq!(root_inst.blocking_bookmark_count, 1);

        let result = exec.resume_bookmark(&Bookmark::named("k"), json!(42));
        assert_eq!(result, BookmarkResumptionResult::Success);

        assert_eq!(exec.run(), RunOutcome::Completed);
        assert_eq!(*received.lock(), Some(json!(42)));
    }

    #[test]
    fn test_resume_unknown_bookmark_is_not_found() {
        let (root, _) = Suspend::new("Root", "k");
        let mut exec = build(&root);
        exec.start();
        exec.run();

        let result = exec.resume_bookmark(&Bookmark::named("missing"), json!(0));
        assert_eq!(result, BookmarkResumptionResult::NotFound);

        // Still idle, still holding its bookmark.
        assert!(exec.is_quiescent());
        assert_eq!(exec.bookmark_infos().len(), 1);
    }

    #[test]
    fn test_cancel_purges_bookmarks_and_closes_canceled() {
        let (root, received) = Suspend::new("Root", "k");
        let mut exec = build(&root);
        exec.start();
        exec.run();

        exec.cancel_root();
        // A second request while one is pending is a no-op.
        exec.cancel_root();

        assert_eq!(exec.run(), RunOutcome::Completed);
        let completion = exec.completion().unwrap();
        assert_eq!(completion.state, InstanceState::Canceled);
        assert!(received.lock().is_none());
        assert_eq!(exec.bookmark_infos().len(), 0);
    }

    #[test]
    fn test_fault_surfaces_to_host() {
        let root: ActivityRef = Arc::new(Failing {
            core: ActivityCore::new("Root"),
        });
        let mut exec = build(&root);
        exec.start();

        assert_eq!(exec.run(), RunOutcome::Faulted);
        let fault = exec.take_pending_fault().expect("should have fault");
        assert!(fault.failure.message.contains("deliberate failure"));
        assert!(fault.source_was_root);
        assert_eq!(
            fault.failure.source.as_ref().unwrap().display_name,
            "Root"
        );
    }

    #[test]
    fn test_terminate_completes_faulted() {
        let (root, _) = Suspend::new("Root", "k");
        let mut exec = build(&root);
        exec.start();
        exec.run();

        exec.terminate(ActivityFailure::new("operator said so"));
        let completion = exec.completion().unwrap();
        assert_eq!(completion.state, InstanceState::Faulted);
        assert!(completion
            .failure
            .as_ref()
            .unwrap()
            .mentions("operator said so"));
        assert_eq!(exec.bookmark_infos().len(), 0);
    }

    #[test]
    fn test_literal_binding_resolves_synchronously() {
        let seen = Arc::new(Mutex::new(None));
        let root: ActivityRef = Arc::new(ReadInput {
            core: ActivityCore::new("Root"),
            input: Arc::new(
                Argument::input("Count", ValueKind::Integer)
                    .bind(Arc::new(Literal::new("five", json!(5)))),
            ),
            seen: seen.clone(),
        });
        let mut exec = build(&root);
        exec.start();

        assert_eq!(exec.run(), RunOutcome::Completed);
        assert_eq!(*seen.lock(), Some(json!(5)));
    }

    #[test]
    fn test_host_inputs_override_root_arguments() {
        let seen = Arc::new(Mutex::new(None));
        let root: ActivityRef = Arc::new(ReadInput {
            core: ActivityCore::new("Root"),
            input: Arc::new(Argument::input("Count", ValueKind::Integer)),
            seen: seen.clone(),
        });
        let tree = Arc::new(cache_root(&root, CacheOptions::default()).unwrap());
        let mut inputs = BTreeMap::new();
        inputs.insert("Count".to_string(), json!(9));
        let mut exec = Executor::new(tree, inputs, Arc::new(AtomicBool::new(false)));
        exec.start();

        assert_eq!(exec.run(), RunOutcome::Completed);
        assert_eq!(*seen.lock(), Some(json!(9)));
    }

    #[test]
    fn test_snapshot_restores_bookmarks_and_instances() {
        let (root, received) = Suspend::new("Root", "k");
        let mut exec = build(&root);
        exec.start();
        exec.run();

        let snapshot = exec.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: ExecutorSnapshot = serde_json::from_str(&json).unwrap();

        let tree = Arc::new(cache_root(&root, CacheOptions::default()).unwrap());
        let mut exec2 = Executor::restore(tree, restored, Arc::new(AtomicBool::new(false)));
        assert!(exec2.has_started());
        assert_eq!(exec2.bookmark_infos().len(), 1);

        let result = exec2.resume_bookmark(&Bookmark::named("k"), json!(7));
        assert_eq!(result, BookmarkResumptionResult::Success);
        assert_eq!(exec2.run(), RunOutcome::Completed);
        assert_eq!(*received.lock(), Some(json!(7)));
    }

    #[test]
    fn test_delegate_schedules_handler_with_params() {
        use crate::activity::{ActivityDelegate, DelegateParam};

        struct HandlerEcho {
            core: ActivityCore,
            item: Arc<DelegateParam>,
            seen: Arc<Mutex<Option<Value>>>,
        }

        impl Activity for HandlerEcho {
            fn core(&self) -> &ActivityCore {
                &self.core
            }
            fn cache_metadata(&self, _meta: &mut ActivityMetadata) {}
            fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), ActivityFailure> {
                *self.seen.lock() = Some(ctx.delegate_param_value(&self.item)?);
                Ok(())
            }
        }

        struct Dispatcher {
            core: ActivityCore,
            body: Arc<ActivityDelegate>,
        }

        impl Activity for Dispatcher {
            fn core(&self) -> &ActivityCore {
                &self.core
            }
            fn cache_metadata(&self, meta: &mut ActivityMetadata) {
                meta.add_delegate(&self.body);
            }
            fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), ActivityFailure> {
                ctx.schedule_delegate(&self.body, vec![json!("payload")])?;
                Ok(())
            }
        }

        let seen = Arc::new(Mutex::new(None));
        let item = Arc::new(DelegateParam::input("item", ValueKind::String));
        let handler: ActivityRef = Arc::new(HandlerEcho {
            core: ActivityCore::new("HandlerEcho"),
            item: item.clone(),
            seen: seen.clone(),
        });
        let body = Arc::new(
            ActivityDelegate::new("Body")
                .with_handler(handler)
                .with_param(item),
        );
        let root: ActivityRef = Arc::new(Dispatcher {
            core: ActivityCore::new("Root"),
            body,
        });

        let mut exec = build(&root);
        exec.start();
        assert_eq!(exec.run(), RunOutcome::Completed);
        assert_eq!(*seen.lock(), Some(json!("payload")));
    }

    #[test]
    fn test_reference_argument_reads_enclosing_scope() {
        use crate::activity::ArgumentValue;

        struct Inner {
            core: ActivityCore,
            input: ArgumentHandle,
            seen: Arc<Mutex<Option<Value>>>,
        }

        impl Activity for Inner {
            fn core(&self) -> &ActivityCore {
                &self.core
            }
            fn cache_metadata(&self, meta: &mut ActivityMetadata) {
                meta.add_argument(&self.input);
            }
            fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), ActivityFailure> {
                *self.seen.lock() = Some(ctx.argument_value(&self.input)?);
                Ok(())
            }
        }

        struct Outer {
            core: ActivityCore,
            source: ArgumentHandle,
            inner: ActivityRef,
        }

        impl Activity for Outer {
            fn core(&self) -> &ActivityCore {
                &self.core
            }
            fn cache_metadata(&self, meta: &mut ActivityMetadata) {
                meta.add_argument(&self.source);
                meta.add_child(&self.inner);
            }
            fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), ActivityFailure> {
                ctx.schedule(&self.inner)?;
                Ok(())
            }
        }

        let seen = Arc::new(Mutex::new(None));
        let inner: ActivityRef = Arc::new(Inner {
            core: ActivityCore::new("Inner"),
            input: Arc::new(
                Argument::input("Copied", ValueKind::Integer)
                    .bind(Arc::new(ArgumentValue::new("read-source", "Source"))),
            ),
            seen: seen.clone(),
        });
        let root: ActivityRef = Arc::new(Outer {
            core: ActivityCore::new("Root"),
            source: Arc::new(
                Argument::input("Source", ValueKind::Integer)
                    .bind(Arc::new(Literal::new("ten", json!(10)))),
            ),
            inner,
        });

        let mut exec = build(&root);
        exec.start();
        assert_eq!(exec.run(), RunOutcome::Completed);
        assert_eq!(*seen.lock(), Some(json!(10)));
    }

    #[test]
    fn test_variable_reference_out_binding_writes_through() {
        use crate::activity::{Variable, VariableHandle, VariableReference};

        struct Producer {
            core: ActivityCore,
            result: ArgumentHandle,
        }

        impl Activity for Producer {
            fn core(&self) -> &ActivityCore {
                &self.core
            }
            fn cache_metadata(&self, meta: &mut ActivityMetadata) {
                meta.add_argument(&self.result);
            }
            fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), ActivityFailure> {
                ctx.set_argument(&self.result, json!(7))
            }
        }

        struct Consumer {
            core: ActivityCore,
            total: VariableHandle,
            producer: ActivityRef,
            seen: Arc<Mutex<Option<Value>>>,
        }

        impl Activity for Consumer {
            fn core(&self) -> &ActivityCore {
                &self.core
            }
            fn cache_metadata(&self, meta: &mut ActivityMetadata) {
                meta.add_variable(&self.total);
                meta.add_child(&self.producer);
            }
            fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), ActivityFailure> {
                ctx.schedule(&self.producer)?;
                Ok(())
            }
            fn on_child_completed(
                &self,
                ctx: &mut ActivityContext<'_>,
                _child: &crate::activity::CompletedChild,
            ) -> Result<(), ActivityFailure> {
                *self.seen.lock() = Some(ctx.variable_value(&self.total)?);
                Ok(())
            }
        }

        let seen = Arc::new(Mutex::new(None));
        let total: VariableHandle = Arc::new(Variable::new("total", ValueKind::Integer));
        let producer: ActivityRef = Arc::new(Producer {
            core: ActivityCore::new("Producer"),
            result: Arc::new(
                Argument::output("Result", ValueKind::Integer)
                    .bind(Arc::new(VariableReference::new("into-total", total.clone()))),
            ),
        });
        let root: ActivityRef = Arc::new(Consumer {
            core: ActivityCore::new("Root"),
            total,
            producer,
            seen: seen.clone(),
        });

        let mut exec = build(&root);
        exec.start();
        assert_eq!(exec.run(), RunOutcome::Completed);
        assert_eq!(*seen.lock(), Some(json!(7)));
    }

    #[test]
    fn test_tracking_records_ordering() {
        let root = Step::new("Root", vec![NoOp::new("A")]);
        let mut exec = build(&root);
        exec.start();
        exec.run();

        let records = exec.take_tracking();
        assert!(matches!(
            &records[0],
            TrackingRecord::WorkflowInstance { state } if state.as_str() == states::STARTED
        ));
        let last = records.last().unwrap();
        assert!(matches!(
            last,
            TrackingRecord::WorkflowInstance { state } if state.as_str() == states::COMPLETED
        ));
    }
}
