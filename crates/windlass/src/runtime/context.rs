//! The API an activity body sees while executing

use std::sync::Arc;

use serde_json::Value;

use crate::activity::delegate::{ActivityDelegate, DelegateParam};
use crate::activity::{Argument, Variable};
use crate::activity::ActivityRef;
use crate::tree::ActivityId;

use super::bookmark::{Bookmark, BookmarkOptions};
use super::executor::Executor;
use super::fault::ActivityFailure;
use super::instance::{Continuation, InstanceId};
use super::location::LocationRef;

/// Execution context handed to activity bodies and callbacks
///
/// Everything an activity does at runtime flows through here: reading
/// and writing its declared symbols, scheduling children and delegates,
/// creating bookmarks, and reacting to cancellation. The context borrows
/// the executor for the duration of one callback; holding work across
/// callbacks means a bookmark or a scheduled child.
pub struct ActivityContext<'a> {
    executor: &'a mut Executor,
    instance: InstanceId,
    activity: ActivityId,
}

impl<'a> ActivityContext<'a> {
    pub(crate) fn new(executor: &'a mut Executor, instance: InstanceId, activity: ActivityId) -> Self {
        Self {
            executor,
            instance,
            activity,
        }
    }

    /// Serialized id of the executing instance
    pub fn instance_id(&self) -> InstanceId {
        self.instance
    }

    /// Definition id of the executing activity
    pub fn activity_id(&self) -> ActivityId {
        self.activity
    }

    /// Display name of the executing activity
    pub fn display_name(&self) -> &str {
        &self.executor.tree().node(self.activity).display_name
    }

    // =========================================================================
    // Symbols
    // =========================================================================

    /// Read an argument's current value
    pub fn argument_value(&self, argument: &Argument) -> Result<Value, ActivityFailure> {
        let slot = argument.slot().ok_or_else(|| {
            ActivityFailure::new(format!("argument '{}' is not cached", argument.name()))
        })?;
        self.executor.read_slot(self.instance, slot)
    }

    /// Write an argument's location (Out/InOut)
    pub fn set_argument(
        &mut self,
        argument: &Argument,
        value: Value,
    ) -> Result<(), ActivityFailure> {
        let slot = argument.slot().ok_or_else(|| {
            ActivityFailure::new(format!("argument '{}' is not cached", argument.name()))
        })?;
        self.executor.write_slot(self.instance, slot, value)
    }

    /// Read a variable's current value
    pub fn variable_value(&self, variable: &Variable) -> Result<Value, ActivityFailure> {
        let slot = variable.slot().ok_or_else(|| {
            ActivityFailure::new("variable is not cached")
        })?;
        self.executor.read_slot(self.instance, slot)
    }

    /// Write a variable
    pub fn set_variable(
        &mut self,
        variable: &Variable,
        value: Value,
    ) -> Result<(), ActivityFailure> {
        let slot = variable.slot().ok_or_else(|| {
            ActivityFailure::new("variable is not cached")
        })?;
        self.executor.write_slot(self.instance, slot, value)
    }

    /// Read one of this handler's delegate parameters
    pub fn delegate_param_value(&self, param: &DelegateParam) -> Result<Value, ActivityFailure> {
        let slot = param.slot().ok_or_else(|| {
            ActivityFailure::new(format!("delegate parameter '{}' is not cached", param.name()))
        })?;
        self.executor.read_slot(self.instance, slot)
    }

    /// Write one of this handler's Out delegate parameters
    pub fn set_delegate_param(
        &mut self,
        param: &DelegateParam,
        value: Value,
    ) -> Result<(), ActivityFailure> {
        let slot = param.slot().ok_or_else(|| {
            ActivityFailure::new(format!("delegate parameter '{}' is not cached", param.name()))
        })?;
        self.executor.write_slot(self.instance, slot, value)
    }

    /// Write this instance's result slot, when a consumer provided one
    pub fn set_result(&mut self, value: Value) -> Result<(), ActivityFailure> {
        let target = self
            .executor
            .instance(self.instance)
            .and_then(|inst| inst.result_location);
        match target {
            Some(location) => self.executor.write_location(location, value),
            None => Ok(()),
        }
    }

    /// Read the argument this reference expression resolved to
    pub fn resolved_reference_value(&self) -> Result<Value, ActivityFailure> {
        let slot = self
            .executor
            .tree()
            .node(self.activity)
            .resolved_reference
            .ok_or_else(|| ActivityFailure::new("expression has no resolved reference"))?;
        self.executor.read_slot(self.instance, slot)
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Schedule a declared child for execution
    ///
    /// Completion is delivered through
    /// [`Activity::on_child_completed`](crate::activity::Activity::on_child_completed).
    /// Imported children are reachable by name only and are rejected
    /// here.
    pub fn schedule(&mut self, child: &ActivityRef) -> Result<InstanceId, ActivityFailure> {
        let child_id = self.cached_id(child)?;
        if !self.executor.is_schedulable_child(self.activity, child_id) {
            return Err(ActivityFailure::new(format!(
                "'{}' is not a schedulable child of '{}'",
                child.core().display_name(),
                self.display_name()
            )));
        }
        Ok(self
            .executor
            .schedule_instance(child_id, Some(self.instance), None, Continuation::NotifyParent))
    }

    /// Schedule a declared child, directing its result into a variable
    pub fn schedule_into_variable(
        &mut self,
        child: &ActivityRef,
        variable: &Variable,
    ) -> Result<InstanceId, ActivityFailure> {
        let child_id = self.cached_id(child)?;
        if !self.executor.is_schedulable_child(self.activity, child_id) {
            return Err(ActivityFailure::new(format!(
                "'{}' is not a schedulable child of '{}'",
                child.core().display_name(),
                self.display_name()
            )));
        }
        let slot = variable
            .slot()
            .ok_or_else(|| ActivityFailure::new("variable is not cached"))?;
        let target: LocationRef = self
            .executor
            .resolve_env_slot(self.instance, slot)
            .ok_or_else(|| ActivityFailure::new("variable is not in scope"))?;
        Ok(self.executor.schedule_instance(
            child_id,
            Some(self.instance),
            Some(target),
            Continuation::NotifyParent,
        ))
    }

    /// Schedule a delegate's handler with the given parameter values
    pub fn schedule_delegate(
        &mut self,
        delegate: &Arc<ActivityDelegate>,
        inputs: Vec<Value>,
    ) -> Result<InstanceId, ActivityFailure> {
        self.executor
            .schedule_delegate(self.instance, self.activity, delegate, inputs)
    }

    // =========================================================================
    // Bookmarks
    // =========================================================================

    /// Create a named, blocking bookmark
    pub fn create_bookmark(&mut self, name: impl Into<String>) -> Result<Bookmark, ActivityFailure> {
        self.executor
            .create_bookmark(self.instance, Some(name.into()), BookmarkOptions::default())
    }

    /// Create a bookmark with explicit options
    pub fn create_bookmark_with_options(
        &mut self,
        name: Option<String>,
        options: BookmarkOptions,
    ) -> Result<Bookmark, ActivityFailure> {
        self.executor.create_bookmark(self.instance, name, options)
    }

    /// Remove one of this instance's bookmarks
    pub fn remove_bookmark(&mut self, bookmark: &Bookmark) -> bool {
        self.executor.remove_bookmark(self.instance, bookmark)
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Whether cancellation has been requested for this instance
    pub fn is_cancel_requested(&self) -> bool {
        self.executor
            .instance(self.instance)
            .map(|inst| inst.cancel_requested)
            .unwrap_or(false)
    }

    /// Record that this instance observed cancellation
    pub fn mark_canceled(&mut self) {
        self.executor.mark_canceled(self.instance);
    }

    /// Cascade the cancellation request to live children
    pub fn cancel_children(&mut self) {
        self.executor.cancel_children(self.instance);
    }

    /// Default cancellation: mark canceled and cascade to children
    pub fn default_cancel(&mut self) {
        self.executor.default_cancel(self.instance);
    }

    fn cached_id(&self, activity: &ActivityRef) -> Result<ActivityId, ActivityFailure> {
        let stamp = activity.core().stamp().ok_or_else(|| {
            ActivityFailure::new(format!(
                "'{}' is not cached",
                activity.core().display_name()
            ))
        })?;
        if stamp.root != self.executor.tree().root_seq() {
            return Err(ActivityFailure::new(format!(
                "'{}' belongs to a different root",
                activity.core().display_name()
            )));
        }
        Ok(stamp.id)
    }
}
