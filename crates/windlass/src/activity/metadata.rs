//! Metadata collected from activities during the caching walk

use std::sync::Arc;

use crate::runtime::location::ValueKind;
use crate::tree::validation::ValidationError;
use crate::tree::ActivityId;

use super::argument::ArgumentHandle;
use super::delegate::{ActivityDelegate, DelegateCollection};
use super::variable::VariableHandle;
use super::ActivityRef;

/// Context handed to a runtime constraint when it is evaluated
pub struct ConstraintContext<'a> {
    /// Id of the activity under validation
    pub id: ActivityId,

    /// Display name of the activity under validation
    pub display_name: &'a str,

    /// Ids of the ancestors, root first
    pub parent_chain: &'a [ActivityId],
}

type ConstraintCheck = Arc<dyn Fn(&ConstraintContext<'_>) -> Option<ValidationError> + Send + Sync>;

/// A runtime constraint queued for evaluation by the walker
///
/// Constraints run last for each node, and only when the parent chain
/// will execute, the node can be executed, and constraint evaluation was
/// not suppressed by the caching options.
#[derive(Clone)]
pub struct Constraint {
    name: String,
    check: ConstraintCheck,
}

impl Constraint {
    /// Create a constraint from a check function
    pub fn new(
        name: impl Into<String>,
        check: impl Fn(&ConstraintContext<'_>) -> Option<ValidationError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    /// Constraint name, used for diagnostics
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluate the constraint
    pub fn evaluate(&self, ctx: &ConstraintContext<'_>) -> Option<ValidationError> {
        (self.check)(ctx)
    }
}

impl std::fmt::Debug for Constraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Constraint").field("name", &self.name).finish()
    }
}

/// Collector populated by `Activity::cache_metadata`
///
/// An activity declares its compositional structure here: children in
/// three collections, delegates in three analogous collections, runtime
/// arguments, public and implementation variables, constraints, and an
/// optional result kind when the activity produces a value.
#[derive(Default)]
pub struct ActivityMetadata {
    pub(crate) children: Vec<ActivityRef>,
    pub(crate) imported_children: Vec<ActivityRef>,
    pub(crate) implementation_children: Vec<ActivityRef>,
    pub(crate) delegates: Vec<(Arc<ActivityDelegate>, DelegateCollection)>,
    pub(crate) arguments: Vec<ArgumentHandle>,
    pub(crate) variables: Vec<VariableHandle>,
    pub(crate) implementation_variables: Vec<VariableHandle>,
    pub(crate) constraints: Vec<Constraint>,
    pub(crate) result_kind: Option<ValueKind>,
}

impl ActivityMetadata {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a public child, executed and visible to consumers
    pub fn add_child(&mut self, child: &ActivityRef) {
        self.children.push(child.clone());
    }

    /// Register an imported child, reachable by name lookup but not
    /// executed through this activity
    pub fn add_imported_child(&mut self, child: &ActivityRef) {
        self.imported_children.push(child.clone());
    }

    /// Register an implementation child, private to this activity
    pub fn add_implementation_child(&mut self, child: &ActivityRef) {
        self.implementation_children.push(child.clone());
    }

    /// Register a public delegate
    pub fn add_delegate(&mut self, delegate: &Arc<ActivityDelegate>) {
        self.delegates
            .push((delegate.clone(), DelegateCollection::Public));
    }

    /// Register an imported delegate
    pub fn add_imported_delegate(&mut self, delegate: &Arc<ActivityDelegate>) {
        self.delegates
            .push((delegate.clone(), DelegateCollection::Imported));
    }

    /// Register an implementation delegate
    pub fn add_implementation_delegate(&mut self, delegate: &Arc<ActivityDelegate>) {
        self.delegates
            .push((delegate.clone(), DelegateCollection::Implementation));
    }

    /// Register a runtime argument
    pub fn add_argument(&mut self, argument: &ArgumentHandle) {
        self.arguments.push(argument.clone());
    }

    /// Register a public variable
    pub fn add_variable(&mut self, variable: &VariableHandle) {
        self.variables.push(variable.clone());
    }

    /// Register an implementation variable
    pub fn add_implementation_variable(&mut self, variable: &VariableHandle) {
        self.implementation_variables.push(variable.clone());
    }

    /// Queue a runtime constraint
    pub fn add_constraint(&mut self, constraint: Constraint) {
        self.constraints.push(constraint);
    }

    /// Declare that this activity produces a value of the given kind
    pub fn set_result_kind(&mut self, kind: ValueKind) {
        self.result_kind = Some(kind);
    }
}
