//! Cached activity trees
//!
//! A raw activity definition becomes runtime-ready by passing through
//! [`walker::cache_root`], which produces an [`ActivityTree`]: the flat
//! id space of every activity under one root, plus the cached metadata
//! the scheduler consumes. Nodes reference each other by id, never by
//! pointer.

pub mod validation;
pub mod walker;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::activity::delegate::{ActivityDelegate, DelegateCollection};
use crate::activity::{ActivityRef, ArgumentHandle, Constraint, Direction, VariableHandle};
use crate::runtime::environment::EnvSlot;
use crate::runtime::location::ValueKind;

use validation::ValidationError;

/// Id of an activity within its root's id space
///
/// Ids are assigned in depth-first visit order starting at 1 (the root),
/// so they are stable across re-walks of the same definition — which is
/// what lets persisted state rebind to definitions after a reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityId(u32);

impl ActivityId {
    /// Wrap a raw id (1-based)
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Raw id value
    pub fn get(&self) -> u32 {
        self.0
    }

    pub(crate) fn index(&self) -> usize {
        (self.0 - 1) as usize
    }
}

impl std::fmt::Display for ActivityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How an activity is related to its parent in the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    /// The root of the id space
    Root,

    /// Public child, executed and visible to consumers
    Child,

    /// Reachable by name lookup but not executed through the parent
    ImportedChild,

    /// Private to the parent's implementation
    ImplementationChild,

    /// Expression bound to one of the parent's arguments
    ArgumentExpression,

    /// Default expression of one of the parent's variables
    VariableDefault,

    /// Handler of one of the parent's delegates
    DelegateHandler,
}

/// Caching progression of a single activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// The walker has entered the node but not finished its subtree
    PartiallyCached,

    /// The node and its whole subtree are cached
    Cached,
}

/// An argument binding after caching
#[derive(Debug)]
pub struct BoundArgument {
    /// The author's declaration handle
    pub argument: ArgumentHandle,

    /// Argument name, unique within the activity
    pub name: String,

    /// Data flow direction
    pub direction: Direction,

    /// Value kind of the bound location
    pub kind: ValueKind,

    /// Node id of the bound expression, if the binding is not empty
    pub expression: Option<ActivityId>,

    /// Slot the argument resolves to at runtime
    pub slot: EnvSlot,
}

/// A variable declaration after caching
#[derive(Debug)]
pub struct CachedVariable {
    /// The author's declaration handle
    pub variable: VariableHandle,

    /// Variable name, if any
    pub name: Option<String>,

    /// Value kind
    pub kind: ValueKind,

    /// Node id of the default expression, if bound
    pub default: Option<ActivityId>,

    /// Slot the variable resolves to at runtime
    pub slot: EnvSlot,

    /// Persisted under `VariablesPath/<name>`
    pub mapped: bool,
}

/// A delegate after caching
#[derive(Debug)]
pub struct CachedDelegate {
    /// The author's delegate
    pub delegate: Arc<ActivityDelegate>,

    /// Node id of the handler, if one is set
    pub handler: Option<ActivityId>,

    /// Which collection the delegate was registered into
    pub collection: DelegateCollection,
}

/// One activity's cached metadata
pub struct ActivityNode {
    /// The definition itself
    pub activity: ActivityRef,

    /// Display name captured at caching time
    pub display_name: String,

    /// Parent node id; `None` only for the root
    pub parent: Option<ActivityId>,

    /// Relationship to the parent
    pub relationship: ChildKind,

    /// Public children, declaration order
    pub children: Vec<ActivityId>,

    /// Imported children, declaration order
    pub imported_children: Vec<ActivityId>,

    /// Implementation children, declaration order
    pub implementation_children: Vec<ActivityId>,

    /// Delegates across all three collections
    pub delegates: Vec<CachedDelegate>,

    /// Argument bindings, declaration order
    pub arguments: Vec<BoundArgument>,

    /// Public variables, declaration order
    pub variables: Vec<CachedVariable>,

    /// Implementation variables, declaration order
    pub implementation_variables: Vec<CachedVariable>,

    /// Runtime constraints queued by `cache_metadata`
    pub constraints: Vec<Constraint>,

    /// Result kind when the activity produces a value
    pub result_kind: Option<ValueKind>,

    /// Slots in the instance environment (arguments + variables)
    pub symbol_count: u32,

    /// Extra slots when this node is a delegate handler
    pub delegate_param_count: u32,

    /// Resolved target for reference expressions
    pub resolved_reference: Option<EnvSlot>,

    /// Whether this node executes when the root runs
    pub will_execute: bool,

    /// Caching progression
    pub cache_state: CacheState,

    /// Violations stored on the node when the options ask for it
    pub stored_violations: Vec<ValidationError>,
}

impl ActivityNode {
    /// Total environment slots an instance of this node declares
    pub fn total_symbol_count(&self) -> u32 {
        self.symbol_count + self.delegate_param_count
    }

    /// Whether `id` is schedulable as a child of this node
    ///
    /// Imported children are reachable by name only; scheduling them
    /// through this node is rejected.
    pub fn is_schedulable_child(&self, id: ActivityId) -> bool {
        self.children.contains(&id)
            || self.implementation_children.contains(&id)
            || self.delegates.iter().any(|d| d.handler == Some(id))
            || self.arguments.iter().any(|a| a.expression == Some(id))
            || self.variables.iter().any(|v| v.default == Some(id))
            || self
                .implementation_variables
                .iter()
                .any(|v| v.default == Some(id))
    }
}

impl std::fmt::Debug for ActivityNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityNode")
            .field("display_name", &self.display_name)
            .field("parent", &self.parent)
            .field("relationship", &self.relationship)
            .field("children", &self.children)
            .field("symbol_count", &self.symbol_count)
            .finish()
    }
}

/// The flat id space of one cached root
///
/// Immutable once built; every activity under the root reaches exactly
/// one entry here.
pub struct ActivityTree {
    root_seq: u64,
    nodes: Vec<ActivityNode>,
    runtime_ready: bool,
    warnings: Vec<ValidationError>,
}

impl ActivityTree {
    pub(crate) fn new(
        root_seq: u64,
        nodes: Vec<ActivityNode>,
        runtime_ready: bool,
        warnings: Vec<ValidationError>,
    ) -> Self {
        Self {
            root_seq,
            nodes,
            runtime_ready,
            warnings,
        }
    }

    /// Id of the root node
    pub fn root(&self) -> ActivityId {
        ActivityId::new(1)
    }

    /// Sequence number of the caching walk that built this tree
    pub fn root_seq(&self) -> u64 {
        self.root_seq
    }

    /// Look up a node
    pub fn node(&self, id: ActivityId) -> &ActivityNode {
        &self.nodes[id.index()]
    }

    /// Look up a node, tolerating out-of-space ids
    pub fn get(&self, id: ActivityId) -> Option<&ActivityNode> {
        self.nodes.get(id.index())
    }

    pub(crate) fn node_mut(&mut self, id: ActivityId) -> &mut ActivityNode {
        &mut self.nodes[id.index()]
    }

    /// Number of activities in the id space
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree is empty (never true for a cached tree)
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All ids in the space, ascending
    pub fn ids(&self) -> impl Iterator<Item = ActivityId> + '_ {
        (1..=self.nodes.len() as u32).map(ActivityId::new)
    }

    /// Whether the walk marked the tree runtime-ready
    pub fn is_runtime_ready(&self) -> bool {
        self.runtime_ready
    }

    /// Warnings collected by the walk
    pub fn warnings(&self) -> &[ValidationError] {
        &self.warnings
    }

    /// Ids of the ancestors of `id`, root first
    pub fn parent_chain(&self, id: ActivityId) -> Vec<ActivityId> {
        let mut chain = vec![];
        let mut current = self.node(id).parent;
        while let Some(p) = current {
            chain.push(p);
            current = self.node(p).parent;
        }
        chain.reverse();
        chain
    }

    /// Slash-separated display path from the root to `id`
    pub fn display_path(&self, id: ActivityId) -> String {
        let mut parts: Vec<&str> = self
            .parent_chain(id)
            .into_iter()
            .map(|p| self.node(p).display_name.as_str())
            .collect();
        parts.push(&self.node(id).display_name);
        parts.join("/")
    }
}

impl std::fmt::Debug for ActivityTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityTree")
            .field("root_seq", &self.root_seq)
            .field("len", &self.nodes.len())
            .field("runtime_ready", &self.runtime_ready)
            .finish()
    }
}
