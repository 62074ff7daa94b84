//! The caching walk
//!
//! A single-threaded, iterative, stack-based DFS that turns a raw
//! activity definition into a runtime-ready [`ActivityTree`]: ids
//! assigned, environments sized, arguments and variables validated and
//! slotted, delegates wired, constraints evaluated. Errors are collected,
//! never thrown mid-walk.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::activity::delegate::ActivityDelegate;
use crate::activity::metadata::ConstraintContext;
use crate::activity::{ActivityMetadata, ActivityRef, CacheStamp, Direction, VariableHandle};
use crate::runtime::environment::EnvSlot;
use crate::runtime::location::ValueKind;

use super::validation::{ValidationError, ValidationFailure};
use super::{
    ActivityId, ActivityNode, ActivityTree, BoundArgument, CacheState, CachedDelegate,
    CachedVariable, ChildKind,
};

/// Process-wide caching lock: one root walk at a time
static CACHE_LOCK: Mutex<()> = Mutex::new(());

/// Monotonic sequence for root associations
static ROOT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Per-node callback invoked with the activity and its parent chain
pub type NodeCallback = Box<dyn FnMut(&ActivityRef, &[ActivityId]) + Send>;

/// Options controlling the caching walk
pub struct CacheOptions {
    /// Mark the tree runtime-ready on success
    pub is_runtime_ready: bool,

    /// Skip implementation children entirely (design-time walks)
    pub skip_private_children: bool,

    /// Skip runtime constraint evaluation
    pub skip_constraints: bool,

    /// Additionally store each node's violations on the node itself
    pub store_temp_violations: bool,

    /// Cooperative cancellation; a set flag aborts the walk with a
    /// single cancellation error
    pub cancel: Option<Arc<AtomicBool>>,

    /// Invoked once per visited node
    pub callback: Option<NodeCallback>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            is_runtime_ready: true,
            skip_private_children: false,
            skip_constraints: false,
            store_temp_violations: false,
            cancel: None,
            callback: None,
        }
    }
}

impl CacheOptions {
    /// Options for a design-time validation walk
    pub fn design_time() -> Self {
        Self {
            is_runtime_ready: false,
            skip_private_children: true,
            ..Self::default()
        }
    }
}

/// Cache a root activity, producing its tree
///
/// Runs under the process-wide caching lock. Fails with one error per
/// offending node when any activity is already associated with another
/// root, a name collides within its scope, a bound expression's result
/// kind mismatches its consumer, or a reference expression names an
/// unknown target.
pub fn cache_root(
    root: &ActivityRef,
    mut options: CacheOptions,
) -> Result<ActivityTree, ValidationFailure> {
    let _guard = CACHE_LOCK.lock();
    let root_seq = ROOT_SEQ.fetch_add(1, Ordering::SeqCst);
    let prior_root_seq = root.core().stamp().map(|s| s.root);

    let mut walker = Walker {
        root_seq,
        prior_root_seq,
        nodes: vec![],
        errors: vec![],
        scope: vec![],
        seen: HashMap::new(),
    };

    let mut stack: Vec<WalkEntry> = vec![WalkEntry::Visit {
        activity: root.clone(),
        parent: None,
        relationship: ChildKind::Root,
        can_be_executed: true,
        patch: None,
        delegate: None,
    }];

    while let Some(entry) = stack.pop() {
        if let Some(cancel) = &options.cancel {
            if cancel.load(Ordering::SeqCst) {
                return Err(ValidationFailure::new(vec![ValidationError::new(
                    "caching walk canceled",
                )]));
            }
        }

        match entry {
            WalkEntry::PushScope(frame) => walker.scope.push(frame),
            WalkEntry::PopScope => {
                walker.scope.pop();
            }
            WalkEntry::Pop { id } => walker.finish_node(id, &options),
            WalkEntry::Visit {
                activity,
                parent,
                relationship,
                can_be_executed,
                patch,
                delegate,
            } => walker.visit(
                activity,
                parent,
                relationship,
                can_be_executed,
                patch,
                delegate,
                &mut stack,
                &mut options,
            ),
        }
    }

    let (errors, warnings): (Vec<_>, Vec<_>) =
        walker.errors.into_iter().partition(|e| !e.is_warning);

    if !errors.is_empty() {
        debug!(count = errors.len(), "caching walk failed");
        return Err(ValidationFailure::new(errors));
    }

    let runtime_ready = options.is_runtime_ready && !options.skip_private_children;
    debug!(
        nodes = walker.nodes.len(),
        runtime_ready, "caching walk finished"
    );

    Ok(ActivityTree::new(
        root_seq,
        walker.nodes,
        runtime_ready,
        warnings,
    ))
}

enum WalkEntry {
    Visit {
        activity: ActivityRef,
        parent: Option<ActivityId>,
        relationship: ChildKind,
        can_be_executed: bool,
        patch: Option<Patch>,
        delegate: Option<Arc<ActivityDelegate>>,
    },
    PushScope(ScopeFrame),
    PopScope,
    Pop {
        id: ActivityId,
    },
}

enum Patch {
    Argument {
        owner: ActivityId,
        index: usize,
        expected: ValueKind,
        direction: Direction,
    },
    VariableDefault {
        owner: ActivityId,
        index: usize,
        implementation: bool,
        expected: ValueKind,
    },
    DelegateHandler {
        owner: ActivityId,
        index: usize,
    },
}

struct ScopeFrame {
    names: HashMap<String, ScopeEntry>,
}

#[derive(Clone, Copy)]
struct ScopeEntry {
    slot: EnvSlot,
    kind: ValueKind,
    is_argument: bool,
}

struct Walker {
    root_seq: u64,
    prior_root_seq: Option<u64>,
    nodes: Vec<ActivityNode>,
    errors: Vec<ValidationError>,
    scope: Vec<ScopeFrame>,
    seen: HashMap<usize, ActivityId>,
}

impl Walker {
    #[allow(clippy::too_many_arguments)]
    fn visit(
        &mut self,
        activity: ActivityRef,
        parent: Option<ActivityId>,
        relationship: ChildKind,
        can_be_executed: bool,
        patch: Option<Patch>,
        delegate: Option<Arc<ActivityDelegate>>,
        stack: &mut Vec<WalkEntry>,
        options: &mut CacheOptions,
    ) {
        let display_name = activity.core().display_name().to_string();
        let errors_before = self.errors.len();

        // Identity checks: one id space entry per activity, one root per
        // activity for its lifetime. A re-walk of the same definition
        // (rehydration after load) is the one permitted re-stamp.
        let ptr = Arc::as_ptr(&activity) as *const () as usize;
        if self.seen.contains_key(&ptr) {
            self.errors.push(ValidationError::new(format!(
                "activity '{display_name}' appears more than once in the definition tree"
            )));
            self.stamp_with_parent(errors_before, parent, &display_name);
            return;
        }
        if let Some(stamp) = activity.core().stamp() {
            if stamp.root != self.root_seq && Some(stamp.root) != self.prior_root_seq {
                self.errors.push(ValidationError::new(format!(
                    "activity '{display_name}' is already associated with another root"
                )));
                self.stamp_with_parent(errors_before, parent, &display_name);
                return;
            }
        }

        // Step 1: add to the id space and stamp the association.
        let id = ActivityId::new(self.nodes.len() as u32 + 1);
        self.seen.insert(ptr, id);
        activity.core().set_stamp(CacheStamp {
            root: self.root_seq,
            id,
        });

        // Step 2: let the author populate metadata.
        let mut meta = ActivityMetadata::new();
        activity.cache_metadata(&mut meta);
        let ActivityMetadata {
            children,
            imported_children,
            implementation_children,
            delegates: declared_delegates,
            arguments: declared_arguments,
            variables: declared_variables,
            implementation_variables: declared_implementation_variables,
            constraints,
            result_kind,
        } = meta;

        let parent_will_execute = parent
            .map(|p| self.nodes[p.index()].will_execute)
            .unwrap_or(true);
        let will_execute = parent_will_execute && can_be_executed;

        // Steps 3-6: validate declarations, assign sequential slots, and
        // build this node's scope frame.
        let mut frame = ScopeFrame {
            names: HashMap::new(),
        };
        let mut slot_counter = 0u32;

        let mut arguments = Vec::with_capacity(declared_arguments.len());
        for handle in &declared_arguments {
            let slot = EnvSlot {
                owner: id,
                index: slot_counter,
            };
            slot_counter += 1;
            handle.set_slot(slot);
            self.declare_name(
                &mut frame,
                handle.name(),
                ScopeEntry {
                    slot,
                    kind: handle.kind(),
                    is_argument: true,
                },
                &display_name,
            );
            arguments.push(BoundArgument {
                argument: handle.clone(),
                name: handle.name().to_string(),
                direction: handle.direction(),
                kind: handle.kind(),
                expression: None,
                slot,
            });
        }

        let variables = self.cache_variable_list(
            &declared_variables,
            id,
            &display_name,
            &mut frame,
            &mut slot_counter,
        );
        let implementation_variables = self.cache_variable_list(
            &declared_implementation_variables,
            id,
            &display_name,
            &mut frame,
            &mut slot_counter,
        );

        let symbol_count = slot_counter;

        // Step 8: a delegate handler brings its delegate's bound
        // arguments into scope, appended after the node's own symbols.
        let mut delegate_param_count = 0u32;
        if let Some(d) = &delegate {
            for param in d.params() {
                let slot = EnvSlot {
                    owner: id,
                    index: slot_counter,
                };
                slot_counter += 1;
                param.set_slot(slot);
                self.declare_name(
                    &mut frame,
                    param.name(),
                    ScopeEntry {
                        slot,
                        kind: param.kind(),
                        is_argument: true,
                    },
                    &display_name,
                );
                delegate_param_count += 1;
            }
        }

        let delegates: Vec<CachedDelegate> = declared_delegates
            .iter()
            .map(|(d, collection)| CachedDelegate {
                delegate: d.clone(),
                handler: None,
                collection: *collection,
            })
            .collect();

        self.nodes.push(ActivityNode {
            activity: activity.clone(),
            display_name: display_name.clone(),
            parent,
            relationship,
            children: vec![],
            imported_children: vec![],
            implementation_children: vec![],
            delegates,
            arguments,
            variables,
            implementation_variables,
            constraints,
            result_kind,
            symbol_count,
            delegate_param_count,
            resolved_reference: None,
            will_execute,
            cache_state: CacheState::PartiallyCached,
            stored_violations: vec![],
        });

        // Record into the parent's child collections.
        if let Some(p) = parent {
            let parent_node = &mut self.nodes[p.index()];
            match relationship {
                ChildKind::Child => parent_node.children.push(id),
                ChildKind::ImportedChild => parent_node.imported_children.push(id),
                ChildKind::ImplementationChild => parent_node.implementation_children.push(id),
                _ => {}
            }
        }

        // Apply the patch that links this node back into its consumer,
        // and validate the binding now that the result kind is known.
        if let Some(patch) = patch {
            self.apply_patch(id, patch, &activity);
        }

        // Step 10: the caller's callback, with the parent chain.
        if let Some(callback) = options.callback.as_mut() {
            let chain = self.parent_chain(id);
            callback(&activity, &chain);
        }

        // Step 11: stamp this node's violations with the chain-derived
        // source, and store them on the node when asked to.
        self.stamp_errors(errors_before, id);
        if options.store_temp_violations {
            let stored: Vec<_> = self.errors[errors_before..].to_vec();
            self.nodes[id.index()].stored_violations = stored;
        }

        // Push the subtree, reversed so it processes in declared order:
        // argument expressions (enclosing scope), then this node's scope,
        // then variable defaults, children, delegates.
        stack.push(WalkEntry::Pop { id });
        stack.push(WalkEntry::PopScope);

        let mut pending: Vec<WalkEntry> = vec![];

        for (index, handle) in declared_arguments.iter().enumerate() {
            if let Some(expr) = handle.expression() {
                pending.push(WalkEntry::Visit {
                    activity: expr.clone(),
                    parent: Some(id),
                    relationship: ChildKind::ArgumentExpression,
                    can_be_executed: will_execute,
                    patch: Some(Patch::Argument {
                        owner: id,
                        index,
                        expected: handle.kind(),
                        direction: handle.direction(),
                    }),
                    delegate: None,
                });
            }
        }

        pending.push(WalkEntry::PushScope(frame));

        let mut push_defaults =
            |vars: &[VariableHandle], implementation: bool, pending: &mut Vec<WalkEntry>| {
                for (index, handle) in vars.iter().enumerate() {
                    if let Some(expr) = handle.default() {
                        pending.push(WalkEntry::Visit {
                            activity: expr.clone(),
                            parent: Some(id),
                            relationship: ChildKind::VariableDefault,
                            can_be_executed: will_execute,
                            patch: Some(Patch::VariableDefault {
                                owner: id,
                                index,
                                implementation,
                                expected: handle.kind(),
                            }),
                            delegate: None,
                        });
                    }
                }
            };
        push_defaults(&declared_variables, false, &mut pending);
        push_defaults(&declared_implementation_variables, true, &mut pending);

        // Step 7: children in order Public, Imported, Implementation.
        for child in &children {
            pending.push(WalkEntry::Visit {
                activity: child.clone(),
                parent: Some(id),
                relationship: ChildKind::Child,
                can_be_executed: true,
                patch: None,
                delegate: None,
            });
        }
        for child in &imported_children {
            pending.push(WalkEntry::Visit {
                activity: child.clone(),
                parent: Some(id),
                relationship: ChildKind::ImportedChild,
                can_be_executed: false,
                patch: None,
                delegate: None,
            });
        }
        if !options.skip_private_children {
            for child in &implementation_children {
                pending.push(WalkEntry::Visit {
                    activity: child.clone(),
                    parent: Some(id),
                    relationship: ChildKind::ImplementationChild,
                    can_be_executed: true,
                    patch: None,
                    delegate: None,
                });
            }
        }

        // Step 9: delegates across the three collections.
        for (index, (d, _)) in declared_delegates.iter().enumerate() {
            if let Some(handler) = d.handler() {
                pending.push(WalkEntry::Visit {
                    activity: handler.clone(),
                    parent: Some(id),
                    relationship: ChildKind::DelegateHandler,
                    can_be_executed: true,
                    patch: Some(Patch::DelegateHandler { owner: id, index }),
                    delegate: Some(d.clone()),
                });
            }
        }

        while let Some(entry) = pending.pop() {
            stack.push(entry);
        }
    }

    fn cache_variable_list(
        &mut self,
        handles: &[VariableHandle],
        owner: ActivityId,
        display_name: &str,
        frame: &mut ScopeFrame,
        slot_counter: &mut u32,
    ) -> Vec<CachedVariable> {
        let mut cached = Vec::with_capacity(handles.len());
        for handle in handles {
            let slot = EnvSlot {
                owner,
                index: *slot_counter,
            };
            *slot_counter += 1;
            handle.set_slot(slot);
            if let Some(name) = handle.name() {
                self.declare_name(
                    frame,
                    name,
                    ScopeEntry {
                        slot,
                        kind: handle.kind(),
                        is_argument: false,
                    },
                    display_name,
                );
            }
            cached.push(CachedVariable {
                variable: handle.clone(),
                name: handle.name().map(str::to_string),
                kind: handle.kind(),
                default: None,
                slot,
                mapped: handle.is_mapped(),
            });
        }
        cached
    }

    fn apply_patch(&mut self, expr_id: ActivityId, patch: Patch, activity: &ActivityRef) {
        match patch {
            Patch::Argument {
                owner,
                index,
                expected,
                direction,
            } => {
                self.nodes[owner.index()].arguments[index].expression = Some(expr_id);
                let arg_name = self.nodes[owner.index()].arguments[index].name.clone();

                let resolved = self.resolve_reference(activity);
                let expr_kind = resolved
                    .map(|entry| entry.kind)
                    .or(self.nodes[expr_id.index()].result_kind)
                    .unwrap_or(ValueKind::Any);
                if let Some(entry) = resolved {
                    self.nodes[expr_id.index()].resolved_reference = Some(entry.slot);
                }

                let location_required = matches!(direction, Direction::Out | Direction::InOut);
                if location_required != activity.is_location_expression() {
                    let wanted = if location_required {
                        "location"
                    } else {
                        "value"
                    };
                    self.errors.push(ValidationError::new(format!(
                        "{direction} argument '{arg_name}' requires a {wanted} expression"
                    )));
                } else if !expr_kind.is_compatible_with(&expected) {
                    self.errors.push(ValidationError::new(format!(
                        "argument '{arg_name}' binding has result kind {expr_kind}, expected {expected}"
                    )));
                }
            }
            Patch::VariableDefault {
                owner,
                index,
                implementation,
                expected,
            } => {
                let (name, _) = {
                    let node = &mut self.nodes[owner.index()];
                    let cached = if implementation {
                        &mut node.implementation_variables[index]
                    } else {
                        &mut node.variables[index]
                    };
                    cached.default = Some(expr_id);
                    (cached.name.clone().unwrap_or_default(), ())
                };

                if activity.is_location_expression() {
                    self.errors.push(ValidationError::new(format!(
                        "variable '{name}' default requires a value expression"
                    )));
                } else {
                    let expr_kind = self.nodes[expr_id.index()]
                        .result_kind
                        .unwrap_or(ValueKind::Any);
                    if !expr_kind.is_compatible_with(&expected) {
                        self.errors.push(ValidationError::new(format!(
                            "variable '{name}' default has result kind {expr_kind}, expected {expected}"
                        )));
                    }
                }
            }
            Patch::DelegateHandler { owner, index } => {
                self.nodes[owner.index()].delegates[index].handler = Some(expr_id);
            }
        }
    }

    fn resolve_reference(&mut self, activity: &ActivityRef) -> Option<ScopeEntry> {
        let name = activity.referenced_argument()?;
        let found = self
            .scope
            .iter()
            .rev()
            .find_map(|frame| frame.names.get(name).filter(|e| e.is_argument).copied());
        if found.is_none() {
            self.errors.push(ValidationError::new(format!(
                "expression '{}' references unknown argument '{name}'",
                activity.core().display_name()
            )));
        }
        found
    }

    fn declare_name(
        &mut self,
        frame: &mut ScopeFrame,
        name: &str,
        entry: ScopeEntry,
        display_name: &str,
    ) {
        // Child scopes shadow parents; the collision that errors is two
        // sibling declarations in the same scope, and the second loses.
        if frame.names.contains_key(name) {
            self.errors.push(ValidationError::new(format!(
                "symbol '{name}' is declared more than once in '{display_name}'"
            )));
            return;
        }
        frame.names.insert(name.to_string(), entry);
    }

    fn finish_node(&mut self, id: ActivityId, options: &CacheOptions) {
        let errors_before = self.errors.len();
        let chain = self.parent_chain(id);

        if !options.skip_constraints && self.nodes[id.index()].will_execute {
            let findings: Vec<_> = {
                let node = &self.nodes[id.index()];
                let ctx = ConstraintContext {
                    id,
                    display_name: &node.display_name,
                    parent_chain: &chain,
                };
                node.constraints
                    .iter()
                    .filter_map(|c| c.evaluate(&ctx))
                    .collect()
            };
            self.errors.extend(findings);
        }

        self.stamp_errors(errors_before, id);
        self.nodes[id.index()].cache_state = CacheState::Cached;
    }

    fn parent_chain(&self, id: ActivityId) -> Vec<ActivityId> {
        let mut chain = vec![];
        let mut current = self.nodes[id.index()].parent;
        while let Some(p) = current {
            chain.push(p);
            current = self.nodes[p.index()].parent;
        }
        chain.reverse();
        chain
    }

    fn stamp_errors(&mut self, from: usize, id: ActivityId) {
        let prefix = {
            let chain = self.parent_chain(id);
            let mut parts: Vec<&str> = chain
                .iter()
                .map(|p| self.nodes[p.index()].display_name.as_str())
                .collect();
            parts.push(&self.nodes[id.index()].display_name);
            parts.join("/")
        };
        let source = self.nodes[id.index()].display_name.clone();
        self.apply_stamp(from, prefix, source, Some(id));
    }

    fn stamp_with_parent(&mut self, from: usize, parent: Option<ActivityId>, name: &str) {
        let prefix = match parent {
            Some(p) => {
                let mut chain = self.parent_chain(p);
                chain.push(p);
                let mut parts: Vec<&str> = chain
                    .iter()
                    .map(|c| self.nodes[c.index()].display_name.as_str())
                    .collect();
                parts.push(name);
                parts.join("/")
            }
            None => name.to_string(),
        };
        self.apply_stamp(from, prefix, name.to_string(), None);
    }

    fn apply_stamp(
        &mut self,
        from: usize,
        prefix: String,
        source: String,
        id: Option<ActivityId>,
    ) {
        for error in &mut self.errors[from..] {
            if error.prefix.is_none() {
                error.prefix = Some(prefix.clone());
            }
            if error.source_name.is_none() {
                error.source_name = Some(source.clone());
            }
            if error.activity.is_none() {
                error.activity = id;
            }
        }
    }
}
