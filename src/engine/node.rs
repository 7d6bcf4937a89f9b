//! Reaction Nodes - Arena storage for the reaction tree.
//!
//! Nodes are NOT objects. A [`ReactionNode`] is a copyable handle holding a
//! [`NodeId`] into a thread-local arena. `master` and `slaves` are stored as
//! ids, so a reparent is a single index write under one borrow.
//!
//! Ids are never reused: a handle to a destroyed node stays dead.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::rc::Rc;

use serde_json::Value;
use spark_signals::{signal, Signal};

use super::{channel, router};
use crate::error::{ReactionError, Result};
use crate::types::{Action, Mutation};

// =============================================================================
// Ids and callback types
// =============================================================================

/// Stable identifier of a reaction node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    /// Raw arena index.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Local state reducer: `(state, action) -> state`.
pub type Reducer = Rc<dyn Fn(&Value, &Action) -> Value>;

/// Derivation function: `(action, previous_action, state) -> mutation | none`.
///
/// Must be pure with respect to the tree. Dispatches or topology changes
/// requested from inside are deferred until the current turn completes.
pub type DeriveFn = Rc<dyn Fn(&Action, Option<&Action>, &Value) -> Option<Mutation>>;

// =============================================================================
// Node options
// =============================================================================

/// Construction options for [`create_node`].
#[derive(Clone, Default)]
pub struct NodeOptions {
    pub master: Option<ReactionNode>,
    pub reducer: Option<Reducer>,
    pub derive: Option<DeriveFn>,
    pub initial_state: Value,
}

impl NodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach under `master` on creation.
    pub fn master(mut self, master: ReactionNode) -> Self {
        self.master = Some(master);
        self
    }

    pub fn reducer<F>(mut self, reducer: F) -> Self
    where
        F: Fn(&Value, &Action) -> Value + 'static,
    {
        self.reducer = Some(Rc::new(reducer));
        self
    }

    pub fn derive<F>(mut self, derive: F) -> Self
    where
        F: Fn(&Action, Option<&Action>, &Value) -> Option<Mutation> + 'static,
    {
        self.derive = Some(Rc::new(derive));
        self
    }

    /// Local state before the first action (also restored by `rebuild`).
    pub fn initial_state(mut self, state: Value) -> Self {
        self.initial_state = state;
        self
    }
}

// =============================================================================
// Arena
// =============================================================================

pub(crate) struct NodeEntry {
    pub(crate) master: Option<NodeId>,
    /// Attachment order; this is the broadcast order among siblings.
    pub(crate) slaves: Vec<NodeId>,
    pub(crate) reducer: Option<Reducer>,
    pub(crate) derive: Option<DeriveFn>,
    pub(crate) initial_state: Value,
    pub(crate) local_state: Value,
    pub(crate) previous_action: Option<Action>,
    pub(crate) last_mutation: Signal<Option<Mutation>>,
}

thread_local! {
    static NODES: RefCell<HashMap<NodeId, NodeEntry>> = RefCell::new(HashMap::new());

    static NEXT_NODE_ID: RefCell<usize> = const { RefCell::new(0) };
}

/// Read a node entry. Returns None for dead nodes.
pub(crate) fn with_node<R>(id: NodeId, f: impl FnOnce(&NodeEntry) -> R) -> Option<R> {
    NODES.with(|nodes| nodes.borrow().get(&id).map(f))
}

/// Mutate a node entry. Returns None for dead nodes.
pub(crate) fn with_node_mut<R>(id: NodeId, f: impl FnOnce(&mut NodeEntry) -> R) -> Option<R> {
    NODES.with(|nodes| nodes.borrow_mut().get_mut(&id).map(f))
}

pub(crate) fn contains(id: NodeId) -> bool {
    NODES.with(|nodes| nodes.borrow().contains_key(&id))
}

pub(crate) fn master_of(id: NodeId) -> Option<NodeId> {
    with_node(id, |n| n.master).flatten()
}

/// Follow master links to the local root.
pub(crate) fn root_of(id: NodeId) -> Option<NodeId> {
    NODES.with(|nodes| {
        let nodes = nodes.borrow();
        let mut current = id;
        let mut seen = HashSet::new();
        loop {
            let entry = nodes.get(&current)?;
            if !seen.insert(current) {
                // Unreachable while the acyclic invariant holds.
                return Some(current);
            }
            match entry.master {
                Some(master) => current = master,
                None => return Some(current),
            }
        }
    })
}

/// Whether making `master` the master of `node` would close a cycle.
pub(crate) fn would_cycle(node: NodeId, master: NodeId) -> bool {
    NODES.with(|nodes| {
        let nodes = nodes.borrow();
        let mut current = Some(master);
        let mut seen = HashSet::new();
        while let Some(id) = current {
            if id == node || !seen.insert(id) {
                return true;
            }
            current = nodes.get(&id).and_then(|n| n.master);
        }
        false
    })
}

/// Every node reachable below `root` (inclusive), breadth-first.
pub(crate) fn subtree_of(root: NodeId) -> Vec<NodeId> {
    NODES.with(|nodes| {
        let nodes = nodes.borrow();
        if !nodes.contains_key(&root) {
            return Vec::new();
        }
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            order.push(id);
            if let Some(entry) = nodes.get(&id) {
                queue.extend(entry.slaves.iter().copied());
            }
        }
        order
    })
}

/// Install `node -> master` in one write, unlinking the old master.
pub(crate) fn link(node: NodeId, master: NodeId) {
    NODES.with(|nodes| {
        let mut nodes = nodes.borrow_mut();
        let old = nodes.get(&node).and_then(|n| n.master);
        // Same master: keep the node's place among its siblings.
        if old == Some(master) {
            return;
        }
        if let Some(old) = old.and_then(|old| nodes.get_mut(&old)) {
            old.slaves.retain(|s| *s != node);
        }
        if let Some(entry) = nodes.get_mut(&node) {
            entry.master = Some(master);
        }
        if let Some(entry) = nodes.get_mut(&master) {
            entry.slaves.push(node);
        }
    })
}

/// Remove `node` from its master's slave set.
pub(crate) fn unlink(node: NodeId) {
    NODES.with(|nodes| {
        let mut nodes = nodes.borrow_mut();
        let old = nodes.get_mut(&node).and_then(|n| n.master.take());
        if let Some(old) = old.and_then(|old| nodes.get_mut(&old)) {
            old.slaves.retain(|s| *s != node);
        }
    })
}

/// Reset local state and forget the previous action.
pub(crate) fn reset_local(node: NodeId) {
    let last = with_node_mut(node, |n| {
        n.local_state = n.initial_state.clone();
        n.previous_action = None;
        n.last_mutation.clone()
    });
    // Set outside the arena borrow: effects may read nodes.
    if let Some(last) = last {
        last.set(None);
    }
}

/// Remove a node from the arena. Slaves become local roots.
pub(crate) fn remove(node: NodeId) {
    unlink(node);
    NODES.with(|nodes| {
        let mut nodes = nodes.borrow_mut();
        if let Some(entry) = nodes.remove(&node) {
            for slave in entry.slaves {
                if let Some(slave) = nodes.get_mut(&slave) {
                    slave.master = None;
                }
            }
        }
    });
}

pub(crate) fn reset_nodes() {
    NODES.with(|nodes| nodes.borrow_mut().clear());
    NEXT_NODE_ID.with(|next| *next.borrow_mut() = 0);
}

/// Number of live nodes.
pub fn node_count() -> usize {
    NODES.with(|nodes| nodes.borrow().len())
}

// =============================================================================
// Creation
// =============================================================================

/// Create a node, optionally attached under a master.
///
/// A node created during a turn is not visited by that turn.
pub fn create_node(options: NodeOptions) -> Result<ReactionNode> {
    if let Some(master) = options.master {
        if !contains(master.id) {
            return Err(ReactionError::UnknownNode(master.id));
        }
    }

    let id = NEXT_NODE_ID.with(|next| {
        let mut next = next.borrow_mut();
        let id = NodeId(*next);
        *next += 1;
        id
    });

    let entry = NodeEntry {
        master: None,
        slaves: Vec::new(),
        reducer: options.reducer,
        derive: options.derive,
        local_state: options.initial_state.clone(),
        initial_state: options.initial_state,
        previous_action: None,
        last_mutation: signal(None),
    };
    NODES.with(|nodes| nodes.borrow_mut().insert(id, entry));
    channel::open(id);

    if let Some(master) = options.master {
        link(id, master.id);
        channel::resubscribe_subtrees(&[master.id]);
    }

    log::debug!("created reaction node {id}");
    Ok(ReactionNode { id })
}

// =============================================================================
// Node handle
// =============================================================================

/// Handle to a vertex of the reaction tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReactionNode {
    id: NodeId,
}

impl ReactionNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        contains(self.id)
    }

    /// Submit an action. It bubbles to the local root and is broadcast to
    /// the whole tree; inside a turn it is queued instead.
    pub fn dispatch(&self, action: Action) -> Result<()> {
        router::dispatch(*self, action)
    }

    /// Subscribe to this node's mutations from now on.
    pub fn mutations(&self) -> channel::MutationStream {
        channel::subscribe(*self)
    }

    pub fn master(&self) -> Option<ReactionNode> {
        master_of(self.id).map(|id| ReactionNode { id })
    }

    pub fn slaves(&self) -> Vec<ReactionNode> {
        with_node(self.id, |n| n.slaves.iter().map(|&id| ReactionNode { id }).collect())
            .unwrap_or_default()
    }

    /// Local root reached by following master links.
    pub fn root(&self) -> Option<ReactionNode> {
        root_of(self.id).map(|id| ReactionNode { id })
    }

    pub fn local_state(&self) -> Option<Value> {
        with_node(self.id, |n| n.local_state.clone())
    }

    pub fn previous_action(&self) -> Option<Action> {
        with_node(self.id, |n| n.previous_action.clone()).flatten()
    }

    /// Most recent mutation this node derived.
    pub fn last_mutation(&self) -> Option<Mutation> {
        self.last_mutation_signal().and_then(|s| s.get())
    }

    /// Signal tracking the most recent mutation, for reactive readers.
    pub fn last_mutation_signal(&self) -> Option<Signal<Option<Mutation>>> {
        with_node(self.id, |n| n.last_mutation.clone())
    }

    pub fn reparent(&self, master: ReactionNode) -> Result<()> {
        router::reparent(*self, master)
    }

    pub fn detach(&self) -> Result<()> {
        router::detach(*self)
    }

    /// Reparent (or detach) and reset local state.
    pub fn rebuild(&self, master: Option<ReactionNode>) -> Result<()> {
        router::rebuild(*self, master)
    }

    pub fn destroy(&self) {
        router::destroy_node(*self)
    }
}

/// Destroy a node: detach it, orphan its slaves, close its channel.
pub fn destroy_node(node: ReactionNode) {
    router::destroy_node(node)
}

// =============================================================================
// Tests
// =============================================================================
