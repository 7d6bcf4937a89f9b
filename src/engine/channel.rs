//! Mutation Channels - Multicast delivery of derived mutations.
//!
//! Every node owns one channel. Subscribers come in three shapes:
//! - [`MutationStream`] - pull-based, one queue (cursor) per subscriber
//! - [`on_mutation`] - push listener on a single node
//! - [`on_subtree_mutation`] - push listener spanning a node's whole subtree
//!
//! Each subscriber sees every mutation published from its subscription point
//! forward. Subscribing or unsubscribing while a turn is in progress is
//! deferred until the turn ends, so a turn delivers to a fixed audience.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use super::node::{self, NodeId, ReactionNode};
use super::router;
use crate::types::{Mutation, MutationKinds};

/// Push handler for mutations.
pub type MutationHandler = Rc<dyn Fn(&Mutation)>;

// =============================================================================
// Registry
// =============================================================================

struct Listener {
    id: usize,
    kinds: MutationKinds,
    handler: MutationHandler,
    active: bool,
}

struct SubtreeListener {
    root: NodeId,
    kinds: MutationKinds,
    handler: MutationHandler,
    members: HashSet<NodeId>,
    active: bool,
}

struct StreamCursor {
    pending: VecDeque<Mutation>,
    active: bool,
}

#[derive(Default)]
struct ChannelState {
    streams: HashMap<usize, StreamCursor>,
    listeners: Vec<Listener>,
}

enum PendingChange {
    Activate(usize),
    Remove(usize),
}

#[derive(Default)]
struct ChannelRegistry {
    channels: HashMap<NodeId, ChannelState>,
    subtree_listeners: Vec<(usize, SubtreeListener)>,
    pending: Vec<PendingChange>,
    next_id: usize,
}

impl ChannelRegistry {
    fn next_id(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn activate(&mut self, id: usize) {
        for channel in self.channels.values_mut() {
            if let Some(stream) = channel.streams.get_mut(&id) {
                stream.active = true;
            }
            for listener in channel.listeners.iter_mut().filter(|l| l.id == id) {
                listener.active = true;
            }
        }
        for (_, listener) in self.subtree_listeners.iter_mut().filter(|(sid, _)| *sid == id) {
            listener.active = true;
        }
    }

    fn remove(&mut self, id: usize) {
        for channel in self.channels.values_mut() {
            channel.streams.remove(&id);
            channel.listeners.retain(|l| l.id != id);
        }
        self.subtree_listeners.retain(|(sid, _)| *sid != id);
    }
}

thread_local! {
    static CHANNELS: RefCell<ChannelRegistry> = RefCell::new(ChannelRegistry::default());
}

/// Runs from `Drop`, so it must tolerate thread-local teardown: a stream
/// kept in another thread-local may outlive the registry.
fn unsubscribe(id: usize) {
    let deferred = router::turn_in_progress();
    let _ = CHANNELS.try_with(|reg| {
        let mut reg = reg.borrow_mut();
        if deferred {
            reg.pending.push(PendingChange::Remove(id));
        } else {
            reg.remove(id);
        }
    });
}

// =============================================================================
// Channel lifecycle (driven by the node arena / router)
// =============================================================================

pub(crate) fn open(node: NodeId) {
    CHANNELS.with(|reg| {
        reg.borrow_mut().channels.entry(node).or_default();
    });
}

/// Close a node's channel. Streams report closed; listeners are dropped.
pub(crate) fn close(node: NodeId) {
    CHANNELS.with(|reg| {
        reg.borrow_mut().channels.remove(&node);
    });
}

/// Apply subscription changes requested during the turn that just ended.
///
/// Also runs when a turn unwinds, so a panicking derive cannot leave a
/// removed listener live or a new one inactive.
pub(crate) fn end_turn() {
    let _ = CHANNELS.try_with(|reg| {
        let mut reg = reg.borrow_mut();
        let pending = std::mem::take(&mut reg.pending);
        for change in pending {
            match change {
                PendingChange::Activate(id) => reg.activate(id),
                PendingChange::Remove(id) => reg.remove(id),
            }
        }
    });
}

/// Recompute the membership of subtree listeners affected by a topology
/// change at `touched`.
///
/// A listener is affected when one of the touched nodes is currently a
/// member: the node that moved, its new master, or a destroyed node.
pub(crate) fn resubscribe_subtrees(touched: &[NodeId]) {
    let roots: Vec<(usize, NodeId)> = CHANNELS.with(|reg| {
        reg.borrow()
            .subtree_listeners
            .iter()
            .filter(|(_, l)| touched.iter().any(|id| l.members.contains(id)))
            .map(|(id, l)| (*id, l.root))
            .collect()
    });
    if roots.is_empty() {
        return;
    }

    // Computed outside the channel borrow; the arena has its own.
    let mut memberships: HashMap<usize, HashSet<NodeId>> = roots
        .into_iter()
        .map(|(id, root)| (id, node::subtree_of(root).into_iter().collect()))
        .collect();

    CHANNELS.with(|reg| {
        let mut reg = reg.borrow_mut();
        for (id, listener) in reg.subtree_listeners.iter_mut() {
            if let Some(members) = memberships.remove(id) {
                listener.members = members;
            }
        }
    });
}

// =============================================================================
// Publishing
// =============================================================================

/// Publish a mutation on a node's channel.
///
/// Stream queues are fed first, then push handlers run in subscription order
/// with no channel borrow held, so handlers may subscribe, unsubscribe or
/// dispatch freely.
pub(crate) fn publish(node: NodeId, mutation: &Mutation) {
    let mask = mutation.kind.mask();
    let handlers: Vec<MutationHandler> = CHANNELS.with(|reg| {
        let mut reg = reg.borrow_mut();
        let mut handlers = Vec::new();

        if let Some(channel) = reg.channels.get_mut(&node) {
            for stream in channel.streams.values_mut().filter(|s| s.active) {
                stream.pending.push_back(mutation.clone());
            }
            handlers.extend(
                channel
                    .listeners
                    .iter()
                    .filter(|l| l.active && l.kinds.intersects(mask))
                    .map(|l| l.handler.clone()),
            );
        }

        handlers.extend(
            reg.subtree_listeners
                .iter()
                .filter(|(_, l)| l.active && l.kinds.intersects(mask) && l.members.contains(&node))
                .map(|(_, l)| l.handler.clone()),
        );
        handlers
    });

    for handler in handlers {
        handler(mutation);
    }
}

// =============================================================================
// Streams
// =============================================================================

/// Lazy, per-subscriber sequence of a node's mutations.
///
/// Starts empty at subscription time. `next()` yields queued mutations and
/// returns `None` when nothing is pending; more may arrive later. Dropping
/// the stream unsubscribes.
pub struct MutationStream {
    node: NodeId,
    id: usize,
}

/// Subscribe a new stream to a node's channel.
pub fn subscribe(node: ReactionNode) -> MutationStream {
    let deferred = router::turn_in_progress();
    let id = CHANNELS.with(|reg| {
        let mut reg = reg.borrow_mut();
        let id = reg.next_id();
        if let Some(channel) = reg.channels.get_mut(&node.id()) {
            channel.streams.insert(
                id,
                StreamCursor {
                    pending: VecDeque::new(),
                    active: !deferred,
                },
            );
        }
        if deferred {
            reg.pending.push(PendingChange::Activate(id));
        }
        id
    });
    MutationStream { node: node.id(), id }
}

impl MutationStream {
    /// Node this stream listens to.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// True once the node has been destroyed.
    pub fn is_closed(&self) -> bool {
        CHANNELS.with(|reg| {
            reg.borrow()
                .channels
                .get(&self.node)
                .is_none_or(|c| !c.streams.contains_key(&self.id))
        })
    }

    /// Number of mutations waiting to be read.
    pub fn pending(&self) -> usize {
        CHANNELS.with(|reg| {
            reg.borrow()
                .channels
                .get(&self.node)
                .and_then(|c| c.streams.get(&self.id))
                .map_or(0, |s| s.pending.len())
        })
    }

    /// Take everything queued so far.
    pub fn drain(&mut self) -> Vec<Mutation> {
        CHANNELS.with(|reg| {
            reg.borrow_mut()
                .channels
                .get_mut(&self.node)
                .and_then(|c| c.streams.get_mut(&self.id))
                .map(|s| s.pending.drain(..).collect())
                .unwrap_or_default()
        })
    }
}

impl Iterator for MutationStream {
    type Item = Mutation;

    fn next(&mut self) -> Option<Mutation> {
        CHANNELS.with(|reg| {
            reg.borrow_mut()
                .channels
                .get_mut(&self.node)
                .and_then(|c| c.streams.get_mut(&self.id))
                .and_then(|s| s.pending.pop_front())
        })
    }
}

impl Drop for MutationStream {
    fn drop(&mut self) {
        unsubscribe(self.id);
    }
}

// =============================================================================
// Push listeners
// =============================================================================

/// Subscribe a handler to one node's mutations of the given kinds.
/// Returns cleanup function.
pub fn on_mutation<F>(node: ReactionNode, kinds: MutationKinds, handler: F) -> impl FnOnce()
where
    F: Fn(&Mutation) + 'static,
{
    let deferred = router::turn_in_progress();
    let id = CHANNELS.with(|reg| {
        let mut reg = reg.borrow_mut();
        let id = reg.next_id();
        if let Some(channel) = reg.channels.get_mut(&node.id()) {
            channel.listeners.push(Listener {
                id,
                kinds,
                handler: Rc::new(handler),
                active: !deferred,
            });
        }
        if deferred {
            reg.pending.push(PendingChange::Activate(id));
        }
        id
    });

    move || unsubscribe(id)
}

/// Subscribe a handler to every node in `root`'s subtree.
///
/// Membership follows the tree: reparenting a node into or out of the
/// subtree adds or removes it. Returns cleanup function.
pub fn on_subtree_mutation<F>(root: ReactionNode, kinds: MutationKinds, handler: F) -> impl FnOnce()
where
    F: Fn(&Mutation) + 'static,
{
    let deferred = router::turn_in_progress();
    let members: HashSet<NodeId> = node::subtree_of(root.id()).into_iter().collect();
    let id = CHANNELS.with(|reg| {
        let mut reg = reg.borrow_mut();
        let id = reg.next_id();
        reg.subtree_listeners.push((
            id,
            SubtreeListener {
                root: root.id(),
                kinds,
                handler: Rc::new(handler),
                members,
                active: !deferred,
            },
        ));
        if deferred {
            reg.pending.push(PendingChange::Activate(id));
        }
        id
    });

    move || unsubscribe(id)
}

/// Number of push listeners (single-node and subtree) currently registered.
pub fn listener_count() -> usize {
    CHANNELS.with(|reg| {
        let reg = reg.borrow();
        reg.channels.values().map(|c| c.listeners.len()).sum::<usize>() + reg.subtree_listeners.len()
    })
}

pub(crate) fn reset_channels() {
    CHANNELS.with(|reg| *reg.borrow_mut() = ChannelRegistry::default());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{create_node, reset_engine, NodeOptions};
    use std::cell::Cell;

    fn setup() -> ReactionNode {
        reset_engine();
        create_node(NodeOptions::new()).unwrap()
    }

    #[test]
    fn test_stream_sees_mutations_after_subscription() {
        let node = setup();

        publish(node.id(), &Mutation::new(["before"]));
        let mut stream = node.mutations();
        publish(node.id(), &Mutation::new(["after"]));

        assert_eq!(stream.pending(), 1);
        assert_eq!(stream.next().unwrap().target, vec!["after".to_string()]);
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_streams_are_independent() {
        let node = setup();

        let mut first = node.mutations();
        publish(node.id(), &Mutation::new(["a"]));
        let mut second = node.mutations();
        publish(node.id(), &Mutation::new(["b"]));

        assert_eq!(first.drain().len(), 2);
        assert_eq!(second.drain().len(), 1);
    }

    #[test]
    fn test_dropped_stream_unsubscribes() {
        let node = setup();

        let stream = node.mutations();
        let id = stream.id;
        drop(stream);

        let still_there = CHANNELS.with(|reg| {
            reg.borrow().channels[&node.id()].streams.contains_key(&id)
        });
        assert!(!still_there);
    }

    #[test]
    fn test_listener_kind_filter_and_cleanup() {
        let node = setup();

        let count = Rc::new(Cell::new(0));
        let count_clone = count.clone();
        let cleanup = on_mutation(node, MutationKinds::STICKY_PROP, move |_| {
            count_clone.set(count_clone.get() + 1);
        });

        publish(node.id(), &Mutation::new(["a"]));
        assert_eq!(count.get(), 0);

        publish(node.id(), &Mutation::new(["a"]).sticky());
        assert_eq!(count.get(), 1);

        cleanup();
        publish(node.id(), &Mutation::new(["a"]).sticky());
        assert_eq!(count.get(), 1);
        assert_eq!(listener_count(), 0);
    }

    #[test]
    fn test_closed_channel() {
        let node = setup();

        let stream = node.mutations();
        assert!(!stream.is_closed());

        close(node.id());
        assert!(stream.is_closed());
        assert_eq!(stream.pending(), 0);
    }

    #[test]
    fn test_subtree_listener_membership() {
        let root = setup();
        let child = create_node(NodeOptions::new().master(root)).unwrap();
        let outsider = create_node(NodeOptions::new()).unwrap();

        let seen = Rc::new(Cell::new(0));
        let seen_clone = seen.clone();
        let _cleanup = on_subtree_mutation(root, MutationKinds::ALL, move |_| {
            seen_clone.set(seen_clone.get() + 1);
        });

        publish(child.id(), &Mutation::new(["x"]));
        publish(outsider.id(), &Mutation::new(["x"]));
        assert_eq!(seen.get(), 1);
    }

    #[test]
    fn test_subscribing_mid_turn_waits_for_next_turn() {
        setup();
        let root = create_node(NodeOptions::new().derive(|_, _, _| Some(Mutation::new(["root"]))))
            .unwrap();
        let child = create_node(
            NodeOptions::new()
                .master(root)
                .derive(|_, _, _| Some(Mutation::new(["child"]))),
        )
        .unwrap();

        let late_stream: Rc<RefCell<Option<MutationStream>>> = Rc::new(RefCell::new(None));
        let late_hits = Rc::new(Cell::new(0));
        let (stream_slot, hits) = (late_stream.clone(), late_hits.clone());
        let _cleanup = on_mutation(root, MutationKinds::ALL, move |_| {
            if stream_slot.borrow().is_some() {
                return;
            }
            // Root publishes before child within the turn.
            *stream_slot.borrow_mut() = Some(child.mutations());
            let hits = hits.clone();
            // Cleanup dropped uncalled: stays subscribed.
            let _ = on_mutation(child, MutationKinds::ALL, move |_| {
                hits.set(hits.get() + 1);
            });
        });

        root.dispatch(crate::types::Action::new("first")).unwrap();
        assert_eq!(late_stream.borrow().as_ref().map(MutationStream::pending), Some(0));
        assert_eq!(late_hits.get(), 0);

        root.dispatch(crate::types::Action::new("second")).unwrap();
        assert_eq!(late_stream.borrow().as_ref().map(MutationStream::pending), Some(1));
        assert_eq!(late_hits.get(), 1);
    }

    #[test]
    fn test_subtree_membership_follows_creation_and_destroy() {
        let root = setup();
        let child = create_node(NodeOptions::new().master(root)).unwrap();

        let seen = Rc::new(Cell::new(0));
        let seen_clone = seen.clone();
        let _cleanup = on_subtree_mutation(root, MutationKinds::ALL, move |_| {
            seen_clone.set(seen_clone.get() + 1);
        });

        let grandchild = create_node(NodeOptions::new().master(child)).unwrap();
        publish(grandchild.id(), &Mutation::new(["x"]));
        assert_eq!(seen.get(), 1);

        child.destroy();
        publish(grandchild.id(), &Mutation::new(["x"]));
        assert_eq!(seen.get(), 1);
        assert_eq!(grandchild.root(), Some(grandchild));
    }

    #[test]
    fn test_unrelated_subtree_listener_keeps_members() {
        let left = setup();
        let right = create_node(NodeOptions::new()).unwrap();
        let left_child = create_node(NodeOptions::new().master(left)).unwrap();

        let seen = Rc::new(Cell::new(0));
        let seen_clone = seen.clone();
        let _cleanup = on_subtree_mutation(left, MutationKinds::ALL, move |_| {
            seen_clone.set(seen_clone.get() + 1);
        });

        let right_child = create_node(NodeOptions::new().master(right)).unwrap();
        right_child.detach().unwrap();

        publish(left_child.id(), &Mutation::new(["x"]));
        publish(right_child.id(), &Mutation::new(["x"]));
        assert_eq!(seen.get(), 1);
    }

    #[test]
    fn test_stream_dropped_during_thread_teardown() {
        thread_local! {
            static KEPT: RefCell<Option<MutationStream>> = const { RefCell::new(None) };
        }

        let worker = std::thread::spawn(|| {
            let node = setup();
            let stream = node.mutations();
            KEPT.with(|kept| *kept.borrow_mut() = Some(stream));
        });
        assert!(worker.join().is_ok());
    }
}
