//! Reaction Router - Bubble-then-broadcast delivery of actions.
//!
//! A dispatch is one *turn*:
//! 1. **Bubble** - follow master links from the dispatching node to its local root
//! 2. **Broadcast** - visit every node under that root (breadth-first by default)
//! 3. At each node: reduce local state, derive once, publish the mutation
//!
//! Turns never interleave. A dispatch issued while a turn is running (from a
//! derive function, a listener, or a render target) is queued and runs after
//! the current turn. Topology changes requested mid-turn are validated
//! immediately and installed between turns.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};

use log::{debug, warn};

use super::channel;
use super::node::{self, NodeId, ReactionNode};
use crate::config::{traversal, Traversal};
use crate::error::{ReactionError, Result};
use crate::types::Action;

// =============================================================================
// Router State
// =============================================================================

enum TopologyChange {
    Attach { node: NodeId, master: NodeId },
    Detach { node: NodeId },
    Rebuild { node: NodeId, master: Option<NodeId> },
    Destroy { node: NodeId },
}

#[derive(Default)]
struct RouterState {
    in_turn: bool,
    queue: VecDeque<(NodeId, Action)>,
    deferred: VecDeque<TopologyChange>,
    turns: u64,
}

thread_local! {
    static ROUTER: RefCell<RouterState> = RefCell::new(RouterState::default());
}

/// Whether a turn is currently running. False during thread teardown.
pub fn turn_in_progress() -> bool {
    ROUTER.try_with(|r| r.borrow().in_turn).unwrap_or(false)
}

/// Number of actions waiting for the current turn to finish.
pub fn queued_actions() -> usize {
    ROUTER.with(|r| r.borrow().queue.len())
}

/// Total turns completed since the last reset.
pub fn turns_completed() -> u64 {
    ROUTER.with(|r| r.borrow().turns)
}

/// Defer a topology change if a turn is running. Returns true if deferred.
fn defer_if_in_turn(change: TopologyChange) -> bool {
    ROUTER.with(|r| {
        let mut r = r.borrow_mut();
        if r.in_turn {
            r.deferred.push_back(change);
            true
        } else {
            false
        }
    })
}

/// Marks a turn as running. If a derive or handler panics, the unwind
/// clears the flag, drops queued work and settles subscription changes.
struct TurnGuard;

impl TurnGuard {
    fn enter() -> Self {
        ROUTER.with(|r| r.borrow_mut().in_turn = true);
        TurnGuard
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        let panicking = std::thread::panicking();
        ROUTER.with(|r| {
            let mut r = r.borrow_mut();
            r.in_turn = false;
            if panicking {
                r.queue.clear();
                r.deferred.clear();
            }
        });
        if panicking {
            channel::end_turn();
        }
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// Dispatch an action at `node`.
///
/// Returns once every node in the local tree has been visited, along with
/// any actions queued during the turn. Inside a turn the action is queued
/// and this returns immediately.
pub fn dispatch(node: ReactionNode, action: Action) -> Result<()> {
    let id = node.id();
    if !node::contains(id) {
        return Err(ReactionError::UnknownNode(id));
    }

    if turn_in_progress() {
        debug!(
            "re-entrant dispatch of {:?} at {id} queued until the current turn ends",
            action.kind
        );
        ROUTER.with(|r| r.borrow_mut().queue.push_back((id, action)));
        return Ok(());
    }

    let _guard = TurnGuard::enter();
    let mut next = Some((id, action));
    while let Some((origin, action)) = next {
        run_turn(origin, &action);
        channel::end_turn();
        install_deferred();
        next = ROUTER.with(|r| r.borrow_mut().queue.pop_front());
    }
    Ok(())
}

fn run_turn(origin: NodeId, action: &Action) {
    let Some(root) = node::root_of(origin) else {
        debug!("dropping {:?}: node {origin} was destroyed before its turn", action.kind);
        return;
    };

    let order = visit_order(root, traversal());
    debug!(
        "turn {:?} from {origin}: root {root}, {} nodes",
        action.kind,
        order.len()
    );

    for id in order {
        visit(id, action);
    }

    ROUTER.with(|r| r.borrow_mut().turns += 1);
}

/// Nodes under `root` in broadcast order. Each node appears once.
fn visit_order(root: NodeId, order: Traversal) -> Vec<NodeId> {
    let mut visited = Vec::new();
    let mut seen = HashSet::new();
    let mut pending = VecDeque::from([root]);

    while let Some(id) = match order {
        Traversal::BreadthFirst => pending.pop_front(),
        Traversal::DepthFirst => pending.pop_back(),
    } {
        if !seen.insert(id) {
            continue;
        }
        visited.push(id);

        let slaves = node::with_node(id, |n| n.slaves.clone()).unwrap_or_default();
        match order {
            Traversal::BreadthFirst => pending.extend(slaves),
            // Reversed so the first slave is popped first.
            Traversal::DepthFirst => pending.extend(slaves.into_iter().rev()),
        }
    }
    visited
}

/// Reduce, derive once, publish. No arena borrow is held across user code.
fn visit(id: NodeId, action: &Action) {
    let Some((reducer, derive, state, previous)) = node::with_node(id, |n| {
        (
            n.reducer.clone(),
            n.derive.clone(),
            n.local_state.clone(),
            n.previous_action.clone(),
        )
    }) else {
        return;
    };

    let state = match reducer {
        Some(reducer) => reducer(&state, action),
        None => state,
    };
    let mutation = derive.and_then(|derive| derive(action, previous.as_ref(), &state));

    let last = node::with_node_mut(id, |n| {
        n.local_state = state;
        n.previous_action = Some(action.clone());
        n.last_mutation.clone()
    });

    if let Some(mutation) = mutation {
        if let Some(last) = last {
            last.set(Some(mutation.clone()));
        }
        channel::publish(id, &mutation);
    }
}

// =============================================================================
// Topology
// =============================================================================

fn require_alive(id: NodeId) -> Result<()> {
    if node::contains(id) {
        Ok(())
    } else {
        Err(ReactionError::UnknownNode(id))
    }
}

/// Move `node` under `master`.
///
/// Fails with `CycleRejected` if `master` is `node` or one of its
/// descendants; the tree is left untouched.
pub fn reparent(node: ReactionNode, master: ReactionNode) -> Result<()> {
    let (id, master_id) = (node.id(), master.id());
    require_alive(id)?;
    require_alive(master_id)?;
    if node::would_cycle(id, master_id) {
        return Err(ReactionError::CycleRejected {
            node: id,
            master: master_id,
        });
    }

    if defer_if_in_turn(TopologyChange::Attach { node: id, master: master_id }) {
        debug!("reparent of {id} under {master_id} deferred to end of turn");
        return Ok(());
    }
    attach(id, master_id);
    Ok(())
}

/// Make `node` a local root.
pub fn detach(node: ReactionNode) -> Result<()> {
    let id = node.id();
    require_alive(id)?;

    if defer_if_in_turn(TopologyChange::Detach { node: id }) {
        debug!("detach of {id} deferred to end of turn");
        return Ok(());
    }
    node::unlink(id);
    channel::resubscribe_subtrees(&[id]);
    Ok(())
}

/// Reparent (or detach with `None`), then reset local state and
/// `previous_action`. This is destroy-and-recreate without losing the
/// node's identity or its subscribers.
pub fn rebuild(node: ReactionNode, master: Option<ReactionNode>) -> Result<()> {
    let id = node.id();
    require_alive(id)?;
    let master_id = master.map(|m| m.id());
    if let Some(master_id) = master_id {
        require_alive(master_id)?;
        if node::would_cycle(id, master_id) {
            return Err(ReactionError::CycleRejected {
                node: id,
                master: master_id,
            });
        }
    }

    if defer_if_in_turn(TopologyChange::Rebuild { node: id, master: master_id }) {
        debug!("rebuild of {id} deferred to end of turn");
        return Ok(());
    }
    install_rebuild(id, master_id);
    Ok(())
}

/// Destroy a node. Unknown nodes are ignored.
pub fn destroy_node(node: ReactionNode) {
    let id = node.id();
    if !node::contains(id) {
        return;
    }
    if defer_if_in_turn(TopologyChange::Destroy { node: id }) {
        debug!("destroy of {id} deferred to end of turn");
        return;
    }
    install_destroy(id);
}

fn attach(id: NodeId, master: NodeId) {
    node::link(id, master);
    channel::resubscribe_subtrees(&[id, master]);
}

fn install_rebuild(id: NodeId, master: Option<NodeId>) {
    match master {
        Some(master) => {
            node::link(id, master);
            channel::resubscribe_subtrees(&[id, master]);
        }
        None => {
            node::unlink(id);
            channel::resubscribe_subtrees(&[id]);
        }
    }
    node::reset_local(id);
}

fn install_destroy(id: NodeId) {
    node::remove(id);
    channel::close(id);
    channel::resubscribe_subtrees(&[id]);
    debug!("destroyed reaction node {id}");
}

/// Install topology changes requested during the last turn, in order.
///
/// Each change is re-validated: earlier deferred changes may have
/// invalidated it.
fn install_deferred() {
    while let Some(change) = ROUTER.with(|r| r.borrow_mut().deferred.pop_front()) {
        match change {
            TopologyChange::Attach { node, master } => {
                if !node::contains(node) || !node::contains(master) {
                    warn!("dropping deferred reparent of {node} under {master}: node destroyed");
                } else if node::would_cycle(node, master) {
                    warn!("dropping deferred reparent of {node} under {master}: would create a cycle");
                } else {
                    attach(node, master);
                }
            }
            TopologyChange::Detach { node } => {
                if node::contains(node) {
                    node::unlink(node);
                    channel::resubscribe_subtrees(&[node]);
                }
            }
            TopologyChange::Rebuild { node, master } => {
                let master_ok = master.is_none_or(|m| node::contains(m) && !node::would_cycle(node, m));
                if !node::contains(node) || !master_ok {
                    warn!("dropping deferred rebuild of {node}: tree changed during the turn");
                } else {
                    install_rebuild(node, master);
                }
            }
            TopologyChange::Destroy { node } => {
                if node::contains(node) {
                    install_destroy(node);
                }
            }
        }
    }
}

pub(crate) fn reset_router() {
    ROUTER.with(|r| *r.borrow_mut() = RouterState::default());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::set_traversal;
    use crate::engine::{create_node, reset_engine, NodeOptions};
    use crate::types::Mutation;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn setup() {
        reset_engine();
        set_traversal(Traversal::BreadthFirst);
    }

    /// Node whose derive records its name into `log`.
    fn recording(log: &Rc<RefCell<Vec<&'static str>>>, name: &'static str, master: Option<ReactionNode>) -> ReactionNode {
        let log = log.clone();
        let mut options = NodeOptions::new().derive(move |_, _, _| {
            log.borrow_mut().push(name);
            None
        });
        if let Some(master) = master {
            options = options.master(master);
        }
        create_node(options).unwrap()
    }

    fn sample_tree(log: &Rc<RefCell<Vec<&'static str>>>) -> [ReactionNode; 5] {
        let r = recording(log, "r", None);
        let a = recording(log, "a", Some(r));
        let b = recording(log, "b", Some(r));
        let a1 = recording(log, "a1", Some(a));
        let b1 = recording(log, "b1", Some(b));
        [r, a, b, a1, b1]
    }

    #[test]
    fn test_breadth_first_broadcast_from_leaf() {
        setup();
        let log = Rc::new(RefCell::new(Vec::new()));
        let [_, _, _, _, b1] = sample_tree(&log);

        b1.dispatch(Action::new("X")).unwrap();

        assert_eq!(*log.borrow(), vec!["r", "a", "b", "a1", "b1"]);
        assert_eq!(turns_completed(), 1);
    }

    #[test]
    fn test_depth_first_broadcast() {
        setup();
        set_traversal(Traversal::DepthFirst);
        let log = Rc::new(RefCell::new(Vec::new()));
        let [r, ..] = sample_tree(&log);

        r.dispatch(Action::new("X")).unwrap();

        assert_eq!(*log.borrow(), vec!["r", "a", "a1", "b", "b1"]);
        set_traversal(Traversal::BreadthFirst);
    }

    #[test]
    fn test_singleton_dispatch() {
        setup();
        let log = Rc::new(RefCell::new(Vec::new()));
        let lone = recording(&log, "lone", None);

        lone.dispatch(Action::new("X")).unwrap();
        assert_eq!(*log.borrow(), vec!["lone"]);
    }

    #[test]
    fn test_reducer_runs_before_derive_and_previous_action_is_tracked() {
        setup();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        let node = create_node(
            NodeOptions::new()
                .initial_state(json!(0))
                .reducer(|state, _| json!(state.as_i64().unwrap_or(0) + 1))
                .derive(move |action, previous, state| {
                    seen_clone.borrow_mut().push((
                        action.kind.clone(),
                        previous.map(|p| p.kind.clone()),
                        state.clone(),
                    ));
                    None
                }),
        )
        .unwrap();

        node.dispatch(Action::new("first")).unwrap();
        node.dispatch(Action::new("second")).unwrap();

        assert_eq!(
            *seen.borrow(),
            vec![
                ("first".to_string(), None, json!(1)),
                ("second".to_string(), Some("first".to_string()), json!(2)),
            ]
        );
        assert_eq!(node.local_state(), Some(json!(2)));
        assert_eq!(node.previous_action(), Some(Action::new("second")));
    }

    #[test]
    fn test_reentrant_dispatch_is_queued() {
        setup();

        let log = Rc::new(RefCell::new(Vec::new()));
        let log_clone = log.clone();
        let me: Rc<RefCell<Option<ReactionNode>>> = Rc::new(RefCell::new(None));
        let me_clone = me.clone();

        let node = create_node(NodeOptions::new().derive(move |action, _, _| {
            log_clone.borrow_mut().push(action.kind.clone());
            if action.is("ping") {
                assert!(turn_in_progress());
                let node = me_clone.borrow().unwrap();
                node.dispatch(Action::new("pong")).unwrap();
                assert_eq!(queued_actions(), 1);
                // Still inside the first turn: pong has not run yet.
                assert_eq!(log_clone.borrow().len(), 1);
            }
            None
        }))
        .unwrap();
        *me.borrow_mut() = Some(node);

        node.dispatch(Action::new("ping")).unwrap();

        assert_eq!(*log.borrow(), vec!["ping".to_string(), "pong".to_string()]);
        assert!(!turn_in_progress());
        assert_eq!(queued_actions(), 0);
        assert_eq!(turns_completed(), 2);
    }

    #[test]
    fn test_reparent_cycle_rejected_leaves_tree_unchanged() {
        setup();
        let log = Rc::new(RefCell::new(Vec::new()));
        let [r, a, b, a1, b1] = sample_tree(&log);

        let before: Vec<_> = [r, a, b, a1, b1].iter().map(|n| (n.master(), n.slaves())).collect();

        let err = r.reparent(a1).unwrap_err();
        assert_eq!(err, ReactionError::CycleRejected { node: r.id(), master: a1.id() });
        assert!(matches!(a.reparent(a), Err(ReactionError::CycleRejected { .. })));

        let after: Vec<_> = [r, a, b, a1, b1].iter().map(|n| (n.master(), n.slaves())).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_reparent_moves_subtree() {
        setup();
        let log = Rc::new(RefCell::new(Vec::new()));
        let [r, a, b, a1, _] = sample_tree(&log);

        a.reparent(b).unwrap();

        assert_eq!(r.slaves(), vec![b]);
        assert_eq!(a.master(), Some(b));
        assert_eq!(a1.root(), Some(r));
    }

    #[test]
    fn test_detach_stops_bubbling() {
        setup();
        let log = Rc::new(RefCell::new(Vec::new()));
        let [_, a, _, a1, _] = sample_tree(&log);

        a.detach().unwrap();
        a1.dispatch(Action::new("X")).unwrap();

        assert_eq!(*log.borrow(), vec!["a", "a1"]);
        assert_eq!(a.master(), None);
    }

    #[test]
    fn test_topology_change_in_turn_is_deferred() {
        setup();

        let root = create_node(NodeOptions::new()).unwrap();
        let other = create_node(NodeOptions::new()).unwrap();
        let mover: Rc<RefCell<Option<ReactionNode>>> = Rc::new(RefCell::new(None));
        let mover_clone = mover.clone();

        let node = create_node(NodeOptions::new().master(root).derive(move |_, _, _| {
            let node = mover_clone.borrow().unwrap();
            node.reparent(other).unwrap();
            // Frozen for the rest of the turn.
            assert_eq!(node.master(), Some(root));
            None
        }))
        .unwrap();
        *mover.borrow_mut() = Some(node);

        root.dispatch(Action::new("move")).unwrap();
        assert_eq!(node.master(), Some(other));
        assert!(root.slaves().is_empty());
    }

    #[test]
    fn test_rebuild_resets_local_state() {
        setup();

        let root = create_node(NodeOptions::new()).unwrap();
        let node = create_node(
            NodeOptions::new()
                .initial_state(json!("fresh"))
                .reducer(|_, action| json!(action.kind))
                .derive(|_, _, _| Some(Mutation::new(["x"]))),
        )
        .unwrap();

        node.dispatch(Action::new("used")).unwrap();
        assert_eq!(node.local_state(), Some(json!("used")));
        assert!(node.last_mutation().is_some());

        node.rebuild(Some(root)).unwrap();
        assert_eq!(node.master(), Some(root));
        assert_eq!(node.local_state(), Some(json!("fresh")));
        assert!(node.previous_action().is_none());
        assert!(node.last_mutation().is_none());
    }

    #[test]
    fn test_destroy_and_dispatch_to_dead_node() {
        setup();

        let root = create_node(NodeOptions::new()).unwrap();
        let child = create_node(NodeOptions::new().master(root)).unwrap();

        child.destroy();
        assert!(!child.is_alive());
        assert!(root.slaves().is_empty());
        assert_eq!(
            child.dispatch(Action::new("X")),
            Err(ReactionError::UnknownNode(child.id()))
        );
        assert_eq!(child.detach(), Err(ReactionError::UnknownNode(child.id())));
        // Second destroy is a no-op.
        destroy_node(child);
    }

    #[test]
    fn test_queued_actions_run_in_submission_order() {
        setup();

        let log = Rc::new(RefCell::new(Vec::new()));
        let log_clone = log.clone();
        let me: Rc<RefCell<Option<ReactionNode>>> = Rc::new(RefCell::new(None));
        let me_clone = me.clone();

        let node = create_node(NodeOptions::new().derive(move |action, _, _| {
            log_clone.borrow_mut().push(action.kind.clone());
            if action.is("start") {
                let node = me_clone.borrow().unwrap();
                for kind in ["q1", "q2", "q3"] {
                    node.dispatch(Action::new(kind)).unwrap();
                }
                assert_eq!(queued_actions(), 3);
            }
            None
        }))
        .unwrap();
        *me.borrow_mut() = Some(node);

        node.dispatch(Action::new("start")).unwrap();

        assert_eq!(*log.borrow(), vec!["start", "q1", "q2", "q3"]);
        assert_eq!(turns_completed(), 4);
    }

    #[test]
    fn test_panicking_derive_settles_subscriptions() {
        setup();

        let hits = Rc::new(RefCell::new(0));
        let cleanup: Rc<RefCell<Option<Box<dyn FnOnce()>>>> = Rc::new(RefCell::new(None));
        let late: Rc<RefCell<Option<channel::MutationStream>>> = Rc::new(RefCell::new(None));
        let me: Rc<RefCell<Option<ReactionNode>>> = Rc::new(RefCell::new(None));

        let (cleanup_clone, late_clone, me_clone) = (cleanup.clone(), late.clone(), me.clone());
        let node = create_node(NodeOptions::new().derive(move |action, _, _| {
            if action.is("boom") {
                if let Some(cleanup) = cleanup_clone.borrow_mut().take() {
                    cleanup();
                }
                let node = me_clone.borrow().unwrap();
                *late_clone.borrow_mut() = Some(node.mutations());
                panic!("derive failed");
            }
            Some(Mutation::new(["x"]))
        }))
        .unwrap();
        *me.borrow_mut() = Some(node);

        let hits_clone = hits.clone();
        let unsubscribe = channel::on_mutation(node, crate::types::MutationKinds::ALL, move |_| {
            *hits_clone.borrow_mut() += 1;
        });
        *cleanup.borrow_mut() = Some(Box::new(unsubscribe));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = node.dispatch(Action::new("boom"));
        }));
        assert!(result.is_err());
        assert!(!turn_in_progress());
        assert_eq!(queued_actions(), 0);

        node.dispatch(Action::new("ok")).unwrap();
        assert_eq!(*hits.borrow(), 0);
        assert_eq!(late.borrow().as_ref().map(|s| s.pending()), Some(1));
    }

    #[test]
    fn test_reparent_to_current_master_keeps_sibling_order() {
        setup();
        let log = Rc::new(RefCell::new(Vec::new()));
        let [r, a, b, _, _] = sample_tree(&log);

        a.reparent(r).unwrap();
        assert_eq!(r.slaves(), vec![a, b]);

        r.dispatch(Action::new("X")).unwrap();
        assert_eq!(*log.borrow(), vec!["r", "a", "b", "a1", "b1"]);
    }

    #[test]
    fn test_deferred_destroy_runs_after_turn() {
        setup();

        let log = Rc::new(RefCell::new(Vec::new()));
        let root = create_node(NodeOptions::new()).unwrap();
        let victim = recording(&log, "victim", None);
        let log_clone = log.clone();
        create_node(NodeOptions::new().master(root).derive(move |_, _, _| {
            log_clone.borrow_mut().push("killer");
            victim.destroy();
            assert!(victim.is_alive());
            None
        }))
        .unwrap();
        victim.reparent(root).unwrap();

        root.dispatch(Action::new("X")).unwrap();

        // Still visited: the turn's node set was fixed when it started.
        assert_eq!(*log.borrow(), vec!["killer", "victim"]);
        assert!(!victim.is_alive());
        assert_eq!(root.slaves().len(), 1);
    }

    #[test]
    fn test_deferred_rebuild_resets_after_turn() {
        setup();

        let root = create_node(NodeOptions::new()).unwrap();
        let me: Rc<RefCell<Option<ReactionNode>>> = Rc::new(RefCell::new(None));
        let me_clone = me.clone();
        let node = create_node(
            NodeOptions::new()
                .master(root)
                .initial_state(json!(0))
                .reducer(|state, _| json!(state.as_i64().unwrap_or(0) + 1))
                .derive(move |action, _, _| {
                    if action.is("rebuild") {
                        let node = me_clone.borrow().unwrap();
                        node.rebuild(None).unwrap();
                        assert_eq!(node.master(), Some(root));
                    }
                    None
                }),
        )
        .unwrap();
        *me.borrow_mut() = Some(node);

        node.dispatch(Action::new("count")).unwrap();
        assert_eq!(node.local_state(), Some(json!(1)));

        node.dispatch(Action::new("rebuild")).unwrap();
        assert_eq!(node.master(), None);
        assert_eq!(node.local_state(), Some(json!(0)));
        assert!(node.previous_action().is_none());
    }

    #[test]
    fn test_deferred_changes_invalidated_during_turn_are_dropped() {
        setup();

        let r = create_node(NodeOptions::new()).unwrap();
        let a = create_node(NodeOptions::new().master(r)).unwrap();
        let b = create_node(NodeOptions::new().master(r)).unwrap();
        let c = create_node(NodeOptions::new().master(r)).unwrap();

        let requests = create_node(NodeOptions::new().master(r).derive(move |_, _, _| {
            // Each is valid against the tree as it stands during the turn.
            a.reparent(b).unwrap();
            b.reparent(a).unwrap();
            c.destroy();
            c.reparent(a).unwrap();
            None
        }))
        .unwrap();

        r.dispatch(Action::new("X")).unwrap();

        assert_eq!(a.master(), Some(b));
        assert_eq!(b.master(), Some(r));
        assert!(!c.is_alive());
        assert_eq!(r.slaves(), vec![b, requests]);
        assert_eq!(b.slaves(), vec![a]);
    }
}
