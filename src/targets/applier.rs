//! Mutation Applier - Apply matched mutations by lifetime class.
//!
//! - **ImperativeAttribute**: written straight to the attribute surface,
//!   nothing is retained. The next normal render of the target wins.
//! - **TransientProp**: kept as an override layer for the handle's current
//!   prop generation only. `begin_prop_generation` discards it.
//! - **StickyProp**: stored per `(path, event_key)` until a sticky mutation
//!   with the identical key replaces it, or it is cleared.
//!
//! The prop override layer a target sees for a scope is every sticky and
//! transient layer addressing that scope, merged in arrival order (last
//! write wins). Whenever a layer changes, the full layer is re-pushed.
//!
//! Sticky storage is keyed by path, not by handle: it survives unmount and
//! is pushed again when a handle registers at the same path.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

use log::debug;

use super::pattern::{self, TargetSet};
use super::registry::{self, HandleId, RenderHandle, Surface};
use crate::engine::{on_mutation, ReactionNode};
use crate::types::{merge_bag, EventKey, Mutation, MutationKind, MutationKinds, PropBag, Scope};

// =============================================================================
// State
// =============================================================================

/// Key of a stored sticky value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct StickyKey {
    pub path: Vec<String>,
    pub event_key: Option<Vec<EventKey>>,
}

struct StickyValue {
    seq: u64,
    payload: PropBag,
}

struct TransientLayer {
    scope: Scope,
    seq: u64,
    payload: PropBag,
}

struct TransientState {
    generation: u64,
    layers: Vec<TransientLayer>,
}

#[derive(Default)]
struct ApplierState {
    sticky: BTreeMap<StickyKey, StickyValue>,
    transient: HashMap<HandleId, TransientState>,
    /// Arrival counter ordering sticky and transient layers.
    seq: u64,
}

impl ApplierState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Sticky entries stored for one path. Keys sort by path first, so this
    /// is a contiguous run starting at the path's keyless entry.
    fn sticky_at<'a>(
        &'a self,
        path: &'a [String],
    ) -> impl Iterator<Item = (&'a StickyKey, &'a StickyValue)> + 'a {
        let start = StickyKey {
            path: path.to_vec(),
            event_key: None,
        };
        self.sticky.range(start..).take_while(move |(key, _)| key.path == path)
    }

    fn store_sticky(&mut self, path: &[String], mutation: &Mutation) {
        let seq = self.next_seq();
        self.sticky.insert(
            StickyKey {
                path: path.to_vec(),
                event_key: mutation.event_key.clone(),
            },
            StickyValue {
                seq,
                payload: mutation.payload.clone(),
            },
        );
    }
}

thread_local! {
    static APPLIER: RefCell<ApplierState> = RefCell::new(ApplierState::default());
}

// =============================================================================
// Application
// =============================================================================

/// Apply a mutation to one matched handle.
///
/// A handle that is stale, or becomes stale part-way through (a target
/// unregistering itself from inside `apply`), is skipped silently.
pub fn apply_mutation(handle: &RenderHandle, mutation: &Mutation) {
    let Some(target) = registry::target_of(handle) else {
        debug!("skipping {:?} mutation for stale handle {}", mutation.kind, handle.id());
        return;
    };
    let scopes = mutation.scopes();

    match mutation.kind {
        MutationKind::ImperativeAttribute => {
            for scope in &scopes {
                if !registry::is_registered(handle) {
                    return;
                }
                target.apply(scope, Surface::Attributes, &mutation.payload);
            }
        }
        MutationKind::TransientProp => {
            let Some(generation) = registry::prop_generation(handle) else {
                return;
            };
            APPLIER.with(|state| {
                let mut state = state.borrow_mut();
                let seq = state.next_seq();
                let entry = state.transient.entry(handle.id()).or_insert(TransientState {
                    generation,
                    layers: Vec::new(),
                });
                if entry.generation != generation {
                    entry.generation = generation;
                    entry.layers.clear();
                }
                entry.layers.extend(scopes.iter().map(|scope| TransientLayer {
                    scope: scope.clone(),
                    seq,
                    payload: mutation.payload.clone(),
                }));
            });
            push_overrides(handle, &scopes);
        }
        MutationKind::StickyProp => {
            APPLIER.with(|state| state.borrow_mut().store_sticky(handle.path(), mutation));
            push_overrides(handle, &scopes);
        }
    }
}

/// Apply a mutation to every registered handle it selects.
///
/// Returns the number of handles it was applied to; zero means it was
/// unmatched and dropped. A sticky mutation naming an exact path with
/// nothing mounted there is still stored, so it replaces the value a later
/// mount restores.
pub fn apply_to_matches(mutation: &Mutation) -> usize {
    let handles = pattern::match_handles(mutation);
    for handle in &handles {
        apply_mutation(handle, mutation);
    }
    if mutation.kind == MutationKind::StickyProp {
        let set = TargetSet::from_mutation(mutation);
        for path in set.exact_paths() {
            store_unmounted_sticky(path, mutation);
        }
    }
    handles.len()
}

/// Store a sticky mutation for a path with no live handle.
pub(crate) fn store_unmounted_sticky(path: &[String], mutation: &Mutation) {
    if registry::handle_at(path).is_some() {
        return;
    }
    debug!("storing sticky mutation for unmounted {:?}", registry::join_path(path));
    APPLIER.with(|state| state.borrow_mut().store_sticky(path, mutation));
}

/// Subscribe an applier to a node's channel: every mutation it publishes is
/// applied to all matching handles. Returns cleanup function.
pub fn connect_applier(node: ReactionNode) -> impl FnOnce() {
    on_mutation(node, MutationKinds::ALL, |mutation| {
        apply_to_matches(mutation);
    })
}

/// Push the current override layer for each scope.
fn push_overrides(handle: &RenderHandle, scopes: &[Scope]) {
    let Some(target) = registry::target_of(handle) else {
        return;
    };
    for scope in scopes {
        if !registry::is_registered(handle) {
            return;
        }
        let overrides = prop_overrides(handle, scope);
        target.apply(scope, Surface::PropOverrides, &overrides);
    }
}

// =============================================================================
// Prop generations and overrides
// =============================================================================

/// The owner assigned new props to this handle.
///
/// Transient layers from the previous generation are discarded and the
/// remaining (sticky) layer is re-pushed for the scopes they covered.
pub fn begin_prop_generation(handle: &RenderHandle) {
    if registry::bump_generation(handle).is_none() {
        return;
    }
    let expired = APPLIER.with(|state| state.borrow_mut().transient.remove(&handle.id()));
    let Some(expired) = expired else {
        return;
    };

    let mut scopes: Vec<Scope> = expired.layers.into_iter().map(|l| l.scope).collect();
    scopes.sort();
    scopes.dedup();
    push_overrides(handle, &scopes);
}

/// Sticky and transient overrides addressing `scope`, merged in arrival order.
pub fn prop_overrides(handle: &RenderHandle, scope: &Scope) -> PropBag {
    let generation = registry::prop_generation(handle);

    APPLIER.with(|state| {
        let state = state.borrow();
        let mut layers: Vec<(u64, &PropBag)> = state
            .sticky_at(handle.path())
            .filter(|(key, _)| scope.is_addressed_by(key.event_key.as_deref()))
            .map(|(_, value)| (value.seq, &value.payload))
            .collect();

        if let Some(transient) = state.transient.get(&handle.id()) {
            if Some(transient.generation) == generation {
                layers.extend(
                    transient
                        .layers
                        .iter()
                        .filter(|l| l.scope == *scope)
                        .map(|l| (l.seq, &l.payload)),
                );
            }
        }

        layers.sort_by_key(|(seq, _)| *seq);
        let mut merged = PropBag::new();
        for (_, payload) in layers {
            merge_bag(&mut merged, payload);
        }
        merged
    })
}

// =============================================================================
// Sticky store
// =============================================================================

/// Stored sticky payload for an exact key.
pub fn sticky_value(path: &[String], event_key: Option<&[EventKey]>) -> Option<PropBag> {
    let key = StickyKey {
        path: path.to_vec(),
        event_key: event_key.map(<[EventKey]>::to_vec),
    };
    APPLIER.with(|state| state.borrow().sticky.get(&key).map(|v| v.payload.clone()))
}

/// All stored sticky keys, in key order.
pub fn sticky_keys() -> Vec<StickyKey> {
    APPLIER.with(|state| state.borrow().sticky.keys().cloned().collect())
}

/// Remove one sticky value. The live handle at the path, if any, gets its
/// override layer re-pushed. Returns whether a value was removed.
pub fn clear_sticky(path: &[String], event_key: Option<&[EventKey]>) -> bool {
    let key = StickyKey {
        path: path.to_vec(),
        event_key: event_key.map(<[EventKey]>::to_vec),
    };
    let removed = APPLIER.with(|state| state.borrow_mut().sticky.remove(&key).is_some());
    if removed {
        if let Some(handle) = registry::handle_at(path) {
            push_overrides(&handle, &Scope::expand(event_key));
        }
    }
    removed
}

/// Remove every sticky value, re-pushing override layers of live handles.
pub fn clear_all_sticky() {
    let keys = APPLIER.with(|state| std::mem::take(&mut state.borrow_mut().sticky));
    for key in keys.into_keys() {
        if let Some(handle) = registry::handle_at(&key.path) {
            push_overrides(&handle, &Scope::expand(key.event_key.as_deref()));
        }
    }
}

// =============================================================================
// Registry hooks
// =============================================================================

/// Push stored sticky layers to a freshly registered handle.
pub(crate) fn restore_sticky(handle: &RenderHandle) {
    let mut scopes: Vec<Scope> = APPLIER.with(|state| {
        state
            .borrow()
            .sticky_at(handle.path())
            .flat_map(|(key, _)| Scope::expand(key.event_key.as_deref()))
            .collect()
    });
    if scopes.is_empty() {
        return;
    }
    scopes.sort();
    scopes.dedup();
    debug!("restoring {} sticky scope(s) on {:?}", scopes.len(), handle.name());
    push_overrides(handle, &scopes);
}

/// Drop per-handle state. Sticky values are path-keyed and stay.
pub(crate) fn forget_handle(id: HandleId) {
    let _ = APPLIER.try_with(|state| state.borrow_mut().transient.remove(&id));
}

pub(crate) fn reset_applier() {
    APPLIER.with(|state| *state.borrow_mut() = ApplierState::default());
}

// =============================================================================
// Tests
// =============================================================================
