//! Render Handle Registry - Path index of mounted render targets.
//!
//! The rendering side registers a handle on mount and unregisters it on
//! unmount. The registry holds the one piece of shared state the matcher
//! reads:
//! - path → handle entry (ordered, so prefix patterns scan a contiguous run)
//! - handle id → joined name (for staleness checks)
//! - ReactiveSet of registered paths (deriveds react to mount/unmount)
//!
//! A handle whose entry has been removed or replaced is *stale*; applying
//! to it is a silent no-op.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

use log::{debug, warn};
use spark_signals::ReactiveSet;

use super::applier;
use super::pattern::TargetSet;
use crate::config::segment_separator;
use crate::types::{PropBag, Scope};

// =============================================================================
// Render target capability
// =============================================================================

/// Which surface of a render target a write lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    /// Imperative attributes. Overwritten by the target's next normal render.
    Attributes,
    /// The full prop override layer for a scope (sticky + transient).
    /// Replaces whatever layer the target held for that scope.
    PropOverrides,
}

/// Capability supplied by the rendering side to receive mutations.
pub trait RenderTarget {
    fn apply(&self, scope: &Scope, surface: Surface, bag: &PropBag);
}

impl<F> RenderTarget for F
where
    F: Fn(&Scope, Surface, &PropBag),
{
    fn apply(&self, scope: &Scope, surface: Surface, bag: &PropBag) {
        self(scope, surface, bag)
    }
}

// =============================================================================
// Handles
// =============================================================================

/// Unique id of one registration. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// A registered render handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderHandle {
    id: HandleId,
    path: Rc<[String]>,
}

impl RenderHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Hierarchical identity.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Path joined with the configured separator.
    pub fn name(&self) -> String {
        join_path(&self.path)
    }
}

struct HandleEntry {
    handle: RenderHandle,
    target: Rc<dyn RenderTarget>,
    /// Prop generation: bumped each time the owner assigns new props.
    generation: u64,
}

thread_local! {
    static HANDLES: RefCell<BTreeMap<Vec<String>, HandleEntry>> = RefCell::new(BTreeMap::new());

    static HANDLE_NAMES: RefCell<HashMap<HandleId, String>> = RefCell::new(HashMap::new());

    /// Registered paths (joined), reactive.
    static REGISTERED_PATHS: RefCell<ReactiveSet<String>> = RefCell::new(ReactiveSet::new());

    static NEXT_HANDLE_ID: RefCell<u64> = const { RefCell::new(0) };
}

/// Split a textual name into path segments.
pub fn parse_path(name: &str) -> Vec<String> {
    name.split(segment_separator()).map(str::to_string).collect()
}

/// Join path segments into a textual name.
pub fn join_path(path: &[String]) -> String {
    path.join(&segment_separator().to_string())
}

// =============================================================================
// Register / unregister
// =============================================================================

/// Register a render target at `path`.
///
/// A path holds one handle: registering over an occupied path replaces the
/// previous handle, which becomes stale. Sticky overrides stored for the
/// path are pushed to the new target right away.
pub fn register_handle<I, S, T>(path: I, target: T) -> RenderHandle
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
    T: RenderTarget + 'static,
{
    register_shared(path.into_iter().map(Into::into).collect(), Rc::new(target))
}

pub(crate) fn register_shared(path: Vec<String>, target: Rc<dyn RenderTarget>) -> RenderHandle {
    let id = NEXT_HANDLE_ID.with(|next| {
        let mut next = next.borrow_mut();
        let id = HandleId(*next);
        *next += 1;
        id
    });
    let handle = RenderHandle {
        id,
        path: path.clone().into(),
    };

    let replaced = HANDLES.with(|handles| {
        handles.borrow_mut().insert(
            path,
            HandleEntry {
                handle: handle.clone(),
                target,
                generation: 0,
            },
        )
    });
    if let Some(old) = replaced {
        warn!(
            "render handle {} replaced {} at {:?}",
            id,
            old.handle.id,
            handle.name()
        );
        HANDLE_NAMES.with(|names| names.borrow_mut().remove(&old.handle.id));
        applier::forget_handle(old.handle.id);
    }
    let name = handle.name();
    HANDLE_NAMES.with(|names| names.borrow_mut().insert(id, name.clone()));
    debug!("registered render handle {id} at {name:?}");
    REGISTERED_PATHS.with(|set| set.borrow_mut().insert(name));

    applier::restore_sticky(&handle);
    handle
}

/// Unregister a handle. Stale or unknown handles are ignored.
///
/// Reachable from `Drop`, so registry state already torn down with the
/// thread is skipped.
pub fn unregister_handle(handle: &RenderHandle) {
    let name = HANDLE_NAMES
        .try_with(|names| names.borrow_mut().remove(&handle.id))
        .ok()
        .flatten();
    let Some(name) = name else {
        return;
    };
    let _ = HANDLES.try_with(|handles| handles.borrow_mut().remove(handle.path()));
    let _ = REGISTERED_PATHS.try_with(|set| set.borrow_mut().remove(&name));
    applier::forget_handle(handle.id);
    debug!("unregistered render handle {} at {name:?}", handle.id);
}

// =============================================================================
// Lookups
// =============================================================================

/// Whether this exact registration is still live.
///
/// False during thread teardown, so dropping a mounted component from
/// another thread-local is a no-op.
pub fn is_registered(handle: &RenderHandle) -> bool {
    HANDLE_NAMES
        .try_with(|names| names.borrow().contains_key(&handle.id))
        .unwrap_or(false)
}

/// Live handle at a path.
pub fn handle_at(path: &[String]) -> Option<RenderHandle> {
    HANDLES.with(|handles| handles.borrow().get(path).map(|e| e.handle.clone()))
}

pub(crate) fn target_of(handle: &RenderHandle) -> Option<Rc<dyn RenderTarget>> {
    HANDLES.with(|handles| {
        handles
            .borrow()
            .get(handle.path())
            .filter(|e| e.handle.id == handle.id)
            .map(|e| e.target.clone())
    })
}

/// Current prop generation of a live handle.
pub fn prop_generation(handle: &RenderHandle) -> Option<u64> {
    HANDLES.with(|handles| {
        handles
            .borrow()
            .get(handle.path())
            .filter(|e| e.handle.id == handle.id)
            .map(|e| e.generation)
    })
}

/// Advance the prop generation. Returns the new generation.
pub(crate) fn bump_generation(handle: &RenderHandle) -> Option<u64> {
    HANDLES.with(|handles| {
        handles
            .borrow_mut()
            .get_mut(handle.path())
            .filter(|e| e.handle.id == handle.id)
            .map(|e| {
                e.generation += 1;
                e.generation
            })
    })
}

/// Handles selected by a compiled target set, in path order.
pub(crate) fn select(set: &TargetSet) -> Vec<RenderHandle> {
    HANDLES.with(|handles| {
        let handles = handles.borrow();
        set.select_from(&handles)
            .into_iter()
            .map(|e| e.handle.clone())
            .collect()
    })
}

/// All registered paths (joined), sorted.
///
/// Note: This creates a reactive dependency when called from a derived/effect.
pub fn registered_paths() -> Vec<String> {
    let mut paths: Vec<String> = REGISTERED_PATHS.with(|set| set.borrow().iter().cloned().collect());
    paths.sort();
    paths
}

/// Number of registered handles.
pub fn handle_count() -> usize {
    HANDLES.with(|handles| handles.borrow().len())
}

pub(crate) fn reset_handles() {
    HANDLES.with(|handles| handles.borrow_mut().clear());
    HANDLE_NAMES.with(|names| names.borrow_mut().clear());
    REGISTERED_PATHS.with(|set| set.borrow_mut().clear());
    NEXT_HANDLE_ID.with(|next| *next.borrow_mut() = 0);
}

// =============================================================================
// Tests
// =============================================================================
