//! Wrapped Components - Bridge a render target to a mutation source.
//!
//! `wrap_component(name, target)` makes a target addressable at `name`.
//! The wrapped form has a `mutation-source` input: point it at a reaction
//! node and every mutation that node publishes is matched against the
//! component's own path and forwarded to the applier.
//!
//! # Example
//!
//! ```ignore
//! use spark_reactions::{wrap_component, create_node, NodeOptions};
//!
//! let node = create_node(NodeOptions::new())?;
//! let mut tooltip = wrap_component("chart.tooltip", |scope, surface, bag| {
//!     // hand the write to the renderer
//! });
//! tooltip.mount();
//! tooltip.set_mutation_source(Some(node));
//!
//! // owner re-rendered with new props:
//! tooltip.receive_props();
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use super::applier;
use super::pattern::{self, TargetSet};
use super::registry::{self, RenderHandle, RenderTarget};
use crate::engine::{on_mutation, ReactionNode};
use crate::types::{MutationKind, MutationKinds};

/// A render target registered under a name and fed from a reaction node.
pub struct WrappedComponent {
    name: String,
    path: Vec<String>,
    target: Rc<dyn RenderTarget>,
    accepts: MutationKinds,
    /// Shared with the source listener; None while unmounted.
    handle: Rc<RefCell<Option<RenderHandle>>>,
    source: Option<(ReactionNode, Box<dyn FnOnce()>)>,
}

/// Wrap a render target so it is addressable at `name`.
///
/// `name` is split into path segments with the configured separator.
pub fn wrap_component<T>(name: &str, target: T) -> WrappedComponent
where
    T: RenderTarget + 'static,
{
    WrappedComponent {
        name: name.to_string(),
        path: registry::parse_path(name),
        target: Rc::new(target),
        accepts: MutationKinds::ALL,
        handle: Rc::new(RefCell::new(None)),
        source: None,
    }
}

impl WrappedComponent {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Restrict which mutation kinds this component takes.
    /// Applies to sources set after this call.
    pub fn accept(mut self, kinds: MutationKinds) -> Self {
        self.accepts = kinds;
        self
    }

    /// Live handle while mounted.
    pub fn handle(&self) -> Option<RenderHandle> {
        self.handle.borrow().clone()
    }

    pub fn is_mounted(&self) -> bool {
        self.handle().is_some_and(|h| registry::is_registered(&h))
    }

    /// Register the target. Mounting twice returns the existing handle.
    pub fn mount(&mut self) -> RenderHandle {
        if let Some(handle) = self.handle().filter(registry::is_registered) {
            return handle;
        }
        let handle = registry::register_shared(self.path.clone(), self.target.clone());
        *self.handle.borrow_mut() = Some(handle.clone());
        handle
    }

    /// Unregister the target. The mutation source stays connected; sticky
    /// mutations for this path are stored and restored on the next mount.
    pub fn unmount(&mut self) {
        let handle = self.handle.borrow_mut().take();
        if let Some(handle) = handle {
            registry::unregister_handle(&handle);
        }
    }

    pub fn mutation_source(&self) -> Option<ReactionNode> {
        self.source.as_ref().map(|(node, _)| *node)
    }

    /// Point the mutation-source input at a node (or disconnect with None).
    ///
    /// Setting the same node again keeps the existing subscription.
    pub fn set_mutation_source(&mut self, node: Option<ReactionNode>) {
        if self.mutation_source() == node {
            return;
        }
        if let Some((_, cleanup)) = self.source.take() {
            cleanup();
        }
        let Some(node) = node else {
            return;
        };

        let handle = self.handle.clone();
        let path = self.path.clone();
        let cleanup = on_mutation(node, self.accepts, move |mutation| {
            let current = handle.borrow().clone();
            match current {
                Some(current) => {
                    if pattern::handle_matches(&current, mutation) {
                        applier::apply_mutation(&current, mutation);
                    }
                }
                // Unmounted: only sticky writes matter, for the next mount.
                None => {
                    if mutation.kind == MutationKind::StickyProp
                        && TargetSet::from_mutation(mutation).selects(&path)
                    {
                        applier::store_unmounted_sticky(&path, mutation);
                    }
                }
            }
        });
        self.source = Some((node, Box::new(cleanup)));
    }

    /// The owner assigned new props: starts a new prop generation, which
    /// retires transient overrides.
    pub fn receive_props(&self) {
        if let Some(handle) = self.handle() {
            applier::begin_prop_generation(&handle);
        }
    }
}

impl Drop for WrappedComponent {
    fn drop(&mut self) {
        if let Some((_, cleanup)) = self.source.take() {
            cleanup();
        }
        self.unmount();
    }
}

// =============================================================================
// Tests
// =============================================================================
