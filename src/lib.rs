//! # spark-reactions
//!
//! Causal mutation routing for reactive UIs.
//!
//! A pure `state -> view` model throws away *why* state changed, so finding
//! what to update means scanning everything that was rendered. spark-reactions
//! keeps the cause around as an [`Action`] and routes the resulting
//! [`Mutation`]s straight to the render targets they name.
//!
//! ## Architecture
//!
//! ```text
//! dispatch(action) → bubble to local root → broadcast to every node
//!                                             │
//!                     derive(action, previous, state) → Mutation
//!                                             │
//!                      channel → Target Matcher → Mutation Applier → RenderTarget
//! ```
//!
//! Reaction nodes form an acyclic tree (master/slave links). Each node
//! derives at most one mutation per turn. Mutations carry target patterns
//! (`"chart.tooltip"`, `"scatter*"`) and one of three lifetimes:
//! imperative attribute, transient prop, sticky prop.
//!
//! Built on [spark-signals](https://github.com/RLabs-Inc/spark-signals):
//! the configuration, each node's last mutation and the set of registered
//! paths are reactive.
//!
//! ## Modules
//!
//! - [`types`] - Action, Mutation, EventKey, Scope, PropBag
//! - [`engine`] - Reaction nodes, router, mutation channels
//! - [`targets`] - Render handle registry, matcher, applier, wrapped components
//! - [`config`] - Traversal order and pattern syntax
//! - [`error`] - ReactionError

pub mod config;
pub mod engine;
pub mod error;
pub mod targets;
pub mod types;

// Re-export commonly used items
pub use types::*;

pub use error::{ReactionError, Result};

pub use config::{
    apply_config, config, reset_config, segment_separator, set_segment_separator,
    set_traversal, set_wildcard_marker, traversal, wildcard_marker, ReactionConfig, Traversal,
};

pub use engine::{
    create_node, destroy_node, dispatch, on_mutation, on_subtree_mutation, queued_actions,
    rebuild, reparent, detach, turn_in_progress, MutationStream, NodeId, NodeOptions,
    ReactionNode,
};

pub use targets::{
    apply_to_matches, begin_prop_generation, clear_all_sticky, clear_sticky, connect_applier,
    match_handles, prop_overrides, register_handle, registered_paths, unregister_handle,
    wrap_component, RenderHandle, RenderTarget, Surface, TargetPattern, WrappedComponent,
};

/// Reset every piece of thread-local state (for testing).
pub fn reset_reactions() {
    engine::reset_engine();
    targets::reset_targets();
    config::reset_config();
}
