//! Render Targets - Where mutations land.
//!
//! - Registry: path-indexed render handles, mounted/unmounted by the renderer
//! - Pattern: target/exclude pattern parsing and matching
//! - Applier: lifetime-class application, transient and sticky override stores
//! - Wrap: components addressable by name, fed from a reaction node
//!
//! The core never renders. It hands writes to a [`RenderTarget`] supplied by
//! the rendering side, on one of two surfaces:
//!
//! ```text
//! ImperativeAttribute ──▶ Surface::Attributes      (fire and forget)
//! TransientProp ───────┐
//!                      ├─▶ Surface::PropOverrides   (full override layer per scope)
//! StickyProp ──────────┘
//! ```

mod applier;
mod pattern;
mod registry;
mod wrap;

pub use applier::{
    apply_mutation, apply_to_matches, begin_prop_generation, clear_all_sticky, clear_sticky,
    connect_applier, prop_overrides, sticky_keys, sticky_value, StickyKey,
};
pub use pattern::{handle_matches, match_handles, TargetPattern, TargetSet};
pub use registry::{
    handle_at, handle_count, is_registered, join_path, parse_path, prop_generation,
    register_handle, registered_paths, unregister_handle, HandleId, RenderHandle, RenderTarget,
    Surface,
};
pub use wrap::{wrap_component, WrappedComponent};

/// Reset all target-side state (for testing).
pub fn reset_targets() {
    registry::reset_handles();
    applier::reset_applier();
}
