//! Configuration signals.
//!
//! Routing and matching knobs, held as reactive signals so derived state can
//! track them. All values are thread-local; the reaction network is
//! single-threaded.

use spark_signals::signal;
use std::cell::RefCell;

// =============================================================================
// Traversal Order
// =============================================================================

/// Order in which the broadcast phase visits nodes below the local root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Traversal {
    /// Level by level; siblings in attachment order.
    #[default]
    BreadthFirst,
    /// Pre-order; each slave's subtree before the next slave.
    DepthFirst,
}

pub const DEFAULT_SEGMENT_SEPARATOR: char = '.';
pub const DEFAULT_WILDCARD_MARKER: char = '*';

thread_local! {
    static TRAVERSAL: RefCell<spark_signals::Signal<Traversal>> = RefCell::new(signal(Traversal::BreadthFirst));
    static SEGMENT_SEPARATOR: RefCell<spark_signals::Signal<char>> = RefCell::new(signal(DEFAULT_SEGMENT_SEPARATOR));
    static WILDCARD_MARKER: RefCell<spark_signals::Signal<char>> = RefCell::new(signal(DEFAULT_WILDCARD_MARKER));
}

/// Get the broadcast traversal order.
pub fn traversal() -> Traversal {
    TRAVERSAL.with(|t| t.borrow().get())
}

/// Set the broadcast traversal order. Takes effect on the next turn.
pub fn set_traversal(order: Traversal) {
    TRAVERSAL.with(|t| t.borrow().set(order));
}

/// Get the traversal signal for reactive tracking.
pub fn traversal_signal() -> spark_signals::Signal<Traversal> {
    TRAVERSAL.with(|t| t.borrow().clone())
}

// =============================================================================
// Pattern Syntax
// =============================================================================

/// Separator between path segments in textual patterns and handle names.
pub fn segment_separator() -> char {
    SEGMENT_SEPARATOR.with(|s| s.borrow().get())
}

/// Set the path segment separator.
pub fn set_segment_separator(separator: char) {
    SEGMENT_SEPARATOR.with(|s| s.borrow().set(separator));
}

/// Trailing marker that turns a pattern's last segment into a prefix match.
pub fn wildcard_marker() -> char {
    WILDCARD_MARKER.with(|w| w.borrow().get())
}

/// Set the wildcard marker.
pub fn set_wildcard_marker(marker: char) {
    WILDCARD_MARKER.with(|w| w.borrow().set(marker));
}

// =============================================================================
// Snapshot
// =============================================================================

/// All configuration values at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReactionConfig {
    pub traversal: Traversal,
    pub segment_separator: char,
    pub wildcard_marker: char,
}

impl Default for ReactionConfig {
    fn default() -> Self {
        Self {
            traversal: Traversal::BreadthFirst,
            segment_separator: DEFAULT_SEGMENT_SEPARATOR,
            wildcard_marker: DEFAULT_WILDCARD_MARKER,
        }
    }
}

/// Read the current configuration.
pub fn config() -> ReactionConfig {
    ReactionConfig {
        traversal: traversal(),
        segment_separator: segment_separator(),
        wildcard_marker: wildcard_marker(),
    }
}

/// Install a full configuration.
pub fn apply_config(config: ReactionConfig) {
    set_traversal(config.traversal);
    set_segment_separator(config.segment_separator);
    set_wildcard_marker(config.wildcard_marker);
}

/// Restore defaults (for testing).
pub fn reset_config() {
    apply_config(ReactionConfig::default());
}

// =============================================================================
// Tests
// =============================================================================
