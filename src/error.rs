//! Error types for reaction network operations.
//!
//! Only conditions the caller must act on are errors. Unmatched targets,
//! stale handles and re-entrant dispatches are handled silently (logged at
//! most) and never show up here.

use crate::engine::NodeId;

/// Errors surfaced synchronously by reaction network operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReactionError {
    /// Attaching `node` under `master` would make the master chain revisit `node`.
    #[error("cycle rejected: attaching {node} under {master} would create a cycle")]
    CycleRejected { node: NodeId, master: NodeId },

    /// The node id does not refer to a live node.
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    /// A target/exclude pattern could not be parsed.
    #[error("invalid target pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: &'static str },
}

/// Result alias for reaction network operations.
pub type Result<T> = std::result::Result<T, ReactionError>;
