//! Reaction Engine - The routing tree for actions and mutations.
//!
//! The engine manages:
//! - Node arena: reaction nodes, master/slave links, local state
//! - Router: bubble-then-broadcast turns, deferred dispatch queue, reparenting
//! - Channels: multicast mutation delivery per node
//!
//! # Architecture
//!
//! ```text
//! dispatch(b1) ──bubble──▶ root ──broadcast──▶ r, a, b, a1, b1
//!                                              │
//!                                  reduce → derive → publish(mutation)
//! ```
//!
//! Every node derives exactly once per turn, in broadcast order, so
//! mutations from one turn are applied in a stable, documented order.

mod channel;
mod node;
mod router;

pub use channel::*;
pub use node::*;
pub use router::{dispatch, queued_actions, reparent, detach, rebuild, turn_in_progress, turns_completed};

/// Reset all engine state (for testing).
pub fn reset_engine() {
    router::reset_router();
    channel::reset_channels();
    node::reset_nodes();
}
