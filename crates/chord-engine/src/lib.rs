//! Chord node engine for chordstore.
//!
//! This crate ties the lower layers together into a running ring member:
//!
//! - [`ChordNode`]: the orchestrator. Owns the routing table, the key
//!   directory and the aggregation tree, answers peer requests, and runs the
//!   maintenance loop (stabilization, replica sync, tree refresh).
//! - [`KeyDirectory`]: maps key ids to the pages holding their values on a
//!   [`BlockDevice`](chord_store::BlockDevice).
//! - [`AggregationTree`]: the parent/child overlay that rolls cluster stats
//!   up to the node owning slot 0.
//!
//! Requests are never proxied: a node that does not own a key answers with a
//! redirect and the caller retries at the node it was pointed to.

mod config;
mod directory;
mod error;
mod handler;
mod node;
mod replica;
mod router;
mod stabilizer;
mod tree;

#[cfg(test)]
mod tests;

pub use config::{ChordNodeConfig, default_max_lookup_hops};
pub use directory::{KeyDirectory, KeyEntry, Usage};
pub use error::ChordError;
pub use handler::Reply;
pub use node::{ChordNode, NodeStatus};
pub use router::{Hop, Lookup};
pub use tree::{AggregationTree, ChildEntry, Registration, parent_slot};
