//! Chord routing state for a single node.
//!
//! This crate holds the [`RingTable`]: the node's own identity, its
//! predecessor and successor, the finger table and the successor list. It
//! knows nothing about the network; the engine fills it from lookup results
//! and consults it when answering requests.
//!
//! Ownership follows the half-open convention `(predecessor, self]`
//! everywhere: key ownership, lookup termination and finger intervals.

mod table;

pub use table::{FingerEntry, RingTable};
