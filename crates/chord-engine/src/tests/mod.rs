//! Tests for the chord-engine crate.

mod helpers;

mod churn;
