//! Algorithms over weighted lattices.
//!
//! Everything here consumes the data model from `lattis-core` and produces
//! either a lazy view or a materialized lattice:
//!
//! - [`remove`] -- arc-closure elimination (epsilon arcs, null-duration
//!   arcs) with weight preservation
//! - [`fwdbwd`] -- forward-backward posterior scores over a single lattice
//!   or a weighted union of lattices, with optional expected-cost (risk)
//!   annotation
//! - [`best`] -- single best path extraction
//! - [`prune`] -- posterior pruning: fixed threshold, arc-rate-adaptive,
//!   and phone-coverage-aware

pub mod best;
pub mod fwdbwd;
pub mod prune;
pub mod remove;
