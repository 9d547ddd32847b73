//! Weighted-lattice data model and shared machinery.
//!
//! A lattice is a weighted finite-state automaton over label sequences,
//! produced by a recognizer and transformed by lazily composed views. This
//! crate provides the pieces every transformation shares:
//!
//! - [`semiring`] -- score vectors, log/tropical semirings, log-domain
//!   accumulators
//! - [`lattice`] -- arcs, states, the `Lattice` trait and its static
//!   (owned, materialized) implementation
//! - [`boundary`] -- per-state time and articulatory-transit metadata
//! - [`wrap`] -- the lazy transform layer (weight-modifying and
//!   semiring-changing views)
//! - [`cache`] -- memoizing view with age-bounded eviction, plus eager
//!   materialization
//! - [`traverse`] -- depth-first traversal, topological and chronological
//!   ordering, the topological-order priority queue
//! - [`info`] -- state/arc counting and in-place trimming
//! - [`lexicon`] -- the read-only pronunciation collaborator consumed by
//!   phone-coverage pruning

pub mod boundary;
pub mod cache;
pub mod info;
pub mod lattice;
pub mod lexicon;
pub mod semiring;
pub mod traverse;
pub mod wrap;

/// A scalar score, stored in the negative-log domain (lower is better).
pub type Score = f64;

/// Index of a score dimension within a semiring.
pub type ScoreId = usize;

/// Dense non-negative state identifier. Ids need not be contiguous.
pub type StateId = u32;

/// Reserved sentinel for "no state".
pub const INVALID_STATE_ID: StateId = u32::MAX;

/// Label identifier into an input or output alphabet.
pub type LabelId = u32;

/// The empty label.
pub const EPSILON: LabelId = 0;

/// Reserved sentinel for "no label".
pub const INVALID_LABEL_ID: LabelId = u32::MAX;

/// Error type for structural precondition violations and fatal
/// configuration errors.
///
/// Every algorithm validates its structural preconditions eagerly at entry;
/// a violation aborts the current segment's pipeline rather than producing
/// wrong scores. Recoverable conditions are reported through `tracing`
/// instead and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum LatticeError {
    #[error("lattice `{0}` is not acyclic")]
    NotAcyclic(String),
    #[error("lattice `{0}` is not trim: non-final state {1} has no outgoing arcs")]
    NotTrim(String, StateId),
    #[error("lattice `{0}` has no final state")]
    NoFinalState(String),
    #[error("lattice `{0}` has no initial state")]
    EmptyLattice(String),
    #[error("semiring size mismatch: {left} vs {right} dimensions")]
    SemiringMismatch { left: usize, right: usize },
    #[error("risk calculation requires a dimension storing the arc-wise cost")]
    MissingCostDimension,
    #[error("cannot combine zero systems: all lattices are empty or have non-positive weight")]
    EmptyCombination,
    #[error("probability threshold {0} is not in [0.0, 1.0]")]
    InvalidProbabilityThreshold(Score),
    #[error("no best path: all paths have infinite score")]
    NoBestPath,
    #[error("boundaries required but not available on `{0}`")]
    MissingBoundaries(String),
}
