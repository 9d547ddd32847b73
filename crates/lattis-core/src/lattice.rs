//! Arcs, states, and the lattice abstraction.
//!
//! A [`Lattice`] is a weighted automaton exposed through by-id state
//! access. Most implementations are lazy views over an upstream lattice;
//! [`StaticLattice`] is the one owned, mutable representation and serves as
//! the materialization target for every algorithm that produces a new
//! lattice. Views hold strong references upstream only, so composition
//! chains stay acyclic and drop cleanly.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use crate::boundary::ConstBoundariesRef;
use crate::semiring::{ScoresRef, SemiringRef};
use crate::{INVALID_STATE_ID, LabelId, StateId};

pub type ConstStateRef = Rc<State>;
pub type ConstStateMapRef = Rc<StateMap>;
pub type LatticeRef = Rc<dyn Lattice>;
pub type AlphabetRef = Rc<dyn Alphabet>;

/// Whether a lattice carries one label per arc or an input/output pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsaType {
    Acceptor,
    Transducer,
}

/// A weighted transition. In acceptors `input == output`.
#[derive(Debug, Clone)]
pub struct Arc {
    pub target: StateId,
    pub weight: ScoresRef,
    pub input: LabelId,
    pub output: LabelId,
}

impl Arc {
    pub fn new(target: StateId, weight: ScoresRef, input: LabelId, output: LabelId) -> Self {
        Arc {
            target,
            weight,
            input,
            output,
        }
    }
}

/// A state: id, outgoing arcs, and an optional final weight.
#[derive(Debug, Clone)]
pub struct State {
    id: StateId,
    final_weight: Option<ScoresRef>,
    arcs: Vec<Arc>,
}

impl State {
    pub fn new(id: StateId) -> Self {
        State {
            id,
            final_weight: None,
            arcs: Vec::new(),
        }
    }

    pub fn with_final(id: StateId, weight: ScoresRef) -> Self {
        State {
            id,
            final_weight: Some(weight),
            arcs: Vec::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> StateId {
        self.id
    }

    pub fn set_id(&mut self, id: StateId) {
        self.id = id;
    }

    #[inline]
    pub fn is_final(&self) -> bool {
        self.final_weight.is_some()
    }

    #[inline]
    pub fn final_weight(&self) -> Option<&ScoresRef> {
        self.final_weight.as_ref()
    }

    pub fn set_final(&mut self, weight: ScoresRef) {
        self.final_weight = Some(weight);
    }

    pub fn unset_final(&mut self) {
        self.final_weight = None;
    }

    #[inline]
    pub fn arcs(&self) -> &[Arc] {
        &self.arcs
    }

    #[inline]
    pub fn arcs_mut(&mut self) -> &mut Vec<Arc> {
        &mut self.arcs
    }

    #[inline]
    pub fn n_arcs(&self) -> usize {
        self.arcs.len()
    }

    #[inline]
    pub fn has_arcs(&self) -> bool {
        !self.arcs.is_empty()
    }

    pub fn push_arc(&mut self, arc: Arc) {
        self.arcs.push(arc);
    }

    pub fn new_arc(&mut self, target: StateId, weight: ScoresRef, input: LabelId, output: LabelId) {
        self.arcs.push(Arc::new(target, weight, input, output));
    }

    /// Sorts the outgoing arcs under a caller-supplied weak order.
    pub fn sort_arcs<F>(&mut self, order: F)
    where
        F: FnMut(&Arc, &Arc) -> Ordering,
    {
        let mut order = order;
        self.arcs.sort_by(|a, b| order(a, b));
    }
}

/// A list of state ids with the largest id seen attached.
///
/// Serves both as an ordered sequence (topological or chronological sort)
/// and, via [`StateMap::from_ranks`], as a state-id-to-rank map.
#[derive(Debug, Default, Clone)]
pub struct StateMap {
    ids: Vec<StateId>,
    max_sid: StateId,
}

impl StateMap {
    pub fn with_capacity(n: usize) -> Self {
        StateMap {
            ids: Vec::with_capacity(n),
            max_sid: 0,
        }
    }

    pub fn from_ranks(ids: Vec<StateId>, max_sid: StateId) -> Self {
        StateMap { ids, max_sid }
    }

    pub fn push(&mut self, sid: StateId) {
        self.max_sid = self.max_sid.max(sid);
        self.ids.push(sid);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[inline]
    pub fn get(&self, i: usize) -> StateId {
        self.ids[i]
    }

    pub fn first(&self) -> Option<StateId> {
        self.ids.first().copied()
    }

    pub fn last(&self) -> Option<StateId> {
        self.ids.last().copied()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = StateId> + '_ {
        self.ids.iter().copied()
    }

    #[inline]
    pub fn as_slice(&self) -> &[StateId] {
        &self.ids
    }

    #[inline]
    pub fn max_sid(&self) -> StateId {
        self.max_sid
    }

    pub fn set_max_sid(&mut self, max_sid: StateId) {
        self.max_sid = max_sid;
    }
}

/// Read-only label-to-symbol mapping.
pub trait Alphabet {
    fn symbol(&self, label: LabelId) -> Option<&str>;
}

/// Alphabet backed by a symbol table indexed by label id.
#[derive(Debug, Default)]
pub struct StaticAlphabet {
    symbols: Vec<String>,
}

impl StaticAlphabet {
    pub fn new(symbols: Vec<String>) -> Self {
        StaticAlphabet { symbols }
    }
}

impl Alphabet for StaticAlphabet {
    fn symbol(&self, label: LabelId) -> Option<&str> {
        self.symbols.get(label as usize).map(String::as_str)
    }
}

/// A weighted automaton accessed state by state.
///
/// `get_state` is the only way to observe structure; implementations may
/// compute states on demand. Requesting an id that is not a state of the
/// lattice is a caller error and may panic, so traversals must follow arcs
/// from the initial state only.
pub trait Lattice {
    fn fsa_type(&self) -> FsaType;

    fn semiring(&self) -> &SemiringRef;

    /// `INVALID_STATE_ID` iff the lattice is empty.
    fn initial_state_id(&self) -> StateId;

    fn get_state(&self, sid: StateId) -> ConstStateRef;

    fn input_alphabet(&self) -> Option<AlphabetRef> {
        None
    }

    fn output_alphabet(&self) -> Option<AlphabetRef> {
        None
    }

    fn boundaries(&self) -> Option<ConstBoundariesRef> {
        None
    }

    /// Cached topological order, if one has been computed and stored.
    fn topological_sort(&self) -> Option<ConstStateMapRef> {
        None
    }

    /// Stores a computed topological order. Views that preserve structure
    /// delegate upstream; structure-changing views keep their own slot.
    fn set_topological_sort(&self, _sort: ConstStateMapRef) {}

    /// Short human-readable description of the view chain, for diagnostics.
    fn describe(&self) -> String;
}

/// The owned, materialized lattice.
///
/// States are stored in an id-indexed table with optional holes, so state
/// ids survive copying from sparse sources. This is the only mutable
/// lattice; every algorithm that builds a new lattice builds one of these.
pub struct StaticLattice {
    fsa_type: FsaType,
    semiring: SemiringRef,
    description: String,
    initial: StateId,
    states: Vec<Option<ConstStateRef>>,
    boundaries: Option<ConstBoundariesRef>,
    input_alphabet: Option<AlphabetRef>,
    output_alphabet: Option<AlphabetRef>,
    topological_sort: RefCell<Option<ConstStateMapRef>>,
}

impl StaticLattice {
    pub fn new(fsa_type: FsaType, semiring: SemiringRef) -> Self {
        StaticLattice {
            fsa_type,
            semiring,
            description: String::from("static"),
            initial: INVALID_STATE_ID,
            states: Vec::new(),
            boundaries: None,
            input_alphabet: None,
            output_alphabet: None,
            topological_sort: RefCell::new(None),
        }
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
    }

    pub fn set_initial_state_id(&mut self, sid: StateId) {
        self.initial = sid;
    }

    pub fn set_semiring(&mut self, semiring: SemiringRef) {
        self.semiring = semiring;
    }

    pub fn set_boundaries(&mut self, boundaries: Option<ConstBoundariesRef>) {
        self.boundaries = boundaries;
    }

    pub fn set_input_alphabet(&mut self, alphabet: Option<AlphabetRef>) {
        self.input_alphabet = alphabet;
    }

    pub fn set_output_alphabet(&mut self, alphabet: Option<AlphabetRef>) {
        self.output_alphabet = alphabet;
    }

    /// Inserts or replaces the state under its own id.
    pub fn set_state(&mut self, state: State) {
        let idx = state.id() as usize;
        if idx >= self.states.len() {
            self.states.resize(idx + 1, None);
        }
        self.states[idx] = Some(Rc::new(state));
        self.topological_sort.replace(None);
    }

    pub fn has_state(&self, sid: StateId) -> bool {
        self.state(sid).is_some()
    }

    pub fn state(&self, sid: StateId) -> Option<&ConstStateRef> {
        self.states.get(sid as usize).and_then(Option::as_ref)
    }

    /// Mutable access to a stored state, copy-on-write if it is shared.
    pub fn state_mut(&mut self, sid: StateId) -> Option<&mut State> {
        self.states
            .get_mut(sid as usize)
            .and_then(Option::as_mut)
            .map(Rc::make_mut)
    }

    pub fn remove_state(&mut self, sid: StateId) {
        if let Some(slot) = self.states.get_mut(sid as usize) {
            *slot = None;
        }
    }

    /// Largest id any state could have, or `None` when empty.
    pub fn max_state_id(&self) -> Option<StateId> {
        if self.states.is_empty() {
            None
        } else {
            Some((self.states.len() - 1) as StateId)
        }
    }

    pub fn state_ids(&self) -> impl Iterator<Item = StateId> + '_ {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| i as StateId)
    }
}

impl Lattice for StaticLattice {
    fn fsa_type(&self) -> FsaType {
        self.fsa_type
    }

    fn semiring(&self) -> &SemiringRef {
        &self.semiring
    }

    fn initial_state_id(&self) -> StateId {
        self.initial
    }

    fn get_state(&self, sid: StateId) -> ConstStateRef {
        match self.state(sid) {
            Some(state) => Rc::clone(state),
            None => panic!("static lattice `{}` has no state {}", self.description, sid),
        }
    }

    fn input_alphabet(&self) -> Option<AlphabetRef> {
        self.input_alphabet.clone()
    }

    fn output_alphabet(&self) -> Option<AlphabetRef> {
        self.output_alphabet.clone()
    }

    fn boundaries(&self) -> Option<ConstBoundariesRef> {
        self.boundaries.clone()
    }

    fn topological_sort(&self) -> Option<ConstStateMapRef> {
        self.topological_sort.borrow().clone()
    }

    fn set_topological_sort(&self, sort: ConstStateMapRef) {
        self.topological_sort.replace(Some(sort));
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semiring::{Scores, Semiring};

    fn one_dim() -> SemiringRef {
        Semiring::tropical(vec![1.0], vec!["w".into()])
    }

    fn w(score: f64) -> ScoresRef {
        Rc::new(Scores::from_vec(vec![score]))
    }

    #[test]
    fn states_are_stored_under_their_own_id() {
        let mut l = StaticLattice::new(FsaType::Acceptor, one_dim());
        let mut s = State::new(3);
        s.new_arc(4, w(1.0), 7, 7);
        l.set_state(s);
        l.set_state(State::with_final(4, w(0.0)));
        l.set_initial_state_id(3);

        assert!(l.has_state(3));
        assert!(!l.has_state(0));
        assert_eq!(l.max_state_id(), Some(4));
        assert_eq!(l.get_state(3).arcs()[0].target, 4);
        assert!(l.get_state(4).is_final());
    }

    #[test]
    fn state_mut_copies_shared_states() {
        let mut l = StaticLattice::new(FsaType::Acceptor, one_dim());
        l.set_state(State::new(0));
        let shared = l.get_state(0);
        l.state_mut(0).unwrap().set_final(w(0.0));
        assert!(!shared.is_final());
        assert!(l.get_state(0).is_final());
    }

    #[test]
    fn state_map_tracks_max_sid() {
        let mut m = StateMap::with_capacity(4);
        m.push(2);
        m.push(9);
        m.push(5);
        assert_eq!(m.max_sid(), 9);
        assert_eq!(m.len(), 3);
        assert_eq!(m.first(), Some(2));
        assert_eq!(m.last(), Some(5));
    }
}
