//! Depth-first traversal and state orderings.
//!
//! Traversal never assumes dense state ids: only states reachable from the
//! initial state are visited, and color tables grow on demand. Topological
//! sorts are cached on the lattice so repeated consumers share one
//! computation.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::rc::Rc;

use hashbrown::HashSet;

use crate::boundary::{Boundaries, ConstBoundariesRef};
use crate::lattice::{
    Arc, ConstStateMapRef, ConstStateRef, FsaType, Lattice, LatticeRef, State, StateMap,
};
use crate::semiring::SemiringRef;
use crate::{INVALID_STATE_ID, LatticeError, StateId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

fn get_color(colors: &[Color], sid: StateId) -> Color {
    colors.get(sid as usize).copied().unwrap_or(Color::White)
}

fn set_color(colors: &mut Vec<Color>, sid: StateId, color: Color) {
    let idx = sid as usize;
    if idx >= colors.len() {
        colors.resize(idx + 1, Color::White);
    }
    colors[idx] = color;
}

/// Callbacks driven by [`dfs`].
pub trait DfsVisitor {
    /// A state is seen for the first time.
    fn discover_state(&mut self, _state: &State) {}

    /// An arc leads to an already discovered state. `back_arc` is true when
    /// the target is still on the traversal stack, i.e. the arc closes a
    /// cycle.
    fn explore_non_tree_arc(&mut self, _from: &State, _arc: &Arc, _back_arc: bool) {}

    /// All states reachable from `sid` have been finished.
    fn finish_state(&mut self, _sid: StateId) {}
}

/// Depth-first traversal from the initial state with an explicit stack.
pub fn dfs(l: &dyn Lattice, visitor: &mut dyn DfsVisitor) {
    let initial = l.initial_state_id();
    if initial == INVALID_STATE_ID {
        return;
    }
    let mut colors: Vec<Color> = Vec::new();
    set_color(&mut colors, initial, Color::Gray);
    let first = l.get_state(initial);
    visitor.discover_state(&first);
    let mut stack: Vec<(ConstStateRef, usize)> = vec![(first, 0)];
    loop {
        let (state, i) = match stack.last_mut() {
            None => break,
            Some(top) => {
                let state = Rc::clone(&top.0);
                let i = top.1;
                top.1 += 1;
                (state, i)
            }
        };
        if i < state.n_arcs() {
            let arc = &state.arcs()[i];
            match get_color(&colors, arc.target) {
                Color::White => {
                    set_color(&mut colors, arc.target, Color::Gray);
                    let target = l.get_state(arc.target);
                    visitor.discover_state(&target);
                    stack.push((target, 0));
                }
                Color::Gray => visitor.explore_non_tree_arc(&state, arc, true),
                Color::Black => visitor.explore_non_tree_arc(&state, arc, false),
            }
        } else {
            set_color(&mut colors, state.id(), Color::Black);
            visitor.finish_state(state.id());
            stack.pop();
        }
    }
}

struct TopologicalSortVisitor {
    finished: Vec<StateId>,
    max_sid: StateId,
    cyclic: bool,
}

impl DfsVisitor for TopologicalSortVisitor {
    fn discover_state(&mut self, state: &State) {
        self.max_sid = self.max_sid.max(state.id());
    }

    fn explore_non_tree_arc(&mut self, _from: &State, _arc: &Arc, back_arc: bool) {
        if back_arc {
            self.cyclic = true;
        }
    }

    fn finish_state(&mut self, sid: StateId) {
        self.finished.push(sid);
    }
}

/// Reachable states in topological order, or `None` if the lattice is
/// cyclic. The result is cached on the lattice.
pub fn sort_topologically(l: &dyn Lattice) -> Option<ConstStateMapRef> {
    if let Some(sort) = l.topological_sort() {
        return Some(sort);
    }
    let mut visitor = TopologicalSortVisitor {
        finished: Vec::new(),
        max_sid: 0,
        cyclic: false,
    };
    dfs(l, &mut visitor);
    if visitor.cyclic {
        return None;
    }
    visitor.finished.reverse();
    let sort = Rc::new(StateMap::from_ranks(visitor.finished, visitor.max_sid));
    l.set_topological_sort(Rc::clone(&sort));
    Some(sort)
}

/// State-id-to-rank map over the topological order, `INVALID_STATE_ID` for
/// unreachable ids. `None` if the lattice is cyclic.
pub fn find_topological_order(l: &dyn Lattice) -> Option<ConstStateMapRef> {
    let sort = sort_topologically(l)?;
    let mut ranks = vec![INVALID_STATE_ID; sort.max_sid() as usize + 1];
    for (rank, sid) in sort.iter().enumerate() {
        ranks[sid as usize] = rank as StateId;
    }
    Some(Rc::new(StateMap::from_ranks(ranks, sort.max_sid())))
}

/// Reachable states ordered by boundary time, ties broken by topological
/// rank. `None` if the lattice is cyclic or carries no boundaries.
pub fn sort_chronologically(l: &dyn Lattice) -> Option<ConstStateMapRef> {
    let boundaries = l.boundaries().filter(|b| b.valid())?;
    let sort = sort_topologically(l)?;
    let mut ids: Vec<StateId> = sort.iter().collect();
    ids.sort_by_key(|&sid| boundaries.time(sid));
    Some(Rc::new(StateMap::from_ranks(ids, sort.max_sid())))
}

/// Priority queue yielding pending states in ascending topological rank.
///
/// Built over a precomputed rank map (see [`find_topological_order`]);
/// inserting a state twice before it is popped is a no-op.
pub struct TopologicalOrderQueue {
    ranks: ConstStateMapRef,
    heap: BinaryHeap<Reverse<(StateId, StateId)>>,
    pending: HashSet<StateId>,
}

impl TopologicalOrderQueue {
    pub fn new(ranks: ConstStateMapRef) -> Self {
        TopologicalOrderQueue {
            ranks,
            heap: BinaryHeap::new(),
            pending: HashSet::new(),
        }
    }

    pub fn insert(&mut self, sid: StateId) {
        if self.pending.insert(sid) {
            let rank = self.ranks.as_slice()[sid as usize];
            debug_assert_ne!(rank, INVALID_STATE_ID);
            self.heap.push(Reverse((rank, sid)));
        }
    }

    pub fn pop(&mut self) -> Option<StateId> {
        let Reverse((_, sid)) = self.heap.pop()?;
        self.pending.remove(&sid);
        Some(sid)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// View renumbering states to their topological rank.
///
/// The initial state becomes state 0 and every arc points from a lower to
/// a higher id. Boundaries are remapped eagerly; the identity order is
/// served as the cached topological sort.
struct TopologicalOrderLattice {
    inner: LatticeRef,
    // rank -> original sid
    sort: ConstStateMapRef,
    // original sid -> rank
    ranks: ConstStateMapRef,
    identity: RefCell<Option<ConstStateMapRef>>,
    boundaries: Option<ConstBoundariesRef>,
}

impl Lattice for TopologicalOrderLattice {
    fn fsa_type(&self) -> FsaType {
        self.inner.fsa_type()
    }

    fn semiring(&self) -> &SemiringRef {
        self.inner.semiring()
    }

    fn initial_state_id(&self) -> StateId {
        0
    }

    fn get_state(&self, sid: StateId) -> ConstStateRef {
        let state = self.inner.get_state(self.sort.get(sid as usize));
        let mut mapped = state.as_ref().clone();
        mapped.set_id(sid);
        for arc in mapped.arcs_mut() {
            arc.target = self.ranks.as_slice()[arc.target as usize];
        }
        Rc::new(mapped)
    }

    fn boundaries(&self) -> Option<ConstBoundariesRef> {
        self.boundaries.clone()
    }

    fn topological_sort(&self) -> Option<ConstStateMapRef> {
        if self.identity.borrow().is_none() {
            let n = self.sort.len();
            let ids = (0..n as StateId).collect();
            let max_sid = if n == 0 { 0 } else { (n - 1) as StateId };
            self.identity
                .replace(Some(Rc::new(StateMap::from_ranks(ids, max_sid))));
        }
        self.identity.borrow().clone()
    }

    fn describe(&self) -> String {
        format!("topologicallyOrdered({})", self.inner.describe())
    }
}

/// Renumbers a lattice so that state ids equal topological ranks.
pub fn sort_by_topological_order(l: &LatticeRef) -> Result<LatticeRef, LatticeError> {
    let sort =
        sort_topologically(l.as_ref()).ok_or_else(|| LatticeError::NotAcyclic(l.describe()))?;
    let ranks = find_topological_order(l.as_ref())
        .ok_or_else(|| LatticeError::NotAcyclic(l.describe()))?;
    let boundaries = l.boundaries().filter(|b| b.valid()).map(|b| {
        let mut mapped = Boundaries::new();
        for (rank, sid) in sort.iter().enumerate() {
            mapped.set(rank as StateId, b.get(sid));
        }
        Rc::new(mapped)
    });
    Ok(Rc::new(TopologicalOrderLattice {
        inner: Rc::clone(l),
        sort,
        ranks,
        identity: RefCell::new(None),
        boundaries,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::StaticLattice;
    use crate::semiring::{Scores, ScoresRef, Semiring};
    use crate::boundary::Boundary;

    fn w(score: f64) -> ScoresRef {
        Rc::new(Scores::from_vec(vec![score]))
    }

    /// 0 -> {1, 2} -> 3, with state 3 final.
    fn diamond() -> LatticeRef {
        let sr = Semiring::tropical(vec![1.0], vec!["w".into()]);
        let mut l = StaticLattice::new(FsaType::Acceptor, sr);
        let mut s0 = State::new(0);
        s0.new_arc(1, w(1.0), 1, 1);
        s0.new_arc(2, w(2.0), 2, 2);
        l.set_state(s0);
        let mut s1 = State::new(1);
        s1.new_arc(3, w(1.0), 3, 3);
        l.set_state(s1);
        let mut s2 = State::new(2);
        s2.new_arc(3, w(1.0), 3, 3);
        l.set_state(s2);
        l.set_state(State::with_final(3, w(0.0)));
        l.set_initial_state_id(0);
        Rc::new(l)
    }

    fn cyclic() -> LatticeRef {
        let sr = Semiring::tropical(vec![1.0], vec!["w".into()]);
        let mut l = StaticLattice::new(FsaType::Acceptor, sr);
        let mut s0 = State::new(0);
        s0.new_arc(1, w(1.0), 1, 1);
        l.set_state(s0);
        let mut s1 = State::new(1);
        s1.new_arc(0, w(1.0), 2, 2);
        s1.set_final(w(0.0));
        l.set_state(s1);
        l.set_initial_state_id(0);
        Rc::new(l)
    }

    #[test]
    fn topological_sort_respects_arcs() {
        let l = diamond();
        let sort = sort_topologically(l.as_ref()).unwrap();
        assert_eq!(sort.len(), 4);
        let ranks = find_topological_order(l.as_ref()).unwrap();
        for sid in sort.iter() {
            for arc in l.get_state(sid).arcs() {
                assert!(
                    ranks.as_slice()[sid as usize] < ranks.as_slice()[arc.target as usize],
                    "arc {} -> {} violates the order",
                    sid,
                    arc.target
                );
            }
        }
    }

    #[test]
    fn topological_sort_is_cached() {
        let l = diamond();
        let first = sort_topologically(l.as_ref()).unwrap();
        let second = sort_topologically(l.as_ref()).unwrap();
        assert!(Rc::ptr_eq(&first, &second));
    }

    #[test]
    fn cyclic_lattice_has_no_topological_sort() {
        let l = cyclic();
        assert!(sort_topologically(l.as_ref()).is_none());
        assert!(find_topological_order(l.as_ref()).is_none());
    }

    #[test]
    fn queue_pops_in_ascending_rank_without_duplicates() {
        let l = diamond();
        let ranks = find_topological_order(l.as_ref()).unwrap();
        let mut q = TopologicalOrderQueue::new(Rc::clone(&ranks));
        q.insert(3);
        q.insert(0);
        q.insert(3);
        q.insert(2);
        let mut popped = Vec::new();
        while let Some(sid) = q.pop() {
            popped.push(ranks.as_slice()[sid as usize]);
        }
        assert_eq!(popped.len(), 3);
        assert!(popped.windows(2).all(|p| p[0] < p[1]));
    }

    #[test]
    fn chronological_sort_orders_by_time() {
        let l = diamond();
        // give state 2 an earlier time than state 1
        let mut b = Boundaries::new();
        b.set(0, Boundary::new(0));
        b.set(1, Boundary::new(20));
        b.set(2, Boundary::new(10));
        b.set(3, Boundary::new(30));
        let sr = Rc::clone(l.semiring());
        let mut copy = StaticLattice::new(FsaType::Acceptor, sr);
        for sid in 0..4 {
            copy.set_state(l.get_state(sid).as_ref().clone());
        }
        copy.set_initial_state_id(0);
        copy.set_boundaries(Some(Rc::new(b)));
        let copy: LatticeRef = Rc::new(copy);
        let chrono = sort_chronologically(copy.as_ref()).unwrap();
        let ids: Vec<StateId> = chrono.iter().collect();
        assert_eq!(ids, vec![0, 2, 1, 3]);
    }

    #[test]
    fn renumbering_by_rank_yields_forward_arcs() {
        let sr = Semiring::tropical(vec![1.0], vec!["w".into()]);
        let mut l = StaticLattice::new(FsaType::Acceptor, sr);
        // initial state deliberately has the largest id
        let mut s9 = State::new(9);
        s9.new_arc(4, w(1.0), 1, 1);
        l.set_state(s9);
        let mut s4 = State::new(4);
        s4.new_arc(2, w(1.0), 2, 2);
        l.set_state(s4);
        l.set_state(State::with_final(2, w(0.0)));
        l.set_initial_state_id(9);
        let mut b = Boundaries::new();
        b.set(9, Boundary::new(0));
        b.set(4, Boundary::new(1));
        b.set(2, Boundary::new(2));
        l.set_boundaries(Some(Rc::new(b)));

        let l: LatticeRef = Rc::new(l);
        let ordered = sort_by_topological_order(&l).unwrap();
        assert_eq!(ordered.initial_state_id(), 0);
        let s0 = ordered.get_state(0);
        assert_eq!(s0.arcs()[0].target, 1);
        let s1 = ordered.get_state(1);
        assert_eq!(s1.arcs()[0].target, 2);
        assert!(ordered.get_state(2).is_final());
        let b = ordered.boundaries().unwrap();
        assert_eq!(b.time(0), 0);
        assert_eq!(b.time(1), 1);
        assert_eq!(b.time(2), 2);
    }
}
