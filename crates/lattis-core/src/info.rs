//! Lattice size statistics and trimming.

use hashbrown::{HashMap, HashSet};
use tracing::debug;

use crate::lattice::{Arc, Lattice, State, StaticLattice};
use crate::traverse::{DfsVisitor, dfs};
use crate::{INVALID_STATE_ID, StateId};

/// Size of the reachable part of a lattice.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LatticeCounts {
    pub n_states: usize,
    pub n_arcs: usize,
    pub n_finals: usize,
}

struct CountVisitor {
    counts: LatticeCounts,
}

impl DfsVisitor for CountVisitor {
    fn discover_state(&mut self, state: &State) {
        self.counts.n_states += 1;
        self.counts.n_arcs += state.n_arcs();
        if state.is_final() {
            self.counts.n_finals += 1;
        }
    }
}

/// Counts reachable states, arcs, and final states in one traversal.
pub fn count(l: &dyn Lattice) -> LatticeCounts {
    let mut visitor = CountVisitor {
        counts: LatticeCounts::default(),
    };
    dfs(l, &mut visitor);
    visitor.counts
}

/// Removes every state that is not on a path from the initial state to a
/// final state, and every arc into a removed state.
///
/// When no complete path remains the lattice is emptied entirely.
pub fn trim_in_place(l: &mut StaticLattice) {
    let initial = l.initial_state_id();
    let clear = |l: &mut StaticLattice| {
        for sid in l.state_ids().collect::<Vec<_>>() {
            l.remove_state(sid);
        }
        l.set_initial_state_id(INVALID_STATE_ID);
    };
    if initial == INVALID_STATE_ID || !l.has_state(initial) {
        clear(l);
        return;
    }

    // forward-reachable states, reverse adjacency, final states
    let mut forward: HashSet<StateId> = HashSet::new();
    let mut incoming: HashMap<StateId, Vec<StateId>> = HashMap::new();
    let mut finals: Vec<StateId> = Vec::new();
    let mut stack = vec![initial];
    forward.insert(initial);
    while let Some(sid) = stack.pop() {
        let state = match l.state(sid) {
            Some(state) => state,
            None => continue,
        };
        if state.is_final() {
            finals.push(sid);
        }
        for arc in state.arcs() {
            if l.has_state(arc.target) {
                incoming.entry(arc.target).or_default().push(sid);
                if forward.insert(arc.target) {
                    stack.push(arc.target);
                }
            }
        }
    }

    // states that reach a final state
    let mut keep: HashSet<StateId> = finals.iter().copied().collect();
    let mut stack = finals;
    while let Some(sid) = stack.pop() {
        if let Some(sources) = incoming.get(&sid) {
            for &src in sources {
                if keep.insert(src) {
                    stack.push(src);
                }
            }
        }
    }

    if !keep.contains(&initial) {
        debug!(lattice = %l.describe(), "no complete path; trimming empties the lattice");
        clear(l);
        return;
    }
    for sid in l.state_ids().collect::<Vec<_>>() {
        if !keep.contains(&sid) {
            l.remove_state(sid);
        } else if let Some(state) = l.state_mut(sid) {
            state
                .arcs_mut()
                .retain(|arc: &Arc| keep.contains(&arc.target));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::{FsaType, Lattice, LatticeRef, State};
    use crate::semiring::{Scores, ScoresRef, Semiring};
    use std::rc::Rc;

    fn w(score: f64) -> ScoresRef {
        Rc::new(Scores::from_vec(vec![score]))
    }

    fn dead_end_lattice() -> StaticLattice {
        // 0 -> 1 -> 2 (final), 0 -> 3 (dead end), 4 unreachable
        let sr = Semiring::tropical(vec![1.0], vec!["w".into()]);
        let mut l = StaticLattice::new(FsaType::Acceptor, sr);
        let mut s0 = State::new(0);
        s0.new_arc(1, w(1.0), 1, 1);
        s0.new_arc(3, w(1.0), 2, 2);
        l.set_state(s0);
        let mut s1 = State::new(1);
        s1.new_arc(2, w(1.0), 3, 3);
        l.set_state(s1);
        l.set_state(State::with_final(2, w(0.0)));
        l.set_state(State::new(3));
        l.set_state(State::new(4));
        l.set_initial_state_id(0);
        l
    }

    #[test]
    fn count_covers_reachable_states_only() {
        let l: LatticeRef = Rc::new(dead_end_lattice());
        let counts = count(l.as_ref());
        assert_eq!(counts.n_states, 4);
        assert_eq!(counts.n_arcs, 3);
        assert_eq!(counts.n_finals, 1);
    }

    #[test]
    fn trim_removes_dead_ends_and_their_arcs() {
        let mut l = dead_end_lattice();
        trim_in_place(&mut l);
        assert!(l.has_state(0));
        assert!(l.has_state(1));
        assert!(l.has_state(2));
        assert!(!l.has_state(3));
        assert!(!l.has_state(4));
        assert_eq!(l.get_state(0).n_arcs(), 1);
        let counts = count(&l);
        assert_eq!(counts.n_states, 3);
        assert_eq!(counts.n_arcs, 2);
    }

    #[test]
    fn trim_empties_lattice_without_final_state() {
        let sr = Semiring::tropical(vec![1.0], vec!["w".into()]);
        let mut l = StaticLattice::new(FsaType::Acceptor, sr);
        let mut s0 = State::new(0);
        s0.new_arc(1, w(1.0), 1, 1);
        l.set_state(s0);
        l.set_state(State::new(1));
        l.set_initial_state_id(0);
        trim_in_place(&mut l);
        assert_eq!(l.initial_state_id(), INVALID_STATE_ID);
        assert_eq!(count(&l).n_states, 0);
    }
}
