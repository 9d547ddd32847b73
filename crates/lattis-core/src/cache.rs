//! State memoization and eager materialization.
//!
//! Lazy view chains recompute a state on every request; traversals that
//! revisit states (and every multi-pass algorithm) wrap the chain in
//! [`cache`] so each state is computed once while it stays warm. The age
//! bound is an access counter, not wall-clock time: entries not touched for
//! `max_age` accesses are dropped at the next sweep, keeping memory bounded
//! on large lattices.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use hashbrown::{HashMap, HashSet};

use crate::boundary::{Boundaries, ConstBoundariesRef};
use crate::lattice::{
    AlphabetRef, ConstStateMapRef, ConstStateRef, FsaType, Lattice, LatticeRef, StaticLattice,
};
use crate::semiring::SemiringRef;
use crate::{INVALID_STATE_ID, StateId};

/// Default age bound, in state accesses.
pub const DEFAULT_CACHE_MAX_AGE: u64 = 10_000;

struct CacheEntry {
    state: ConstStateRef,
    last_access: u64,
}

struct CacheLattice {
    inner: LatticeRef,
    max_age: u64,
    entries: RefCell<HashMap<StateId, CacheEntry>>,
    clock: Cell<u64>,
}

impl Lattice for CacheLattice {
    fn fsa_type(&self) -> FsaType {
        self.inner.fsa_type()
    }

    fn semiring(&self) -> &SemiringRef {
        self.inner.semiring()
    }

    fn initial_state_id(&self) -> StateId {
        self.inner.initial_state_id()
    }

    fn get_state(&self, sid: StateId) -> ConstStateRef {
        let now = self.clock.get() + 1;
        self.clock.set(now);
        let hit = self.entries.borrow_mut().get_mut(&sid).map(|entry| {
            entry.last_access = now;
            Rc::clone(&entry.state)
        });
        let state = match hit {
            Some(state) => state,
            None => {
                let state = self.inner.get_state(sid);
                self.entries.borrow_mut().insert(
                    sid,
                    CacheEntry {
                        state: Rc::clone(&state),
                        last_access: now,
                    },
                );
                state
            }
        };
        // the sweep is keyed to the clock, not to misses, so stale entries
        // cannot outlive a hit-heavy access pattern
        if now % self.max_age == 0 {
            let max_age = self.max_age;
            self.entries
                .borrow_mut()
                .retain(|_, entry| now - entry.last_access < max_age);
        }
        state
    }

    fn input_alphabet(&self) -> Option<AlphabetRef> {
        self.inner.input_alphabet()
    }

    fn output_alphabet(&self) -> Option<AlphabetRef> {
        self.inner.output_alphabet()
    }

    fn boundaries(&self) -> Option<ConstBoundariesRef> {
        self.inner.boundaries()
    }

    fn topological_sort(&self) -> Option<ConstStateMapRef> {
        self.inner.topological_sort()
    }

    fn set_topological_sort(&self, sort: ConstStateMapRef) {
        self.inner.set_topological_sort(sort);
    }

    fn describe(&self) -> String {
        format!("cache({})", self.inner.describe())
    }
}

/// Memoizing view with the default age bound.
pub fn cache(l: &LatticeRef) -> LatticeRef {
    cache_with_age(l, DEFAULT_CACHE_MAX_AGE)
}

/// Memoizing view dropping entries unused for `max_age` accesses.
pub fn cache_with_age(l: &LatticeRef, max_age: u64) -> LatticeRef {
    Rc::new(CacheLattice {
        inner: Rc::clone(l),
        max_age: max_age.max(1),
        entries: RefCell::new(HashMap::new()),
        clock: Cell::new(0),
    })
}

/// Eagerly materializes all reachable states into a [`StaticLattice`].
///
/// State ids are preserved; boundaries are copied for reachable states
/// only. The result owns its states, so it can be trimmed or mutated.
pub fn static_copy(l: &LatticeRef) -> StaticLattice {
    let mut copy = StaticLattice::new(l.fsa_type(), Rc::clone(l.semiring()));
    copy.set_description(format!("staticCopy({})", l.describe()));
    copy.set_input_alphabet(l.input_alphabet());
    copy.set_output_alphabet(l.output_alphabet());
    let initial = l.initial_state_id();
    copy.set_initial_state_id(initial);
    if initial == INVALID_STATE_ID {
        return copy;
    }
    let src_boundaries = l.boundaries().filter(|b| b.valid());
    let mut boundaries = Boundaries::new();
    let mut seen: HashSet<StateId> = HashSet::new();
    let mut stack = vec![initial];
    seen.insert(initial);
    while let Some(sid) = stack.pop() {
        let state = l.get_state(sid);
        if let Some(b) = &src_boundaries {
            boundaries.set(sid, b.get(sid));
        }
        for arc in state.arcs() {
            if seen.insert(arc.target) {
                stack.push(arc.target);
            }
        }
        copy.set_state(state.as_ref().clone());
    }
    if src_boundaries.is_some() {
        copy.set_boundaries(Some(Rc::new(boundaries)));
    }
    copy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::Boundary;
    use crate::lattice::State;
    use crate::semiring::{Scores, ScoresRef, Semiring};
    use crate::wrap::modify;

    fn w(score: f64) -> ScoresRef {
        Rc::new(Scores::from_vec(vec![score]))
    }

    fn chain(n: StateId) -> LatticeRef {
        let sr = Semiring::tropical(vec![1.0], vec!["w".into()]);
        let mut l = StaticLattice::new(FsaType::Acceptor, sr);
        for sid in 0..n {
            let mut s = State::new(sid);
            s.new_arc(sid + 1, w(1.0), 1, 1);
            l.set_state(s);
        }
        l.set_state(State::with_final(n, w(0.0)));
        l.set_initial_state_id(0);
        Rc::new(l)
    }

    fn counting(l: &LatticeRef, counter: &Rc<Cell<usize>>) -> LatticeRef {
        let counter = Rc::clone(counter);
        modify(l, "count", move |_, _| {
            counter.set(counter.get() + 1);
        })
    }

    #[test]
    fn repeated_access_computes_once() {
        let counter = Rc::new(Cell::new(0));
        let base = chain(2);
        let cached = cache(&counting(&base, &counter));
        for _ in 0..5 {
            cached.get_state(0);
        }
        assert_eq!(counter.get(), 1);
    }

    #[test]
    fn stale_entries_are_evicted() {
        let counter = Rc::new(Cell::new(0));
        let base = chain(9);
        let cached = cache_with_age(&counting(&base, &counter), 4);
        cached.get_state(0);
        assert_eq!(counter.get(), 1);
        // push the clock past a full sweep without touching state 0
        for sid in 1..=8 {
            cached.get_state(sid);
        }
        cached.get_state(0);
        assert_eq!(counter.get(), 10);
    }

    #[test]
    fn hits_advance_the_clock_past_sweeps() {
        let counter = Rc::new(Cell::new(0));
        let base = chain(2);
        let cached = cache_with_age(&counting(&base, &counter), 4);
        cached.get_state(0);
        cached.get_state(1);
        assert_eq!(counter.get(), 2);
        // only cache hits from here on; the sweep at access 8 must still
        // run and drop the untouched state 1
        for _ in 0..6 {
            cached.get_state(0);
        }
        cached.get_state(1);
        assert_eq!(counter.get(), 3);
    }

    #[test]
    fn cache_is_transparent() {
        let base = chain(2);
        let cached = cache(&base);
        assert_eq!(cached.initial_state_id(), base.initial_state_id());
        assert_eq!(cached.semiring().size(), 1);
        let s = cached.get_state(1);
        assert_eq!(s.arcs()[0].target, 2);
    }

    #[test]
    fn static_copy_preserves_reachable_structure_and_boundaries() {
        let sr = Semiring::tropical(vec![1.0], vec!["w".into()]);
        let mut l = StaticLattice::new(FsaType::Acceptor, sr);
        let mut s0 = State::new(0);
        s0.new_arc(2, w(1.0), 1, 1);
        l.set_state(s0);
        l.set_state(State::with_final(2, w(0.0)));
        // unreachable state
        l.set_state(State::new(5));
        l.set_initial_state_id(0);
        let mut b = Boundaries::new();
        b.set(0, Boundary::new(0));
        b.set(2, Boundary::new(7));
        b.set(5, Boundary::new(3));
        l.set_boundaries(Some(Rc::new(b)));

        let l: LatticeRef = Rc::new(l);
        let copy = static_copy(&l);
        assert!(copy.has_state(0));
        assert!(copy.has_state(2));
        assert!(!copy.has_state(5));
        assert_eq!(copy.boundaries().unwrap().time(2), 7);
        assert!(!copy.boundaries().unwrap().valid_at(5));
    }
}
