//! Lazy lattice views.
//!
//! Two wrapper shapes cover most transformations: a view that overrides a
//! single property and forwards everything else (semiring change), and a
//! view that rewrites each state on access without touching structure
//! (weight modification, arc sorting). Wrappers are cheap to build; no
//! state is computed before it is requested.

use std::cmp::Ordering;
use std::rc::Rc;

use crate::boundary::ConstBoundariesRef;
use crate::lattice::{
    AlphabetRef, Arc, ConstStateMapRef, ConstStateRef, FsaType, Lattice, LatticeRef, State,
};
use crate::semiring::{ScoresRef, SemiringRef};
use crate::{LatticeError, Score, StateId};

/// Per-state rewriting view. The callback may change weights and arc order
/// but must not change targets, labels, or the number of arcs.
struct ModifyLattice {
    inner: LatticeRef,
    name: &'static str,
    f: Box<dyn Fn(&SemiringRef, &mut State)>,
}

impl Lattice for ModifyLattice {
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
        let state = self.inner.get_state(sid);
        let mut modified = state.as_ref().clone();
        (self.f)(self.inner.semiring(), &mut modified);
        Rc::new(modified)
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
        format!("{}({})", self.name, self.inner.describe())
    }
}

/// Wraps `l` in a view applying `f` to every state on access.
pub fn modify<F>(l: &LatticeRef, name: &'static str, f: F) -> LatticeRef
where
    F: Fn(&SemiringRef, &mut State) + 'static,
{
    Rc::new(ModifyLattice {
        inner: Rc::clone(l),
        name,
        f: Box::new(f),
    })
}

/// Sorted-arcs view under a caller-supplied weak order.
pub fn sort_arcs<F>(l: &LatticeRef, order: F) -> LatticeRef
where
    F: Fn(&Arc, &Arc) -> Ordering + 'static,
{
    modify(l, "sortArcs", move |_, state| {
        state.sort_arcs(|a, b| order(a, b));
    })
}

/// View overriding the semiring under which weights are interpreted.
struct ChangeSemiringLattice {
    inner: LatticeRef,
    semiring: SemiringRef,
}

impl Lattice for ChangeSemiringLattice {
    fn fsa_type(&self) -> FsaType {
        self.inner.fsa_type()
    }

    fn semiring(&self) -> &SemiringRef {
        &self.semiring
    }

    fn initial_state_id(&self) -> StateId {
        self.inner.initial_state_id()
    }

    fn get_state(&self, sid: StateId) -> ConstStateRef {
        self.inner.get_state(sid)
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
        format!("changeSemiring({})", self.inner.describe())
    }
}

/// Reinterprets the weights of `l` under `semiring`.
///
/// Weights are passed through untouched, so the dimensionality must match.
pub fn change_semiring(l: &LatticeRef, semiring: SemiringRef) -> Result<LatticeRef, LatticeError> {
    if l.semiring().size() != semiring.size() {
        return Err(LatticeError::SemiringMismatch {
            left: l.semiring().size(),
            right: semiring.size(),
        });
    }
    Ok(Rc::new(ChangeSemiringLattice {
        inner: Rc::clone(l),
        semiring,
    }))
}

/// Multiplies selected score dimensions and reinterprets the result under a
/// semiring with the same scales but the given per-dimension factors folded
/// into the weights.
///
/// `factors[i] == None` leaves dimension `i` untouched.
pub fn rescale(l: &LatticeRef, factors: &[Option<Score>]) -> Result<LatticeRef, LatticeError> {
    if factors.len() != l.semiring().size() {
        return Err(LatticeError::SemiringMismatch {
            left: l.semiring().size(),
            right: factors.len(),
        });
    }
    let factors = factors.to_vec();
    Ok(modify(l, "rescale", move |_, state| {
        let apply = |weight: &mut ScoresRef| {
            let mut scores = weight.as_ref().clone();
            for (id, factor) in factors.iter().enumerate() {
                if let Some(f) = factor {
                    scores.set(id, f * scores.get(id));
                }
            }
            *weight = Rc::new(scores);
        };
        if let Some(weight) = state.final_weight() {
            let mut w = Rc::clone(weight);
            apply(&mut w);
            state.set_final(w);
        }
        for arc in state.arcs_mut() {
            apply(&mut arc.weight);
        }
    }))
}
