//! Arc-closure elimination.
//!
//! Removes a class of arcs (epsilon arcs, or arcs spanning no time) while
//! preserving total path weight: each state's view replaces its removable
//! arcs by the arcs and final weights reachable through chains of removable
//! arcs, extending weights along each chain and collecting where chains
//! meet. The transformation is a lazy view; states without removable arcs
//! pass through untouched.

use std::cmp::Ordering;
use std::rc::Rc;

use hashbrown::HashMap;
use tracing::warn;

use lattis_core::boundary::ConstBoundariesRef;
use lattis_core::cache::cache;
use lattis_core::lattice::{
    AlphabetRef, Arc, ConstStateMapRef, ConstStateRef, FsaType, Lattice, LatticeRef, State,
};
use lattis_core::semiring::{ScoresRef, SemiringRef};
use lattis_core::traverse::{TopologicalOrderQueue, find_topological_order};
use lattis_core::wrap::sort_arcs;
use lattis_core::{EPSILON, LatticeError, StateId};

/// Which arcs to collapse, and the per-state arc order under which
/// removable arcs group first and equal-signature arcs are adjacent.
pub trait ArcFilter: Clone + 'static {
    fn removable(&self, source: &State, arc: &Arc) -> bool;

    /// Weak order on arcs; `Equal` must mean equal (target, input, output).
    fn order(&self, a: &Arc, b: &Arc) -> Ordering;

    /// Called for every arc the closure consumes.
    fn on_remove(&self, _source: &State, _arc: &Arc) {}

    fn name(&self) -> &'static str;
}

/// Collapses arcs labeled epsilon on both tapes.
#[derive(Clone)]
pub struct EpsilonArcFilter;

impl ArcFilter for EpsilonArcFilter {
    fn removable(&self, _source: &State, arc: &Arc) -> bool {
        arc.input == EPSILON && arc.output == EPSILON
    }

    fn order(&self, a: &Arc, b: &Arc) -> Ordering {
        (a.input, a.output, a.target).cmp(&(b.input, b.output, b.target))
    }

    fn name(&self) -> &'static str {
        "epsilon"
    }
}

/// Collapses arcs whose target is aligned to the same time frame as their
/// source, regardless of label.
#[derive(Clone)]
pub struct NullArcFilter {
    boundaries: ConstBoundariesRef,
}

impl ArcFilter for NullArcFilter {
    fn removable(&self, source: &State, arc: &Arc) -> bool {
        self.boundaries.time(arc.target) == self.boundaries.time(source.id())
    }

    fn order(&self, a: &Arc, b: &Arc) -> Ordering {
        let ta = self.boundaries.time(a.target);
        let tb = self.boundaries.time(b.target);
        (ta, a.target, a.input, a.output).cmp(&(tb, b.target, b.input, b.output))
    }

    fn on_remove(&self, source: &State, arc: &Arc) {
        if arc.input != EPSILON || arc.output != EPSILON {
            warn!(
                source = source.id(),
                target = arc.target,
                input = arc.input,
                output = arc.output,
                "removing a null-duration arc with a non-epsilon label"
            );
        }
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

struct ArcRemovalLattice<F: ArcFilter> {
    // cache over the arc-sorted input
    inner: LatticeRef,
    filter: F,
    // state id -> topological rank, fixed at construction
    ranks: ConstStateMapRef,
}

impl<F: ArcFilter> ArcRemovalLattice<F> {
    fn removal_closure(&self, state: &State) -> ConstStateRef {
        let sr = self.inner.semiring();
        let mut result = State::new(state.id());
        let mut final_weight: Option<ScoresRef> = state.final_weight().cloned();

        // seed the closure with the removable arcs of this state; the
        // non-removable suffix passes through unchanged
        let mut closure: HashMap<StateId, ScoresRef> = HashMap::new();
        let mut queue = TopologicalOrderQueue::new(Rc::clone(&self.ranks));
        for arc in state.arcs() {
            if self.filter.removable(state, arc) {
                self.filter.on_remove(state, arc);
                let weight = match closure.get(&arc.target) {
                    Some(seen) => sr.collect(seen, &arc.weight),
                    None => Rc::clone(&arc.weight),
                };
                closure.insert(arc.target, weight);
                queue.insert(arc.target);
            } else {
                result.push_arc(arc.clone());
            }
        }

        // drain in ascending topological rank so each closure state is
        // expanded exactly once with its fully collected weight
        while let Some(sid) = queue.pop() {
            let Some(weight) = closure.remove(&sid) else {
                continue;
            };
            let closure_state = self.inner.get_state(sid);
            if let Some(wf) = closure_state.final_weight() {
                let reached = sr.extend(&weight, wf);
                final_weight = Some(match &final_weight {
                    Some(seen) => sr.collect(seen, &reached),
                    None => reached,
                });
            }
            for arc in closure_state.arcs() {
                let reached = sr.extend(&weight, &arc.weight);
                if self.filter.removable(&closure_state, arc) {
                    self.filter.on_remove(&closure_state, arc);
                    let collected = match closure.get(&arc.target) {
                        Some(seen) => sr.collect(seen, &reached),
                        None => reached,
                    };
                    closure.insert(arc.target, collected);
                    queue.insert(arc.target);
                } else {
                    let merged = Arc::new(arc.target, reached, arc.input, arc.output);
                    let arcs = result.arcs_mut();
                    match arcs.binary_search_by(|probe| self.filter.order(probe, &merged)) {
                        Ok(pos) => arcs[pos].weight = sr.collect(&arcs[pos].weight, &merged.weight),
                        Err(pos) => arcs.insert(pos, merged),
                    }
                }
            }
        }

        if let Some(weight) = final_weight {
            result.set_final(weight);
        }
        Rc::new(result)
    }
}

impl<F: ArcFilter> Lattice for ArcRemovalLattice<F> {
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
        if state
            .arcs()
            .iter()
            .any(|arc| self.filter.removable(&state, arc))
        {
            self.removal_closure(&state)
        } else {
            state
        }
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

    // rerouted arcs only skip forward, so any topological order of the
    // input stays valid
    fn topological_sort(&self) -> Option<ConstStateMapRef> {
        self.inner.topological_sort()
    }

    fn set_topological_sort(&self, sort: ConstStateMapRef) {
        self.inner.set_topological_sort(sort);
    }

    fn describe(&self) -> String {
        format!("removeArcs:{}({})", self.filter.name(), self.inner.describe())
    }
}

fn arc_removal<F: ArcFilter>(l: &LatticeRef, filter: F) -> Result<LatticeRef, LatticeError> {
    let ranks =
        find_topological_order(l.as_ref()).ok_or_else(|| LatticeError::NotAcyclic(l.describe()))?;
    let order_filter = filter.clone();
    let sorted = sort_arcs(l, move |a, b| order_filter.order(a, b));
    Ok(Rc::new(ArcRemovalLattice {
        inner: cache(&sorted),
        filter,
        ranks,
    }))
}

/// Removes all arcs labeled epsilon on both tapes.
pub fn remove_epsilons(l: &LatticeRef) -> Result<LatticeRef, LatticeError> {
    arc_removal(l, EpsilonArcFilter)
}

/// Removes all arcs spanning no time. Requires valid boundaries; collapsing
/// a non-epsilon label is reported but still performed.
pub fn remove_null_arcs(l: &LatticeRef) -> Result<LatticeRef, LatticeError> {
    let boundaries = l
        .boundaries()
        .filter(|b| b.valid())
        .ok_or_else(|| LatticeError::MissingBoundaries(l.describe()))?;
    arc_removal(l, NullArcFilter { boundaries })
}
