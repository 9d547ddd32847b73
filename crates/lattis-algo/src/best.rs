//! Single best path extraction.

use std::rc::Rc;

use lattis_core::boundary::Boundaries;
use lattis_core::lattice::{LatticeRef, State, StaticLattice};
use lattis_core::traverse::sort_topologically;
use lattis_core::{INVALID_STATE_ID, LatticeError, Score, StateId};

#[derive(Clone, Copy)]
struct Trace {
    score: Score,
    sid: StateId,
    aid: usize,
}

/// Extracts the path with the smallest projected score.
///
/// Dynamic programming over the topological order with traceback; the
/// result is a linear lattice with fresh contiguous state ids (0 being
/// initial) and boundaries copied from the traversed states. Returns the
/// path lattice together with its total projected score.
pub fn best_projection(l: &LatticeRef) -> Result<(LatticeRef, Score), LatticeError> {
    if l.initial_state_id() == INVALID_STATE_ID {
        return Err(LatticeError::EmptyLattice(l.describe()));
    }
    let sort =
        sort_topologically(l.as_ref()).ok_or_else(|| LatticeError::NotAcyclic(l.describe()))?;
    let sr = l.semiring();
    let initial = l.initial_state_id();
    let mut traces = vec![
        Trace {
            score: Score::MAX,
            sid: INVALID_STATE_ID,
            aid: 0,
        };
        sort.max_sid() as usize + 1
    ];
    traces[initial as usize].score = 0.0;

    let mut best: Option<(StateId, Score)> = None;
    for sid in sort.iter() {
        let here = traces[sid as usize].score;
        if here >= Score::MAX {
            continue;
        }
        let state = l.get_state(sid);
        if let Some(weight) = state.final_weight() {
            let total = here + sr.project(weight);
            if total < Score::MAX && best.is_none_or(|(_, s)| total < s) {
                best = Some((sid, total));
            }
        }
        for (aid, arc) in state.arcs().iter().enumerate() {
            let arc_score = sr.project(&arc.weight);
            if arc_score >= Score::MAX {
                continue;
            }
            let score = here + arc_score;
            let trace = &mut traces[arc.target as usize];
            if score < trace.score {
                *trace = Trace { score, sid, aid };
            }
        }
    }
    let (final_sid, best_score) = match best {
        Some(best) => best,
        None => {
            return if sort.iter().any(|sid| l.get_state(sid).is_final()) {
                Err(LatticeError::NoBestPath)
            } else {
                Err(LatticeError::NoFinalState(l.describe()))
            };
        }
    };

    // traceback: (source state, arc index) pairs from initial to final
    let mut path: Vec<(StateId, usize)> = Vec::new();
    let mut sid = final_sid;
    while sid != initial {
        let trace = traces[sid as usize];
        path.push((trace.sid, trace.aid));
        sid = trace.sid;
    }
    path.reverse();

    let mut out = StaticLattice::new(l.fsa_type(), Rc::clone(sr));
    out.set_description(format!("best({})", l.describe()));
    out.set_input_alphabet(l.input_alphabet());
    out.set_output_alphabet(l.output_alphabet());
    let src_boundaries = l.boundaries().filter(|b| b.valid());
    let mut boundaries = Boundaries::new();
    for (i, &(src_sid, aid)) in path.iter().enumerate() {
        let src = l.get_state(src_sid);
        let arc = &src.arcs()[aid];
        let mut state = State::new(i as StateId);
        state.new_arc(i as StateId + 1, Rc::clone(&arc.weight), arc.input, arc.output);
        out.set_state(state);
        if let Some(b) = &src_boundaries {
            boundaries.set(i as StateId, b.get(src_sid));
        }
    }
    let last = path.len() as StateId;
    let final_state = l.get_state(final_sid);
    let final_weight = final_state
        .final_weight()
        .map(Rc::clone)
        .unwrap_or_else(|| Rc::clone(sr.one()));
    out.set_state(State::with_final(last, final_weight));
    if let Some(b) = &src_boundaries {
        boundaries.set(last, b.get(final_sid));
        out.set_boundaries(Some(Rc::new(boundaries)));
    }
    out.set_initial_state_id(0);
    Ok((Rc::new(out), best_score))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattis_core::lattice::FsaType;
    use lattis_core::semiring::{Scores, ScoresRef, Semiring};

    fn w(score: f64) -> ScoresRef {
        Rc::new(Scores::from_vec(vec![score]))
    }

    /// 0 -> 1 -> 3 (cost 2 + 3) vs 0 -> 2 -> 3 (cost 1 + 1), final 3.
    fn two_route() -> LatticeRef {
        let sr = Semiring::tropical(vec![1.0], vec!["w".into()]);
        let mut l = StaticLattice::new(FsaType::Acceptor, sr);
        let mut s0 = State::new(0);
        s0.new_arc(1, w(2.0), 1, 1);
        s0.new_arc(2, w(1.0), 2, 2);
        l.set_state(s0);
        let mut s1 = State::new(1);
        s1.new_arc(3, w(3.0), 3, 3);
        l.set_state(s1);
        let mut s2 = State::new(2);
        s2.new_arc(3, w(1.0), 4, 4);
        l.set_state(s2);
        l.set_state(State::with_final(3, w(0.5)));
        l.set_initial_state_id(0);
        Rc::new(l)
    }

    #[test]
    fn picks_cheapest_route() {
        let l = two_route();
        let (path, score) = best_projection(&l).unwrap();
        assert!((score - 2.5).abs() < 1e-12);
        let labels: Vec<u32> = (0..2).map(|sid| path.get_state(sid).arcs()[0].input).collect();
        assert_eq!(labels, vec![2, 4]);
        assert!(path.get_state(2).is_final());
    }

    #[test]
    fn path_is_linear_with_fresh_ids() {
        let l = two_route();
        let (path, _) = best_projection(&l).unwrap();
        assert_eq!(path.initial_state_id(), 0);
        assert_eq!(path.get_state(0).arcs()[0].target, 1);
        assert_eq!(path.get_state(1).arcs()[0].target, 2);
        assert_eq!(path.get_state(2).n_arcs(), 0);
    }

    #[test]
    fn no_final_state_is_an_error() {
        let sr = Semiring::tropical(vec![1.0], vec!["w".into()]);
        let mut l = StaticLattice::new(FsaType::Acceptor, sr);
        let mut s0 = State::new(0);
        s0.new_arc(1, w(1.0), 1, 1);
        l.set_state(s0);
        l.set_state(State::new(1));
        l.set_initial_state_id(0);
        let l: LatticeRef = Rc::new(l);
        assert!(matches!(
            best_projection(&l),
            Err(LatticeError::NoFinalState(_))
        ));
    }

    #[test]
    fn empty_lattice_is_an_error() {
        let sr = Semiring::tropical(vec![1.0], vec!["w".into()]);
        let l: LatticeRef = Rc::new(StaticLattice::new(FsaType::Acceptor, sr));
        assert!(matches!(
            best_projection(&l),
            Err(LatticeError::EmptyLattice(_))
        ));
    }

    #[test]
    fn single_state_lattice_yields_empty_path() {
        let sr = Semiring::tropical(vec![1.0], vec!["w".into()]);
        let mut l = StaticLattice::new(FsaType::Acceptor, sr);
        l.set_state(State::with_final(0, w(1.5)));
        l.set_initial_state_id(0);
        let l: LatticeRef = Rc::new(l);
        let (path, score) = best_projection(&l).unwrap();
        assert!((score - 1.5).abs() < 1e-12);
        assert!(path.get_state(0).is_final());
        assert_eq!(path.get_state(0).n_arcs(), 0);
    }
}
