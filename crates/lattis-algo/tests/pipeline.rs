//! End-to-end pipelines over small hand-built lattices: removal,
//! posterior scoring, pruning, and combination chained the way a
//! recognizer postprocessor chains them.

use std::rc::Rc;

use lattis_algo::best::best_projection;
use lattis_algo::fwdbwd::{FwdBwd, FwdBwdParams};
use lattis_algo::prune::{FwdBwdPruner, FwdBwdPrunerParams, PruneParams, prune_by_fwd_bwd};
use lattis_algo::remove::remove_epsilons;
use lattis_core::EPSILON;
use lattis_core::cache::cache;
use lattis_core::info::count;
use lattis_core::lattice::{FsaType, LatticeRef, State, StaticLattice};
use lattis_core::semiring::{Scores, ScoresRef, Semiring, SemiringRef, log_add};
use lattis_core::wrap::rescale;

fn w(score: f64) -> ScoresRef {
    Rc::new(Scores::from_vec(vec![score]))
}

fn log_sr() -> SemiringRef {
    Semiring::log(vec![1.0], vec!["am".into()])
}

/// 0 -> 1 -> 3 over labels 1, 3 (scores 2 + 3) against 0 -> 2 -> 3 over
/// labels 2, 4 (scores 4 + 4); state 3 final with weight 0.
fn two_route(sr: SemiringRef) -> LatticeRef {
    let mut l = StaticLattice::new(FsaType::Acceptor, sr);
    let mut s0 = State::new(0);
    s0.new_arc(1, w(2.0), 1, 1);
    s0.new_arc(2, w(4.0), 2, 2);
    l.set_state(s0);
    let mut s1 = State::new(1);
    s1.new_arc(3, w(3.0), 3, 3);
    l.set_state(s1);
    let mut s2 = State::new(2);
    s2.new_arc(3, w(4.0), 4, 4);
    l.set_state(s2);
    l.set_state(State::with_final(3, w(0.0)));
    l.set_initial_state_id(0);
    Rc::new(l)
}

#[test]
fn tropical_best_path_over_two_routes() {
    let sr = Semiring::tropical(vec![1.0], vec!["am".into()]);
    let (path, score) = best_projection(&two_route(sr)).unwrap();
    assert!((score - 5.0).abs() < 1e-12);
    let labels: Vec<u32> = (0..2)
        .map(|sid| path.get_state(sid).arcs()[0].input)
        .collect();
    assert_eq!(labels, vec![1, 3]);
}

#[test]
fn epsilon_removal_preserves_the_total_score() {
    // 0 -eps(0.5)-> 1 -a(1.0)-> 3 against 0 -b(2.0)-> 3
    let mut l = StaticLattice::new(FsaType::Acceptor, log_sr());
    let mut s0 = State::new(0);
    s0.new_arc(1, w(0.5), EPSILON, EPSILON);
    s0.new_arc(3, w(2.0), 2, 2);
    l.set_state(s0);
    let mut s1 = State::new(1);
    s1.new_arc(3, w(1.0), 1, 1);
    l.set_state(s1);
    l.set_state(State::with_final(3, w(0.0)));
    l.set_initial_state_id(0);
    let l: LatticeRef = Rc::new(l);

    let removed = remove_epsilons(&l).unwrap();
    let s0 = removed.get_state(0);
    assert_eq!(s0.n_arcs(), 2);
    assert!(s0.arcs().iter().all(|a| a.input != EPSILON));

    let (_, fb) = FwdBwd::build(&removed, &FwdBwdParams::default()).unwrap();
    let expected = log_add(0.5 + 1.0, 2.0);
    assert!((fb.state(removed.initial_state_id()).bwd - expected).abs() < 1e-10);
}

#[test]
fn cached_views_are_transparent() {
    let sr = Semiring::tropical(vec![1.0], vec!["am".into()]);
    let l = two_route(sr);
    let plain = rescale(&l, &[Some(2.0)]).unwrap();
    let cached = cache(&rescale(&l, &[Some(2.0)]).unwrap());
    let (_, direct) = best_projection(&plain).unwrap();
    let (_, through_cache) = best_projection(&cached).unwrap();
    assert_eq!(direct, through_cache);
    assert!((direct - 10.0).abs() < 1e-12);
}

#[test]
fn posterior_pruning_is_monotone_in_the_threshold() {
    // five parallel arcs one posterior apart
    let mut l = StaticLattice::new(FsaType::Acceptor, log_sr());
    let mut s0 = State::new(0);
    for i in 1..=5u32 {
        s0.new_arc(1, w(f64::from(i)), i, i);
    }
    l.set_state(s0);
    l.set_state(State::with_final(1, w(0.0)));
    l.set_initial_state_id(0);
    let l: LatticeRef = Rc::new(l);

    let (base, fb) = FwdBwd::build(&l, &FwdBwdParams::default()).unwrap();
    let fb = Rc::new(fb);
    let mut previous = 0;
    for threshold in [0.5, 1.5, 2.5, 3.5, 4.5] {
        let pruned = prune_by_fwd_bwd(&base, &fb, threshold, &PruneParams::default()).unwrap();
        let n_arcs = count(pruned.as_ref()).n_arcs;
        assert!(n_arcs > previous, "threshold {threshold} lost arcs");
        // the best arc is always among the survivors
        assert!(pruned.get_state(0).arcs().iter().any(|a| a.input == 1));
        previous = n_arcs;
    }
    assert_eq!(previous, 5);
}

#[test]
fn pruner_pipeline_keeps_a_complete_trim_lattice() {
    let l = two_route(log_sr());
    let params = FwdBwdPrunerParams {
        threshold: 1.0,
        ..FwdBwdPrunerParams::default()
    };
    let pruned = FwdBwdPruner::new(params).unwrap().prune(&l, true).unwrap();
    let counts = count(pruned.as_ref());
    // only the strong route survives the margin, trimmed to a single path
    assert_eq!(counts.n_states, 3);
    assert_eq!(counts.n_arcs, 2);
    assert_eq!(counts.n_finals, 1);
    let (_, score) = best_projection(&pruned).unwrap();
    assert!((score - 5.0).abs() < 1e-12);
}

#[test]
fn pruning_is_idempotent_at_the_same_threshold() {
    // five parallel arcs one posterior apart; threshold 1.5 keeps two
    let mut l = StaticLattice::new(FsaType::Acceptor, log_sr());
    let mut s0 = State::new(0);
    for i in 1..=5u32 {
        s0.new_arc(1, w(f64::from(i)), i, i);
    }
    l.set_state(s0);
    l.set_state(State::with_final(1, w(0.0)));
    l.set_initial_state_id(0);
    let l: LatticeRef = Rc::new(l);

    let params = FwdBwdPrunerParams {
        threshold: 1.5,
        ..FwdBwdPrunerParams::default()
    };
    let pruner = FwdBwdPruner::new(params).unwrap();
    let once = pruner.prune(&l, true).unwrap();
    let twice = pruner.prune(&once, true).unwrap();
    // re-pruning the survivors changes nothing: the posteriors renormalize
    // but their margins to the best arc stay put
    assert_eq!(count(once.as_ref()), count(twice.as_ref()));
    let inputs = |l: &LatticeRef| -> Vec<u32> {
        l.get_state(0).arcs().iter().map(|a| a.input).collect()
    };
    assert_eq!(inputs(&once), vec![1, 2]);
    assert_eq!(inputs(&once), inputs(&twice));
}

#[test]
fn combination_then_pruning_conserves_each_systems_share() {
    let a = two_route(log_sr());
    let b = two_route(log_sr());
    let (union_l, fb) =
        FwdBwd::build_combination(&[(a, 1.0), (b, 1.0)], &FwdBwdParams::default()).unwrap();
    let fb = Rc::new(fb);
    // entry arcs carry half the mass each and survive generous pruning
    let pruned = prune_by_fwd_bwd(&union_l, &fb, 10.0, &PruneParams::default()).unwrap();
    let entries = pruned.get_state(0);
    assert_eq!(entries.n_arcs(), 2);
    for aid in 0..2 {
        let posterior = fb.arc(0, aid).posterior();
        assert!((posterior - -(0.5f64.ln())).abs() < 1e-10);
    }
    // the pruned union still reaches the shared final state
    let (_, score) = best_projection(&pruned).unwrap();
    assert!(score.is_finite());
}
