use std::hint::black_box;
use std::rc::Rc;

use criterion::{Criterion, criterion_group, criterion_main};

use lattis_algo::fwdbwd::{FwdBwd, FwdBwdParams};
use lattis_algo::prune::{PruneParams, prune_by_fwd_bwd};
use lattis_core::info::count;
use lattis_core::lattice::{FsaType, LatticeRef, State, StaticLattice};
use lattis_core::semiring::{Scores, Semiring};
use lattis_core::StateId;

/// Chain of `depth` slices, `width` parallel arcs between consecutive
/// slices, scores spread so posteriors differ within each slice.
fn sausage(depth: u32, width: u32) -> LatticeRef {
    let sr = Semiring::log(vec![1.0], vec!["am".into()]);
    let mut l = StaticLattice::new(FsaType::Acceptor, sr);
    for d in 0..depth {
        let mut s = State::new(d as StateId);
        for k in 0..width {
            let weight = Rc::new(Scores::from_vec(vec![0.1 * f64::from(k + 1)]));
            let label = d * width + k + 1;
            s.new_arc(d + 1, weight, label, label);
        }
        l.set_state(s);
    }
    l.set_state(State::with_final(
        depth,
        Rc::new(Scores::from_vec(vec![0.0])),
    ));
    l.set_initial_state_id(0);
    Rc::new(l)
}

fn bench_fwdbwd(c: &mut Criterion) {
    let l = sausage(500, 8);
    c.bench_function("fwdbwd/sausage_500x8", |b| {
        b.iter(|| FwdBwd::build(black_box(&l), &FwdBwdParams::default()).unwrap())
    });
}

fn bench_prune(c: &mut Criterion) {
    let l = sausage(500, 8);
    let (base, fb) = FwdBwd::build(&l, &FwdBwdParams::default()).unwrap();
    let fb = Rc::new(fb);
    c.bench_function("prune/threshold_sausage_500x8", |b| {
        b.iter(|| {
            let pruned =
                prune_by_fwd_bwd(black_box(&base), &fb, 0.4, &PruneParams::default()).unwrap();
            count(pruned.as_ref())
        })
    });
}

criterion_group!(benches, bench_fwdbwd, bench_prune);
criterion_main!(benches);
