//! Forward-backward posterior scores.
//!
//! Over an acyclic, trim lattice the forward-backward sweep yields, for
//! every arc, the total score of all paths running through it; subtracting
//! the normalization constant turns that into the arc's posterior score
//! (negative-log probability of passing the arc). The same tables support a
//! weighted union of several lattices over the same semiring, and an
//! expected-cost (risk) annotation when a score dimension carries per-arc
//! costs.
//!
//! Scores and normalization are computed under a derived posterior
//! semiring, by default the log semiring scaled so the dominant dimension
//! runs at scale one; an infinite scale degrades to Viterbi (tropical)
//! posteriors.

use std::rc::Rc;

use tracing::warn;

use lattis_core::boundary::{Boundaries, Boundary, Time};
use lattis_core::cache::static_copy;
use lattis_core::lattice::{Lattice, LatticeRef, State, StaticLattice};
use lattis_core::semiring::{
    Collector, CostCollector, SemiringRef, SemiringType, log_add, to_log_semiring,
};
use lattis_core::traverse::sort_topologically;
use lattis_core::{EPSILON, INVALID_STATE_ID, LatticeError, Score, ScoreId, StateId};

/// Accepted deviation band between the forward and backward total scores,
/// as a negative-log interval around probability ratio one (0.99..1.01).
pub const FB_TOLERANCE: (Score, Score) = (-0.00995033085316808285, 0.01005033585350144118);

/// Scalar collect under the posterior semiring type.
#[inline]
fn scollect(ty: SemiringType, a: Score, b: Score) -> Score {
    match ty {
        SemiringType::Log => log_add(a, b),
        SemiringType::Tropical => a.min(b),
    }
}

/// Scalar extend; `Score::MAX` (zero probability) absorbs.
#[inline]
fn ext(a: Score, b: Score) -> Score {
    if a >= Score::MAX || b >= Score::MAX {
        Score::MAX
    } else {
        a + b
    }
}

/// Configuration of a forward-backward run.
#[derive(Debug, Clone, Default)]
pub struct FwdBwdParams {
    /// Uniform scale of the derived posterior semiring; `0.0` normalizes by
    /// the largest scale, `Score::MAX` selects Viterbi posteriors. Ignored
    /// when `posterior_semiring` is given.
    pub alpha: Score,
    /// Explicit posterior semiring; must match the lattice in size.
    pub posterior_semiring: Option<SemiringRef>,
    /// Write each arc's posterior score into this dimension of the result.
    pub score_id: Option<ScoreId>,
    /// Dimension carrying the per-arc cost that risk is computed over.
    pub cost_id: Option<ScoreId>,
    /// Write each arc's expected cost into this dimension of the result.
    pub risk_id: Option<ScoreId>,
    /// Center risks on the lattice's total expected cost.
    pub norm_risk: bool,
}

impl FwdBwdParams {
    pub fn verify(&self) -> Result<(), LatticeError> {
        if self.risk_id.is_some() && self.cost_id.is_none() {
            return Err(LatticeError::MissingCostDimension);
        }
        Ok(())
    }
}

/// Per-arc result: total path score through the arc and the normalization
/// it is reported against.
#[derive(Debug, Clone, Copy)]
pub struct FbArc {
    pub score: Score,
    pub norm: Score,
}

impl FbArc {
    /// Negative-log probability of a path passing this arc.
    #[inline]
    pub fn posterior(&self) -> Score {
        if self.score >= Score::MAX {
            Score::MAX
        } else {
            self.score - self.norm
        }
    }
}

/// Per-state result: forward and backward scores plus the state's
/// normalization constant.
#[derive(Debug, Clone, Copy, Default)]
pub struct FbState {
    pub fwd: Score,
    pub bwd: Score,
    pub norm: Score,
    begin: usize,
    end: usize,
}

/// Forward-backward tables, indexed by the state ids of the lattice
/// returned alongside them.
#[derive(Debug)]
pub struct FwdBwd {
    states: Vec<FbState>,
    arcs: Vec<FbArc>,
    min: Score,
    max: Score,
    sum: Score,
}

impl FwdBwd {
    pub fn state(&self, sid: StateId) -> FbState {
        self.states
            .get(sid as usize)
            .copied()
            .unwrap_or_default()
    }

    /// Per-arc entries of `sid`, in arc order.
    pub fn arcs(&self, sid: StateId) -> &[FbArc] {
        match self.states.get(sid as usize) {
            Some(st) => &self.arcs[st.begin..st.end],
            None => &[],
        }
    }

    pub fn arc(&self, sid: StateId, aid: usize) -> FbArc {
        self.arcs(sid)[aid]
    }

    /// Smallest posterior score of any arc (the best arc).
    pub fn min(&self) -> Score {
        self.min
    }

    /// Largest finite posterior score of any arc.
    pub fn max(&self) -> Score {
        self.max
    }

    /// Log-domain sum of all arc posteriors; `-sum` in the linear domain is
    /// the expected number of arcs on a path.
    pub fn sum(&self) -> Score {
        self.sum
    }

    /// Computes posteriors over a single lattice.
    ///
    /// Returns a materialized copy of the lattice (posterior and risk
    /// dimensions written when configured) together with the tables, which
    /// are indexed by the copy's state ids. The lattice must be non-empty,
    /// acyclic, and trim, and must have a final state. A final state that
    /// still has outgoing arcs loses its final weight (warned, not fatal).
    pub fn build(l: &LatticeRef, params: &FwdBwdParams) -> Result<(LatticeRef, FwdBwd), LatticeError> {
        params.verify()?;
        if l.initial_state_id() == INVALID_STATE_ID {
            return Err(LatticeError::EmptyLattice(l.describe()));
        }
        let post = posterior_semiring(l.semiring(), params)?;
        let mut s = static_copy(l);
        let sort =
            sort_topologically(&s).ok_or_else(|| LatticeError::NotAcyclic(l.describe()))?;
        let name = l.describe();
        validate(&mut s, sort.as_slice(), &name)?;
        let n = sort.max_sid() as usize + 1;
        let mut builder = Builder::new(params, post, n);
        let sums = builder.sweep(&s, sort.as_slice(), s.initial_state_id(), &name);
        let norm = 0.5 * (sums.fwd + sums.bwd);
        let gen_norm = if params.norm_risk && params.cost_id.is_some() {
            0.5 * (sums.fwd_cost + sums.bwd_cost)
        } else {
            0.0
        };
        builder.fill(&mut s, sort.as_slice(), norm, gen_norm);
        Ok((Rc::new(s), builder.finish()))
    }

    /// Computes posteriors over the weighted union of several lattices.
    ///
    /// Inputs with non-positive weight or without an initial state are
    /// excluded (reported, not fatal); excluding everything is fatal. The
    /// remaining lattices must share one semiring. The returned lattice has
    /// a fresh initial state 0 with an epsilon arc into each system and a
    /// fresh shared final state 1; the posterior mass entering system `i`
    /// is its normalized weight.
    pub fn build_combination(
        inputs: &[(LatticeRef, Score)],
        params: &FwdBwdParams,
    ) -> Result<(LatticeRef, FwdBwd), LatticeError> {
        params.verify()?;
        let mut active: Vec<(&LatticeRef, Score)> = Vec::new();
        for (l, weight) in inputs {
            if *weight <= 0.0 {
                warn!(
                    lattice = %l.describe(),
                    weight,
                    "excluding system with non-positive weight"
                );
            } else if l.initial_state_id() == INVALID_STATE_ID {
                warn!(lattice = %l.describe(), "excluding empty lattice");
            } else {
                active.push((l, *weight));
            }
        }
        if active.is_empty() {
            return Err(LatticeError::EmptyCombination);
        }
        let sr = Rc::clone(active[0].0.semiring());
        for (l, _) in &active[1..] {
            if *l.semiring().as_ref() != *sr.as_ref() {
                return Err(LatticeError::SemiringMismatch {
                    left: sr.size(),
                    right: l.semiring().size(),
                });
            }
        }
        let post = posterior_semiring(&sr, params)?;
        let ty = post.ty();
        let total_weight: Score = active.iter().map(|(_, w)| w).sum();

        // disjoint union at shifted ids; 0 and 1 are reserved
        let mut union_l = StaticLattice::new(active[0].0.fsa_type(), Rc::clone(&sr));
        union_l.set_description(format!(
            "combine({})",
            active
                .iter()
                .map(|(l, _)| l.describe())
                .collect::<Vec<_>>()
                .join(", ")
        ));
        let mut boundaries = Boundaries::new();
        let mut have_boundaries = true;
        let mut time_span: Option<(Time, Time)> = None;
        let mut subs: Vec<Sub> = Vec::new();
        let mut offset: StateId = 2;
        for (l, weight) in &active {
            let sort = sort_topologically(l.as_ref())
                .ok_or_else(|| LatticeError::NotAcyclic(l.describe()))?;
            let src_boundaries = l.boundaries().filter(|b| b.valid());
            if src_boundaries.is_none() {
                have_boundaries = false;
            }
            let mut topo = Vec::with_capacity(sort.len());
            let mut finals = Vec::new();
            for sid in sort.iter() {
                let shifted = sid + offset;
                let mut state = l.get_state(sid).as_ref().clone();
                state.set_id(shifted);
                for arc in state.arcs_mut() {
                    arc.target += offset;
                }
                if state.is_final() {
                    finals.push(shifted);
                }
                union_l.set_state(state);
                if let Some(b) = &src_boundaries {
                    let boundary = b.get(sid);
                    boundaries.set(shifted, boundary);
                    if boundary.valid() {
                        time_span = Some(match time_span {
                            Some((lo, hi)) => (lo.min(boundary.time()), hi.max(boundary.time())),
                            None => (boundary.time(), boundary.time()),
                        });
                    }
                }
                topo.push(shifted);
            }
            subs.push(Sub {
                name: l.describe(),
                weight: weight / total_weight,
                initial: l.initial_state_id() + offset,
                topo,
                finals,
                norm: 0.0,
                gen_norm: 0.0,
            });
            offset += sort.max_sid() + 1;
        }

        let n = offset as usize;
        let mut builder = Builder::new(params, Rc::clone(&post), n);
        for sub in &subs {
            validate(&mut union_l, &sub.topo, &sub.name)?;
        }
        for sub in &mut subs {
            let sums = builder.sweep(&union_l, &sub.topo, sub.initial, &sub.name);
            let fb = 0.5 * (sums.fwd + sums.bwd);
            sub.norm = fb + sub.weight.ln();
            sub.gen_norm = if params.norm_risk && params.cost_id.is_some() {
                0.5 * (sums.fwd_cost + sums.bwd_cost)
            } else {
                0.0
            };
        }

        // entry arcs out of the fresh initial state; each carries the
        // posterior mass of its system
        let mut entry_col = Collector::new();
        let mut s0 = State::new(0);
        let mut bwd0 = Score::MAX;
        for sub in &subs {
            let score = builder.states[sub.initial as usize].bwd;
            builder.arcs.push(FbArc {
                score,
                norm: sub.norm,
            });
            let p = score - sub.norm;
            entry_col.feed(p);
            builder.min = builder.min.min(p);
            builder.max = builder.max.max(p);
            builder.sum_col.feed(p);
            bwd0 = scollect(ty, bwd0, score - sub.weight.ln());
            let mut weight = Rc::clone(sr.one());
            if let Some(id) = params.score_id {
                weight = sr.set_score(&weight, id, p);
            }
            if let Some(id) = params.risk_id {
                let risk = builder.g[sub.initial as usize] - sub.gen_norm;
                weight = sr.set_score(&weight, id, risk);
            }
            s0.new_arc(sub.initial, weight, EPSILON, EPSILON);
        }
        builder.states[0] = FbState {
            fwd: 0.0,
            bwd: bwd0,
            norm: bwd0,
            begin: 0,
            end: subs.len(),
        };
        builder.states[1] = FbState {
            fwd: bwd0,
            bwd: 0.0,
            norm: bwd0,
            begin: 0,
            end: 0,
        };

        // re-wire system-final states into the shared final state
        let mut rewired: Vec<StateId> = Vec::new();
        for sub in &subs {
            for &fsid in &sub.finals {
                if let Some(state) = union_l.state_mut(fsid) {
                    let weight = match state.final_weight() {
                        Some(weight) => Rc::clone(weight),
                        None => continue,
                    };
                    state.unset_final();
                    state.new_arc(1, weight, EPSILON, EPSILON);
                    rewired.push(fsid);
                }
            }
        }
        union_l.set_state(s0);
        union_l.set_state(State::with_final(1, Rc::clone(sr.one())));
        union_l.set_initial_state_id(0);

        for sub in &subs {
            builder.fill(&mut union_l, &sub.topo, sub.norm, sub.gen_norm);
        }

        // global mass checks: the posterior mass over the entry arcs and
        // over the final arcs must each be one
        let mut exit_col = Collector::new();
        for &fsid in &rewired {
            let st = builder.states[fsid as usize];
            if st.end > st.begin {
                let exit = builder.arcs[st.end - 1];
                exit_col.feed(exit.posterior());
            }
        }
        for (place, col) in [("initial", entry_col), ("final", exit_col)] {
            let mass = col.get();
            if !(FB_TOLERANCE.0..=FB_TOLERANCE.1).contains(&mass) {
                warn!(
                    place,
                    mass, "combined posterior mass deviates from one"
                );
            }
        }

        if have_boundaries {
            if let Some((start, end)) = time_span {
                boundaries.set(0, Boundary::new(start));
                boundaries.set(1, Boundary::new(end));
                union_l.set_boundaries(Some(Rc::new(boundaries)));
            }
        }
        Ok((Rc::new(union_l), builder.finish()))
    }
}

struct Sub {
    name: String,
    weight: Score,
    initial: StateId,
    topo: Vec<StateId>,
    finals: Vec<StateId>,
    norm: Score,
    gen_norm: f64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Sums {
    fwd: Score,
    bwd: Score,
    fwd_cost: f64,
    bwd_cost: f64,
}

fn posterior_semiring(
    sr: &SemiringRef,
    params: &FwdBwdParams,
) -> Result<SemiringRef, LatticeError> {
    match &params.posterior_semiring {
        Some(post) if post.size() != sr.size() => Err(LatticeError::SemiringMismatch {
            left: sr.size(),
            right: post.size(),
        }),
        Some(post) => Ok(Rc::clone(post)),
        None => Ok(to_log_semiring(sr, params.alpha)),
    }
}

fn validate(s: &mut StaticLattice, topo: &[StateId], name: &str) -> Result<(), LatticeError> {
    let mut has_final = false;
    for &sid in topo {
        let (is_final, has_arcs) = match s.state(sid) {
            Some(state) => (state.is_final(), state.has_arcs()),
            None => continue,
        };
        if is_final && has_arcs {
            warn!(
                lattice = name,
                state = sid,
                "final state has outgoing arcs; ignoring its final weight"
            );
            if let Some(state) = s.state_mut(sid) {
                state.unset_final();
            }
        } else if is_final {
            has_final = true;
        } else if !has_arcs {
            return Err(LatticeError::NotTrim(name.to_string(), sid));
        }
    }
    if !has_final {
        return Err(LatticeError::NoFinalState(name.to_string()));
    }
    Ok(())
}

struct Builder<'a> {
    params: &'a FwdBwdParams,
    post: SemiringRef,
    states: Vec<FbState>,
    arcs: Vec<FbArc>,
    // expected prefix / suffix cost per state, present with `cost_id`
    h: Vec<f64>,
    g: Vec<f64>,
    min: Score,
    max: Score,
    sum_col: Collector,
}

impl<'a> Builder<'a> {
    fn new(params: &'a FwdBwdParams, post: SemiringRef, n: usize) -> Self {
        let cost_len = if params.cost_id.is_some() { n } else { 0 };
        Builder {
            params,
            post,
            states: vec![FbState::default(); n],
            arcs: Vec::new(),
            h: vec![0.0; cost_len],
            g: vec![0.0; cost_len],
            min: Score::MAX,
            max: -Score::MAX,
            sum_col: Collector::new(),
        }
    }

    /// Backward then forward sweep over one topologically sorted component.
    fn sweep(&mut self, s: &StaticLattice, topo: &[StateId], initial: StateId, name: &str) -> Sums {
        let ty = self.post.ty();
        let cost_id = self.params.cost_id;
        for &sid in topo {
            self.states[sid as usize].fwd = Score::MAX;
            self.states[sid as usize].bwd = Score::MAX;
        }

        for &sid in topo.iter().rev() {
            let Some(state) = s.state(sid) else { continue };
            let i = sid as usize;
            let mut bwd = Score::MAX;
            let mut gcol = CostCollector::new();
            if let Some(weight) = state.final_weight() {
                let p = self.post.project(weight);
                bwd = scollect(ty, bwd, p);
                if let Some(cid) = cost_id {
                    gcol.feed(p, weight.get(cid));
                }
            }
            for arc in state.arcs() {
                let t = arc.target as usize;
                let contrib = ext(self.post.project(&arc.weight), self.states[t].bwd);
                bwd = scollect(ty, bwd, contrib);
                if let Some(cid) = cost_id {
                    gcol.feed(contrib, arc.weight.get(cid) + self.g[t]);
                }
            }
            self.states[i].bwd = bwd;
            if cost_id.is_some() {
                self.g[i] = gcol.get(bwd);
            }
        }

        let mut hcols: Vec<CostCollector> = if cost_id.is_some() {
            vec![CostCollector::new(); self.states.len()]
        } else {
            Vec::new()
        };
        self.states[initial as usize].fwd = 0.0;
        let mut fwd_sum = Score::MAX;
        let mut fwd_cost_col = CostCollector::new();
        for &sid in topo {
            let Some(state) = s.state(sid) else { continue };
            let i = sid as usize;
            let f = self.states[i].fwd;
            let hs = if cost_id.is_some() {
                let v = hcols[i].get(f);
                self.h[i] = v;
                v
            } else {
                0.0
            };
            if let Some(weight) = state.final_weight() {
                let total = ext(f, self.post.project(weight));
                fwd_sum = scollect(ty, fwd_sum, total);
                if let Some(cid) = cost_id {
                    fwd_cost_col.feed(total, hs + weight.get(cid));
                }
            }
            for arc in state.arcs() {
                let t = arc.target as usize;
                let contrib = ext(f, self.post.project(&arc.weight));
                self.states[t].fwd = scollect(ty, self.states[t].fwd, contrib);
                if let Some(cid) = cost_id {
                    hcols[t].feed(contrib, hs + arc.weight.get(cid));
                }
            }
        }

        let bwd_sum = self.states[initial as usize].bwd;
        let deviation = fwd_sum - bwd_sum;
        if !(FB_TOLERANCE.0..=FB_TOLERANCE.1).contains(&deviation) {
            warn!(
                forward = fwd_sum,
                backward = bwd_sum,
                lattice = name,
                "forward and backward total scores deviate beyond tolerance"
            );
        }
        Sums {
            fwd: fwd_sum,
            bwd: bwd_sum,
            fwd_cost: fwd_cost_col.get(fwd_sum),
            bwd_cost: if cost_id.is_some() {
                self.g[initial as usize]
            } else {
                0.0
            },
        }
    }

    /// Builds the per-arc tables and, when configured, writes posterior and
    /// risk scores back into the lattice's weights.
    fn fill(&mut self, s: &mut StaticLattice, topo: &[StateId], norm: Score, gen_norm: f64) {
        let write_back = self.params.score_id.is_some() || self.params.risk_id.is_some();
        let with_risk = self.params.risk_id.is_some();
        for &sid in topo {
            let i = sid as usize;
            let begin = self.arcs.len();
            let mut posteriors: Vec<Score> = Vec::new();
            let mut risks: Vec<f64> = Vec::new();
            {
                let Some(state) = s.state(sid) else { continue };
                let fwd = self.states[i].fwd;
                for arc in state.arcs() {
                    let t = arc.target as usize;
                    let score = ext(fwd, ext(self.post.project(&arc.weight), self.states[t].bwd));
                    self.arcs.push(FbArc { score, norm });
                    let p = if score >= Score::MAX {
                        Score::MAX
                    } else {
                        score - norm
                    };
                    posteriors.push(p);
                    if p < Score::MAX {
                        self.min = self.min.min(p);
                        self.max = self.max.max(p);
                        self.sum_col.feed(p);
                    }
                    if with_risk {
                        if let Some(cid) = self.params.cost_id {
                            risks.push(self.h[i] + arc.weight.get(cid) + self.g[t] - gen_norm);
                        }
                    }
                }
            }
            self.states[i].norm = norm;
            self.states[i].begin = begin;
            self.states[i].end = self.arcs.len();
            if write_back {
                if let Some(state) = s.state_mut(sid) {
                    for (aid, arc) in state.arcs_mut().iter_mut().enumerate() {
                        let mut weight = arc.weight.as_ref().clone();
                        if let Some(id) = self.params.score_id {
                            weight.set(id, posteriors[aid]);
                        }
                        if let Some(id) = self.params.risk_id {
                            weight.set(id, risks[aid]);
                        }
                        arc.weight = Rc::new(weight);
                    }
                }
            }
        }
    }

    fn finish(mut self) -> FwdBwd {
        if self.min > self.max {
            self.min = 0.0;
            self.max = 0.0;
        }
        FwdBwd {
            states: self.states,
            arcs: self.arcs,
            min: self.min,
            max: self.max,
            sum: self.sum_col.get(),
        }
    }
}
