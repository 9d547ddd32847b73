//! Posterior pruning.
//!
//! All pruning here is driven by forward-backward posterior scores: an arc
//! survives when the probability of passing it is high enough. On top of
//! the plain threshold cut sit two refinements: an adaptive search that
//! tunes the threshold to hit an arc-rate budget, and a phone-coverage
//! criterion that protects, per time frame and phoneme, the best few arcs
//! regardless of their posterior, then reconnects them into complete
//! paths.

use std::rc::Rc;

use hashbrown::{HashMap, HashSet};
use tracing::{debug, info, warn};

use lattis_core::boundary::{
    ConstBoundariesRef, FRAMES_PER_SECOND, INVALID_TIME, PhonemeId, Time,
};
use lattis_core::cache::static_copy;
use lattis_core::info::{count, trim_in_place};
use lattis_core::lattice::{
    AlphabetRef, ConstStateMapRef, ConstStateRef, FsaType, Lattice, LatticeRef, State,
};
use lattis_core::lexicon::PronunciationLexicon;
use lattis_core::semiring::SemiringRef;
use lattis_core::traverse::{sort_chronologically, sort_topologically};
use lattis_core::{EPSILON, INVALID_STATE_ID, LatticeError, Score, StateId};

use crate::best::best_projection;
use crate::fwdbwd::{FwdBwd, FwdBwdParams};

/// Arc-rate limits for the adaptive threshold search.
#[derive(Debug, Clone)]
pub struct PruneParams {
    /// Grow the threshold until at least this many arcs per second survive.
    pub min_arcs_per_second: f64,
    /// Shrink the threshold until at most this many arcs per second survive.
    pub max_arcs_per_second: f64,
    /// Hard cap on surviving arcs, independent of duration.
    pub max_arcs_per_segment: usize,
}

impl Default for PruneParams {
    fn default() -> Self {
        PruneParams {
            min_arcs_per_second: 0.0,
            max_arcs_per_second: f64::MAX,
            max_arcs_per_segment: usize::MAX,
        }
    }
}

/// View dropping every arc whose posterior score exceeds the cutoff.
struct FwdBwdPruningLattice {
    inner: LatticeRef,
    fb: Rc<FwdBwd>,
    cutoff: Score,
}

impl FwdBwdPruningLattice {
    fn keep(&self, sid: StateId, aid: usize) -> bool {
        self.fb.arc(sid, aid).posterior() <= self.cutoff
    }
}

impl Lattice for FwdBwdPruningLattice {
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
        let mut pruned = State::new(sid);
        if let Some(weight) = state.final_weight() {
            pruned.set_final(Rc::clone(weight));
        }
        for (aid, arc) in state.arcs().iter().enumerate() {
            if self.keep(sid, aid) {
                pruned.push_arc(arc.clone());
            }
        }
        Rc::new(pruned)
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

    // removing arcs keeps any topological order of the input valid
    fn topological_sort(&self) -> Option<ConstStateMapRef> {
        self.inner.topological_sort()
    }

    fn describe(&self) -> String {
        format!(
            "prunePosterior(cutoff={:.4}; {})",
            self.cutoff,
            self.inner.describe()
        )
    }
}

/// The primitive threshold cut at an absolute posterior cutoff.
pub fn prune_posterior(l: &LatticeRef, fb: &Rc<FwdBwd>, cutoff: Score) -> LatticeRef {
    Rc::new(FwdBwdPruningLattice {
        inner: Rc::clone(l),
        fb: Rc::clone(fb),
        cutoff,
    })
}

fn duration_seconds(l: &LatticeRef) -> Option<f64> {
    let boundaries = l.boundaries().filter(|b| b.valid())?;
    let chrono = sort_chronologically(l.as_ref())?;
    let first = boundaries.time(chrono.first()?);
    let last = boundaries.time(chrono.last()?);
    if first == INVALID_TIME || last == INVALID_TIME {
        return None;
    }
    Some(f64::from(last - first) / FRAMES_PER_SECOND)
}

fn arc_budget(l: &LatticeRef, params: &PruneParams) -> (usize, usize) {
    let mut min_arcs = 0usize;
    let mut max_arcs = params.max_arcs_per_segment;
    let rate_limited = params.min_arcs_per_second > 0.0 || params.max_arcs_per_second < f64::MAX;
    if rate_limited {
        match duration_seconds(l) {
            Some(seconds) if seconds > 0.0 => {
                if params.min_arcs_per_second > 0.0 {
                    min_arcs = (params.min_arcs_per_second * seconds).ceil() as usize;
                }
                if params.max_arcs_per_second < f64::MAX {
                    let by_rate = (params.max_arcs_per_second * seconds).floor().max(1.0) as usize;
                    max_arcs = max_arcs.min(by_rate);
                }
            }
            _ => warn!(
                lattice = %l.describe(),
                "no time alignment; arcs-per-second limits are ignored"
            ),
        }
    }
    (min_arcs, max_arcs)
}

/// Threshold pruning with an adaptive arc-rate search.
///
/// `threshold` is relative: an arc survives while its posterior score is
/// within `threshold` of the best arc's. The threshold is clamped to the
/// lattice's posterior range, shrunk geometrically (factor 0.9, floor 0.1)
/// while too many arcs survive, and grown (factor 1.2, ceiling 100) while
/// too few do. A non-positive threshold degrades to the single best path;
/// an infinite threshold without arc limits is the identity. An empty
/// lattice, or one already within the minimum arc count, passes through
/// unchanged.
pub fn prune_by_fwd_bwd(
    l: &LatticeRef,
    fb: &Rc<FwdBwd>,
    threshold: Score,
    params: &PruneParams,
) -> Result<LatticeRef, LatticeError> {
    if l.initial_state_id() == INVALID_STATE_ID {
        return Ok(Rc::clone(l));
    }
    let unlimited = params.min_arcs_per_second <= 0.0
        && params.max_arcs_per_second >= f64::MAX
        && params.max_arcs_per_segment == usize::MAX;
    if threshold >= Score::MAX && unlimited {
        return Ok(Rc::clone(l));
    }
    if threshold <= 0.0 {
        return Ok(best_projection(l)?.0);
    }
    let (min_arcs, max_arcs) = arc_budget(l, params);
    if min_arcs > 0 && count(l.as_ref()).n_arcs <= min_arcs {
        debug!(
            min_arcs,
            "lattice has no more arcs than the minimum; not pruning"
        );
        return Ok(Rc::clone(l));
    }
    let mut t = threshold.min(fb.max() - fb.min());
    let mut pruned = prune_posterior(l, fb, fb.min() + t);
    if max_arcs < usize::MAX {
        let mut n_arcs = count(pruned.as_ref()).n_arcs;
        while n_arcs > max_arcs && t > 0.1 {
            t *= 0.9;
            debug!(threshold = t, arcs = n_arcs, "tightening posterior pruning");
            pruned = prune_posterior(l, fb, fb.min() + t);
            n_arcs = count(pruned.as_ref()).n_arcs;
        }
    }
    if min_arcs > 0 {
        let mut n_arcs = count(pruned.as_ref()).n_arcs;
        while n_arcs < min_arcs && t < 100.0 {
            t *= 1.2;
            debug!(threshold = t, arcs = n_arcs, "relaxing posterior pruning");
            pruned = prune_posterior(l, fb, fb.min() + t);
            n_arcs = count(pruned.as_ref()).n_arcs;
        }
    }
    Ok(pruned)
}

/// View keeping an arc when it is protected by phone coverage or within
/// the posterior cutoff.
struct PhoneCoveragePruningLattice {
    inner: LatticeRef,
    fb: Rc<FwdBwd>,
    cutoff: Score,
    covered: HashSet<(StateId, u32)>,
}

impl Lattice for PhoneCoveragePruningLattice {
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
        let mut pruned = State::new(sid);
        if let Some(weight) = state.final_weight() {
            pruned.set_final(Rc::clone(weight));
        }
        for (aid, arc) in state.arcs().iter().enumerate() {
            if self.covered.contains(&(sid, aid as u32))
                || self.fb.arc(sid, aid).posterior() <= self.cutoff
            {
                pruned.push_arc(arc.clone());
            }
        }
        Rc::new(pruned)
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

    fn describe(&self) -> String {
        format!("prunePhoneCoverage({})", self.inner.describe())
    }
}

#[derive(Clone)]
struct CellEntry {
    posterior: Score,
    sid: StateId,
    aid: u32,
}

fn record_cell(cell: &mut Vec<CellEntry>, coverage: usize, entry: CellEntry) {
    let pos = cell.partition_point(|e| e.posterior <= entry.posterior);
    if pos >= coverage {
        return;
    }
    cell.insert(pos, entry);
    cell.truncate(coverage);
}

fn cell_mut<'a>(
    cells: &'a mut Vec<Vec<Vec<CellEntry>>>,
    time: usize,
    bin: usize,
    n_bins: usize,
) -> &'a mut Vec<CellEntry> {
    if time >= cells.len() {
        cells.resize_with(time + 1, || vec![Vec::new(); n_bins]);
    }
    &mut cells[time][bin]
}

fn connect_forwards(
    l: &LatticeRef,
    fb: &FwdBwd,
    mut sid: StateId,
    covered: &mut HashSet<(StateId, u32)>,
) {
    loop {
        let state = l.get_state(sid);
        if state.is_final() || !state.has_arcs() {
            return;
        }
        let fb_arcs = fb.arcs(sid);
        let mut best = 0usize;
        for aid in 1..state.n_arcs() {
            if fb_arcs[aid].posterior() < fb_arcs[best].posterior() {
                best = aid;
            }
        }
        // an already covered arc continues an existing connected path
        if !covered.insert((sid, best as u32)) {
            return;
        }
        sid = state.arcs()[best].target;
    }
}

fn connect_backwards(
    initial: StateId,
    mut sid: StateId,
    best_in: &HashMap<StateId, (Score, StateId, u32)>,
    covered: &mut HashSet<(StateId, u32)>,
) {
    while sid != initial {
        let Some(&(_, src, aid)) = best_in.get(&sid) else {
            return;
        };
        if !covered.insert((src, aid)) {
            return;
        }
        sid = src;
    }
}

/// Phone-coverage pruning.
///
/// Each arc distributes coverage credit over the phonemes of its label's
/// pronunciation, linearly interpolated over the arc's time span; per
/// (time frame, phoneme) cell the best `coverage` arcs are protected.
/// Phones listed in `non_word_phones` share one bin; epsilon arcs and
/// labels without a pronunciation contribute nothing. Protected arcs are
/// then connected into complete paths, forward along the best out-arc and
/// backward along the best recorded in-arc, stopping as soon as an already
/// protected arc is reached. All other arcs fall under the plain posterior
/// cutoff.
pub fn prune_phone_coverage(
    l: &LatticeRef,
    fb: &Rc<FwdBwd>,
    cutoff: Score,
    coverage: usize,
    lexicon: &Rc<dyn PronunciationLexicon>,
    non_word_phones: &HashSet<PhonemeId>,
) -> Result<LatticeRef, LatticeError> {
    let boundaries = l
        .boundaries()
        .filter(|b| b.valid())
        .ok_or_else(|| LatticeError::MissingBoundaries(l.describe()))?;
    let sort =
        sort_topologically(l.as_ref()).ok_or_else(|| LatticeError::NotAcyclic(l.describe()))?;
    let shared_bin = lexicon.n_phonemes();
    let n_bins = shared_bin + 1;

    let mut cells: Vec<Vec<Vec<CellEntry>>> = Vec::new();
    let mut best_in: HashMap<StateId, (Score, StateId, u32)> = HashMap::new();
    for sid in sort.iter() {
        let state = l.get_state(sid);
        let t_begin = boundaries.time(sid);
        for (aid, arc) in state.arcs().iter().enumerate() {
            let posterior = fb.arc(sid, aid).posterior();
            let entry = best_in
                .entry(arc.target)
                .or_insert((posterior, sid, aid as u32));
            if posterior < entry.0 {
                *entry = (posterior, sid, aid as u32);
            }
            if arc.input == EPSILON {
                continue;
            }
            let pron = lexicon.pronunciation(arc.input);
            if pron.is_empty() {
                continue;
            }
            let t_end = boundaries.time(arc.target);
            if t_begin == INVALID_TIME || t_end == INVALID_TIME || t_begin < 0 {
                continue;
            }
            let t_end = t_end.max(t_begin + 1);
            let span = f64::from(t_end - t_begin);
            let n = pron.len() as f64;
            for (i, &phone) in pron.iter().enumerate() {
                let bin = if non_word_phones.contains(&phone) {
                    shared_bin
                } else {
                    phone as usize
                };
                let from = t_begin + (span * i as f64 / n) as Time;
                let mut to = t_begin + (span * (i as f64 + 1.0) / n) as Time;
                if to <= from {
                    to = from + 1;
                }
                for t in from..to {
                    record_cell(
                        cell_mut(&mut cells, t as usize, bin, n_bins),
                        coverage,
                        CellEntry {
                            posterior,
                            sid,
                            aid: aid as u32,
                        },
                    );
                }
            }
        }
    }

    let mut covered: HashSet<(StateId, u32)> = HashSet::new();
    let mut seeds: Vec<(StateId, u32)> = Vec::new();
    for per_time in &cells {
        for cell in per_time {
            for e in cell {
                if covered.insert((e.sid, e.aid)) {
                    seeds.push((e.sid, e.aid));
                }
            }
        }
    }
    let n_seeds = seeds.len();
    let initial = l.initial_state_id();
    for (sid, aid) in seeds {
        let target = l.get_state(sid).arcs()[aid as usize].target;
        connect_forwards(l, fb, target, &mut covered);
        connect_backwards(initial, sid, &best_in, &mut covered);
    }
    info!(
        protected = n_seeds,
        connected = covered.len(),
        "phone coverage pruning"
    );
    Ok(Rc::new(PhoneCoveragePruningLattice {
        inner: Rc::clone(l),
        fb: Rc::clone(fb),
        cutoff,
        covered,
    }))
}

/// Complete pruning configuration.
#[derive(Debug, Clone)]
pub struct FwdBwdPrunerParams {
    /// Pruning threshold; infinite disables the threshold cut.
    pub threshold: Score,
    /// Interpret the threshold relative to the best arc's posterior
    /// (otherwise as an absolute posterior score).
    pub relative: bool,
    /// Interpret the threshold as a probability `p` in `[0, 1]` and prune
    /// at `-ln p`.
    pub as_probability: bool,
    pub min_arcs_per_second: f64,
    pub max_arcs_per_second: f64,
    pub max_arcs_per_segment: usize,
    /// Number of arcs protected per (time frame, phoneme); zero disables
    /// phone coverage.
    pub phone_coverage: usize,
    /// Phones pooled into one coverage bin (silence, noise).
    pub non_word_phones: Vec<PhonemeId>,
    pub fwd_bwd: FwdBwdParams,
}

impl Default for FwdBwdPrunerParams {
    fn default() -> Self {
        FwdBwdPrunerParams {
            threshold: Score::MAX,
            relative: true,
            as_probability: false,
            min_arcs_per_second: 0.0,
            max_arcs_per_second: f64::MAX,
            max_arcs_per_segment: usize::MAX,
            phone_coverage: 0,
            non_word_phones: Vec::new(),
            fwd_bwd: FwdBwdParams::default(),
        }
    }
}

/// Posterior pruner combining the forward-backward run, the threshold and
/// arc-rate logic, phone coverage, and optional trimming.
pub struct FwdBwdPruner {
    threshold: Score,
    relative: bool,
    prune: PruneParams,
    phone_coverage: usize,
    non_word_phones: HashSet<PhonemeId>,
    fwd_bwd: FwdBwdParams,
    lexicon: Option<Rc<dyn PronunciationLexicon>>,
}

impl FwdBwdPruner {
    pub fn new(params: FwdBwdPrunerParams) -> Result<Self, LatticeError> {
        params.fwd_bwd.verify()?;
        let threshold = if params.as_probability {
            let p = params.threshold;
            if !(0.0..=1.0).contains(&p) {
                return Err(LatticeError::InvalidProbabilityThreshold(p));
            }
            if p == 0.0 { Score::MAX } else { -p.ln() }
        } else {
            params.threshold
        };
        Ok(FwdBwdPruner {
            threshold,
            relative: params.relative,
            prune: PruneParams {
                min_arcs_per_second: params.min_arcs_per_second,
                max_arcs_per_second: params.max_arcs_per_second,
                max_arcs_per_segment: params.max_arcs_per_segment,
            },
            phone_coverage: params.phone_coverage,
            non_word_phones: params.non_word_phones.iter().copied().collect(),
            fwd_bwd: params.fwd_bwd,
            lexicon: None,
        })
    }

    /// Supplies the lexicon phone-coverage pruning resolves labels with.
    pub fn with_lexicon(mut self, lexicon: Rc<dyn PronunciationLexicon>) -> Self {
        self.lexicon = Some(lexicon);
        self
    }

    /// Prunes `l`, optionally compacting the result into a trimmed static
    /// lattice. When trimming leaves no complete path the single best path
    /// is returned instead. An empty lattice passes through unchanged.
    pub fn prune(&self, l: &LatticeRef, trim: bool) -> Result<LatticeRef, LatticeError> {
        if l.initial_state_id() == INVALID_STATE_ID {
            return Ok(Rc::clone(l));
        }
        let (base, fb) = FwdBwd::build(l, &self.fwd_bwd)?;
        let fb = Rc::new(fb);
        let t = if self.relative || self.threshold >= Score::MAX {
            self.threshold
        } else {
            self.threshold - fb.min()
        };
        let result = if t <= 0.0 {
            best_projection(&base)?.0
        } else {
            match (&self.lexicon, self.phone_coverage) {
                (Some(lexicon), coverage) if coverage > 0 => {
                    let cutoff = if t >= Score::MAX {
                        Score::MAX
                    } else {
                        fb.min() + t.min(fb.max() - fb.min())
                    };
                    prune_phone_coverage(&base, &fb, cutoff, coverage, lexicon, &self.non_word_phones)?
                }
                _ => prune_by_fwd_bwd(&base, &fb, t, &self.prune)?,
            }
        };
        if trim {
            let mut compact = static_copy(&result);
            trim_in_place(&mut compact);
            if compact.initial_state_id() == INVALID_STATE_ID {
                warn!(
                    lattice = %l.describe(),
                    "pruning removed all complete paths; falling back to the best path"
                );
                return Ok(best_projection(&base)?.0);
            }
            return Ok(Rc::new(compact));
        }
        Ok(result)
    }
}
