//! Score vectors and the semirings interpreting them.
//!
//! All scores live in the negative-log domain: lower is better, `0.0` is
//! probability one and [`Semiring::zero`] (all dimensions at `Score::MAX`)
//! is probability zero. A [`Semiring`] fixes the number of dimensions, a
//! scale factor and a string key per dimension, and the collect rule used
//! when two paths meet (scaled log-add for the log semiring, min by
//! projection for the tropical semiring).

use std::cmp::Ordering;
use std::rc::Rc;

use hashbrown::HashMap;

use crate::{Score, ScoreId};

/// Shared immutable score vector.
pub type ScoresRef = Rc<Scores>;

/// Shared immutable semiring.
pub type SemiringRef = Rc<Semiring>;

/// Fixed-length vector of scores; the weight of an arc or final state.
#[derive(Debug, Clone, PartialEq)]
pub struct Scores {
    values: Vec<Score>,
}

impl Scores {
    pub fn new(n: usize, init: Score) -> Self {
        Scores {
            values: vec![init; n],
        }
    }

    pub fn from_vec(values: Vec<Score>) -> Self {
        Scores { values }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[inline]
    pub fn get(&self, id: ScoreId) -> Score {
        self.values[id]
    }

    #[inline]
    pub fn set(&mut self, id: ScoreId, score: Score) {
        self.values[id] = score;
    }

    pub fn iter(&self) -> impl Iterator<Item = Score> + '_ {
        self.values.iter().copied()
    }
}

/// The collect rule a semiring applies where paths meet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemiringType {
    /// Scaled log-add: probability mass of alternatives is summed.
    Log,
    /// Min by projection: only the best alternative survives.
    Tropical,
}

/// Adds two scores in the negative-log domain.
///
/// Computes `-ln(exp(-a) + exp(-b))` without leaving the log domain; the
/// smaller (better) score anchors the computation so the exponent never
/// overflows.
#[inline]
pub fn log_add(a: Score, b: Score) -> Score {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    if hi >= Score::MAX {
        return lo;
    }
    lo - (-(hi - lo)).exp().ln_1p()
}

/// A scaled, keyed score-vector semiring.
///
/// Two semirings are equal iff they agree in type, dimensionality, and
/// scales; keys are labels for reporting and lookup and do not take part in
/// equality.
#[derive(Debug)]
pub struct Semiring {
    ty: SemiringType,
    scales: Vec<Score>,
    keys: Vec<String>,
    key_map: HashMap<String, ScoreId>,
    one: ScoresRef,
    zero: ScoresRef,
}

impl PartialEq for Semiring {
    fn eq(&self, other: &Self) -> bool {
        self.ty == other.ty && self.scales == other.scales
    }
}

impl Semiring {
    pub fn new(ty: SemiringType, scales: Vec<Score>, keys: Vec<String>) -> Self {
        debug_assert_eq!(scales.len(), keys.len());
        let key_map = keys
            .iter()
            .enumerate()
            .map(|(id, key)| (key.clone(), id))
            .collect();
        let n = scales.len();
        Semiring {
            ty,
            scales,
            keys,
            key_map,
            one: Rc::new(Scores::new(n, 0.0)),
            zero: Rc::new(Scores::new(n, Score::MAX)),
        }
    }

    pub fn log(scales: Vec<Score>, keys: Vec<String>) -> SemiringRef {
        Rc::new(Semiring::new(SemiringType::Log, scales, keys))
    }

    pub fn tropical(scales: Vec<Score>, keys: Vec<String>) -> SemiringRef {
        Rc::new(Semiring::new(SemiringType::Tropical, scales, keys))
    }

    #[inline]
    pub fn ty(&self) -> SemiringType {
        self.ty
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.scales.len()
    }

    #[inline]
    pub fn scales(&self) -> &[Score] {
        &self.scales
    }

    #[inline]
    pub fn scale(&self, id: ScoreId) -> Score {
        self.scales[id]
    }

    #[inline]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    #[inline]
    pub fn key(&self, id: ScoreId) -> &str {
        &self.keys[id]
    }

    /// Looks up the dimension registered under `key`.
    pub fn id(&self, key: &str) -> Option<ScoreId> {
        self.key_map.get(key).copied()
    }

    /// The multiplicative identity: all dimensions at `0.0`.
    #[inline]
    pub fn one(&self) -> &ScoresRef {
        &self.one
    }

    /// The additive identity: all dimensions at `Score::MAX`.
    #[inline]
    pub fn zero(&self) -> &ScoresRef {
        &self.zero
    }

    #[inline]
    fn is_zero(&self, a: &Scores) -> bool {
        a == self.zero.as_ref()
    }

    /// Scalar score of a vector: the dot product with the scales.
    pub fn project(&self, a: &Scores) -> Score {
        debug_assert_eq!(a.len(), self.size());
        let mut sum = 0.0;
        for (v, s) in a.iter().zip(self.scales.iter()) {
            if v >= Score::MAX {
                return Score::MAX;
            }
            sum += s * v;
        }
        sum
    }

    /// Path extension: dimension-wise sum, with zero absorbing.
    pub fn extend(&self, a: &ScoresRef, b: &ScoresRef) -> ScoresRef {
        if self.is_zero(a) || self.is_zero(b) {
            return Rc::clone(&self.zero);
        }
        let values = a.iter().zip(b.iter()).map(|(x, y)| x + y).collect();
        Rc::new(Scores::from_vec(values))
    }

    /// Path combination where two paths meet.
    ///
    /// Tropical: the vector with the smaller projection wins. Log: each
    /// dimension is log-added in the scaled domain, then the result is
    /// renormalized so that its projection equals the log-add of the two
    /// projections.
    pub fn collect(&self, a: &ScoresRef, b: &ScoresRef) -> ScoresRef {
        if self.is_zero(a) {
            return Rc::clone(b);
        }
        if self.is_zero(b) {
            return Rc::clone(a);
        }
        match self.ty {
            SemiringType::Tropical => {
                if self.project(a) <= self.project(b) {
                    Rc::clone(a)
                } else {
                    Rc::clone(b)
                }
            }
            SemiringType::Log => {
                let n = self.size();
                let mut scaled = vec![0.0; n];
                let mut sum_a = 0.0;
                let mut sum_b = 0.0;
                let mut norm = 0.0;
                for i in 0..n {
                    let sc = self.scales[i];
                    let sa = sc * a.get(i);
                    let sb = sc * b.get(i);
                    sum_a += sa;
                    sum_b += sb;
                    let c = log_add(sa, sb);
                    scaled[i] = c;
                    norm += c;
                }
                let target = log_add(sum_a, sum_b);
                let z = if norm == 0.0 { 1.0 } else { target / norm };
                let mut out = Scores::new(n, 0.0);
                for i in 0..n {
                    let sc = self.scales[i];
                    if sc != 0.0 {
                        out.set(i, scaled[i] * z / sc);
                    }
                }
                Rc::new(out)
            }
        }
    }

    /// Total order on score vectors induced by the projection.
    pub fn compare(&self, a: &Scores, b: &Scores) -> Ordering {
        self.project(a)
            .partial_cmp(&self.project(b))
            .unwrap_or(Ordering::Equal)
    }

    /// A new vector with `id` replaced by `score`.
    pub fn set_score(&self, a: &ScoresRef, id: ScoreId, score: Score) -> ScoresRef {
        let mut out = a.as_ref().clone();
        out.set(id, score);
        Rc::new(out)
    }
}

/// Derives the log semiring used for posterior computation.
///
/// `alpha` scales every dimension uniformly; `0.0` selects the inverse of
/// the largest scale (so the dominant dimension runs at scale one), and
/// `Score::MAX` degrades to the tropical semiring (Viterbi posteriors).
pub fn to_log_semiring(sr: &SemiringRef, alpha: Score) -> SemiringRef {
    if alpha >= Score::MAX {
        return to_tropical_semiring(sr);
    }
    let alpha = if alpha == 0.0 {
        let max_scale = sr.scales().iter().copied().fold(0.0, Score::max);
        if max_scale > 0.0 { 1.0 / max_scale } else { 1.0 }
    } else {
        alpha
    };
    Rc::new(Semiring::new(
        SemiringType::Log,
        sr.scales().iter().map(|s| alpha * s).collect(),
        sr.keys().to_vec(),
    ))
}

/// Derives the tropical semiring with the same scales and keys.
pub fn to_tropical_semiring(sr: &SemiringRef) -> SemiringRef {
    Rc::new(Semiring::new(
        SemiringType::Tropical,
        sr.scales().to_vec(),
        sr.keys().to_vec(),
    ))
}

/// Incremental log-sum-exp over scalar scores.
///
/// Keeps the best score seen so far as the reference exponent, so feeding
/// scores in any order stays numerically stable.
#[derive(Debug, Clone)]
pub struct Collector {
    reference: Score,
    acc: f64,
}

impl Collector {
    pub fn new() -> Self {
        Collector {
            reference: Score::MAX,
            acc: 0.0,
        }
    }

    pub fn feed(&mut self, score: Score) {
        if score >= Score::MAX {
            return;
        }
        if score < self.reference {
            if self.reference < Score::MAX {
                self.acc *= (score - self.reference).exp();
            }
            self.reference = score;
            self.acc += 1.0;
        } else {
            self.acc += (self.reference - score).exp();
        }
    }

    /// The collected sum, or `Score::MAX` when nothing finite was fed.
    pub fn get(&self) -> Score {
        if self.reference >= Score::MAX {
            return Score::MAX;
        }
        self.reference - self.acc.ln()
    }

    pub fn reset(&mut self) {
        self.reference = Score::MAX;
        self.acc = 0.0;
    }
}

impl Default for Collector {
    fn default() -> Self {
        Collector::new()
    }
}

/// Incremental expectation of per-path costs under posterior weights.
///
/// Feeding `(score, cost)` accumulates `cost * exp(-score)` relative to a
/// running reference exponent; [`CostCollector::get`] divides by the
/// normalization constant `exp(-norm)`.
#[derive(Debug, Clone)]
pub struct CostCollector {
    reference: Score,
    acc: f64,
}

impl CostCollector {
    pub fn new() -> Self {
        CostCollector {
            reference: Score::MAX,
            acc: 0.0,
        }
    }

    pub fn feed(&mut self, score: Score, cost: f64) {
        if score >= Score::MAX {
            return;
        }
        if score < self.reference {
            if self.reference < Score::MAX {
                self.acc *= (score - self.reference).exp();
            }
            self.reference = score;
            self.acc += cost;
        } else {
            self.acc += cost * (self.reference - score).exp();
        }
    }

    /// Expected cost normalized by `norm` (a negative-log mass).
    pub fn get(&self, norm: Score) -> f64 {
        if self.reference >= Score::MAX {
            return 0.0;
        }
        self.acc * (norm - self.reference).exp()
    }
}

impl Default for CostCollector {
    fn default() -> Self {
        CostCollector::new()
    }
}
