//! Pronunciation lookup, provided by the surrounding system.
//!
//! Phone-coverage pruning needs to know which phoneme sequence a label
//! stands for; everything else about the lexicon (construction, spelling,
//! variants) stays outside this crate.

use crate::LabelId;
use crate::boundary::PhonemeId;

/// Read-only label-to-pronunciation mapping.
pub trait PronunciationLexicon {
    /// Size of the phoneme inventory; phoneme ids are `0..n_phonemes()`.
    fn n_phonemes(&self) -> usize;

    /// Phoneme sequence of `label`; empty for labels without one
    /// (epsilon, noise, lattice-internal markers).
    fn pronunciation(&self, label: LabelId) -> &[PhonemeId];
}

/// Table-backed lexicon, indexed by label id.
#[derive(Debug, Default)]
pub struct StaticPronunciationLexicon {
    n_phonemes: usize,
    pronunciations: Vec<Vec<PhonemeId>>,
}

impl StaticPronunciationLexicon {
    pub fn new(n_phonemes: usize, pronunciations: Vec<Vec<PhonemeId>>) -> Self {
        StaticPronunciationLexicon {
            n_phonemes,
            pronunciations,
        }
    }
}

impl PronunciationLexicon for StaticPronunciationLexicon {
    fn n_phonemes(&self) -> usize {
        self.n_phonemes
    }

    fn pronunciation(&self, label: LabelId) -> &[PhonemeId] {
        self.pronunciations
            .get(label as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
