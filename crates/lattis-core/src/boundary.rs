//! Per-state time alignment and articulatory transit metadata.
//!
//! Each state of a time-aligned lattice carries a [`Boundary`]: the time
//! frame at which all paths through the state meet, plus the phoneme
//! context across the word boundary. Transformations that restructure the
//! state space must drop or remap the table rather than propagate stale
//! entries.

use std::rc::Rc;

use crate::StateId;

/// Time frame index. Frames advance at [`FRAMES_PER_SECOND`].
pub type Time = i32;

/// Sentinel for "not time-aligned".
pub const INVALID_TIME: Time = i32::MAX;

/// Frame rate of the time axis.
pub const FRAMES_PER_SECOND: f64 = 100.0;

/// Phoneme identifier into an external phoneme inventory.
pub type PhonemeId = u32;

/// Sentinel for "no phoneme context".
pub const INVALID_PHONEME_ID: PhonemeId = u32::MAX;

pub type ConstBoundariesRef = Rc<Boundaries>;

/// Phoneme context across a word boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transit {
    /// Final phoneme of the word ending here.
    pub exit: PhonemeId,
    /// Initial phoneme of the word starting here.
    pub entry: PhonemeId,
    /// Whether the boundary crosses a word boundary.
    pub across_word: bool,
}

impl Default for Transit {
    fn default() -> Self {
        Transit {
            exit: INVALID_PHONEME_ID,
            entry: INVALID_PHONEME_ID,
            across_word: false,
        }
    }
}

/// Time and transit of a single state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boundary {
    time: Time,
    transit: Transit,
}

impl Boundary {
    pub fn new(time: Time) -> Self {
        Boundary {
            time,
            transit: Transit::default(),
        }
    }

    pub fn with_transit(time: Time, transit: Transit) -> Self {
        Boundary { time, transit }
    }

    #[inline]
    pub fn time(&self) -> Time {
        self.time
    }

    #[inline]
    pub fn transit(&self) -> Transit {
        self.transit
    }

    #[inline]
    pub fn valid(&self) -> bool {
        self.time != INVALID_TIME
    }
}

impl Default for Boundary {
    fn default() -> Self {
        Boundary::new(INVALID_TIME)
    }
}

/// Boundary table indexed by state id.
///
/// Reads outside the stored range yield the invalid boundary, so sparse
/// state ids need no special handling.
#[derive(Debug, Default, Clone)]
pub struct Boundaries {
    entries: Vec<Boundary>,
}

impl Boundaries {
    pub fn new() -> Self {
        Boundaries::default()
    }

    /// Whether the table carries any alignment at all.
    pub fn valid(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Whether state `sid` is time-aligned.
    pub fn valid_at(&self, sid: StateId) -> bool {
        self.get(sid).valid()
    }

    pub fn get(&self, sid: StateId) -> Boundary {
        self.entries
            .get(sid as usize)
            .copied()
            .unwrap_or_default()
    }

    pub fn time(&self, sid: StateId) -> Time {
        self.get(sid).time()
    }

    /// Stores the boundary of `sid`, growing the table as needed.
    pub fn set(&mut self, sid: StateId, boundary: Boundary) {
        let idx = sid as usize;
        if idx >= self.entries.len() {
            self.entries.resize(idx + 1, Boundary::default());
        }
        self.entries[idx] = boundary;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
