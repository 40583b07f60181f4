use std::fmt::{Display, Formatter};

/// A 16-bit packet sequence number with wrap-around semantics: 0 follows after FFFF.
///
/// Ordering between two sequence numbers is only meaningful inside a window shorter
///  than half the sequence space (32768); [`SequenceNumber::is_after`] implements that
///  half-space comparison. `Ord` is deliberately not implemented - a total order over
///  the raw values would be wrong at the wrap boundary.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SequenceNumber(u16);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

const HALF_SPACE: u16 = 32768;

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(self) -> u16 {
        self.0
    }

    pub fn next(self) -> SequenceNumber {
        self.plus(1)
    }

    pub fn plus(self, n: u16) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_add(n))
    }

    pub fn minus(self, n: u16) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_sub(n))
    }

    /// Half-space 'greater than' across the wrap boundary: `a.is_after(b)` holds iff
    ///  `a` is ahead of `b` by less than half the sequence space.
    pub fn is_after(self, other: SequenceNumber) -> bool {
        (self.0 > other.0 && self.0 - other.0 <= HALF_SPACE)
            || (self.0 < other.0 && other.0 - self.0 > HALF_SPACE)
    }

    /// Forward distance from `older` to `self`, wrap-aware. Meaningful when
    ///  `self.is_after(older)` (or the two are equal, giving 0).
    pub fn distance_from(self, older: SequenceNumber) -> u16 {
        self.0.wrapping_sub(older.0)
    }
}
