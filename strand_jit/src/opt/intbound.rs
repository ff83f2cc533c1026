//! Integer intervals.

use std::fmt;

/// A closed interval `[lower, upper]` of `i64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntBound {
    /// Smallest possible value.
    pub lower: i64,
    /// Largest possible value.
    pub upper: i64,
}

impl Default for IntBound {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl IntBound {
    /// Any value.
    #[inline]
    pub const fn unbounded() -> Self {
        Self {
            lower: i64::MIN,
            upper: i64::MAX,
        }
    }

    /// Exactly `value`.
    #[inline]
    pub const fn exact(value: i64) -> Self {
        Self {
            lower: value,
            upper: value,
        }
    }

    /// `[lower, upper]`.
    #[inline]
    pub const fn new(lower: i64, upper: i64) -> Self {
        Self { lower, upper }
    }

    /// `[0, i64::MAX]`.
    #[inline]
    pub const fn nonneg() -> Self {
        Self::new(0, i64::MAX)
    }

    /// `[0, 1]`.
    #[inline]
    pub const fn boolean() -> Self {
        Self::new(0, 1)
    }

    /// The single value, if the interval has one.
    #[inline]
    pub fn constant(&self) -> Option<i64> {
        (self.lower == self.upper).then_some(self.lower)
    }

    /// Whether `value` is in the interval.
    #[inline]
    pub fn contains(&self, value: i64) -> bool {
        self.lower <= value && value <= self.upper
    }

    /// Whether every value is `>= 0`.
    #[inline]
    pub fn known_nonneg(&self) -> bool {
        self.lower >= 0
    }

    /// Whether zero is excluded.
    #[inline]
    pub fn known_nonzero(&self) -> bool {
        !self.contains(0)
    }

    /// Whether no value is left.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.lower > self.upper
    }

    /// Every value is `< other`'s.
    #[inline]
    pub fn known_lt(&self, other: &IntBound) -> bool {
        self.upper < other.lower
    }

    /// Every value is `<= other`'s.
    #[inline]
    pub fn known_le(&self, other: &IntBound) -> bool {
        self.upper <= other.lower
    }

    /// Every value is `> other`'s.
    #[inline]
    pub fn known_gt(&self, other: &IntBound) -> bool {
        other.known_lt(self)
    }

    /// Every value is `>= other`'s.
    #[inline]
    pub fn known_ge(&self, other: &IntBound) -> bool {
        other.known_le(self)
    }

    /// The intervals share no value.
    #[inline]
    pub fn disjoint(&self, other: &IntBound) -> bool {
        self.upper < other.lower || other.upper < self.lower
    }

    /// Narrow to the intersection; returns whether anything changed.
    pub fn intersect(&mut self, other: &IntBound) -> bool {
        let narrowed = IntBound::new(self.lower.max(other.lower), self.upper.min(other.upper));
        let changed = narrowed != *self;
        *self = narrowed;
        changed
    }

    /// Smallest interval holding both.
    pub fn union(&self, other: &IntBound) -> IntBound {
        IntBound::new(self.lower.min(other.lower), self.upper.max(other.upper))
    }

    /// Narrow to values `< bound`.
    pub fn make_lt(&mut self, other: &IntBound) -> bool {
        match other.upper.checked_sub(1) {
            Some(upper) => self.intersect(&IntBound::new(i64::MIN, upper)),
            None => false,
        }
    }

    /// Narrow to values `<= bound`.
    pub fn make_le(&mut self, other: &IntBound) -> bool {
        self.intersect(&IntBound::new(i64::MIN, other.upper))
    }

    /// Narrow to values `> bound`.
    pub fn make_gt(&mut self, other: &IntBound) -> bool {
        match other.lower.checked_add(1) {
            Some(lower) => self.intersect(&IntBound::new(lower, i64::MAX)),
            None => false,
        }
    }

    /// Narrow to values `>= bound`.
    pub fn make_ge(&mut self, other: &IntBound) -> bool {
        self.intersect(&IntBound::new(other.lower, i64::MAX))
    }

    /// Bound of `self + other`, `None` if it may overflow.
    pub fn add(&self, other: &IntBound) -> Option<IntBound> {
        Some(IntBound::new(
            self.lower.checked_add(other.lower)?,
            self.upper.checked_add(other.upper)?,
        ))
    }

    /// Bound of `self - other`, `None` if it may overflow.
    pub fn sub(&self, other: &IntBound) -> Option<IntBound> {
        Some(IntBound::new(
            self.lower.checked_sub(other.upper)?,
            self.upper.checked_sub(other.lower)?,
        ))
    }

    /// Bound of `self * other`, `None` if it may overflow.
    pub fn mul(&self, other: &IntBound) -> Option<IntBound> {
        let products = [
            self.lower.checked_mul(other.lower)?,
            self.lower.checked_mul(other.upper)?,
            self.upper.checked_mul(other.lower)?,
            self.upper.checked_mul(other.upper)?,
        ];
        let lower = products.iter().copied().min()?;
        let upper = products.iter().copied().max()?;
        Some(IntBound::new(lower, upper))
    }

    /// Bound of `self & other`.
    pub fn and(&self, other: &IntBound) -> IntBound {
        match (self.known_nonneg(), other.known_nonneg()) {
            (true, true) => IntBound::new(0, self.upper.min(other.upper)),
            (true, false) => IntBound::new(0, self.upper),
            (false, true) => IntBound::new(0, other.upper),
            (false, false) => IntBound::unbounded(),
        }
    }

    /// Bound of `self % other` (truncating), for a known positive divisor.
    pub fn modulo(&self, other: &IntBound) -> IntBound {
        if other.lower <= 0 {
            return IntBound::unbounded();
        }
        let max = other.upper - 1;
        if self.known_nonneg() {
            IntBound::new(0, max.min(self.upper))
        } else {
            IntBound::new(-max, max)
        }
    }

    /// Bound of `self >> other` for a non-negative `self` and shift.
    pub fn rshift(&self, other: &IntBound) -> IntBound {
        if self.known_nonneg() && other.known_nonneg() {
            let shift = other.lower.min(63) as u32;
            IntBound::new(0, self.upper >> shift)
        } else {
            IntBound::unbounded()
        }
    }
}

impl fmt::Display for IntBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: i64| match v {
            i64::MIN => "-inf".to_string(),
            i64::MAX => "inf".to_string(),
            v => v.to_string(),
        };
        write!(f, "[{}, {}]", show(self.lower), show(self.upper))
    }
}
