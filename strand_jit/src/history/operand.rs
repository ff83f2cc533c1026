//! Trace operands: boxes (SSA variables) and constants.

use std::fmt;

use strand_core::{Kind, Value};

// =============================================================================
// BoxRef
// =============================================================================

/// A trace variable. Ids are unique within one trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoxRef {
    /// Unique id within the owning trace.
    pub id: u32,
    /// Slot shape.
    pub kind: Kind,
}

impl BoxRef {
    /// Create a box reference.
    #[inline]
    pub const fn new(id: u32, kind: Kind) -> Self {
        Self { id, kind }
    }
}

impl fmt::Display for BoxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.id)
    }
}

// =============================================================================
// Operand
// =============================================================================

/// An argument of a recorded operation.
///
/// A `Const` with value `v` is interchangeable with any box the optimizer
/// has proven to always hold `v`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    /// Variable.
    Box(BoxRef),
    /// Immutable constant.
    Const(Value),
}

impl Operand {
    /// Integer constant.
    #[inline]
    pub const fn int(value: i64) -> Self {
        Operand::Const(Value::Int(value))
    }

    /// Slot shape.
    #[inline]
    pub const fn kind(&self) -> Kind {
        match self {
            Operand::Box(b) => b.kind,
            Operand::Const(v) => v.kind(),
        }
    }

    /// The box, if this is one.
    #[inline]
    pub const fn as_box(&self) -> Option<BoxRef> {
        match self {
            Operand::Box(b) => Some(*b),
            Operand::Const(_) => None,
        }
    }

    /// The constant, if this is one.
    #[inline]
    pub const fn as_const(&self) -> Option<Value> {
        match self {
            Operand::Const(v) => Some(*v),
            Operand::Box(_) => None,
        }
    }

    /// Constant integer payload.
    #[inline]
    pub const fn const_int(&self) -> Option<i64> {
        match self {
            Operand::Const(Value::Int(i)) => Some(*i),
            _ => None,
        }
    }

    /// Whether this is a constant.
    #[inline]
    pub const fn is_const(&self) -> bool {
        matches!(self, Operand::Const(_))
    }

    /// Whether this is the constant `value`.
    #[inline]
    pub fn is_const_value(&self, value: Value) -> bool {
        matches!(self, Operand::Const(v) if *v == value)
    }
}

impl From<BoxRef> for Operand {
    fn from(b: BoxRef) -> Self {
        Operand::Box(b)
    }
}

impl From<Value> for Operand {
    fn from(v: Value) -> Self {
        Operand::Const(v)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Box(b) => write!(f, "{}", b),
            Operand::Const(v) => write!(f, "{}", v),
        }
    }
}

// =============================================================================
// BoxAllocator
// =============================================================================

/// Hands out fresh box ids for one trace.
#[derive(Debug, Clone, Default)]
pub struct BoxAllocator {
    next: u32,
}

impl BoxAllocator {
    /// Start allocating at id 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start allocating after the given id.
    pub fn starting_after(id: u32) -> Self {
        Self { next: id + 1 }
    }

    /// A fresh box of the given kind.
    #[inline]
    pub fn fresh(&mut self, kind: Kind) -> BoxRef {
        let id = self.next;
        self.next += 1;
        BoxRef::new(id, kind)
    }

    /// Number of ids handed out so far.
    #[inline]
    pub fn allocated(&self) -> u32 {
        self.next
    }

    /// Make sure future ids are above `id`.
    pub fn reserve_past(&mut self, id: u32) {
        if self.next <= id {
            self.next = id + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_boxes_are_distinct() {
        let mut boxes = BoxAllocator::new();
        let a = boxes.fresh(Kind::Int);
        let b = boxes.fresh(Kind::Ref);
        assert_ne!(a.id, b.id);
        assert_eq!(a.to_string(), "i0");
        assert_eq!(b.to_string(), "p1");
    }

    #[test]
    fn test_reserve_past() {
        let mut boxes = BoxAllocator::new();
        boxes.reserve_past(9);
        assert_eq!(boxes.fresh(Kind::Float).id, 10);
        boxes.reserve_past(3);
        assert_eq!(boxes.fresh(Kind::Float).id, 11);
    }

    #[test]
    fn test_operand_accessors() {
        let c = Operand::int(5);
        assert_eq!(c.const_int(), Some(5));
        assert!(c.is_const_value(Value::int(5)));
        let b = Operand::Box(BoxRef::new(2, Kind::Int));
        assert_eq!(b.as_box().map(|b| b.id), Some(2));
        assert_eq!(b.const_int(), None);
    }
}
