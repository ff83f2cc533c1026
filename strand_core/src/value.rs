//! Three-slot value model shared by the recorder, the optimizer and backends.
//!
//! Every value crossing the JIT boundary is one of three shapes:
//!
//! | Kind    | Payload                   | Trace prefix |
//! |---------|---------------------------|--------------|
//! | `Int`   | signed machine integer    | `i`          |
//! | `Ref`   | opaque GC reference       | `p`          |
//! | `Float` | raw 64-bit float storage  | `f`          |
//!
//! Floats travel as [`FloatStorage`] (raw bits) so that values hash and
//! compare bitwise, and so a long-long and a double share the same slot
//! shape on hosts where that matters.

use std::fmt;

// =============================================================================
// Kind
// =============================================================================

/// The slot shape of a value or of a trace operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    /// Signed integer.
    Int,
    /// Pointer to a GC-managed object (opaque).
    Ref,
    /// Float storage.
    Float,
}

impl Kind {
    /// Single-letter prefix used when printing boxes of this kind.
    #[inline]
    pub const fn prefix(self) -> char {
        match self {
            Kind::Int => 'i',
            Kind::Ref => 'p',
            Kind::Float => 'f',
        }
    }

    /// Stable small index, usable for per-kind tables.
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Kind::Int => 0,
            Kind::Ref => 1,
            Kind::Float => 2,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Int => "int",
            Kind::Ref => "ref",
            Kind::Float => "float",
        };
        f.write_str(name)
    }
}

// =============================================================================
// GcRef / FloatStorage
// =============================================================================

/// Opaque reference to a GC object. Address `0` is the null reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct GcRef(pub usize);

impl GcRef {
    /// The null reference.
    pub const NULL: GcRef = GcRef(0);

    /// Whether this is the null reference.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for GcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("NULL")
        } else {
            write!(f, "{:#x}", self.0)
        }
    }
}

/// Raw storage of a 64-bit float.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct FloatStorage(pub u64);

impl FloatStorage {
    /// Store a float.
    #[inline]
    pub fn from_f64(value: f64) -> Self {
        FloatStorage(value.to_bits())
    }

    /// Read the float back.
    #[inline]
    pub fn to_f64(self) -> f64 {
        f64::from_bits(self.0)
    }
}

// =============================================================================
// Value
// =============================================================================

/// A concrete value in one of the three slot shapes.
///
/// Equality and hashing are bitwise (a NaN equals itself), which is what
/// constant folding and guard comparisons need.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    /// Signed integer.
    Int(i64),
    /// GC reference.
    Ref(GcRef),
    /// Float storage.
    Float(FloatStorage),
}

impl Value {
    /// The null reference value.
    pub const NULL: Value = Value::Ref(GcRef::NULL);

    /// Integer constructor.
    #[inline]
    #[must_use]
    pub const fn int(value: i64) -> Self {
        Value::Int(value)
    }

    /// Float constructor.
    #[inline]
    #[must_use]
    pub fn float(value: f64) -> Self {
        Value::Float(FloatStorage::from_f64(value))
    }

    /// Reference constructor.
    #[inline]
    #[must_use]
    pub const fn reference(r: GcRef) -> Self {
        Value::Ref(r)
    }

    /// Boolean encoded as integer 0 / 1.
    #[inline]
    #[must_use]
    pub const fn bool(b: bool) -> Self {
        Value::Int(b as i64)
    }

    /// The zero value of a kind: `0`, `NULL` or `0.0`.
    #[inline]
    #[must_use]
    pub const fn zero_of(kind: Kind) -> Self {
        match kind {
            Kind::Int => Value::Int(0),
            Kind::Ref => Value::NULL,
            Kind::Float => Value::Float(FloatStorage(0)),
        }
    }

    /// Slot shape of this value.
    #[inline]
    pub const fn kind(&self) -> Kind {
        match self {
            Value::Int(_) => Kind::Int,
            Value::Ref(_) => Kind::Ref,
            Value::Float(_) => Kind::Float,
        }
    }

    /// Integer payload, if this is an integer.
    #[inline]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Reference payload, if this is a reference.
    #[inline]
    pub const fn as_ref(&self) -> Option<GcRef> {
        match self {
            Value::Ref(r) => Some(*r),
            _ => None,
        }
    }

    /// Float payload, if this is a float.
    #[inline]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(f.to_f64()),
            _ => None,
        }
    }

    /// Integer payload, treating references as addresses and floats as
    /// their raw bits. Used where a guard or a counter needs one word.
    #[inline]
    pub fn as_word(&self) -> i64 {
        match self {
            Value::Int(i) => *i,
            Value::Ref(r) => r.0 as i64,
            Value::Float(f) => f.0 as i64,
        }
    }

    /// Truthiness: non-zero integer, non-null reference, non-zero float.
    #[inline]
    pub fn is_true(&self) -> bool {
        match self {
            Value::Int(i) => *i != 0,
            Value::Ref(r) => !r.is_null(),
            Value::Float(f) => f.to_f64() != 0.0,
        }
    }

    /// Whether this is the null reference.
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Ref(r) if r.is_null())
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Int(0)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<GcRef> for Value {
    fn from(value: GcRef) -> Self {
        Value::Ref(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::float(value)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "Value({})", i),
            Value::Ref(r) => write!(f, "Value(ref@{})", r),
            Value::Float(fl) => write!(f, "Value({:?})", fl.to_f64()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Ref(r) => write!(f, "ConstPtr({})", r),
            Value::Float(fl) => {
                let v = fl.to_f64();
                if v.fract() == 0.0 && v.is_finite() {
                    write!(f, "{:.1}", v)
                } else {
                    write!(f, "{}", v)
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
