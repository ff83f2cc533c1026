//! Recorded operations and the declarative opcode table.
//!
//! Every opcode is declared once in [`opcodes!`] with its textual name,
//! arity, result shape and flags. Optimizer passes and the reference
//! backend dispatch with a plain `match` on [`Opcode`]; the table answers
//! every structural question (is it a guard, is it pure, ...).

use std::fmt;

use smallvec::SmallVec;
use strand_core::Kind;

use super::descr::Descr;
use super::operand::{BoxRef, Operand};

// =============================================================================
// Flags
// =============================================================================

/// Structural properties of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpFlags(u16);

impl OpFlags {
    /// No flags.
    pub const NONE: OpFlags = OpFlags(0);
    /// Guard: checks an assumption, may exit the trace.
    pub const GUARD: OpFlags = OpFlags(1 << 0);
    /// Result depends only on the arguments; no side effects.
    pub const PURE: OpFlags = OpFlags(1 << 1);
    /// No side effects, but may read the heap.
    pub const NOSIDEEFFECT: OpFlags = OpFlags(1 << 2);
    /// Overflow-checked arithmetic, followed by an overflow guard.
    pub const OVF: OpFlags = OpFlags(1 << 3);
    /// A call.
    pub const CALL: OpFlags = OpFlags(1 << 4);
    /// Terminates a trace.
    pub const FINAL: OpFlags = OpFlags(1 << 5);
    /// Integer or pointer comparison.
    pub const COMPARISON: OpFlags = OpFlags(1 << 6);
    /// Arguments may be swapped.
    pub const COMMUTATIVE: OpFlags = OpFlags(1 << 7);

    /// Union of two flag sets.
    #[inline]
    pub const fn union(self, other: OpFlags) -> OpFlags {
        OpFlags(self.0 | other.0)
    }

    /// Whether all bits of `other` are set.
    #[inline]
    pub const fn contains(self, other: OpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Result shape of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    /// No result.
    Void,
    /// Integer result.
    Int,
    /// Reference result.
    Ref,
    /// Float result.
    Float,
    /// Given by the descr (field, array item or call result).
    Descr,
    /// Same shape as the first argument.
    SameAsArg,
}

const PURE: OpFlags = OpFlags::PURE;
const PURE_CMP: OpFlags = OpFlags::PURE.union(OpFlags::COMPARISON);
const PURE_COMM: OpFlags = OpFlags::PURE.union(OpFlags::COMMUTATIVE);
const PURE_CMP_COMM: OpFlags = PURE_CMP.union(OpFlags::COMMUTATIVE);
const NOSE: OpFlags = OpFlags::NOSIDEEFFECT;
const GUARD: OpFlags = OpFlags::GUARD;
const CALL: OpFlags = OpFlags::CALL;
const FINAL: OpFlags = OpFlags::FINAL;
const NONE: OpFlags = OpFlags::NONE;

// =============================================================================
// Opcode table
// =============================================================================

macro_rules! opcodes {
    ($( $variant:ident => $name:literal, $arity:expr, $result:ident, $flags:expr; )*) => {
        /// Operation codes of recorded traces.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Opcode {
            $(
                #[doc = concat!("`", $name, "`")]
                $variant,
            )*
        }

        impl Opcode {
            /// Every opcode, in declaration order.
            pub const ALL: &'static [Opcode] = &[$(Opcode::$variant,)*];

            /// Textual name, as printed in traces.
            #[inline]
            pub const fn name(self) -> &'static str {
                match self {
                    $(Opcode::$variant => $name,)*
                }
            }

            /// Fixed arity, or `None` for variadic opcodes.
            #[inline]
            pub const fn arity(self) -> Option<usize> {
                match self {
                    $(Opcode::$variant => $arity,)*
                }
            }

            /// Result shape.
            #[inline]
            pub const fn result_kind(self) -> ResultKind {
                match self {
                    $(Opcode::$variant => ResultKind::$result,)*
                }
            }

            /// Structural flags.
            #[inline]
            pub const fn flags(self) -> OpFlags {
                match self {
                    $(Opcode::$variant => $flags,)*
                }
            }
        }
    };
}

opcodes! {
    // control
    Label => "label", None, Void, NONE;
    Jump => "jump", None, Void, FINAL;
    Finish => "finish", None, Void, FINAL;

    // guards
    GuardTrue => "guard_true", Some(1), Void, GUARD;
    GuardFalse => "guard_false", Some(1), Void, GUARD;
    GuardValue => "guard_value", Some(2), Void, GUARD;
    GuardClass => "guard_class", Some(2), Void, GUARD;
    GuardNonnull => "guard_nonnull", Some(1), Void, GUARD;
    GuardIsnull => "guard_isnull", Some(1), Void, GUARD;
    GuardNonnullClass => "guard_nonnull_class", Some(2), Void, GUARD;
    GuardNoException => "guard_no_exception", Some(0), Void, GUARD;
    GuardNoOverflow => "guard_no_overflow", Some(0), Void, GUARD;
    GuardOverflow => "guard_overflow", Some(0), Void, GUARD;
    GuardNotInvalidated => "guard_not_invalidated", Some(0), Void, GUARD;

    // integer arithmetic
    IntAdd => "int_add", Some(2), Int, PURE_COMM;
    IntSub => "int_sub", Some(2), Int, PURE;
    IntMul => "int_mul", Some(2), Int, PURE_COMM;
    IntFloorDiv => "int_floordiv", Some(2), Int, PURE;
    IntMod => "int_mod", Some(2), Int, PURE;
    IntAnd => "int_and", Some(2), Int, PURE_COMM;
    IntOr => "int_or", Some(2), Int, PURE_COMM;
    IntXor => "int_xor", Some(2), Int, PURE_COMM;
    IntLshift => "int_lshift", Some(2), Int, PURE;
    IntRshift => "int_rshift", Some(2), Int, PURE;
    UintRshift => "uint_rshift", Some(2), Int, PURE;
    IntNeg => "int_neg", Some(1), Int, PURE;
    IntInvert => "int_invert", Some(1), Int, PURE;
    IntIsTrue => "int_is_true", Some(1), Int, PURE;
    IntIsZero => "int_is_zero", Some(1), Int, PURE;

    // integer comparisons
    IntLt => "int_lt", Some(2), Int, PURE_CMP;
    IntLe => "int_le", Some(2), Int, PURE_CMP;
    IntEq => "int_eq", Some(2), Int, PURE_CMP_COMM;
    IntNe => "int_ne", Some(2), Int, PURE_CMP_COMM;
    IntGt => "int_gt", Some(2), Int, PURE_CMP;
    IntGe => "int_ge", Some(2), Int, PURE_CMP;
    UintLt => "uint_lt", Some(2), Int, PURE_CMP;
    UintGe => "uint_ge", Some(2), Int, PURE_CMP;

    // overflow-checked arithmetic
    IntAddOvf => "int_add_ovf", Some(2), Int, OpFlags::OVF;
    IntSubOvf => "int_sub_ovf", Some(2), Int, OpFlags::OVF;
    IntMulOvf => "int_mul_ovf", Some(2), Int, OpFlags::OVF;

    // floats
    FloatAdd => "float_add", Some(2), Float, PURE_COMM;
    FloatSub => "float_sub", Some(2), Float, PURE;
    FloatMul => "float_mul", Some(2), Float, PURE_COMM;
    FloatTrueDiv => "float_truediv", Some(2), Float, PURE;
    FloatNeg => "float_neg", Some(1), Float, PURE;
    FloatAbs => "float_abs", Some(1), Float, PURE;
    FloatLt => "float_lt", Some(2), Int, PURE;
    FloatLe => "float_le", Some(2), Int, PURE;
    FloatEq => "float_eq", Some(2), Int, PURE;
    FloatNe => "float_ne", Some(2), Int, PURE;
    FloatGt => "float_gt", Some(2), Int, PURE;
    FloatGe => "float_ge", Some(2), Int, PURE;
    CastFloatToInt => "cast_float_to_int", Some(1), Int, PURE;
    CastIntToFloat => "cast_int_to_float", Some(1), Float, PURE;

    // pointers
    PtrEq => "ptr_eq", Some(2), Int, PURE_CMP_COMM;
    PtrNe => "ptr_ne", Some(2), Int, PURE_CMP_COMM;
    InstancePtrEq => "instance_ptr_eq", Some(2), Int, PURE_CMP_COMM;
    InstancePtrNe => "instance_ptr_ne", Some(2), Int, PURE_CMP_COMM;
    CastPtrToInt => "cast_ptr_to_int", Some(1), Int, PURE;
    CastIntToPtr => "cast_int_to_ptr", Some(1), Ref, PURE;
    SameAs => "same_as", Some(1), SameAsArg, PURE;

    // allocation and heap access
    New => "new", Some(0), Ref, NOSE;
    NewWithVtable => "new_with_vtable", Some(0), Ref, NOSE;
    NewArray => "new_array", Some(1), Ref, NOSE;
    GetfieldGc => "getfield_gc", Some(1), Descr, NOSE;
    GetfieldGcPure => "getfield_gc_pure", Some(1), Descr, NOSE;
    SetfieldGc => "setfield_gc", Some(2), Void, NONE;
    GetarrayitemGc => "getarrayitem_gc", Some(2), Descr, NOSE;
    SetarrayitemGc => "setarrayitem_gc", Some(3), Void, NONE;
    ArraylenGc => "arraylen_gc", Some(1), Int, NOSE;

    // calls: args[0] is the function
    Call => "call", None, Descr, CALL;
    CallPure => "call_pure", None, Descr, CALL;
    CallLoopinvariant => "call_loopinvariant", None, Descr, CALL;
    CallAssembler => "call_assembler", None, Descr, CALL;
}

impl Opcode {
    /// Whether this is a guard.
    #[inline]
    pub const fn is_guard(self) -> bool {
        self.flags().contains(OpFlags::GUARD)
    }

    /// Result depends only on the arguments and the op has no side effect.
    #[inline]
    pub const fn is_always_pure(self) -> bool {
        self.flags().contains(OpFlags::PURE)
    }

    /// The op may be removed when its result is unused.
    #[inline]
    pub const fn has_no_side_effect(self) -> bool {
        self.is_always_pure() || self.flags().contains(OpFlags::NOSIDEEFFECT)
    }

    /// Overflow-checked arithmetic.
    #[inline]
    pub const fn is_ovf(self) -> bool {
        self.flags().contains(OpFlags::OVF)
    }

    /// Any kind of call.
    #[inline]
    pub const fn is_call(self) -> bool {
        self.flags().contains(OpFlags::CALL)
    }

    /// `jump` or `finish`.
    #[inline]
    pub const fn is_final(self) -> bool {
        self.flags().contains(OpFlags::FINAL)
    }

    /// Integer or pointer comparison.
    #[inline]
    pub const fn is_comparison(self) -> bool {
        self.flags().contains(OpFlags::COMPARISON)
    }

    /// Arguments may be swapped without changing the result.
    #[inline]
    pub const fn is_commutative(self) -> bool {
        self.flags().contains(OpFlags::COMMUTATIVE)
    }

    /// Guards that establish something about a reference.
    #[inline]
    pub const fn is_ref_guard(self) -> bool {
        matches!(
            self,
            Opcode::GuardNonnull
                | Opcode::GuardIsnull
                | Opcode::GuardClass
                | Opcode::GuardNonnullClass
                | Opcode::GuardValue
        )
    }

    /// The non-checking variant of an overflow op.
    pub const fn without_ovf(self) -> Opcode {
        match self {
            Opcode::IntAddOvf => Opcode::IntAdd,
            Opcode::IntSubOvf => Opcode::IntSub,
            Opcode::IntMulOvf => Opcode::IntMul,
            other => other,
        }
    }

    /// `a op b` == `b op' a`.
    pub const fn swapped_comparison(self) -> Opcode {
        match self {
            Opcode::IntLt => Opcode::IntGt,
            Opcode::IntLe => Opcode::IntGe,
            Opcode::IntGt => Opcode::IntLt,
            Opcode::IntGe => Opcode::IntLe,
            other => other,
        }
    }

    /// `!(a op b)` == `a op' b`.
    pub const fn negated_comparison(self) -> Option<Opcode> {
        match self {
            Opcode::IntLt => Some(Opcode::IntGe),
            Opcode::IntLe => Some(Opcode::IntGt),
            Opcode::IntGt => Some(Opcode::IntLe),
            Opcode::IntGe => Some(Opcode::IntLt),
            Opcode::IntEq => Some(Opcode::IntNe),
            Opcode::IntNe => Some(Opcode::IntEq),
            _ => None,
        }
    }

    /// Look an opcode up by its textual name.
    pub fn from_name(name: &str) -> Option<Opcode> {
        Opcode::ALL.iter().copied().find(|op| op.name() == name)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// ResOp
// =============================================================================

/// Argument list of an operation.
pub type Args = SmallVec<[Operand; 3]>;

/// One recorded operation.
#[derive(Debug, Clone)]
pub struct ResOp {
    /// Operation code.
    pub opcode: Opcode,
    /// Ordered arguments.
    pub args: Args,
    /// Result box, if the op produces a value.
    pub result: Option<BoxRef>,
    /// Field, array, size, call, guard or jump-target descriptor.
    pub descr: Option<Descr>,
    /// Boxes a guard hands to the resume machinery, after optimization.
    pub fail_args: Option<Vec<Operand>>,
}

impl ResOp {
    /// Create an operation.
    pub fn new(opcode: Opcode, args: &[Operand], result: Option<BoxRef>, descr: Option<Descr>) -> Self {
        debug_assert!(
            opcode.arity().map_or(true, |n| n == args.len()),
            "{} expects {:?} args, got {}",
            opcode.name(),
            opcode.arity(),
            args.len()
        );
        Self {
            opcode,
            args: args.iter().copied().collect(),
            result,
            descr,
            fail_args: None,
        }
    }

    /// Argument `i`.
    #[inline]
    pub fn arg(&self, i: usize) -> Operand {
        self.args[i]
    }

    /// Number of arguments.
    #[inline]
    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    /// Whether this is a guard.
    #[inline]
    pub fn is_guard(&self) -> bool {
        self.opcode.is_guard()
    }

    /// Same op with a different opcode and arguments, keeping descr and result.
    pub fn copy_and_change(&self, opcode: Opcode, args: &[Operand]) -> ResOp {
        ResOp {
            opcode,
            args: args.iter().copied().collect(),
            result: self.result,
            descr: self.descr.clone(),
            fail_args: self.fail_args.clone(),
        }
    }

    /// Result shape this op would have with the given descr.
    pub fn result_kind_for(opcode: Opcode, args: &[Operand], descr: Option<&Descr>) -> Option<Kind> {
        match opcode.result_kind() {
            ResultKind::Void => None,
            ResultKind::Int => Some(Kind::Int),
            ResultKind::Ref => Some(Kind::Ref),
            ResultKind::Float => Some(Kind::Float),
            ResultKind::SameAsArg => args.first().map(Operand::kind),
            ResultKind::Descr => descr.and_then(Descr::result_kind),
        }
    }
}

impl fmt::Display for ResOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(result) = self.result {
            write!(f, "{} = ", result)?;
        }
        write!(f, "{}(", self.opcode.name())?;
        let mut first = true;
        for arg in &self.args {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{}", arg)?;
        }
        if let Some(descr) = self.descr.as_ref().filter(|d| d.is_printable()) {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "descr={}", descr)?;
        }
        f.write_str(")")?;
        if let Some(fail_args) = &self.fail_args {
            f.write_str(" [")?;
            for (i, arg) in fail_args.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", arg)?;
            }
            f.write_str("]")?;
        }
        Ok(())
    }
}
