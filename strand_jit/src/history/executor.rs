//! Evaluation of side-effect-free operations on concrete values.
//!
//! Shared by constant folding in the optimizer and by the reference
//! backend, so that a folded constant is always exactly what executing the
//! op would have produced.

use strand_core::{GcRef, Value};

use super::resoperation::Opcode;

#[inline]
fn int(v: Value) -> Option<i64> {
    v.as_int()
}

#[inline]
fn float(v: Value) -> Option<f64> {
    v.as_float()
}

#[inline]
fn reference(v: Value) -> Option<GcRef> {
    v.as_ref()
}

#[inline]
fn shift_amount(v: i64) -> Option<u32> {
    if (0..64).contains(&v) {
        Some(v as u32)
    } else {
        None
    }
}

/// Evaluate an always-pure op. Returns `None` when the op is not pure,
/// the argument shapes do not match, or the op would trap (division by
/// zero, out-of-range shift).
pub fn eval_pure(opcode: Opcode, args: &[Value]) -> Option<Value> {
    use Opcode::*;
    let binop_int = |f: fn(i64, i64) -> Option<i64>| -> Option<Value> {
        Some(Value::Int(f(int(args[0])?, int(args[1])?)?))
    };
    let cmp_int = |f: fn(i64, i64) -> bool| -> Option<Value> {
        Some(Value::bool(f(int(args[0])?, int(args[1])?)))
    };
    let binop_float = |f: fn(f64, f64) -> f64| -> Option<Value> {
        Some(Value::float(f(float(args[0])?, float(args[1])?)))
    };
    let cmp_float = |f: fn(f64, f64) -> bool| -> Option<Value> {
        Some(Value::bool(f(float(args[0])?, float(args[1])?)))
    };
    match opcode {
        IntAdd => binop_int(|a, b| Some(a.wrapping_add(b))),
        IntSub => binop_int(|a, b| Some(a.wrapping_sub(b))),
        IntMul => binop_int(|a, b| Some(a.wrapping_mul(b))),
        IntFloorDiv => binop_int(|a, b| a.checked_div(b)),
        IntMod => binop_int(|a, b| a.checked_rem(b)),
        IntAnd => binop_int(|a, b| Some(a & b)),
        IntOr => binop_int(|a, b| Some(a | b)),
        IntXor => binop_int(|a, b| Some(a ^ b)),
        IntLshift => binop_int(|a, b| Some(a.wrapping_shl(shift_amount(b)?))),
        IntRshift => binop_int(|a, b| Some(a >> shift_amount(b)?)),
        UintRshift => binop_int(|a, b| Some(((a as u64) >> shift_amount(b)?) as i64)),
        IntNeg => Some(Value::Int(int(args[0])?.wrapping_neg())),
        IntInvert => Some(Value::Int(!int(args[0])?)),
        IntIsTrue => Some(Value::bool(int(args[0])? != 0)),
        IntIsZero => Some(Value::bool(int(args[0])? == 0)),

        IntLt => cmp_int(|a, b| a < b),
        IntLe => cmp_int(|a, b| a <= b),
        IntEq => cmp_int(|a, b| a == b),
        IntNe => cmp_int(|a, b| a != b),
        IntGt => cmp_int(|a, b| a > b),
        IntGe => cmp_int(|a, b| a >= b),
        UintLt => cmp_int(|a, b| (a as u64) < (b as u64)),
        UintGe => cmp_int(|a, b| (a as u64) >= (b as u64)),

        FloatAdd => binop_float(|a, b| a + b),
        FloatSub => binop_float(|a, b| a - b),
        FloatMul => binop_float(|a, b| a * b),
        FloatTrueDiv => binop_float(|a, b| a / b),
        FloatNeg => Some(Value::float(-float(args[0])?)),
        FloatAbs => Some(Value::float(float(args[0])?.abs())),
        FloatLt => cmp_float(|a, b| a < b),
        FloatLe => cmp_float(|a, b| a <= b),
        FloatEq => cmp_float(|a, b| a == b),
        FloatNe => cmp_float(|a, b| a != b),
        FloatGt => cmp_float(|a, b| a > b),
        FloatGe => cmp_float(|a, b| a >= b),
        CastFloatToInt => Some(Value::Int(float(args[0])? as i64)),
        CastIntToFloat => Some(Value::float(int(args[0])? as f64)),

        PtrEq | InstancePtrEq => Some(Value::bool(reference(args[0])? == reference(args[1])?)),
        PtrNe | InstancePtrNe => Some(Value::bool(reference(args[0])? != reference(args[1])?)),
        CastPtrToInt => Some(Value::Int(reference(args[0])?.0 as i64)),
        CastIntToPtr => Some(Value::Ref(GcRef(int(args[0])? as usize))),
        SameAs => Some(args[0]),
        _ => None,
    }
}

/// Evaluate an overflow-checked op; `None` on overflow.
pub fn eval_ovf(opcode: Opcode, a: i64, b: i64) -> Option<i64> {
    match opcode {
        Opcode::IntAddOvf => a.checked_add(b),
        Opcode::IntSubOvf => a.checked_sub(b),
        Opcode::IntMulOvf => a.checked_mul(b),
        _ => None,
    }
}
