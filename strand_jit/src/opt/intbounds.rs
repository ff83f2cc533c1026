//! Integer bounds propagation.
//!
//! Every integer result gets an interval computed from its operands.
//! Comparisons whose outcome the intervals decide are folded; guards on
//! a comparison narrow the compared operands; overflow-checking ops that
//! provably cannot overflow lose their check.

use rustc_hash::FxHashMap;
use strand_core::{JitError, JitResult, Kind, Value};

use super::intbound::IntBound;
use super::{Optimizer, Pending, Stage};
use crate::history::{Opcode, Operand, ResOp};

/// State of the bounds stage.
#[derive(Debug, Default)]
pub struct IntBoundsState {
    /// Comparison that produced each boolean box.
    comparisons: FxHashMap<u32, (Opcode, Operand, Operand)>,
}

fn is_int_comparison(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::IntLt
            | Opcode::IntLe
            | Opcode::IntGt
            | Opcode::IntGe
            | Opcode::IntEq
            | Opcode::IntNe
            | Opcode::UintLt
            | Opcode::UintGe
    )
}

/// Outcome of `a op b` if the bounds decide it.
fn decide(opcode: Opcode, a: &IntBound, b: &IntBound) -> Option<bool> {
    match opcode {
        Opcode::IntLt if a.known_lt(b) => Some(true),
        Opcode::IntLt if a.known_ge(b) => Some(false),
        Opcode::IntLe if a.known_le(b) => Some(true),
        Opcode::IntLe if a.known_gt(b) => Some(false),
        Opcode::IntGt if a.known_gt(b) => Some(true),
        Opcode::IntGt if a.known_le(b) => Some(false),
        Opcode::IntGe if a.known_ge(b) => Some(true),
        Opcode::IntGe if a.known_lt(b) => Some(false),
        Opcode::IntEq | Opcode::IntNe => {
            let equal = match (a.constant(), b.constant()) {
                (Some(x), Some(y)) if x == y => Some(true),
                _ if a.disjoint(b) => Some(false),
                _ => None,
            };
            equal.map(|eq| eq == (opcode == Opcode::IntEq))
        }
        Opcode::UintLt if a.known_nonneg() && b.known_nonneg() => decide(Opcode::IntLt, a, b),
        Opcode::UintGe if a.known_nonneg() && b.known_nonneg() => decide(Opcode::IntGe, a, b),
        _ => None,
    }
}

impl Optimizer<'_> {
    pub(crate) fn intbounds(&mut self, op: ResOp) -> JitResult<()> {
        match op.opcode {
            Opcode::GuardTrue | Opcode::GuardFalse => return self.bounds_guard(op),
            Opcode::IntAddOvf | Opcode::IntSubOvf | Opcode::IntMulOvf => return self.bounds_ovf(op),
            opcode if is_int_comparison(opcode) => {
                let (a, b) = (op.arg(0), op.arg(1));
                let Some(result) = op.result else {
                    return self.next(Stage::IntBounds, op);
                };
                if let Some(outcome) = decide(opcode, &self.state.bound(a), &self.state.bound(b)) {
                    self.state.make_constant(result, Value::bool(outcome));
                    return Ok(());
                }
                self.next(Stage::IntBounds, op)?;
                self.ib.comparisons.insert(result.id, (opcode, a, b));
                self.state.narrow(Operand::Box(result), &IntBound::boolean());
                return Ok(());
            }
            _ => {}
        }

        let result = op.result.filter(|r| r.kind == Kind::Int);
        let bound = self.result_bound(&op);
        self.next(Stage::IntBounds, op)?;
        if let (Some(result), Some(bound)) = (result, bound) {
            self.narrow_to(Operand::Box(result), &bound);
        }
        Ok(())
    }

    fn result_bound(&self, op: &ResOp) -> Option<IntBound> {
        let arg = |i: usize| self.state.bound(op.arg(i));
        let bound = match op.opcode {
            Opcode::IntAdd => arg(0).add(&arg(1))?,
            Opcode::IntSub => arg(0).sub(&arg(1))?,
            Opcode::IntMul => arg(0).mul(&arg(1))?,
            Opcode::IntAnd => arg(0).and(&arg(1)),
            Opcode::IntMod => arg(0).modulo(&arg(1)),
            Opcode::IntRshift => arg(0).rshift(&arg(1)),
            Opcode::UintRshift => match op.arg(1).const_int() {
                Some(shift @ 1..=63) => IntBound::new(0, i64::MAX >> (shift - 1)),
                _ => return None,
            },
            Opcode::IntFloorDiv => {
                let (a, b) = (arg(0), arg(1));
                if a.known_nonneg() && b.lower > 0 {
                    IntBound::new(0, a.upper / b.lower)
                } else {
                    return None;
                }
            }
            Opcode::IntNeg => {
                let a = arg(0);
                IntBound::new(a.upper.checked_neg()?, a.lower.checked_neg()?)
            }
            Opcode::ArraylenGc => IntBound::nonneg(),
            Opcode::IntIsTrue
            | Opcode::IntIsZero
            | Opcode::FloatLt
            | Opcode::FloatLe
            | Opcode::FloatEq
            | Opcode::FloatNe
            | Opcode::FloatGt
            | Opcode::FloatGe
            | Opcode::PtrEq
            | Opcode::PtrNe
            | Opcode::InstancePtrEq
            | Opcode::InstancePtrNe => IntBound::boolean(),
            _ => return None,
        };
        Some(bound)
    }

    /// Narrow an operand; a box left with one possible value becomes
    /// that constant.
    fn narrow_to(&mut self, op: Operand, bound: &IntBound) {
        let narrowed = self.state.narrow(op, bound);
        if let (Some(value), Operand::Box(b)) = (narrowed.constant(), self.state.get(op)) {
            self.state.make_constant(b, Value::int(value));
        }
    }

    fn bounds_guard(&mut self, op: ResOp) -> JitResult<()> {
        let expect = op.opcode == Opcode::GuardTrue;
        let x = op.arg(0);
        let bound = self.state.bound(x);
        let known = if bound.known_nonzero() {
            Some(true)
        } else if bound.constant() == Some(0) {
            Some(false)
        } else {
            None
        };
        match known {
            Some(v) if v == expect => return Ok(()),
            Some(_) => return Err(JitError::InvalidLoop("guard contradicts integer bounds".into())),
            None => {}
        }

        self.next(Stage::IntBounds, op)?;

        if let Operand::Box(b) = x {
            if let Some(&(cmp, lhs, rhs)) = self.ib.comparisons.get(&b.id) {
                let cmp = if expect { Some(cmp) } else { cmp.negated_comparison() };
                if let Some(cmp) = cmp {
                    self.narrow_comparison(cmp, lhs, rhs);
                }
            }
            if !expect {
                self.narrow_to(x, &IntBound::exact(0));
            }
        }
        Ok(())
    }

    fn narrow_comparison(&mut self, cmp: Opcode, a: Operand, b: Operand) {
        let (ba, bb) = (self.state.bound(a), self.state.bound(b));
        let (mut na, mut nb) = (ba, bb);
        match cmp {
            Opcode::IntLt => {
                na.make_lt(&bb);
                nb.make_gt(&ba);
            }
            Opcode::IntLe => {
                na.make_le(&bb);
                nb.make_ge(&ba);
            }
            Opcode::IntGt => {
                na.make_gt(&bb);
                nb.make_lt(&ba);
            }
            Opcode::IntGe => {
                na.make_ge(&bb);
                nb.make_le(&ba);
            }
            Opcode::IntEq => {
                na.intersect(&bb);
                nb.intersect(&ba);
            }
            _ => return,
        }
        self.narrow_to(a, &na);
        self.narrow_to(b, &nb);
    }

    fn bounds_ovf(&mut self, op: ResOp) -> JitResult<()> {
        let (a, b) = (self.state.bound(op.arg(0)), self.state.bound(op.arg(1)));
        let proven = match op.opcode {
            Opcode::IntAddOvf => a.add(&b),
            Opcode::IntSubOvf => a.sub(&b),
            _ => a.mul(&b),
        };
        let Some(bound) = proven else {
            return self.next(Stage::IntBounds, op);
        };
        let plain = op.copy_and_change(op.opcode.without_ovf(), &op.args);
        let result = op.result;
        self.pending = Pending::NoOverflow;
        self.next(Stage::IntBounds, plain)?;
        if let Some(result) = result {
            self.narrow_to(Operand::Box(result), &bound);
        }
        Ok(())
    }
}
