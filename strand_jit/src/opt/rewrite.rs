//! Peephole rewriting.
//!
//! Constant folding, algebraic identities, common subexpression
//! elimination of pure operations, guard strengthening and elimination,
//! and folding of pure calls whose result was seen while tracing.
//!
//! CSE keys are `(opcode, canonical args, descr)`; commutative ops are
//! looked up with both argument orders. Some ops also register the
//! inverse they make trivial (`a + b = r` gives `r - b = a`).

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use strand_core::{JitError, JitResult, Value};

use super::{Optimizer, Pending, Stage};
use crate::history::{eval_ovf, eval_pure, ArrayDescr, Descr, DescrKey, OopSpec, Opcode, Operand, ResOp};

/// CSE key of a pure operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PureKey {
    /// Operation.
    pub opcode: Opcode,
    /// Canonical arguments.
    pub args: SmallVec<[Operand; 3]>,
    /// Descr identity.
    pub descr: Option<DescrKey>,
}

impl PureKey {
    fn of(op: &ResOp) -> Self {
        Self {
            opcode: op.opcode,
            args: op.args.clone(),
            descr: op.descr.as_ref().map(Descr::key),
        }
    }

    fn derived(opcode: Opcode, args: &[Operand]) -> Self {
        Self {
            opcode,
            args: args.iter().copied().collect(),
            descr: None,
        }
    }
}

/// A known result of a pure operation.
#[derive(Debug, Clone)]
pub struct CseEntry {
    /// The operand holding the result.
    pub result: Operand,
    /// Descr of the operation.
    pub descr: Option<Descr>,
    /// The operation itself is in the output, as opposed to an inverse
    /// or a call folded into a plain call.
    pub emitted: bool,
}

/// State of the rewrite stage.
#[derive(Debug, Default)]
pub struct RewriteState {
    pure: FxHashMap<PureKey, CseEntry>,
    loopinvariant: FxHashMap<PureKey, Operand>,
    bools: FxHashSet<u32>,
    seen_not_invalidated: bool,
}

impl RewriteState {
    /// Pure operations whose result is available.
    pub fn entries(&self) -> impl Iterator<Item = (&PureKey, &CseEntry)> {
        self.pure.iter()
    }

    /// Make a result known without emitting anything.
    pub fn seed(&mut self, key: PureKey, result: Operand, descr: Option<Descr>) {
        self.pure.insert(
            key,
            CseEntry {
                result,
                descr,
                emitted: false,
            },
        );
    }

    fn insert(&mut self, key: PureKey, result: Operand, descr: Option<Descr>, emitted: bool) {
        self.pure.entry(key).or_insert(CseEntry {
            result,
            descr,
            emitted,
        });
    }
}

/// Outcome of an algebraic identity.
enum Simplified {
    /// The result is this operand.
    To(Operand),
    /// The result is computed by this cheaper operation.
    Op(ResOp),
}

fn power_of_two(op: Operand) -> Option<i64> {
    match op.const_int() {
        Some(v) if v > 1 && v & (v - 1) == 0 => Some(i64::from(v.trailing_zeros())),
        _ => None,
    }
}

fn is_float(op: Operand, value: f64) -> bool {
    matches!(op.as_const().and_then(|v| v.as_float()), Some(f) if f == value)
}

fn produces_bool(opcode: Opcode) -> bool {
    opcode.is_comparison()
        || matches!(
            opcode,
            Opcode::IntIsTrue
                | Opcode::IntIsZero
                | Opcode::FloatLt
                | Opcode::FloatLe
                | Opcode::FloatEq
                | Opcode::FloatNe
                | Opcode::FloatGt
                | Opcode::FloatGe
        )
}

fn invalid(what: &str) -> JitError {
    JitError::InvalidLoop(what.to_string())
}

impl Optimizer<'_> {
    pub(crate) fn rewrite(&mut self, op: ResOp) -> JitResult<()> {
        let opcode = op.opcode;

        if opcode.is_always_pure() {
            if let (Some(result), Some(values)) = (op.result, const_args(&op)) {
                if let Some(value) = eval_pure(opcode, &values) {
                    self.state.make_constant(result, value);
                    return Ok(());
                }
            }
        }

        match opcode {
            _ if opcode.is_guard() => return self.rewrite_guard(op),
            Opcode::IntAddOvf | Opcode::IntSubOvf | Opcode::IntMulOvf => {
                if let (Some(a), Some(b), Some(result)) = (op.arg(0).const_int(), op.arg(1).const_int(), op.result) {
                    if let Some(value) = eval_ovf(opcode, a, b) {
                        self.state.make_constant(result, Value::int(value));
                        self.pending = Pending::NoOverflow;
                        return Ok(());
                    }
                }
                return self.next(Stage::Rewrite, op);
            }
            Opcode::SameAs => {
                if let Some(result) = op.result {
                    self.state.make_equal_to(result, op.arg(0));
                    return Ok(());
                }
            }
            Opcode::CallPure => return self.rewrite_call_pure(op),
            Opcode::CallLoopinvariant => return self.rewrite_call_loopinvariant(op),
            Opcode::Call => {
                if let Some(Descr::Call(call)) = &op.descr {
                    if let OopSpec::ArrayCopy(descr) = &call.effect.oopspec {
                        if self.rewrite_arraycopy(&op, descr)? {
                            return Ok(());
                        }
                    }
                    if !call.effect.is_readonly() {
                        self.rw.seen_not_invalidated = false;
                    }
                }
                return self.next(Stage::Rewrite, op);
            }
            Opcode::CallAssembler => {
                self.rw.seen_not_invalidated = false;
                return self.next(Stage::Rewrite, op);
            }
            _ => {}
        }

        if !(opcode.is_always_pure() || opcode == Opcode::GetfieldGcPure) {
            return self.next(Stage::Rewrite, op);
        }
        let Some(result) = op.result else {
            return self.next(Stage::Rewrite, op);
        };

        match self.simplify(&op) {
            Some(Simplified::To(operand)) => {
                self.state.make_equal_to(result, operand);
                return Ok(());
            }
            Some(Simplified::Op(cheaper)) => return self.rewrite(cheaper),
            None => {}
        }
        if let Some(existing) = self.lookup_pure(&op) {
            self.state.make_equal_to(result, existing);
            return Ok(());
        }

        let key = PureKey::of(&op);
        let descr = op.descr.clone();
        let args: SmallVec<[Operand; 3]> = op.args.clone();
        if produces_bool(opcode) {
            self.rw.bools.insert(result.id);
        }
        self.next(Stage::Rewrite, op)?;

        let r = Operand::Box(result);
        self.rw.insert(key, r, descr, true);
        self.record_inverses(opcode, &args, r);
        Ok(())
    }

    fn lookup_pure(&self, op: &ResOp) -> Option<Operand> {
        let key = PureKey::of(op);
        if let Some(entry) = self.rw.pure.get(&key) {
            return Some(self.state.get(entry.result));
        }
        if op.opcode.is_commutative() && op.num_args() == 2 {
            let swapped = PureKey {
                args: [op.arg(1), op.arg(0)].into_iter().collect(),
                ..key
            };
            if let Some(entry) = self.rw.pure.get(&swapped) {
                return Some(self.state.get(entry.result));
            }
        }
        None
    }

    fn record_inverses(&mut self, opcode: Opcode, args: &[Operand], r: Operand) {
        let mut derived = |opcode: Opcode, args: &[Operand], result: Operand| {
            self.rw.insert(PureKey::derived(opcode, args), result, None, false);
        };
        match (opcode, args) {
            (Opcode::IntAdd, &[a, b]) => {
                derived(Opcode::IntSub, &[r, b], a);
                derived(Opcode::IntSub, &[r, a], b);
            }
            (Opcode::IntSub, &[a, b]) => {
                derived(Opcode::IntAdd, &[r, b], a);
                derived(Opcode::IntSub, &[a, r], b);
            }
            (Opcode::IntLt | Opcode::IntLe | Opcode::IntGt | Opcode::IntGe, &[a, b]) => {
                derived(opcode.swapped_comparison(), &[b, a], r);
            }
            (Opcode::FloatNeg | Opcode::IntNeg | Opcode::IntInvert, &[x]) => derived(opcode, &[r], x),
            (Opcode::CastIntToPtr, &[x]) => derived(Opcode::CastPtrToInt, &[r], x),
            (Opcode::CastPtrToInt, &[x]) => derived(Opcode::CastIntToPtr, &[r], x),
            (Opcode::CastIntToFloat, &[x]) => derived(Opcode::CastFloatToInt, &[r], x),
            _ => {}
        }
    }

    // =========================================================================
    // Identities
    // =========================================================================

    fn simplify(&self, op: &ResOp) -> Option<Simplified> {
        use Simplified::{Op, To};

        let a = op.arg(0);
        let b = if op.num_args() > 1 { op.arg(1) } else { a };
        let zero = Operand::int(0);
        let one = Operand::int(1);
        let same = a == b && op.num_args() == 2;

        match op.opcode {
            Opcode::IntAdd if b == zero => Some(To(a)),
            Opcode::IntAdd if a == zero => Some(To(b)),
            Opcode::IntSub if b == zero => Some(To(a)),
            Opcode::IntSub if same => Some(To(zero)),
            Opcode::IntMul if b == one => Some(To(a)),
            Opcode::IntMul if a == one => Some(To(b)),
            Opcode::IntMul if a == zero || b == zero => Some(To(zero)),
            Opcode::IntMul => match (power_of_two(b), power_of_two(a)) {
                (Some(k), _) => Some(Op(op.copy_and_change(Opcode::IntLshift, &[a, Operand::int(k)]))),
                (None, Some(k)) => Some(Op(op.copy_and_change(Opcode::IntLshift, &[b, Operand::int(k)]))),
                _ => None,
            },
            Opcode::IntFloorDiv if b == one => Some(To(a)),
            Opcode::IntFloorDiv => match power_of_two(b) {
                Some(k) if self.state.bound(a).known_nonneg() => {
                    Some(Op(op.copy_and_change(Opcode::IntRshift, &[a, Operand::int(k)])))
                }
                _ => None,
            },
            Opcode::IntAnd if a == zero || b == zero => Some(To(zero)),
            Opcode::IntAnd | Opcode::IntOr if same => Some(To(a)),
            Opcode::IntOr | Opcode::IntXor if b == zero => Some(To(a)),
            Opcode::IntOr | Opcode::IntXor if a == zero => Some(To(b)),
            Opcode::IntXor if same => Some(To(zero)),
            Opcode::IntLshift | Opcode::IntRshift | Opcode::UintRshift if b == zero => Some(To(a)),
            Opcode::FloatMul if is_float(b, 1.0) => Some(To(a)),
            Opcode::FloatMul if is_float(a, 1.0) => Some(To(b)),
            Opcode::FloatMul if is_float(b, -1.0) => Some(Op(op.copy_and_change(Opcode::FloatNeg, &[a]))),
            Opcode::FloatMul if is_float(a, -1.0) => Some(Op(op.copy_and_change(Opcode::FloatNeg, &[b]))),
            Opcode::IntIsTrue => {
                let bound = self.state.bound(a);
                if bound.known_nonzero() {
                    Some(To(one))
                } else if bound.lower >= 0 && bound.upper <= 1 {
                    Some(To(a))
                } else {
                    None
                }
            }
            Opcode::IntIsZero if self.state.bound(a).known_nonzero() => Some(To(zero)),
            Opcode::IntEq | Opcode::IntLe | Opcode::IntGe | Opcode::UintGe if same => Some(To(one)),
            Opcode::IntNe | Opcode::IntLt | Opcode::IntGt | Opcode::UintLt if same => Some(To(zero)),
            Opcode::PtrEq | Opcode::InstancePtrEq => self.pointers_equal(a, b).map(|eq| To(Operand::int(i64::from(eq)))),
            Opcode::PtrNe | Opcode::InstancePtrNe => {
                self.pointers_equal(a, b).map(|eq| To(Operand::int(i64::from(!eq))))
            }
            _ => None,
        }
    }

    fn pointers_equal(&self, a: Operand, b: Operand) -> Option<bool> {
        if a == b {
            return Some(true);
        }
        if self.state.is_virtual(a) || self.state.is_virtual(b) {
            return Some(false);
        }
        let null = Operand::Const(Value::NULL);
        if (a == null && self.state.is_nonnull(b)) || (b == null && self.state.is_nonnull(a)) {
            return Some(false);
        }
        None
    }

    // =========================================================================
    // Guards
    // =========================================================================

    fn rewrite_guard(&mut self, op: ResOp) -> JitResult<()> {
        match op.opcode {
            Opcode::GuardTrue | Opcode::GuardFalse => {
                let expect = op.opcode == Opcode::GuardTrue;
                let x = op.arg(0);
                if let Operand::Const(v) = x {
                    return if v.is_true() == expect {
                        Ok(())
                    } else {
                        Err(invalid("guard on a constant always fails"))
                    };
                }
                self.next(Stage::Rewrite, op)?;
                if let Some(b) = self.state.get(x).as_box() {
                    if !expect {
                        self.state.make_constant(b, Value::int(0));
                    } else if self.rw.bools.contains(&b.id) {
                        self.state.make_constant(b, Value::int(1));
                    }
                }
                Ok(())
            }
            Opcode::GuardValue => self.rewrite_guard_value(op),
            Opcode::GuardClass | Opcode::GuardNonnullClass => self.rewrite_guard_class(op),
            Opcode::GuardNonnull => {
                let p = op.arg(0);
                if let Operand::Const(v) = p {
                    return if v.is_null() {
                        Err(invalid("guard_nonnull on null"))
                    } else {
                        Ok(())
                    };
                }
                if self.state.is_nonnull(p) {
                    return Ok(());
                }
                self.next(Stage::Rewrite, op)?;
                if let Some(b) = self.state.get(p).as_box() {
                    self.state.info_mut(b).nonnull = true;
                }
                Ok(())
            }
            Opcode::GuardIsnull => {
                let p = op.arg(0);
                if let Operand::Const(v) = p {
                    return if v.is_null() {
                        Ok(())
                    } else {
                        Err(invalid("guard_isnull on a non-null constant"))
                    };
                }
                if self.state.is_nonnull(p) {
                    return Err(invalid("guard_isnull on a non-null reference"));
                }
                self.next(Stage::Rewrite, op)?;
                if let Some(b) = self.state.get(p).as_box() {
                    self.state.make_constant(b, Value::NULL);
                }
                Ok(())
            }
            Opcode::GuardNotInvalidated => {
                if self.rw.seen_not_invalidated {
                    return Ok(());
                }
                self.rw.seen_not_invalidated = true;
                self.next(Stage::Rewrite, op)
            }
            _ => self.next(Stage::Rewrite, op),
        }
    }

    fn rewrite_guard_value(&mut self, op: ResOp) -> JitResult<()> {
        let (x, expected) = (op.arg(0), op.arg(1));
        if x.is_const() {
            return if x == expected {
                Ok(())
            } else {
                Err(invalid("guard_value on a different constant"))
            };
        }
        let (Some(b), Some(value)) = (x.as_box(), expected.as_const()) else {
            return self.next(Stage::Rewrite, op);
        };
        match value {
            Value::Ref(r) if r.is_null() && self.state.is_nonnull(x) => {
                return Err(invalid("guard_value to null on a non-null reference"));
            }
            Value::Int(v) if !self.state.bound(x).contains(v) => {
                return Err(invalid("guard_value outside the known bounds"));
            }
            _ => {}
        }
        if self.state.is_virtual(x) {
            return Err(invalid("guard_value on a fresh allocation"));
        }
        let class = self.state.known_class(x);
        if let (Some(known), Some(actual)) = (class, self.state.known_class(expected)) {
            if known != actual {
                return Err(invalid("guard_value on an object of another class"));
            }
        }
        let earlier = self.last_guard_among(x, &[Opcode::GuardNonnull, Opcode::GuardClass, Opcode::GuardNonnullClass]);
        match earlier {
            Some(index) => self.strengthen_guard(index, Opcode::GuardValue, &[x, expected]),
            None => self.next(Stage::Rewrite, op)?,
        }
        self.state.make_constant(b, value);
        if let (Some(class), Value::Ref(r)) = (class, value) {
            self.state.set_const_class(r, class);
        }
        Ok(())
    }

    fn rewrite_guard_class(&mut self, op: ResOp) -> JitResult<()> {
        let p = op.arg(0);
        let class = op.arg(1).as_const().and_then(|v| v.as_ref());
        if matches!(p, Operand::Const(v) if v.is_null()) {
            return Err(invalid("guard_class on null"));
        }
        if let (Some(known), Some(class)) = (self.state.known_class(p), class) {
            return if known == class {
                Ok(())
            } else {
                Err(invalid("guard_class on an object of another class"))
            };
        }
        let earlier = match op.opcode {
            Opcode::GuardClass => self.last_guard_among(p, &[Opcode::GuardNonnull]),
            _ => None,
        };
        match earlier {
            Some(index) => self.strengthen_guard(index, Opcode::GuardNonnullClass, &[p, op.arg(1)]),
            None => self.next(Stage::Rewrite, op)?,
        }
        match self.state.get(p) {
            Operand::Box(b) => {
                let info = self.state.info_mut(b);
                info.nonnull = true;
                info.known_class = class;
            }
            Operand::Const(Value::Ref(r)) => {
                if let Some(class) = class {
                    self.state.set_const_class(r, class);
                }
            }
            Operand::Const(_) => {}
        }
        Ok(())
    }

    // =========================================================================
    // Calls
    // =========================================================================

    fn rewrite_call_pure(&mut self, op: ResOp) -> JitResult<()> {
        if let Some(key) = op.args.iter().map(Operand::as_const).collect::<Option<SmallVec<[Value; 4]>>>() {
            if let Some(value) = self.call_pure_result(&key) {
                if let Some(result) = op.result {
                    self.state.make_constant(result, value);
                }
                self.pending = Pending::NoException;
                return Ok(());
            }
        }
        if let (Some(result), Some(existing)) = (op.result, self.lookup_pure(&op)) {
            self.state.make_equal_to(result, existing);
            self.pending = Pending::NoException;
            return Ok(());
        }
        let key = PureKey::of(&op);
        let descr = op.descr.clone();
        let result = op.result;
        let call = op.copy_and_change(Opcode::Call, &op.args);
        self.next(Stage::Rewrite, call)?;
        if let Some(result) = result {
            self.rw.insert(key, Operand::Box(result), descr, false);
        }
        Ok(())
    }

    fn rewrite_call_loopinvariant(&mut self, op: ResOp) -> JitResult<()> {
        let key = PureKey::of(&op);
        if let (Some(result), Some(known)) = (op.result, self.rw.loopinvariant.get(&key)) {
            let known = *known;
            self.state.make_equal_to(result, known);
            self.pending = Pending::NoException;
            return Ok(());
        }
        let result = op.result;
        let call = op.copy_and_change(Opcode::Call, &op.args);
        self.next(Stage::Rewrite, call)?;
        if let Some(result) = result {
            self.rw.loopinvariant.insert(key, Operand::Box(result));
        }
        Ok(())
    }

    /// Expand a short constant-bounds array copy into item reads and
    /// writes. Args are `func, src, dst, src_start, dst_start, length`.
    fn rewrite_arraycopy(&mut self, op: &ResOp, descr: &Arc<ArrayDescr>) -> JitResult<bool> {
        if op.num_args() != 6 {
            return Ok(false);
        }
        let (src, dst) = (op.arg(1), op.arg(2));
        let (Some(src_start), Some(dst_start), Some(length)) =
            (op.arg(3).const_int(), op.arg(4).const_int(), op.arg(5).const_int())
        else {
            return Ok(false);
        };
        if !(0..=8).contains(&length) || src_start < 0 || dst_start < 0 {
            return Ok(false);
        }
        let mut values = Vec::with_capacity(length as usize);
        for i in 0..length {
            let item = self.boxes.fresh(descr.item_kind);
            self.next(
                Stage::Rewrite,
                ResOp::new(
                    Opcode::GetarrayitemGc,
                    &[src, Operand::int(src_start + i)],
                    Some(item),
                    Some(Descr::Array(descr.clone())),
                ),
            )?;
            values.push(Operand::Box(item));
        }
        for (i, value) in (0..length).zip(values) {
            self.next(
                Stage::Rewrite,
                ResOp::new(
                    Opcode::SetarrayitemGc,
                    &[dst, Operand::int(dst_start + i), value],
                    None,
                    Some(Descr::Array(descr.clone())),
                ),
            )?;
        }
        self.pending = Pending::NoException;
        Ok(true)
    }
}

fn const_args(op: &ResOp) -> Option<SmallVec<[Value; 3]>> {
    op.args.iter().map(Operand::as_const).collect()
}
