//! Linear traces and a builder for writing them by hand.

use std::fmt;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use strand_core::{GcRef, Kind, Value};

use super::descr::{Descr, TargetId};
use super::operand::{BoxAllocator, BoxRef, Operand};
use super::resoperation::{Opcode, ResOp};
use crate::resume::{FrameSnapshot, Snapshot};

/// Key of a recorded pure call: the function followed by its arguments.
pub type CallKey = SmallVec<[Value; 4]>;

// =============================================================================
// Trace
// =============================================================================

/// An ordered list of operations over a set of input boxes, terminated by
/// `jump` or `finish`.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    /// Boxes live on entry.
    pub inputargs: Vec<BoxRef>,
    /// The operations.
    pub ops: Vec<ResOp>,
    /// Allocator that produced every box of this trace.
    pub boxes: BoxAllocator,
    /// Results observed while recording `call_pure` with constant args.
    pub call_pure_results: FxHashMap<CallKey, Value>,
    /// Classes of reference constants observed while recording.
    pub const_classes: FxHashMap<GcRef, GcRef>,
}

impl Trace {
    /// Create a trace.
    pub fn new(inputargs: Vec<BoxRef>, ops: Vec<ResOp>, boxes: BoxAllocator) -> Self {
        Self {
            inputargs,
            ops,
            boxes,
            call_pure_results: FxHashMap::default(),
            const_classes: FxHashMap::default(),
        }
    }

    /// Number of operations.
    #[inline]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the trace has no operations.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of operations with the given opcode.
    pub fn count(&self, opcode: Opcode) -> usize {
        self.ops.iter().filter(|op| op.opcode == opcode).count()
    }

    /// Operations with the given opcode.
    pub fn ops_with(&self, opcode: Opcode) -> impl Iterator<Item = &ResOp> {
        self.ops.iter().filter(move |op| op.opcode == opcode)
    }

    /// Number of guards.
    pub fn num_guards(&self) -> usize {
        self.ops.iter().filter(|op| op.is_guard()).count()
    }

    /// The terminating operation.
    pub fn last_op(&self) -> Option<&ResOp> {
        self.ops.last()
    }

    /// Whether this trace loops back to its own entry label.
    pub fn is_loop(&self) -> bool {
        matches!(
            self.ops.last(),
            Some(op) if op.opcode == Opcode::Jump
                && matches!(op.descr, Some(Descr::Target(TargetId::ENTRY)))
        )
    }

    /// Verify the SSA property: every box is defined once, before its
    /// uses, and only the args of the most recent `label` (plus boxes
    /// defined after it) are visible past that label.
    pub fn check_consistency(&self) -> Result<(), String> {
        let mut ever_defined: FxHashSet<u32> = FxHashSet::default();
        let mut visible: FxHashSet<u32> = FxHashSet::default();
        for arg in &self.inputargs {
            if !ever_defined.insert(arg.id) {
                return Err(format!("input box {} listed twice", arg));
            }
            visible.insert(arg.id);
        }

        let check_use = |visible: &FxHashSet<u32>, arg: &Operand, op: &ResOp| -> Result<(), String> {
            match arg {
                Operand::Box(b) if !visible.contains(&b.id) => {
                    Err(format!("box {} used before definition in '{}'", b, op))
                }
                _ => Ok(()),
            }
        };

        for (index, op) in self.ops.iter().enumerate() {
            if let Some(arity) = op.opcode.arity() {
                if arity != op.num_args() {
                    return Err(format!("wrong arity in '{}'", op));
                }
            }
            for arg in &op.args {
                check_use(&visible, arg, op)?;
            }
            if let Some(fail_args) = &op.fail_args {
                for arg in fail_args {
                    check_use(&visible, arg, op)?;
                }
            }
            if op.opcode == Opcode::Label {
                let mut label_args = FxHashSet::default();
                for arg in &op.args {
                    match arg {
                        Operand::Box(b) => {
                            if !label_args.insert(b.id) {
                                return Err(format!("box {} twice in '{}'", b, op));
                            }
                        }
                        Operand::Const(_) => return Err(format!("constant in '{}'", op)),
                    }
                }
                visible = label_args;
            }
            if let Some(result) = op.result {
                if !ever_defined.insert(result.id) {
                    return Err(format!("box {} defined twice (op {})", result, index));
                }
                visible.insert(result.id);
            }
            if op.opcode.is_final() && index + 1 != self.ops.len() {
                return Err(format!("'{}' is not the last operation", op));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, arg) in self.inputargs.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", arg)?;
        }
        f.write_str("]\n")?;
        for op in &self.ops {
            writeln!(f, "{}", op)?;
        }
        Ok(())
    }
}

// =============================================================================
// TraceBuilder
// =============================================================================

/// Hand-written traces for tests and benchmarks.
///
/// Guards get a single-frame snapshot of the given live operands; their
/// resume pc is the index of the guard in the trace.
///
/// ```ignore
/// let mut b = TraceBuilder::new();
/// let i0 = b.input(Kind::Int);
/// let i1 = b.op(Opcode::IntAdd, &[i0, Operand::int(1)]);
/// b.guard(Opcode::GuardTrue, &[i1], &[i0]);
/// let trace = b.jump(&[i1]);
/// ```
#[derive(Debug, Default)]
pub struct TraceBuilder {
    boxes: BoxAllocator,
    inputargs: Vec<BoxRef>,
    ops: Vec<ResOp>,
    call_pure_results: FxHashMap<CallKey, Value>,
    const_classes: FxHashMap<GcRef, GcRef>,
}

impl TraceBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an input box.
    pub fn input(&mut self, kind: Kind) -> Operand {
        let b = self.boxes.fresh(kind);
        self.inputargs.push(b);
        Operand::Box(b)
    }

    /// Add an op without descr and return its result.
    ///
    /// # Panics
    /// Panics if the opcode has no result.
    pub fn op(&mut self, opcode: Opcode, args: &[Operand]) -> Operand {
        self.op_descr(opcode, args, None)
            .unwrap_or_else(|| panic!("{} has no result", opcode.name()))
    }

    /// Add an op with an optional descr; returns the result, if any.
    pub fn op_descr(&mut self, opcode: Opcode, args: &[Operand], descr: Option<Descr>) -> Option<Operand> {
        let result = ResOp::result_kind_for(opcode, args, descr.as_ref()).map(|k| self.boxes.fresh(k));
        self.ops.push(ResOp::new(opcode, args, result, descr));
        result.map(Operand::Box)
    }

    /// Add a guard whose snapshot holds `live`.
    pub fn guard(&mut self, opcode: Opcode, args: &[Operand], live: &[Operand]) {
        let snapshot = Snapshot {
            frames: vec![FrameSnapshot {
                code: 0,
                pc: self.ops.len() as u32,
                slots: live.to_vec(),
            }],
            vable: Vec::new(),
        };
        let descr = Descr::Snapshot(Arc::new(snapshot));
        self.ops.push(ResOp::new(opcode, args, None, Some(descr)));
    }

    /// Remember the result of a constant-argument pure call.
    pub fn call_pure_result(&mut self, key: &[Value], result: Value) {
        self.call_pure_results.insert(key.iter().copied().collect(), result);
    }

    /// Remember the class of a reference constant.
    pub fn const_class(&mut self, obj: GcRef, class: GcRef) {
        self.const_classes.insert(obj, class);
    }

    /// Close the trace with a jump back to its entry.
    pub fn jump(mut self, args: &[Operand]) -> Trace {
        self.ops.push(ResOp::new(Opcode::Jump, args, None, Some(Descr::Target(TargetId::ENTRY))));
        self.build()
    }

    /// Close the trace with `finish`.
    pub fn finish(mut self, args: &[Operand]) -> Trace {
        self.ops.push(ResOp::new(Opcode::Finish, args, None, None));
        self.build()
    }

    fn build(self) -> Trace {
        let mut trace = Trace::new(self.inputargs, self.ops, self.boxes);
        trace.call_pure_results = self.call_pure_results;
        trace.const_classes = self.const_classes;
        trace
    }
}
