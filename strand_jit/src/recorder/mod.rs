//! The trace recorder.
//!
//! While a jit cell is tracing, the interpreter executes normally and
//! mirrors every operation into a [`TraceRecorder`]. The recorder keeps a
//! shadow of the interpreter's registers (one [`RecordingFrame`] per
//! inlined call), so it can attach a full resume snapshot to every guard.
//!
//! ```text
//!   interpreter op ──► record(opcode, args) ──► ResOp + fresh box
//!   condition      ──► guard(opcode, args)  ──► ResOp + Snapshot(frames)
//!   call           ──► push_frame / pop_frame (inlining)
//!   merge point    ──► close_loop / jump_to_token
//!   return         ──► finish
//! ```

pub mod frame;
pub mod symbolic;

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use strand_core::{GcRef, JitError, JitResult, Kind, Value};

use crate::compile::GuardDescr;
use crate::config::JitParams;
use crate::history::{
    eval_pure, BoxAllocator, BoxRef, CallDescr, CallKey, Descr, Opcode, Operand, ResOp, TargetId, Trace,
};
use crate::memmgr::TokenId;
use crate::resume::{decode, CodeId, Snapshot};
use crate::runtime::{AssumptionId, DriverId};
use crate::warmstate::{EntryKind, GreenKey};

pub use frame::RecordingFrame;
pub use symbolic::SymbolicMaterializer;

/// What is being recorded.
#[derive(Debug, Clone)]
pub enum TraceKind {
    /// A loop or function entry starting at a green key.
    Loop {
        /// Key the trace starts at.
        greenkey: GreenKey,
        /// Loop header or function entry.
        entry: EntryKind,
    },
    /// A bridge starting at a failing guard.
    Bridge {
        /// The guard.
        guard: Arc<GuardDescr>,
    },
}

/// Records one trace.
#[derive(Debug)]
pub struct TraceRecorder {
    kind: TraceKind,
    driver: DriverId,
    epoch: u64,
    trace_limit: usize,
    max_inline_depth: usize,
    boxes: BoxAllocator,
    inputargs: Vec<BoxRef>,
    ops: Vec<ResOp>,
    frames: Vec<RecordingFrame>,
    call_pure_results: FxHashMap<CallKey, Value>,
    const_classes: FxHashMap<GcRef, GcRef>,
    assumptions: Vec<AssumptionId>,
    inlined_sizes: FxHashMap<CodeId, usize>,
    visited: FxHashSet<GreenKey>,
}

impl TraceRecorder {
    /// Recorder for a trace starting at a merge point. Every register of
    /// the frame becomes an input box.
    #[allow(clippy::too_many_arguments)]
    pub fn for_loop(
        driver: DriverId,
        epoch: u64,
        params: &JitParams,
        greenkey: GreenKey,
        entry: EntryKind,
        code: CodeId,
        pc: u32,
        registers: &[Value],
    ) -> Self {
        let mut boxes = BoxAllocator::new();
        let inputargs: Vec<BoxRef> = registers.iter().map(|v| boxes.fresh(v.kind())).collect();
        let frame = RecordingFrame::new(code, pc, inputargs.iter().map(|b| Operand::Box(*b)).collect());
        let mut visited = FxHashSet::default();
        visited.insert(greenkey.clone());
        Self {
            kind: TraceKind::Loop { greenkey, entry },
            driver,
            epoch,
            trace_limit: params.trace_limit,
            max_inline_depth: params.max_inline_depth,
            boxes,
            inputargs,
            ops: Vec::new(),
            frames: vec![frame],
            call_pure_results: FxHashMap::default(),
            const_classes: FxHashMap::default(),
            assumptions: Vec::new(),
            inlined_sizes: FxHashMap::default(),
            visited,
        }
    }

    /// Recorder for a bridge from `guard`. The input boxes are the guard's
    /// fail args; the frames are rebuilt from its resume data.
    pub fn for_bridge(driver: DriverId, epoch: u64, params: &JitParams, guard: Arc<GuardDescr>) -> JitResult<Self> {
        let mut boxes = BoxAllocator::new();
        let inputargs: Vec<BoxRef> = guard.fail_kinds().iter().map(|k| boxes.fresh(*k)).collect();
        let mut ops = Vec::new();
        let decoded = {
            let mut target = SymbolicMaterializer::new(&inputargs, &mut ops, &mut boxes);
            decode(guard.resume(), &mut target)
        };
        if ops.len() > params.trace_limit {
            return Err(JitError::TraceTooLong {
                limit: params.trace_limit,
            });
        }
        let frames: Vec<RecordingFrame> = decoded
            .frames
            .into_iter()
            .map(|f| RecordingFrame::new(f.code, f.pc, f.slots))
            .collect();
        if frames.is_empty() {
            return Err(JitError::Unsupported(format!("guard {} has no frames", guard.id())));
        }
        Ok(Self {
            kind: TraceKind::Bridge { guard },
            driver,
            epoch,
            trace_limit: params.trace_limit,
            max_inline_depth: params.max_inline_depth,
            boxes,
            inputargs,
            ops,
            frames,
            call_pure_results: FxHashMap::default(),
            const_classes: FxHashMap::default(),
            assumptions: Vec::new(),
            inlined_sizes: FxHashMap::default(),
            visited: FxHashSet::default(),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// What is being recorded.
    #[inline]
    pub fn kind(&self) -> &TraceKind {
        &self.kind
    }

    /// Driver the trace belongs to.
    #[inline]
    pub fn driver(&self) -> DriverId {
        self.driver
    }

    /// Runtime epoch when recording started.
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Green key a loop trace started at.
    pub fn start_key(&self) -> Option<&GreenKey> {
        match &self.kind {
            TraceKind::Loop { greenkey, .. } => Some(greenkey),
            TraceKind::Bridge { .. } => None,
        }
    }

    /// Whether this is a bridge.
    #[inline]
    pub fn is_bridge(&self) -> bool {
        matches!(self.kind, TraceKind::Bridge { .. })
    }

    /// Number of live frames (1 = the frame tracing started in).
    #[inline]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Whether one more frame may be inlined.
    #[inline]
    pub fn can_inline_deeper(&self) -> bool {
        self.frames.len() <= self.max_inline_depth
    }

    /// Frames, outermost first.
    #[inline]
    pub fn frames(&self) -> &[RecordingFrame] {
        &self.frames
    }

    /// Innermost frame.
    #[inline]
    pub fn frame(&self) -> &RecordingFrame {
        &self.frames[self.frames.len() - 1]
    }

    /// Innermost frame, mutably.
    #[inline]
    pub fn frame_mut(&mut self) -> &mut RecordingFrame {
        let top = self.frames.len() - 1;
        &mut self.frames[top]
    }

    /// Operand of a register of the innermost frame.
    #[inline]
    pub fn get(&self, reg: usize) -> Operand {
        self.frame().get(reg)
    }

    /// Set a register of the innermost frame.
    #[inline]
    pub fn set(&mut self, reg: usize, op: Operand) {
        self.frame_mut().set(reg, op);
    }

    /// Input boxes.
    #[inline]
    pub fn inputargs(&self) -> &[BoxRef] {
        &self.inputargs
    }

    /// Operations recorded so far.
    #[inline]
    pub fn ops(&self) -> &[ResOp] {
        &self.ops
    }

    /// Number of operations recorded so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether nothing has been recorded.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Assumptions the trace depends on.
    #[inline]
    pub fn assumptions(&self) -> &[AssumptionId] {
        &self.assumptions
    }

    // =========================================================================
    // Recording
    // =========================================================================

    fn push(&mut self, op: ResOp) -> JitResult<()> {
        if self.ops.len() >= self.trace_limit {
            return Err(JitError::TraceTooLong {
                limit: self.trace_limit,
            });
        }
        self.ops.push(op);
        Ok(())
    }

    /// Record an operation. Pure operations on constants are folded on
    /// the spot and return the constant.
    pub fn record(&mut self, opcode: Opcode, args: &[Operand], descr: Option<Descr>) -> JitResult<Option<Operand>> {
        debug_assert!(!opcode.is_guard() && !opcode.is_final(), "use guard() / close the trace");
        if opcode.is_always_pure() && args.iter().all(Operand::is_const) {
            let values: Vec<Value> = args.iter().filter_map(Operand::as_const).collect();
            if let Some(value) = eval_pure(opcode, &values) {
                return Ok(Some(Operand::Const(value)));
            }
        }
        let result = ResOp::result_kind_for(opcode, args, descr.as_ref()).map(|k| self.boxes.fresh(k));
        self.push(ResOp::new(opcode, args, result, descr))?;
        Ok(result.map(Operand::Box))
    }

    /// Record an operation that must produce a value.
    pub fn record_value(&mut self, opcode: Opcode, args: &[Operand], descr: Option<Descr>) -> JitResult<Operand> {
        self.record(opcode, args, descr)?
            .ok_or_else(|| JitError::Unsupported(format!("{} has no result", opcode)))
    }

    /// Snapshot of all frames; the innermost resumes at `resume_pc`.
    pub fn snapshot(&self, resume_pc: u32) -> Snapshot {
        let last = self.frames.len() - 1;
        Snapshot {
            frames: self
                .frames
                .iter()
                .enumerate()
                .map(|(i, f)| f.snapshot(if i == last { resume_pc } else { f.pc }))
                .collect(),
            vable: Vec::new(),
        }
    }

    /// Record a guard. On failure the interpreter resumes at `resume_pc`
    /// of the innermost frame.
    pub fn guard(&mut self, opcode: Opcode, args: &[Operand], resume_pc: u32) -> JitResult<()> {
        debug_assert!(opcode.is_guard());
        let snapshot = self.snapshot(resume_pc);
        self.push(ResOp::new(opcode, args, None, Some(Descr::Snapshot(Arc::new(snapshot)))))
    }

    /// Promote `op`, whose current value is `value`, to a constant:
    /// record `guard_value` and use the constant from now on.
    pub fn promote(&mut self, op: Operand, value: Value, resume_pc: u32) -> JitResult<Operand> {
        let Operand::Box(b) = op else {
            return Ok(op);
        };
        let constant = Operand::Const(value);
        self.guard(Opcode::GuardValue, &[op, constant], resume_pc)?;
        for frame in &mut self.frames {
            frame.replace(b, constant);
        }
        Ok(constant)
    }

    /// Remember the class of an object that may appear as a constant.
    pub fn note_class(&mut self, obj: GcRef, class: GcRef) {
        if !obj.is_null() && !class.is_null() {
            self.const_classes.insert(obj, class);
        }
    }

    /// Record a residual call. `result` is the value the call returned
    /// while recording; a call that can raise is followed by
    /// `guard_no_exception` resuming at `resume_pc`.
    pub fn record_call(
        &mut self,
        descr: &Arc<CallDescr>,
        func: Operand,
        args: &[Operand],
        result: Option<Value>,
        resume_pc: u32,
    ) -> JitResult<Option<Operand>> {
        let effect = &descr.effect;
        let opcode = if effect.elidable {
            Opcode::CallPure
        } else if effect.loopinvariant {
            Opcode::CallLoopinvariant
        } else {
            Opcode::Call
        };
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(func);
        full.extend_from_slice(args);
        if opcode == Opcode::CallPure && full.iter().all(Operand::is_const) {
            if let Some(value) = result {
                let key: CallKey = full.iter().filter_map(Operand::as_const).collect();
                self.call_pure_results.insert(key, value);
            }
        }
        let out = self.record(opcode, &full, Some(Descr::Call(descr.clone())))?;
        if effect.can_raise {
            self.guard(Opcode::GuardNoException, &[], resume_pc)?;
        }
        Ok(out)
    }

    /// Record a call into the compiled code of `token`. The function
    /// constant identifies `code` for resume purposes.
    pub fn record_call_assembler(
        &mut self,
        token: TokenId,
        code: CodeId,
        args: &[Operand],
        result_kind: Option<Kind>,
    ) -> JitResult<Option<Operand>> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(Operand::int(i64::from(code)));
        full.extend_from_slice(args);
        let result = result_kind.map(|k| self.boxes.fresh(k));
        self.push(ResOp::new(Opcode::CallAssembler, &full, result, Some(Descr::Token(token))))?;
        Ok(result.map(Operand::Box))
    }

    /// The trace relies on `assumption`. The first dependency records
    /// `guard_not_invalidated`.
    pub fn depend_on(&mut self, assumption: AssumptionId, resume_pc: u32) -> JitResult<()> {
        if self.assumptions.contains(&assumption) {
            return Ok(());
        }
        if self.assumptions.is_empty() {
            self.guard(Opcode::GuardNotInvalidated, &[], resume_pc)?;
        }
        self.assumptions.push(assumption);
        Ok(())
    }

    // =========================================================================
    // Inlining
    // =========================================================================

    /// Enter an inlined call. The caller resumes at `call_pc`.
    pub fn push_frame(&mut self, code: CodeId, call_pc: u32, registers: Vec<Operand>) {
        self.frame_mut().pc = call_pc;
        let mut frame = RecordingFrame::new(code, 0, registers);
        frame.start_len = self.ops.len();
        self.frames.push(frame);
    }

    /// Leave an inlined call. The outermost frame is never popped.
    pub fn pop_frame(&mut self) -> Option<RecordingFrame> {
        if self.frames.len() <= 1 {
            return None;
        }
        let frame = self.frames.pop()?;
        *self.inlined_sizes.entry(frame.code).or_insert(0) += self.ops.len() - frame.start_len;
        Some(frame)
    }

    /// The inlined code object that contributed the most operations,
    /// counting frames that are still open.
    pub fn biggest_inlined(&self) -> Option<CodeId> {
        let mut sizes = self.inlined_sizes.clone();
        for frame in self.frames.iter().skip(1) {
            *sizes.entry(frame.code).or_insert(0) += self.ops.len() - frame.start_len;
        }
        sizes
            .into_iter()
            .max_by_key(|(code, size)| (*size, std::cmp::Reverse(*code)))
            .map(|(code, _)| code)
    }

    /// Note a merge point passed at depth 1; false when it was seen before.
    pub fn visit_merge_point(&mut self, greens: &[Value]) -> bool {
        self.visited.insert(greens.iter().copied().collect())
    }

    // =========================================================================
    // Closing
    // =========================================================================

    fn take_trace(&mut self) -> Trace {
        let mut trace = Trace::new(
            self.inputargs.clone(),
            std::mem::take(&mut self.ops),
            self.boxes.clone(),
        );
        trace.call_pure_results = std::mem::take(&mut self.call_pure_results);
        trace.const_classes = std::mem::take(&mut self.const_classes);
        trace
    }

    /// Close a loop trace back at its start: `jump` to its own label with
    /// the current registers.
    pub fn close_loop(&mut self) -> JitResult<Trace> {
        if self.is_bridge() {
            return Err(JitError::InvalidLoop("a bridge cannot close a loop".into()));
        }
        if self.frames.len() != 1 {
            return Err(JitError::InvalidLoop("loop closed inside an inlined frame".into()));
        }
        let args = self.frames[0].registers.clone();
        let kinds_match = args.len() == self.inputargs.len()
            && args.iter().zip(&self.inputargs).all(|(a, b)| a.kind() == b.kind);
        if !kinds_match {
            return Err(JitError::InvalidLoop("register shapes changed around the loop".into()));
        }
        self.push(ResOp::new(Opcode::Jump, &args, None, Some(Descr::Target(TargetId::ENTRY))))?;
        Ok(self.take_trace())
    }

    /// End the trace with a jump into the compiled code of `token`.
    pub fn jump_to_token(&mut self, token: TokenId, args: &[Operand]) -> JitResult<Trace> {
        self.push(ResOp::new(Opcode::Jump, args, None, Some(Descr::Token(token))))?;
        Ok(self.take_trace())
    }

    /// End the trace by returning `result` from the outermost frame.
    pub fn finish(&mut self, result: Option<Operand>) -> JitResult<Trace> {
        let args: Vec<Operand> = result.into_iter().collect();
        self.push(ResOp::new(Opcode::Finish, &args, None, None))?;
        Ok(self.take_trace())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{DescrTable, EffectInfo};
    use crate::resume::{ResumeData, ResumeFrame, Tagged};
    use smallvec::smallvec;

    fn params(limit: usize) -> JitParams {
        JitParams {
            trace_limit: limit,
            ..JitParams::for_testing()
        }
    }

    fn recorder(limit: usize, registers: &[Value]) -> TraceRecorder {
        TraceRecorder::for_loop(
            DriverId(0),
            0,
            &params(limit),
            smallvec![Value::int(1), Value::int(0)],
            EntryKind::Loop,
            1,
            0,
            registers,
        )
    }

    #[test]
    fn test_inputs_and_close_loop() {
        let mut rec = recorder(100, &[Value::int(0), Value::int(10)]);
        let i = rec.get(0);
        let next = rec.record_value(Opcode::IntAdd, &[i, Operand::int(1)], None).unwrap();
        rec.set(0, next);
        let cond = rec.record_value(Opcode::IntLt, &[next, rec.get(1)], None).unwrap();
        rec.guard(Opcode::GuardTrue, &[cond], 3).unwrap();
        let trace = rec.close_loop().unwrap();
        assert!(trace.is_loop());
        assert_eq!(trace.len(), 4);
        assert!(trace.check_consistency().is_ok());
        assert_eq!(trace.ops[3].args.as_slice(), &[next, Operand::Box(trace.inputargs[1])]);
    }

    #[test]
    fn test_pure_ops_on_constants_fold() {
        let mut rec = recorder(100, &[Value::int(0)]);
        let folded = rec.record_value(Opcode::IntMul, &[Operand::int(6), Operand::int(7)], None).unwrap();
        assert_eq!(folded, Operand::int(42));
        assert!(rec.is_empty());
    }

    #[test]
    fn test_trace_limit_is_inclusive() {
        let mut rec = recorder(3, &[Value::int(0)]);
        let i = rec.get(0);
        let a = rec.record_value(Opcode::IntAdd, &[i, Operand::int(1)], None).unwrap();
        let b = rec.record_value(Opcode::IntAdd, &[a, Operand::int(1)], None).unwrap();
        rec.set(0, b);
        assert!(rec.close_loop().is_ok());

        let mut rec = recorder(3, &[Value::int(0)]);
        let i = rec.get(0);
        let a = rec.record_value(Opcode::IntAdd, &[i, Operand::int(1)], None).unwrap();
        let b = rec.record_value(Opcode::IntAdd, &[a, Operand::int(1)], None).unwrap();
        let c = rec.record_value(Opcode::IntAdd, &[b, Operand::int(1)], None).unwrap();
        rec.set(0, c);
        assert_eq!(rec.close_loop().unwrap_err(), JitError::TraceTooLong { limit: 3 });
    }

    #[test]
    fn test_promote_replaces_box_everywhere() {
        let mut rec = recorder(100, &[Value::int(7), Value::int(7)]);
        let x = rec.get(0);
        rec.set(1, x);
        let c = rec.promote(x, Value::int(7), 0).unwrap();
        assert_eq!(c, Operand::int(7));
        assert_eq!(rec.get(0), Operand::int(7));
        assert_eq!(rec.get(1), Operand::int(7));
        assert_eq!(rec.ops()[0].opcode, Opcode::GuardValue);
        let z = rec.record_value(Opcode::IntAdd, &[c, Operand::int(1)], None).unwrap();
        assert_eq!(z, Operand::int(8));
    }

    #[test]
    fn test_noted_classes_reach_the_trace() {
        let mut rec = recorder(100, &[Value::reference(GcRef(0x100))]);
        let p = rec.get(0);
        rec.note_class(GcRef(0x100), GcRef(0x40));
        rec.note_class(GcRef::NULL, GcRef(0x40));
        let c = rec.promote(p, Value::reference(GcRef(0x100)), 0).unwrap();
        let trace = rec.finish(Some(c)).unwrap();
        assert_eq!(trace.const_classes.len(), 1);
        assert_eq!(trace.const_classes.get(&GcRef(0x100)), Some(&GcRef(0x40)));
    }

    #[test]
    fn test_snapshot_of_inlined_frames() {
        let mut rec = recorder(100, &[Value::int(1)]);
        let arg = rec.get(0);
        rec.push_frame(2, 5, vec![arg, Operand::int(0)]);
        rec.guard(Opcode::GuardTrue, &[arg], 9).unwrap();
        let Some(Descr::Snapshot(snapshot)) = &rec.ops()[0].descr else {
            panic!("guard without snapshot");
        };
        assert_eq!(snapshot.frames.len(), 2);
        assert_eq!((snapshot.frames[0].code, snapshot.frames[0].pc), (1, 5));
        assert_eq!((snapshot.frames[1].code, snapshot.frames[1].pc), (2, 9));
        assert!(rec.pop_frame().is_some());
        assert!(rec.pop_frame().is_none());
    }

    #[test]
    fn test_biggest_inlined_frame() {
        let mut rec = recorder(100, &[Value::int(1)]);
        let x = rec.get(0);
        rec.push_frame(2, 0, vec![x]);
        rec.record(Opcode::IntAdd, &[x, Operand::int(1)], None).unwrap();
        rec.pop_frame();
        rec.push_frame(3, 1, vec![x]);
        for _ in 0..3 {
            rec.record(Opcode::IntAdd, &[x, Operand::int(1)], None).unwrap();
        }
        assert_eq!(rec.biggest_inlined(), Some(3));
    }

    #[test]
    fn test_pure_call_results_recorded() {
        let mut table = DescrTable::new();
        let descr = table.call("hash", &[Kind::Int], Some(Kind::Int), EffectInfo::elidable());
        let mut rec = recorder(100, &[Value::int(1)]);
        let out = rec
            .record_call(&descr, Operand::int(99), &[Operand::int(4)], Some(Value::int(16)), 1)
            .unwrap();
        assert!(out.is_some());
        assert_eq!(rec.ops()[0].opcode, Opcode::CallPure);
        let trace = rec.finish(out).unwrap();
        let key: CallKey = smallvec![Value::int(99), Value::int(4)];
        assert_eq!(trace.call_pure_results.get(&key), Some(&Value::int(16)));
    }

    #[test]
    fn test_single_guard_not_invalidated() {
        let mut rec = recorder(100, &[Value::int(1)]);
        rec.depend_on(AssumptionId(1), 0).unwrap();
        rec.depend_on(AssumptionId(2), 0).unwrap();
        rec.depend_on(AssumptionId(1), 0).unwrap();
        assert_eq!(rec.len(), 1);
        assert_eq!(rec.assumptions(), &[AssumptionId(1), AssumptionId(2)]);
    }

    #[test]
    fn test_merge_point_revisit() {
        let mut rec = recorder(100, &[Value::int(1)]);
        assert!(!rec.visit_merge_point(&[Value::int(1), Value::int(0)]));
        assert!(rec.visit_merge_point(&[Value::int(1), Value::int(8)]));
        assert!(!rec.visit_merge_point(&[Value::int(1), Value::int(8)]));
    }

    #[test]
    fn test_bridge_rebuilds_frames_and_virtuals() {
        let mut table = DescrTable::new();
        let size = table.size("Pair", None, 1);
        let field = table.field("Pair.a", Kind::Int, 0);
        let data = ResumeData {
            frames: vec![ResumeFrame {
                code: 4,
                pc: 7,
                slots: vec![Tagged::boxed(0).unwrap(), Tagged::virtual_at(0).unwrap()],
            }],
            vable: Vec::new(),
            consts: Vec::new(),
            virtuals: vec![crate::resume::VirtualRecipe::Struct {
                size,
                fields: vec![(field, Tagged::boxed(0).unwrap())],
            }],
            num_failargs: 1,
        };
        let guard = Arc::new(GuardDescr::guard(
            1,
            TokenId(1),
            Opcode::GuardTrue,
            Arc::new(data),
            vec![Kind::Int],
            None,
        ));
        let rec = TraceRecorder::for_bridge(DriverId(0), 0, &params(100), guard).unwrap();
        assert!(rec.is_bridge());
        assert_eq!(rec.inputargs().len(), 1);
        assert_eq!(rec.frame().pc, 7);
        assert_eq!(rec.get(0), Operand::Box(rec.inputargs()[0]));
        let opcodes: Vec<Opcode> = rec.ops().iter().map(|op| op.opcode).collect();
        assert_eq!(opcodes, vec![Opcode::New, Opcode::SetfieldGc]);
        assert_eq!(Some(rec.get(1)), rec.ops()[0].result.map(Operand::Box));
    }
}
