//! The interpreter loop and its JIT hooks.
//!
//! [`Vm`] executes bytecode one instruction at a time. At every
//! `LoopHeader` and at every function entry it asks the [`JitRuntime`]
//! whether to keep interpreting, start recording or run compiled code.
//! While a recorder is active, each instruction is executed concretely
//! first and then mirrored into the recorder, so guards always see the
//! registers as they were before the instruction.
//!
//! ```text
//!   step ──► concrete result ──► record (guards resume at this pc) ──► write dst
//!     │
//!     ├─ LoopHeader ──► reached_merge_point / maybe_compile_and_run
//!     ├─ Call       ──► inline (push_frame) │ call_assembler │ residual call
//!     └─ Return     ──► pop_frame │ finish_trace
//! ```
//!
//! Guard failures rebuild interpreter frames from resume data and carry on
//! from the failing instruction, which is re-executed. Compiled code
//! calls back into the VM through [`ExecCx`] for heap access, builtins
//! and residual calls; a guest error raised there is parked in
//! `pending_error` and surfaces once control is back in the interpreter.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use strand_core::{GcRef, JitError, JitResult, Kind, Value};
use strand_jit::history::{ArrayDescr, CallDescr, FieldDescr, SizeDescr};
use strand_jit::{
    AssumptionId, CodeId, Descr, DriverId, EnterOutcome, EntryKind, ExecCx, ExitOutcome, JitDriver, JitParams,
    JitRuntime, MergeOutcome, MergePoint, Opcode, Operand, ResumedState, TokenId, TraceRecorder,
};
use tracing::{debug, trace};

use crate::bytecode::{Args, Builtin, ClassId, Code, Instr, Program, Reg};
use crate::error::{VmError, VmResult};
use crate::frame::{Frame, MAX_COMPILED_NESTING, MAX_NESTING, MAX_RECURSION_DEPTH};
use crate::heap::{Heap, HeapObject};
use crate::jit_driver::{entry_greens, loop_greens, CallTarget, VmDescrs, VmDriver};

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Global {
    value: Value,
    assumption: AssumptionId,
}

/// One interpreter loop: its frame stack and, while recording, the
/// recorder whose outermost frame lives on that stack.
struct Run {
    frames: Vec<Frame>,
    tracer: Option<Box<TraceRecorder>>,
    entering: bool,
}

impl Run {
    fn new(frames: Vec<Frame>, tracer: Option<Box<TraceRecorder>>, entering: bool) -> Self {
        Self {
            frames,
            tracer,
            entering,
        }
    }

    #[inline]
    fn reg(&self, reg: Reg) -> Value {
        self.frames.last().map_or(Value::default(), |f| f.get(reg))
    }

    #[inline]
    fn set(&mut self, reg: Reg, value: Value) {
        if let Some(frame) = self.frames.last_mut() {
            frame.set(reg, value);
        }
    }

    #[inline]
    fn advance(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.pc += 1;
        }
    }

    #[inline]
    fn goto(&mut self, target: u32) {
        if let Some(frame) = self.frames.last_mut() {
            frame.pc = target as usize;
        }
    }
}

/// A bytecode interpreter bound to a JIT runtime.
pub struct Vm {
    program: Arc<Program>,
    runtime: Arc<JitRuntime>,
    driver: DriverId,
    jit_driver: Arc<VmDriver>,
    descrs: VmDescrs,
    heap: Heap,
    class_refs: Vec<GcRef>,
    globals: Vec<Global>,
    call_targets: FxHashMap<TokenId, CodeId>,
    output: Vec<Value>,
    pending_error: Option<VmError>,
    /// Native re-entries: nested interpreter loops and compiled code.
    nesting: usize,
    /// Guest activations outside the innermost interpreter loop.
    depth: usize,
}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("codes", &self.program.codes.len())
            .field("driver", &self.driver)
            .field("objects", &self.heap.len())
            .field("runtime", &self.runtime)
            .finish()
    }
}

impl Vm {
    /// VM for `program`, registering a driver with `runtime`.
    pub fn new(program: Program, runtime: Arc<JitRuntime>) -> Self {
        let mut heap = Heap::new();
        let class_refs: Vec<GcRef> = (0..program.classes.len())
            .map(|class| heap.alloc_class(class as ClassId))
            .collect();
        let descrs = VmDescrs::new(&program, &class_refs);
        let jit_driver = Arc::new(VmDriver::new(&program));
        let driver = runtime.register_driver(jit_driver.clone());
        let globals = program
            .globals
            .iter()
            .enumerate()
            .map(|(slot, value)| Global {
                value: *value,
                assumption: runtime.register_assumption(&format!("global {}", slot)),
            })
            .collect();
        Self {
            program: Arc::new(program),
            runtime,
            driver,
            jit_driver,
            descrs,
            heap,
            class_refs,
            globals,
            call_targets: FxHashMap::default(),
            output: Vec::new(),
            pending_error: None,
            nesting: 0,
            depth: 0,
        }
    }

    /// VM on a fresh runtime with the reference backend.
    pub fn with_params(program: Program, params: JitParams) -> Self {
        Self::new(program, Arc::new(JitRuntime::with_trace_backend(params)))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The JIT runtime.
    #[inline]
    pub fn runtime(&self) -> &Arc<JitRuntime> {
        &self.runtime
    }

    /// Handle of this VM's driver.
    #[inline]
    pub fn driver(&self) -> DriverId {
        self.driver
    }

    /// This VM's driver.
    #[inline]
    pub fn jit_driver(&self) -> &Arc<VmDriver> {
        &self.jit_driver
    }

    /// The program.
    #[inline]
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// The heap.
    #[inline]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Values printed so far.
    #[inline]
    pub fn output(&self) -> &[Value] {
        &self.output
    }

    /// Current value of a global slot.
    pub fn global(&self, slot: usize) -> Option<Value> {
        self.globals.get(slot).map(|g| g.value)
    }

    /// Class object of a class.
    pub fn class_ref(&self, class: ClassId) -> Option<GcRef> {
        self.class_refs.get(class as usize).copied()
    }

    fn code(&self, id: CodeId) -> VmResult<Arc<Code>> {
        self.program.code(id).cloned().ok_or(VmError::Undefined {
            what: "code",
            index: id as usize,
        })
    }

    fn check_pending(&mut self) -> VmResult<()> {
        match self.pending_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Entry points
    // =========================================================================

    /// Call `func` with `args` and run it to completion.
    pub fn call(&mut self, func: CodeId, args: &[Value]) -> VmResult<Value> {
        self.pending_error = None;
        let result = self.invoke(func, args);
        self.pending_error = None;
        result
    }

    /// Overwrite a global slot. Compiled code that read the slot is
    /// invalidated.
    pub fn store_global(&mut self, slot: usize, value: Value) -> VmResult<()> {
        let runtime = self.runtime.clone();
        let global = self.globals.get_mut(slot).ok_or(VmError::Undefined { what: "global", index: slot })?;
        global.value = value;
        let old = std::mem::replace(&mut global.assumption, runtime.register_assumption(&format!("global {}", slot)));
        let invalidated = runtime.invalidate_assumption(old);
        if invalidated > 0 {
            debug!(slot, invalidated, "global store invalidated compiled code");
        }
        Ok(())
    }

    fn invoke(&mut self, func: CodeId, args: &[Value]) -> VmResult<Value> {
        let code = self.code(func)?;
        if args.len() != code.num_args {
            return Err(VmError::TypeError(format!(
                "{} takes {} arguments, got {}",
                code.name,
                code.num_args,
                args.len()
            )));
        }
        if self.depth >= MAX_RECURSION_DEPTH {
            return Err(VmError::RecursionLimit);
        }
        self.execute(Run::new(vec![Frame::new(code, args)], None, true))
    }

    fn execute(&mut self, mut run: Run) -> VmResult<Value> {
        if self.nesting >= MAX_NESTING {
            if let Some(rec) = run.tracer.take() {
                self.runtime
                    .abort_trace(rec, JitError::Unsupported("interpreter nested too deeply".into()));
            }
            return Err(VmError::RecursionLimit);
        }
        self.nesting += 1;
        let result = self.run_loop(&mut run);
        self.nesting -= 1;
        if let Some(rec) = run.tracer.take() {
            let reason = match &result {
                Err(err) => format!("raised while tracing: {}", err),
                Ok(_) => "traced frame left the interpreter".to_string(),
            };
            self.runtime.abort_trace(rec, JitError::Unsupported(reason));
        }
        result
    }

    fn run_loop(&mut self, run: &mut Run) -> VmResult<Value> {
        loop {
            if std::mem::take(&mut run.entering) {
                if let Some(value) = self.function_entry(run)? {
                    return Ok(value);
                }
                continue;
            }
            let (code, pc) = match run.frames.last() {
                Some(frame) => (frame.code.clone(), frame.pc),
                None => return Err(VmError::NoFrame),
            };
            let instr = code.instr(pc).ok_or(VmError::FellOff(code.id))?;
            if let Some(value) = self.step(run, &code, pc, instr)? {
                return Ok(value);
            }
        }
    }

    // =========================================================================
    // Recording helpers
    // =========================================================================

    /// Mirror an instruction into the active recorder. A recording error
    /// aborts the trace; interpretation carries on regardless.
    fn record(&mut self, run: &mut Run, f: impl FnOnce(&mut TraceRecorder, &mut VmDescrs) -> JitResult<()>) {
        let Some(rec) = run.tracer.as_mut() else {
            return;
        };
        if let Err(err) = f(rec, &mut self.descrs) {
            if let Some(rec) = run.tracer.take() {
                self.runtime.abort_trace(rec, err);
            }
        }
    }

    fn abort_tracing(&self, run: &mut Run, reason: &str) {
        if let Some(rec) = run.tracer.take() {
            self.runtime.abort_trace(rec, JitError::Unsupported(reason.to_string()));
        }
    }

    // =========================================================================
    // Interpreter step
    // =========================================================================

    fn step(&mut self, run: &mut Run, code: &Code, pc: usize, instr: &Instr) -> VmResult<Option<Value>> {
        let resume_pc = pc as u32;
        match instr {
            Instr::LoadConst { dst, value } => {
                let (dst, value) = (*dst, *value);
                self.record(run, |rec, _| {
                    rec.set(dst as usize, Operand::int(value));
                    Ok(())
                });
                run.set(dst, Value::int(value));
                run.advance();
            }
            Instr::LoadNull { dst } => {
                let dst = *dst;
                self.record(run, |rec, _| {
                    rec.set(dst as usize, Operand::Const(Value::NULL));
                    Ok(())
                });
                run.set(dst, Value::NULL);
                run.advance();
            }
            Instr::Move { dst, src } => {
                let (dst, src) = (*dst, *src);
                self.record(run, |rec, _| {
                    let op = rec.get(src as usize);
                    rec.set(dst as usize, op);
                    Ok(())
                });
                run.set(dst, run.reg(src));
                run.advance();
            }
            Instr::Add { dst, a, b } => self.arith(run, resume_pc, *dst, *a, *b, Opcode::IntAddOvf)?,
            Instr::Sub { dst, a, b } => self.arith(run, resume_pc, *dst, *a, *b, Opcode::IntSubOvf)?,
            Instr::Mul { dst, a, b } => self.arith(run, resume_pc, *dst, *a, *b, Opcode::IntMulOvf)?,
            Instr::Lt { dst, a, b } => self.compare(run, *dst, *a, *b, Opcode::IntLt)?,
            Instr::Le { dst, a, b } => self.compare(run, *dst, *a, *b, Opcode::IntLe)?,
            Instr::Eq { dst, a, b } => self.compare(run, *dst, *a, *b, Opcode::IntEq)?,
            Instr::Jump { target } => run.goto(*target),
            Instr::JumpIfFalse { cond, target } => {
                let cond = *cond;
                let value = run.reg(cond);
                let truth = value.is_true();
                self.record(run, |rec, _| {
                    let op = rec.get(cond as usize);
                    if op.is_const() {
                        return Ok(());
                    }
                    let guard = match (value.kind(), truth) {
                        (Kind::Ref, true) => Opcode::GuardNonnull,
                        (Kind::Ref, false) => Opcode::GuardIsnull,
                        (_, true) => Opcode::GuardTrue,
                        (_, false) => Opcode::GuardFalse,
                    };
                    rec.guard(guard, &[op], resume_pc)
                });
                if truth {
                    run.advance();
                } else {
                    run.goto(*target);
                }
            }
            Instr::LoopHeader => return self.loop_header(run, code.id, pc),
            Instr::New { dst, class } => {
                let dst = *dst;
                let size = self.descrs.size(*class).cloned().ok_or(VmError::Undefined {
                    what: "class",
                    index: *class as usize,
                })?;
                let obj = self.alloc_struct(&size);
                self.record(run, |rec, _| {
                    let op = rec.record_value(Opcode::NewWithVtable, &[], Some(Descr::Size(size)))?;
                    rec.set(dst as usize, op);
                    Ok(())
                });
                run.set(dst, Value::Ref(obj));
                run.advance();
            }
            Instr::GetField { dst, obj, field } => {
                let (dst, obj) = (*dst, *obj);
                let (r, class_ref, class) = self.instance(run.reg(obj), code.id, pc)?;
                let descr = self.field_descr(class, *field)?;
                let value = self.heap.field(r, descr.offset).unwrap_or(Value::zero_of(descr.kind));
                self.record(run, |rec, _| {
                    let o = rec.get(obj as usize);
                    guard_class(rec, o, class_ref, resume_pc)?;
                    let v = rec.record_value(Opcode::GetfieldGc, &[o], Some(Descr::Field(descr)))?;
                    rec.set(dst as usize, v);
                    Ok(())
                });
                run.set(dst, value);
                run.advance();
            }
            Instr::SetField { obj, field, src } => {
                let (obj, src) = (*obj, *src);
                let (r, class_ref, class) = self.instance(run.reg(obj), code.id, pc)?;
                let descr = self.field_descr(class, *field)?;
                let value = run.reg(src);
                if value.kind() != descr.kind {
                    return Err(VmError::TypeError(format!("{} holds {}, got {:?}", descr.name, descr.kind, value)));
                }
                self.record(run, |rec, _| {
                    let o = rec.get(obj as usize);
                    guard_class(rec, o, class_ref, resume_pc)?;
                    let s = rec.get(src as usize);
                    rec.record(Opcode::SetfieldGc, &[o, s], Some(Descr::Field(descr)))?;
                    Ok(())
                });
                self.heap.set_field(r, *field as usize, value);
                run.advance();
            }
            Instr::IsInstance { dst, obj, class } => {
                let (dst, obj) = (*dst, *obj);
                let target = self.class_ref(*class).ok_or(VmError::Undefined {
                    what: "class",
                    index: *class as usize,
                })?;
                let r = as_ref(run.reg(obj))?;
                let actual = (!r.is_null()).then(|| self.heap.class_of(r));
                let result = actual == Some(target);
                self.record(run, |rec, _| {
                    let o = rec.get(obj as usize);
                    if !o.is_const() {
                        match actual {
                            None => rec.guard(Opcode::GuardIsnull, &[o], resume_pc)?,
                            Some(class) => guard_class(rec, o, class, resume_pc)?,
                        }
                    }
                    rec.set(dst as usize, Operand::int(i64::from(result)));
                    Ok(())
                });
                run.set(dst, Value::bool(result));
                run.advance();
            }
            Instr::NewArray { dst, len } => {
                let (dst, len) = (*dst, *len);
                let n = as_int(run.reg(len))?;
                let size = usize::try_from(n).map_err(|_| VmError::TypeError(format!("negative array length {}", n)))?;
                let array = self.heap.alloc_array(size);
                let descr = self.descrs.int_array().clone();
                self.record(run, |rec, _| {
                    let l = rec.get(len as usize);
                    let ok = rec.record_value(Opcode::IntGe, &[l, Operand::int(0)], None)?;
                    guard_true(rec, ok, resume_pc)?;
                    let a = rec.record_value(Opcode::NewArray, &[l], Some(Descr::Array(descr)))?;
                    rec.set(dst as usize, a);
                    Ok(())
                });
                run.set(dst, Value::Ref(array));
                run.advance();
            }
            Instr::GetItem { dst, array, index } => {
                let (dst, array, index) = (*dst, *array, *index);
                let (r, i) = self.array_index(run, array, index, code.id, pc)?;
                let value = self.heap.array(r).and_then(|items| items.get(i).copied()).unwrap_or_default();
                let descr = self.descrs.int_array().clone();
                self.record(run, |rec, _| {
                    let (a, i) = guard_bounds(rec, &descr, array, index, resume_pc)?;
                    let v = rec.record_value(Opcode::GetarrayitemGc, &[a, i], Some(Descr::Array(descr)))?;
                    rec.set(dst as usize, v);
                    Ok(())
                });
                run.set(dst, value);
                run.advance();
            }
            Instr::SetItem { array, index, src } => {
                let (array, index, src) = (*array, *index, *src);
                let (r, i) = self.array_index(run, array, index, code.id, pc)?;
                let value = run.reg(src);
                as_int(value)?;
                let descr = self.descrs.int_array().clone();
                self.record(run, |rec, _| {
                    let (a, i) = guard_bounds(rec, &descr, array, index, resume_pc)?;
                    let s = rec.get(src as usize);
                    rec.record(Opcode::SetarrayitemGc, &[a, i, s], Some(Descr::Array(descr)))?;
                    Ok(())
                });
                if let Some(items) = self.heap.array_mut(r) {
                    items[i] = value;
                }
                run.advance();
            }
            Instr::ArrayLen { dst, array } => {
                let (dst, array) = (*dst, *array);
                let r = self.array_ref(run.reg(array), code.id, pc)?;
                let len = self.heap.array(r).map_or(0, <[Value]>::len);
                let descr = self.descrs.int_array().clone();
                self.record(run, |rec, _| {
                    let a = rec.get(array as usize);
                    if !a.is_const() {
                        rec.guard(Opcode::GuardNonnull, &[a], resume_pc)?;
                    }
                    let v = rec.record_value(Opcode::ArraylenGc, &[a], Some(Descr::Array(descr)))?;
                    rec.set(dst as usize, v);
                    Ok(())
                });
                run.set(dst, Value::int(len as i64));
                run.advance();
            }
            Instr::Call { dst, func, args } => return self.call_instr(run, pc, *dst, *func, args),
            Instr::CallBuiltin { dst, builtin, arg } => self.call_builtin(run, resume_pc, *dst, *builtin, *arg)?,
            Instr::Promote { reg } => {
                let reg = *reg;
                let value = run.reg(reg);
                let class = value.as_ref().map(|r| (r, self.heap.class_of(r)));
                self.record(run, |rec, _| {
                    if let Some((obj, class)) = class {
                        rec.note_class(obj, class);
                    }
                    let op = rec.get(reg as usize);
                    rec.promote(op, value, resume_pc)?;
                    Ok(())
                });
                run.advance();
            }
            Instr::LoadGlobal { dst, slot } => {
                let dst = *dst;
                let global = self.globals.get(*slot as usize).copied().ok_or(VmError::Undefined {
                    what: "global",
                    index: *slot as usize,
                })?;
                let class = global.value.as_ref().map(|r| (r, self.heap.class_of(r)));
                self.record(run, |rec, _| {
                    if let Some((obj, class)) = class {
                        rec.note_class(obj, class);
                    }
                    rec.depend_on(global.assumption, resume_pc)?;
                    rec.set(dst as usize, Operand::Const(global.value));
                    Ok(())
                });
                run.set(dst, global.value);
                run.advance();
            }
            Instr::StoreGlobal { slot, src } => {
                let (slot, src) = (*slot, *src);
                if slot as usize >= self.globals.len() {
                    return Err(VmError::Undefined {
                        what: "global",
                        index: slot as usize,
                    });
                }
                let value = run.reg(src);
                self.record(run, |rec, descrs| {
                    let descr = descrs.store_global().clone();
                    let s = rec.get(src as usize);
                    rec.record_call(&descr, Operand::int(i64::from(slot)), &[s], None, resume_pc)?;
                    Ok(())
                });
                self.store_global(slot as usize, value)?;
                run.advance();
            }
            Instr::Print { src } => {
                self.abort_tracing(run, "print");
                self.output.push(run.reg(*src));
                run.advance();
            }
            Instr::Return { src } => {
                let src = *src;
                let value = run.reg(src);
                if let Some(mut rec) = run.tracer.take() {
                    let op = rec.get(src as usize);
                    if rec.depth() > 1 {
                        rec.pop_frame();
                        let caller = run.frames.len().checked_sub(2).and_then(|i| run.frames.get(i));
                        if let Some(dst) = caller.and_then(call_dst) {
                            rec.set(dst as usize, op);
                        }
                        run.tracer = Some(rec);
                    } else if let Some(token) = self.runtime.finish_trace(rec, Some(op)) {
                        debug!(token = token.0, "trace finished at {}@{}", code.name, pc);
                    }
                }
                return self.return_value(run, value);
            }
        }
        Ok(None)
    }

    fn arith(&mut self, run: &mut Run, resume_pc: u32, dst: Reg, a: Reg, b: Reg, opcode: Opcode) -> VmResult<()> {
        let (x, y) = (as_int(run.reg(a))?, as_int(run.reg(b))?);
        let (name, result) = match opcode {
            Opcode::IntAddOvf => ("add", x.checked_add(y)),
            Opcode::IntSubOvf => ("sub", x.checked_sub(y)),
            _ => ("mul", x.checked_mul(y)),
        };
        let value = result.ok_or(VmError::Overflow(name))?;
        self.record(run, |rec, _| {
            let (oa, ob) = (rec.get(a as usize), rec.get(b as usize));
            let result = if oa.is_const() && ob.is_const() {
                Operand::int(value)
            } else {
                let result = rec.record_value(opcode, &[oa, ob], None)?;
                rec.guard(Opcode::GuardNoOverflow, &[], resume_pc)?;
                result
            };
            rec.set(dst as usize, result);
            Ok(())
        });
        run.set(dst, Value::int(value));
        run.advance();
        Ok(())
    }

    fn compare(&mut self, run: &mut Run, dst: Reg, a: Reg, b: Reg, opcode: Opcode) -> VmResult<()> {
        let (va, vb) = (run.reg(a), run.reg(b));
        let (result, traced) = match (opcode, va, vb) {
            (Opcode::IntEq, Value::Ref(x), Value::Ref(y)) => (x == y, Some(Opcode::PtrEq)),
            (Opcode::IntEq, x, y) if x.kind() != y.kind() => (false, None),
            _ => {
                let (x, y) = (as_int(va)?, as_int(vb)?);
                let result = match opcode {
                    Opcode::IntLt => x < y,
                    Opcode::IntLe => x <= y,
                    _ => x == y,
                };
                (result, Some(opcode))
            }
        };
        self.record(run, |rec, _| {
            let op = match traced {
                Some(traced) => {
                    let (oa, ob) = (rec.get(a as usize), rec.get(b as usize));
                    rec.record_value(traced, &[oa, ob], None)?
                }
                None => Operand::int(0),
            };
            rec.set(dst as usize, op);
            Ok(())
        });
        run.set(dst, Value::bool(result));
        run.advance();
        Ok(())
    }

    fn call_builtin(&mut self, run: &mut Run, resume_pc: u32, dst: Reg, builtin: Builtin, arg: Reg) -> VmResult<()> {
        let x = as_int(run.reg(arg))?;
        let result = builtin.eval(x).map_err(|raised| VmError::Raised(Value::int(raised)))?;
        let descr = self.descrs.builtin(builtin).cloned().ok_or_else(|| {
            VmError::TypeError(format!("builtin {} has no call descr", builtin.name()))
        })?;
        self.record(run, |rec, _| {
            let func = Operand::int(i64::from(descr.index));
            let a = rec.get(arg as usize);
            if let Some(out) = rec.record_call(&descr, func, &[a], Some(Value::int(result)), resume_pc)? {
                rec.set(dst as usize, out);
            }
            Ok(())
        });
        run.set(dst, Value::int(result));
        run.advance();
        Ok(())
    }

    // =========================================================================
    // Calls
    // =========================================================================

    fn call_instr(&mut self, run: &mut Run, pc: usize, dst: Reg, func: CodeId, args: &Args) -> VmResult<Option<Value>> {
        let callee = self.code(func)?;
        if args.len() != callee.num_args {
            return Err(VmError::TypeError(format!(
                "{} takes {} arguments, got {}",
                callee.name,
                callee.num_args,
                args.len()
            )));
        }
        if self.depth + run.frames.len() >= MAX_RECURSION_DEPTH {
            return Err(VmError::RecursionLimit);
        }
        let argv: Vec<Value> = args.iter().map(|r| run.reg(*r)).collect();
        let frame = Frame::new(callee, &argv);

        let Some(rec) = run.tracer.as_mut() else {
            run.frames.push(frame);
            run.entering = true;
            return Ok(None);
        };
        let greens = entry_greens(func);
        if rec.can_inline_deeper() && self.runtime.can_inline(self.driver, &greens) {
            let registers = callee_operands(rec, args, frame.regs.len());
            rec.push_frame(func, pc as u32, registers);
            run.frames.push(frame);
            return Ok(None);
        }
        if self.nesting >= MAX_COMPILED_NESTING {
            self.abort_tracing(run, "call nested too deeply");
            run.frames.push(frame);
            run.entering = true;
            return Ok(None);
        }

        let token = self
            .runtime
            .procedure_token(self.driver, &greens)
            .filter(|t| self.runtime.token(*t).map_or(false, |lt| lt.execute.accepts(&frame.regs)));
        let registers = frame.regs.clone();
        let outer = run.frames.len();
        self.depth += outer;
        let result = match token {
            Some(token) => {
                self.call_targets.insert(token, func);
                self.run_token(token, &registers)
            }
            None => self.execute(Run::new(vec![frame], None, true)),
        };
        self.depth -= outer;
        let result = result?;
        self.record(run, |rec, descrs| {
            let out = match token {
                Some(token) => {
                    let ops = callee_operands(rec, args, registers.len());
                    rec.record_call_assembler(token, func, &ops, Some(result.kind()))?
                }
                None => {
                    let kinds: Vec<Kind> = argv.iter().map(Value::kind).collect();
                    let descr = descrs.interp_call(&kinds, result.kind());
                    let ops: Vec<Operand> = args.iter().map(|r| rec.get(*r as usize)).collect();
                    rec.record_call(&descr, Operand::int(i64::from(func)), &ops, Some(result), pc as u32)?
                }
            };
            if let Some(out) = out {
                rec.set(dst as usize, out);
            }
            Ok(())
        });
        run.set(dst, result);
        run.advance();
        Ok(None)
    }

    /// Pop the innermost frame and hand `value` to its caller; returns the
    /// value when the run's outermost frame returned.
    fn return_value(&mut self, run: &mut Run, value: Value) -> VmResult<Option<Value>> {
        run.frames.pop();
        let Some(caller) = run.frames.last_mut() else {
            return Ok(Some(value));
        };
        let Some(dst) = call_dst(caller) else {
            return Err(VmError::TypeError(format!(
                "returned into {}@{}, which is not a call",
                caller.code.name, caller.pc
            )));
        };
        caller.set(dst, value);
        caller.pc += 1;
        Ok(None)
    }

    /// Run compiled code of a function-entry token to completion. Counts
    /// as one guest activation; past [`MAX_COMPILED_NESTING`] the function
    /// is interpreted instead.
    fn run_token(&mut self, token: TokenId, registers: &[Value]) -> VmResult<Value> {
        if self.depth >= MAX_RECURSION_DEPTH {
            return Err(VmError::RecursionLimit);
        }
        if self.nesting >= MAX_COMPILED_NESTING {
            return self.interpret_token(token, registers);
        }
        let runtime = self.runtime.clone();
        self.depth += 1;
        self.nesting += 1;
        let exit = runtime.execute_token(token, registers, self);
        self.nesting -= 1;
        self.depth -= 1;
        match exit {
            Ok(ExitOutcome::Done(value)) => {
                self.check_pending()?;
                Ok(value.unwrap_or_default())
            }
            Ok(ExitOutcome::Resume(state)) => {
                let frames = self.resumed_frames(state)?;
                self.execute(Run::new(frames, None, false))
            }
            Ok(ExitOutcome::Bridge(state, rec)) => match self.resumed_frames(state) {
                Ok(frames) => self.execute(Run::new(frames, Some(rec), false)),
                Err(err) => {
                    self.runtime.abort_trace(rec, JitError::Unsupported(err.to_string()));
                    Err(err)
                }
            },
            Err(err) => {
                self.check_pending()?;
                trace!(token = token.0, error = %err, "interpreting instead of compiled call");
                self.interpret_token(token, registers)
            }
        }
    }

    /// Interpret the function compiled into `token` from its entry.
    fn interpret_token(&mut self, token: TokenId, registers: &[Value]) -> VmResult<Value> {
        let func = self.call_targets.get(&token).copied().ok_or(VmError::Undefined {
            what: "compiled function",
            index: token.0 as usize,
        })?;
        let code = self.code(func)?;
        self.execute(Run::new(vec![Frame::with_registers(code, 0, registers.to_vec())], None, false))
    }

    // =========================================================================
    // Merge points
    // =========================================================================

    fn loop_header(&mut self, run: &mut Run, code: CodeId, pc: usize) -> VmResult<Option<Value>> {
        let greens = loop_greens(code, pc);
        if let Some(rec) = run.tracer.take() {
            match self.runtime.reached_merge_point(rec, &greens) {
                MergeOutcome::Continue(rec) => {
                    run.tracer = Some(rec);
                    run.advance();
                    return Ok(None);
                }
                MergeOutcome::Compiled(token) => {
                    debug!(token = token.0, "loop compiled at {}", self.jit_driver.get_printable_location(&greens));
                }
                MergeOutcome::Aborted => {}
            }
        }
        self.merge_point(run, EntryKind::Loop, &greens, pc as u32, true)
    }

    fn function_entry(&mut self, run: &mut Run) -> VmResult<Option<Value>> {
        if run.tracer.is_some() {
            return Ok(None);
        }
        let greens = match run.frames.last() {
            Some(frame) => entry_greens(frame.code.id),
            None => return Err(VmError::NoFrame),
        };
        self.merge_point(run, EntryKind::Function, &greens, 0, false)
    }

    /// Report the innermost frame to the runtime. While compiled code may
    /// run, every frame of `run` counts towards the recursion depth.
    fn merge_point(
        &mut self,
        run: &mut Run,
        entry: EntryKind,
        greens: &[Value],
        pc: u32,
        step_past: bool,
    ) -> VmResult<Option<Value>> {
        if self.nesting >= MAX_COMPILED_NESTING {
            return self.entered(run, EnterOutcome::Interpret, step_past);
        }
        let runtime = self.runtime.clone();
        let outer = run.frames.len();
        let outcome = {
            let Some(frame) = run.frames.last() else {
                return Err(VmError::NoFrame);
            };
            let at = MergePoint {
                entry,
                greens,
                registers: &frame.regs,
                code: frame.code.id,
                pc,
            };
            self.depth += outer;
            self.nesting += 1;
            let outcome = runtime.maybe_compile_and_run(self.driver, at, self);
            self.nesting -= 1;
            self.depth -= outer;
            outcome
        };
        self.entered(run, outcome, step_past)
    }

    fn entered(&mut self, run: &mut Run, outcome: EnterOutcome, step_past: bool) -> VmResult<Option<Value>> {
        match outcome {
            EnterOutcome::Interpret => {
                self.check_pending()?;
                if step_past {
                    run.advance();
                }
                Ok(None)
            }
            EnterOutcome::Tracing(rec) => {
                run.tracer = Some(rec);
                if step_past {
                    run.advance();
                }
                Ok(None)
            }
            EnterOutcome::Exited(exit) => self.exited(run, exit),
        }
    }

    /// Compiled code entered from the innermost frame was left: replace
    /// that frame with what the exit describes.
    fn exited(&mut self, run: &mut Run, exit: ExitOutcome) -> VmResult<Option<Value>> {
        match exit {
            ExitOutcome::Done(value) => {
                self.check_pending()?;
                self.return_value(run, value.unwrap_or_default())
            }
            ExitOutcome::Resume(state) => {
                let frames = self.resumed_frames(state)?;
                run.frames.pop();
                run.frames.extend(frames);
                Ok(None)
            }
            ExitOutcome::Bridge(state, rec) => match self.resumed_frames(state) {
                Ok(frames) => {
                    run.frames.pop();
                    run.frames.extend(frames);
                    run.tracer = Some(rec);
                    Ok(None)
                }
                Err(err) => {
                    self.runtime.abort_trace(rec, JitError::Unsupported(err.to_string()));
                    Err(err)
                }
            },
        }
    }

    fn resumed_frames(&mut self, state: ResumedState) -> VmResult<Vec<Frame>> {
        self.check_pending()?;
        if let Some(exception) = state.exception {
            return Err(VmError::Raised(exception));
        }
        trace!(guard = state.guard, frames = state.frames.len(), "resuming after guard failure");
        state
            .frames
            .into_iter()
            .map(|f| {
                let code = self.code(f.code)?;
                if f.slots.len() != code.num_regs {
                    return Err(VmError::TypeError(format!(
                        "resumed {} with {} registers, expected {}",
                        code.name,
                        f.slots.len(),
                        code.num_regs
                    )));
                }
                Ok(Frame::with_registers(code, f.pc as usize, f.slots))
            })
            .collect()
    }

    // =========================================================================
    // Heap helpers
    // =========================================================================

    fn instance(&self, value: Value, code: CodeId, pc: usize) -> VmResult<(GcRef, GcRef, ClassId)> {
        let r = as_ref(value)?;
        if r.is_null() {
            return Err(VmError::NullReference { code, pc });
        }
        let class_ref = self.heap.class_of(r);
        match self.heap.get(class_ref) {
            Some(HeapObject::Class(class)) => Ok((r, class_ref, *class)),
            _ => Err(VmError::TypeError(format!("{} is not an instance", r))),
        }
    }

    fn field_descr(&self, class: ClassId, field: u16) -> VmResult<Arc<FieldDescr>> {
        self.descrs.field(class, field as usize).cloned().ok_or(VmError::Undefined {
            what: "field",
            index: field as usize,
        })
    }

    fn array_ref(&self, value: Value, code: CodeId, pc: usize) -> VmResult<GcRef> {
        let r = as_ref(value)?;
        if r.is_null() {
            return Err(VmError::NullReference { code, pc });
        }
        match self.heap.get(r) {
            Some(HeapObject::Array(_)) => Ok(r),
            _ => Err(VmError::TypeError(format!("{} is not an array", r))),
        }
    }

    fn array_index(&self, run: &Run, array: Reg, index: Reg, code: CodeId, pc: usize) -> VmResult<(GcRef, usize)> {
        let r = self.array_ref(run.reg(array), code, pc)?;
        let length = self.heap.array(r).map_or(0, <[Value]>::len);
        let index = as_int(run.reg(index))?;
        usize::try_from(index)
            .ok()
            .filter(|i| *i < length)
            .map(|i| (r, i))
            .ok_or(VmError::IndexError { index, length })
    }
}

// =============================================================================
// Execution context for compiled code
// =============================================================================

impl ExecCx for Vm {
    fn alloc_struct(&mut self, size: &SizeDescr) -> GcRef {
        let vtable = size.vtable.unwrap_or(GcRef::NULL);
        let kinds: Vec<Kind> = match self.heap.get(vtable) {
            Some(HeapObject::Class(class)) => self
                .program
                .classes
                .get(*class as usize)
                .map(|c| c.fields.iter().map(|(_, k)| *k).collect())
                .unwrap_or_default(),
            _ => vec![Kind::Int; size.num_fields],
        };
        self.heap.alloc_struct(vtable, kinds)
    }

    fn alloc_array(&mut self, _descr: &ArrayDescr, len: usize) -> GcRef {
        self.heap.alloc_array(len)
    }

    fn get_field(&mut self, obj: GcRef, field: &FieldDescr) -> Value {
        self.heap.field(obj, field.offset).unwrap_or(Value::zero_of(field.kind))
    }

    fn set_field(&mut self, obj: GcRef, field: &FieldDescr, value: Value) {
        self.heap.set_field(obj, field.offset, value);
    }

    fn get_item(&mut self, array: GcRef, _descr: &ArrayDescr, index: usize) -> Option<Value> {
        self.heap.array(array).and_then(|items| items.get(index).copied())
    }

    fn set_item(&mut self, array: GcRef, _descr: &ArrayDescr, index: usize, value: Value) -> bool {
        match self.heap.array_mut(array).and_then(|items| items.get_mut(index)) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    fn array_len(&mut self, array: GcRef, _descr: &ArrayDescr) -> usize {
        self.heap.array(array).map_or(0, <[Value]>::len)
    }

    fn class_of(&mut self, obj: GcRef) -> GcRef {
        self.heap.class_of(obj)
    }

    fn call(&mut self, func: Value, args: &[Value], descr: &CallDescr) -> Result<Option<Value>, Value> {
        let result = match self.descrs.target(descr) {
            Some(CallTarget::Builtin(builtin)) => {
                let arg = args.first().and_then(Value::as_int).unwrap_or_default();
                return builtin.eval(arg).map(|v| Some(Value::int(v))).map_err(Value::int);
            }
            Some(CallTarget::Interp) => u32::try_from(func.as_word())
                .map_err(|_| VmError::Undefined {
                    what: "code",
                    index: func.as_word() as usize,
                })
                .and_then(|code| self.invoke(code, args))
                .map(Some),
            Some(CallTarget::StoreGlobal) => self
                .store_global(func.as_word() as usize, args.first().copied().unwrap_or_default())
                .map(|()| None),
            None => Err(VmError::TypeError(format!("unknown call descr {}", descr.name))),
        };
        result.map_err(|err| {
            self.pending_error = Some(err);
            Value::NULL
        })
    }

    fn call_assembler(&mut self, token: TokenId, args: &[Value]) -> JitResult<Option<Value>> {
        match self.run_token(token, args) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                let message = err.to_string();
                self.pending_error = Some(err);
                Err(JitError::Backend(format!("guest error in compiled call: {}", message)))
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn as_int(value: Value) -> VmResult<i64> {
    value
        .as_int()
        .ok_or_else(|| VmError::TypeError(format!("expected an integer, got {:?}", value)))
}

fn as_ref(value: Value) -> VmResult<GcRef> {
    value
        .as_ref()
        .ok_or_else(|| VmError::TypeError(format!("expected a reference, got {:?}", value)))
}

/// Destination register of the call a caller frame is suspended on.
fn call_dst(frame: &Frame) -> Option<Reg> {
    match frame.code.instr(frame.pc) {
        Some(Instr::Call { dst, .. }) => Some(*dst),
        _ => None,
    }
}

/// Operands of a callee's registers: the argument operands, then zero.
fn callee_operands(rec: &TraceRecorder, args: &Args, num_regs: usize) -> Vec<Operand> {
    let mut registers: Vec<Operand> = args.iter().map(|r| rec.get(*r as usize)).collect();
    registers.resize(num_regs, Operand::int(0));
    registers
}

fn guard_true(rec: &mut TraceRecorder, cond: Operand, resume_pc: u32) -> JitResult<()> {
    if cond.is_const() {
        return Ok(());
    }
    rec.guard(Opcode::GuardTrue, &[cond], resume_pc)
}

/// `obj` is non-null and of class `class`.
fn guard_class(rec: &mut TraceRecorder, obj: Operand, class: GcRef, resume_pc: u32) -> JitResult<()> {
    if obj.is_const() {
        return Ok(());
    }
    rec.guard(Opcode::GuardNonnull, &[obj], resume_pc)?;
    rec.guard(Opcode::GuardClass, &[obj, Operand::Const(Value::Ref(class))], resume_pc)
}

/// `array` is non-null and `index` is within its bounds. Returns the
/// array and index operands.
fn guard_bounds(
    rec: &mut TraceRecorder,
    descr: &Arc<ArrayDescr>,
    array: Reg,
    index: Reg,
    resume_pc: u32,
) -> JitResult<(Operand, Operand)> {
    let (a, i) = (rec.get(array as usize), rec.get(index as usize));
    if !a.is_const() {
        rec.guard(Opcode::GuardNonnull, &[a], resume_pc)?;
    }
    let len = rec.record_value(Opcode::ArraylenGc, &[a], Some(Descr::Array(descr.clone())))?;
    let below = rec.record_value(Opcode::IntLt, &[i, len], None)?;
    guard_true(rec, below, resume_pc)?;
    let nonneg = rec.record_value(Opcode::IntGe, &[i, Operand::int(0)], None)?;
    guard_true(rec, nonneg, resume_pc)?;
    Ok((a, i))
}
