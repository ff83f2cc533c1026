//! Reference backend: runs compiled traces by interpreting their ops.
//!
//! `TraceBackend` keeps the optimized trace of every loop and bridge and
//! walks it op by op. Guard failures switch into an attached bridge when
//! there is one; otherwise they leave with a [`DeadFrame`]. It stands in
//! for a machine-code backend in tests and embeddings without one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use strand_core::{JitError, JitResult, Value};
use tracing::trace;

use super::{Backend, DeadFrame, ExecCx};
use crate::compile::GuardDescr;
use crate::history::{eval_ovf, eval_pure, Descr, Opcode, Operand, ResOp, TargetId, Trace};
use crate::jitlog;
use crate::memmgr::{LoopToken, TokenId};

// =============================================================================
// Compiled code
// =============================================================================

#[derive(Debug)]
struct CompiledCode {
    trace: Trace,
    labels: FxHashMap<TargetId, usize>,
    owner: TokenId,
    num_boxes: usize,
}

impl CompiledCode {
    fn new(trace: &Trace, owner: TokenId) -> Self {
        let labels = trace
            .ops
            .iter()
            .enumerate()
            .filter_map(|(i, op)| match (op.opcode, &op.descr) {
                (Opcode::Label, Some(Descr::Target(t))) => Some((*t, i)),
                _ => None,
            })
            .collect();
        let num_boxes = trace
            .inputargs
            .iter()
            .map(|b| b.id)
            .chain(trace.ops.iter().filter_map(|op| op.result.map(|r| r.id)))
            .max()
            .map_or(0, |m| m as usize + 1);
        Self {
            trace: trace.clone(),
            labels,
            owner,
            num_boxes,
        }
    }
}

/// Registers of the code currently running.
struct Frame {
    code: Arc<CompiledCode>,
    regs: Vec<Value>,
    pc: usize,
}

impl Frame {
    fn enter(code: Arc<CompiledCode>, args: &[Value]) -> JitResult<Self> {
        if code.trace.inputargs.len() != args.len() {
            return Err(JitError::Backend(format!(
                "expected {} args, got {}",
                code.trace.inputargs.len(),
                args.len()
            )));
        }
        let mut regs = vec![Value::default(); code.num_boxes];
        for (b, v) in code.trace.inputargs.iter().zip(args) {
            regs[b.id as usize] = *v;
        }
        Ok(Self { code, regs, pc: 0 })
    }

    #[inline]
    fn get(&self, op: &Operand) -> Value {
        match op {
            Operand::Const(v) => *v,
            Operand::Box(b) => self.regs[b.id as usize],
        }
    }

    fn args(&self, op: &ResOp) -> Vec<Value> {
        op.args.iter().map(|a| self.get(a)).collect()
    }

    #[inline]
    fn set(&mut self, op: &ResOp, value: Value) {
        if let Some(result) = op.result {
            self.regs[result.id as usize] = value;
        }
    }
}

// =============================================================================
// TraceBackend
// =============================================================================

/// Backend that interprets compiled traces.
#[derive(Debug, Default)]
pub struct TraceBackend {
    loops: RwLock<FxHashMap<TokenId, Arc<CompiledCode>>>,
    bridges: RwLock<FxHashMap<u64, Arc<CompiledCode>>>,
    redirects: RwLock<FxHashMap<TokenId, TokenId>>,
    invalidated: RwLock<FxHashSet<TokenId>>,
    op_budget: Option<usize>,
    ops_used: AtomicUsize,
}

impl TraceBackend {
    /// A backend with unlimited code space.
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend that runs out of memory after `ops` compiled operations.
    pub fn with_op_budget(ops: usize) -> Self {
        Self {
            op_budget: Some(ops),
            ..Self::default()
        }
    }

    /// Number of loops currently held.
    pub fn num_loops(&self) -> usize {
        self.loops.read().len()
    }

    /// Number of bridges currently held.
    pub fn num_bridges(&self) -> usize {
        self.bridges.read().len()
    }

    /// Whether the code of `token` is held.
    pub fn has_loop(&self, token: TokenId) -> bool {
        self.loops.read().contains_key(&token)
    }

    /// The trace compiled for `token`.
    pub fn loop_trace(&self, token: TokenId) -> Option<Trace> {
        self.loops.read().get(&token).map(|c| c.trace.clone())
    }

    /// The bridge attached to guard `guard_id`.
    pub fn bridge_trace(&self, guard_id: u64) -> Option<Trace> {
        self.bridges.read().get(&guard_id).map(|c| c.trace.clone())
    }

    fn charge(&self, ops: usize) -> JitResult<()> {
        let used = self.ops_used.fetch_add(ops, Ordering::AcqRel) + ops;
        match self.op_budget {
            Some(budget) if used > budget => {
                self.ops_used.fetch_sub(ops, Ordering::AcqRel);
                Err(JitError::OutOfMemory)
            }
            _ => Ok(()),
        }
    }

    fn resolve(&self, mut token: TokenId) -> TokenId {
        let redirects = self.redirects.read();
        let mut hops = 0;
        while let Some(next) = redirects.get(&token) {
            token = *next;
            hops += 1;
            if hops > redirects.len() {
                break;
            }
        }
        token
    }

    fn loop_code(&self, token: TokenId) -> JitResult<Arc<CompiledCode>> {
        self.loops
            .read()
            .get(&token)
            .cloned()
            .ok_or(JitError::UnknownToken(token.0))
    }

    fn is_invalidated(&self, token: TokenId) -> bool {
        self.invalidated.read().contains(&token)
    }

    fn guard_holds(&self, frame: &Frame, op: &ResOp, ovf: bool, exc: bool, cx: &mut dyn ExecCx) -> JitResult<bool> {
        let arg = |i: usize| frame.get(&op.args[i]);
        Ok(match op.opcode {
            Opcode::GuardTrue => arg(0).is_true(),
            Opcode::GuardFalse => !arg(0).is_true(),
            Opcode::GuardValue => arg(0) == arg(1),
            Opcode::GuardNonnull => !arg(0).is_null(),
            Opcode::GuardIsnull => arg(0).is_null(),
            Opcode::GuardClass | Opcode::GuardNonnullClass => match arg(0).as_ref() {
                Some(obj) if !obj.is_null() => Some(cx.class_of(obj)) == arg(1).as_ref(),
                _ => false,
            },
            Opcode::GuardNoException => !exc,
            Opcode::GuardNoOverflow => !ovf,
            Opcode::GuardOverflow => ovf,
            Opcode::GuardNotInvalidated => !self.is_invalidated(frame.code.owner),
            other => return Err(JitError::Backend(format!("{} is not a guard", other))),
        })
    }

    fn run(&self, mut frame: Frame, cx: &mut dyn ExecCx) -> JitResult<DeadFrame> {
        let mut ovf = false;
        let mut exception: Option<Value> = None;
        loop {
            let code = frame.code.clone();
            let op = code
                .trace
                .ops
                .get(frame.pc)
                .ok_or_else(|| JitError::Backend("fell off the end of a trace".into()))?;
            frame.pc += 1;

            if op.is_guard() {
                if self.guard_holds(&frame, op, ovf, exception.is_some(), cx)? {
                    continue;
                }
                let descr = fail_descr(op)?;
                let values: Vec<Value> = op
                    .fail_args
                    .as_ref()
                    .map(|args| args.iter().map(|a| frame.get(a)).collect())
                    .unwrap_or_default();
                let bridge = self.bridges.read().get(&descr.id()).cloned();
                if let Some(bridge) = bridge {
                    trace!(target: jitlog::BACKEND, guard = descr.id(), "entering bridge");
                    frame = Frame::enter(bridge, &values)?;
                    continue;
                }
                trace!(target: jitlog::BACKEND, guard = descr.id(), opcode = op.opcode.name(), "guard failed");
                let exception = if op.opcode == Opcode::GuardNoException {
                    exception.take()
                } else {
                    None
                };
                return Ok(DeadFrame {
                    descr,
                    values,
                    exception,
                });
            }

            match op.opcode {
                Opcode::Label => {}
                Opcode::Jump => match &op.descr {
                    Some(Descr::Target(target)) => {
                        let values = frame.args(op);
                        let at = *code
                            .labels
                            .get(target)
                            .ok_or_else(|| JitError::Backend(format!("no label for {:?}", target)))?;
                        let label = &code.trace.ops[at];
                        for (arg, value) in label.args.iter().zip(values) {
                            if let Operand::Box(b) = arg {
                                frame.regs[b.id as usize] = value;
                            }
                        }
                        frame.pc = at + 1;
                    }
                    Some(Descr::Token(token)) => {
                        let values = frame.args(op);
                        let target = self.resolve(*token);
                        frame = Frame::enter(self.loop_code(target)?, &values)?;
                    }
                    _ => return Err(JitError::Backend("jump without target".into())),
                },
                Opcode::Finish => {
                    return Ok(DeadFrame {
                        descr: fail_descr(op)?,
                        values: frame.args(op),
                        exception: None,
                    });
                }
                Opcode::IntAddOvf | Opcode::IntSubOvf | Opcode::IntMulOvf => {
                    let args = frame.args(op);
                    let (a, b) = (int_arg(args[0])?, int_arg(args[1])?);
                    let result = match eval_ovf(op.opcode, a, b) {
                        Some(v) => {
                            ovf = false;
                            v
                        }
                        None => {
                            ovf = true;
                            eval_pure(op.opcode.without_ovf(), &args)
                                .and_then(|v| v.as_int())
                                .unwrap_or_default()
                        }
                    };
                    frame.set(op, Value::Int(result));
                }
                Opcode::New | Opcode::NewWithVtable => {
                    let size = op
                        .descr
                        .as_ref()
                        .and_then(Descr::as_size)
                        .ok_or_else(|| JitError::Backend("allocation without size descr".into()))?;
                    let obj = cx.alloc_struct(size);
                    frame.set(op, Value::Ref(obj));
                }
                Opcode::NewArray => {
                    let descr = array_descr(op)?;
                    let len = usize::try_from(int_arg(frame.get(&op.args[0]))?)
                        .map_err(|_| JitError::Backend("negative array length".into()))?;
                    let array = cx.alloc_array(descr, len);
                    frame.set(op, Value::Ref(array));
                }
                Opcode::GetfieldGc | Opcode::GetfieldGcPure => {
                    let obj = ref_arg(frame.get(&op.args[0]))?;
                    let value = cx.get_field(obj, field_descr(op)?);
                    frame.set(op, value);
                }
                Opcode::SetfieldGc => {
                    let obj = ref_arg(frame.get(&op.args[0]))?;
                    cx.set_field(obj, field_descr(op)?, frame.get(&op.args[1]));
                }
                Opcode::GetarrayitemGc => {
                    let array = ref_arg(frame.get(&op.args[0]))?;
                    let index = index_arg(frame.get(&op.args[1]))?;
                    let value = cx
                        .get_item(array, array_descr(op)?, index)
                        .ok_or_else(|| JitError::Backend(format!("array index {} out of bounds", index)))?;
                    frame.set(op, value);
                }
                Opcode::SetarrayitemGc => {
                    let array = ref_arg(frame.get(&op.args[0]))?;
                    let index = index_arg(frame.get(&op.args[1]))?;
                    if !cx.set_item(array, array_descr(op)?, index, frame.get(&op.args[2])) {
                        return Err(JitError::Backend(format!("array index {} out of bounds", index)));
                    }
                }
                Opcode::ArraylenGc => {
                    let array = ref_arg(frame.get(&op.args[0]))?;
                    let len = cx.array_len(array, array_descr(op)?);
                    frame.set(op, Value::Int(len as i64));
                }
                Opcode::Call | Opcode::CallPure | Opcode::CallLoopinvariant => {
                    let descr = op
                        .descr
                        .as_ref()
                        .and_then(Descr::as_call)
                        .ok_or_else(|| JitError::Backend("call without call descr".into()))?;
                    let args = frame.args(op);
                    match cx.call(args[0], &args[1..], descr) {
                        Ok(result) => {
                            exception = None;
                            if let Some(kind) = descr.result_kind {
                                frame.set(op, result.unwrap_or(Value::zero_of(kind)));
                            }
                        }
                        Err(exc) => {
                            exception = Some(exc);
                            if let Some(kind) = descr.result_kind {
                                frame.set(op, Value::zero_of(kind));
                            }
                        }
                    }
                }
                Opcode::CallAssembler => {
                    let token = match &op.descr {
                        Some(Descr::Token(t)) => *t,
                        _ => return Err(JitError::Backend("call_assembler without token".into())),
                    };
                    let args = frame.args(op);
                    let result = cx.call_assembler(self.resolve(token), &args[1..])?;
                    if let (Some(result), Some(_)) = (result, op.result) {
                        frame.set(op, result);
                    }
                }
                opcode if opcode.is_always_pure() => {
                    let args = frame.args(op);
                    let value = eval_pure(opcode, &args)
                        .ok_or_else(|| JitError::Backend(format!("cannot evaluate '{}'", op)))?;
                    frame.set(op, value);
                }
                other => return Err(JitError::Backend(format!("unsupported op {}", other))),
            }
        }
    }
}

fn fail_descr(op: &ResOp) -> JitResult<Arc<GuardDescr>> {
    op.descr
        .as_ref()
        .and_then(Descr::as_fail)
        .cloned()
        .ok_or_else(|| JitError::Backend(format!("'{}' has no guard descr", op)))
}

fn field_descr(op: &ResOp) -> JitResult<&crate::history::FieldDescr> {
    op.descr
        .as_ref()
        .and_then(Descr::as_field)
        .map(|f| f.as_ref())
        .ok_or_else(|| JitError::Backend(format!("'{}' has no field descr", op)))
}

fn array_descr(op: &ResOp) -> JitResult<&crate::history::ArrayDescr> {
    op.descr
        .as_ref()
        .and_then(Descr::as_array)
        .map(|a| a.as_ref())
        .ok_or_else(|| JitError::Backend(format!("'{}' has no array descr", op)))
}

fn int_arg(v: Value) -> JitResult<i64> {
    v.as_int().ok_or_else(|| JitError::Backend(format!("expected int, got {}", v)))
}

fn ref_arg(v: Value) -> JitResult<strand_core::GcRef> {
    match v.as_ref() {
        Some(r) if !r.is_null() => Ok(r),
        _ => Err(JitError::Backend(format!("expected object, got {}", v))),
    }
}

fn index_arg(v: Value) -> JitResult<usize> {
    usize::try_from(int_arg(v)?).map_err(|_| JitError::Backend(format!("negative index {}", v)))
}

impl Backend for TraceBackend {
    fn name(&self) -> &'static str {
        "trace-interp"
    }

    fn compile_loop(&self, token: &Arc<LoopToken>, trace: &Trace) -> JitResult<()> {
        self.charge(trace.len())?;
        self.loops.write().insert(token.id, Arc::new(CompiledCode::new(trace, token.id)));
        Ok(())
    }

    fn compile_bridge(&self, guard: &Arc<GuardDescr>, trace: &Trace) -> JitResult<()> {
        self.charge(trace.len())?;
        self.bridges
            .write()
            .insert(guard.id(), Arc::new(CompiledCode::new(trace, guard.owner())));
        Ok(())
    }

    fn execute_token(&self, token: TokenId, args: &[Value], cx: &mut dyn ExecCx) -> JitResult<DeadFrame> {
        let target = self.resolve(token);
        if self.is_invalidated(target) {
            return Err(JitError::InvalidatedToken(target.0));
        }
        trace!(target: jitlog::BACKEND, token = target.0, "execute");
        let frame = Frame::enter(self.loop_code(target)?, args)?;
        self.run(frame, cx)
    }

    fn redirect_call_assembler(&self, old: TokenId, new: TokenId) {
        if old != new {
            self.redirects.write().insert(old, new);
        }
    }

    fn invalidate_loop(&self, token: TokenId) {
        self.invalidated.write().insert(token);
    }

    fn free_loop(&self, token: TokenId) {
        let freed = self.loops.write().remove(&token);
        let mut bridges = self.bridges.write();
        let released: usize = freed.iter().map(|c| c.trace.len()).sum::<usize>()
            + bridges.values().filter(|c| c.owner == token).map(|c| c.trace.len()).sum::<usize>();
        bridges.retain(|_, code| code.owner != token);
        let _ = self
            .ops_used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| Some(used.saturating_sub(released)));
        self.redirects.write().retain(|old, new| *old != token && *new != token);
        self.invalidated.write().remove(&token);
    }
}
