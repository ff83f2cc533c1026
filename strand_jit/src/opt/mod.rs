//! The trace optimizer.
//!
//! Stages form a chain. Every recorded operation enters the first
//! enabled stage, which forwards zero or more operations to the next;
//! whatever leaves the last stage is emitted, at which point guard
//! snapshots are compressed into resume data and fail args.
//!
//! ```text
//!   op ──► rewrite ──► intbounds ──► virtualize ──► heap ──► emit
//!             │            │              │           │
//!             └────────────┴── OptState ──┴───────────┘
//!                 forwarding, bounds, classes, virtuals
//! ```
//!
//! Loops are then peeled by [`unroll`]: the preamble and the loop body
//! are two runs of this chain over the same recorded operations.

pub mod heap;
pub mod info;
pub mod intbound;
pub mod intbounds;
pub mod rewrite;
pub mod unroll;
pub mod virtualize;

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use strand_core::{GcRef, JitError, JitResult, Value};

use crate::config::{EnableOpts, JitParams};
use crate::history::{BoxAllocator, BoxRef, CallKey, Descr, Opcode, Operand, ResOp, TargetId, Trace};
use crate::jitlog::PassCount;
use crate::resume::ResumeWriter;

use heap::HeapState;
use info::OptState;
use intbounds::IntBoundsState;
use rewrite::RewriteState;

pub use info::{OptInfo, VirtualInfo};
pub use intbound::IntBound;

// =============================================================================
// Stages
// =============================================================================

/// One stage of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Peephole rewriting, constant folding, CSE, guard merging.
    Rewrite,
    /// Integer bounds.
    IntBounds,
    /// Escape analysis.
    Virtualize,
    /// Heap caching.
    Heap,
}

impl Stage {
    /// Every stage, in chain order.
    pub const ALL: [Stage; 4] = [Stage::Rewrite, Stage::IntBounds, Stage::Virtualize, Stage::Heap];

    /// Stage name, as accepted by `enable_opts`.
    pub const fn name(self) -> &'static str {
        match self {
            Stage::Rewrite => "rewrite",
            Stage::IntBounds => "intbounds",
            Stage::Virtualize => "virtualize",
            Stage::Heap => "heap",
        }
    }

    #[inline]
    const fn index(self) -> usize {
        self as usize
    }

    fn enabled(self, opts: &EnableOpts) -> bool {
        match self {
            Stage::Rewrite => opts.rewrite,
            Stage::IntBounds => opts.intbounds,
            Stage::Virtualize => opts.virtualize,
            Stage::Heap => opts.heap,
        }
    }
}

/// A guard the previous operation made redundant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Pending {
    #[default]
    Nothing,
    /// Drop a following `guard_no_exception`.
    NoException,
    /// Drop a following `guard_no_overflow`; `guard_overflow` can never pass.
    NoOverflow,
}

// =============================================================================
// Optimizer
// =============================================================================

/// One run of the stage chain.
pub struct Optimizer<'a> {
    opts: EnableOpts,
    pub(crate) state: OptState,
    pub(crate) boxes: BoxAllocator,
    call_pure_results: &'a FxHashMap<CallKey, Value>,
    pub(crate) out: Vec<ResOp>,
    counts: [usize; 4],
    pub(crate) pending: Pending,
    pub(crate) rw: RewriteState,
    pub(crate) ib: IntBoundsState,
    pub(crate) heap: HeapState,
}

impl<'a> Optimizer<'a> {
    /// A fresh run with the given stages enabled.
    pub fn new(opts: EnableOpts, boxes: BoxAllocator, call_pure_results: &'a FxHashMap<CallKey, Value>) -> Self {
        Self {
            opts,
            state: OptState::new(),
            boxes,
            call_pure_results,
            out: Vec::new(),
            counts: [0; 4],
            pending: Pending::Nothing,
            rw: RewriteState::default(),
            ib: IntBoundsState::default(),
            heap: HeapState::default(),
        }
    }

    /// Seed the classes of reference constants seen while recording.
    pub fn with_const_classes(mut self, classes: &FxHashMap<GcRef, GcRef>) -> Self {
        for (obj, class) in classes {
            self.state.set_const_class(*obj, *class);
        }
        self
    }

    /// Facts gathered so far.
    #[inline]
    pub fn state(&self) -> &OptState {
        &self.state
    }

    /// Operations emitted so far.
    #[inline]
    pub fn emitted(&self) -> &[ResOp] {
        &self.out
    }

    pub(crate) fn call_pure_result(&self, key: &CallKey) -> Option<Value> {
        self.call_pure_results.get(key).copied()
    }

    fn stage_from(&self, start: usize) -> Option<Stage> {
        Stage::ALL[start.min(Stage::ALL.len())..]
            .iter()
            .copied()
            .find(|s| s.enabled(&self.opts))
    }

    /// Feed one input operation into the chain.
    pub fn send(&mut self, op: ResOp) -> JitResult<()> {
        match (std::mem::take(&mut self.pending), op.opcode) {
            (Pending::NoException, Opcode::GuardNoException) | (Pending::NoOverflow, Opcode::GuardNoOverflow) => {
                return Ok(());
            }
            (Pending::NoOverflow, Opcode::GuardOverflow) => {
                return Err(JitError::InvalidLoop("guard_overflow after an operation that cannot overflow".into()));
            }
            _ => {}
        }
        let first = self.stage_from(0);
        self.dispatch(first, op)
    }

    /// Forward `op` from `from` to the next enabled stage.
    pub(crate) fn next(&mut self, from: Stage, op: ResOp) -> JitResult<()> {
        self.counts[from.index()] += 1;
        let stage = self.stage_from(from.index() + 1);
        self.dispatch(stage, op)
    }

    fn dispatch(&mut self, stage: Option<Stage>, mut op: ResOp) -> JitResult<()> {
        self.resolve_args(&mut op);
        match stage {
            Some(Stage::Rewrite) => self.rewrite(op),
            Some(Stage::IntBounds) => self.intbounds(op),
            Some(Stage::Virtualize) => self.virtualize(op),
            Some(Stage::Heap) => self.heap(op),
            None => self.emit(op),
        }
    }

    fn resolve_args(&self, op: &mut ResOp) {
        for arg in op.args.iter_mut() {
            *arg = self.state.get(*arg);
        }
    }

    // =========================================================================
    // Emission
    // =========================================================================

    fn emit(&mut self, mut op: ResOp) -> JitResult<()> {
        if op.is_guard() {
            self.encode_guard(&mut op)?;
            if op.opcode.is_ref_guard() {
                if let Operand::Box(b) = op.arg(0) {
                    self.state.info_mut(b).last_guard = Some(self.out.len());
                }
            }
        }
        self.out.push(op);
        Ok(())
    }

    /// Append an operation to the output as is.
    pub(crate) fn emit_raw(&mut self, op: ResOp) {
        self.out.push(op);
    }

    fn encode_guard(&self, op: &mut ResOp) -> JitResult<()> {
        match op.descr.take() {
            Some(Descr::Snapshot(snapshot)) => {
                let (data, fail_args) = ResumeWriter::new(&self.state).encode(&snapshot)?;
                op.descr = Some(Descr::Resume(Arc::new(data)));
                op.fail_args = Some(fail_args);
            }
            Some(Descr::Resume(data)) => {
                let fail_args = op
                    .fail_args
                    .take()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|a| self.state.get(a))
                    .collect();
                op.descr = Some(Descr::Resume(data));
                op.fail_args = Some(fail_args);
            }
            other => {
                op.descr = other;
                return Err(JitError::Backend(format!("guard '{}' has no resume information", op)));
            }
        }
        keep_value_slot(op);
        Ok(())
    }

    /// Turn an already emitted guard into a stronger one, keeping its
    /// resume data.
    pub(crate) fn strengthen_guard(&mut self, index: usize, opcode: Opcode, args: &[Operand]) {
        let guard = &mut self.out[index];
        guard.opcode = opcode;
        guard.args = args.iter().copied().collect();
        keep_value_slot(guard);
    }

    /// The emitted guard that established facts about `op`, if it is
    /// one of `opcodes`.
    pub(crate) fn last_guard_among(&self, op: Operand, opcodes: &[Opcode]) -> Option<usize> {
        let b = self.state.get(op).as_box()?;
        let index = self.state.info(b)?.last_guard?;
        let guard = self.out.get(index)?;
        (opcodes.contains(&guard.opcode) && guard.args.first().map(|a| self.state.get(*a)) == Some(Operand::Box(b)))
            .then_some(index)
    }

    /// Per-stage op counts of this run.
    pub(crate) fn stage_counts(&self) -> [usize; 4] {
        self.counts
    }

    pub(crate) fn enabled_stages(&self) -> Vec<Stage> {
        Stage::ALL.iter().copied().filter(|s| s.enabled(&self.opts)).collect()
    }

    /// Hand back the output and the box allocator.
    pub fn finish(self) -> (Vec<ResOp>, BoxAllocator) {
        (self.out, self.boxes)
    }
}

/// `guard_value` must carry its tested box among the fail args, so
/// failures can be counted per value.
fn keep_value_slot(op: &mut ResOp) {
    if op.opcode != Opcode::GuardValue {
        return;
    }
    if let Operand::Box(b) = op.arg(0) {
        let fail_args = op.fail_args.get_or_insert_with(Vec::new);
        if !fail_args.contains(&Operand::Box(b)) {
            fail_args.push(Operand::Box(b));
        }
    }
}

// =============================================================================
// Entry points
// =============================================================================

/// Result of optimizing one trace.
#[derive(Debug, Clone)]
pub struct Optimized {
    /// The optimized trace.
    pub trace: Trace,
    /// Op counts: recorded, after every stage, final.
    pub counts: Vec<PassCount>,
    /// Whether the loop was peeled.
    pub unrolled: bool,
}

/// Optimize a loop or entry trace.
///
/// A trace that jumps back to its own entry is peeled when `unroll` is
/// enabled; if no compatible peeling is found within
/// `max_unroll_loops` attempts it is optimized as a simple loop.
pub fn optimize_loop(trace: &Trace, params: &JitParams) -> JitResult<Optimized> {
    let opts = params.enable_opts;
    let has_label = matches!(trace.ops.first(), Some(op) if op.opcode == Opcode::Label);
    if opts.unroll && trace.is_loop() && !has_label {
        if let Some(optimized) = unroll::optimize_unrolled(trace, params)? {
            return Ok(optimized);
        }
    }
    optimize_linear(trace, opts, !has_label)
}

/// Optimize a bridge. Bridges have no label of their own.
pub fn optimize_bridge(trace: &Trace, params: &JitParams) -> JitResult<Optimized> {
    optimize_linear(trace, params.enable_opts, false)
}

fn optimize_linear(trace: &Trace, opts: EnableOpts, add_label: bool) -> JitResult<Optimized> {
    let mut opt =
        Optimizer::new(opts, trace.boxes.clone(), &trace.call_pure_results).with_const_classes(&trace.const_classes);
    if add_label {
        let args: Vec<Operand> = trace.inputargs.iter().map(|b| Operand::Box(*b)).collect();
        opt.emit_raw(ResOp::new(Opcode::Label, &args, None, Some(Descr::Target(TargetId::ENTRY))));
    }
    for op in &trace.ops {
        opt.send(op.clone())?;
    }
    let stages = opt.enabled_stages();
    let stage_counts = opt.stage_counts();
    let (ops, boxes) = opt.finish();
    let ops = remove_dead_ops(ops);
    let counts = pass_counts(trace.len(), &stages, &stage_counts, None, ops.len());
    let mut out = Trace::new(trace.inputargs.clone(), ops, boxes);
    out.call_pure_results = trace.call_pure_results.clone();
    out.const_classes = trace.const_classes.clone();
    Ok(Optimized {
        trace: out,
        counts,
        unrolled: false,
    })
}

pub(crate) fn pass_counts(
    recorded: usize,
    stages: &[Stage],
    counts: &[usize; 4],
    unrolled: Option<usize>,
    final_len: usize,
) -> Vec<PassCount> {
    let mut out = vec![PassCount {
        pass: "recorded",
        ops: recorded,
    }];
    out.extend(stages.iter().map(|s| PassCount {
        pass: s.name(),
        ops: counts[s.index()],
    }));
    if let Some(ops) = unrolled {
        out.push(PassCount { pass: "unroll", ops });
    }
    out.push(PassCount {
        pass: "final",
        ops: final_len,
    });
    out
}

/// Drop side-effect-free operations whose result is never used.
pub(crate) fn remove_dead_ops(ops: Vec<ResOp>) -> Vec<ResOp> {
    let mut used: FxHashSet<u32> = FxHashSet::default();
    let mut kept: Vec<ResOp> = Vec::with_capacity(ops.len());
    let mark = |used: &mut FxHashSet<u32>, args: &[Operand]| {
        for arg in args {
            if let Operand::Box(b) = arg {
                used.insert(b.id);
            }
        }
    };
    for op in ops.into_iter().rev() {
        let dead = match op.result {
            Some(BoxRef { id, .. }) => op.opcode.has_no_side_effect() && !used.contains(&id),
            None => false,
        };
        if dead {
            continue;
        }
        mark(&mut used, &op.args);
        if let Some(fail_args) = &op.fail_args {
            mark(&mut used, fail_args);
        }
        kept.push(op);
    }
    kept.reverse();
    kept
}
