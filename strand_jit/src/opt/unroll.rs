//! Loop peeling.
//!
//! The recorded loop is optimized twice. The first copy (the preamble)
//! runs once; the second copy (the body) loops on itself and starts from
//! what the preamble established: constants, classes, non-nullness,
//! allocations that are still virtual, and results of pure operations and
//! heap reads that can be carried around the loop instead of recomputed.
//!
//! ```text
//!   label(ENTRY, inputs)
//!   ... preamble ...
//!   label(LOOP_BODY, leaves + carried results)
//!   ... body ...
//!   jump(LOOP_BODY, leaves' + carried results')
//! ```
//!
//! The state at the end of the preamble is exported as one
//! [`SlotState`] per jump argument. The body is compatible when its own
//! jump arguments satisfy those states again; otherwise the states are
//! generalized and peeling is retried, and after `max_unroll_loops`
//! attempts the loop is optimized without peeling.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use strand_core::{GcRef, JitError, JitResult, Kind, Value};
use tracing::debug;

use super::info::{OptState, VirtualInfo};
use super::intbound::IntBound;
use super::rewrite::PureKey;
use super::{pass_counts, remove_dead_ops, Optimized, Optimizer, Stage};
use crate::config::JitParams;
use crate::history::{
    ArrayDescr, BoxRef, Descr, FieldDescr, Opcode, Operand, ResOp, SizeDescr, TargetId, Trace,
};
use crate::jitlog::LOG_OPT;

// =============================================================================
// Exported state
// =============================================================================

/// Layout of a virtual carried across the loop header.
#[derive(Debug, Clone, PartialEq)]
pub enum VirtualShape {
    /// A struct with these fields written, ordered by descr index.
    Struct {
        /// Allocated type.
        size: Arc<SizeDescr>,
        /// Written fields.
        fields: Vec<Arc<FieldDescr>>,
    },
    /// An array of fixed length.
    Array {
        /// Array type.
        descr: Arc<ArrayDescr>,
        /// Length.
        len: usize,
    },
}

impl VirtualShape {
    fn of(virt: &VirtualInfo) -> Self {
        match virt {
            VirtualInfo::Struct { size, fields } => {
                let mut descrs: Vec<Arc<FieldDescr>> = fields.iter().map(|(f, _)| f.clone()).collect();
                descrs.sort_by_key(|f| f.index);
                VirtualShape::Struct {
                    size: size.clone(),
                    fields: descrs,
                }
            }
            VirtualInfo::Array { descr, items } => VirtualShape::Array {
                descr: descr.clone(),
                len: items.len(),
            },
        }
    }

    /// Contents of `virt` in shape order.
    fn values(&self, virt: &VirtualInfo) -> Vec<Operand> {
        match (self, virt) {
            (VirtualShape::Struct { fields, .. }, VirtualInfo::Struct { .. }) => fields
                .iter()
                .map(|f| virt.field(f).unwrap_or(Operand::Const(Value::zero_of(f.kind))))
                .collect(),
            (VirtualShape::Array { .. }, VirtualInfo::Array { items, .. }) => items.clone(),
            _ => Vec::new(),
        }
    }

    fn build(&self, values: Vec<Operand>) -> VirtualInfo {
        match self {
            VirtualShape::Struct { size, fields } => VirtualInfo::Struct {
                size: size.clone(),
                fields: fields.iter().cloned().zip(values).collect(),
            },
            VirtualShape::Array { descr, .. } => VirtualInfo::Array {
                descr: descr.clone(),
                items: values,
            },
        }
    }

    fn class(&self) -> Option<GcRef> {
        match self {
            VirtualShape::Struct { size, .. } => size.vtable,
            VirtualShape::Array { .. } => None,
        }
    }
}

/// What the loop body may assume about one jump argument.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotState {
    /// Always this constant.
    Constant(Value),
    /// An allocation that stays virtual, with the state of its contents.
    Virtual {
        /// Layout.
        shape: VirtualShape,
        /// Contents, in shape order.
        fields: Vec<SlotState>,
    },
    /// A runtime value, passed through the loop header.
    Unknown {
        /// Slot shape.
        kind: Kind,
        /// Known class.
        class: Option<GcRef>,
        /// Known non-null.
        nonnull: bool,
        /// Known `>= 0`.
        nonneg: bool,
    },
}

impl SlotState {
    fn kind(&self) -> Kind {
        match self {
            SlotState::Constant(v) => v.kind(),
            SlotState::Virtual { .. } => Kind::Ref,
            SlotState::Unknown { kind, .. } => *kind,
        }
    }

    /// `(class, nonnull, nonneg)`.
    fn facts(&self) -> (Option<GcRef>, bool, bool) {
        match self {
            SlotState::Constant(v) => (
                None,
                v.kind() == Kind::Ref && !v.is_null(),
                matches!(v, Value::Int(i) if *i >= 0),
            ),
            SlotState::Virtual { shape, .. } => (shape.class(), true, false),
            SlotState::Unknown {
                class, nonnull, nonneg, ..
            } => (*class, *nonnull, *nonneg),
        }
    }

    /// Least general state covering both.
    pub fn generalize(&self, other: &SlotState) -> SlotState {
        match (self, other) {
            (a, b) if a == b => a.clone(),
            (
                SlotState::Virtual { shape, fields },
                SlotState::Virtual {
                    shape: other_shape,
                    fields: other_fields,
                },
            ) if shape == other_shape => SlotState::Virtual {
                shape: shape.clone(),
                fields: fields.iter().zip(other_fields).map(|(a, b)| a.generalize(b)).collect(),
            },
            _ => {
                let (c1, n1, g1) = self.facts();
                let (c2, n2, g2) = other.facts();
                SlotState::Unknown {
                    kind: self.kind(),
                    class: if c1 == c2 { c1 } else { None },
                    nonnull: n1 && n2,
                    nonneg: g1 && g2,
                }
            }
        }
    }
}

/// State of `op` as seen by `state`.
pub fn export(state: &OptState, op: Operand) -> SlotState {
    match state.get(op) {
        Operand::Const(v) => SlotState::Constant(v),
        Operand::Box(b) => match state.virt(b) {
            Some(virt) => {
                let shape = VirtualShape::of(virt);
                let fields = shape.values(virt).into_iter().map(|v| export(state, v)).collect();
                SlotState::Virtual { shape, fields }
            }
            None => {
                let op = Operand::Box(b);
                SlotState::Unknown {
                    kind: b.kind,
                    class: state.known_class(op),
                    nonnull: b.kind == Kind::Ref && state.is_nonnull(op),
                    nonneg: b.kind == Kind::Int && state.bound(op).known_nonneg(),
                }
            }
        },
    }
}

/// Runtime values behind `op` that cross the loop header, depth first.
fn collect_leaves(state: &OptState, op: Operand, slot: &SlotState, out: &mut Vec<Operand>) {
    match slot {
        SlotState::Constant(_) => {}
        SlotState::Unknown { .. } => out.push(state.get(op)),
        SlotState::Virtual { shape, fields } => {
            let values = state
                .virtual_box(op)
                .and_then(|b| state.virt(b))
                .map(|virt| shape.values(virt))
                .unwrap_or_default();
            for (value, field) in values.into_iter().zip(fields) {
                collect_leaves(state, value, field, out);
            }
        }
    }
}

// =============================================================================
// Optimizer hooks
// =============================================================================

impl Optimizer<'_> {
    /// Force virtuals reachable twice from `roots`, so that what crosses
    /// the loop header is a tree.
    fn force_shared_virtuals(&mut self, roots: &[Operand]) -> JitResult<()> {
        fn visit(state: &OptState, op: Operand, seen: &mut FxHashSet<u32>, shared: &mut Vec<BoxRef>) {
            let Some(b) = state.virtual_box(op) else {
                return;
            };
            if !seen.insert(b.id) {
                if !shared.contains(&b) {
                    shared.push(b);
                }
                return;
            }
            if let Some(virt) = state.virt(b) {
                for value in virt.operands() {
                    visit(state, value, seen, shared);
                }
            }
        }

        loop {
            let mut seen = FxHashSet::default();
            let mut shared = Vec::new();
            for root in roots {
                visit(&self.state, *root, &mut seen, &mut shared);
            }
            if shared.is_empty() {
                return Ok(());
            }
            for b in shared {
                self.force(Operand::Box(b))?;
            }
        }
    }

    /// Make `op` match `slot`, forcing virtuals where a runtime value is
    /// expected. False if it cannot.
    fn conform(&mut self, op: Operand, slot: &SlotState) -> JitResult<bool> {
        let op = self.state.get(op);
        match slot {
            SlotState::Constant(v) => Ok(op == Operand::Const(*v)),
            SlotState::Virtual { shape, fields } => {
                let values = match self.state.virtual_box(op).and_then(|b| self.state.virt(b)) {
                    Some(virt) if VirtualShape::of(virt) == *shape => shape.values(virt),
                    _ => return Ok(false),
                };
                for (value, field) in values.into_iter().zip(fields) {
                    if !self.conform(value, field)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            SlotState::Unknown {
                kind,
                class,
                nonnull,
                nonneg,
            } => {
                if op.kind() != *kind {
                    return Ok(false);
                }
                if self.state.is_virtual(op) {
                    if class.is_some() && self.state.known_class(op) != *class {
                        return Ok(false);
                    }
                    self.force(op)?;
                }
                let op = self.state.get(op);
                if *nonnull && !self.state.is_nonnull(op) {
                    return Ok(false);
                }
                if class.is_some() && self.state.known_class(op) != *class {
                    return Ok(false);
                }
                if *nonneg && !self.state.bound(op).known_nonneg() {
                    return Ok(false);
                }
                Ok(true)
            }
        }
    }
}

// =============================================================================
// Carried results
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShortSource {
    Pure,
    Field,
    Length,
}

/// An operation whose preamble result is passed to the body through the
/// loop header and recomputed at the end of every iteration.
#[derive(Debug, Clone)]
struct ShortOp {
    source: ShortSource,
    opcode: Opcode,
    args: Vec<Operand>,
    descr: Option<Descr>,
    result: BoxRef,
}

fn collect_shorts(p: &Optimizer<'_>, leaves: &FxHashSet<u32>) -> Vec<ShortOp> {
    let is_leaf = |op: Operand| matches!(p.state.get(op), Operand::Box(b) if leaves.contains(&b.id));
    let carried = |op: Operand| match p.state.get(op) {
        Operand::Box(b) if !leaves.contains(&b.id) && !p.state.is_virtual(Operand::Box(b)) => Some(b),
        _ => None,
    };

    let mut shorts = Vec::new();
    for (key, entry) in p.rw.entries() {
        let carries = entry.emitted
            && (key.opcode.is_always_pure() || key.opcode == Opcode::GetfieldGcPure)
            && !matches!(key.opcode, Opcode::IntFloorDiv | Opcode::IntMod);
        if !carries {
            continue;
        }
        let args: Vec<Operand> = key.args.iter().map(|a| p.state.get(*a)).collect();
        if !args.iter().all(|a| a.is_const() || is_leaf(*a)) || !args.iter().any(|a| is_leaf(*a)) {
            continue;
        }
        if key.opcode == Opcode::GetfieldGcPure && !p.state.is_nonnull(args[0]) {
            continue;
        }
        if let Some(result) = carried(entry.result) {
            shorts.push(ShortOp {
                source: ShortSource::Pure,
                opcode: key.opcode,
                args,
                descr: entry.descr.clone(),
                result,
            });
        }
    }
    for (descr, obj, value) in p.heap.known_fields() {
        let obj = p.state.get(obj);
        if !is_leaf(obj) || !p.state.is_nonnull(obj) {
            continue;
        }
        if let Some(result) = carried(value) {
            let opcode = if descr.immutable {
                Opcode::GetfieldGcPure
            } else {
                Opcode::GetfieldGc
            };
            shorts.push(ShortOp {
                source: ShortSource::Field,
                opcode,
                args: vec![obj],
                descr: Some(Descr::Field(descr)),
                result,
            });
        }
    }
    for (descr, arr, len) in p.heap.known_lengths() {
        let arr = p.state.get(arr);
        if !is_leaf(arr) || !p.state.is_nonnull(arr) {
            continue;
        }
        if let Some(result) = carried(len) {
            shorts.push(ShortOp {
                source: ShortSource::Length,
                opcode: Opcode::ArraylenGc,
                args: vec![arr],
                descr: Some(Descr::Array(descr)),
                result,
            });
        }
    }

    shorts.sort_by_key(|s| s.result.id);
    shorts.dedup_by_key(|s| s.result.id);
    shorts
}

// =============================================================================
// Peeling
// =============================================================================

enum Peel {
    Done(Optimized),
    Incompatible(Vec<SlotState>),
    Fallback,
}

/// Peel `trace`; `None` if it has to be optimized as a simple loop.
pub(crate) fn optimize_unrolled(trace: &Trace, params: &JitParams) -> JitResult<Option<Optimized>> {
    let Some(jump) = trace.last_op() else {
        return Ok(None);
    };
    if jump.num_args() != trace.inputargs.len() {
        return Ok(None);
    }
    let mut target: Option<Vec<SlotState>> = None;
    for attempt in 0..params.max_unroll_loops.max(1) {
        match peel(trace, params, target.as_deref(), attempt == 0)? {
            Peel::Done(optimized) => return Ok(Some(optimized)),
            Peel::Incompatible(next) => {
                debug!(target: LOG_OPT, attempt, "peeled body incompatible with its preamble, generalizing");
                target = Some(next);
            }
            Peel::Fallback => return Ok(None),
        }
    }
    debug!(target: LOG_OPT, "no compatible peeling, optimizing as a simple loop");
    Ok(None)
}

fn body_error(err: JitError) -> JitResult<Peel> {
    match err {
        JitError::InvalidLoop(_) => Ok(Peel::Fallback),
        other => Err(other),
    }
}

fn peel(trace: &Trace, params: &JitParams, target: Option<&[SlotState]>, share: bool) -> JitResult<Peel> {
    let opts = params.enable_opts;
    let (recorded, jump) = trace.ops.split_at(trace.ops.len() - 1);
    let jump = &jump[0];

    // Preamble.
    let mut p =
        Optimizer::new(opts, trace.boxes.clone(), &trace.call_pure_results).with_const_classes(&trace.const_classes);
    let entry_args: Vec<Operand> = trace.inputargs.iter().map(|b| Operand::Box(*b)).collect();
    p.emit_raw(ResOp::new(Opcode::Label, &entry_args, None, Some(Descr::Target(TargetId::ENTRY))));
    for op in recorded {
        p.send(op.clone())?;
    }
    p.flush_heap()?;
    let preamble_jump: Vec<Operand> = jump.args.iter().map(|a| p.state.get(*a)).collect();
    p.force_shared_virtuals(&preamble_jump)?;
    let states: Vec<SlotState> = match target {
        None => preamble_jump.iter().map(|a| export(&p.state, *a)).collect(),
        Some(target) => {
            for (arg, slot) in preamble_jump.iter().zip(target) {
                if !p.conform(*arg, slot)? {
                    return Ok(Peel::Fallback);
                }
            }
            target.to_vec()
        }
    };
    p.flush_heap()?;

    let mut leaf_ops = Vec::new();
    for (arg, slot) in preamble_jump.iter().zip(&states) {
        collect_leaves(&p.state, *arg, slot, &mut leaf_ops);
    }
    let mut label_boxes: Vec<BoxRef> = Vec::new();
    let mut leaf_slots: Vec<usize> = Vec::with_capacity(leaf_ops.len());
    for op in leaf_ops {
        let existing = match op {
            Operand::Box(b) if share => label_boxes.iter().position(|x| *x == b),
            _ => None,
        };
        let slot = match (existing, op) {
            (Some(slot), _) => slot,
            (None, Operand::Box(b)) if !label_boxes.contains(&b) => {
                label_boxes.push(b);
                label_boxes.len() - 1
            }
            (None, other) => {
                let copy = p.boxes.fresh(other.kind());
                p.emit_raw(ResOp::new(Opcode::SameAs, &[other], Some(copy), None));
                label_boxes.push(copy);
                label_boxes.len() - 1
            }
        };
        leaf_slots.push(slot);
    }

    let leaf_ids: FxHashSet<u32> = label_boxes.iter().map(|b| b.id).collect();
    let shorts = collect_shorts(&p, &leaf_ids);
    let label_args: Vec<Operand> = label_boxes
        .iter()
        .copied()
        .chain(shorts.iter().map(|s| s.result))
        .map(Operand::Box)
        .collect();
    p.emit_raw(ResOp::new(Opcode::Label, &label_args, None, Some(Descr::Target(TargetId::LOOP_BODY))));

    let stages = p.enabled_stages();
    let preamble_counts = p.stage_counts();
    let (preamble_ops, boxes) = p.finish();

    // Body.
    let mut b = Optimizer::new(opts, boxes, &trace.call_pure_results).with_const_classes(&trace.const_classes);
    let mut rename: FxHashMap<u32, Operand> = FxHashMap::default();
    let mut cursor = 0;
    for (input, slot) in trace.inputargs.iter().zip(&states) {
        let imported = import(&mut b, slot, &label_boxes, &leaf_slots, &mut cursor);
        rename.insert(input.id, imported);
    }
    for short in &shorts {
        let result = Operand::Box(short.result);
        match (short.source, &short.descr) {
            (ShortSource::Field, Some(Descr::Field(field))) => b.heap.seed_field(field, short.args[0], result),
            (ShortSource::Length, Some(Descr::Array(descr))) => {
                b.heap.seed_length(descr, short.args[0], result);
                b.state.narrow(result, &IntBound::nonneg());
            }
            _ => b.rw.seed(
                PureKey {
                    opcode: short.opcode,
                    args: short.args.iter().copied().collect(),
                    descr: short.descr.as_ref().map(Descr::key),
                },
                result,
                short.descr.clone(),
            ),
        }
    }

    let map = |rename: &FxHashMap<u32, Operand>, op: Operand| match op {
        Operand::Box(x) => rename.get(&x.id).copied().unwrap_or(op),
        other => other,
    };
    for op in recorded {
        let mut copy = op.clone();
        for arg in copy.args.iter_mut() {
            *arg = map(&rename, *arg);
        }
        if let Some(fail_args) = copy.fail_args.as_mut() {
            for arg in fail_args.iter_mut() {
                *arg = map(&rename, *arg);
            }
        }
        if let Some(Descr::Snapshot(snapshot)) = &copy.descr {
            let mapped = snapshot.map_operands(|a| map(&rename, a));
            copy.descr = Some(Descr::Snapshot(Arc::new(mapped)));
        }
        if let Some(result) = op.result {
            let fresh = b.boxes.fresh(result.kind);
            rename.insert(result.id, Operand::Box(fresh));
            copy.result = Some(fresh);
        }
        if let Err(err) = b.send(copy) {
            return body_error(err);
        }
    }
    if let Err(err) = b.flush_heap() {
        return body_error(err);
    }

    let body_jump: Vec<Operand> = jump.args.iter().map(|a| b.state.get(map(&rename, *a))).collect();
    if let Err(err) = b.force_shared_virtuals(&body_jump) {
        return body_error(err);
    }
    let body_states: Vec<SlotState> = body_jump.iter().map(|a| export(&b.state, *a)).collect();
    let generalized = || -> Vec<SlotState> {
        states
            .iter()
            .zip(&body_states)
            .map(|(target, body)| target.generalize(body))
            .collect()
    };

    for (arg, slot) in body_jump.iter().zip(&states) {
        match b.conform(*arg, slot) {
            Ok(true) => {}
            Ok(false) => return Ok(Peel::Incompatible(generalized())),
            Err(err) => return body_error(err),
        }
    }
    if let Err(err) = b.flush_heap() {
        return body_error(err);
    }

    let mut body_leaves = Vec::new();
    for (arg, slot) in body_jump.iter().zip(&states) {
        collect_leaves(&b.state, *arg, slot, &mut body_leaves);
    }
    let mut slot_values: Vec<Option<Operand>> = vec![None; label_boxes.len()];
    for (value, slot) in body_leaves.into_iter().zip(&leaf_slots) {
        match slot_values[*slot] {
            None => slot_values[*slot] = Some(value),
            Some(previous) if previous == value => {}
            Some(_) => return Ok(Peel::Incompatible(generalized())),
        }
    }
    let Some(leaf_values) = slot_values.into_iter().collect::<Option<Vec<Operand>>>() else {
        return Ok(Peel::Incompatible(generalized()));
    };

    let leaf_map: FxHashMap<u32, Operand> = label_boxes.iter().map(|b| b.id).zip(leaf_values.iter().copied()).collect();
    let mut jump_args = leaf_values;
    for short in &shorts {
        let args: Vec<Operand> = short
            .args
            .iter()
            .map(|a| match a {
                Operand::Box(x) => leaf_map.get(&x.id).copied().unwrap_or(*a),
                other => *other,
            })
            .collect();
        let fresh = b.boxes.fresh(short.result.kind);
        if let Err(err) = b.send(ResOp::new(short.opcode, &args, Some(fresh), short.descr.clone())) {
            return body_error(err);
        }
        jump_args.push(b.state.get(Operand::Box(fresh)));
    }
    let body_jump_op = ResOp::new(Opcode::Jump, &jump_args, None, Some(Descr::Target(TargetId::LOOP_BODY)));
    if let Err(err) = b.send(body_jump_op) {
        return body_error(err);
    }

    let body_counts = b.stage_counts();
    let (body_ops, boxes) = b.finish();
    let mut counts = [0usize; 4];
    for stage in Stage::ALL {
        let i = stage as usize;
        counts[i] = preamble_counts[i] + body_counts[i];
    }
    let mut ops = preamble_ops;
    ops.extend(body_ops);
    let peeled = ops.len();
    let ops = remove_dead_ops(ops);
    let counts = pass_counts(trace.len(), &stages, &counts, Some(peeled), ops.len());
    let mut out = Trace::new(trace.inputargs.clone(), ops, boxes);
    out.call_pure_results = trace.call_pure_results.clone();
    out.const_classes = trace.const_classes.clone();
    Ok(Peel::Done(Optimized {
        trace: out,
        counts,
        unrolled: true,
    }))
}

/// Build the body's view of one jump argument.
fn import(
    b: &mut Optimizer<'_>,
    slot: &SlotState,
    label_boxes: &[BoxRef],
    leaf_slots: &[usize],
    cursor: &mut usize,
) -> Operand {
    match slot {
        SlotState::Constant(v) => Operand::Const(*v),
        SlotState::Unknown {
            class,
            nonnull,
            nonneg,
            ..
        } => {
            let leaf = label_boxes[leaf_slots[*cursor]];
            *cursor += 1;
            let info = b.state.info_mut(leaf);
            info.nonnull |= *nonnull;
            if class.is_some() {
                info.known_class = *class;
            }
            if *nonneg {
                info.bound.intersect(&IntBound::nonneg());
            }
            Operand::Box(leaf)
        }
        SlotState::Virtual { shape, fields } => {
            let values: Vec<Operand> = fields
                .iter()
                .map(|field| import(b, field, label_boxes, leaf_slots, cursor))
                .collect();
            let vb = b.boxes.fresh(Kind::Ref);
            let info = b.state.info_mut(vb);
            info.nonnull = true;
            info.known_class = shape.class();
            info.virt = Some(shape.build(values));
            Operand::Box(vb)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnableOpts;
    use crate::history::{DescrTable, TraceBuilder};
    use crate::opt::optimize_loop;

    fn params() -> JitParams {
        JitParams {
            enable_opts: EnableOpts::all(),
            ..JitParams::for_testing()
        }
    }

    fn body(trace: &Trace) -> &[ResOp] {
        let label = trace
            .ops
            .iter()
            .rposition(|op| op.opcode == Opcode::Label)
            .unwrap();
        &trace.ops[label + 1..]
    }

    fn body_opcodes(trace: &Trace) -> Vec<Opcode> {
        body(trace).iter().map(|op| op.opcode).collect()
    }

    #[test]
    fn test_counting_loop_is_peeled() {
        let mut b = TraceBuilder::new();
        let i0 = b.input(Kind::Int);
        let i1 = b.op(Opcode::IntAdd, &[i0, Operand::int(1)]);
        let c = b.op(Opcode::IntLt, &[i1, Operand::int(100)]);
        b.guard(Opcode::GuardTrue, &[c], &[i1]);
        let trace = b.jump(&[i1]);
        let out = optimize_loop(&trace, &params()).unwrap();
        assert!(out.unrolled);
        assert!(out.trace.check_consistency().is_ok(), "{}", out.trace);
        assert_eq!(out.trace.count(Opcode::Label), 2);
        assert_eq!(
            body_opcodes(&out.trace),
            vec![Opcode::IntAdd, Opcode::IntLt, Opcode::GuardTrue, Opcode::Jump]
        );
    }

    #[test]
    fn test_loop_invariant_read_hoisted() {
        let mut table = DescrTable::new();
        let f = table.field("Config.step", Kind::Int, 0);
        let mut b = TraceBuilder::new();
        let i0 = b.input(Kind::Int);
        let p0 = b.input(Kind::Ref);
        b.guard(Opcode::GuardNonnull, &[p0], &[i0, p0]);
        let step = b.op_descr(Opcode::GetfieldGc, &[p0], Some(Descr::Field(f))).unwrap();
        let i1 = b.op(Opcode::IntAdd, &[i0, step]);
        let c = b.op(Opcode::IntLt, &[i1, Operand::int(1000)]);
        b.guard(Opcode::GuardTrue, &[c], &[i1, p0]);
        let trace = b.jump(&[i1, p0]);
        let out = optimize_loop(&trace, &params()).unwrap();
        assert!(out.unrolled);
        assert!(out.trace.check_consistency().is_ok(), "{}", out.trace);
        let body = body_opcodes(&out.trace);
        assert!(!body.contains(&Opcode::GetfieldGc), "{}", out.trace);
        assert!(!body.contains(&Opcode::GuardNonnull), "{}", out.trace);
    }

    #[test]
    fn test_virtual_carried_across_iterations() {
        let mut table = DescrTable::new();
        let size = table.size("Counter", None, 1);
        let value = table.field("Counter.value", Kind::Int, 0);
        let mut b = TraceBuilder::new();
        let p0 = b.input(Kind::Ref);
        b.guard(Opcode::GuardNonnull, &[p0], &[p0]);
        let v0 = b.op_descr(Opcode::GetfieldGc, &[p0], Some(Descr::Field(value.clone()))).unwrap();
        let v1 = b.op(Opcode::IntAdd, &[v0, Operand::int(1)]);
        let p1 = b.op_descr(Opcode::New, &[], Some(Descr::Size(size))).unwrap();
        b.op_descr(Opcode::SetfieldGc, &[p1, v1], Some(Descr::Field(value)));
        let c = b.op(Opcode::IntLt, &[v1, Operand::int(10)]);
        b.guard(Opcode::GuardTrue, &[c], &[p1]);
        let trace = b.jump(&[p1]);
        let out = optimize_loop(&trace, &params()).unwrap();
        assert!(out.unrolled);
        assert!(out.trace.check_consistency().is_ok(), "{}", out.trace);
        let body = body_opcodes(&out.trace);
        assert!(!body.contains(&Opcode::New), "{}", out.trace);
        assert!(!body.contains(&Opcode::GetfieldGc), "{}", out.trace);
        assert_eq!(body.last(), Some(&Opcode::Jump));
    }

    #[test]
    fn test_shared_leaf_passed_once() {
        let mut b = TraceBuilder::new();
        b.input(Kind::Int);
        let i1 = b.input(Kind::Int);
        let i2 = b.op(Opcode::IntAdd, &[i1, Operand::int(1)]);
        let c = b.op(Opcode::IntLt, &[i2, Operand::int(50)]);
        b.guard(Opcode::GuardTrue, &[c], &[i2]);
        let trace = b.jump(&[i2, i2]);
        let out = optimize_loop(&trace, &params()).unwrap();
        assert!(out.unrolled);
        assert!(out.trace.check_consistency().is_ok(), "{}", out.trace);
        let label = out
            .trace
            .ops
            .iter()
            .find(|op| matches!(op.descr, Some(Descr::Target(TargetId::LOOP_BODY))) && op.opcode == Opcode::Label)
            .unwrap();
        assert_eq!(label.num_args(), 1);
        assert_eq!(out.trace.last_op().unwrap().num_args(), 1);
    }

    #[test]
    fn test_body_contradiction_falls_back_to_simple_loop() {
        let mut b = TraceBuilder::new();
        let i0 = b.input(Kind::Int);
        b.guard(Opcode::GuardValue, &[i0, Operand::int(0)], &[i0]);
        let i1 = b.op(Opcode::IntAdd, &[i0, Operand::int(1)]);
        let trace = b.jump(&[i1]);
        let out = optimize_loop(&trace, &params()).unwrap();
        assert!(!out.unrolled);
        assert!(out.trace.check_consistency().is_ok(), "{}", out.trace);
        assert_eq!(out.trace.last_op().unwrap().arg(0), Operand::int(1));
    }

    #[test]
    fn test_generalize() {
        let a = SlotState::Constant(Value::int(1));
        let b = SlotState::Constant(Value::int(2));
        assert_eq!(
            a.generalize(&b),
            SlotState::Unknown {
                kind: Kind::Int,
                class: None,
                nonnull: false,
                nonneg: true
            }
        );
        assert_eq!(a.generalize(&a), a);
    }

    #[test]
    fn test_disabled_unroll_keeps_single_label() {
        let mut b = TraceBuilder::new();
        let i0 = b.input(Kind::Int);
        let i1 = b.op(Opcode::IntAdd, &[i0, Operand::int(1)]);
        let trace = b.jump(&[i1]);
        let params = JitParams {
            enable_opts: EnableOpts::parse("rewrite:intbounds:virtualize:heap").unwrap(),
            ..JitParams::for_testing()
        };
        let out = optimize_loop(&trace, &params).unwrap();
        assert!(!out.unrolled);
        assert_eq!(out.trace.count(Opcode::Label), 1);
    }
}
