//! Escape analysis.
//!
//! Allocations start out virtual: their contents are tracked in the
//! optimizer and reads are answered from there. An allocation is forced
//! (really emitted, followed by the writes of its non-zero contents) as
//! soon as it escapes: passed to a call, stored into a non-virtual
//! object, or handed to the next iteration of a simple loop. Virtuals
//! still alive at a guard are described in the guard's resume data
//! instead.

use strand_core::{JitResult, Value};

use super::info::VirtualInfo;
use super::{Optimizer, Stage};
use crate::history::{Descr, Opcode, Operand, ResOp};

/// Largest array allocation kept virtual.
pub const MAX_VIRTUAL_ARRAY: i64 = 64;

impl Optimizer<'_> {
    pub(crate) fn virtualize(&mut self, op: ResOp) -> JitResult<()> {
        if self.try_virtualize(&op)? {
            return Ok(());
        }
        let mut escaping: Vec<Operand> = op.args.iter().copied().filter(|a| self.state.is_virtual(*a)).collect();
        // Already encoded resume data cannot describe new virtuals.
        if let (Some(Descr::Resume(_)), Some(fail_args)) = (&op.descr, &op.fail_args) {
            escaping.extend(fail_args.iter().copied().filter(|a| self.state.is_virtual(*a)));
        }
        self.force_all(&escaping)?;
        self.next(Stage::Virtualize, op)
    }

    /// Handle `op` entirely on virtual state; false if it has to be
    /// emitted.
    fn try_virtualize(&mut self, op: &ResOp) -> JitResult<bool> {
        match (op.opcode, &op.descr, op.result) {
            (Opcode::New | Opcode::NewWithVtable, Some(Descr::Size(size)), Some(result)) => {
                let info = self.state.info_mut(result);
                info.nonnull = true;
                info.known_class = size.vtable;
                info.virt = Some(VirtualInfo::Struct {
                    size: size.clone(),
                    fields: Vec::new(),
                });
                Ok(true)
            }
            (Opcode::NewArray, Some(Descr::Array(descr)), Some(result)) => match op.arg(0).const_int() {
                Some(len) if (0..=MAX_VIRTUAL_ARRAY).contains(&len) => {
                    let zero = Operand::Const(Value::zero_of(descr.item_kind));
                    let info = self.state.info_mut(result);
                    info.nonnull = true;
                    info.virt = Some(VirtualInfo::Array {
                        descr: descr.clone(),
                        items: vec![zero; len as usize],
                    });
                    Ok(true)
                }
                _ => Ok(false),
            },
            (Opcode::SetfieldGc, Some(Descr::Field(field)), None) => {
                let Some(obj) = self.state.virtual_box(op.arg(0)) else {
                    return Ok(false);
                };
                let value = op.arg(1);
                Ok(self.state.virt_mut(obj).map_or(false, |v| v.set_field(field, value)))
            }
            (Opcode::GetfieldGc | Opcode::GetfieldGcPure, Some(Descr::Field(field)), Some(result)) => {
                let value = self
                    .state
                    .virtual_box(op.arg(0))
                    .and_then(|obj| self.state.virt(obj))
                    .and_then(|v| v.field(field));
                match value {
                    Some(value) => {
                        self.state.make_equal_to(result, value);
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            (Opcode::SetarrayitemGc, _, None) => {
                let (Some(arr), Some(index)) = (self.state.virtual_box(op.arg(0)), op.arg(1).const_int()) else {
                    return Ok(false);
                };
                let value = op.arg(2);
                match self.state.virt_mut(arr) {
                    Some(VirtualInfo::Array { items, .. }) if (0..items.len() as i64).contains(&index) => {
                        items[index as usize] = value;
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            }
            (Opcode::GetarrayitemGc, _, Some(result)) => {
                let (Some(arr), Some(index)) = (self.state.virtual_box(op.arg(0)), op.arg(1).const_int()) else {
                    return Ok(false);
                };
                let item = match self.state.virt(arr) {
                    Some(VirtualInfo::Array { items, .. }) if (0..items.len() as i64).contains(&index) => {
                        items[index as usize]
                    }
                    _ => return Ok(false),
                };
                self.state.make_equal_to(result, item);
                Ok(true)
            }
            (Opcode::ArraylenGc, _, Some(result)) => {
                let len = self
                    .state
                    .virtual_box(op.arg(0))
                    .and_then(|arr| self.state.virt(arr))
                    .and_then(VirtualInfo::len);
                match len {
                    Some(len) => {
                        self.state.make_constant(result, Value::int(len as i64));
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            _ => Ok(false),
        }
    }

    /// Emit a virtual allocation and its contents; no-op for anything
    /// that is not virtual.
    pub(crate) fn force(&mut self, op: Operand) -> JitResult<()> {
        let Some(b) = self.state.virtual_box(op) else {
            return Ok(());
        };
        let Some(virt) = self.state.info_mut(b).virt.take() else {
            return Ok(());
        };
        match virt {
            VirtualInfo::Struct { size, fields } => {
                let opcode = if size.vtable.is_some() {
                    Opcode::NewWithVtable
                } else {
                    Opcode::New
                };
                self.next(Stage::Virtualize, ResOp::new(opcode, &[], Some(b), Some(Descr::Size(size))))?;
                for (field, value) in fields {
                    let value = self.state.get(value);
                    if value.is_const_value(Value::zero_of(field.kind)) {
                        continue;
                    }
                    self.force(value)?;
                    self.next(
                        Stage::Virtualize,
                        ResOp::new(Opcode::SetfieldGc, &[Operand::Box(b), value], None, Some(Descr::Field(field))),
                    )?;
                }
            }
            VirtualInfo::Array { descr, items } => {
                self.next(
                    Stage::Virtualize,
                    ResOp::new(
                        Opcode::NewArray,
                        &[Operand::int(items.len() as i64)],
                        Some(b),
                        Some(Descr::Array(descr.clone())),
                    ),
                )?;
                for (index, item) in items.into_iter().enumerate() {
                    let item = self.state.get(item);
                    if item.is_const_value(Value::zero_of(descr.item_kind)) {
                        continue;
                    }
                    self.force(item)?;
                    self.next(
                        Stage::Virtualize,
                        ResOp::new(
                            Opcode::SetarrayitemGc,
                            &[Operand::Box(b), Operand::int(index as i64), item],
                            None,
                            Some(Descr::Array(descr.clone())),
                        ),
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Force every virtual among `ops` and everything they point to.
    pub(crate) fn force_all(&mut self, ops: &[Operand]) -> JitResult<()> {
        for op in ops {
            self.force(*op)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnableOpts, JitParams};
    use crate::history::{DescrTable, EffectInfo, Trace, TraceBuilder};
    use crate::opt::optimize_bridge;
    use crate::resume::Tag;
    use strand_core::{GcRef, Kind};

    fn params() -> JitParams {
        JitParams {
            enable_opts: EnableOpts::parse("rewrite:virtualize:heap").unwrap(),
            ..JitParams::for_testing()
        }
    }

    fn opcodes(trace: &Trace) -> Vec<Opcode> {
        trace.ops.iter().map(|op| op.opcode).collect()
    }

    #[test]
    fn test_allocation_removed_when_not_escaping() {
        let mut table = DescrTable::new();
        let size = table.size("Pair", None, 2);
        let a = table.field("Pair.a", Kind::Int, 0);
        let mut b = TraceBuilder::new();
        let i0 = b.input(Kind::Int);
        let p = b.op_descr(Opcode::New, &[], Some(Descr::Size(size))).unwrap();
        b.op_descr(Opcode::SetfieldGc, &[p, Operand::int(5)], Some(Descr::Field(a.clone())));
        let v = b.op_descr(Opcode::GetfieldGc, &[p], Some(Descr::Field(a))).unwrap();
        let sum = b.op(Opcode::IntAdd, &[i0, v]);
        let trace = b.finish(&[sum]);
        let out = optimize_bridge(&trace, &params()).unwrap().trace;
        assert_eq!(opcodes(&out), vec![Opcode::IntAdd, Opcode::Finish]);
        assert_eq!(out.ops[0].arg(1), Operand::int(5));
    }

    #[test]
    fn test_escaping_allocation_forced_with_nonzero_fields() {
        let mut table = DescrTable::new();
        let size = table.size("Pair", Some(GcRef(0x100)), 2);
        let a = table.field("Pair.a", Kind::Int, 0);
        let z = table.field("Pair.b", Kind::Int, 1);
        let call = table.call("escape", &[Kind::Ref], None, EffectInfo::anything());
        let mut b = TraceBuilder::new();
        let i0 = b.input(Kind::Int);
        let p = b.op_descr(Opcode::NewWithVtable, &[], Some(Descr::Size(size))).unwrap();
        b.op_descr(Opcode::SetfieldGc, &[p, i0], Some(Descr::Field(a)));
        b.op_descr(Opcode::SetfieldGc, &[p, Operand::int(0)], Some(Descr::Field(z)));
        b.op_descr(Opcode::Call, &[Operand::int(0x10), p], Some(Descr::Call(call)));
        let trace = b.finish(&[]);
        let out = optimize_bridge(&trace, &params()).unwrap().trace;
        assert_eq!(
            opcodes(&out),
            vec![Opcode::NewWithVtable, Opcode::SetfieldGc, Opcode::Call, Opcode::Finish]
        );
    }

    #[test]
    fn test_virtual_at_guard_goes_to_resume_data() {
        let mut table = DescrTable::new();
        let size = table.size("Pair", None, 1);
        let a = table.field("Pair.a", Kind::Int, 0);
        let mut b = TraceBuilder::new();
        let i0 = b.input(Kind::Int);
        let p = b.op_descr(Opcode::New, &[], Some(Descr::Size(size))).unwrap();
        b.op_descr(Opcode::SetfieldGc, &[p, i0], Some(Descr::Field(a)));
        let c = b.op(Opcode::IntLt, &[i0, Operand::int(3)]);
        b.guard(Opcode::GuardTrue, &[c], &[p]);
        let trace = b.finish(&[i0]);
        let out = optimize_bridge(&trace, &params()).unwrap().trace;
        assert_eq!(opcodes(&out), vec![Opcode::IntLt, Opcode::GuardTrue, Opcode::Finish]);
        let guard = &out.ops[1];
        assert_eq!(guard.fail_args.as_deref(), Some(&[i0][..]));
        match &guard.descr {
            Some(Descr::Resume(data)) => {
                assert_eq!(data.virtuals.len(), 1);
                assert_eq!(data.frames[0].slots[0].tag(), Tag::Virtual(0));
            }
            other => panic!("unexpected descr {:?}", other),
        }
    }

    #[test]
    fn test_virtual_array() {
        let mut table = DescrTable::new();
        let ints = table.array("ints", Kind::Int);
        let mut b = TraceBuilder::new();
        let i0 = b.input(Kind::Int);
        let arr = b.op_descr(Opcode::NewArray, &[Operand::int(3)], Some(Descr::Array(ints.clone()))).unwrap();
        b.op_descr(Opcode::SetarrayitemGc, &[arr, Operand::int(1), i0], Some(Descr::Array(ints.clone())));
        let item = b.op_descr(Opcode::GetarrayitemGc, &[arr, Operand::int(1)], Some(Descr::Array(ints.clone()))).unwrap();
        let untouched = b.op_descr(Opcode::GetarrayitemGc, &[arr, Operand::int(2)], Some(Descr::Array(ints.clone()))).unwrap();
        let len = b.op_descr(Opcode::ArraylenGc, &[arr], Some(Descr::Array(ints))).unwrap();
        let trace = b.finish(&[item, untouched, len]);
        let out = optimize_bridge(&trace, &params()).unwrap().trace;
        assert_eq!(opcodes(&out), vec![Opcode::Finish]);
        assert_eq!(out.ops[0].args.as_slice(), &[i0, Operand::int(0), Operand::int(3)]);
    }

    #[test]
    fn test_nested_virtuals_forced_together() {
        let mut table = DescrTable::new();
        let size = table.size("Node", None, 1);
        let next = table.field("Node.next", Kind::Ref, 0);
        let mut b = TraceBuilder::new();
        b.input(Kind::Int);
        let inner = b.op_descr(Opcode::New, &[], Some(Descr::Size(size.clone()))).unwrap();
        let outer = b.op_descr(Opcode::New, &[], Some(Descr::Size(size))).unwrap();
        b.op_descr(Opcode::SetfieldGc, &[outer, inner], Some(Descr::Field(next)));
        let trace = b.finish(&[outer]);
        let out = optimize_bridge(&trace, &params()).unwrap().trace;
        assert_eq!(opcodes(&out), vec![Opcode::New, Opcode::New, Opcode::SetfieldGc, Opcode::Finish]);
        assert_eq!(out.ops[2].arg(1), inner);
    }

    #[test]
    fn test_every_escaping_argument_is_forced() {
        let mut table = DescrTable::new();
        let size = table.size("Box", None, 1);
        let value = table.field("Box.value", Kind::Int, 0);
        let mut b = TraceBuilder::new();
        let i0 = b.input(Kind::Int);
        let first = b.op_descr(Opcode::New, &[], Some(Descr::Size(size.clone()))).unwrap();
        let second = b.op_descr(Opcode::New, &[], Some(Descr::Size(size))).unwrap();
        b.op_descr(Opcode::SetfieldGc, &[second, i0], Some(Descr::Field(value)));
        let trace = b.finish(&[first, i0, second]);
        let out = optimize_bridge(&trace, &params()).unwrap().trace;
        assert_eq!(opcodes(&out), vec![Opcode::New, Opcode::New, Opcode::SetfieldGc, Opcode::Finish]);
        assert_eq!(out.ops[3].args.as_slice(), &[first, i0, second]);
        assert_eq!(out.ops[2].arg(0), second);
    }
}
