//! Rebuilding interpreter frames at the start of a bridge.
//!
//! The failing guard's resume data is decoded into trace operands: fail
//! args become the bridge's input boxes and every virtual is rebuilt by
//! recording its allocation and stores, which the optimizer is free to
//! virtualize again.

use std::sync::Arc;

use strand_core::{Kind, Value};

use crate::history::{ArrayDescr, BoxAllocator, BoxRef, Descr, FieldDescr, Opcode, Operand, ResOp, SizeDescr};
use crate::resume::Materializer;

/// Decodes resume data into operands, recording allocations.
pub struct SymbolicMaterializer<'a> {
    inputargs: &'a [BoxRef],
    ops: &'a mut Vec<ResOp>,
    boxes: &'a mut BoxAllocator,
}

impl<'a> SymbolicMaterializer<'a> {
    /// Materializer whose fail args are `inputargs`.
    pub fn new(inputargs: &'a [BoxRef], ops: &'a mut Vec<ResOp>, boxes: &'a mut BoxAllocator) -> Self {
        Self { inputargs, ops, boxes }
    }
}

impl Materializer for SymbolicMaterializer<'_> {
    type Item = Operand;

    fn constant(&mut self, value: Value) -> Operand {
        Operand::Const(value)
    }

    fn fail_arg(&mut self, index: usize) -> Operand {
        self.inputargs
            .get(index)
            .map_or(Operand::Const(Value::default()), |b| Operand::Box(*b))
    }

    fn allocate_struct(&mut self, size: &Arc<SizeDescr>) -> Operand {
        let result = self.boxes.fresh(Kind::Ref);
        let opcode = if size.vtable.is_some() {
            Opcode::NewWithVtable
        } else {
            Opcode::New
        };
        self.ops
            .push(ResOp::new(opcode, &[], Some(result), Some(Descr::Size(size.clone()))));
        Operand::Box(result)
    }

    fn allocate_array(&mut self, descr: &Arc<ArrayDescr>, len: usize) -> Operand {
        let result = self.boxes.fresh(Kind::Ref);
        self.ops.push(ResOp::new(
            Opcode::NewArray,
            &[Operand::int(len as i64)],
            Some(result),
            Some(Descr::Array(descr.clone())),
        ));
        Operand::Box(result)
    }

    fn set_field(&mut self, obj: Operand, field: &Arc<FieldDescr>, value: Operand) {
        self.ops.push(ResOp::new(
            Opcode::SetfieldGc,
            &[obj, value],
            None,
            Some(Descr::Field(field.clone())),
        ));
    }

    fn set_item(&mut self, array: Operand, descr: &Arc<ArrayDescr>, index: usize, value: Operand) {
        self.ops.push(ResOp::new(
            Opcode::SetarrayitemGc,
            &[array, Operand::int(index as i64), value],
            None,
            Some(Descr::Array(descr.clone())),
        ));
    }
}
