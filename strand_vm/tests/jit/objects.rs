//! JIT Integration Tests: Objects
//!
//! Allocation removal, field access, class guards and arrays.

use super::test_utils::*;
use strand_core::{Kind, Value};
use strand_jit::Opcode;
use strand_vm::{CodeBuilder, Instr, Program, VmError};

// =============================================================================
// Virtuals
// =============================================================================

#[test]
fn test_short_lived_objects_are_not_allocated() {
    let (program, points, _) = points_program();
    let (mut vm, backend) = jit_vm(program);
    assert_eq!(call_repeatedly(&mut vm, points, &[Value::int(100)], 3), Value::int(4950));

    let trace = loop_trace(&vm, &backend, points, POINTS_HEADER).expect("loop compiled");
    assert_eq!(count_ops(&trace, Opcode::NewWithVtable), 0);
    assert_eq!(count_ops(&trace, Opcode::GetfieldGc), 0);
    assert_eq!(count_ops(&trace, Opcode::GuardClass), 0);
}

#[test]
fn test_compiled_loop_allocates_less() {
    let (program, points, _) = points_program();
    let mut plain = plain_vm(program.clone());
    plain.call(points, &[Value::int(500)]).unwrap();
    let interpreted = plain.heap().len();

    let (mut vm, _backend) = jit_vm(program);
    vm.call(points, &[Value::int(500)]).unwrap();
    assert!(vm.heap().len() < interpreted);
}

#[test]
fn test_escaping_objects_keep_their_fields() {
    // r0 n, r1 i, r2 head, r3 node, r4 cond, r5 one, r6 walk, r7 acc, r8 value
    let mut program = Program::new();
    let node = program.add_class("Node", &[("value", Kind::Int), ("next", Kind::Ref)]);
    let mut b = CodeBuilder::new("build", 1, 9);
    b.emit(Instr::LoadConst { dst: 1, value: 0 });
    b.emit(Instr::LoadNull { dst: 2 });
    b.emit(Instr::LoadConst { dst: 5, value: 1 });
    let build = b.emit(Instr::LoopHeader);
    b.emit(Instr::Lt { dst: 4, a: 1, b: 0 });
    let built = b.emit(Instr::JumpIfFalse { cond: 4, target: 0 });
    b.emit(Instr::New { dst: 3, class: node });
    b.emit(Instr::SetField { obj: 3, field: 0, src: 1 });
    b.emit(Instr::SetField { obj: 3, field: 1, src: 2 });
    b.emit(Instr::Move { dst: 2, src: 3 });
    b.emit(Instr::Add { dst: 1, a: 1, b: 5 });
    b.emit(Instr::Jump { target: build });
    let walk_start = b.emit(Instr::Move { dst: 6, src: 2 });
    b.emit(Instr::LoadConst { dst: 7, value: 0 });
    let walk = b.emit(Instr::LoopHeader);
    let done = b.emit(Instr::JumpIfFalse { cond: 6, target: 0 });
    b.emit(Instr::GetField { dst: 8, obj: 6, field: 0 });
    b.emit(Instr::Add { dst: 7, a: 7, b: 8 });
    b.emit(Instr::GetField { dst: 6, obj: 6, field: 1 });
    b.emit(Instr::Jump { target: walk });
    let end = b.emit(Instr::Return { src: 7 });
    b.patch_jump(built, walk_start);
    b.patch_jump(done, end);
    let list = program.add_code(b);

    let (mut vm, backend) = jit_vm(program.clone());
    let mut plain = plain_vm(program);
    for n in [0, 10, 100, 100] {
        assert_eq!(vm.call(list, &[Value::int(n)]), plain.call(list, &[Value::int(n)]));
    }
    assert_eq!(vm.call(list, &[Value::int(100)]), Ok(Value::int(4950)));
    assert!(loop_trace(&vm, &backend, list, walk as usize).is_some());
}

#[test]
fn test_field_access_through_null() {
    let mut program = Program::new();
    program.add_class("Cell", &[("v", Kind::Int)]);
    let mut b = CodeBuilder::new("deref", 0, 2);
    b.emit(Instr::LoadNull { dst: 0 });
    b.emit(Instr::GetField { dst: 1, obj: 0, field: 0 });
    b.emit(Instr::Return { src: 1 });
    let deref = program.add_code(b);
    let mut vm = plain_vm(program);
    assert_eq!(vm.call(deref, &[]), Err(VmError::NullReference { code: deref, pc: 1 }));
}

#[test]
fn test_isinstance() {
    // r0 obj, r1 result
    let mut program = Program::new();
    let a = program.add_class("A", &[]);
    let b_class = program.add_class("B", &[]);
    let mut b = CodeBuilder::new("is_a", 1, 2);
    b.emit(Instr::IsInstance { dst: 1, obj: 0, class: a });
    b.emit(Instr::Return { src: 1 });
    let is_a = program.add_code(b);
    let mut b = CodeBuilder::new("make", 1, 2);
    b.emit(Instr::JumpIfFalse { cond: 0, target: 3 });
    b.emit(Instr::New { dst: 1, class: a });
    b.emit(Instr::Return { src: 1 });
    b.emit(Instr::New { dst: 1, class: b_class });
    b.emit(Instr::Return { src: 1 });
    let make = program.add_code(b);

    let (mut vm, _backend) = jit_vm(program);
    for _ in 0..10 {
        let obj_a = vm.call(make, &[Value::int(1)]).unwrap();
        let obj_b = vm.call(make, &[Value::int(0)]).unwrap();
        assert_eq!(vm.call(is_a, &[obj_a]), Ok(Value::int(1)));
        assert_eq!(vm.call(is_a, &[obj_b]), Ok(Value::int(0)));
        assert_eq!(vm.call(is_a, &[Value::NULL]), Ok(Value::int(0)));
    }
    assert!(vm.runtime().stats().loops_compiled >= 1);
}

// =============================================================================
// Arrays
// =============================================================================

#[test]
fn test_array_loops() {
    let (program, fill) = array_program();
    let (mut vm, backend) = jit_vm(program);
    for n in [1, 10, 100, 100] {
        let expected = n * (n - 1) * (2 * n - 1) / 6;
        assert_eq!(vm.call(fill, &[Value::int(n)]), Ok(Value::int(expected)));
    }
    let trace = loop_trace(&vm, &backend, fill, ARRAY_HEADER).expect("fill loop compiled");
    assert!(count_ops(&trace, Opcode::SetarrayitemGc) >= 1);
}

#[test]
fn test_array_index_out_of_range() {
    // r0 n, r1 a, r2 item
    let mut program = Program::new();
    let mut b = CodeBuilder::new("oob", 1, 3);
    b.emit(Instr::NewArray { dst: 1, len: 0 });
    b.emit(Instr::GetItem { dst: 2, array: 1, index: 0 });
    b.emit(Instr::Return { src: 2 });
    let oob = program.add_code(b);
    let mut vm = plain_vm(program);
    assert_eq!(vm.call(oob, &[Value::int(4)]), Err(VmError::IndexError { index: 4, length: 4 }));
}
