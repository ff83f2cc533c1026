//! JIT Integration Tests: Loops
//!
//! Counting loops, nested loops, loop exits and bridges.

use super::test_utils::*;
use strand_core::Value;
use strand_jit::{JitParams, Opcode, Operand};
use strand_vm::{loop_greens, CodeBuilder, Instr, Program, VmError};

// =============================================================================
// Simple Loops
// =============================================================================

#[test]
fn test_interpreter_sum() {
    let (program, sum) = sum_program();
    let mut vm = plain_vm(program);
    assert_eq!(vm.call(sum, &[Value::int(10)]), Ok(Value::int(45)));
    assert_eq!(vm.call(sum, &[Value::int(0)]), Ok(Value::int(0)));
    assert_eq!(vm.runtime().stats().traces_started, 0);
}

#[test]
fn test_jit_sum_matches_interpreter() {
    let (program, sum) = sum_program();
    let (mut vm, backend) = jit_vm(program);
    for n in [0, 1, 5, 100, 1000] {
        let expected = n * (n - 1) / 2;
        assert_eq!(vm.call(sum, &[Value::int(n)]), Ok(Value::int(expected.max(0))));
    }
    let stats = vm.runtime().stats();
    assert!(stats.loops_compiled >= 1);
    assert!(stats.executions >= 1);
    assert!(loop_trace(&vm, &backend, sum, SUM_HEADER).is_some());
}

#[test]
fn test_loop_compiled_within_first_call() {
    let (program, sum) = sum_program();
    let (mut vm, _backend) = jit_vm(program);
    assert_eq!(vm.call(sum, &[Value::int(50)]), Ok(Value::int(1225)));
    let cell = vm
        .runtime()
        .jit_cell_at_key(vm.driver(), &loop_greens(sum, SUM_HEADER))
        .unwrap();
    assert!(cell.is_compiled());
    assert!(vm.runtime().stats().guard_failures >= 1);
}

#[test]
fn test_compiled_loop_overflow_raises() {
    // x doubles until it overflows.
    let mut program = Program::new();
    let mut b = CodeBuilder::new("grow", 1, 4);
    b.emit(Instr::LoadConst { dst: 1, value: 1 });
    b.emit(Instr::LoadConst { dst: 2, value: 2 });
    let header = b.emit(Instr::LoopHeader);
    b.emit(Instr::Mul { dst: 1, a: 1, b: 2 });
    b.emit(Instr::Jump { target: header });
    let grow = program.add_code(b);
    let (mut vm, _backend) = jit_vm(program);
    assert_eq!(vm.call(grow, &[Value::int(0)]), Err(VmError::Overflow("mul")));
    assert!(vm.runtime().stats().loops_compiled >= 1);
}

#[test]
fn test_optimizer_passes_can_be_disabled() {
    let (program, sum) = sum_program();
    let mut params = JitParams::for_testing();
    params.enable_opts = strand_jit::EnableOpts::none();
    let (mut vm, backend) = jit_vm_with(program, params);
    assert_eq!(call_repeatedly(&mut vm, sum, &[Value::int(200)], 3), Value::int(19900));
    let trace = loop_trace(&vm, &backend, sum, SUM_HEADER).expect("loop compiled");
    assert!(count_ops(&trace, Opcode::GuardNoOverflow) >= 2);
}

// =============================================================================
// Promotion
// =============================================================================

#[test]
fn test_promoted_value_is_constant_folded() {
    // for i in 0..n: promote(x); acc += x + 1
    // r0 n, r1 x, r2 i, r3 acc, r4 cond, r5 one, r6 z
    let mut program = Program::new();
    let mut b = CodeBuilder::new("promoted", 2, 7);
    b.emit(Instr::LoadConst { dst: 2, value: 0 });
    b.emit(Instr::LoadConst { dst: 3, value: 0 });
    let header = b.emit(Instr::LoopHeader);
    b.emit(Instr::Lt { dst: 4, a: 2, b: 0 });
    let exit = b.emit(Instr::JumpIfFalse { cond: 4, target: 0 });
    b.emit(Instr::Promote { reg: 1 });
    b.emit(Instr::LoadConst { dst: 5, value: 1 });
    b.emit(Instr::Add { dst: 6, a: 1, b: 5 });
    b.emit(Instr::Add { dst: 3, a: 3, b: 6 });
    b.emit(Instr::Add { dst: 2, a: 2, b: 5 });
    b.emit(Instr::Jump { target: header });
    let end = b.emit(Instr::Return { src: 3 });
    b.patch_jump(exit, end);
    let promoted = program.add_code(b);

    let (mut vm, backend) = jit_vm(program);
    let seven = [Value::int(100), Value::int(7)];
    assert_eq!(call_repeatedly(&mut vm, promoted, &seven, 2), Value::int(800));

    let trace = loop_trace(&vm, &backend, promoted, header as usize).expect("loop compiled");
    assert!(trace
        .ops
        .iter()
        .any(|op| op.opcode == Opcode::GuardValue && op.arg(1) == Operand::int(7)));
    // z = x + 1 is the constant 8 in the compiled loop.
    assert!(trace.ops.iter().any(|op| op.args.contains(&Operand::int(8))));

    // Another value fails guard_value and the interpreter takes over.
    let failures = vm.runtime().stats().guard_failures;
    assert_eq!(vm.call(promoted, &[Value::int(100), Value::int(8)]), Ok(Value::int(900)));
    assert!(vm.runtime().stats().guard_failures > failures);
    for _ in 0..3 {
        assert_eq!(vm.call(promoted, &[Value::int(100), Value::int(8)]), Ok(Value::int(900)));
    }
    assert_eq!(vm.call(promoted, &seven), Ok(Value::int(800)));
}

// =============================================================================
// Nested Loops
// =============================================================================

#[test]
fn test_nested_loops() {
    // for i in 0..n: for j in 0..i: acc += 1
    // r0 n, r1 i, r2 j, r3 acc, r4 cond, r5 one
    let mut program = Program::new();
    let mut b = CodeBuilder::new("triangle", 1, 6);
    b.emit(Instr::LoadConst { dst: 1, value: 0 });
    b.emit(Instr::LoadConst { dst: 3, value: 0 });
    b.emit(Instr::LoadConst { dst: 5, value: 1 });
    let outer = b.emit(Instr::LoopHeader);
    b.emit(Instr::Lt { dst: 4, a: 1, b: 0 });
    let outer_exit = b.emit(Instr::JumpIfFalse { cond: 4, target: 0 });
    b.emit(Instr::LoadConst { dst: 2, value: 0 });
    let inner = b.emit(Instr::LoopHeader);
    b.emit(Instr::Lt { dst: 4, a: 2, b: 1 });
    let inner_exit = b.emit(Instr::JumpIfFalse { cond: 4, target: 0 });
    b.emit(Instr::Add { dst: 3, a: 3, b: 5 });
    b.emit(Instr::Add { dst: 2, a: 2, b: 5 });
    b.emit(Instr::Jump { target: inner });
    let inner_done = b.emit(Instr::Add { dst: 1, a: 1, b: 5 });
    b.emit(Instr::Jump { target: outer });
    let end = b.emit(Instr::Return { src: 3 });
    b.patch_jump(outer_exit, end);
    b.patch_jump(inner_exit, inner_done);
    let triangle = program.add_code(b);

    let (mut vm, backend) = jit_vm(program.clone());
    let mut plain = plain_vm(program);
    for n in [3, 10, 40, 40, 40] {
        assert_eq!(vm.call(triangle, &[Value::int(n)]), plain.call(triangle, &[Value::int(n)]));
    }
    assert!(loop_trace(&vm, &backend, triangle, inner as usize).is_some());
}

// =============================================================================
// Bridges
// =============================================================================

#[test]
fn test_bridge_for_branch_taken_late() {
    let (program, split) = split_program();
    let (mut vm, backend) = jit_vm(program);
    assert_eq!(vm.call(split, &[Value::int(200)]), Ok(Value::int(50 + 150 * 2)));
    assert_eq!(vm.call(split, &[Value::int(200)]), Ok(Value::int(350)));

    let stats = vm.runtime().stats();
    assert!(stats.bridges_compiled >= 1, "{:?}", stats);
    assert!(backend.num_bridges() >= 1);
    let token = vm
        .runtime()
        .procedure_token(vm.driver(), &loop_greens(split, SPLIT_HEADER))
        .expect("loop compiled");
    assert!(vm.runtime().token(token).unwrap().bridge_count() >= 1);
}

#[test]
fn test_bridges_disabled_by_retrace_limit() {
    let (program, split) = split_program();
    let mut params = JitParams::for_testing();
    params.retrace_limit = 0;
    let (mut vm, _backend) = jit_vm_with(program, params);
    assert_eq!(call_repeatedly(&mut vm, split, &[Value::int(200)], 3), Value::int(350));
    let stats = vm.runtime().stats();
    assert_eq!(stats.bridges_compiled, 0);
    assert!(stats.guard_failures >= 2);
}

#[test]
fn test_set_params_at_runtime() {
    let (program, sum) = sum_program();
    let (mut vm, _backend) = jit_vm_with(program, JitParams::disabled());
    call_repeatedly(&mut vm, sum, &[Value::int(100)], 2);
    assert_eq!(vm.runtime().stats().traces_started, 0);

    vm.runtime().set_params("threshold=3,function_threshold=3").unwrap();
    assert_eq!(vm.runtime().get_param("threshold").unwrap(), "3");
    assert_eq!(call_repeatedly(&mut vm, sum, &[Value::int(100)], 2), Value::int(4950));
    assert!(vm.runtime().stats().loops_compiled >= 1);
}
