//! JIT Integration Tests: Calls
//!
//! Inlining, residual calls, calls into compiled functions, builtins and
//! exceptions raised from compiled code.

use super::test_utils::*;
use strand_core::Value;
use strand_jit::{CodeId, JitParams, Opcode};
use strand_vm::{
    entry_greens, Builtin, CodeBuilder, Instr, Program, VmError, MAX_COMPILED_NESTING, MAX_RECURSION_DEPTH,
};

/// `sum(i * i for i < n)`
fn sum_of_squares(n: i64) -> i64 {
    (0..n).map(|i| i * i).sum()
}

// =============================================================================
// Inlining
// =============================================================================

#[test]
fn test_calls_are_inlined() {
    let (program, total, _) = call_program(add_square);
    let (mut vm, backend) = jit_vm(program);
    assert_eq!(call_repeatedly(&mut vm, total, &[Value::int(100)], 3), Value::int(sum_of_squares(100)));

    let trace = loop_trace(&vm, &backend, total, CALL_HEADER).expect("loop compiled");
    assert_eq!(count_ops(&trace, Opcode::Call), 0);
    assert_eq!(count_ops(&trace, Opcode::CallAssembler), 0);
    assert!(count_ops(&trace, Opcode::IntMulOvf) >= 1);
}

#[test]
fn test_never_inline_leaves_a_call() {
    let (program, total, square) = call_program(add_square);
    let (mut vm, backend) = jit_vm(program);
    vm.jit_driver().set_never_inline(square);
    assert!(!vm.runtime().can_inline(vm.driver(), &entry_greens(square)));
    assert_eq!(call_repeatedly(&mut vm, total, &[Value::int(100)], 3), Value::int(sum_of_squares(100)));

    let trace = loop_trace(&vm, &backend, total, CALL_HEADER).expect("loop compiled");
    let calls = count_ops(&trace, Opcode::Call) + count_ops(&trace, Opcode::CallAssembler);
    assert!(calls >= 1);
}

#[test]
fn test_inlining_switched_off() {
    let (program, total, _) = call_program(add_square);
    let mut params = JitParams::for_testing();
    params.inlining = false;
    let (mut vm, backend) = jit_vm_with(program, params);
    assert_eq!(call_repeatedly(&mut vm, total, &[Value::int(60)], 4), Value::int(sum_of_squares(60)));
    let trace = loop_trace(&vm, &backend, total, CALL_HEADER).expect("loop compiled");
    assert_eq!(count_ops(&trace, Opcode::IntMulOvf), 0);
}

#[test]
fn test_compiled_function_called_from_interpreter() {
    let mut program = Program::new();
    let square = add_square(&mut program);
    let (mut vm, _backend) = jit_vm(program);
    for x in 0..10 {
        assert_eq!(vm.call(square, &[Value::int(x)]), Ok(Value::int(x * x)));
    }
    assert!(vm.runtime().procedure_token(vm.driver(), &entry_greens(square)).is_some());
    assert_eq!(vm.call(square, &[Value::int(-7)]), Ok(Value::int(49)));
}

#[test]
fn test_too_long_inlined_callee_is_left_out() {
    let (program, total, long) = call_program(|p| add_long(p, 40));
    let mut params = JitParams::for_testing();
    params.trace_limit = 50;
    let (mut vm, _backend) = jit_vm_with(program.clone(), params);
    let mut plain = plain_vm(program);
    for _ in 0..6 {
        assert_eq!(vm.call(total, &[Value::int(30)]), plain.call(total, &[Value::int(30)]));
    }
    assert!(!vm.runtime().can_inline(vm.driver(), &entry_greens(long)));
    assert!(vm.runtime().stats().aborts >= 1);
    assert!(vm.runtime().stats().loops_compiled >= 1);
}

#[test]
fn test_recursion() {
    // fact(n) = n <= 1 ? 1 : n * fact(n - 1)
    // r0 n, r1 one, r2 cond, r3 m, r4 sub
    let mut program = Program::new();
    let fact_id = program.next_code_id();
    let mut b = CodeBuilder::new("fact", 1, 5);
    b.emit(Instr::LoadConst { dst: 1, value: 1 });
    b.emit(Instr::Le { dst: 2, a: 0, b: 1 });
    let base = b.emit(Instr::JumpIfFalse { cond: 2, target: 0 });
    b.emit(Instr::Return { src: 1 });
    let rec = b.emit(Instr::Sub { dst: 3, a: 0, b: 1 });
    b.emit(Instr::Call {
        dst: 4,
        func: fact_id,
        args: [3].into_iter().collect(),
    });
    b.emit(Instr::Mul { dst: 4, a: 0, b: 4 });
    b.emit(Instr::Return { src: 4 });
    b.patch_jump(base, rec);
    let fact = program.add_code(b);

    let (mut vm, _backend) = jit_vm(program);
    for _ in 0..5 {
        assert_eq!(vm.call(fact, &[Value::int(10)]), Ok(Value::int(3_628_800)));
    }
    assert_eq!(vm.call(fact, &[Value::int(5)]), Ok(Value::int(120)));
    // The limit is hit on the way down, before any multiplication.
    assert_eq!(
        vm.call(fact, &[Value::int(MAX_RECURSION_DEPTH as i64 * 5)]),
        Err(VmError::RecursionLimit)
    );
}

/// `rsum(n) = n <= 0 ? 0 : n + rsum(n - 1)`
fn add_recursive_sum(program: &mut Program) -> CodeId {
    // r0 n, r1 zero, r2 cond, r3 m, r4 sub, r5 one
    let rsum_id = program.next_code_id();
    let mut b = CodeBuilder::new("rsum", 1, 6);
    b.emit(Instr::LoadConst { dst: 1, value: 0 });
    b.emit(Instr::LoadConst { dst: 5, value: 1 });
    b.emit(Instr::Le { dst: 2, a: 0, b: 1 });
    let base = b.emit(Instr::JumpIfFalse { cond: 2, target: 0 });
    b.emit(Instr::Return { src: 1 });
    let rec = b.emit(Instr::Sub { dst: 3, a: 0, b: 5 });
    b.emit(Instr::Call {
        dst: 4,
        func: rsum_id,
        args: [3].into_iter().collect(),
    });
    b.emit(Instr::Add { dst: 4, a: 0, b: 4 });
    b.emit(Instr::Return { src: 4 });
    b.patch_jump(base, rec);
    program.add_code(b)
}

#[test]
fn test_recursion_limit_through_compiled_calls() {
    let mut program = Program::new();
    let rsum = add_recursive_sum(&mut program);
    let deep = [Value::int(MAX_RECURSION_DEPTH as i64 * 5)];
    let mut plain = plain_vm(program.clone());
    assert_eq!(plain.call(rsum, &deep), Err(VmError::RecursionLimit));

    let (mut vm, _backend) = jit_vm(program);
    for _ in 0..5 {
        assert_eq!(vm.call(rsum, &[Value::int(10)]), Ok(Value::int(55)));
    }
    assert!(vm.runtime().procedure_token(vm.driver(), &entry_greens(rsum)).is_some());
    assert_eq!(vm.call(rsum, &deep), Err(VmError::RecursionLimit));

    // Recursion below the limit still completes, deeper than compiled
    // code is ever nested.
    let n = (MAX_RECURSION_DEPTH / 2) as i64;
    let expected = plain.call(rsum, &[Value::int(n)]);
    assert_eq!(expected, Ok(Value::int(n * (n + 1) / 2)));
    assert!(n as usize > MAX_COMPILED_NESTING);
    assert_eq!(vm.call(rsum, &[Value::int(n)]), expected);
    assert_eq!(vm.call(rsum, &[Value::int(10)]), Ok(Value::int(55)));
}

// =============================================================================
// Builtins and exceptions
// =============================================================================

#[test]
fn test_pure_builtin_calls() {
    let (program, total, _) = call_program(|p| add_builtin_call(p, Builtin::Abs));
    let (mut vm, _backend) = jit_vm(program);
    let expected: i64 = (0..80).sum();
    assert_eq!(call_repeatedly(&mut vm, total, &[Value::int(80)], 3), Value::int(expected));
    assert!(vm.runtime().stats().loops_compiled >= 1);
}

#[test]
fn test_exception_from_compiled_code() {
    // i = n; loop: check(i); i -= 1
    // r0 n, r1 i, r2 one, r3 checked
    let mut program = Program::new();
    let mut b = CodeBuilder::new("countdown", 1, 4);
    b.emit(Instr::Move { dst: 1, src: 0 });
    b.emit(Instr::LoadConst { dst: 2, value: 1 });
    let header = b.emit(Instr::LoopHeader);
    b.emit(Instr::CallBuiltin {
        dst: 3,
        builtin: Builtin::Check,
        arg: 1,
    });
    b.emit(Instr::Sub { dst: 1, a: 1, b: 2 });
    b.emit(Instr::Jump { target: header });
    let countdown = program.add_code(b);

    let (mut vm, _backend) = jit_vm(program);
    for _ in 0..4 {
        assert_eq!(vm.call(countdown, &[Value::int(40)]), Err(VmError::Raised(Value::int(0))));
    }
    assert!(vm.runtime().stats().loops_compiled >= 1);
    assert!(vm.runtime().stats().guard_failures >= 1);
}

#[test]
fn test_exception_through_residual_call() {
    let (program, total, check) = call_program(|p| add_builtin_call(p, Builtin::Check));
    let (mut vm, _backend) = jit_vm(program);
    vm.jit_driver().set_never_inline(check);
    // check(0) raises on the very first iteration.
    assert_eq!(vm.call(total, &[Value::int(5)]), Err(VmError::Raised(Value::int(0))));
    assert_eq!(vm.call(check, &[Value::int(3)]), Ok(Value::int(3)));
}

#[test]
fn test_wrong_argument_count() {
    let (program, sum) = sum_program();
    let mut vm = plain_vm(program);
    assert!(matches!(vm.call(sum, &[]), Err(VmError::TypeError(_))));
    assert!(matches!(vm.call(7, &[]), Err(VmError::Undefined { what: "code", index: 7 })));
}
