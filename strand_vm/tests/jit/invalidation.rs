//! JIT Integration Tests: Invalidation
//!
//! Globals are folded into compiled code as constants; storing to one
//! invalidates every loop that read it.

use super::test_utils::*;
use strand_core::Value;
use strand_jit::Opcode;
use strand_vm::{loop_greens, CodeBuilder, Instr, Program};

/// Loop header pc of [`scaled_sum`].
const SCALED_HEADER: usize = 3;

/// `scaled(n)`: adds `globals[slot]` to the accumulator `n` times.
fn scaled_sum(initial: i64) -> (Program, u32, u32) {
    // r0 n, r1 i, r2 acc, r3 cond, r4 one, r5 scale
    let mut program = Program::new();
    let slot = program.add_global(Value::int(initial));
    let mut b = CodeBuilder::new("scaled", 1, 6);
    b.emit(Instr::LoadConst { dst: 1, value: 0 });
    b.emit(Instr::LoadConst { dst: 2, value: 0 });
    b.emit(Instr::LoadConst { dst: 4, value: 1 });
    let header = b.emit(Instr::LoopHeader);
    b.emit(Instr::Lt { dst: 3, a: 1, b: 0 });
    let exit = b.emit(Instr::JumpIfFalse { cond: 3, target: 0 });
    b.emit(Instr::LoadGlobal { dst: 5, slot });
    b.emit(Instr::Add { dst: 2, a: 2, b: 5 });
    b.emit(Instr::Add { dst: 1, a: 1, b: 4 });
    b.emit(Instr::Jump { target: header });
    let end = b.emit(Instr::Return { src: 2 });
    b.patch_jump(exit, end);
    let code = program.add_code(b);
    (program, code, slot)
}

#[test]
fn test_global_is_folded() {
    let (program, scaled, _) = scaled_sum(3);
    let (mut vm, backend) = jit_vm(program);
    assert_eq!(call_repeatedly(&mut vm, scaled, &[Value::int(100)], 2), Value::int(300));
    let trace = loop_trace(&vm, &backend, scaled, SCALED_HEADER).expect("loop compiled");
    assert!(count_ops(&trace, Opcode::GuardNotInvalidated) >= 1);
}

#[test]
fn test_store_invalidates_compiled_loop() {
    let (program, scaled, slot) = scaled_sum(3);
    let (mut vm, _backend) = jit_vm(program);
    assert_eq!(vm.call(scaled, &[Value::int(100)]), Ok(Value::int(300)));
    let token = vm
        .runtime()
        .procedure_token(vm.driver(), &loop_greens(scaled, SCALED_HEADER))
        .expect("loop compiled");

    vm.store_global(slot as usize, Value::int(5)).unwrap();
    assert!(vm.runtime().token(token).map_or(true, |t| t.is_invalidated()));
    assert!(vm.runtime().stats().tokens_invalidated >= 1);
    assert_eq!(vm.global(slot as usize), Some(Value::int(5)));

    // Stale code is never entered; the loop gets compiled again.
    assert_eq!(vm.call(scaled, &[Value::int(100)]), Ok(Value::int(500)));
    assert_eq!(vm.call(scaled, &[Value::int(100)]), Ok(Value::int(500)));
    assert!(vm.runtime().stats().loops_compiled >= 2);
}

#[test]
fn test_store_from_guest_code() {
    let (mut program, scaled, slot) = scaled_sum(2);
    // set(v): globals[slot] = v
    let mut b = CodeBuilder::new("set", 1, 1);
    b.emit(Instr::StoreGlobal { slot, src: 0 });
    b.emit(Instr::Return { src: 0 });
    let set = program.add_code(b);

    let (mut vm, _backend) = jit_vm(program);
    for scale in 1..6 {
        vm.call(set, &[Value::int(scale)]).unwrap();
        assert_eq!(vm.call(scaled, &[Value::int(50)]), Ok(Value::int(50 * scale)));
    }
    assert!(vm.runtime().stats().tokens_invalidated >= 1);
}

#[test]
fn test_loop_storing_a_global() {
    // for i in 0..n: globals[slot] = i
    // r0 n, r1 i, r2 cond, r3 one
    let mut program = Program::new();
    let slot = program.add_global(Value::int(-1));
    let mut b = CodeBuilder::new("store_all", 1, 4);
    b.emit(Instr::LoadConst { dst: 1, value: 0 });
    b.emit(Instr::LoadConst { dst: 3, value: 1 });
    let header = b.emit(Instr::LoopHeader);
    b.emit(Instr::Lt { dst: 2, a: 1, b: 0 });
    let exit = b.emit(Instr::JumpIfFalse { cond: 2, target: 0 });
    b.emit(Instr::StoreGlobal { slot, src: 1 });
    b.emit(Instr::Add { dst: 1, a: 1, b: 3 });
    b.emit(Instr::Jump { target: header });
    let end = b.emit(Instr::Return { src: 1 });
    b.patch_jump(exit, end);
    let store_all = program.add_code(b);

    let (mut vm, _backend) = jit_vm(program);
    for n in [10, 100, 100] {
        assert_eq!(vm.call(store_all, &[Value::int(n)]), Ok(Value::int(n)));
        assert_eq!(vm.global(slot as usize), Some(Value::int(n - 1)));
    }
    assert!(vm.runtime().stats().loops_compiled >= 1);
}
