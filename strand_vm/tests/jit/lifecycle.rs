//! JIT Integration Tests: Lifecycle
//!
//! Keys that must not be traced, loops evicted by the memory manager,
//! backends out of code memory and forked processes.

use std::sync::Arc;

use super::test_utils::*;
use strand_core::Value;
use strand_jit::backend::TraceBackend;
use strand_jit::{JitParams, JitRuntime};
use strand_vm::{loop_greens, CodeBuilder, Instr, Program, Vm};

// =============================================================================
// dont_trace_here
// =============================================================================

#[test]
fn test_printing_loop_is_never_compiled() {
    // for i in 0..n: print(i)
    // r0 n, r1 i, r2 cond, r3 one
    let mut program = Program::new();
    let mut b = CodeBuilder::new("show", 1, 4);
    b.emit(Instr::LoadConst { dst: 1, value: 0 });
    b.emit(Instr::LoadConst { dst: 3, value: 1 });
    let header = b.emit(Instr::LoopHeader);
    b.emit(Instr::Lt { dst: 2, a: 1, b: 0 });
    let exit = b.emit(Instr::JumpIfFalse { cond: 2, target: 0 });
    b.emit(Instr::Print { src: 1 });
    b.emit(Instr::Add { dst: 1, a: 1, b: 3 });
    b.emit(Instr::Jump { target: header });
    let end = b.emit(Instr::Return { src: 1 });
    b.patch_jump(exit, end);
    let show = program.add_code(b);

    let (mut vm, _backend) = jit_vm(program);
    assert_eq!(call_repeatedly(&mut vm, show, &[Value::int(20)], 2), Value::int(20));
    assert_eq!(vm.output().len(), 40);
    assert_eq!(vm.output()[19], Value::int(19));

    let cell = vm
        .runtime()
        .jit_cell_at_key(vm.driver(), &loop_greens(show, header as usize))
        .unwrap();
    assert!(cell.dont_trace_here);
    let stats = vm.runtime().stats();
    assert_eq!(stats.loops_compiled, 0);
    assert_eq!(stats.traces_started, 1);
}

// =============================================================================
// Memory management
// =============================================================================

#[test]
fn test_unused_loops_are_freed() {
    let mut program = Program::new();
    let sums: Vec<_> = (0..6).map(|i| add_sum(&mut program, &format!("sum{}", i))).collect();
    let mut params = JitParams::for_testing();
    params.loop_longevity = 2;
    let (mut vm, backend) = jit_vm_with(program, params);

    for sum in &sums {
        assert_eq!(vm.call(*sum, &[Value::int(100)]), Ok(Value::int(4950)));
    }
    let stats = vm.runtime().stats();
    assert!(stats.loops_compiled >= 2);
    assert!(stats.tokens_freed >= 1, "{:?}", stats);
    assert!(backend.num_loops() < stats.loops_compiled as usize);

    // Freed loops are simply traced again.
    assert_eq!(vm.call(sums[0], &[Value::int(100)]), Ok(Value::int(4950)));
}

#[test]
fn test_loops_live_forever_without_longevity() {
    let mut program = Program::new();
    let sums: Vec<_> = (0..4).map(|i| add_sum(&mut program, &format!("sum{}", i))).collect();
    let mut params = JitParams::for_testing();
    params.loop_longevity = 0;
    let (mut vm, _backend) = jit_vm_with(program, params);
    for sum in &sums {
        vm.call(*sum, &[Value::int(100)]).unwrap();
    }
    assert_eq!(vm.runtime().stats().tokens_freed, 0);
    assert_eq!(vm.runtime().num_loops() as u64, vm.runtime().stats().loops_compiled);
}

#[test]
fn test_backend_out_of_memory() {
    let (program, sum) = sum_program();
    let runtime = Arc::new(JitRuntime::new(
        Arc::new(TraceBackend::with_op_budget(0)),
        JitParams::for_testing(),
    ));
    let mut vm = Vm::new(program, runtime);
    for _ in 0..3 {
        assert_eq!(vm.call(sum, &[Value::int(100)]), Ok(Value::int(4950)));
    }
    let stats = vm.runtime().stats();
    assert_eq!(stats.loops_compiled, 0);
    assert!(stats.aborts >= 1);

    let cell = vm
        .runtime()
        .jit_cell_at_key(vm.driver(), &loop_greens(sum, SUM_HEADER))
        .unwrap();
    assert!(!cell.dont_trace_here);
}

#[test]
fn test_jit_keeps_working_after_fork() {
    let (program, sum) = sum_program();
    let (mut vm, _backend) = jit_vm(program);
    vm.runtime().after_fork();
    assert_eq!(call_repeatedly(&mut vm, sum, &[Value::int(100)], 2), Value::int(4950));
    assert!(vm.runtime().stats().loops_compiled >= 1);
}

#[test]
fn test_two_vms_share_a_runtime() {
    let runtime = Arc::new(JitRuntime::for_testing());
    let (program, sum) = sum_program();
    let mut first = Vm::new(program.clone(), runtime.clone());
    let mut second = Vm::new(program, runtime.clone());
    assert_ne!(first.driver(), second.driver());

    assert_eq!(first.call(sum, &[Value::int(100)]), Ok(Value::int(4950)));
    assert_eq!(second.call(sum, &[Value::int(100)]), Ok(Value::int(4950)));
    assert!(runtime.stats().loops_compiled >= 2);
}
