//! Interpreter vs. JIT Benchmarks
//!
//! Runs the same bytecode with tracing disabled and with the JIT warmed
//! up, on the reference backend.
//!
//! # Benchmark Categories
//!
//! 1. **Counting loop**: integer arithmetic and one exit guard
//! 2. **Boxed points**: an allocation per iteration that never escapes
//! 3. **Calls**: a small function called from the loop body

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use strand_core::{Kind, Value};
use strand_jit::{CodeId, JitParams};
use strand_vm::{CodeBuilder, Instr, Program, Vm};

// =============================================================================
// Programs
// =============================================================================

fn counting_loop(program: &mut Program) -> CodeId {
    // r0 n, r1 i, r2 acc, r3 cond, r4 one
    let mut b = CodeBuilder::new("sum", 1, 5);
    b.emit(Instr::LoadConst { dst: 1, value: 0 });
    b.emit(Instr::LoadConst { dst: 2, value: 0 });
    b.emit(Instr::LoadConst { dst: 4, value: 1 });
    let header = b.emit(Instr::LoopHeader);
    b.emit(Instr::Lt { dst: 3, a: 1, b: 0 });
    let exit = b.emit(Instr::JumpIfFalse { cond: 3, target: 0 });
    b.emit(Instr::Add { dst: 2, a: 2, b: 1 });
    b.emit(Instr::Add { dst: 1, a: 1, b: 4 });
    b.emit(Instr::Jump { target: header });
    let end = b.emit(Instr::Return { src: 2 });
    b.patch_jump(exit, end);
    program.add_code(b)
}

fn boxed_points(program: &mut Program) -> CodeId {
    // r0 n, r1 i, r2 acc, r3 cond, r4 one, r5 point, r6 x
    let point = program.add_class("Point", &[("x", Kind::Int)]);
    let mut b = CodeBuilder::new("points", 1, 7);
    b.emit(Instr::LoadConst { dst: 1, value: 0 });
    b.emit(Instr::LoadConst { dst: 2, value: 0 });
    b.emit(Instr::LoadConst { dst: 4, value: 1 });
    let header = b.emit(Instr::LoopHeader);
    b.emit(Instr::Lt { dst: 3, a: 1, b: 0 });
    let exit = b.emit(Instr::JumpIfFalse { cond: 3, target: 0 });
    b.emit(Instr::New { dst: 5, class: point });
    b.emit(Instr::SetField { obj: 5, field: 0, src: 1 });
    b.emit(Instr::GetField { dst: 6, obj: 5, field: 0 });
    b.emit(Instr::Add { dst: 2, a: 2, b: 6 });
    b.emit(Instr::Add { dst: 1, a: 1, b: 4 });
    b.emit(Instr::LoadNull { dst: 5 });
    b.emit(Instr::Jump { target: header });
    let end = b.emit(Instr::Return { src: 2 });
    b.patch_jump(exit, end);
    program.add_code(b)
}

fn calls(program: &mut Program) -> CodeId {
    let mut b = CodeBuilder::new("double", 1, 2);
    b.emit(Instr::Add { dst: 1, a: 0, b: 0 });
    b.emit(Instr::Return { src: 1 });
    let double = program.add_code(b);

    // r0 n, r1 i, r2 acc, r3 cond, r4 one, r5 result
    let mut b = CodeBuilder::new("calls", 1, 6);
    b.emit(Instr::LoadConst { dst: 1, value: 0 });
    b.emit(Instr::LoadConst { dst: 2, value: 0 });
    b.emit(Instr::LoadConst { dst: 4, value: 1 });
    let header = b.emit(Instr::LoopHeader);
    b.emit(Instr::Lt { dst: 3, a: 1, b: 0 });
    let exit = b.emit(Instr::JumpIfFalse { cond: 3, target: 0 });
    b.emit(Instr::Call {
        dst: 5,
        func: double,
        args: [1].into_iter().collect(),
    });
    b.emit(Instr::Add { dst: 2, a: 2, b: 5 });
    b.emit(Instr::Add { dst: 1, a: 1, b: 4 });
    b.emit(Instr::Jump { target: header });
    let end = b.emit(Instr::Return { src: 2 });
    b.patch_jump(exit, end);
    program.add_code(b)
}

// =============================================================================
// Benchmarks
// =============================================================================

fn bench_program(c: &mut Criterion, name: &str, build: fn(&mut Program) -> CodeId) {
    const N: i64 = 10_000;
    let mut group = c.benchmark_group(name);
    group.throughput(Throughput::Elements(N as u64));

    for (label, params) in [("interpreted", JitParams::disabled()), ("jit", JitParams::for_testing())] {
        let mut program = Program::new();
        let entry = build(&mut program);
        let mut vm = Vm::with_params(program, params);
        // Warm up so the measured calls run compiled code.
        for _ in 0..5 {
            let _ = vm.call(entry, &[Value::int(N)]);
        }
        group.bench_with_input(BenchmarkId::new(label, N), &N, |b, &n| {
            b.iter(|| vm.call(entry, &[black_box(Value::int(n))]))
        });
    }
    group.finish();
}

fn bench_counting_loop(c: &mut Criterion) {
    bench_program(c, "counting_loop", counting_loop);
}

fn bench_boxed_points(c: &mut Criterion) {
    bench_program(c, "boxed_points", boxed_points);
}

fn bench_calls(c: &mut Criterion) {
    bench_program(c, "calls", calls);
}

criterion_group!(benches, bench_counting_loop, bench_boxed_points, bench_calls);
criterion_main!(benches);
