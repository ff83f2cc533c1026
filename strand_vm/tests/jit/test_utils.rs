//! Shared test utilities for JIT integration tests.

use std::sync::Arc;

use strand_core::{Kind, Value};
use strand_jit::backend::TraceBackend;
use strand_jit::{CodeId, JitParams, JitRuntime, Opcode, Trace};
use strand_vm::{loop_greens, Builtin, ClassId, CodeBuilder, Instr, Program, Vm};

// =============================================================================
// VM construction
// =============================================================================

/// Install a test subscriber; `RUST_LOG=strand_jit=debug` shows the JIT log.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A VM whose runtime compiles into a backend the test can inspect.
pub fn jit_vm_with(program: Program, params: JitParams) -> (Vm, Arc<TraceBackend>) {
    init_logging();
    let backend = Arc::new(TraceBackend::new());
    let runtime = Arc::new(JitRuntime::new(backend.clone(), params));
    (Vm::new(program, runtime), backend)
}

/// A VM with low JIT thresholds.
pub fn jit_vm(program: Program) -> (Vm, Arc<TraceBackend>) {
    jit_vm_with(program, JitParams::for_testing())
}

/// A VM that never traces.
pub fn plain_vm(program: Program) -> Vm {
    Vm::with_params(program, JitParams::disabled())
}

/// Call `func` `times` times and return the last result.
pub fn call_repeatedly(vm: &mut Vm, func: CodeId, args: &[Value], times: usize) -> Value {
    let mut result = Value::default();
    for _ in 0..times {
        result = vm.call(func, args).expect("execution failed");
    }
    result
}

/// Compiled trace attached to the loop header at `pc` of `code`.
pub fn loop_trace(vm: &Vm, backend: &TraceBackend, code: CodeId, pc: usize) -> Option<Trace> {
    let token = vm.runtime().procedure_token(vm.driver(), &loop_greens(code, pc))?;
    backend.loop_trace(token)
}

/// Number of operations with this opcode.
pub fn count_ops(trace: &Trace, opcode: Opcode) -> usize {
    trace.ops.iter().filter(|op| op.opcode == opcode).count()
}

// =============================================================================
// Programs
// =============================================================================

/// Loop header pc of [`add_sum`].
pub const SUM_HEADER: usize = 3;

/// `sum(n)`: `0 + 1 + ... + (n - 1)`.
pub fn add_sum(program: &mut Program, name: &str) -> CodeId {
    // r0 n, r1 i, r2 acc, r3 cond, r4 one
    let mut b = CodeBuilder::new(name, 1, 5);
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

/// Program holding a single [`add_sum`].
pub fn sum_program() -> (Program, CodeId) {
    let mut program = Program::new();
    let sum = add_sum(&mut program, "sum");
    (program, sum)
}

/// Loop header pc of [`split_program`].
pub const SPLIT_HEADER: usize = 5;

/// `split(n)`: adds 1 for every `i < 50` and 2 for every other `i < n`.
pub fn split_program() -> (Program, CodeId) {
    // r0 n, r1 i, r2 acc, r3 cond, r4 one, r5 fifty, r6 two, r7 low
    let mut program = Program::new();
    let mut b = CodeBuilder::new("split", 1, 8);
    b.emit(Instr::LoadConst { dst: 1, value: 0 });
    b.emit(Instr::LoadConst { dst: 2, value: 0 });
    b.emit(Instr::LoadConst { dst: 4, value: 1 });
    b.emit(Instr::LoadConst { dst: 5, value: 50 });
    b.emit(Instr::LoadConst { dst: 6, value: 2 });
    let header = b.emit(Instr::LoopHeader);
    b.emit(Instr::Lt { dst: 3, a: 1, b: 0 });
    let exit = b.emit(Instr::JumpIfFalse { cond: 3, target: 0 });
    b.emit(Instr::Lt { dst: 7, a: 1, b: 5 });
    let high = b.emit(Instr::JumpIfFalse { cond: 7, target: 0 });
    b.emit(Instr::Add { dst: 2, a: 2, b: 4 });
    let join = b.emit(Instr::Jump { target: 0 });
    let high_start = b.emit(Instr::Add { dst: 2, a: 2, b: 6 });
    let join_target = b.emit(Instr::Add { dst: 1, a: 1, b: 4 });
    b.emit(Instr::Jump { target: header });
    let end = b.emit(Instr::Return { src: 2 });
    b.patch_jump(exit, end);
    b.patch_jump(high, high_start);
    b.patch_jump(join, join_target);
    program.add_code(b);
    (program, 0)
}

/// Loop header pc of [`points_program`].
pub const POINTS_HEADER: usize = 3;

/// `points(n)`: boxes every `i` in a fresh `Point` and sums the boxes.
/// The point never outlives its iteration.
pub fn points_program() -> (Program, CodeId, ClassId) {
    // r0 n, r1 i, r2 acc, r3 cond, r4 one, r5 point, r6 x
    let mut program = Program::new();
    let point = program.add_class("Point", &[("x", Kind::Int), ("y", Kind::Int)]);
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
    let code = program.add_code(b);
    (program, code, point)
}

/// Loop header pc of [`array_program`].
pub const ARRAY_HEADER: usize = 4;

/// `fill(n)`: writes `i * i` into `a[i]`, then sums the array back
/// through a second loop.
pub fn array_program() -> (Program, CodeId) {
    // r0 n, r1 a, r2 i, r3 cond, r4 one, r5 sq, r6 acc, r7 item
    let mut program = Program::new();
    let mut b = CodeBuilder::new("fill", 1, 8);
    b.emit(Instr::NewArray { dst: 1, len: 0 });
    b.emit(Instr::LoadConst { dst: 2, value: 0 });
    b.emit(Instr::LoadConst { dst: 4, value: 1 });
    b.emit(Instr::LoadConst { dst: 6, value: 0 });
    let fill = b.emit(Instr::LoopHeader);
    b.emit(Instr::Lt { dst: 3, a: 2, b: 0 });
    let fill_exit = b.emit(Instr::JumpIfFalse { cond: 3, target: 0 });
    b.emit(Instr::Mul { dst: 5, a: 2, b: 2 });
    b.emit(Instr::SetItem { array: 1, index: 2, src: 5 });
    b.emit(Instr::Add { dst: 2, a: 2, b: 4 });
    b.emit(Instr::Jump { target: fill });
    let after_fill = b.emit(Instr::LoadConst { dst: 2, value: 0 });
    b.emit(Instr::ArrayLen { dst: 0, array: 1 });
    let sum = b.emit(Instr::LoopHeader);
    b.emit(Instr::Lt { dst: 3, a: 2, b: 0 });
    let sum_exit = b.emit(Instr::JumpIfFalse { cond: 3, target: 0 });
    b.emit(Instr::GetItem { dst: 7, array: 1, index: 2 });
    b.emit(Instr::Add { dst: 6, a: 6, b: 7 });
    b.emit(Instr::Add { dst: 2, a: 2, b: 4 });
    b.emit(Instr::Jump { target: sum });
    let end = b.emit(Instr::Return { src: 6 });
    b.patch_jump(fill_exit, after_fill);
    b.patch_jump(sum_exit, end);
    let code = program.add_code(b);
    (program, code)
}

/// Loop header pc of [`call_program`].
pub const CALL_HEADER: usize = 3;

/// `total(n)`: sums `callee(i)` for `i < n`. The callee is built by
/// `callee` and must take one argument.
pub fn call_program(callee: impl FnOnce(&mut Program) -> CodeId) -> (Program, CodeId, CodeId) {
    let mut program = Program::new();
    let callee = callee(&mut program);
    // r0 n, r1 i, r2 acc, r3 cond, r4 one, r5 result
    let mut b = CodeBuilder::new("total", 1, 6);
    b.emit(Instr::LoadConst { dst: 1, value: 0 });
    b.emit(Instr::LoadConst { dst: 2, value: 0 });
    b.emit(Instr::LoadConst { dst: 4, value: 1 });
    let header = b.emit(Instr::LoopHeader);
    b.emit(Instr::Lt { dst: 3, a: 1, b: 0 });
    let exit = b.emit(Instr::JumpIfFalse { cond: 3, target: 0 });
    b.emit(Instr::Call {
        dst: 5,
        func: callee,
        args: [1].into_iter().collect(),
    });
    b.emit(Instr::Add { dst: 2, a: 2, b: 5 });
    b.emit(Instr::Add { dst: 1, a: 1, b: 4 });
    b.emit(Instr::Jump { target: header });
    let end = b.emit(Instr::Return { src: 2 });
    b.patch_jump(exit, end);
    let total = program.add_code(b);
    (program, total, callee)
}

/// `square(x)`: `x * x`.
pub fn add_square(program: &mut Program) -> CodeId {
    let mut b = CodeBuilder::new("square", 1, 2);
    b.emit(Instr::Mul { dst: 1, a: 0, b: 0 });
    b.emit(Instr::Return { src: 1 });
    program.add_code(b)
}

/// `long(x)`: `x * (adds + 1)`, computed by `adds` additions.
pub fn add_long(program: &mut Program, adds: usize) -> CodeId {
    let mut b = CodeBuilder::new("long", 1, 2);
    b.emit(Instr::Move { dst: 1, src: 0 });
    for _ in 0..adds {
        b.emit(Instr::Add { dst: 1, a: 1, b: 0 });
    }
    b.emit(Instr::Return { src: 1 });
    program.add_code(b)
}

/// `b(x)`: `builtin(x)`.
pub fn add_builtin_call(program: &mut Program, builtin: Builtin) -> CodeId {
    let mut b = CodeBuilder::new(builtin.name(), 1, 2);
    b.emit(Instr::CallBuiltin { dst: 1, builtin, arg: 0 });
    b.emit(Instr::Return { src: 1 });
    program.add_code(b)
}
