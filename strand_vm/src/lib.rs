//! A register bytecode interpreter driven by the strand JIT.
//!
//! The VM is the reference embedder of [`strand_jit`]: it reports loop
//! headers and function entries as merge points, mirrors every executed
//! instruction into the trace recorder while a loop is being traced, and
//! rebuilds its frames from resume data when compiled code fails a guard.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                      Vm                       │
//! ├───────────────────────────────────────────────┤
//! │  ┌─────────┐  ┌─────────┐  ┌───────────────┐  │
//! │  │ Frame 0 │→ │ Frame 1 │→ │ Frame N (top) │  │
//! │  └─────────┘  └─────────┘  └───────────────┘  │
//! │                                               │
//! │  ┌──────────┐  ┌──────────┐  ┌─────────────┐  │
//! │  │   Heap   │  │ VmDescrs │  │  VmDriver   │  │
//! │  └──────────┘  └──────────┘  └─────────────┘  │
//! └──────────────────────┬────────────────────────┘
//!                        │ merge points, ExecCx
//!                        ▼
//!                   JitRuntime
//! ```
//!
//! # Example
//!
//! ```ignore
//! use strand_jit::JitParams;
//! use strand_vm::{CodeBuilder, Instr, Program, Vm};
//!
//! let mut program = Program::new();
//! let mut b = CodeBuilder::new("main", 0, 1);
//! b.emit(Instr::LoadConst { dst: 0, value: 42 });
//! b.emit(Instr::Return { src: 0 });
//! let main = program.add_code(b);
//!
//! let mut vm = Vm::with_params(program, JitParams::default());
//! assert_eq!(vm.call(main, &[])?, strand_core::Value::int(42));
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod bytecode;
pub mod error;
pub mod frame;
pub mod heap;
pub mod jit_driver;
pub mod vm;

pub use bytecode::{Args, Builtin, ClassDef, ClassId, Code, CodeBuilder, Instr, Program, Reg};
pub use error::{VmError, VmResult};
pub use frame::{Frame, MAX_COMPILED_NESTING, MAX_RECURSION_DEPTH};
pub use heap::{Heap, HeapObject};
pub use jit_driver::{entry_greens, loop_greens, VmDescrs, VmDriver};
pub use vm::Vm;
