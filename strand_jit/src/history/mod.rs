//! Trace history: operands, operations, descrs and traces.
//!
//! ```text
//!   Operand ──┬── Box(BoxRef{id, kind})   SSA variable
//!             └── Const(Value)            immutable constant
//!
//!   ResOp { opcode, args, result, descr, fail_args }
//!
//!   Trace { inputargs, ops: [... , jump | finish] }
//! ```

pub mod descr;
pub mod executor;
pub mod operand;
pub mod resoperation;
pub mod trace;

pub use descr::{
    ArrayDescr, CallDescr, Descr, DescrKey, DescrTable, EffectInfo, FieldDescr, OopSpec, SizeDescr,
    TargetId, WriteEffect,
};
pub use executor::{eval_ovf, eval_pure};
pub use operand::{BoxAllocator, BoxRef, Operand};
pub use resoperation::{Args, OpFlags, Opcode, ResOp, ResultKind};
pub use trace::{CallKey, Trace, TraceBuilder};
