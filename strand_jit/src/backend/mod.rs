//! The abstract backend contract.
//!
//! The JIT core never emits machine code. A backend turns optimized
//! traces into something executable, runs it, and reports how compiled
//! code was left through a [`DeadFrame`]. All values crossing the
//! boundary use the three-slot [`Value`] model.
//!
//! ```text
//!   execute_token(T, args) ──► compiled code ──► guard fails / finish
//!                                   │                   │
//!                         ExecCx (heap, calls)     DeadFrame { descr, values }
//! ```

pub mod interp;

use std::sync::Arc;

use strand_core::{GcRef, JitResult, Kind, Value};

use crate::compile::GuardDescr;
use crate::history::{ArrayDescr, CallDescr, FieldDescr, SizeDescr, Trace};
use crate::memmgr::{LoopToken, TokenId};

pub use interp::TraceBackend;

// =============================================================================
// Execute tokens and dead frames
// =============================================================================

/// Calling convention of a compiled loop: the shapes of its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteToken {
    kinds: Vec<Kind>,
}

impl ExecuteToken {
    /// Convention for the given argument shapes.
    pub fn new(kinds: &[Kind]) -> Self {
        Self { kinds: kinds.to_vec() }
    }

    /// Argument shapes.
    #[inline]
    pub fn kinds(&self) -> &[Kind] {
        &self.kinds
    }

    /// Whether `args` match the convention.
    pub fn accepts(&self, args: &[Value]) -> bool {
        args.len() == self.kinds.len() && args.iter().zip(&self.kinds).all(|(v, k)| v.kind() == *k)
    }
}

/// State of compiled code after it left through a guard or `finish`.
#[derive(Debug, Clone)]
pub struct DeadFrame {
    /// The exit taken.
    pub descr: Arc<GuardDescr>,
    /// Fail-arg values (or `finish` args).
    pub values: Vec<Value>,
    /// Exception pending when `guard_no_exception` failed.
    pub exception: Option<Value>,
}

// =============================================================================
// Execution context
// =============================================================================

/// Heap and call services compiled code needs from the embedder.
pub trait ExecCx {
    /// Allocate a zeroed struct.
    fn alloc_struct(&mut self, size: &SizeDescr) -> GcRef;
    /// Allocate a zeroed array.
    fn alloc_array(&mut self, descr: &ArrayDescr, len: usize) -> GcRef;
    /// Read a field.
    fn get_field(&mut self, obj: GcRef, field: &FieldDescr) -> Value;
    /// Write a field.
    fn set_field(&mut self, obj: GcRef, field: &FieldDescr, value: Value);
    /// Read an array item; `None` when out of bounds.
    fn get_item(&mut self, array: GcRef, descr: &ArrayDescr, index: usize) -> Option<Value>;
    /// Write an array item; false when out of bounds.
    fn set_item(&mut self, array: GcRef, descr: &ArrayDescr, index: usize, value: Value) -> bool;
    /// Length of an array.
    fn array_len(&mut self, array: GcRef, descr: &ArrayDescr) -> usize;
    /// Class pointer of an object.
    fn class_of(&mut self, obj: GcRef) -> GcRef;
    /// Call a function. `Err` carries a raised exception.
    fn call(&mut self, func: Value, args: &[Value], descr: &CallDescr) -> Result<Option<Value>, Value>;
    /// Run the compiled code of another token to completion, resuming in
    /// the interpreter if it fails a guard.
    fn call_assembler(&mut self, token: TokenId, args: &[Value]) -> JitResult<Option<Value>>;
}

// =============================================================================
// Backend
// =============================================================================

/// What the JIT core needs from a code generator.
pub trait Backend: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &'static str;

    /// Calling convention for a loop taking `kinds`.
    fn make_execute_token(&self, kinds: &[Kind]) -> ExecuteToken {
        ExecuteToken::new(kinds)
    }

    /// Compile a loop or entry trace into `token`.
    fn compile_loop(&self, token: &Arc<LoopToken>, trace: &Trace) -> JitResult<()>;

    /// Compile a bridge and patch `guard` to jump to it.
    fn compile_bridge(&self, guard: &Arc<GuardDescr>, trace: &Trace) -> JitResult<()>;

    /// Run compiled code until it leaves through a guard or `finish`.
    fn execute_token(&self, token: TokenId, args: &[Value], cx: &mut dyn ExecCx) -> JitResult<DeadFrame>;

    /// The exit a dead frame was left through.
    fn get_latest_descr(&self, frame: &DeadFrame) -> Arc<GuardDescr> {
        frame.descr.clone()
    }

    /// Make calls to `old` run `new` instead.
    fn redirect_call_assembler(&self, old: TokenId, new: TokenId);

    /// Refuse further entries into `token`; its `guard_not_invalidated`
    /// guards fail from now on.
    fn invalidate_loop(&self, token: TokenId);

    /// Release the code of `token`.
    fn free_loop(&self, token: TokenId);
}
