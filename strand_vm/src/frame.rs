//! Interpreter call frames.

use std::sync::Arc;

use strand_core::Value;

use crate::bytecode::{Code, Reg};

/// Maximum number of guest activations, counting interpreter frames of
/// every nested loop and every running compiled call.
pub const MAX_RECURSION_DEPTH: usize = 1000;

/// Maximum number of interpreter loops nested inside compiled code or
/// residual calls.
pub const MAX_NESTING: usize = 64;

/// Native nesting from which compiled code is no longer entered. Deeper
/// calls are interpreted on the heap-allocated frame stack instead.
pub const MAX_COMPILED_NESTING: usize = 16;

/// One activation of a code object.
///
/// While a call is in progress, `pc` of the caller stays on the `Call`
/// instruction; the return writes its `dst` and steps past it. Resume
/// data uses the same convention for outer frames.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Code being executed.
    pub code: Arc<Code>,
    /// Index of the current instruction.
    pub pc: usize,
    /// Register file.
    pub regs: Vec<Value>,
}

impl Frame {
    /// Fresh frame: arguments in the first registers, zero elsewhere.
    pub fn new(code: Arc<Code>, args: &[Value]) -> Self {
        let mut regs = vec![Value::int(0); code.num_regs];
        for (slot, arg) in regs.iter_mut().zip(args) {
            *slot = *arg;
        }
        Self { code, pc: 0, regs }
    }

    /// Frame rebuilt from a full register file, as after a guard failure.
    pub fn with_registers(code: Arc<Code>, pc: usize, regs: Vec<Value>) -> Self {
        Self { code, pc, regs }
    }

    /// Register value.
    #[inline]
    pub fn get(&self, reg: Reg) -> Value {
        self.regs.get(reg as usize).copied().unwrap_or_default()
    }

    /// Store into a register.
    #[inline]
    pub fn set(&mut self, reg: Reg, value: Value) {
        if let Some(slot) = self.regs.get_mut(reg as usize) {
            *slot = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::CodeBuilder;

    #[test]
    fn test_new_frame_zeroes_locals() {
        let code = Arc::new(CodeBuilder::new("f", 2, 4).build(0));
        let frame = Frame::new(code, &[Value::int(7), Value::NULL]);
        assert_eq!(frame.regs, vec![Value::int(7), Value::NULL, Value::int(0), Value::int(0)]);
        assert_eq!(frame.pc, 0);
    }
}
