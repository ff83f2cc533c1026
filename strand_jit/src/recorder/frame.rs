//! Shadow frames of the interpreter while a trace is recorded.

use crate::history::{BoxRef, Operand};
use crate::resume::{CodeId, FrameSnapshot};

/// The operands held by one interpreter frame's registers.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingFrame {
    /// Code object running in the frame.
    pub code: CodeId,
    /// For outer frames: pc of the call in progress.
    pub pc: u32,
    /// Operand of every register.
    pub registers: Vec<Operand>,
    /// Trace length when the frame was entered.
    pub(crate) start_len: usize,
}

impl RecordingFrame {
    /// Frame of `code` at `pc` with the given registers.
    pub fn new(code: CodeId, pc: u32, registers: Vec<Operand>) -> Self {
        Self {
            code,
            pc,
            registers,
            start_len: 0,
        }
    }

    /// Operand of register `reg`.
    #[inline]
    pub fn get(&self, reg: usize) -> Operand {
        self.registers[reg]
    }

    /// Store an operand in register `reg`.
    #[inline]
    pub fn set(&mut self, reg: usize, op: Operand) {
        self.registers[reg] = op;
    }

    /// Replace every occurrence of `from`.
    pub fn replace(&mut self, from: BoxRef, to: Operand) {
        for slot in &mut self.registers {
            if *slot == Operand::Box(from) {
                *slot = to;
            }
        }
    }

    pub(crate) fn snapshot(&self, pc: u32) -> FrameSnapshot {
        FrameSnapshot {
            code: self.code,
            pc,
            slots: self.registers.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::Kind;

    #[test]
    fn test_replace_all_occurrences() {
        let b = BoxRef::new(3, Kind::Int);
        let mut frame = RecordingFrame::new(1, 0, vec![Operand::Box(b), Operand::int(2), Operand::Box(b)]);
        frame.replace(b, Operand::int(7));
        assert_eq!(frame.registers, vec![Operand::int(7), Operand::int(2), Operand::int(7)]);
    }
}
