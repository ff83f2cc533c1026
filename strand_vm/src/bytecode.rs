//! Register bytecode.
//!
//! A [`Program`] is a set of code objects, class definitions and global
//! slots. Every code object runs on a flat register file: arguments land
//! in `r0..num_args`, every other register starts as integer zero.
//!
//! ```text
//!   Program ─┬─ codes:   [Code { name, num_regs, num_args, instrs }]
//!            ├─ classes: [ClassDef { name, fields }]
//!            └─ globals: [initial value]
//! ```
//!
//! `LoopHeader` marks the merge points the JIT traces from. Jumps target
//! instruction indices.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;
use strand_core::{Kind, Value};
use strand_jit::CodeId;

/// Register index.
pub type Reg = u16;

/// Index into [`Program::classes`].
pub type ClassId = u32;

/// Argument registers of a call.
pub type Args = SmallVec<[Reg; 4]>;

// =============================================================================
// Builtins
// =============================================================================

/// Host functions callable with `CallBuiltin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    /// `hash(x)`: a pure integer mix.
    Hash,
    /// `check(x)`: raises `x` when it is zero, otherwise returns it.
    Check,
    /// `abs(x)`.
    Abs,
}

impl Builtin {
    /// Every builtin.
    pub const ALL: [Builtin; 3] = [Builtin::Hash, Builtin::Check, Builtin::Abs];

    /// Name, for traces and logs.
    pub const fn name(self) -> &'static str {
        match self {
            Builtin::Hash => "hash",
            Builtin::Check => "check",
            Builtin::Abs => "abs",
        }
    }

    /// Whether the result depends only on the arguments.
    pub const fn is_pure(self) -> bool {
        matches!(self, Builtin::Hash | Builtin::Abs)
    }

    /// Evaluate on integers. `Err` carries the raised value.
    pub fn eval(self, arg: i64) -> Result<i64, i64> {
        match self {
            Builtin::Hash => {
                let mixed = (arg as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
                Ok((mixed ^ (mixed >> 29)) as i64 & 0x7fff_ffff)
            }
            Builtin::Check if arg == 0 => Err(arg),
            Builtin::Check => Ok(arg),
            Builtin::Abs => Ok(arg.wrapping_abs()),
        }
    }
}

// =============================================================================
// Instructions
// =============================================================================

/// One bytecode instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr {
    /// `dst = value`
    LoadConst { dst: Reg, value: i64 },
    /// `dst = null`
    LoadNull { dst: Reg },
    /// `dst = src`
    Move { dst: Reg, src: Reg },
    /// `dst = a + b`, raising on overflow.
    Add { dst: Reg, a: Reg, b: Reg },
    /// `dst = a - b`, raising on overflow.
    Sub { dst: Reg, a: Reg, b: Reg },
    /// `dst = a * b`, raising on overflow.
    Mul { dst: Reg, a: Reg, b: Reg },
    /// `dst = a < b`
    Lt { dst: Reg, a: Reg, b: Reg },
    /// `dst = a <= b`
    Le { dst: Reg, a: Reg, b: Reg },
    /// `dst = a == b` (integers or references)
    Eq { dst: Reg, a: Reg, b: Reg },
    /// `goto target`
    Jump { target: u32 },
    /// `if not cond: goto target`
    JumpIfFalse { cond: Reg, target: u32 },
    /// Loop merge point.
    LoopHeader,
    /// `dst = new class`
    New { dst: Reg, class: ClassId },
    /// `dst = obj.fields[field]`
    GetField { dst: Reg, obj: Reg, field: u16 },
    /// `obj.fields[field] = src`
    SetField { obj: Reg, field: u16, src: Reg },
    /// `dst = obj is an instance of class`
    IsInstance { dst: Reg, obj: Reg, class: ClassId },
    /// `dst = [0] * len`
    NewArray { dst: Reg, len: Reg },
    /// `dst = array[index]`
    GetItem { dst: Reg, array: Reg, index: Reg },
    /// `array[index] = src`
    SetItem { array: Reg, index: Reg, src: Reg },
    /// `dst = len(array)`
    ArrayLen { dst: Reg, array: Reg },
    /// `dst = func(args...)`
    Call { dst: Reg, func: CodeId, args: Args },
    /// `dst = builtin(arg)`
    CallBuiltin { dst: Reg, builtin: Builtin, arg: Reg },
    /// Treat the current value of `reg` as a constant from here on.
    Promote { reg: Reg },
    /// `dst = globals[slot]`
    LoadGlobal { dst: Reg, slot: u32 },
    /// `globals[slot] = src`
    StoreGlobal { slot: u32, src: Reg },
    /// Append `src` to the output.
    Print { src: Reg },
    /// Return `src` to the caller.
    Return { src: Reg },
}

impl Instr {
    /// Whether control never falls through to the next instruction.
    pub fn is_terminator(&self) -> bool {
        matches!(self, Instr::Jump { .. } | Instr::Return { .. })
    }
}

// =============================================================================
// Code objects and classes
// =============================================================================

/// A function body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Code {
    /// Index in [`Program::codes`].
    pub id: CodeId,
    /// Name, for printable locations.
    pub name: String,
    /// Size of the register file.
    pub num_regs: usize,
    /// Number of argument registers.
    pub num_args: usize,
    /// Instructions.
    pub instrs: Vec<Instr>,
}

impl Code {
    /// Instruction at `pc`.
    #[inline]
    pub fn instr(&self, pc: usize) -> Option<&Instr> {
        self.instrs.get(pc)
    }
}

/// A class: a name and typed fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDef {
    /// Class name.
    pub name: String,
    /// Field names and shapes, in layout order.
    pub fields: Vec<(String, Kind)>,
}

/// Everything a VM runs.
#[derive(Debug, Clone, Default)]
pub struct Program {
    /// Code objects, indexed by [`CodeId`].
    pub codes: Vec<Arc<Code>>,
    /// Classes, indexed by [`ClassId`].
    pub classes: Vec<ClassDef>,
    /// Initial values of the global slots.
    pub globals: Vec<Value>,
}

impl Program {
    /// Empty program.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a class; returns its id.
    pub fn add_class(&mut self, name: &str, fields: &[(&str, Kind)]) -> ClassId {
        self.classes.push(ClassDef {
            name: name.to_string(),
            fields: fields.iter().map(|(n, k)| (n.to_string(), *k)).collect(),
        });
        (self.classes.len() - 1) as ClassId
    }

    /// Add a global slot; returns its index.
    pub fn add_global(&mut self, initial: Value) -> u32 {
        self.globals.push(initial);
        (self.globals.len() - 1) as u32
    }

    /// Id the next code object added will get.
    #[inline]
    pub fn next_code_id(&self) -> CodeId {
        self.codes.len() as CodeId
    }

    /// Add a finished code object; returns its id.
    pub fn add_code(&mut self, builder: CodeBuilder) -> CodeId {
        let id = self.next_code_id();
        self.codes.push(Arc::new(builder.build(id)));
        id
    }

    /// Code object by id.
    #[inline]
    pub fn code(&self, id: CodeId) -> Option<&Arc<Code>> {
        self.codes.get(id as usize)
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles one code object. Labels are instruction indices, so forward
/// jumps are emitted with a placeholder and patched.
#[derive(Debug, Clone)]
pub struct CodeBuilder {
    name: String,
    num_regs: usize,
    num_args: usize,
    instrs: Vec<Instr>,
}

impl CodeBuilder {
    /// Builder for a function taking `num_args` arguments and using
    /// `num_regs` registers in total.
    pub fn new(name: &str, num_args: usize, num_regs: usize) -> Self {
        Self {
            name: name.to_string(),
            num_regs: num_regs.max(num_args),
            num_args,
            instrs: Vec::new(),
        }
    }

    /// Index of the next instruction.
    #[inline]
    pub fn here(&self) -> u32 {
        self.instrs.len() as u32
    }

    /// Append an instruction; returns its index.
    pub fn emit(&mut self, instr: Instr) -> u32 {
        self.instrs.push(instr);
        self.here() - 1
    }

    /// Point the jump at `at` to `target`.
    pub fn patch_jump(&mut self, at: u32, target: u32) {
        match self.instrs.get_mut(at as usize) {
            Some(Instr::Jump { target: t }) | Some(Instr::JumpIfFalse { target: t, .. }) => *t = target,
            _ => {}
        }
    }

    /// Finish the code object.
    pub fn build(self, id: CodeId) -> Code {
        Code {
            id,
            name: self.name,
            num_regs: self.num_regs,
            num_args: self.num_args,
            instrs: self.instrs,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "code {} ({} args, {} regs):", self.name, self.num_args, self.num_regs)?;
        for (pc, instr) in self.instrs.iter().enumerate() {
            writeln!(f, "  {:4}  {:?}", pc, instr)?;
        }
        Ok(())
    }
}
