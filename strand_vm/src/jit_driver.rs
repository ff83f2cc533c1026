//! The interpreter's side of the JIT contract.
//!
//! [`VmDriver`] tells the runtime how to print green keys and which code
//! objects must not be inlined. [`VmDescrs`] holds every descr the
//! recorder attaches to heap operations and calls, and maps call descrs
//! back to what they call when compiled code invokes them.
//!
//! Green keys are `[code, pc]` for loop headers and `[code, -1]` for
//! function entries.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::{smallvec, SmallVec};
use strand_core::{GcRef, Kind, Value};
use strand_jit::history::{ArrayDescr, CallDescr, FieldDescr, SizeDescr, WriteEffect};
use strand_jit::{CodeId, DescrTable, EffectInfo, GreenKey, JitDriver};

use crate::bytecode::{Builtin, ClassId, Program};

/// Pc component of a function-entry green key.
pub const FUNCTION_ENTRY: i64 = -1;

/// Green key of the loop header at `pc` of `code`.
#[inline]
pub fn loop_greens(code: CodeId, pc: usize) -> [Value; 2] {
    [Value::int(i64::from(code)), Value::int(pc as i64)]
}

/// Green key of the entry of `code`.
#[inline]
pub fn entry_greens(code: CodeId) -> [Value; 2] {
    [Value::int(i64::from(code)), Value::int(FUNCTION_ENTRY)]
}

// =============================================================================
// Driver
// =============================================================================

/// Jit driver of the bytecode interpreter.
#[derive(Debug)]
pub struct VmDriver {
    names: Vec<String>,
    never_inline: RwLock<FxHashSet<CodeId>>,
}

impl VmDriver {
    /// Driver for the code objects of `program`.
    pub fn new(program: &Program) -> Self {
        Self {
            names: program.codes.iter().map(|c| c.name.clone()).collect(),
            never_inline: RwLock::new(FxHashSet::default()),
        }
    }

    /// Never inline calls to `code`.
    pub fn set_never_inline(&self, code: CodeId) {
        self.never_inline.write().insert(code);
    }

    fn name(&self, code: i64) -> &str {
        usize::try_from(code)
            .ok()
            .and_then(|i| self.names.get(i))
            .map_or("?", String::as_str)
    }
}

impl JitDriver for VmDriver {
    fn name(&self) -> &str {
        "strand_vm"
    }

    fn get_printable_location(&self, greens: &[Value]) -> String {
        match greens {
            [Value::Int(code), Value::Int(FUNCTION_ENTRY)] => format!("{} entry", self.name(*code)),
            [Value::Int(code), Value::Int(pc)] => format!("{}@{}", self.name(*code), pc),
            _ => format!("{:?}", greens),
        }
    }

    fn can_never_inline(&self, greens: &[Value]) -> bool {
        match greens.first().and_then(Value::as_int) {
            Some(code) => u32::try_from(code).map_or(false, |c| self.never_inline.read().contains(&c)),
            None => false,
        }
    }

    fn function_greens(&self, code: CodeId) -> GreenKey {
        smallvec![Value::int(i64::from(code)), Value::int(FUNCTION_ENTRY)]
    }

    fn describe_resume_point(&self, code: CodeId, pc: u32) -> String {
        format!("{}@{}", self.name(i64::from(code)), pc)
    }
}

// =============================================================================
// Descrs
// =============================================================================

/// What a call descr calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    /// A host builtin.
    Builtin(Builtin),
    /// A bytecode function; the function operand is its code id.
    Interp,
    /// A global store; the function operand is the slot.
    StoreGlobal,
}

type Signature = (SmallVec<[Kind; 4]>, Kind);

/// Descrs of one program.
#[derive(Debug)]
pub struct VmDescrs {
    table: DescrTable,
    sizes: Vec<Arc<SizeDescr>>,
    fields: Vec<Vec<Arc<FieldDescr>>>,
    int_array: Arc<ArrayDescr>,
    builtins: FxHashMap<Builtin, Arc<CallDescr>>,
    store_global: Arc<CallDescr>,
    interp_calls: FxHashMap<Signature, Arc<CallDescr>>,
    targets: FxHashMap<u32, CallTarget>,
}

impl VmDescrs {
    /// Descrs for `program`, whose class objects were allocated at
    /// `class_refs`.
    pub fn new(program: &Program, class_refs: &[GcRef]) -> Self {
        let mut table = DescrTable::new();
        let mut sizes = Vec::with_capacity(program.classes.len());
        let mut fields = Vec::with_capacity(program.classes.len());
        for (class, vtable) in program.classes.iter().zip(class_refs) {
            sizes.push(table.size(&class.name, Some(*vtable), class.fields.len()));
            fields.push(
                class
                    .fields
                    .iter()
                    .enumerate()
                    .map(|(offset, (name, kind))| table.field(&format!("{}.{}", class.name, name), *kind, offset))
                    .collect(),
            );
        }
        let int_array = table.array("IntArray", Kind::Int);

        let mut targets = FxHashMap::default();
        let mut builtins = FxHashMap::default();
        for builtin in Builtin::ALL {
            let effect = if builtin.is_pure() {
                EffectInfo::elidable()
            } else {
                EffectInfo::anything()
            };
            let descr = table.call(builtin.name(), &[Kind::Int], Some(Kind::Int), effect);
            targets.insert(descr.index, CallTarget::Builtin(builtin));
            builtins.insert(builtin, descr);
        }
        let store_global = table.call(
            "store_global",
            &[Kind::Int],
            None,
            EffectInfo {
                writes: WriteEffect::Everything,
                ..EffectInfo::default()
            },
        );
        targets.insert(store_global.index, CallTarget::StoreGlobal);

        Self {
            table,
            sizes,
            fields,
            int_array,
            builtins,
            store_global,
            interp_calls: FxHashMap::default(),
            targets,
        }
    }

    /// Allocation descr of a class.
    #[inline]
    pub fn size(&self, class: ClassId) -> Option<&Arc<SizeDescr>> {
        self.sizes.get(class as usize)
    }

    /// Field descr of a class.
    #[inline]
    pub fn field(&self, class: ClassId, field: usize) -> Option<&Arc<FieldDescr>> {
        self.fields.get(class as usize).and_then(|f| f.get(field))
    }

    /// Descr of the integer arrays.
    #[inline]
    pub fn int_array(&self) -> &Arc<ArrayDescr> {
        &self.int_array
    }

    /// Call descr of a builtin.
    #[inline]
    pub fn builtin(&self, builtin: Builtin) -> Option<&Arc<CallDescr>> {
        self.builtins.get(&builtin)
    }

    /// Call descr of a global store.
    #[inline]
    pub fn store_global(&self) -> &Arc<CallDescr> {
        &self.store_global
    }

    /// Call descr of a residual call to a bytecode function with these
    /// argument and result shapes. Created on first use.
    pub fn interp_call(&mut self, arg_kinds: &[Kind], result: Kind) -> Arc<CallDescr> {
        let key: Signature = (arg_kinds.iter().copied().collect(), result);
        if let Some(descr) = self.interp_calls.get(&key) {
            return descr.clone();
        }
        let descr = self
            .table
            .call("interp_call", arg_kinds, Some(result), EffectInfo::anything());
        self.targets.insert(descr.index, CallTarget::Interp);
        self.interp_calls.insert(key, descr.clone());
        descr
    }

    /// What a call descr calls.
    #[inline]
    pub fn target(&self, descr: &CallDescr) -> Option<CallTarget> {
        self.targets.get(&descr.index).copied()
    }
}
