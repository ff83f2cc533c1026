//! Operation descriptors.
//!
//! Descrs carry the static information an operation needs beyond its
//! arguments: which field or array it touches, what it allocates, what a
//! call may do to the heap, and where a guard resumes. Heap descrs are
//! created once by the embedder through a [`DescrTable`] and compared by
//! their stable index.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;
use strand_core::{GcRef, Kind};

use crate::compile::GuardDescr;
use crate::memmgr::TokenId;
use crate::resume::{ResumeData, Snapshot};

// =============================================================================
// Heap descrs
// =============================================================================

/// A field of a GC struct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldDescr {
    /// Stable index assigned by the [`DescrTable`].
    pub index: u32,
    /// Human readable name, `Class.field`.
    pub name: String,
    /// Slot shape of the field.
    pub kind: Kind,
    /// Position of the field within its struct.
    pub offset: usize,
    /// The field is never written after construction.
    pub immutable: bool,
}

/// An array type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArrayDescr {
    /// Stable index.
    pub index: u32,
    /// Name of the array type.
    pub name: String,
    /// Slot shape of the items.
    pub item_kind: Kind,
}

/// A struct type, as allocated by `new` / `new_with_vtable`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SizeDescr {
    /// Stable index.
    pub index: u32,
    /// Type name.
    pub name: String,
    /// Class pointer for `new_with_vtable`; `None` for plain `new`.
    pub vtable: Option<GcRef>,
    /// Number of fields.
    pub num_fields: usize,
}

// =============================================================================
// Call descrs
// =============================================================================

/// Heap locations a call may write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum WriteEffect {
    /// Writes nothing visible to the trace.
    #[default]
    Nothing,
    /// Writes the listed field and array descrs.
    Some {
        /// Field descr indices.
        fields: SmallVec<[u32; 4]>,
        /// Array descr indices.
        arrays: SmallVec<[u32; 4]>,
    },
    /// May write anything.
    Everything,
}

/// Special-cased library functions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum OopSpec {
    /// Ordinary function.
    #[default]
    None,
    /// `arraycopy(src, dst, src_start, dst_start, length)` on arrays of
    /// the given type.
    ArrayCopy(Arc<ArrayDescr>),
}

/// What a call is allowed to do.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct EffectInfo {
    /// Result depends only on the arguments (`call_pure` candidate).
    pub elidable: bool,
    /// Result is the same for the whole loop.
    pub loopinvariant: bool,
    /// The call may raise.
    pub can_raise: bool,
    /// Heap writes.
    pub writes: WriteEffect,
    /// Special handling.
    pub oopspec: OopSpec,
}

impl EffectInfo {
    /// A call that may do anything.
    pub fn anything() -> Self {
        Self {
            can_raise: true,
            writes: WriteEffect::Everything,
            ..Self::default()
        }
    }

    /// An elidable (pure) call.
    pub fn elidable() -> Self {
        Self {
            elidable: true,
            ..Self::default()
        }
    }

    /// Whether the call cannot write anything the trace could observe.
    #[inline]
    pub fn is_readonly(&self) -> bool {
        self.elidable || self.loopinvariant || self.writes == WriteEffect::Nothing
    }
}

/// A call signature with its effect information.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallDescr {
    /// Stable index.
    pub index: u32,
    /// Callee name.
    pub name: String,
    /// Argument shapes (excluding the function itself).
    pub arg_kinds: Vec<Kind>,
    /// Result shape, `None` for void.
    pub result_kind: Option<Kind>,
    /// What the call may do.
    pub effect: EffectInfo,
}

// =============================================================================
// Descr
// =============================================================================

/// Identifier of a `label` within one compiled trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub u32);

impl TargetId {
    /// Label at the start of every loop and entry trace.
    pub const ENTRY: TargetId = TargetId(0);
    /// Label of the peeled loop body.
    pub const LOOP_BODY: TargetId = TargetId(1);
}

/// Descriptor attached to a [`ResOp`](super::ResOp).
#[derive(Debug, Clone)]
pub enum Descr {
    /// Field access.
    Field(Arc<FieldDescr>),
    /// Array access or allocation.
    Array(Arc<ArrayDescr>),
    /// Struct allocation.
    Size(Arc<SizeDescr>),
    /// Call.
    Call(Arc<CallDescr>),
    /// Recorded guard: the frames to resume, in recorder operands.
    Snapshot(Arc<Snapshot>),
    /// Optimized guard: encoded resume data.
    Resume(Arc<ResumeData>),
    /// Compiled guard or finish.
    Fail(Arc<GuardDescr>),
    /// `label` / `jump` inside one trace.
    Target(TargetId),
    /// Entry of another compiled loop (`jump`, `call_assembler`).
    Token(TokenId),
}

/// Hashable identity of a descr, for optimizer caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescrKey {
    /// Field descr index.
    Field(u32),
    /// Array descr index.
    Array(u32),
    /// Size descr index.
    Size(u32),
    /// Call descr index.
    Call(u32),
    /// Jump target.
    Target(u32),
    /// Loop token.
    Token(u64),
    /// Guard-related descrs have no cache identity.
    Guard,
}

impl Descr {
    /// Result shape of an op reading through this descr.
    pub fn result_kind(&self) -> Option<Kind> {
        match self {
            Descr::Field(f) => Some(f.kind),
            Descr::Array(a) => Some(a.item_kind),
            Descr::Call(c) => c.result_kind,
            _ => None,
        }
    }

    /// Cache identity.
    pub fn key(&self) -> DescrKey {
        match self {
            Descr::Field(f) => DescrKey::Field(f.index),
            Descr::Array(a) => DescrKey::Array(a.index),
            Descr::Size(s) => DescrKey::Size(s.index),
            Descr::Call(c) => DescrKey::Call(c.index),
            Descr::Target(t) => DescrKey::Target(t.0),
            Descr::Token(t) => DescrKey::Token(t.0),
            Descr::Snapshot(_) | Descr::Resume(_) | Descr::Fail(_) => DescrKey::Guard,
        }
    }

    /// Field descr, if this is one.
    pub fn as_field(&self) -> Option<&Arc<FieldDescr>> {
        match self {
            Descr::Field(f) => Some(f),
            _ => None,
        }
    }

    /// Array descr, if this is one.
    pub fn as_array(&self) -> Option<&Arc<ArrayDescr>> {
        match self {
            Descr::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Size descr, if this is one.
    pub fn as_size(&self) -> Option<&Arc<SizeDescr>> {
        match self {
            Descr::Size(s) => Some(s),
            _ => None,
        }
    }

    /// Call descr, if this is one.
    pub fn as_call(&self) -> Option<&Arc<CallDescr>> {
        match self {
            Descr::Call(c) => Some(c),
            _ => None,
        }
    }

    /// Guard descr of a compiled op, if this is one.
    pub fn as_fail(&self) -> Option<&Arc<GuardDescr>> {
        match self {
            Descr::Fail(g) => Some(g),
            _ => None,
        }
    }

    /// Whether trace printing shows this descr.
    pub(crate) fn is_printable(&self) -> bool {
        !matches!(self, Descr::Snapshot(_) | Descr::Resume(_))
    }
}

impl fmt::Display for Descr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Descr::Field(d) => write!(f, "<{}>", d.name),
            Descr::Array(d) => write!(f, "<array {}>", d.name),
            Descr::Size(d) => write!(f, "<size {}>", d.name),
            Descr::Call(d) => write!(f, "<call {}>", d.name),
            Descr::Snapshot(_) => f.write_str("<snapshot>"),
            Descr::Resume(_) => f.write_str("<resume>"),
            Descr::Fail(g) => write!(f, "<Guard{}>", g.id()),
            Descr::Target(t) => write!(f, "TargetToken({})", t.0),
            Descr::Token(t) => write!(f, "<Loop{}>", t.0),
        }
    }
}

// =============================================================================
// DescrTable
// =============================================================================

/// Factory handing out descrs with stable indices.
#[derive(Debug, Default)]
pub struct DescrTable {
    next_index: u32,
}

impl DescrTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&mut self) -> u32 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    /// A mutable field.
    pub fn field(&mut self, name: &str, kind: Kind, offset: usize) -> Arc<FieldDescr> {
        Arc::new(FieldDescr {
            index: self.next(),
            name: name.to_string(),
            kind,
            offset,
            immutable: false,
        })
    }

    /// A field that is never written after construction.
    pub fn immutable_field(&mut self, name: &str, kind: Kind, offset: usize) -> Arc<FieldDescr> {
        Arc::new(FieldDescr {
            index: self.next(),
            name: name.to_string(),
            kind,
            offset,
            immutable: true,
        })
    }

    /// An array type.
    pub fn array(&mut self, name: &str, item_kind: Kind) -> Arc<ArrayDescr> {
        Arc::new(ArrayDescr {
            index: self.next(),
            name: name.to_string(),
            item_kind,
        })
    }

    /// A struct type, with a class pointer when `vtable` is given.
    pub fn size(&mut self, name: &str, vtable: Option<GcRef>, num_fields: usize) -> Arc<SizeDescr> {
        Arc::new(SizeDescr {
            index: self.next(),
            name: name.to_string(),
            vtable,
            num_fields,
        })
    }

    /// A call signature.
    pub fn call(
        &mut self,
        name: &str,
        arg_kinds: &[Kind],
        result_kind: Option<Kind>,
        effect: EffectInfo,
    ) -> Arc<CallDescr> {
        Arc::new(CallDescr {
            index: self.next(),
            name: name.to_string(),
            arg_kinds: arg_kinds.to_vec(),
            result_kind,
            effect,
        })
    }
}
