//! What the optimizer knows about each box.
//!
//! Boxes replaced by another operand are forwarded; [`OptState::get`]
//! follows the chain. Facts (non-nullness, class, integer bounds, the
//! guard that established them, virtual contents) live in an [`OptInfo`]
//! per box.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use strand_core::{GcRef, Kind, Value};

use super::intbound::IntBound;
use crate::history::{ArrayDescr, BoxRef, FieldDescr, Operand, SizeDescr};
use crate::resume::{VirtualContents, VirtualView};

/// Contents of an allocation the optimizer has removed so far.
#[derive(Debug, Clone, PartialEq)]
pub enum VirtualInfo {
    /// A struct with the fields written so far.
    Struct {
        /// Allocated type.
        size: Arc<SizeDescr>,
        /// Written fields, in write order.
        fields: Vec<(Arc<FieldDescr>, Operand)>,
    },
    /// A fixed-length array.
    Array {
        /// Array type.
        descr: Arc<ArrayDescr>,
        /// Every item.
        items: Vec<Operand>,
    },
}

impl VirtualInfo {
    /// Value of a struct field, the zero of its kind if never written.
    pub fn field(&self, field: &FieldDescr) -> Option<Operand> {
        match self {
            VirtualInfo::Struct { fields, .. } => Some(
                fields
                    .iter()
                    .find(|(f, _)| f.index == field.index)
                    .map_or(Operand::Const(Value::zero_of(field.kind)), |(_, v)| *v),
            ),
            VirtualInfo::Array { .. } => None,
        }
    }

    /// Write a struct field.
    pub fn set_field(&mut self, field: &Arc<FieldDescr>, value: Operand) -> bool {
        match self {
            VirtualInfo::Struct { fields, .. } => {
                match fields.iter_mut().find(|(f, _)| f.index == field.index) {
                    Some(slot) => slot.1 = value,
                    None => fields.push((field.clone(), value)),
                }
                true
            }
            VirtualInfo::Array { .. } => false,
        }
    }

    /// Array length.
    pub fn len(&self) -> Option<usize> {
        match self {
            VirtualInfo::Array { items, .. } => Some(items.len()),
            VirtualInfo::Struct { .. } => None,
        }
    }

    /// Operands held by the virtual.
    pub fn operands(&self) -> Vec<Operand> {
        match self {
            VirtualInfo::Struct { fields, .. } => fields.iter().map(|(_, v)| *v).collect(),
            VirtualInfo::Array { items, .. } => items.clone(),
        }
    }

    /// Class pointer of a struct allocated with a vtable.
    pub fn known_class(&self) -> Option<GcRef> {
        match self {
            VirtualInfo::Struct { size, .. } => size.vtable,
            VirtualInfo::Array { .. } => None,
        }
    }
}

/// Facts about one box.
#[derive(Debug, Clone, Default)]
pub struct OptInfo {
    /// The reference is known not to be null.
    pub nonnull: bool,
    /// The class is known.
    pub known_class: Option<GcRef>,
    /// Integer bounds.
    pub bound: IntBound,
    /// Index in the output of the guard that established the
    /// reference facts.
    pub last_guard: Option<usize>,
    /// Contents, while the allocation is virtual.
    pub virt: Option<VirtualInfo>,
}

/// Forwarding and facts of one optimization run.
#[derive(Debug, Default)]
pub struct OptState {
    forwarded: FxHashMap<u32, Operand>,
    infos: FxHashMap<u32, OptInfo>,
    const_classes: FxHashMap<GcRef, GcRef>,
}

impl OptState {
    /// Empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical operand: follows forwarding.
    pub fn get(&self, op: Operand) -> Operand {
        let mut current = op;
        while let Operand::Box(b) = current {
            match self.forwarded.get(&b.id) {
                Some(next) if *next != current => current = *next,
                _ => break,
            }
        }
        current
    }

    /// From now on, `b` is `op`.
    pub fn make_equal_to(&mut self, b: BoxRef, op: Operand) {
        let target = self.get(op);
        if target != Operand::Box(b) {
            self.forwarded.insert(b.id, target);
        }
    }

    /// From now on, `b` is the constant `value`.
    pub fn make_constant(&mut self, b: BoxRef, value: Value) {
        let canonical = self.get(Operand::Box(b));
        if let Operand::Box(current) = canonical {
            self.forwarded.insert(current.id, Operand::Const(value));
        }
        self.forwarded.insert(b.id, Operand::Const(value));
    }

    /// Facts about a box, if any were recorded.
    #[inline]
    pub fn info(&self, b: BoxRef) -> Option<&OptInfo> {
        self.infos.get(&b.id)
    }

    /// Facts about a box, created empty.
    #[inline]
    pub fn info_mut(&mut self, b: BoxRef) -> &mut OptInfo {
        self.infos.entry(b.id).or_default()
    }

    /// Integer bound of an operand.
    pub fn bound(&self, op: Operand) -> IntBound {
        match self.get(op) {
            Operand::Const(Value::Int(v)) => IntBound::exact(v),
            Operand::Box(b) if b.kind == Kind::Int => self.info(b).map_or_else(IntBound::unbounded, |i| i.bound),
            _ => IntBound::unbounded(),
        }
    }

    /// Narrow the bound of an operand; returns the new bound.
    pub fn narrow(&mut self, op: Operand, bound: &IntBound) -> IntBound {
        match self.get(op) {
            Operand::Box(b) if b.kind == Kind::Int => {
                let info = self.info_mut(b);
                info.bound.intersect(bound);
                info.bound
            }
            other => self.bound(other),
        }
    }

    /// Whether a reference is known non-null.
    pub fn is_nonnull(&self, op: Operand) -> bool {
        match self.get(op) {
            Operand::Const(v) => !v.is_null(),
            Operand::Box(b) => self.info(b).map_or(false, |i| i.nonnull || i.virt.is_some()),
        }
    }

    /// Known class of a reference.
    pub fn known_class(&self, op: Operand) -> Option<GcRef> {
        match self.get(op) {
            Operand::Box(b) => self
                .info(b)
                .and_then(|i| i.known_class.or_else(|| i.virt.as_ref().and_then(VirtualInfo::known_class))),
            Operand::Const(Value::Ref(r)) => self.const_classes.get(&r).copied(),
            Operand::Const(_) => None,
        }
    }

    /// Record the class of a reference constant.
    pub fn set_const_class(&mut self, obj: GcRef, class: GcRef) {
        self.const_classes.insert(obj, class);
    }

    /// Whether an operand is a virtual allocation.
    pub fn is_virtual(&self, op: Operand) -> bool {
        self.virtual_box(op).is_some()
    }

    /// The box of a virtual allocation.
    pub fn virtual_box(&self, op: Operand) -> Option<BoxRef> {
        match self.get(op) {
            Operand::Box(b) if self.info(b).map_or(false, |i| i.virt.is_some()) => Some(b),
            _ => None,
        }
    }

    /// Contents of a virtual.
    pub fn virt(&self, b: BoxRef) -> Option<&VirtualInfo> {
        self.info(b).and_then(|i| i.virt.as_ref())
    }

    /// Contents of a virtual, mutably.
    pub fn virt_mut(&mut self, b: BoxRef) -> Option<&mut VirtualInfo> {
        self.infos.get_mut(&b.id).and_then(|i| i.virt.as_mut())
    }
}

impl VirtualView for OptState {
    fn resolve(&self, op: Operand) -> Operand {
        self.get(op)
    }

    fn virtual_contents(&self, b: BoxRef) -> Option<VirtualContents> {
        self.virt(b).map(|v| match v {
            VirtualInfo::Struct { size, fields } => VirtualContents::Struct {
                size: size.clone(),
                fields: fields.clone(),
            },
            VirtualInfo::Array { descr, items } => VirtualContents::Array {
                descr: descr.clone(),
                items: items.clone(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::DescrTable;

    #[test]
    fn test_forwarding_chain() {
        let mut state = OptState::new();
        let a = BoxRef::new(0, Kind::Int);
        let b = BoxRef::new(1, Kind::Int);
        state.make_equal_to(b, Operand::Box(a));
        state.make_constant(a, Value::int(5));
        assert_eq!(state.get(Operand::Box(b)), Operand::int(5));
        assert_eq!(state.bound(Operand::Box(b)), IntBound::exact(5));
    }

    #[test]
    fn test_virtual_field_defaults_to_zero() {
        let mut table = DescrTable::new();
        let size = table.size("P", None, 2);
        let x = table.field("P.x", Kind::Int, 0);
        let y = table.field("P.y", Kind::Ref, 1);
        let mut v = VirtualInfo::Struct { size, fields: Vec::new() };
        v.set_field(&x, Operand::int(3));
        assert_eq!(v.field(&x), Some(Operand::int(3)));
        assert_eq!(v.field(&y), Some(Operand::Const(Value::NULL)));
    }

    #[test]
    fn test_virtual_is_nonnull() {
        let mut table = DescrTable::new();
        let size = table.size("P", None, 0);
        let mut state = OptState::new();
        let p = BoxRef::new(0, Kind::Ref);
        assert!(!state.is_nonnull(Operand::Box(p)));
        state.info_mut(p).virt = Some(VirtualInfo::Struct { size, fields: Vec::new() });
        assert!(state.is_nonnull(Operand::Box(p)));
        assert!(state.is_virtual(Operand::Box(p)));
    }
}
