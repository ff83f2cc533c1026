//! The object heap.
//!
//! Objects live in one vector and never move. A [`GcRef`] is the index of
//! its object plus one, so address zero stays the null reference. There
//! is no collector: programs run by this VM are short lived.

use strand_core::{GcRef, Kind, Value};

use crate::bytecode::ClassId;

/// One heap object.
#[derive(Debug, Clone, PartialEq)]
pub enum HeapObject {
    /// The class object of a [`ClassDef`](crate::bytecode::ClassDef).
    Class(ClassId),
    /// An instance; `class` points at a [`HeapObject::Class`].
    Struct {
        /// Class pointer.
        class: GcRef,
        /// Field values in layout order.
        fields: Vec<Value>,
    },
    /// An integer array.
    Array(Vec<Value>),
}

/// Append-only object store.
#[derive(Debug, Default)]
pub struct Heap {
    objects: Vec<HeapObject>,
}

impl Heap {
    /// Empty heap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects ever allocated.
    #[inline]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether nothing was allocated.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn push(&mut self, object: HeapObject) -> GcRef {
        self.objects.push(object);
        GcRef(self.objects.len())
    }

    /// Allocate a class object.
    pub fn alloc_class(&mut self, class: ClassId) -> GcRef {
        self.push(HeapObject::Class(class))
    }

    /// Allocate an instance with zeroed fields of the given shapes.
    pub fn alloc_struct(&mut self, class: GcRef, kinds: impl IntoIterator<Item = Kind>) -> GcRef {
        let fields = kinds.into_iter().map(Value::zero_of).collect();
        self.push(HeapObject::Struct { class, fields })
    }

    /// Allocate a zeroed integer array.
    pub fn alloc_array(&mut self, len: usize) -> GcRef {
        self.push(HeapObject::Array(vec![Value::int(0); len]))
    }

    /// Object behind a reference.
    #[inline]
    pub fn get(&self, r: GcRef) -> Option<&HeapObject> {
        r.0.checked_sub(1).and_then(|i| self.objects.get(i))
    }

    /// Object behind a reference, mutably.
    #[inline]
    pub fn get_mut(&mut self, r: GcRef) -> Option<&mut HeapObject> {
        r.0.checked_sub(1).and_then(move |i| self.objects.get_mut(i))
    }

    /// Class pointer of an instance; null for anything else.
    pub fn class_of(&self, r: GcRef) -> GcRef {
        match self.get(r) {
            Some(HeapObject::Struct { class, .. }) => *class,
            _ => GcRef::NULL,
        }
    }

    /// Field of an instance.
    pub fn field(&self, r: GcRef, index: usize) -> Option<Value> {
        match self.get(r) {
            Some(HeapObject::Struct { fields, .. }) => fields.get(index).copied(),
            _ => None,
        }
    }

    /// Write a field of an instance; false when there is no such field.
    pub fn set_field(&mut self, r: GcRef, index: usize, value: Value) -> bool {
        match self.get_mut(r) {
            Some(HeapObject::Struct { fields, .. }) => match fields.get_mut(index) {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    /// Items of an array.
    pub fn array(&self, r: GcRef) -> Option<&[Value]> {
        match self.get(r) {
            Some(HeapObject::Array(items)) => Some(items),
            _ => None,
        }
    }

    /// Items of an array, mutably.
    pub fn array_mut(&mut self, r: GcRef) -> Option<&mut Vec<Value>> {
        match self.get_mut(r) {
            Some(HeapObject::Array(items)) => Some(items),
            _ => None,
        }
    }
}
