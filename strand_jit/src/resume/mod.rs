//! Guard snapshots and resume data.
//!
//! A guard is recorded with a [`Snapshot`]: for every live interpreter
//! frame (outermost first) the code, the pc to resume at and the operand
//! held by each register, plus the virtualizable state. After
//! optimization the snapshot is compressed into [`ResumeData`]:
//!
//! ```text
//!   slot ──► Tagged(value << 2 | tag)
//!            tag 0  CONST    index into `consts`
//!            tag 1  INT      small integer stored inline
//!            tag 2  BOX      index into the guard's fail args
//!            tag 3  VIRTUAL  index into `virtuals` (rebuilt on failure)
//! ```
//!
//! On guard failure the data is decoded by a [`Materializer`]: the
//! concrete one reads the dead frame's fail-arg values and allocates the
//! virtuals on the heap, the symbolic one (bridge recording) produces
//! trace operands and records the allocations.

pub mod counters;

use std::sync::Arc;

use rustc_hash::FxHashMap;
use strand_core::{JitError, JitResult, Value};

use crate::backend::ExecCx;
use crate::history::{ArrayDescr, BoxRef, FieldDescr, Operand, SizeDescr};

pub use counters::ResumeGuardCounters;

/// Identifier of an interpreter code object.
pub type CodeId = u32;

// =============================================================================
// Snapshot
// =============================================================================

/// One interpreter frame as seen by a recorded guard.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSnapshot {
    /// Code object of the frame.
    pub code: CodeId,
    /// Where the frame resumes. For outer frames this is the pc of the
    /// call that is still in progress.
    pub pc: u32,
    /// Operand of every register.
    pub slots: Vec<Operand>,
}

/// All live frames at a guard, outermost first.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    /// Frames, outermost first.
    pub frames: Vec<FrameSnapshot>,
    /// Virtualizable fields.
    pub vable: Vec<Operand>,
}

impl Snapshot {
    /// Copy with every operand passed through `f`.
    pub fn map_operands(&self, mut f: impl FnMut(Operand) -> Operand) -> Snapshot {
        Snapshot {
            frames: self
                .frames
                .iter()
                .map(|frame| FrameSnapshot {
                    code: frame.code,
                    pc: frame.pc,
                    slots: frame.slots.iter().map(|op| f(*op)).collect(),
                })
                .collect(),
            vable: self.vable.iter().map(|op| f(*op)).collect(),
        }
    }

    /// Every operand, frames first.
    pub fn operands(&self) -> impl Iterator<Item = &Operand> {
        self.frames
            .iter()
            .flat_map(|frame| frame.slots.iter())
            .chain(self.vable.iter())
    }

    /// Innermost frame.
    pub fn top(&self) -> Option<&FrameSnapshot> {
        self.frames.last()
    }
}

// =============================================================================
// Tagged slots
// =============================================================================

const TAGBITS: u32 = 2;
const TAGMASK: i32 = 3;
const TAG_CONST: i32 = 0;
const TAG_INT: i32 = 1;
const TAG_BOX: i32 = 2;
const TAG_VIRTUAL: i32 = 3;

/// Largest payload a tagged slot can carry.
pub const TAGGED_MAX: i32 = i32::MAX >> TAGBITS;
/// Smallest payload a tagged slot can carry.
pub const TAGGED_MIN: i32 = i32::MIN >> TAGBITS;

/// Decoded meaning of a tagged slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// Index into the constant pool.
    Const(usize),
    /// Small inline integer.
    Int(i64),
    /// Index into the fail args.
    Box(usize),
    /// Index into the virtual recipes.
    Virtual(usize),
}

/// A compact resume slot: payload in the high bits, tag in the low two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tagged(i32);

impl Tagged {
    fn new(value: i64, tag: i32) -> JitResult<Tagged> {
        if value < TAGGED_MIN as i64 || value > TAGGED_MAX as i64 {
            return Err(JitError::Backend(format!("resume slot payload {} out of range", value)));
        }
        Ok(Tagged(((value as i32) << TAGBITS) | tag))
    }

    /// Slot referring to fail arg `index`.
    pub fn boxed(index: usize) -> JitResult<Tagged> {
        Tagged::new(index as i64, TAG_BOX)
    }

    /// Slot referring to virtual recipe `index`.
    pub fn virtual_at(index: usize) -> JitResult<Tagged> {
        Tagged::new(index as i64, TAG_VIRTUAL)
    }

    /// Whether `value` can be stored inline.
    #[inline]
    pub fn fits_inline(value: i64) -> bool {
        value >= TAGGED_MIN as i64 && value <= TAGGED_MAX as i64
    }

    /// Decode the tag.
    pub fn tag(self) -> Tag {
        let payload = self.0 >> TAGBITS;
        match self.0 & TAGMASK {
            TAG_CONST => Tag::Const(payload as usize),
            TAG_INT => Tag::Int(payload as i64),
            TAG_BOX => Tag::Box(payload as usize),
            _ => Tag::Virtual(payload as usize),
        }
    }

    /// Raw encoded word.
    #[inline]
    pub fn raw(self) -> i32 {
        self.0
    }
}

// =============================================================================
// ResumeData
// =============================================================================

/// One frame of resume data.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeFrame {
    /// Code object.
    pub code: CodeId,
    /// Resume pc.
    pub pc: u32,
    /// Encoded registers.
    pub slots: Vec<Tagged>,
}

/// How to rebuild an object that was virtual at the guard.
#[derive(Debug, Clone, PartialEq)]
pub enum VirtualRecipe {
    /// A struct: allocate, then store the listed fields.
    Struct {
        /// Allocated type.
        size: Arc<SizeDescr>,
        /// Non-default fields.
        fields: Vec<(Arc<FieldDescr>, Tagged)>,
    },
    /// An array of fixed length.
    Array {
        /// Array type.
        descr: Arc<ArrayDescr>,
        /// Every item.
        items: Vec<Tagged>,
    },
}

/// Encoded resume information of one guard.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResumeData {
    /// Frames, outermost first.
    pub frames: Vec<ResumeFrame>,
    /// Virtualizable fields.
    pub vable: Vec<Tagged>,
    /// Constant pool.
    pub consts: Vec<Value>,
    /// Virtual recipes.
    pub virtuals: Vec<VirtualRecipe>,
    /// Number of fail args the encoding refers to.
    pub num_failargs: usize,
}

impl ResumeData {
    /// Innermost frame's code and pc.
    pub fn location(&self) -> Option<(CodeId, u32)> {
        self.frames.last().map(|f| (f.code, f.pc))
    }

    /// Number of frames.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Contents of an object that is still virtual at a guard.
#[derive(Debug, Clone)]
pub enum VirtualContents {
    /// Struct fields that have been written.
    Struct {
        /// Allocated type.
        size: Arc<SizeDescr>,
        /// Field values.
        fields: Vec<(Arc<FieldDescr>, Operand)>,
    },
    /// Array items.
    Array {
        /// Array type.
        descr: Arc<ArrayDescr>,
        /// Item values.
        items: Vec<Operand>,
    },
}

/// The optimizer's view of operands while encoding a guard.
pub trait VirtualView {
    /// Canonical operand (constant if known).
    fn resolve(&self, op: Operand) -> Operand;
    /// Contents of `b` if it is virtual.
    fn virtual_contents(&self, b: BoxRef) -> Option<VirtualContents>;
}

/// Compresses a snapshot into resume data plus fail args.
pub struct ResumeWriter<'a, V: VirtualView> {
    view: &'a V,
    fail_args: Vec<Operand>,
    box_index: FxHashMap<u32, usize>,
    consts: Vec<Value>,
    const_index: FxHashMap<Value, usize>,
    virtuals: Vec<Option<VirtualRecipe>>,
    virtual_index: FxHashMap<u32, usize>,
}

impl<'a, V: VirtualView> ResumeWriter<'a, V> {
    /// Writer seeded with fail args that must come first (in order).
    pub fn new(view: &'a V) -> Self {
        Self {
            view,
            fail_args: Vec::new(),
            box_index: FxHashMap::default(),
            consts: Vec::new(),
            const_index: FxHashMap::default(),
            virtuals: Vec::new(),
            virtual_index: FxHashMap::default(),
        }
    }

    /// Encode `snapshot`; returns the data and the guard's fail args.
    pub fn encode(mut self, snapshot: &Snapshot) -> JitResult<(ResumeData, Vec<Operand>)> {
        let mut frames = Vec::with_capacity(snapshot.frames.len());
        for frame in &snapshot.frames {
            let slots = frame
                .slots
                .iter()
                .map(|op| self.encode_operand(*op))
                .collect::<JitResult<Vec<_>>>()?;
            frames.push(ResumeFrame {
                code: frame.code,
                pc: frame.pc,
                slots,
            });
        }
        let vable = snapshot
            .vable
            .iter()
            .map(|op| self.encode_operand(*op))
            .collect::<JitResult<Vec<_>>>()?;
        let virtuals = self
            .virtuals
            .into_iter()
            .map(|v| v.ok_or_else(|| JitError::Backend("unfinished virtual in resume data".into())))
            .collect::<JitResult<Vec<_>>>()?;
        let data = ResumeData {
            frames,
            vable,
            consts: self.consts,
            virtuals,
            num_failargs: self.fail_args.len(),
        };
        Ok((data, self.fail_args))
    }

    fn encode_operand(&mut self, op: Operand) -> JitResult<Tagged> {
        match self.view.resolve(op) {
            Operand::Const(Value::Int(i)) if Tagged::fits_inline(i) => Tagged::new(i, TAG_INT),
            Operand::Const(value) => {
                let next = self.consts.len();
                let index = *self.const_index.entry(value).or_insert(next);
                if index == next {
                    self.consts.push(value);
                }
                Tagged::new(index as i64, TAG_CONST)
            }
            Operand::Box(b) => match self.view.virtual_contents(b) {
                Some(contents) => self.encode_virtual(b, contents),
                None => {
                    let next = self.fail_args.len();
                    let index = *self.box_index.entry(b.id).or_insert(next);
                    if index == next {
                        self.fail_args.push(Operand::Box(b));
                    }
                    Tagged::new(index as i64, TAG_BOX)
                }
            },
        }
    }

    fn encode_virtual(&mut self, b: BoxRef, contents: VirtualContents) -> JitResult<Tagged> {
        if let Some(&index) = self.virtual_index.get(&b.id) {
            return Tagged::new(index as i64, TAG_VIRTUAL);
        }
        let index = self.virtuals.len();
        self.virtuals.push(None);
        self.virtual_index.insert(b.id, index);
        let recipe = match contents {
            VirtualContents::Struct { size, fields } => {
                let mut encoded = Vec::with_capacity(fields.len());
                for (field, value) in fields {
                    encoded.push((field, self.encode_operand(value)?));
                }
                VirtualRecipe::Struct { size, fields: encoded }
            }
            VirtualContents::Array { descr, items } => {
                let items = items
                    .into_iter()
                    .map(|item| self.encode_operand(item))
                    .collect::<JitResult<Vec<_>>>()?;
                VirtualRecipe::Array { descr, items }
            }
        };
        self.virtuals[index] = Some(recipe);
        Tagged::new(index as i64, TAG_VIRTUAL)
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// Target of resume-data decoding.
pub trait Materializer {
    /// What a decoded slot becomes.
    type Item: Copy;

    /// A constant slot.
    fn constant(&mut self, value: Value) -> Self::Item;
    /// A fail-arg slot.
    fn fail_arg(&mut self, index: usize) -> Self::Item;
    /// Allocate a struct for a virtual.
    fn allocate_struct(&mut self, size: &Arc<SizeDescr>) -> Self::Item;
    /// Allocate an array for a virtual.
    fn allocate_array(&mut self, descr: &Arc<ArrayDescr>, len: usize) -> Self::Item;
    /// Store a field of a rebuilt struct.
    fn set_field(&mut self, obj: Self::Item, field: &Arc<FieldDescr>, value: Self::Item);
    /// Store an item of a rebuilt array.
    fn set_item(&mut self, array: Self::Item, descr: &Arc<ArrayDescr>, index: usize, value: Self::Item);
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame<T> {
    /// Code object.
    pub code: CodeId,
    /// Resume pc.
    pub pc: u32,
    /// Register values.
    pub slots: Vec<T>,
}

/// All decoded frames, outermost first.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded<T> {
    /// Frames.
    pub frames: Vec<DecodedFrame<T>>,
    /// Virtualizable fields.
    pub vable: Vec<T>,
}

struct Decoder<'a, M: Materializer> {
    data: &'a ResumeData,
    target: &'a mut M,
    rebuilt: Vec<Option<M::Item>>,
}

impl<M: Materializer> Decoder<'_, M> {
    fn slot(&mut self, tagged: Tagged) -> M::Item {
        match tagged.tag() {
            Tag::Const(i) => self.target.constant(self.data.consts[i]),
            Tag::Int(i) => self.target.constant(Value::Int(i)),
            Tag::Box(i) => self.target.fail_arg(i),
            Tag::Virtual(i) => self.virtual_object(i),
        }
    }

    fn virtual_object(&mut self, index: usize) -> M::Item {
        if let Some(item) = self.rebuilt[index] {
            return item;
        }
        let data = self.data;
        match &data.virtuals[index] {
            VirtualRecipe::Struct { size, fields } => {
                let obj = self.target.allocate_struct(size);
                self.rebuilt[index] = Some(obj);
                for (field, value) in fields {
                    let value = self.slot(*value);
                    self.target.set_field(obj, field, value);
                }
                obj
            }
            VirtualRecipe::Array { descr, items } => {
                let array = self.target.allocate_array(descr, items.len());
                self.rebuilt[index] = Some(array);
                for (i, item) in items.iter().enumerate() {
                    let value = self.slot(*item);
                    self.target.set_item(array, descr, i, value);
                }
                array
            }
        }
    }
}

/// Decode resume data into frames of `M::Item`.
///
/// Each virtual is rebuilt once, even when several slots (or itself)
/// refer to it.
pub fn decode<M: Materializer>(data: &ResumeData, target: &mut M) -> Decoded<M::Item> {
    let mut decoder = Decoder {
        data,
        target,
        rebuilt: vec![None; data.virtuals.len()],
    };
    let frames = data
        .frames
        .iter()
        .map(|frame| DecodedFrame {
            code: frame.code,
            pc: frame.pc,
            slots: frame.slots.iter().map(|t| decoder.slot(*t)).collect(),
        })
        .collect();
    let vable = data.vable.iter().map(|t| decoder.slot(*t)).collect();
    Decoded { frames, vable }
}

/// Decodes against a dead frame, allocating virtuals on the heap.
pub struct ConcreteMaterializer<'a> {
    values: &'a [Value],
    cx: &'a mut dyn ExecCx,
}

impl<'a> ConcreteMaterializer<'a> {
    /// Materializer over the fail-arg values of a dead frame.
    pub fn new(values: &'a [Value], cx: &'a mut dyn ExecCx) -> Self {
        Self { values, cx }
    }
}

impl Materializer for ConcreteMaterializer<'_> {
    type Item = Value;

    fn constant(&mut self, value: Value) -> Value {
        value
    }

    fn fail_arg(&mut self, index: usize) -> Value {
        self.values.get(index).copied().unwrap_or_default()
    }

    fn allocate_struct(&mut self, size: &Arc<SizeDescr>) -> Value {
        Value::Ref(self.cx.alloc_struct(size))
    }

    fn allocate_array(&mut self, descr: &Arc<ArrayDescr>, len: usize) -> Value {
        Value::Ref(self.cx.alloc_array(descr, len))
    }

    fn set_field(&mut self, obj: Value, field: &Arc<FieldDescr>, value: Value) {
        if let Some(obj) = obj.as_ref() {
            self.cx.set_field(obj, field, value);
        }
    }

    fn set_item(&mut self, array: Value, descr: &Arc<ArrayDescr>, index: usize, value: Value) {
        if let Some(array) = array.as_ref() {
            self.cx.set_item(array, descr, index, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::DescrTable;
    use strand_core::Kind;

    /// A view with no virtuals and no known constants.
    struct PlainView;

    impl VirtualView for PlainView {
        fn resolve(&self, op: Operand) -> Operand {
            op
        }
        fn virtual_contents(&self, _b: BoxRef) -> Option<VirtualContents> {
            None
        }
    }

    /// One virtual struct `p9` whose field holds `i1`, pointing to itself.
    struct CyclicView {
        size: Arc<SizeDescr>,
        value: Arc<FieldDescr>,
        next: Arc<FieldDescr>,
    }

    impl VirtualView for CyclicView {
        fn resolve(&self, op: Operand) -> Operand {
            op
        }
        fn virtual_contents(&self, b: BoxRef) -> Option<VirtualContents> {
            (b.id == 9).then(|| VirtualContents::Struct {
                size: self.size.clone(),
                fields: vec![
                    (self.value.clone(), Operand::Box(BoxRef::new(1, Kind::Int))),
                    (self.next.clone(), Operand::Box(b)),
                ],
            })
        }
    }

    /// Decodes into the fail-arg values directly and records allocations.
    #[derive(Default)]
    struct Recording {
        values: Vec<Value>,
        allocations: usize,
        stores: Vec<(usize, Value)>,
    }

    impl Materializer for Recording {
        type Item = Value;
        fn constant(&mut self, value: Value) -> Value {
            value
        }
        fn fail_arg(&mut self, index: usize) -> Value {
            self.values[index]
        }
        fn allocate_struct(&mut self, _size: &Arc<SizeDescr>) -> Value {
            self.allocations += 1;
            Value::Ref(strand_core::GcRef(0x1000 * self.allocations))
        }
        fn allocate_array(&mut self, _descr: &Arc<ArrayDescr>, _len: usize) -> Value {
            self.allocations += 1;
            Value::Ref(strand_core::GcRef(0x1000 * self.allocations))
        }
        fn set_field(&mut self, _obj: Value, field: &Arc<FieldDescr>, value: Value) {
            self.stores.push((field.offset, value));
        }
        fn set_item(&mut self, _array: Value, _descr: &Arc<ArrayDescr>, index: usize, value: Value) {
            self.stores.push((index, value));
        }
    }

    fn b(id: u32, kind: Kind) -> Operand {
        Operand::Box(BoxRef::new(id, kind))
    }

    #[test]
    fn test_tagging() {
        assert_eq!(Tagged::new(5, TAG_INT).unwrap().tag(), Tag::Int(5));
        assert_eq!(Tagged::new(-7, TAG_INT).unwrap().tag(), Tag::Int(-7));
        assert_eq!(Tagged::new(3, TAG_BOX).unwrap().tag(), Tag::Box(3));
        assert!(Tagged::new(i64::MAX, TAG_INT).is_err());
        assert!(!Tagged::fits_inline(1 << 40));
    }

    #[test]
    fn test_encode_shares_boxes_and_constants() {
        let snapshot = Snapshot {
            frames: vec![
                FrameSnapshot {
                    code: 1,
                    pc: 4,
                    slots: vec![b(0, Kind::Int), Operand::int(7), b(0, Kind::Int)],
                },
                FrameSnapshot {
                    code: 2,
                    pc: 0,
                    slots: vec![Operand::int(1 << 40), b(3, Kind::Ref), Operand::int(1 << 40)],
                },
            ],
            vable: vec![],
        };
        let (data, fail_args) = ResumeWriter::new(&PlainView).encode(&snapshot).unwrap();
        assert_eq!(fail_args, vec![b(0, Kind::Int), b(3, Kind::Ref)]);
        assert_eq!(data.consts, vec![Value::int(1 << 40)]);
        assert_eq!(data.location(), Some((2, 0)));
        assert_eq!(data.num_failargs, 2);
    }

    #[test]
    fn test_round_trip_reproduces_locals() {
        let snapshot = Snapshot {
            frames: vec![FrameSnapshot {
                code: 3,
                pc: 11,
                slots: vec![
                    b(4, Kind::Int),
                    Operand::Const(Value::float(2.5)),
                    b(5, Kind::Float),
                    Operand::Const(Value::NULL),
                    Operand::int(-3),
                ],
            }],
            vable: vec![b(4, Kind::Int)],
        };
        let (data, fail_args) = ResumeWriter::new(&PlainView).encode(&snapshot).unwrap();
        assert_eq!(fail_args.len(), 2);
        let mut target = Recording {
            values: vec![Value::int(99), Value::float(-0.0)],
            ..Recording::default()
        };
        let decoded = decode(&data, &mut target);
        assert_eq!(
            decoded.frames[0].slots,
            vec![Value::int(99), Value::float(2.5), Value::float(-0.0), Value::NULL, Value::int(-3)]
        );
        assert_eq!(decoded.vable, vec![Value::int(99)]);
        assert_eq!(target.allocations, 0);
    }

    #[test]
    fn test_cyclic_virtual_is_rebuilt_once() {
        let mut table = DescrTable::new();
        let view = CyclicView {
            size: table.size("Node", None, 2),
            value: table.field("Node.value", Kind::Int, 0),
            next: table.field("Node.next", Kind::Ref, 1),
        };
        let snapshot = Snapshot {
            frames: vec![FrameSnapshot {
                code: 0,
                pc: 0,
                slots: vec![b(9, Kind::Ref), b(9, Kind::Ref)],
            }],
            vable: vec![],
        };
        let (data, fail_args) = ResumeWriter::new(&view).encode(&snapshot).unwrap();
        assert_eq!(data.virtuals.len(), 1);
        assert_eq!(fail_args, vec![b(1, Kind::Int)]);

        let mut target = Recording {
            values: vec![Value::int(42)],
            ..Recording::default()
        };
        let decoded = decode(&data, &mut target);
        assert_eq!(target.allocations, 1);
        let obj = decoded.frames[0].slots[0];
        assert_eq!(decoded.frames[0].slots[1], obj);
        assert_eq!(target.stores, vec![(0, Value::int(42)), (1, obj)]);
    }
}
