//! Heap caching.
//!
//! Remembers field values, constant-index array items and array lengths
//! per descr, so that repeated reads are replaced by the known value.
//! The last write to each field descr is kept pending and only emitted
//! when something could observe it: a guard, a call, the end of the
//! trace, or a read of the same field on another object.
//!
//! ```text
//!   fields[descr] = { obj -> value }, lazy write
//!   items[descr]  = { (array, index) -> value }
//!   lengths       = { array -> length }
//! ```

use std::sync::Arc;

use rustc_hash::FxHashMap;
use strand_core::JitResult;

use super::{Optimizer, Stage};
use crate::history::{ArrayDescr, Descr, FieldDescr, Opcode, Operand, ResOp, WriteEffect};

#[derive(Debug)]
struct FieldCache {
    descr: Arc<FieldDescr>,
    values: FxHashMap<Operand, Operand>,
    lazy: Option<(u64, ResOp)>,
}

/// State of the heap stage.
#[derive(Debug, Default)]
pub struct HeapState {
    fields: FxHashMap<u32, FieldCache>,
    items: FxHashMap<u32, FxHashMap<(Operand, i64), Operand>>,
    lengths: FxHashMap<Operand, (Arc<ArrayDescr>, Operand)>,
    seq: u64,
}

impl HeapState {
    fn field_cache(&mut self, descr: &Arc<FieldDescr>) -> &mut FieldCache {
        self.fields.entry(descr.index).or_insert_with(|| FieldCache {
            descr: descr.clone(),
            values: FxHashMap::default(),
            lazy: None,
        })
    }

    fn cached_field(&self, descr: &FieldDescr, obj: Operand) -> Option<Operand> {
        self.fields.get(&descr.index).and_then(|c| c.values.get(&obj)).copied()
    }

    /// Known field values: `(descr, object, value)`.
    pub fn known_fields(&self) -> Vec<(Arc<FieldDescr>, Operand, Operand)> {
        let mut out: Vec<_> = self
            .fields
            .values()
            .flat_map(|c| c.values.iter().map(move |(obj, value)| (c.descr.clone(), *obj, *value)))
            .collect();
        out.sort_by_key(|(descr, _, _)| descr.index);
        out
    }

    /// Known array lengths: `(descr, array, length)`.
    pub fn known_lengths(&self) -> Vec<(Arc<ArrayDescr>, Operand, Operand)> {
        self.lengths
            .iter()
            .map(|(arr, (descr, len))| (descr.clone(), *arr, *len))
            .collect()
    }

    /// Make a field value known without emitting anything.
    pub fn seed_field(&mut self, descr: &Arc<FieldDescr>, obj: Operand, value: Operand) {
        self.field_cache(descr).values.insert(obj, value);
    }

    /// Make an array length known without emitting anything.
    pub fn seed_length(&mut self, descr: &Arc<ArrayDescr>, arr: Operand, len: Operand) {
        self.lengths.insert(arr, (descr.clone(), len));
    }

    fn clear(&mut self) {
        for cache in self.fields.values_mut() {
            cache.values.clear();
        }
        self.items.clear();
    }

    fn invalidate(&mut self, writes: &WriteEffect) {
        match writes {
            WriteEffect::Nothing => {}
            WriteEffect::Some { fields, arrays } => {
                for index in fields {
                    if let Some(cache) = self.fields.get_mut(index) {
                        cache.values.clear();
                    }
                }
                for index in arrays {
                    self.items.remove(index);
                }
            }
            WriteEffect::Everything => self.clear(),
        }
    }
}

impl Optimizer<'_> {
    pub(crate) fn heap(&mut self, op: ResOp) -> JitResult<()> {
        match op.opcode {
            Opcode::GetfieldGc | Opcode::GetfieldGcPure => self.heap_getfield(op),
            Opcode::SetfieldGc => self.heap_setfield(op),
            Opcode::GetarrayitemGc => self.heap_getitem(op),
            Opcode::SetarrayitemGc => self.heap_setitem(op),
            Opcode::ArraylenGc => {
                let (arr, result) = (op.arg(0), op.result);
                if let (Some(result), Some((_, len))) = (result, self.heap.lengths.get(&arr)) {
                    let len = *len;
                    self.state.make_equal_to(result, len);
                    return Ok(());
                }
                let descr = op.descr.as_ref().and_then(Descr::as_array).cloned();
                self.next(Stage::Heap, op)?;
                if let (Some(result), Some(descr)) = (result, descr) {
                    self.heap.lengths.insert(arr, (descr, Operand::Box(result)));
                }
                Ok(())
            }
            Opcode::NewArray => {
                let (len, result) = (op.arg(0), op.result);
                let descr = op.descr.as_ref().and_then(Descr::as_array).cloned();
                self.next(Stage::Heap, op)?;
                if let (Some(result), Some(descr)) = (result, descr) {
                    self.heap.lengths.insert(Operand::Box(result), (descr, len));
                }
                Ok(())
            }
            Opcode::Label => {
                self.flush_heap()?;
                self.heap.clear();
                self.heap.lengths.clear();
                self.next(Stage::Heap, op)
            }
            Opcode::CallAssembler => {
                self.flush_heap()?;
                self.next(Stage::Heap, op)?;
                self.heap.clear();
                Ok(())
            }
            opcode if opcode.is_call() => {
                self.flush_heap()?;
                let writes = match &op.descr {
                    Some(Descr::Call(call)) if call.effect.is_readonly() => WriteEffect::Nothing,
                    Some(Descr::Call(call)) => call.effect.writes.clone(),
                    _ => WriteEffect::Everything,
                };
                self.next(Stage::Heap, op)?;
                self.heap.invalidate(&writes);
                Ok(())
            }
            opcode if opcode.is_guard() || opcode.is_final() => {
                self.flush_heap()?;
                self.next(Stage::Heap, op)
            }
            opcode if opcode.has_no_side_effect() => self.next(Stage::Heap, op),
            _ => {
                self.flush_heap()?;
                self.heap.clear();
                self.next(Stage::Heap, op)
            }
        }
    }

    fn heap_getfield(&mut self, op: ResOp) -> JitResult<()> {
        let Some(field) = op.descr.as_ref().and_then(Descr::as_field).cloned() else {
            return self.next(Stage::Heap, op);
        };
        let (obj, result) = (op.arg(0), op.result);
        if let (Some(result), Some(value)) = (result, self.heap.cached_field(&field, obj)) {
            self.state.make_equal_to(result, value);
            return Ok(());
        }
        // A pending write to another object may alias this one.
        if let Some(cache) = self.heap.fields.get_mut(&field.index) {
            if matches!(&cache.lazy, Some((_, lazy)) if lazy.arg(0) != obj) {
                if let Some((_, lazy)) = cache.lazy.take() {
                    self.next(Stage::Heap, lazy)?;
                }
            }
        }
        self.next(Stage::Heap, op)?;
        if let Some(result) = result {
            self.heap.field_cache(&field).values.insert(obj, Operand::Box(result));
        }
        Ok(())
    }

    fn heap_setfield(&mut self, op: ResOp) -> JitResult<()> {
        let Some(field) = op.descr.as_ref().and_then(Descr::as_field).cloned() else {
            self.flush_heap()?;
            self.heap.clear();
            return self.next(Stage::Heap, op);
        };
        let (obj, value) = (op.arg(0), op.arg(1));
        if self.heap.cached_field(&field, obj).map(|v| self.state.get(v)) == Some(value) {
            return Ok(());
        }
        let previous = self.heap.field_cache(&field).lazy.take();
        if let Some((_, lazy)) = previous {
            if lazy.arg(0) != obj {
                self.next(Stage::Heap, lazy)?;
            }
        }
        self.heap.seq += 1;
        let seq = self.heap.seq;
        let cache = self.heap.field_cache(&field);
        cache.values.clear();
        cache.values.insert(obj, value);
        cache.lazy = Some((seq, op));
        Ok(())
    }

    fn heap_getitem(&mut self, op: ResOp) -> JitResult<()> {
        let (Some(descr), Some(index)) = (op.descr.as_ref().and_then(Descr::as_array).cloned(), op.arg(1).const_int())
        else {
            return self.next(Stage::Heap, op);
        };
        let (arr, result) = (op.arg(0), op.result);
        let known = self.heap.items.get(&descr.index).and_then(|m| m.get(&(arr, index))).copied();
        if let (Some(result), Some(value)) = (result, known) {
            self.state.make_equal_to(result, value);
            return Ok(());
        }
        self.next(Stage::Heap, op)?;
        if let Some(result) = result {
            self.heap
                .items
                .entry(descr.index)
                .or_default()
                .insert((arr, index), Operand::Box(result));
        }
        Ok(())
    }

    fn heap_setitem(&mut self, op: ResOp) -> JitResult<()> {
        let Some(descr) = op.descr.as_ref().and_then(Descr::as_array).cloned() else {
            self.flush_heap()?;
            self.heap.clear();
            return self.next(Stage::Heap, op);
        };
        let (arr, value) = (op.arg(0), op.arg(2));
        let Some(index) = op.arg(1).const_int() else {
            self.heap.items.remove(&descr.index);
            return self.next(Stage::Heap, op);
        };
        let cache = self.heap.items.entry(descr.index).or_default();
        if cache.get(&(arr, index)).map(|v| self.state.get(*v)) == Some(value) {
            return Ok(());
        }
        cache.retain(|(_, i), _| *i != index);
        cache.insert((arr, index), value);
        self.next(Stage::Heap, op)
    }

    /// Emit every pending write, oldest first.
    pub(crate) fn flush_heap(&mut self) -> JitResult<()> {
        let mut lazies: Vec<(u64, ResOp)> = self.heap.fields.values_mut().filter_map(|c| c.lazy.take()).collect();
        lazies.sort_by_key(|(seq, _)| *seq);
        for (_, op) in lazies {
            self.next(Stage::Heap, op)?;
        }
        Ok(())
    }
}
