//! Jit cells and the directory holding them.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use strand_core::Value;

use super::driver::JitDriver;
use super::GreenKey;
use crate::memmgr::TokenId;

/// Counter of a cell whose compiled code is attached.
pub const COUNTER_COMPILED: i64 = -1;
/// Counter of a cell being traced.
pub const COUNTER_TRACING: i64 = -2;

/// Per green key record of the warm state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JitCell {
    /// Warm-up count (>= 0), or [`COUNTER_COMPILED`] / [`COUNTER_TRACING`].
    pub counter: i64,
    /// Low 8 bits of the generation in which the counter was last damped.
    pub extra_delay: u8,
    /// Never trace from here and never inline calls to here.
    pub dont_trace_here: bool,
    /// Weak reference to the attached loop.
    pub token: Option<TokenId>,
}

impl JitCell {
    /// A fresh cell.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether tracing from this cell is in progress.
    #[inline]
    pub fn is_tracing(&self) -> bool {
        self.counter == COUNTER_TRACING
    }

    /// Whether compiled code is attached.
    #[inline]
    pub fn is_compiled(&self) -> bool {
        self.counter == COUNTER_COMPILED
    }
}

/// Storage of jit cells, keyed by green key with the driver's hash and
/// equality.
pub trait JitCellStore: Send {
    /// Cell of `greens`, if any.
    fn get(&self, driver: &dyn JitDriver, greens: &[Value]) -> Option<&JitCell>;

    /// Mutable cell of `greens`, if any.
    fn get_mut(&mut self, driver: &dyn JitDriver, greens: &[Value]) -> Option<&mut JitCell>;

    /// Cell of `greens`, created when missing; the flag tells whether it
    /// was created.
    fn get_or_insert(&mut self, driver: &dyn JitDriver, greens: &[Value]) -> (&mut JitCell, bool);

    /// Keep only the cells for which `keep` returns true.
    fn retain(&mut self, keep: &mut dyn FnMut(&[Value], &mut JitCell) -> bool);

    /// Number of cells.
    fn len(&self) -> usize;

    /// Whether there are no cells.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The default store: a hash map bucketed by the driver's green hash.
#[derive(Debug, Default)]
pub struct JitCellDict {
    buckets: FxHashMap<u64, SmallVec<[(GreenKey, JitCell); 1]>>,
    len: usize,
}

impl JitCellDict {
    /// Create an empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }
}

impl JitCellStore for JitCellDict {
    fn get(&self, driver: &dyn JitDriver, greens: &[Value]) -> Option<&JitCell> {
        self.buckets
            .get(&driver.hash_greens(greens))?
            .iter()
            .find(|(key, _)| driver.greens_eq(key, greens))
            .map(|(_, cell)| cell)
    }

    fn get_mut(&mut self, driver: &dyn JitDriver, greens: &[Value]) -> Option<&mut JitCell> {
        self.buckets
            .get_mut(&driver.hash_greens(greens))?
            .iter_mut()
            .find(|(key, _)| driver.greens_eq(key, greens))
            .map(|(_, cell)| cell)
    }

    fn get_or_insert(&mut self, driver: &dyn JitDriver, greens: &[Value]) -> (&mut JitCell, bool) {
        let bucket = self.buckets.entry(driver.hash_greens(greens)).or_default();
        let (index, inserted) = match bucket.iter().position(|(key, _)| driver.greens_eq(key, greens)) {
            Some(index) => (index, false),
            None => {
                bucket.push((greens.iter().copied().collect(), JitCell::new()));
                self.len += 1;
                (bucket.len() - 1, true)
            }
        };
        (&mut bucket[index].1, inserted)
    }

    fn retain(&mut self, keep: &mut dyn FnMut(&[Value], &mut JitCell) -> bool) {
        let mut len = 0;
        self.buckets.retain(|_, bucket| {
            bucket.retain(|(key, cell)| keep(key, cell));
            len += bucket.len();
            !bucket.is_empty()
        });
        self.len = len;
    }

    fn len(&self) -> usize {
        self.len
    }
}
