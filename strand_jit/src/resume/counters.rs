//! Per-value failure counters for `guard_value`.
//!
//! A promoted value that keeps changing would otherwise make its guard
//! hot for the wrong reason: ten failures with ten different values are
//! not a reason to build a bridge specialized on one of them. Each guard
//! therefore counts failures per observed value, in a small fixed table.

use strand_core::Value;

/// Number of (value, count) slots.
pub const NUM_SLOTS: usize = 5;

/// Five `(value, count)` pairs. A new value takes an unused slot; when
/// none is left it replaces the slot holding the third highest count,
/// so the two most frequent values survive and the newest one does not
/// always get evicted.
#[derive(Debug, Clone, Default)]
pub struct ResumeGuardCounters {
    values: [Value; NUM_SLOTS],
    counters: [u32; NUM_SLOTS],
}

impl ResumeGuardCounters {
    /// All slots unused.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one failure with `value`; returns the updated count for it.
    pub fn see(&mut self, value: Value) -> u32 {
        let mut unused = None;
        for i in 0..NUM_SLOTS {
            let count = self.counters[i];
            if count > 0 {
                if self.values[i] == value {
                    self.counters[i] = count + 1;
                    return count + 1;
                }
            } else {
                unused = Some(i);
            }
        }
        if let Some(i) = unused {
            self.counters[i] = 1;
            self.values[i] = value;
            return 1;
        }
        // a, b, c: indices of the highest, second and third highest counts
        let mut a = 0usize;
        let mut b: Option<usize> = None;
        let mut c: Option<usize> = None;
        for i in 1..NUM_SLOTS {
            let count = self.counters[i];
            if count > self.counters[a] {
                c = b;
                b = Some(a);
                a = i;
            } else if b.map_or(true, |b| count > self.counters[b]) {
                c = b;
                b = Some(i);
            } else if c.map_or(true, |c| count > self.counters[c]) {
                c = Some(i);
            }
        }
        let victim = c.unwrap_or(NUM_SLOTS - 1);
        self.counters[victim] = 1;
        self.values[victim] = value;
        1
    }

    /// Current counts, slot by slot.
    pub fn counts(&self) -> [u32; NUM_SLOTS] {
        self.counters
    }

    /// Forget every value.
    pub fn reset(&mut self) {
        self.counters = [0; NUM_SLOTS];
    }
}
