//! Warm-up state: counters, the jit cell directory and the entry hook.
//!
//! A public threshold `T` becomes an increment `LIMIT / T + 1` that is
//! added to a cell's counter on every hit; the bound is reached when the
//! counter exceeds `LIMIT`.
//!
//! ```text
//!   counter >= 0 ──hit──► counter += inc ──> LIMIT? ──► damp once per
//!        ▲                                                generation
//!        │ abort                                             │
//!        │                                  confirm_enter_jit│
//!   -2 tracing ◄─────────────────────────────────────────────┘
//!        │ compiled
//!        ▼
//!   -1 compiled ──hit──► execute (token alive) / reset to 0 (token gone)
//! ```

pub mod driver;
pub mod jitcell;

use std::sync::Arc;

use smallvec::SmallVec;
use strand_core::Value;
use tracing::info;

use crate::config::JitParams;
use crate::jitlog;
use crate::memmgr::TokenId;

pub use driver::{JitDriver, NO_PRINTABLE_LOCATION};
pub use jitcell::{JitCell, JitCellDict, JitCellStore, COUNTER_COMPILED, COUNTER_TRACING};

/// Green values identifying one specialization.
pub type GreenKey = SmallVec<[Value; 4]>;

/// Counters saturate here; crossing it means the bound is reached.
pub const THRESHOLD_LIMIT: i64 = i64::MAX / 2;

/// Insertions between two directory cleanups.
pub const DEFAULT_CLEANUP_INTERVAL: usize = 20_000;

/// Counter increment for a public threshold.
///
/// `t <= 0` never traces; `t < 2` behaves like 2.
pub fn compute_threshold(threshold: i64) -> i64 {
    if threshold <= 0 {
        return 0;
    }
    let threshold = threshold.max(2);
    THRESHOLD_LIMIT / threshold + 1
}

/// Which counter a hit feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// A loop header.
    Loop,
    /// A function entry.
    Function,
}

/// What the interpreter should do after a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitAction {
    /// Keep interpreting.
    Interpret,
    /// Start recording a trace.
    StartTracing,
    /// Run the compiled code of this token.
    Execute(TokenId),
    /// This key is being traced in an outer frame; do nothing.
    TracingInFlight,
}

/// Warm-up state of one driver.
pub struct WarmState {
    driver: Arc<dyn JitDriver>,
    cells: Box<dyn JitCellStore>,
    increment_threshold: i64,
    increment_function_threshold: i64,
    cleanup_interval: usize,
    inserts_since_cleanup: usize,
}

impl std::fmt::Debug for WarmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmState")
            .field("driver", &self.driver.name())
            .field("cells", &self.cells.len())
            .field("increment_threshold", &self.increment_threshold)
            .field("increment_function_threshold", &self.increment_function_threshold)
            .finish()
    }
}

impl WarmState {
    /// Warm state for `driver` with the thresholds of `params`.
    pub fn new(driver: Arc<dyn JitDriver>, params: &JitParams) -> Self {
        let cells = driver.make_cell_store();
        Self {
            driver,
            cells,
            increment_threshold: compute_threshold(params.threshold),
            increment_function_threshold: compute_threshold(params.function_threshold),
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            inserts_since_cleanup: 0,
        }
    }

    /// Recompute the increments after a parameter change.
    pub fn set_params(&mut self, params: &JitParams) {
        self.increment_threshold = compute_threshold(params.threshold);
        self.increment_function_threshold = compute_threshold(params.function_threshold);
    }

    /// Change how many insertions trigger a cleanup.
    pub fn set_cleanup_interval(&mut self, interval: usize) {
        self.cleanup_interval = interval.max(1);
    }

    /// The driver.
    #[inline]
    pub fn driver(&self) -> &Arc<dyn JitDriver> {
        &self.driver
    }

    /// Increment applied per hit.
    #[inline]
    pub fn increment(&self, entry: EntryKind) -> i64 {
        match entry {
            EntryKind::Loop => self.increment_threshold,
            EntryKind::Function => self.increment_function_threshold,
        }
    }

    /// Number of cells.
    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    /// Cell of a key, without creating it.
    pub fn cell(&self, greens: &[Value]) -> Option<&JitCell> {
        self.cells.get(self.driver.as_ref(), greens)
    }

    /// Cell of a key, created when missing.
    pub fn jit_cell_at_key(&mut self, greens: &[Value]) -> &mut JitCell {
        let (cell, inserted) = self.cells.get_or_insert(self.driver.as_ref(), greens);
        if inserted {
            self.inserts_since_cleanup += 1;
        }
        cell
    }

    /// The entry hook. `generation` is the memory manager's current
    /// generation, `can_trace` is false while another trace is being
    /// recorded, `alive` tells whether a token can still be entered.
    pub fn on_hit(
        &mut self,
        entry: EntryKind,
        greens: &[Value],
        reds: &[Value],
        generation: u64,
        can_trace: bool,
        alive: &dyn Fn(TokenId) -> bool,
    ) -> HitAction {
        let increment = self.increment(entry);
        let driver = self.driver.clone();
        let (cell, inserted) = self.cells.get_or_insert(driver.as_ref(), greens);
        let action = match cell.counter {
            COUNTER_TRACING => HitAction::TracingInFlight,
            COUNTER_COMPILED => match cell.token {
                Some(token) if alive(token) => HitAction::Execute(token),
                _ => {
                    cell.token = None;
                    cell.counter = 0;
                    HitAction::Interpret
                }
            },
            _ if cell.dont_trace_here => HitAction::Interpret,
            counter => {
                let next = counter.saturating_add(increment);
                if next <= THRESHOLD_LIMIT {
                    cell.counter = next;
                    HitAction::Interpret
                } else {
                    let tag = (generation & 0xFF) as u8;
                    if tag != cell.extra_delay {
                        cell.counter = (THRESHOLD_LIMIT as f64 * 0.98) as i64;
                        cell.extra_delay = tag;
                        HitAction::Interpret
                    } else if !driver.confirm_enter_jit(greens, reds) {
                        cell.counter = 0;
                        HitAction::Interpret
                    } else if !can_trace {
                        cell.counter = THRESHOLD_LIMIT;
                        HitAction::Interpret
                    } else {
                        cell.counter = COUNTER_TRACING;
                        HitAction::StartTracing
                    }
                }
            }
        };
        if inserted {
            self.inserts_since_cleanup += 1;
            if self.inserts_since_cleanup >= self.cleanup_interval {
                self.cleanup(alive);
            }
        }
        action
    }

    /// Attach compiled code to a key; returns the token it replaces.
    pub fn attach_procedure_to_interp(&mut self, greens: &[Value], token: TokenId) -> Option<TokenId> {
        let cell = self.jit_cell_at_key(greens);
        cell.counter = COUNTER_COMPILED;
        cell.token.replace(token).filter(|old| *old != token)
    }

    /// Token attached to a key, if it can still be entered.
    pub fn get_procedure_token(&self, greens: &[Value], alive: &dyn Fn(TokenId) -> bool) -> Option<TokenId> {
        self.cell(greens)
            .filter(|cell| cell.is_compiled())
            .and_then(|cell| cell.token)
            .filter(|token| alive(*token))
    }

    /// Never inline calls to this key (and never trace from it).
    pub fn disable_noninlinable_function(&mut self, greens: &[Value]) {
        let location = self.driver.get_printable_location(greens);
        let cell = self.jit_cell_at_key(greens);
        if !cell.dont_trace_here {
            cell.dont_trace_here = true;
            info!(target: jitlog::DISABLE_INLINING, "disabled inlining {}", location);
        }
    }

    /// Whether calls to this key may be inlined while tracing.
    pub fn can_inline(&self, greens: &[Value]) -> bool {
        !self.driver.can_never_inline(greens) && !self.cell(greens).map_or(false, |c| c.dont_trace_here)
    }

    /// Tracing from this key stopped without compiled code.
    pub fn trace_aborted(&mut self, greens: &[Value], dont_trace_here: bool) {
        let cell = self.jit_cell_at_key(greens);
        if cell.is_tracing() {
            cell.counter = 0;
        }
        if dont_trace_here {
            cell.dont_trace_here = true;
        }
    }

    /// Make the next hit on this key start tracing (unless damped).
    pub fn trace_next_iteration(&mut self, greens: &[Value]) {
        let cell = self.jit_cell_at_key(greens);
        if cell.counter >= 0 {
            cell.counter = THRESHOLD_LIMIT;
        }
    }

    /// Scale counters down and drop cold or dead cells.
    pub fn cleanup(&mut self, alive: &dyn Fn(TokenId) -> bool) {
        self.inserts_since_cleanup = 0;
        self.cells.retain(&mut |_, cell| match cell.counter {
            COUNTER_TRACING => true,
            COUNTER_COMPILED => cell.token.map_or(false, alive),
            counter => {
                cell.counter = (counter as f64 * 0.92) as i64;
                cell.dont_trace_here || cell.counter >= THRESHOLD_LIMIT / 20
            }
        });
    }

    /// In a forked child no trace is being recorded.
    pub fn after_fork(&mut self) {
        self.cells.retain(&mut |_, cell| {
            if cell.is_tracing() {
                cell.counter = 0;
            }
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::Value;

    struct TestDriver {
        confirm: bool,
    }

    impl JitDriver for TestDriver {
        fn name(&self) -> &str {
            "test"
        }
        fn confirm_enter_jit(&self, _greens: &[Value], _reds: &[Value]) -> bool {
            self.confirm
        }
        fn can_never_inline(&self, greens: &[Value]) -> bool {
            greens[0] == Value::int(-1)
        }
    }

    fn warm(threshold: i64) -> WarmState {
        let params = JitParams {
            threshold,
            ..JitParams::default()
        };
        WarmState::new(Arc::new(TestDriver { confirm: true }), &params)
    }

    fn hit(state: &mut WarmState, key: i64, generation: u64) -> HitAction {
        state.on_hit(EntryKind::Loop, &[Value::int(key)], &[], generation, true, &|_| true)
    }

    #[test]
    fn test_compute_threshold() {
        assert_eq!(compute_threshold(0), 0);
        assert_eq!(compute_threshold(-5), 0);
        assert_eq!(compute_threshold(1), compute_threshold(2));
        assert_eq!(compute_threshold(1039), THRESHOLD_LIMIT / 1039 + 1);
    }

    #[test]
    fn test_threshold_three_traces_on_third_hit() {
        let mut state = warm(3);
        assert_eq!(hit(&mut state, 42, 0), HitAction::Interpret);
        assert_eq!(hit(&mut state, 42, 0), HitAction::Interpret);
        assert!(state.cell(&[Value::int(42)]).unwrap().counter > 0);
        assert_eq!(hit(&mut state, 42, 0), HitAction::StartTracing);
        assert_eq!(hit(&mut state, 42, 0), HitAction::TracingInFlight);
    }

    #[test]
    fn test_damping_once_per_generation() {
        let mut state = warm(3);
        hit(&mut state, 1, 5);
        hit(&mut state, 1, 5);
        assert_eq!(hit(&mut state, 1, 5), HitAction::Interpret);
        let cell = state.cell(&[Value::int(1)]).unwrap();
        assert_eq!(cell.counter, (THRESHOLD_LIMIT as f64 * 0.98) as i64);
        assert_eq!(cell.extra_delay, 5);
        assert_eq!(hit(&mut state, 1, 5), HitAction::StartTracing);
    }

    #[test]
    fn test_never_trace_with_zero_threshold() {
        let mut state = warm(0);
        for _ in 0..100 {
            assert_eq!(hit(&mut state, 1, 0), HitAction::Interpret);
        }
    }

    #[test]
    fn test_confirm_enter_jit_refusal_resets() {
        let params = JitParams {
            threshold: 2,
            ..JitParams::default()
        };
        let mut state = WarmState::new(Arc::new(TestDriver { confirm: false }), &params);
        hit(&mut state, 1, 0);
        assert_eq!(hit(&mut state, 1, 0), HitAction::Interpret);
        assert_eq!(state.cell(&[Value::int(1)]).unwrap().counter, 0);
    }

    #[test]
    fn test_compiled_cell_executes_or_resets() {
        let mut state = warm(3);
        assert_eq!(state.attach_procedure_to_interp(&[Value::int(9)], TokenId(4)), None);
        assert_eq!(hit(&mut state, 9, 0), HitAction::Execute(TokenId(4)));
        assert_eq!(
            state.attach_procedure_to_interp(&[Value::int(9)], TokenId(5)),
            Some(TokenId(4))
        );
        let action = state.on_hit(EntryKind::Loop, &[Value::int(9)], &[], 0, true, &|_| false);
        assert_eq!(action, HitAction::Interpret);
        let cell = state.cell(&[Value::int(9)]).unwrap();
        assert_eq!(cell.counter, 0);
        assert_eq!(cell.token, None);
    }

    #[test]
    fn test_no_tracing_while_tracing_elsewhere() {
        let mut state = warm(2);
        let hit_busy = |state: &mut WarmState| state.on_hit(EntryKind::Loop, &[Value::int(3)], &[], 0, false, &|_| true);
        hit_busy(&mut state);
        assert_eq!(hit_busy(&mut state), HitAction::Interpret);
        assert_eq!(hit(&mut state, 3, 0), HitAction::StartTracing);
    }

    #[test]
    fn test_cleanup_drops_cold_cells() {
        let mut state = warm(1000);
        state.set_cleanup_interval(3);
        hit(&mut state, 1, 0);
        state.jit_cell_at_key(&[Value::int(2)]).counter = THRESHOLD_LIMIT - 1;
        state.jit_cell_at_key(&[Value::int(3)]).counter = COUNTER_TRACING;
        state.attach_procedure_to_interp(&[Value::int(4)], TokenId(1));
        state.cleanup(&|_| false);
        assert!(state.cell(&[Value::int(1)]).is_none());
        assert!(state.cell(&[Value::int(2)]).is_some());
        assert!(state.cell(&[Value::int(3)]).is_some());
        assert!(state.cell(&[Value::int(4)]).is_none());
    }

    #[test]
    fn test_inlining_controls() {
        let mut state = warm(3);
        assert!(state.can_inline(&[Value::int(1)]));
        assert!(!state.can_inline(&[Value::int(-1)]));
        state.disable_noninlinable_function(&[Value::int(1)]);
        assert!(!state.can_inline(&[Value::int(1)]));
        assert_eq!(hit(&mut state, 1, 0), HitAction::Interpret);
    }

    #[test]
    fn test_abort_and_fork_reset_tracing_cells() {
        let mut state = warm(2);
        hit(&mut state, 1, 0);
        assert_eq!(hit(&mut state, 1, 0), HitAction::StartTracing);
        state.trace_aborted(&[Value::int(1)], false);
        assert_eq!(state.cell(&[Value::int(1)]).unwrap().counter, 0);

        hit(&mut state, 1, 0);
        assert_eq!(hit(&mut state, 1, 0), HitAction::StartTracing);
        state.after_fork();
        assert_eq!(state.cell(&[Value::int(1)]).unwrap().counter, 0);
    }
}
