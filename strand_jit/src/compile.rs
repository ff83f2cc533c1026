//! Guard descrs and the compile driver.
//!
//! After optimization every guard carries [`ResumeData`] and its fail
//! args. Compiling turns that into a [`GuardDescr`] owned by the loop
//! token, hands the trace to the backend and, for bridges, patches the
//! failing guard.
//!
//! ```text
//!   recorded trace ──► optimize ──► attach GuardDescrs ──► backend
//!                                        │
//!                                        └─► LoopToken.descrs
//! ```

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use strand_core::{JitResult, Kind, Value};

use crate::backend::Backend;
use crate::config::JitParams;
use crate::history::{Descr, Opcode, Operand, ResOp, Trace};
use crate::jitlog::PassCount;
use crate::memmgr::{LoopToken, TokenId};
use crate::opt;
use crate::resume::{ResumeData, ResumeGuardCounters};
use crate::warmstate::{EntryKind, GreenKey};

// =============================================================================
// GuardDescr
// =============================================================================

/// What leaving compiled code through a descr means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// A guard failed; resume the interpreter.
    Guard,
    /// The trace finished; its args are the result.
    Finish,
}

/// Counter value of a guard that has a bridge attached.
const ST_BRIDGED: i64 = -1;

/// Metadata of one exit of compiled code.
#[derive(Debug)]
pub struct GuardDescr {
    id: u64,
    owner: TokenId,
    opcode: Opcode,
    kind: ExitKind,
    resume: Arc<ResumeData>,
    fail_kinds: Vec<Kind>,
    value_slot: Option<usize>,
    status: AtomicI64,
    per_value: Mutex<ResumeGuardCounters>,
}

impl GuardDescr {
    /// Descr of a guard.
    pub fn guard(
        id: u64,
        owner: TokenId,
        opcode: Opcode,
        resume: Arc<ResumeData>,
        fail_kinds: Vec<Kind>,
        value_slot: Option<usize>,
    ) -> Self {
        Self {
            id,
            owner,
            opcode,
            kind: ExitKind::Guard,
            resume,
            fail_kinds,
            value_slot,
            status: AtomicI64::new(0),
            per_value: Mutex::new(ResumeGuardCounters::new()),
        }
    }

    /// Descr of a `finish`.
    pub fn finish(id: u64, owner: TokenId, fail_kinds: Vec<Kind>) -> Self {
        Self {
            kind: ExitKind::Finish,
            ..Self::guard(id, owner, Opcode::Finish, Arc::new(ResumeData::default()), fail_kinds, None)
        }
    }

    /// Unique id.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Token whose compiled code contains this exit.
    #[inline]
    pub fn owner(&self) -> TokenId {
        self.owner
    }

    /// Guard opcode as compiled (after guard merging).
    #[inline]
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Exit kind.
    #[inline]
    pub fn kind(&self) -> ExitKind {
        self.kind
    }

    /// Whether this is the descr of a `finish`.
    #[inline]
    pub fn is_finish(&self) -> bool {
        self.kind == ExitKind::Finish
    }

    /// Resume data.
    #[inline]
    pub fn resume(&self) -> &Arc<ResumeData> {
        &self.resume
    }

    /// Shapes of the fail args.
    #[inline]
    pub fn fail_kinds(&self) -> &[Kind] {
        &self.fail_kinds
    }

    /// For `guard_value`: the fail arg holding the tested value.
    #[inline]
    pub fn value_slot(&self) -> Option<usize> {
        self.value_slot
    }

    /// Failure count, or -1 once bridged.
    #[inline]
    pub fn status(&self) -> i64 {
        self.status.load(Ordering::Acquire)
    }

    /// Whether a bridge is attached.
    #[inline]
    pub fn is_bridged(&self) -> bool {
        self.status() == ST_BRIDGED
    }

    /// Count one failure. Returns true when the failure count before this
    /// one had already reached `eagerness`, i.e. on failure
    /// `eagerness + 1`. `guard_value` counts per observed value.
    pub fn must_compile(&self, fail_values: &[Value], eagerness: u32) -> bool {
        if self.is_bridged() || self.is_finish() {
            return false;
        }
        let prior = match self.value_slot.and_then(|slot| fail_values.get(slot)) {
            Some(value) => {
                self.status.fetch_add(1, Ordering::AcqRel);
                i64::from(self.per_value.lock().see(*value)) - 1
            }
            None => self.status.fetch_add(1, Ordering::AcqRel),
        };
        prior >= i64::from(eagerness)
    }

    /// Start counting from zero again after a bridge failed to compile.
    pub fn reset_counter(&self) {
        if !self.is_bridged() {
            self.status.store(0, Ordering::Release);
            self.per_value.lock().reset();
        }
    }

    /// Record that a bridge has been attached.
    pub fn mark_bridged(&self) {
        self.status.store(ST_BRIDGED, Ordering::Release);
    }
}

// =============================================================================
// Compile driver
// =============================================================================

/// Everything compilation needs from the runtime.
pub struct CompileCx<'a> {
    /// Backend receiving the code.
    pub backend: &'a dyn Backend,
    /// Tunables.
    pub params: &'a JitParams,
    /// Source of guard descr ids.
    pub guard_ids: &'a AtomicU64,
}

/// A compiled loop or entry trace.
#[derive(Debug)]
pub struct CompiledLoop {
    /// The new token (not yet registered with the memory manager).
    pub token: Arc<LoopToken>,
    /// The trace as given to the backend.
    pub trace: Trace,
    /// Op counts per optimizer stage.
    pub counts: Vec<PassCount>,
}

/// A compiled bridge.
#[derive(Debug)]
pub struct CompiledBridge {
    /// The trace as given to the backend.
    pub trace: Trace,
    /// Op counts per optimizer stage.
    pub counts: Vec<PassCount>,
}

/// Optimize and compile a recorded loop or entry trace for `greenkey`.
pub fn compile_loop(
    cx: &CompileCx<'_>,
    id: TokenId,
    driver: usize,
    greenkey: GreenKey,
    entry: EntryKind,
    recorded: &Trace,
) -> JitResult<CompiledLoop> {
    let optimized = opt::optimize_loop(recorded, cx.params)?;
    let kinds: Vec<Kind> = recorded.inputargs.iter().map(|b| b.kind).collect();
    let token = Arc::new(LoopToken::new(
        id,
        driver,
        greenkey,
        entry,
        cx.backend.make_execute_token(&kinds),
    ));
    let (trace, descrs) = attach_descrs(optimized.trace, id, cx.guard_ids);
    cx.backend.compile_loop(&token, &trace)?;
    token.add_descrs(descrs);
    for target in jump_targets(&trace) {
        token.record_jump_to(target);
    }
    Ok(CompiledLoop {
        token,
        trace,
        counts: optimized.counts,
    })
}

/// Optimize and compile a bridge from `guard`, owned by `owner`.
pub fn compile_bridge(
    cx: &CompileCx<'_>,
    guard: &Arc<GuardDescr>,
    owner: &LoopToken,
    recorded: &Trace,
) -> JitResult<CompiledBridge> {
    let optimized = opt::optimize_bridge(recorded, cx.params)?;
    let (trace, descrs) = attach_descrs(optimized.trace, owner.id, cx.guard_ids);
    cx.backend.compile_bridge(guard, &trace)?;
    owner.add_descrs(descrs);
    guard.mark_bridged();
    owner.add_bridge();
    for target in jump_targets(&trace) {
        owner.record_jump_to(target);
    }
    Ok(CompiledBridge {
        trace,
        counts: optimized.counts,
    })
}

/// Replace resume data with guard descrs owned by `owner`.
fn attach_descrs(mut trace: Trace, owner: TokenId, ids: &AtomicU64) -> (Trace, Vec<Arc<GuardDescr>>) {
    let mut descrs = Vec::new();
    for op in &mut trace.ops {
        let descr = match (&op.descr, op.opcode) {
            (Some(Descr::Resume(data)), opcode) if opcode.is_guard() => {
                let fail_kinds = fail_kinds(op);
                let value_slot = if opcode == Opcode::GuardValue {
                    op.fail_args
                        .as_ref()
                        .and_then(|args| args.iter().position(|a| *a == op.arg(0)))
                } else {
                    None
                };
                let id = ids.fetch_add(1, Ordering::Relaxed);
                GuardDescr::guard(id, owner, opcode, data.clone(), fail_kinds, value_slot)
            }
            (_, Opcode::Finish) => {
                let kinds = op.args.iter().map(Operand::kind).collect();
                GuardDescr::finish(ids.fetch_add(1, Ordering::Relaxed), owner, kinds)
            }
            _ => continue,
        };
        let descr = Arc::new(descr);
        op.descr = Some(Descr::Fail(descr.clone()));
        descrs.push(descr);
    }
    (trace, descrs)
}

fn fail_kinds(op: &ResOp) -> Vec<Kind> {
    op.fail_args
        .as_ref()
        .map(|args| args.iter().map(Operand::kind).collect())
        .unwrap_or_default()
}

fn jump_targets(trace: &Trace) -> Vec<TokenId> {
    trace
        .ops
        .iter()
        .filter_map(|op| match (op.opcode, &op.descr) {
            (Opcode::Jump, Some(Descr::Token(t))) | (Opcode::CallAssembler, Some(Descr::Token(t))) => Some(*t),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard_descr(value_slot: Option<usize>) -> GuardDescr {
        GuardDescr::guard(
            1,
            TokenId(1),
            Opcode::GuardTrue,
            Arc::new(ResumeData::default()),
            vec![Kind::Int],
            value_slot,
        )
    }

    #[test]
    fn test_bridge_on_the_failure_after_eagerness() {
        let descr = guard_descr(None);
        let values = [Value::int(1)];
        assert!(!descr.must_compile(&values, 3));
        assert!(!descr.must_compile(&values, 3));
        assert!(!descr.must_compile(&values, 3));
        assert_eq!(descr.status(), 3);
        assert!(descr.must_compile(&values, 3));
    }

    #[test]
    fn test_zero_eagerness_bridges_immediately() {
        let descr = guard_descr(None);
        assert!(descr.must_compile(&[], 0));
    }

    #[test]
    fn test_bridged_guard_stops_counting() {
        let descr = guard_descr(None);
        descr.mark_bridged();
        assert!(descr.is_bridged());
        assert!(!descr.must_compile(&[], 0));
        descr.reset_counter();
        assert_eq!(descr.status(), -1);
    }

    #[test]
    fn test_guard_value_counts_per_value() {
        let descr = guard_descr(Some(0));
        assert!(!descr.must_compile(&[Value::int(8)], 1));
        assert!(!descr.must_compile(&[Value::int(9)], 1));
        assert!(descr.must_compile(&[Value::int(8)], 1));
    }

    #[test]
    fn test_reset_counter() {
        let descr = guard_descr(None);
        assert!(!descr.must_compile(&[], 1));
        descr.reset_counter();
        assert!(!descr.must_compile(&[], 1));
        assert!(descr.must_compile(&[], 1));
    }

    #[test]
    fn test_finish_descr_never_bridges() {
        let descr = GuardDescr::finish(4, TokenId(2), vec![Kind::Int]);
        assert!(descr.is_finish());
        assert!(!descr.must_compile(&[Value::int(0)], 0));
    }
}
