//! The JIT runtime context.
//!
//! [`JitRuntime`] owns everything that outlives one trace: the warm state
//! of every registered driver, the memory manager, the backend, the
//! assumptions compiled code relies on and the statistics. The
//! interpreter holds it in an `Arc` and calls into it at merge points,
//! while recording, and from compiled code (`call_assembler`).
//!
//! ```text
//!   interpreter                           JitRuntime
//!   ───────────                           ──────────
//!   merge point ─ maybe_compile_and_run ─► WarmState::on_hit
//!        ▲                                  │          │
//!        │             EnterOutcome::Tracing┘          └─► execute_token ─► Backend
//!        │                                                      │
//!   record ops ─ reached_merge_point / finish_trace             │
//!        │                  │                                   ▼
//!        │                  └─► compile_loop / compile_bridge   handle_fail
//!        │                                                      │
//!        └──────────── ExitOutcome (resume, maybe record a bridge)
//! ```
//!
//! Lock order is warm state, then memory manager. No lock is held while
//! compiled code runs, so compiled code may re-enter the runtime.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use strand_core::{JitError, JitResult, Value};
use tracing::{debug, warn};

use crate::backend::{Backend, DeadFrame, ExecCx, TraceBackend};
use crate::compile::{self, CompileCx, GuardDescr};
use crate::config::JitParams;
use crate::history::{Opcode, Operand, Trace};
use crate::jitlog;
use crate::memmgr::{LoopToken, MemoryManager, TokenId};
use crate::recorder::{TraceKind, TraceRecorder};
use crate::resume::{decode, CodeId, ConcreteMaterializer, DecodedFrame};
use crate::warmstate::{EntryKind, HitAction, JitCell, JitDriver, WarmState};

// =============================================================================
// Identifiers and outcomes
// =============================================================================

/// Handle of a driver registered with a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriverId(pub usize);

/// Handle of an assumption compiled code may depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssumptionId(pub u64);

/// What the interpreter reports at a merge point.
#[derive(Debug, Clone, Copy)]
pub struct MergePoint<'a> {
    /// Loop header or function entry.
    pub entry: EntryKind,
    /// Green key.
    pub greens: &'a [Value],
    /// Every register of the current frame. They are the red args and,
    /// when tracing starts, the trace's input args.
    pub registers: &'a [Value],
    /// Code object of the frame.
    pub code: CodeId,
    /// Pc of the merge point.
    pub pc: u32,
}

/// Interpreter frames rebuilt after compiled code failed a guard.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumedState {
    /// Frames, outermost first.
    pub frames: Vec<DecodedFrame<Value>>,
    /// Virtualizable fields.
    pub vable: Vec<Value>,
    /// Exception raised by the call a failing `guard_no_exception`
    /// protected.
    pub exception: Option<Value>,
    /// Id of the failing guard.
    pub guard: u64,
}

/// How compiled code was left.
#[derive(Debug)]
pub enum ExitOutcome {
    /// The trace reached `finish`; the value is the frame's result.
    Done(Option<Value>),
    /// A guard failed; continue interpreting from these frames.
    Resume(ResumedState),
    /// A guard became hot; continue interpreting and record a bridge.
    Bridge(ResumedState, Box<TraceRecorder>),
}

/// What the interpreter should do after [`JitRuntime::maybe_compile_and_run`].
#[derive(Debug)]
pub enum EnterOutcome {
    /// Keep interpreting.
    Interpret,
    /// Keep interpreting and mirror every operation into the recorder.
    Tracing(Box<TraceRecorder>),
    /// Compiled code ran.
    Exited(ExitOutcome),
}

/// What the recorder should do after a merge point.
#[derive(Debug)]
pub enum MergeOutcome {
    /// Keep recording.
    Continue(Box<TraceRecorder>),
    /// The trace was compiled; for bridges this is the parent token.
    Compiled(TokenId),
    /// Recording stopped without compiled code.
    Aborted,
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters of one runtime.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JitStats {
    /// Loop and entry traces started.
    pub traces_started: u64,
    /// Bridge traces started.
    pub bridges_started: u64,
    /// Loops compiled.
    pub loops_compiled: u64,
    /// Bridges compiled.
    pub bridges_compiled: u64,
    /// Recordings or compilations abandoned.
    pub aborts: u64,
    /// Entries into compiled code.
    pub executions: u64,
    /// Guard failures handled.
    pub guard_failures: u64,
    /// Tokens freed by the memory manager.
    pub tokens_freed: u64,
    /// Tokens invalidated by assumptions.
    pub tokens_invalidated: u64,
    /// Tokens currently alive.
    pub alive_loops: usize,
}

impl JitStats {
    /// Share of started traces that were abandoned.
    #[inline]
    pub fn abort_rate(&self) -> f64 {
        let started = self.traces_started + self.bridges_started;
        if started == 0 {
            0.0
        } else {
            self.aborts as f64 / started as f64
        }
    }
}

#[derive(Debug)]
struct Assumption {
    name: String,
    valid: bool,
    dependents: Vec<TokenId>,
}

// =============================================================================
// JitRuntime
// =============================================================================

/// All JIT state shared by the interpreters of one process.
pub struct JitRuntime {
    params: RwLock<JitParams>,
    drivers: RwLock<Vec<Arc<Mutex<WarmState>>>>,
    memory: Mutex<MemoryManager>,
    backend: Arc<dyn Backend>,
    assumptions: Mutex<FxHashMap<AssumptionId, Assumption>>,
    next_assumption: AtomicU64,
    next_token: AtomicU64,
    guard_ids: AtomicU64,
    tracing_active: AtomicBool,
    epoch: AtomicU64,
    stats: Mutex<JitStats>,
}

impl fmt::Debug for JitRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JitRuntime")
            .field("backend", &self.backend.name())
            .field("drivers", &self.drivers.read().len())
            .field("alive_loops", &self.memory.lock().num_alive())
            .field("tracing", &self.is_tracing())
            .finish()
    }
}

impl JitRuntime {
    /// Runtime compiling into `backend`.
    pub fn new(backend: Arc<dyn Backend>, params: JitParams) -> Self {
        let memory = MemoryManager::new(params.loop_longevity);
        Self {
            params: RwLock::new(params),
            drivers: RwLock::new(Vec::new()),
            memory: Mutex::new(memory),
            backend,
            assumptions: Mutex::new(FxHashMap::default()),
            next_assumption: AtomicU64::new(1),
            next_token: AtomicU64::new(1),
            guard_ids: AtomicU64::new(1),
            tracing_active: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            stats: Mutex::new(JitStats::default()),
        }
    }

    /// Runtime on the reference [`TraceBackend`].
    pub fn with_trace_backend(params: JitParams) -> Self {
        Self::new(Arc::new(TraceBackend::new()), params)
    }

    /// Runtime with low thresholds on the reference backend.
    pub fn for_testing() -> Self {
        Self::with_trace_backend(JitParams::for_testing())
    }

    /// Register an interpreter driver.
    pub fn register_driver(&self, driver: Arc<dyn JitDriver>) -> DriverId {
        let warm = WarmState::new(driver, &self.params.read());
        let mut drivers = self.drivers.write();
        drivers.push(Arc::new(Mutex::new(warm)));
        DriverId(drivers.len() - 1)
    }

    fn warm(&self, driver: DriverId) -> JitResult<Arc<Mutex<WarmState>>> {
        self.drivers
            .read()
            .get(driver.0)
            .cloned()
            .ok_or(JitError::UnknownDriver(driver.0))
    }

    fn enterable(memory: &MemoryManager, token: TokenId) -> bool {
        memory.get(token).map_or(false, |t| !t.is_invalidated())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The backend.
    #[inline]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Copy of the current tunables.
    pub fn params(&self) -> JitParams {
        self.params.read().clone()
    }

    /// Incremented by [`JitRuntime::after_fork`]; recorders from an older
    /// epoch are stale.
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Whether a trace is being recorded.
    #[inline]
    pub fn is_tracing(&self) -> bool {
        self.tracing_active.load(Ordering::Acquire)
    }

    /// Memory manager generation.
    pub fn current_generation(&self) -> u64 {
        self.memory.lock().current_generation()
    }

    /// Live token with the given id.
    pub fn token(&self, id: TokenId) -> Option<Arc<LoopToken>> {
        self.memory.lock().get(id).cloned()
    }

    /// Number of live tokens.
    pub fn num_loops(&self) -> usize {
        self.memory.lock().num_alive()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> JitStats {
        let mut stats = self.stats.lock().clone();
        stats.alive_loops = self.num_loops();
        stats
    }

    // =========================================================================
    // Entry
    // =========================================================================

    /// The merge point hook. Never fails: every error means "keep
    /// interpreting".
    pub fn maybe_compile_and_run(&self, driver: DriverId, at: MergePoint<'_>, cx: &mut dyn ExecCx) -> EnterOutcome {
        let warm = match self.warm(driver) {
            Ok(warm) => warm,
            Err(err) => {
                warn!(target: jitlog::TRACING, error = %err, "merge point of an unknown driver");
                return EnterOutcome::Interpret;
            }
        };
        let action = {
            let mut warm = warm.lock();
            let memory = self.memory.lock();
            let generation = memory.current_generation();
            warm.on_hit(
                at.entry,
                at.greens,
                at.registers,
                generation,
                !self.is_tracing(),
                &|token| Self::enterable(&memory, token),
            )
        };
        match action {
            HitAction::Interpret | HitAction::TracingInFlight => EnterOutcome::Interpret,
            HitAction::StartTracing => self.start_tracing(driver, &warm, at),
            HitAction::Execute(token) => match self.execute_token(token, at.registers, cx) {
                Ok(outcome) => EnterOutcome::Exited(outcome),
                Err(err) => {
                    debug!(target: jitlog::BACKEND, token = token.0, error = %err, "not entered");
                    EnterOutcome::Interpret
                }
            },
        }
    }

    fn start_tracing(&self, driver: DriverId, warm: &Mutex<WarmState>, at: MergePoint<'_>) -> EnterOutcome {
        if self.tracing_active.swap(true, Ordering::AcqRel) {
            warm.lock().trace_aborted(at.greens, false);
            return EnterOutcome::Interpret;
        }
        let location = warm.lock().driver().get_printable_location(at.greens);
        let recorder = TraceRecorder::for_loop(
            driver,
            self.epoch(),
            &self.params.read(),
            at.greens.iter().copied().collect(),
            at.entry,
            at.code,
            at.pc,
            at.registers,
        );
        self.stats.lock().traces_started += 1;
        debug!(target: jitlog::TRACING, entry = ?at.entry, "start tracing at {}", location);
        EnterOutcome::Tracing(Box::new(recorder))
    }

    /// Run the compiled code of `token` and report how it was left.
    pub fn execute_token(&self, token: TokenId, args: &[Value], cx: &mut dyn ExecCx) -> JitResult<ExitOutcome> {
        {
            let memory = self.memory.lock();
            let loop_token = memory.get(token).ok_or(JitError::UnknownToken(token.0))?;
            if loop_token.is_invalidated() {
                return Err(JitError::InvalidatedToken(token.0));
            }
            if !loop_token.execute.accepts(args) {
                return Err(JitError::Backend(format!(
                    "arguments do not match the convention of {}",
                    token
                )));
            }
            memory.keep_loop_alive(loop_token);
        }
        self.stats.lock().executions += 1;
        let frame = self.backend.execute_token(token, args, cx)?;
        self.handle_fail(frame, cx)
    }

    /// Turn a dead frame into interpreter state; a hot guard also starts a
    /// bridge recording.
    pub fn handle_fail(&self, frame: DeadFrame, cx: &mut dyn ExecCx) -> JitResult<ExitOutcome> {
        let descr = self.backend.get_latest_descr(&frame);
        if descr.is_finish() {
            return Ok(ExitOutcome::Done(frame.values.first().copied()));
        }
        let owner = {
            let memory = self.memory.lock();
            let owner = memory.get(descr.owner()).cloned();
            if let Some(owner) = &owner {
                memory.keep_loop_alive(owner);
            }
            owner
        };
        self.stats.lock().guard_failures += 1;

        let decoded = {
            let mut target = ConcreteMaterializer::new(&frame.values, cx);
            decode(descr.resume(), &mut target)
        };
        let bridge = owner.and_then(|owner| self.start_bridge(&descr, &owner, &frame));
        let resumed = ResumedState {
            frames: decoded.frames,
            vable: decoded.vable,
            exception: frame.exception,
            guard: descr.id(),
        };
        Ok(match bridge {
            Some(recorder) => ExitOutcome::Bridge(resumed, Box::new(recorder)),
            None => ExitOutcome::Resume(resumed),
        })
    }

    fn start_bridge(&self, descr: &Arc<GuardDescr>, owner: &LoopToken, frame: &DeadFrame) -> Option<TraceRecorder> {
        if descr.opcode() == Opcode::GuardNoException && frame.exception.is_some() {
            return None;
        }
        if descr.opcode() == Opcode::GuardNotInvalidated || owner.is_invalidated() {
            return None;
        }
        let params = self.params();
        if !descr.must_compile(&frame.values, params.trace_eagerness) {
            return None;
        }
        if owner.bridge_count() >= params.retrace_limit
            || !owner.admit_bridge_root(descr.id(), params.max_retrace_guards)
        {
            debug!(
                target: jitlog::BRIDGE,
                guard = descr.id(),
                token = owner.id.0,
                bridges = owner.bridge_count(),
                "bridge refused"
            );
            return None;
        }
        if self.tracing_active.swap(true, Ordering::AcqRel) {
            return None;
        }
        match TraceRecorder::for_bridge(DriverId(owner.driver), self.epoch(), &params, descr.clone()) {
            Ok(recorder) => {
                self.stats.lock().bridges_started += 1;
                debug!(
                    target: jitlog::BRIDGE,
                    guard = descr.id(),
                    token = owner.id.0,
                    opcode = descr.opcode().name(),
                    "guard is hot, tracing bridge"
                );
                Some(recorder)
            }
            Err(err) => {
                self.tracing_active.store(false, Ordering::Release);
                descr.reset_counter();
                debug!(target: jitlog::BRIDGE, guard = descr.id(), error = %err, "bridge not started");
                None
            }
        }
    }

    // =========================================================================
    // Recording
    // =========================================================================

    /// The recorder passed a merge point. At depth 1 this closes the loop
    /// at the start key, or jumps into compiled code of another key.
    pub fn reached_merge_point(&self, mut recorder: Box<TraceRecorder>, greens: &[Value]) -> MergeOutcome {
        if recorder.depth() != 1 {
            return MergeOutcome::Continue(recorder);
        }
        if recorder.epoch() != self.epoch() {
            self.abort_trace(recorder, JitError::StaleTrace);
            return MergeOutcome::Aborted;
        }
        let warm = match self.warm(recorder.driver()) {
            Ok(warm) => warm,
            Err(err) => {
                self.abort_trace(recorder, err);
                return MergeOutcome::Aborted;
            }
        };
        let closes = {
            let warm = warm.lock();
            matches!(recorder.kind(), TraceKind::Loop { greenkey, .. } if warm.driver().greens_eq(greenkey, greens))
        };
        if closes {
            return match recorder.close_loop() {
                Ok(trace) => self.finish_recording(recorder, trace),
                Err(err) => {
                    self.abort_trace(recorder, err);
                    MergeOutcome::Aborted
                }
            };
        }

        let target = {
            let warm = warm.lock();
            let memory = self.memory.lock();
            warm.get_procedure_token(greens, &|token| Self::enterable(&memory, token))
                .and_then(|token| memory.get(token).cloned())
        };
        if let Some(target) = target {
            let args = recorder.frame().registers.clone();
            if accepts_operands(&target, &args) {
                return match recorder.jump_to_token(target.id, &args) {
                    Ok(trace) => self.finish_recording(recorder, trace),
                    Err(err) => {
                        self.abort_trace(recorder, err);
                        MergeOutcome::Aborted
                    }
                };
            }
        }

        if !recorder.visit_merge_point(greens) {
            let location = {
                let mut warm = warm.lock();
                warm.trace_next_iteration(greens);
                warm.driver().get_printable_location(greens)
            };
            self.abort_trace(recorder, JitError::InvalidLoop(format!("entered the inner loop at {}", location)));
            return MergeOutcome::Aborted;
        }
        MergeOutcome::Continue(recorder)
    }

    /// The outermost traced frame returned `result`: compile the trace
    /// ending in `finish`. Returns the token that now owns the code.
    pub fn finish_trace(&self, mut recorder: Box<TraceRecorder>, result: Option<Operand>) -> Option<TokenId> {
        if recorder.depth() != 1 {
            self.abort_trace(recorder, JitError::InvalidLoop("finished inside an inlined frame".into()));
            return None;
        }
        match recorder.finish(result) {
            Ok(trace) => match self.finish_recording(recorder, trace) {
                MergeOutcome::Compiled(token) => Some(token),
                _ => None,
            },
            Err(err) => {
                self.abort_trace(recorder, err);
                None
            }
        }
    }

    fn finish_recording(&self, recorder: Box<TraceRecorder>, trace: Trace) -> MergeOutcome {
        let compiled = match recorder.kind() {
            TraceKind::Loop { .. } => self.compile_and_attach(&recorder, &trace),
            TraceKind::Bridge { guard } => self.compile_and_attach_bridge(&recorder, guard, &trace),
        };
        match compiled {
            Ok(token) => {
                self.tracing_active.store(false, Ordering::Release);
                MergeOutcome::Compiled(token)
            }
            Err(err) => {
                self.abort_trace(recorder, err);
                MergeOutcome::Aborted
            }
        }
    }

    /// Stop recording without compiled code.
    pub fn abort_trace(&self, recorder: Box<TraceRecorder>, err: JitError) {
        self.stats.lock().aborts += 1;
        debug!(
            target: jitlog::TRACING,
            reason = err.kind_name(),
            ops = recorder.len(),
            "abort tracing: {}",
            err
        );
        if recorder.epoch() != self.epoch() {
            return;
        }
        self.tracing_active.store(false, Ordering::Release);
        if let TraceKind::Bridge { guard } = recorder.kind() {
            guard.reset_counter();
        }
        let Ok(warm) = self.warm(recorder.driver()) else {
            return;
        };
        let mut warm = warm.lock();
        if let TraceKind::Loop { greenkey, .. } = recorder.kind() {
            warm.trace_aborted(greenkey, err.marks_dont_trace());
        }
        if err.is_trace_too_long() {
            if let Some(code) = recorder.biggest_inlined() {
                let greens = warm.driver().function_greens(code);
                warm.disable_noninlinable_function(&greens);
            }
        }
    }

    fn check_recorder(&self, recorder: &TraceRecorder) -> JitResult<()> {
        if recorder.epoch() != self.epoch() {
            return Err(JitError::StaleTrace);
        }
        let assumptions = self.assumptions.lock();
        let broken = recorder
            .assumptions()
            .iter()
            .find(|id| assumptions.get(*id).map_or(true, |a| !a.valid));
        match broken {
            Some(id) => Err(JitError::InvalidLoop(format!(
                "assumption {} was invalidated while tracing",
                id.0
            ))),
            None => Ok(()),
        }
    }

    fn compile_and_attach(&self, recorder: &TraceRecorder, trace: &Trace) -> JitResult<TokenId> {
        let TraceKind::Loop { greenkey, entry } = recorder.kind() else {
            return Err(JitError::InvalidLoop("not a loop trace".into()));
        };
        self.check_recorder(recorder)?;
        let warm = self.warm(recorder.driver())?;
        let driver = warm.lock().driver().clone();
        let location = driver.get_printable_location(greenkey);
        jitlog::log_noopt("loop", &location, trace);

        let params = self.params();
        let id = TokenId(self.next_token.fetch_add(1, Ordering::Relaxed));
        let cx = CompileCx {
            backend: self.backend.as_ref(),
            params: &params,
            guard_ids: &self.guard_ids,
        };
        let compiled = compile::compile_loop(&cx, id, recorder.driver().0, greenkey.clone(), *entry, trace)?;
        jitlog::log_opt("loop", &location, &compiled.counts, &compiled.trace, &|code, pc| {
            driver.describe_resume_point(code, pc)
        });
        self.add_dependencies(recorder.assumptions(), id);

        let freed = {
            let mut warm = warm.lock();
            let mut memory = self.memory.lock();
            memory.register(compiled.token.clone());
            if let Some(old) = warm.attach_procedure_to_interp(greenkey, id) {
                self.backend.redirect_call_assembler(old, id);
                if let Some(old) = memory.get(old) {
                    old.record_jump_to(id);
                }
            }
            memory.next_generation()
        };
        self.release(freed);
        self.stats.lock().loops_compiled += 1;
        debug!(
            target: jitlog::TRACING,
            token = id.0,
            ops = compiled.trace.len(),
            "compiled loop at {}",
            location
        );
        Ok(id)
    }

    fn compile_and_attach_bridge(
        &self,
        recorder: &TraceRecorder,
        guard: &Arc<GuardDescr>,
        trace: &Trace,
    ) -> JitResult<TokenId> {
        self.check_recorder(recorder)?;
        let owner = self.token(guard.owner()).ok_or(JitError::UnknownToken(guard.owner().0))?;
        if owner.is_invalidated() {
            return Err(JitError::InvalidatedToken(owner.id.0));
        }
        let driver = self.warm(recorder.driver())?.lock().driver().clone();
        let location = match guard.resume().location() {
            Some((code, pc)) => driver.describe_resume_point(code, pc),
            None => format!("guard {}", guard.id()),
        };
        jitlog::log_noopt("bridge", &location, trace);

        let params = self.params();
        let cx = CompileCx {
            backend: self.backend.as_ref(),
            params: &params,
            guard_ids: &self.guard_ids,
        };
        let compiled = compile::compile_bridge(&cx, guard, &owner, trace)?;
        jitlog::log_opt("bridge", &location, &compiled.counts, &compiled.trace, &|code, pc| {
            driver.describe_resume_point(code, pc)
        });
        self.add_dependencies(recorder.assumptions(), owner.id);
        self.memory.lock().keep_loop_alive(&owner);
        self.stats.lock().bridges_compiled += 1;
        debug!(
            target: jitlog::BRIDGE,
            guard = guard.id(),
            token = owner.id.0,
            ops = compiled.trace.len(),
            "attached bridge at {}",
            location
        );
        Ok(owner.id)
    }

    fn release(&self, freed: Vec<Arc<LoopToken>>) {
        if freed.is_empty() {
            return;
        }
        for token in &freed {
            self.backend.free_loop(token.id);
        }
        let mut assumptions = self.assumptions.lock();
        for assumption in assumptions.values_mut() {
            assumption.dependents.retain(|id| freed.iter().all(|t| t.id != *id));
        }
        self.stats.lock().tokens_freed += freed.len() as u64;
    }

    // =========================================================================
    // Cells and tokens
    // =========================================================================

    /// Attach compiled code to a key by hand. A token it replaces is
    /// redirected to the new one.
    pub fn attach_procedure_to_interp(&self, driver: DriverId, greens: &[Value], token: TokenId) -> JitResult<()> {
        let warm = self.warm(driver)?;
        let mut warm = warm.lock();
        let memory = self.memory.lock();
        if memory.get(token).is_none() {
            return Err(JitError::UnknownToken(token.0));
        }
        if let Some(old) = warm.attach_procedure_to_interp(greens, token) {
            self.backend.redirect_call_assembler(old, token);
            if let Some(old) = memory.get(old) {
                old.record_jump_to(token);
            }
        }
        Ok(())
    }

    /// Never inline calls to (nor trace from) this key again.
    pub fn disable_noninlinable_function(&self, driver: DriverId, greens: &[Value]) -> JitResult<()> {
        self.warm(driver)?.lock().disable_noninlinable_function(greens);
        Ok(())
    }

    /// Copy of the cell of a key, created when missing.
    pub fn jit_cell_at_key(&self, driver: DriverId, greens: &[Value]) -> JitResult<JitCell> {
        Ok(self.warm(driver)?.lock().jit_cell_at_key(greens).clone())
    }

    /// Whether a call reaching this key while tracing may be inlined.
    pub fn can_inline(&self, driver: DriverId, greens: &[Value]) -> bool {
        let Ok(warm) = self.warm(driver) else {
            return false;
        };
        let allowed = warm.lock().can_inline(greens);
        allowed && self.params.read().inlining
    }

    /// Compiled code attached to a key, if it can still be entered.
    pub fn procedure_token(&self, driver: DriverId, greens: &[Value]) -> Option<TokenId> {
        let warm = self.warm(driver).ok()?;
        let warm = warm.lock();
        let memory = self.memory.lock();
        warm.get_procedure_token(greens, &|token| Self::enterable(&memory, token))
    }

    // =========================================================================
    // Parameters
    // =========================================================================

    /// Set one tunable.
    pub fn set_param(&self, name: &str, value: &str) -> JitResult<()> {
        let params = {
            let mut params = self.params.write();
            params.set_param(name, value)?;
            params.clone()
        };
        self.apply_params(&params);
        Ok(())
    }

    /// Set tunables from a `name=value,...` list.
    pub fn set_params(&self, text: &str) -> JitResult<()> {
        let (params, result) = {
            let mut params = self.params.write();
            let result = params.set_params(text);
            (params.clone(), result)
        };
        self.apply_params(&params);
        result
    }

    /// Current value of a tunable.
    pub fn get_param(&self, name: &str) -> JitResult<String> {
        self.params.read().get_param(name)
    }

    fn apply_params(&self, params: &JitParams) {
        for warm in self.drivers.read().iter() {
            warm.lock().set_params(params);
        }
        let mut memory = self.memory.lock();
        if memory.max_age() != params.loop_longevity {
            memory.set_max_age(params.loop_longevity);
        }
    }

    // =========================================================================
    // Assumptions
    // =========================================================================

    /// A new valid assumption.
    pub fn register_assumption(&self, name: &str) -> AssumptionId {
        let id = AssumptionId(self.next_assumption.fetch_add(1, Ordering::Relaxed));
        self.assumptions.lock().insert(
            id,
            Assumption {
                name: name.to_string(),
                valid: true,
                dependents: Vec::new(),
            },
        );
        id
    }

    /// Whether the assumption still holds.
    pub fn is_assumption_valid(&self, id: AssumptionId) -> bool {
        self.assumptions.lock().get(&id).map_or(false, |a| a.valid)
    }

    fn add_dependencies(&self, ids: &[AssumptionId], token: TokenId) {
        let mut assumptions = self.assumptions.lock();
        for id in ids {
            if let Some(assumption) = assumptions.get_mut(id) {
                if !assumption.dependents.contains(&token) {
                    assumption.dependents.push(token);
                }
            }
        }
    }

    /// Break an assumption: every token depending on it is invalidated.
    /// Returns the number of tokens invalidated.
    pub fn invalidate_assumption(&self, id: AssumptionId) -> usize {
        let (name, dependents) = {
            let mut assumptions = self.assumptions.lock();
            let Some(assumption) = assumptions.get_mut(&id) else {
                return 0;
            };
            assumption.valid = false;
            (assumption.name.clone(), std::mem::take(&mut assumption.dependents))
        };
        let mut invalidated = 0;
        {
            let memory = self.memory.lock();
            for token in dependents.iter().filter_map(|t| memory.get(*t)) {
                if token.invalidate() {
                    self.backend.invalidate_loop(token.id);
                    invalidated += 1;
                }
            }
        }
        self.stats.lock().tokens_invalidated += invalidated as u64;
        debug!(target: jitlog::TRACING, assumption = %name, invalidated, "assumption invalidated");
        invalidated
    }

    // =========================================================================
    // Fork
    // =========================================================================

    /// Reset state that cannot survive into a forked child: recorders in
    /// flight become stale and the memory manager starts a fresh age count.
    pub fn after_fork(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.tracing_active.store(false, Ordering::Release);
        for warm in self.drivers.read().iter() {
            warm.lock().after_fork();
        }
        self.memory.lock().reanchor();
    }
}

fn accepts_operands(token: &LoopToken, args: &[Operand]) -> bool {
    let kinds = token.execute.kinds();
    kinds.len() == args.len() && args.iter().zip(kinds).all(|(a, k)| a.kind() == *k)
}
