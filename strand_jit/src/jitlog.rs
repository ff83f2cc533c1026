//! Named jit log channels.
//!
//! Each channel is a `tracing` target, so a subscriber can enable them
//! selectively, e.g. `RUST_LOG=jit-log-opt=debug,jit-bridge=debug`.
//! Rendering a whole trace is skipped unless its channel is enabled.

use tracing::{debug, trace, Level};

use crate::history::{Descr, Trace};
use crate::resume::CodeId;

/// Recorded traces, before optimization.
pub const LOG_NOOPT: &str = "jit-log-noopt";
/// Optimized traces: per-pass op counts, final ops, guard locations.
pub const LOG_OPT: &str = "jit-log-opt";
/// Tracing starts, closes and aborts.
pub const TRACING: &str = "jit-tracing";
/// Hot guards and bridges.
pub const BRIDGE: &str = "jit-bridge";
/// Green keys excluded from inlining.
pub const DISABLE_INLINING: &str = "jit-disableinlining";
/// Memory manager sweeps.
pub const MEM_COLLECT: &str = "jit-mem-collect";
/// Reference backend execution.
pub const BACKEND: &str = "jit-backend";

/// Op count after one optimizer stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassCount {
    /// Stage name.
    pub pass: &'static str,
    /// Ops the stage forwarded.
    pub ops: usize,
}

/// Log a recorded trace on [`LOG_NOOPT`].
pub fn log_noopt(what: &str, location: &str, trace: &Trace) {
    if tracing::enabled!(target: LOG_NOOPT, Level::DEBUG) {
        debug!(
            target: LOG_NOOPT,
            ops = trace.len(),
            "{} at {}\n{}",
            what,
            location,
            trace
        );
    }
}

/// Log an optimized trace on [`LOG_OPT`]: the op counts of every stage,
/// the final ops and one event per guard with its source location.
pub fn log_opt(what: &str, location: &str, counts: &[PassCount], trace: &Trace, describe: &dyn Fn(CodeId, u32) -> String) {
    if !tracing::enabled!(target: LOG_OPT, Level::DEBUG) {
        return;
    }
    let passes = counts
        .iter()
        .map(|c| format!("{}={}", c.pass, c.ops))
        .collect::<Vec<_>>()
        .join(" ");
    debug!(
        target: LOG_OPT,
        ops = trace.len(),
        guards = trace.num_guards(),
        "{} at {} [{}]\n{}",
        what,
        location,
        passes,
        trace
    );
    if tracing::enabled!(target: LOG_OPT, Level::TRACE) {
        for op in trace.ops.iter().filter(|op| op.is_guard()) {
            let place = match &op.descr {
                Some(Descr::Resume(data)) => data.location(),
                Some(Descr::Fail(guard)) => guard.resume().location(),
                _ => None,
            };
            let source = place.map_or_else(|| "?".to_string(), |(code, pc)| describe(code, pc));
            trace!(target: LOG_OPT, guard = op.opcode.name(), "{}", source);
        }
    }
}
