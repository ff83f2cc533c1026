//! # Strand JIT
//!
//! A meta-tracing JIT runtime. An interpreter registers a [`JitDriver`]
//! with a [`JitRuntime`] and reports its merge points; hot loops are
//! recorded as linear traces, optimized and handed to a [`Backend`].
//!
//! - **Warm state**: per green key counters, the jit cell directory and
//!   the entry state machine
//! - **Recorder**: traces with resume snapshots across inlined frames
//! - **Optimizer**: rewrite, intbounds, virtualize, heap and unroll
//! - **Guards and resume**: compact resume data, guard descrs, bridges
//! - **Memory**: loop tokens owned by a generation-based manager
//! - **Backend**: the abstract contract plus a reference backend that
//!   interprets compiled traces
//!
//! ```text
//!   interpreter ──► WarmState ──► TraceRecorder ──► optimizer ──► Backend
//!        ▲                                                          │
//!        └──────────── resume data ◄── guard failure ◄──────────────┘
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod compile;
pub mod config;
pub mod history;
pub mod jitlog;
pub mod memmgr;
pub mod opt;
pub mod recorder;
pub mod resume;
pub mod runtime;
pub mod warmstate;

pub use backend::{Backend, DeadFrame, ExecCx, ExecuteToken, TraceBackend};
pub use compile::{ExitKind, GuardDescr};
pub use config::{EnableOpts, JitParams};
pub use history::{Descr, DescrTable, EffectInfo, Opcode, Operand, Trace, TraceBuilder};
pub use memmgr::{LoopToken, MemoryManager, TokenId};
pub use recorder::{TraceKind, TraceRecorder};
pub use resume::CodeId;
pub use runtime::{
    AssumptionId, DriverId, EnterOutcome, ExitOutcome, JitRuntime, JitStats, MergeOutcome, MergePoint, ResumedState,
};
pub use warmstate::{EntryKind, GreenKey, JitCell, JitDriver};
