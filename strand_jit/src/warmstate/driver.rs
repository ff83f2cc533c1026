//! Per-interpreter hooks.

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;
use smallvec::smallvec;
use strand_core::Value;

use super::jitcell::{JitCellDict, JitCellStore};
use super::GreenKey;
use crate::resume::CodeId;

/// Text used when a driver cannot describe a location.
pub const NO_PRINTABLE_LOCATION: &str = "(no jitdriver.get_printable_location!)";

/// What an interpreter tells the JIT about its merge points.
///
/// Every method has a default, so a driver only names itself.
pub trait JitDriver: Send + Sync {
    /// Driver name, for logs.
    fn name(&self) -> &str;

    /// Human readable location of a green key.
    fn get_printable_location(&self, _greens: &[Value]) -> String {
        NO_PRINTABLE_LOCATION.to_string()
    }

    /// Calls at this green key are never inlined.
    fn can_never_inline(&self, _greens: &[Value]) -> bool {
        false
    }

    /// Last chance to refuse tracing once the bound is reached.
    fn confirm_enter_jit(&self, _greens: &[Value], _reds: &[Value]) -> bool {
        true
    }

    /// Hash of a green key.
    fn hash_greens(&self, greens: &[Value]) -> u64 {
        let mut hasher = FxHasher::default();
        greens.hash(&mut hasher);
        hasher.finish()
    }

    /// Equality of green keys.
    fn greens_eq(&self, a: &[Value], b: &[Value]) -> bool {
        a == b
    }

    /// Where the warm state keeps its cells. Override to keep cells on
    /// interpreter objects instead of the global dictionary.
    fn make_cell_store(&self) -> Box<dyn JitCellStore> {
        Box::new(JitCellDict::new())
    }

    /// Green key of a function entry, used to stop inlining a callee
    /// that made a trace too long.
    fn function_greens(&self, code: CodeId) -> GreenKey {
        smallvec![Value::int(i64::from(code))]
    }

    /// Human readable resume point of a guard.
    fn describe_resume_point(&self, code: CodeId, pc: u32) -> String {
        format!("code {} pc {}", code, pc)
    }
}
