//! JIT Integration Test Suite
//!
//! Organized by category:
//! - loops: counting loops, nested loops, loop exits and bridges
//! - objects: allocation removal, field access and arrays
//! - calls: inlining, residual calls, builtins and exceptions
//! - invalidation: globals backed by assumptions
//! - lifecycle: dont_trace, trace length limits, eviction and OOM

pub mod calls;
pub mod invalidation;
pub mod lifecycle;
pub mod loops;
pub mod objects;
pub mod test_utils;
