//! # Strand Core
//!
//! Core types shared by every strand crate:
//!
//! - **Value model**: the three-slot [`Value`] (integer, GC reference,
//!   float storage) and its [`Kind`]
//! - **Error handling**: [`JitError`] and the [`JitResult`] alias

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod value;

pub use error::{JitError, JitResult};
pub use value::{FloatStorage, GcRef, Kind, Value};

/// Strand runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
