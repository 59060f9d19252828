//! deltachain shared - code used by both the library and the CLI
//!
//! This crate contains the error taxonomy and the unit/file-name
//! constants that every layer of the workspace agrees on.

pub mod constants;
pub mod errors;

pub use errors::{DeltaError, DeltaResult};
