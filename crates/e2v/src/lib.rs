#![forbid(unsafe_code)]
//! e2view public API facade.
//!
//! Re-exports the navigation engine from `e2v-core` through a stable
//! external interface, plus the error and identifier types callers need.

pub use e2v_core::*;
pub use e2v_error::{E2Error, Result};
pub use e2v_types::{BlockNumber, GroupNumber, InodeNumber};
