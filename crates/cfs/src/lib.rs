#![forbid(unsafe_code)]
//! chainfs public API facade.
//!
//! Re-exports the context object and its types from `cfs-core` through a
//! stable external interface. This is the crate the CLI and downstream
//! consumers depend on.

pub use cfs_core::*;
