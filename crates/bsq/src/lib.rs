#![forbid(unsafe_code)]
//! BootSquash public API facade.
//!
//! Re-exports the mounted-image API from `bsq-core`. Downstream consumers
//! (the CLI, boot loaders embedding the reader) depend on this crate.

pub use bsq_core::*;
