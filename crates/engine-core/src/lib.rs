//! Midibridge Engine Core
//!
//! This crate provides:
//! - The message channel between host and script context
//! - The native port registry and host-side router
//! - The content-side sync engine and access handles
//! - A single-threaded wiring of both halves
//! - Bridge config files

mod access;
mod config;
mod local;
mod registry;
mod router;
mod sync;
mod transport;

pub use access::*;
pub use config::*;
pub use local::*;
pub use registry::*;
pub use router::*;
pub use sync::*;
pub use transport::*;
