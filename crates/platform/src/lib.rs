//! Midibridge Platform Abstraction
//!
//! Provides the abstraction over the native MIDI subsystem: device
//! enumeration, per-endpoint property lookups and writes to destinations.
//!
//! Backends:
//! - `MemoryBackend`: in-process device set, plugged and unplugged at runtime

mod error;
mod lock;
mod memory;
mod traits;

pub use error::*;
pub use lock::*;
pub use memory::*;
pub use traits::*;
