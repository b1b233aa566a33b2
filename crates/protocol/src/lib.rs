//! Midibridge Protocol
//!
//! Defines the port data model and the wire messages exchanged between the
//! native host and the script context. This crate is the source of truth for
//! everything that crosses the channel.

mod codec;
mod content;
mod host;
mod types;

pub use codec::*;
pub use content::*;
pub use host::*;
pub use types::*;
