//! Midibridge Script Host
//!
//! QuickJS sandbox that runs an untrusted script against one content engine.
//!
//! ## Host API
//!
//! Scripts have access to the following API:
//!
//! - `midi.requestAccess(sysex?)` - Create an access handle, returns its id or null if denied
//! - `midi.ports(access, kind)` - JSON list of the handle's "input" or "output" ports
//! - `midi.send(access, portId, bytes)` - Send bytes through an output port copy
//! - `midi.poll(access)` - Deliver pending traffic, then return the handle's queued events as JSON
//! - `console.log(...args)` - Print to script output and forward to the host log
//! - `time.sleep(ms)` - Sleep for milliseconds (capped), delivering pending traffic afterwards
//! - `time.now()` - Milliseconds since the content engine started

mod bindings;
mod runtime;

pub use bindings::*;
pub use runtime::*;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from script execution
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Script execution timed out")]
    Timeout,

    #[error("Script was cancelled")]
    Cancelled,

    #[error("JavaScript error: {0}")]
    JsError(String),

    #[error("Runtime initialization failed: {0}")]
    InitError(String),
}

/// Script execution result
#[derive(Debug, Clone)]
pub struct ScriptResult {
    pub output: String,
    pub return_value: Option<String>,
    /// Access handles the script created
    pub accesses: usize,
}

/// Configuration for script execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Maximum execution time in milliseconds
    pub timeout_ms: u64,
    /// Maximum memory usage in bytes
    pub memory_limit: usize,
    /// Maximum single sleep duration in milliseconds
    pub max_sleep_ms: u64,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,              // 30 seconds
            memory_limit: 64 * 1024 * 1024,  // 64 MB
            max_sleep_ms: 10_000,            // 10 seconds max sleep
        }
    }
}
