//! Lock extension traits for graceful error handling.

use std::sync::{Mutex, MutexGuard};

/// Helper trait for handling mutex lock errors gracefully
pub trait MutexExt<T> {
    /// Lock the mutex, recovering from poison errors by taking the data
    fn lock_or_recover(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    fn lock_or_recover(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }
}
