use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, recovering the data if a holder panicked.
///
/// Ring state stays consistent across a panic because every mutation is a
/// single assignment under the lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Milliseconds with sub-ms precision, for latency histograms.
pub(crate) fn as_millis_f64(elapsed: std::time::Duration) -> f64 {
    elapsed.as_secs_f64() * 1_000.0
}
