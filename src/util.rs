use std::sync::{Mutex, MutexGuard};

/// Locks a mutex, ignoring poisoning. The data guarded with this are plain buffers and tables
///  whose invariants are re-established by every operation, so a panic in another thread does
///  not leave them in a state that is unsafe to read.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
