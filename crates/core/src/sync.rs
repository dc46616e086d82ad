//! Lock helpers shared by the cache and the task subsystem.
//!
//! Every structure (cache map, task table, heaps, failed list) sits behind its
//! own short-held mutex. A panic while one of them is held must not take the
//! whole subsystem down, so poisoning is logged and the guard recovered.

use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Lock `lock`, recovering the guard if a previous holder panicked.
///
/// `target` and `op` only feed the warning emitted on recovery.
pub fn lock_or_recover<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                "recovered from poisoned lock; state may be stale"
            );
            poisoned.into_inner()
        }
    }
}
