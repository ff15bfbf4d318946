//! Usage: Lock extension traits that recover from poisoning instead of propagating the panic.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub(crate) trait MutexExt<T> {
    /// Acquire the lock; a poisoned mutex is recovered and logged.
    fn lock_or_recover(&self) -> MutexGuard<'_, T>;
}

pub(crate) trait RwLockExt<T> {
    fn read_or_recover(&self) -> RwLockReadGuard<'_, T>;
    fn write_or_recover(&self) -> RwLockWriteGuard<'_, T>;
}

#[track_caller]
fn log_poisoned<T>(kind: &'static str) {
    let loc = std::panic::Location::caller();
    tracing::error!(
        lock_kind = kind,
        lock_type = std::any::type_name::<T>(),
        file = loc.file(),
        line = loc.line(),
        column = loc.column(),
        "lock poisoned by a panicking thread; recovered data may be inconsistent"
    );
}

impl<T> MutexExt<T> for Mutex<T> {
    #[track_caller]
    fn lock_or_recover(&self) -> MutexGuard<'_, T> {
        match self.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log_poisoned::<T>("mutex");
                poisoned.into_inner()
            }
        }
    }
}

impl<T> RwLockExt<T> for RwLock<T> {
    #[track_caller]
    fn read_or_recover(&self) -> RwLockReadGuard<'_, T> {
        match self.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log_poisoned::<T>("rwlock_read");
                poisoned.into_inner()
            }
        }
    }

    #[track_caller]
    fn write_or_recover(&self) -> RwLockWriteGuard<'_, T> {
        match self.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log_poisoned::<T>("rwlock_write");
                poisoned.into_inner()
            }
        }
    }
}
