use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use tracing::warn;

static POISON_RECOVERIES: AtomicU64 = AtomicU64::new(0);

/// Number of times a poisoned lock has been recovered in this process.
pub fn poison_recovery_count() -> u64 {
    POISON_RECOVERIES.load(Ordering::Relaxed)
}

fn note_recovery(kind: &'static str) {
    POISON_RECOVERIES.fetch_add(1, Ordering::Relaxed);
    warn!(lock = kind, "Recovering from poisoned lock");
}

pub fn rwlock_read_or_recover<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        note_recovery("rwlock_read");
        poisoned.into_inner()
    })
}

pub fn rwlock_write_or_recover<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        note_recovery("rwlock_write");
        poisoned.into_inner()
    })
}

pub fn mutex_lock_or_recover<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        note_recovery("mutex");
        poisoned.into_inner()
    })
}
