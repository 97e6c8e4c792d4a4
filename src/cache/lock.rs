//! Lock helpers for shared cache state.
//!
//! A panic while holding one of these locks must not take request handling
//! down with it, so poisoning is logged and the inner guard is used as is.

use std::sync::{
    Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use tracing::warn;

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    owner: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    lock.read()
        .unwrap_or_else(|poisoned| recover(poisoned, owner, op, "rwlock.read"))
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    owner: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    lock.write()
        .unwrap_or_else(|poisoned| recover(poisoned, owner, op, "rwlock.write"))
}

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    owner: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    lock.lock()
        .unwrap_or_else(|poisoned| recover(poisoned, owner, op, "mutex.lock"))
}

fn recover<G>(
    poisoned: PoisonError<G>,
    owner: &'static str,
    op: &'static str,
    kind: &'static str,
) -> G {
    warn!(
        target = "sitecache::cache::lock",
        owner,
        op,
        lock_kind = kind,
        "Recovered poisoned lock; state may predate a panic elsewhere"
    );
    poisoned.into_inner()
}
