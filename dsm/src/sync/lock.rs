//
// Copyright (c) 2017, 2020 ADLINK Technology Inc.
//
// This program and the accompanying materials are made available under the
// terms of the Eclipse Public License 2.0 which is available at
// http://www.eclipse.org/legal/epl-2.0, or the Apache License, Version 2.0
// which is available at https://www.apache.org/licenses/LICENSE-2.0.
//
// SPDX-License-Identifier: EPL-2.0 OR Apache-2.0
//
// Contributors:
//   ADLINK zenoh team, <zenoh@adlink-labs.tech>
//
use dsm_util::sync::Backoff;
use lock_api::{GuardNoSend, RawMutex, RawRwLock, RawRwLockUpgrade};
use std::sync::atomic::{AtomicU32, Ordering};

/*************************************/
/*              MUTEX                */
/*************************************/
/// A mutex made of a single word, usable from every process mapping it.
///
/// The all-zero bit pattern is the unlocked state, so a freshly zeroed arena
/// holds valid unlocked mutexes.
#[repr(C)]
#[derive(Debug, Default)]
pub struct RawShmMutex {
    state: AtomicU32,
}

unsafe impl RawMutex for RawShmMutex {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: RawShmMutex = RawShmMutex {
        state: AtomicU32::new(0),
    };

    type GuardMarker = GuardNoSend;

    fn lock(&self) {
        let mut backoff = Backoff::new();
        while !self.try_lock() {
            backoff.snooze();
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.state.store(0, Ordering::Release);
    }
}

impl RawShmMutex {
    pub fn guard(&self) -> ShmMutexGuard<'_> {
        RawMutex::lock(self);
        ShmMutexGuard { lock: self }
    }
}

#[must_use = "if unused the mutex will immediately unlock"]
pub struct ShmMutexGuard<'a> {
    lock: &'a RawShmMutex,
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        unsafe { RawMutex::unlock(self.lock) };
    }
}

/*************************************/
/*             RW LOCK               */
/*************************************/
const WRITER: u32 = 1 << 31;
const UPGRADABLE: u32 = 1 << 30;
const READERS_MASK: u32 = UPGRADABLE - 1;

/// An upgradable reader/writer lock made of a single word.
///
/// Layout of the word: bit 31 is the writer, bit 30 the upgradable reader,
/// the remaining bits count the plain readers. An upgradable reader coexists
/// with plain readers but excludes other upgradable readers and writers, so
/// a lookup-then-insert sequence does not block concurrent lookups until the
/// very moment it upgrades. Waiting writers get no priority.
#[repr(C)]
#[derive(Debug, Default)]
pub struct RawShmRwLock {
    state: AtomicU32,
}

unsafe impl RawRwLock for RawShmRwLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: RawShmRwLock = RawShmRwLock {
        state: AtomicU32::new(0),
    };

    type GuardMarker = GuardNoSend;

    fn lock_shared(&self) {
        let mut backoff = Backoff::new();
        while !self.try_lock_shared() {
            backoff.snooze();
        }
    }

    fn try_lock_shared(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state & WRITER != 0 || state & READERS_MASK == READERS_MASK {
                return false;
            }
            match self.state.compare_exchange_weak(
                state,
                state + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => state = current,
            }
        }
    }

    #[inline]
    unsafe fn unlock_shared(&self) {
        self.state.fetch_sub(1, Ordering::Release);
    }

    fn lock_exclusive(&self) {
        let mut backoff = Backoff::new();
        while !self.try_lock_exclusive() {
            backoff.snooze();
        }
    }

    #[inline]
    fn try_lock_exclusive(&self) -> bool {
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    unsafe fn unlock_exclusive(&self) {
        self.state.fetch_and(!WRITER, Ordering::Release);
    }
}

unsafe impl RawRwLockUpgrade for RawShmRwLock {
    fn lock_upgradable(&self) {
        let mut backoff = Backoff::new();
        while !self.try_lock_upgradable() {
            backoff.snooze();
        }
    }

    fn try_lock_upgradable(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state & (WRITER | UPGRADABLE) != 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                state,
                state | UPGRADABLE,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => state = current,
            }
        }
    }

    #[inline]
    unsafe fn unlock_upgradable(&self) {
        self.state.fetch_and(!UPGRADABLE, Ordering::Release);
    }

    unsafe fn upgrade(&self) {
        let mut backoff = Backoff::new();
        while !self.try_upgrade() {
            backoff.snooze();
        }
    }

    #[inline]
    unsafe fn try_upgrade(&self) -> bool {
        self.state
            .compare_exchange(UPGRADABLE, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

impl RawShmRwLock {
    pub fn read(&self) -> ShmReadGuard<'_> {
        self.lock_shared();
        ShmReadGuard { lock: self }
    }

    pub fn write(&self) -> ShmWriteGuard<'_> {
        self.lock_exclusive();
        ShmWriteGuard { lock: self }
    }

    pub fn upgradable_read(&self) -> ShmUpgradableGuard<'_> {
        self.lock_upgradable();
        ShmUpgradableGuard { lock: self }
    }
}

#[must_use = "if unused the lock will immediately unlock"]
pub struct ShmReadGuard<'a> {
    lock: &'a RawShmRwLock,
}

impl Drop for ShmReadGuard<'_> {
    fn drop(&mut self) {
        unsafe { self.lock.unlock_shared() };
    }
}

#[must_use = "if unused the lock will immediately unlock"]
pub struct ShmWriteGuard<'a> {
    lock: &'a RawShmRwLock,
}

impl Drop for ShmWriteGuard<'_> {
    fn drop(&mut self) {
        unsafe { self.lock.unlock_exclusive() };
    }
}

#[must_use = "if unused the lock will immediately unlock"]
pub struct ShmUpgradableGuard<'a> {
    lock: &'a RawShmRwLock,
}

impl<'a> ShmUpgradableGuard<'a> {
    /// Waits for the plain readers to leave and turns this guard into a writer.
    pub fn upgrade(self) -> ShmWriteGuard<'a> {
        let lock = self.lock;
        std::mem::forget(self);
        unsafe { lock.upgrade() };
        ShmWriteGuard { lock }
    }
}

impl Drop for ShmUpgradableGuard<'_> {
    fn drop(&mut self) {
        unsafe { self.lock.unlock_upgradable() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn readers_share_the_lock() {
        let lock = RawShmRwLock::default();
        let r1 = lock.read();
        let r2 = lock.read();
        assert!(!lock.try_lock_exclusive());
        assert!(lock.try_lock_upgradable());
        unsafe { lock.unlock_upgradable() };
        drop(r1);
        drop(r2);
        assert!(lock.try_lock_exclusive());
        assert!(!lock.try_lock_shared());
        unsafe { lock.unlock_exclusive() };
    }

    #[test]
    fn only_one_upgradable_reader() {
        let lock = RawShmRwLock::default();
        let u = lock.upgradable_read();
        assert!(!lock.try_lock_upgradable());
        assert!(lock.try_lock_shared());
        unsafe { lock.unlock_shared() };
        let w = u.upgrade();
        assert!(!lock.try_lock_shared());
        drop(w);
        assert!(lock.try_lock_upgradable());
        unsafe { lock.unlock_upgradable() };
    }

    #[test]
    fn upgrade_waits_for_readers() {
        let lock = Arc::new(RawShmRwLock::default());
        let reader = lock.read();
        let upgraded = Arc::new(AtomicUsize::new(0));

        let c_lock = lock.clone();
        let c_upgraded = upgraded.clone();
        let h = std::thread::spawn(move || {
            let u = c_lock.upgradable_read();
            let _w = u.upgrade();
            c_upgraded.store(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(upgraded.load(Ordering::SeqCst), 0);
        drop(reader);
        h.join().unwrap();
        assert_eq!(upgraded.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lock_api_rwlock_over_shm_lock() {
        let counter: Arc<lock_api::RwLock<RawShmRwLock, usize>> =
            Arc::new(lock_api::RwLock::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        *c.write() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.read(), 4_000);
    }

    #[test]
    fn mutex_excludes() {
        let mutex: Arc<lock_api::Mutex<RawShmMutex, usize>> = Arc::new(lock_api::Mutex::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = mutex.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        *m.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*mutex.lock(), 4_000);
    }
}
