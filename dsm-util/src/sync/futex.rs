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
//! Wait/wake on a 32-bit word that may live in memory shared by several processes.
//!
//! On Linux this is a thin wrapper over the non-private `FUTEX_WAIT`/`FUTEX_WAKE`
//! operations, which key the wait queue on the physical page and therefore work
//! across different mappings of the same segment. Elsewhere waiting degrades to
//! short sleeps and waking is a no-op.
use std::sync::atomic::AtomicU32;
use std::time::Duration;

#[cfg(not(target_os = "linux"))]
const POLL_INTERVAL: Duration = Duration::from_micros(500);

/// Blocks while `word` still holds `expected`, at most for `timeout`.
///
/// Spurious returns are allowed: callers must re-check their condition.
/// Returns `false` only when the wait timed out.
#[cfg(target_os = "linux")]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> bool {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = match ts.as_ref() {
        Some(ts) => ts as *const libc::timespec,
        None => std::ptr::null(),
    };
    let res = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32,
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0u32,
        )
    };
    if res == -1 {
        let err = std::io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::ETIMEDOUT) => false,
            Some(libc::EAGAIN) | Some(libc::EINTR) => true,
            _ => {
                log::warn!("futex wait failed: {}", err);
                true
            }
        };
    }
    true
}

/// Wakes up to `count` waiters blocked on `word`, returns how many were woken.
#[cfg(target_os = "linux")]
pub fn futex_wake(word: &AtomicU32, count: u32) -> usize {
    let count = count.min(i32::MAX as u32) as libc::c_int;
    let res = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32,
            libc::FUTEX_WAKE,
            count,
        )
    };
    if res < 0 {
        log::warn!("futex wake failed: {}", std::io::Error::last_os_error());
        0
    } else {
        res as usize
    }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> bool {
    use std::sync::atomic::Ordering;

    let deadline = timeout.map(|t| std::time::Instant::now() + t);
    while word.load(Ordering::Acquire) == expected {
        let nap = match deadline {
            Some(deadline) => {
                let now = std::time::Instant::now();
                if now >= deadline {
                    return false;
                }
                (deadline - now).min(POLL_INTERVAL)
            }
            None => POLL_INTERVAL,
        };
        std::thread::sleep(nap);
    }
    true
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_word: &AtomicU32, _count: u32) -> usize {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn wait_returns_immediately_on_changed_value() {
        let word = AtomicU32::new(1);
        assert!(futex_wait(&word, 0, Some(Duration::from_secs(5))));
    }

    #[test]
    fn wait_times_out() {
        let word = AtomicU32::new(0);
        let start = Instant::now();
        assert!(!futex_wait(&word, 0, Some(Duration::from_millis(20))));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn wake_releases_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let c_word = word.clone();
        let waiter = std::thread::spawn(move || {
            while c_word.load(Ordering::Acquire) == 0 {
                futex_wait(&c_word, 0, Some(Duration::from_secs(5)));
            }
        });
        std::thread::sleep(Duration::from_millis(10));
        word.store(1, Ordering::Release);
        futex_wake(&word, u32::MAX);
        waiter.join().unwrap();
    }
}
