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
use dsm_util::sync::{futex_wait, futex_wake};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// A condition variable living in shared memory.
///
/// Unlike POSIX condition variables no mutex is handed over: the waiter
/// samples the [generation](ShmCondition::generation) *before* checking its
/// predicate and passes it to [wait](ShmCondition::wait). A notification that
/// happens in between bumps the generation and makes the wait return at once,
/// so no wake-up is lost.
#[repr(C)]
#[derive(Debug, Default)]
pub struct ShmCondition {
    generation: AtomicU32,
}

impl ShmCondition {
    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Waits for a notification newer than `seen`.
    ///
    /// Returns `false` if the timeout expired first.
    pub fn wait(&self, seen: u32, timeout: Option<Duration>) -> bool {
        if self.generation() != seen {
            return true;
        }
        futex_wait(&self.generation, seen, timeout) || self.generation() != seen
    }

    #[inline]
    pub fn notify_all(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        futex_wake(&self.generation, u32::MAX);
    }
}
