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
use super::{RawShmMutex, ShmCondition};
use crate::arena::ArenaObject;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Startup rendezvous between the server and its first client.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rendezvous {
    /// The arena exists, nobody announced itself yet.
    WaitingForPeer = 0,
    /// A client announced itself and waits for the server.
    Ready = 1,
    /// The server acknowledged: every later client goes straight through.
    Released = 2,
}

impl From<u32> for Rendezvous {
    fn from(v: u32) -> Rendezvous {
        match v {
            0 => Rendezvous::WaitingForPeer,
            1 => Rendezvous::Ready,
            _ => Rendezvous::Released,
        }
    }
}

/// Which registry a pending change concerns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    Local,
    Remote,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Modified {
    pub local: bool,
    pub remote: bool,
}

impl Modified {
    #[inline]
    pub fn any(&self) -> bool {
        self.local || self.remote
    }
}

/// The synchronization block: one per arena, built by the server.
///
/// Carries the rendezvous state and the "something changed" flags clients raise
/// after posting a control message. A single condition is used for both.
#[repr(C)]
#[derive(Debug)]
pub struct SyncBlock {
    mutex: RawShmMutex,
    rendezvous: AtomicU32,
    local_modified: AtomicBool,
    remote_modified: AtomicBool,
    _reserved: [u8; 2],
    changed: ShmCondition,
}

unsafe impl ArenaObject for SyncBlock {}

impl SyncBlock {
    #[inline]
    pub fn rendezvous(&self) -> Rendezvous {
        Rendezvous::from(self.rendezvous.load(Ordering::Acquire))
    }

    /// Skips the rendezvous altogether.
    pub fn release(&self) {
        let _guard = self.mutex.guard();
        self.rendezvous
            .store(Rendezvous::Released as u32, Ordering::Release);
        drop(_guard);
        self.changed.notify_all();
    }

    /// Server side of the rendezvous: blocks until a client has announced
    /// itself, then releases it.
    ///
    /// `stop` is checked every `poll`; returns `false` when it was raised
    /// before any client showed up.
    pub fn await_peer(&self, poll: Duration, stop: &AtomicBool) -> bool {
        loop {
            let seen = self.changed.generation();
            let guard = self.mutex.guard();
            match self.rendezvous() {
                Rendezvous::Ready => {
                    self.rendezvous
                        .store(Rendezvous::Released as u32, Ordering::Release);
                    drop(guard);
                    log::debug!("Rendezvous: peer announced, releasing it");
                    self.changed.notify_all();
                    return true;
                }
                Rendezvous::Released => return true,
                Rendezvous::WaitingForPeer => drop(guard),
            }
            if stop.load(Ordering::Acquire) {
                return false;
            }
            self.changed.wait(seen, Some(poll));
        }
    }

    /// Client side of the rendezvous: announces this client and blocks until the
    /// server has released it. Returns `false` if `timeout` expired first.
    pub fn announce(&self, timeout: Option<Duration>) -> bool {
        {
            let _guard = self.mutex.guard();
            if self.rendezvous() == Rendezvous::WaitingForPeer {
                self.rendezvous
                    .store(Rendezvous::Ready as u32, Ordering::Release);
                log::debug!("Rendezvous: announced, waiting for the server");
            }
        }
        self.changed.notify_all();

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let seen = self.changed.generation();
            if self.rendezvous() == Rendezvous::Released {
                return true;
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            self.changed.wait(seen, remaining);
        }
    }

    pub fn mark_modified(&self, scope: Scope) {
        {
            let _guard = self.mutex.guard();
            match scope {
                Scope::Local => self.local_modified.store(true, Ordering::Release),
                Scope::Remote => self.remote_modified.store(true, Ordering::Release),
            }
        }
        self.changed.notify_all();
    }

    /// Returns and clears the modification flags.
    pub fn take_modified(&self) -> Modified {
        let _guard = self.mutex.guard();
        Modified {
            local: self.local_modified.swap(false, Ordering::AcqRel),
            remote: self.remote_modified.swap(false, Ordering::AcqRel),
        }
    }

    /// Blocks until a modification flag is raised or `timeout` expires, then
    /// returns and clears the flags.
    pub fn wait_modified(&self, timeout: Duration) -> Modified {
        let seen = self.changed.generation();
        let modified = self.take_modified();
        if modified.any() {
            return modified;
        }
        self.changed.wait(seen, Some(timeout));
        self.take_modified()
    }

    /// Wakes every waiter without raising any flag.
    pub fn wake_all(&self) {
        self.changed.notify_all();
    }
}
