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
use super::ControlMessage;
use crate::arena::ArenaObject;
use crate::defaults::{MAX_NUM_MESSAGES, MESSAGE_SIZE};
use crate::sync::{RawShmMutex, ShmCondition};
use dsm_util::core::{DsmErrorKind, DsmResult};
use dsm_util::dsmerror;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// The bounded control message queue, shared by all the processes of an arena.
///
/// A ring of [`MAX_NUM_MESSAGES`] raw messages. Senders block while it is
/// full; the server pulls without blocking.
#[repr(C)]
pub struct MessageQueue {
    lock: RawShmMutex,
    head: AtomicU32,
    len: AtomicU32,
    not_full: ShmCondition,
    slots: UnsafeCell<[[u8; MESSAGE_SIZE]; MAX_NUM_MESSAGES]>,
}

// Slots are only touched with the lock held.
unsafe impl Sync for MessageQueue {}
unsafe impl Send for MessageQueue {}
unsafe impl ArenaObject for MessageQueue {}

impl MessageQueue {
    #[inline]
    pub fn capacity(&self) -> usize {
        MAX_NUM_MESSAGES
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, msg: &[u8; MESSAGE_SIZE]) -> bool {
        let _guard = self.lock.guard();
        let len = self.len.load(Ordering::Relaxed) as usize;
        if len == MAX_NUM_MESSAGES {
            return false;
        }
        let idx = (self.head.load(Ordering::Relaxed) as usize + len) % MAX_NUM_MESSAGES;
        unsafe { (*self.slots.get())[idx] = *msg };
        self.len.store(len as u32 + 1, Ordering::Release);
        true
    }

    fn pull(&self) -> Option<[u8; MESSAGE_SIZE]> {
        let msg = {
            let _guard = self.lock.guard();
            let len = self.len.load(Ordering::Relaxed) as usize;
            if len == 0 {
                return None;
            }
            let head = self.head.load(Ordering::Relaxed) as usize;
            let msg = unsafe { (*self.slots.get())[head] };
            self.head
                .store(((head + 1) % MAX_NUM_MESSAGES) as u32, Ordering::Relaxed);
            self.len.store(len as u32 - 1, Ordering::Release);
            msg
        };
        self.not_full.notify_all();
        Some(msg)
    }

    fn push_until(&self, msg: &ControlMessage, deadline: Option<Instant>) -> bool {
        let raw = msg.encode();
        loop {
            let seen = self.not_full.generation();
            if self.push(&raw) {
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
            log::trace!("Control queue full, waiting");
            self.not_full.wait(seen, remaining);
        }
    }

    /// Enqueues `msg`, blocking as long as the queue is full.
    pub fn send(&self, msg: &ControlMessage) {
        self.push_until(msg, None);
    }

    /// Enqueues `msg`, blocking at most `timeout` while the queue is full.
    pub fn send_timeout(&self, msg: &ControlMessage, timeout: Duration) -> DsmResult<()> {
        if self.push_until(msg, Some(Instant::now() + timeout)) {
            Ok(())
        } else {
            let e = format!("control queue still full after {:?}", timeout);
            dsmerror!(DsmErrorKind::Timeout { descr: e })
        }
    }

    /// The messages not yet consumed, oldest first. Those that do not
    /// decode are left out.
    pub fn snapshot(&self) -> Vec<ControlMessage> {
        let _guard = self.lock.guard();
        let head = self.head.load(Ordering::Relaxed) as usize;
        let len = self.len.load(Ordering::Relaxed) as usize;
        let slots = unsafe { &*self.slots.get() };
        (0..len)
            .filter_map(|i| ControlMessage::decode(&slots[(head + i) % MAX_NUM_MESSAGES]).ok())
            .collect()
    }

    /// Dequeues the oldest message, if any.
    ///
    /// A message that does not decode is consumed anyway and reported as an error.
    pub fn try_receive(&self) -> Option<DsmResult<ControlMessage>> {
        self.pull().map(|raw| ControlMessage::decode(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BufferName, Operation};
    use std::sync::Arc;

    const NO_WAIT: Duration = Duration::from_millis(0);

    fn zeroed() -> Arc<MessageQueue> {
        // All-zero is the empty queue
        Arc::new(unsafe { std::mem::zeroed() })
    }

    fn disconnect(client_id: u8) -> ControlMessage {
        ControlMessage::new(client_id, Operation::DisconnectClient)
    }

    #[test]
    fn fifo_order() {
        let queue = zeroed();
        for i in 0..3 {
            queue.send(&disconnect(i));
        }
        assert_eq!(queue.len(), 3);
        for i in 0..3 {
            assert_eq!(queue.try_receive().unwrap().unwrap().client_id, i);
        }
        assert!(queue.try_receive().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn bounded_to_capacity() {
        let queue = zeroed();
        for i in 0..queue.capacity() {
            assert!(queue.send_timeout(&disconnect(i as u8), NO_WAIT).is_ok());
        }
        assert!(queue.send_timeout(&disconnect(99), NO_WAIT).is_err());
        assert!(queue
            .send_timeout(&disconnect(99), Duration::from_millis(20))
            .is_err());
        // Wrap around the ring
        assert_eq!(queue.try_receive().unwrap().unwrap().client_id, 0);
        assert!(queue.send_timeout(&disconnect(100), NO_WAIT).is_ok());
        let snapshot: Vec<u8> = queue.snapshot().iter().map(|m| m.client_id).collect();
        assert_eq!(snapshot.first(), Some(&1));
        assert_eq!(snapshot.last(), Some(&100));
        let ids: Vec<u8> = std::iter::from_fn(|| queue.try_receive())
            .map(|m| m.unwrap().client_id)
            .collect();
        assert_eq!(ids.len(), queue.capacity());
        assert_eq!(ids.last(), Some(&100));
    }

    #[test]
    fn full_queue_blocks_sender() {
        let queue = zeroed();
        for i in 0..queue.capacity() {
            queue.send(&disconnect(i as u8));
        }
        let c_queue = queue.clone();
        let sender = std::thread::spawn(move || {
            let msg = ControlMessage::new(
                1,
                Operation::DisconnectLocal {
                    name: BufferName::new("late").unwrap(),
                },
            );
            c_queue.send(&msg);
        });
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.len(), queue.capacity());
        assert!(queue.try_receive().is_some());
        sender.join().unwrap();
        assert_eq!(queue.len(), queue.capacity());
    }
}
