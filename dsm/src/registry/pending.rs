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
use super::BufferKey;
use crate::arena::ArenaObject;
use crate::defaults::{MAX_NAME_LEN, MAX_TOKEN_LEN, PENDING_CAPACITY};
use crate::protocol::BufferName;
use crate::sync::RawShmMutex;
use dsm_util::core::{DsmErrorKind, DsmResult};
use dsm_util::dsmerror;
use std::cell::UnsafeCell;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DefinitionPayload {
    Local { size: u16, local_only: bool },
    Remote { endpoint: SocketAddrV4 },
}

/// A registration request waiting to be materialized by the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferDefinition {
    pub name: BufferName,
    pub token: String,
    pub client_id: u8,
    pub payload: DefinitionPayload,
}

impl BufferDefinition {
    pub fn key(&self) -> BufferKey {
        match self.payload {
            DefinitionPayload::Local { .. } => BufferKey::local(self.name.clone()),
            DefinitionPayload::Remote { endpoint } => BufferKey::remote(self.name.clone(), endpoint),
        }
    }
}

impl fmt::Display for BufferDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.payload {
            DefinitionPayload::Local { size, local_only } => write!(
                f,
                "{} ({} bytes{}) for client {}",
                self.name,
                size,
                if local_only { ", local only" } else { "" },
                self.client_id
            ),
            DefinitionPayload::Remote { endpoint } => write!(
                f,
                "{} from {} for client {}",
                self.name, endpoint, self.client_id
            ),
        }
    }
}

const KIND_LOCAL: u8 = 1;
const KIND_REMOTE: u8 = 2;

#[repr(C)]
#[derive(Clone, Copy)]
struct PendingRecord {
    kind: u8,
    client_id: u8,
    local_only: u8,
    name_len: u8,
    name: [u8; MAX_NAME_LEN],
    size: u16,
    addr: [u8; 4],
    port: u16,
    token_len: u8,
    token: [u8; MAX_TOKEN_LEN],
    _reserved: u8,
}

impl PendingRecord {
    fn encode(def: &BufferDefinition) -> PendingRecord {
        let token = def.token.as_bytes();
        let token_len = token.len().min(MAX_TOKEN_LEN);
        let mut token_field = [0u8; MAX_TOKEN_LEN];
        token_field[..token_len].copy_from_slice(&token[..token_len]);
        let (kind, local_only, size, addr, port) = match def.payload {
            DefinitionPayload::Local { size, local_only } => {
                (KIND_LOCAL, local_only as u8, size, [0; 4], 0)
            }
            DefinitionPayload::Remote { endpoint } => {
                (KIND_REMOTE, 0, 0, endpoint.ip().octets(), endpoint.port())
            }
        };
        PendingRecord {
            kind,
            client_id: def.client_id,
            local_only,
            name_len: def.name.as_str().len() as u8,
            name: def.name.to_field(),
            size,
            addr,
            port,
            token_len: token_len as u8,
            token: token_field,
            _reserved: 0,
        }
    }

    fn decode(&self) -> Option<BufferDefinition> {
        let name = BufferName::from_field(&self.name[..self.name_len as usize]).ok()?;
        let payload = match self.kind {
            KIND_LOCAL => DefinitionPayload::Local {
                size: self.size,
                local_only: self.local_only != 0,
            },
            KIND_REMOTE => {
                let [a, b, c, d] = self.addr;
                DefinitionPayload::Remote {
                    endpoint: SocketAddrV4::new(Ipv4Addr::new(a, b, c, d), self.port),
                }
            }
            _ => return None,
        };
        Some(BufferDefinition {
            name,
            token: String::from_utf8_lossy(&self.token[..self.token_len as usize]).into_owned(),
            client_id: self.client_id,
            payload,
        })
    }
}

/// The ordered queue of [`BufferDefinition`]s, built inside the arena.
#[repr(C)]
pub struct PendingQueue {
    lock: RawShmMutex,
    len: AtomicU32,
    records: UnsafeCell<[PendingRecord; PENDING_CAPACITY]>,
}

unsafe impl Sync for PendingQueue {}
unsafe impl Send for PendingQueue {}
unsafe impl ArenaObject for PendingQueue {}

impl PendingQueue {
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        PENDING_CAPACITY
    }

    /// Appends `def`. Returns `false` and drops it if a definition with the
    /// same key is already waiting.
    pub fn push(&self, def: &BufferDefinition) -> DsmResult<bool> {
        let record = PendingRecord::encode(def);
        let key = def.key();

        let _guard = self.lock.guard();
        let records = unsafe { &mut *self.records.get() };
        let len = self.len.load(Ordering::Relaxed) as usize;
        if records[..len]
            .iter()
            .filter_map(|r| r.decode())
            .any(|d| d.key() == key)
        {
            return Ok(false);
        }
        if len == PENDING_CAPACITY {
            let e = format!("no room for {} in the pending queue", def);
            return dsmerror!(DsmErrorKind::RegistryFull { descr: e });
        }
        records[len] = record;
        self.len.store(len as u32 + 1, Ordering::Release);
        Ok(true)
    }

    /// Removes and returns every waiting definition, oldest first.
    pub fn drain(&self) -> Vec<BufferDefinition> {
        let _guard = self.lock.guard();
        let records = unsafe { &*self.records.get() };
        let len = self.len.swap(0, Ordering::AcqRel) as usize;
        records[..len].iter().filter_map(|r| r.decode()).collect()
    }

    /// Returns every waiting definition, oldest first, leaving them queued.
    pub fn snapshot(&self) -> Vec<BufferDefinition> {
        let _guard = self.lock.guard();
        let records = unsafe { &*self.records.get() };
        let len = self.len.load(Ordering::Acquire) as usize;
        records[..len].iter().filter_map(|r| r.decode()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(name: &str, size: u16, client_id: u8) -> BufferDefinition {
        BufferDefinition {
            name: BufferName::new(name).unwrap(),
            token: "pass".to_string(),
            client_id,
            payload: DefinitionPayload::Local {
                size,
                local_only: false,
            },
        }
    }

    #[test]
    fn drains_in_insertion_order() {
        let queue: PendingQueue = unsafe { std::mem::zeroed() };
        let remote = BufferDefinition {
            name: BufferName::new("sensor").unwrap(),
            token: String::new(),
            client_id: 2,
            payload: DefinitionPayload::Remote {
                endpoint: "10.1.2.3:24005".parse().unwrap(),
            },
        };
        assert!(queue.push(&local("b", 8, 1)).unwrap());
        assert!(queue.push(&remote).unwrap());
        assert!(queue.push(&local("a", 4, 1)).unwrap());
        assert_eq!(queue.snapshot().len(), 3);

        let drained = queue.drain();
        assert_eq!(drained, vec![local("b", 8, 1), remote, local("a", 4, 1)]);
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn identical_names_are_dropped() {
        let queue: PendingQueue = unsafe { std::mem::zeroed() };
        assert!(queue.push(&local("temp", 4, 1)).unwrap());
        assert!(!queue.push(&local("temp", 16, 2)).unwrap());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn bounded_capacity() {
        let queue: PendingQueue = unsafe { std::mem::zeroed() };
        for i in 0..queue.capacity() {
            assert!(queue.push(&local(&format!("b{}", i), 4, 0)).unwrap());
        }
        assert!(queue.push(&local("overflow", 4, 0)).is_err());
    }
}
