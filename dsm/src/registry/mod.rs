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
//! The buffer registries and the structures feeding them.
//!
//! Each arena carries two [`BufferMap`]s: one for the buffers hosted locally,
//! keyed by name, and one for the local copies of remote buffers, keyed by
//! name and remote endpoint.
//!
//! Every map is guarded by one upgradable lock for its structure, and every
//! entry carries its own lock for the buffer contents. Contents accesses hold
//! the structure lock in shared mode only, so they contend with each other
//! only through the per-buffer lock.
mod clients;
mod pending;

pub use clients::*;
pub use pending::*;

use crate::arena::{Arena, ArenaObject, Handle};
use crate::defaults::{MAP_CAPACITY, MAX_NAME_LEN};
use crate::protocol::BufferName;
use crate::sync::RawShmRwLock;
use dsm_util::core::{DsmErrorKind, DsmResult};
use dsm_util::dsmerror;
use std::cell::UnsafeCell;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, Ordering};

/// The key of a registry entry.
///
/// Local buffers are identified by their name alone. A remote binding also
/// carries the endpoint it was fetched from, so the same name can be bound on
/// several remote hosts at once.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BufferKey {
    pub name: BufferName,
    pub endpoint: Option<SocketAddrV4>,
}

impl BufferKey {
    pub fn local(name: BufferName) -> BufferKey {
        BufferKey {
            name,
            endpoint: None,
        }
    }

    pub fn remote(name: BufferName, endpoint: SocketAddrV4) -> BufferKey {
        BufferKey {
            name,
            endpoint: Some(endpoint),
        }
    }
}

impl fmt::Display for BufferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.endpoint {
            Some(endpoint) => write!(f, "{}@{}", self.name, endpoint),
            None => write!(f, "{}", self.name),
        }
    }
}

/// What the registry knows about a materialized buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub handle: Handle,
    pub len: u16,
    /// Id of the client the buffer was created for.
    pub owner: u8,
    /// Never served to remote fetchers.
    pub local_only: bool,
}

#[repr(C)]
struct Slot {
    lock: RawShmRwLock,
    handle: Handle,
    len: u16,
    port: u16,
    addr: [u8; 4],
    used: u8,
    has_endpoint: u8,
    local_only: u8,
    owner: u8,
    name_len: u8,
    name: [u8; MAX_NAME_LEN],
    _reserved: u8,
}

impl Slot {
    fn matches(&self, key: &BufferKey) -> bool {
        if self.used == 0 {
            return false;
        }
        let name = key.name.as_str().as_bytes();
        if &self.name[..self.name_len as usize] != name {
            return false;
        }
        match &key.endpoint {
            Some(endpoint) => {
                self.has_endpoint != 0
                    && self.addr == endpoint.ip().octets()
                    && self.port == endpoint.port()
            }
            None => self.has_endpoint == 0,
        }
    }

    fn descriptor(&self) -> BufferDescriptor {
        BufferDescriptor {
            handle: self.handle,
            len: self.len,
            owner: self.owner,
            local_only: self.local_only != 0,
        }
    }

    fn key(&self) -> Option<BufferKey> {
        let name = std::str::from_utf8(&self.name[..self.name_len as usize]).ok()?;
        let name = BufferName::new(name).ok()?;
        if self.has_endpoint != 0 {
            let [a, b, c, d] = self.addr;
            let endpoint = SocketAddrV4::new(Ipv4Addr::new(a, b, c, d), self.port);
            Some(BufferKey::remote(name, endpoint))
        } else {
            Some(BufferKey::local(name))
        }
    }

    fn fill(&mut self, key: &BufferKey, descriptor: &BufferDescriptor) {
        let name = key.name.to_field();
        self.name = name;
        self.name_len = key.name.as_str().len() as u8;
        match &key.endpoint {
            Some(endpoint) => {
                self.has_endpoint = 1;
                self.addr = endpoint.ip().octets();
                self.port = endpoint.port();
            }
            None => {
                self.has_endpoint = 0;
                self.addr = [0; 4];
                self.port = 0;
            }
        }
        self.set_descriptor(descriptor);
        self.used = 1;
    }

    fn set_descriptor(&mut self, descriptor: &BufferDescriptor) {
        self.handle = descriptor.handle;
        self.len = descriptor.len;
        self.owner = descriptor.owner;
        self.local_only = descriptor.local_only as u8;
    }

    fn clear(&mut self) {
        self.used = 0;
        self.name_len = 0;
        self.name = [0; MAX_NAME_LEN];
        self.handle = Handle::NULL;
        self.len = 0;
    }
}

/// A fixed capacity map from [`BufferKey`] to [`BufferDescriptor`], built
/// inside the arena.
#[repr(C)]
pub struct BufferMap {
    lock: RawShmRwLock,
    len: AtomicU32,
    slots: UnsafeCell<[Slot; MAP_CAPACITY]>,
}

// Slots are read with the lock held in shared mode and written with it held
// in exclusive mode.
unsafe impl Sync for BufferMap {}
unsafe impl Send for BufferMap {}
unsafe impl ArenaObject for BufferMap {}

impl BufferMap {
    #[inline]
    pub fn capacity(&self) -> usize {
        MAP_CAPACITY
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Safety: the map lock must be held, in any mode.
    #[inline]
    unsafe fn slots(&self) -> &[Slot; MAP_CAPACITY] {
        &*self.slots.get()
    }

    // Safety: the map lock must be held in exclusive mode.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    unsafe fn slots_mut(&self) -> &mut [Slot; MAP_CAPACITY] {
        &mut *self.slots.get()
    }

    fn position(slots: &[Slot; MAP_CAPACITY], key: &BufferKey) -> Option<usize> {
        slots.iter().position(|s| s.matches(key))
    }

    pub fn lookup(&self, key: &BufferKey) -> Option<BufferDescriptor> {
        let _guard = self.lock.read();
        let slots = unsafe { self.slots() };
        Self::position(slots, key).map(|idx| slots[idx].descriptor())
    }

    #[inline]
    pub fn contains(&self, key: &BufferKey) -> bool {
        self.lookup(key).is_some()
    }

    /// Inserts a new entry. Returns `false` if `key` is already present, in
    /// which case the map is left untouched.
    pub fn insert(&self, key: &BufferKey, descriptor: BufferDescriptor) -> DsmResult<bool> {
        let guard = self.lock.upgradable_read();
        let slots = unsafe { self.slots() };
        if Self::position(slots, key).is_some() {
            return Ok(false);
        }
        let free = match slots.iter().position(|s| s.used == 0) {
            Some(free) => free,
            None => {
                let e = format!("no room for {} ({} entries)", key, MAP_CAPACITY);
                return dsmerror!(DsmErrorKind::RegistryFull { descr: e });
            }
        };

        let _guard = guard.upgrade();
        let slots = unsafe { self.slots_mut() };
        slots[free].fill(key, &descriptor);
        self.len.fetch_add(1, Ordering::AcqRel);
        Ok(true)
    }

    /// Points an existing entry to a new descriptor, returns the previous one.
    pub fn replace(
        &self,
        key: &BufferKey,
        descriptor: BufferDescriptor,
    ) -> Option<BufferDescriptor> {
        let guard = self.lock.upgradable_read();
        let idx = Self::position(unsafe { self.slots() }, key)?;
        let _guard = guard.upgrade();
        let slot = &mut unsafe { self.slots_mut() }[idx];
        let previous = slot.descriptor();
        slot.set_descriptor(&descriptor);
        Some(previous)
    }

    /// Removes an entry, returns its descriptor.
    pub fn erase(&self, key: &BufferKey) -> Option<BufferDescriptor> {
        let guard = self.lock.upgradable_read();
        let idx = Self::position(unsafe { self.slots() }, key)?;
        let _guard = guard.upgrade();
        let slot = &mut unsafe { self.slots_mut() }[idx];
        let previous = slot.descriptor();
        slot.clear();
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(previous)
    }

    /// Removes every entry created for client `owner`.
    pub fn erase_owned_by(&self, owner: u8) -> Vec<(BufferKey, BufferDescriptor)> {
        let guard = self.lock.upgradable_read();
        let owned: Vec<usize> = unsafe { self.slots() }
            .iter()
            .enumerate()
            .filter(|(_, s)| s.used != 0 && s.owner == owner)
            .map(|(idx, _)| idx)
            .collect();
        if owned.is_empty() {
            return vec![];
        }

        let _guard = guard.upgrade();
        let slots = unsafe { self.slots_mut() };
        let mut erased = Vec::with_capacity(owned.len());
        for idx in owned {
            let slot = &mut slots[idx];
            if let Some(key) = slot.key() {
                erased.push((key, slot.descriptor()));
            }
            slot.clear();
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        erased
    }

    /// A snapshot of every entry.
    pub fn entries(&self) -> Vec<(BufferKey, BufferDescriptor)> {
        let _guard = self.lock.read();
        unsafe { self.slots() }
            .iter()
            .filter(|s| s.used != 0)
            .filter_map(|s| s.key().map(|k| (k, s.descriptor())))
            .collect()
    }

    /// Runs `f` on the contents of the buffer `key` with its lock held in
    /// shared mode.
    pub fn with_contents<R, F>(&self, arena: &Arena, key: &BufferKey, f: F) -> DsmResult<R>
    where
        F: FnOnce(&[u8]) -> R,
    {
        let _guard = self.lock.read();
        let slots = unsafe { self.slots() };
        let slot = match Self::position(slots, key) {
            Some(idx) => &slots[idx],
            None => {
                let e = format!("buffer {} in arena {}", key, arena.name());
                return dsmerror!(DsmErrorKind::NotFound { descr: e });
            }
        };
        let ptr = arena.translate(slot.handle, slot.len as usize)?;
        let _contents = slot.lock.read();
        let data = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), slot.len as usize) };
        Ok(f(data))
    }

    /// Runs `f` on the contents of the buffer `key` with its lock held in
    /// exclusive mode.
    pub fn with_contents_mut<R, F>(&self, arena: &Arena, key: &BufferKey, f: F) -> DsmResult<R>
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let _guard = self.lock.read();
        let slots = unsafe { self.slots() };
        let slot = match Self::position(slots, key) {
            Some(idx) => &slots[idx],
            None => {
                let e = format!("buffer {} in arena {}", key, arena.name());
                return dsmerror!(DsmErrorKind::NotFound { descr: e });
            }
        };
        let ptr = arena.translate(slot.handle, slot.len as usize)?;
        let _contents = slot.lock.write();
        let data = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), slot.len as usize) };
        Ok(f(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn zeroed() -> Arc<BufferMap> {
        Arc::new(unsafe { std::mem::zeroed() })
    }

    fn key(name: &str) -> BufferKey {
        BufferKey::local(BufferName::new(name).unwrap())
    }

    fn descriptor(offset: u32, owner: u8) -> BufferDescriptor {
        BufferDescriptor {
            handle: Handle::from(offset),
            len: 4,
            owner,
            local_only: false,
        }
    }

    #[test]
    fn slot_size() {
        assert_eq!(std::mem::size_of::<Slot>(), 48);
    }

    #[test]
    fn duplicate_insert_is_a_no_op() {
        let map = zeroed();
        assert!(map.insert(&key("temp"), descriptor(64, 1)).unwrap());
        assert!(!map.insert(&key("temp"), descriptor(128, 2)).unwrap());
        assert_eq!(map.len(), 1);
        assert_eq!(map.lookup(&key("temp")), Some(descriptor(64, 1)));
    }

    #[test]
    fn remote_keys_include_the_endpoint() {
        let map = zeroed();
        let name = BufferName::new("sensor").unwrap();
        let a = BufferKey::remote(name.clone(), "10.0.0.1:24000".parse().unwrap());
        let b = BufferKey::remote(name.clone(), "10.0.0.2:24000".parse().unwrap());
        assert!(map.insert(&a, descriptor(64, 1)).unwrap());
        assert!(map.insert(&b, descriptor(128, 1)).unwrap());
        assert!(!map.contains(&BufferKey::local(name)));
        assert_eq!(map.len(), 2);
        assert_eq!(map.erase(&a), Some(descriptor(64, 1)));
        assert!(map.contains(&b));
        let entries = map.entries();
        assert_eq!(entries, vec![(b, descriptor(128, 1))]);
    }

    #[test]
    fn full_map_is_reported() {
        let map = zeroed();
        for i in 0..map.capacity() {
            let k = key(&format!("b{}", i));
            assert!(map.insert(&k, descriptor(64 + 8 * i as u32, 0)).unwrap());
        }
        match map.insert(&key("overflow"), descriptor(8, 0)) {
            Err(e) => match e.get_kind() {
                DsmErrorKind::RegistryFull { .. } => {}
                kind => panic!("unexpected error kind: {}", kind),
            },
            Ok(_) => panic!("insert into a full map succeeded"),
        }
    }

    #[test]
    fn erase_by_owner() {
        let map = zeroed();
        map.insert(&key("a"), descriptor(64, 1)).unwrap();
        map.insert(&key("b"), descriptor(128, 2)).unwrap();
        map.insert(&key("c"), descriptor(192, 1)).unwrap();
        let erased = map.erase_owned_by(1);
        assert_eq!(erased.len(), 2);
        assert_eq!(map.len(), 1);
        assert!(map.contains(&key("b")));
        assert!(map.erase_owned_by(1).is_empty());
        assert!(map.erase(&key("a")).is_none());
    }

    #[test]
    fn replace_keeps_the_key() {
        let map = zeroed();
        map.insert(&key("a"), descriptor(64, 1)).unwrap();
        assert_eq!(map.replace(&key("a"), descriptor(256, 1)), Some(descriptor(64, 1)));
        assert_eq!(map.lookup(&key("a")), Some(descriptor(256, 1)));
        assert!(map.replace(&key("b"), descriptor(8, 1)).is_none());
    }
}
