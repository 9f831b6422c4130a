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
//! The arena: a fixed-size named shared memory segment.
//!
//! Every process maps the arena at its own base address, hence nothing inside
//! the arena ever stores a pointer: locations are [`Handle`]s, i.e. offsets
//! from the beginning of the segment, translated on demand with
//! [`Arena::translate`].
//!
//! The segment starts with a header holding a directory of named objects.
//! The creator builds the shared structures with [`Arena::construct`] and every
//! other process locates them by name with [`Arena::find`].
mod allocator;

use allocator::{align_up, ArenaAllocator, CHUNK_ALIGNMENT};
use dsm_util::core::{DsmErrorKind, DsmResult};
use dsm_util::{dsmerror, dsmlock};
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::fmt;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

const ARENA_MAGIC: [u8; 8] = *b"DSMARENA";
const DIRECTORY_CAPACITY: usize = 16;
const OBJECT_NAME_LEN: usize = 24;
// The data region starts on a cache line
const DATA_ALIGNMENT: usize = 64;

/// Types that can be built inside the arena.
///
/// # Safety
/// Implementors must be `#[repr(C)]`, contain no pointers, be safe to share
/// between processes (atomics or data guarded by in-arena locks) and accept
/// the all-zero bit pattern as their initial value.
pub unsafe trait ArenaObject: Sized {}

/// A relocatable reference into the arena: an offset from its base.
///
/// Offset 0 is the arena header, so it doubles as the null handle.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    pub const NULL: Handle = Handle(0);

    #[inline]
    pub fn offset(&self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for Handle {
    fn from(offset: u32) -> Handle {
        Handle(offset)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{:#06x}", self.0)
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct DirectoryEntry {
    name: [u8; OBJECT_NAME_LEN],
    offset: u32,
    len: u32,
}

#[repr(C)]
struct ArenaHeader {
    magic: [u8; 8],
    size: u32,
    max_buffer_size: u32,
    objects: AtomicU32,
    _reserved: u32,
    directory: [DirectoryEntry; DIRECTORY_CAPACITY],
}

fn object_name(name: &str) -> DsmResult<[u8; OBJECT_NAME_LEN]> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > OBJECT_NAME_LEN {
        let e = format!("invalid arena object name: {}", name);
        return dsmerror!(DsmErrorKind::ArenaError { descr: e });
    }
    let mut field = [0u8; OBJECT_NAME_LEN];
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(field)
}

#[cfg(unix)]
fn os_id(name: &str) -> String {
    format!("/{}", name)
}

#[cfg(not(unix))]
fn os_id(name: &str) -> String {
    name.to_string()
}

pub struct Arena {
    name: String,
    shmem: Shmem,
    size: usize,
    max_buffer_size: u16,
    // Only present in the process that created the arena
    allocator: Option<Mutex<ArenaAllocator>>,
}

// The mapping stays valid for the lifetime of the Arena, and the shared
// structures inside it synchronize through their own atomics.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Creates the arena `name`. Fails if a segment with that name exists.
    ///
    /// The creator owns the segment: dropping it unlinks the name.
    pub fn create(name: &str, size: usize, max_buffer_size: u16) -> DsmResult<Arena> {
        let data_start = align_up(size_of::<ArenaHeader>(), DATA_ALIGNMENT);
        if size <= data_start || size > u32::MAX as usize {
            let e = format!("invalid arena size: {}", size);
            return dsmerror!(DsmErrorKind::ArenaError { descr: e });
        }

        let shmem = match ShmemConf::new().size(size).os_id(os_id(name)).create() {
            Ok(m) => m,
            Err(ShmemError::MappingIdExists) => {
                let e = format!("arena {} already exists", name);
                return dsmerror!(DsmErrorKind::ArenaError { descr: e });
            }
            Err(e) => {
                let e = format!("unable to create arena {}: {:?}", name, e);
                return dsmerror!(DsmErrorKind::ArenaError { descr: e });
            }
        };

        let base = shmem.as_ptr();
        unsafe {
            std::ptr::write_bytes(base, 0, size);
            std::ptr::write(
                base as *mut ArenaHeader,
                ArenaHeader {
                    magic: ARENA_MAGIC,
                    size: size as u32,
                    max_buffer_size: max_buffer_size as u32,
                    objects: AtomicU32::new(0),
                    _reserved: 0,
                    directory: [DirectoryEntry {
                        name: [0; OBJECT_NAME_LEN],
                        offset: 0,
                        len: 0,
                    }; DIRECTORY_CAPACITY],
                },
            );
        }

        log::debug!("Created arena {} of {} bytes at {:?}", name, size, base);
        Ok(Arena {
            name: name.to_string(),
            shmem,
            size,
            max_buffer_size,
            allocator: Some(Mutex::new(ArenaAllocator::new(data_start, size))),
        })
    }

    /// Maps the existing arena `name`. Fails if there is none.
    pub fn open(name: &str) -> DsmResult<Arena> {
        let shmem = match ShmemConf::new().os_id(os_id(name)).open() {
            Ok(m) => m,
            Err(e) => {
                let e = format!("unable to open arena {}: {:?}", name, e);
                return dsmerror!(DsmErrorKind::ArenaError { descr: e });
            }
        };
        if shmem.len() < size_of::<ArenaHeader>() {
            let e = format!("arena {} is too small", name);
            return dsmerror!(DsmErrorKind::ArenaError { descr: e });
        }

        let header = unsafe { &*(shmem.as_ptr() as *const ArenaHeader) };
        if header.magic != ARENA_MAGIC {
            let e = format!("segment {} is not an arena", name);
            return dsmerror!(DsmErrorKind::ArenaError { descr: e });
        }
        let size = header.size as usize;
        if size > shmem.len() {
            let e = format!("arena {} is truncated", name);
            return dsmerror!(DsmErrorKind::ArenaError { descr: e });
        }
        let max_buffer_size = header.max_buffer_size as u16;

        log::debug!("Opened arena {} at {:?}", name, shmem.as_ptr());
        Ok(Arena {
            name: name.to_string(),
            shmem,
            size,
            max_buffer_size,
            allocator: None,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The largest buffer the creator accepts.
    #[inline]
    pub fn max_buffer_size(&self) -> u16 {
        self.max_buffer_size
    }

    #[inline]
    pub fn is_owner(&self) -> bool {
        self.shmem.is_owner()
    }

    #[inline]
    fn header(&self) -> &ArenaHeader {
        unsafe { &*(self.shmem.as_ptr() as *const ArenaHeader) }
    }

    /// Translates a handle into an address valid in this process only.
    ///
    /// Fails unless `len` bytes starting at `handle` lie inside the arena.
    pub fn translate(&self, handle: Handle, len: usize) -> DsmResult<NonNull<u8>> {
        let in_bounds = handle
            .offset()
            .checked_add(len)
            .map_or(false, |end| end <= self.size);
        if handle.is_null() || !in_bounds {
            let e = format!("handle {} + {} is outside of arena {}", handle, len, self.name);
            return dsmerror!(DsmErrorKind::ArenaError { descr: e });
        }
        let ptr = unsafe { self.shmem.as_ptr().add(handle.offset()) };
        match NonNull::new(ptr) {
            Some(ptr) => Ok(ptr),
            None => {
                let e = format!("arena {} is not mapped", self.name);
                dsmerror!(DsmErrorKind::ArenaError { descr: e })
            }
        }
    }

    /// The handle of an address of this process' mapping, if it falls inside the arena.
    pub fn address_to_handle(&self, ptr: *const u8) -> Option<Handle> {
        let base = self.shmem.as_ptr() as usize;
        let addr = ptr as usize;
        if addr > base && addr < base + self.size {
            Some(Handle((addr - base) as u32))
        } else {
            None
        }
    }

    /// A reference to the object of type `T` stored at `handle`.
    pub fn object<T: ArenaObject>(&self, handle: Handle) -> DsmResult<&T> {
        let ptr = self.translate(handle, size_of::<T>())?;
        if ptr.as_ptr() as usize % align_of::<T>() != 0 {
            let e = format!("handle {} is misaligned", handle);
            return dsmerror!(DsmErrorKind::ArenaError { descr: e });
        }
        Ok(unsafe { &*(ptr.as_ptr() as *const T) })
    }

    fn allocator(&self) -> DsmResult<&Mutex<ArenaAllocator>> {
        match &self.allocator {
            Some(allocator) => Ok(allocator),
            None => {
                let e = format!("arena {} was not created by this process", self.name);
                dsmerror!(DsmErrorKind::ArenaError { descr: e })
            }
        }
    }

    /// Allocates `len` zeroed bytes. Only available to the creator.
    pub fn allocate(&self, len: usize) -> DsmResult<Handle> {
        let offset = {
            let mut allocator = dsmlock!(self.allocator()?);
            allocator.alloc(len)
        };
        match offset {
            Some(offset) => {
                let handle = Handle(offset as u32);
                let ptr = self.translate(handle, len)?;
                unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, len) };
                Ok(handle)
            }
            None => {
                let e = format!("no room for {} bytes in arena {}", len, self.name);
                dsmerror!(DsmErrorKind::ArenaExhausted { descr: e })
            }
        }
    }

    /// Gives back an allocation. Only available to the creator.
    pub fn deallocate(&self, handle: Handle) -> DsmResult<()> {
        let mut allocator = dsmlock!(self.allocator()?);
        let size = allocator.allocation_size(handle.offset());
        if allocator.free(handle.offset()) {
            log::trace!("Freed {} bytes at {} in {}", size.unwrap_or(0), handle, self.name);
            Ok(())
        } else {
            let e = format!("handle {} is not allocated in arena {}", handle, self.name);
            dsmerror!(DsmErrorKind::ArenaError { descr: e })
        }
    }

    /// Free bytes left for allocations, if this process created the arena.
    pub fn available(&self) -> Option<usize> {
        self.allocator
            .as_ref()
            .map(|allocator| dsmlock!(allocator).available())
    }

    /// Builds a zeroed `T` in the arena and publishes it under `name`.
    pub fn construct<T: ArenaObject>(&self, name: &str) -> DsmResult<&T> {
        let field = object_name(name)?;
        if align_of::<T>() > CHUNK_ALIGNMENT {
            let e = format!("{} requires an alignment above {}", name, CHUNK_ALIGNMENT);
            return dsmerror!(DsmErrorKind::ArenaError { descr: e });
        }
        let mut allocator = dsmlock!(self.allocator()?);

        let header = self.header();
        let count = header.objects.load(Ordering::Acquire) as usize;
        if header.directory[..count].iter().any(|e| e.name == field) {
            let e = format!("{} already exists in arena {}", name, self.name);
            return dsmerror!(DsmErrorKind::ArenaError { descr: e });
        }
        if count == DIRECTORY_CAPACITY {
            let e = format!("directory of arena {} is full", self.name);
            return dsmerror!(DsmErrorKind::ArenaExhausted { descr: e });
        }

        let offset = match allocator.alloc(size_of::<T>()) {
            Some(offset) => offset,
            None => {
                let e = format!("no room for {} in arena {}", name, self.name);
                return dsmerror!(DsmErrorKind::ArenaExhausted { descr: e });
            }
        };
        let handle = Handle(offset as u32);
        let ptr = self.translate(handle, size_of::<T>())?;
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0, size_of::<T>());
            let entry = (self.shmem.as_ptr() as *mut ArenaHeader)
                .as_mut()
                .map(|h| &mut h.directory[count]);
            if let Some(entry) = entry {
                *entry = DirectoryEntry {
                    name: field,
                    offset: offset as u32,
                    len: size_of::<T>() as u32,
                };
            }
        }
        header.objects.store(count as u32 + 1, Ordering::Release);
        drop(allocator);

        log::trace!("Constructed {} at {} in arena {}", name, handle, self.name);
        self.object(handle)
    }

    /// Locates the object published under `name`.
    pub fn find<T: ArenaObject>(&self, name: &str) -> DsmResult<&T> {
        let field = object_name(name)?;
        let header = self.header();
        let count = (header.objects.load(Ordering::Acquire) as usize).min(DIRECTORY_CAPACITY);
        match header.directory[..count].iter().find(|e| e.name == field) {
            Some(entry) if entry.len as usize == size_of::<T>() => {
                self.object(Handle(entry.offset))
            }
            Some(_) => {
                let e = format!("{} in arena {} has an unexpected size", name, self.name);
                dsmerror!(DsmErrorKind::ArenaError { descr: e })
            }
            None => {
                let e = format!("{} not found in arena {}", name, self.name);
                dsmerror!(DsmErrorKind::NotFound { descr: e })
            }
        }
    }

    /// Unlinks the segment `name` without mapping it.
    ///
    /// Meant to clean up after a creator that did not shut down properly; every
    /// process still mapping the segment keeps its mapping.
    pub fn destroy(name: &str) -> DsmResult<()> {
        match ShmemConf::new().os_id(os_id(name)).open() {
            Ok(mut shmem) => {
                shmem.set_owner(true);
                log::debug!("Destroying arena {}", name);
                Ok(())
            }
            Err(e) => {
                let e = format!("unable to open arena {}: {:?}", name, e);
                dsmerror!(DsmErrorKind::ArenaError { descr: e })
            }
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if self.is_owner() {
            log::debug!("Unlinking arena {}", self.name);
        }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Arena");
        s.field("name", &self.name)
            .field("size", &self.size)
            .field("owner", &self.is_owner());
        if let Some(allocator) = &self.allocator {
            s.field("allocator", &*dsmlock!(allocator));
        }
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[repr(C)]
    struct Counter {
        value: AtomicU64,
    }

    unsafe impl ArenaObject for Counter {}

    fn unique_name(tag: &str) -> String {
        format!("dsmut_{}_{}", tag, std::process::id())
    }

    #[test]
    fn create_twice_fails() {
        let name = unique_name("twice");
        let _arena = Arena::create(&name, 8192, 1024).unwrap();
        assert!(Arena::create(&name, 8192, 1024).is_err());
    }

    #[test]
    fn open_missing_fails() {
        assert!(Arena::open(&unique_name("missing")).is_err());
    }

    #[test]
    fn objects_are_shared_between_mappings() {
        let name = unique_name("objects");
        let owner = Arena::create(&name, 8192, 1024).unwrap();
        let counter = owner.construct::<Counter>("Counter").unwrap();
        counter.value.store(42, Ordering::SeqCst);
        assert!(owner.construct::<Counter>("Counter").is_err());

        let other = Arena::open(&name).unwrap();
        assert!(!other.is_owner());
        assert_eq!(other.max_buffer_size(), 1024);
        let seen = other.find::<Counter>("Counter").unwrap();
        assert_eq!(seen.value.load(Ordering::SeqCst), 42);
        seen.value.store(7, Ordering::SeqCst);
        assert_eq!(counter.value.load(Ordering::SeqCst), 7);
        assert!(other.find::<Counter>("Missing").is_err());
        assert!(other.allocate(8).is_err());
    }

    #[test]
    fn handles_translate_in_every_mapping() {
        let name = unique_name("handles");
        let owner = Arena::create(&name, 8192, 1024).unwrap();
        let handle = owner.allocate(16).unwrap();
        let ptr = owner.translate(handle, 16).unwrap();
        unsafe { std::ptr::copy_nonoverlapping(b"sixteen bytes!!!".as_ptr(), ptr.as_ptr(), 16) };
        assert_eq!(owner.address_to_handle(ptr.as_ptr()), Some(handle));

        let other = Arena::open(&name).unwrap();
        let other_ptr = other.translate(handle, 16).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(other_ptr.as_ptr(), 16) };
        assert_eq!(bytes, b"sixteen bytes!!!");

        assert!(owner.translate(handle, 1 << 20).is_err());
        assert!(owner.translate(Handle::NULL, 1).is_err());
        owner.deallocate(handle).unwrap();
        assert!(owner.deallocate(handle).is_err());
    }

    #[test]
    fn exhaustion_is_reported() {
        let name = unique_name("full");
        let owner = Arena::create(&name, 4096, 1024).unwrap();
        let err = owner.allocate(8192).unwrap_err();
        match err.get_kind() {
            DsmErrorKind::ArenaExhausted { .. } => {}
            kind => panic!("unexpected error kind: {}", kind),
        }
    }
}
