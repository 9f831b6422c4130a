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
use std::cmp::Ordering;
use std::collections::binary_heap::BinaryHeap;

const MIN_FREE_CHUNK_SIZE: usize = 64;
pub(crate) const CHUNK_ALIGNMENT: usize = 8;

pub(crate) fn align_up(value: usize, align: usize) -> usize {
    match value % align {
        0 => value,
        r => value + (align - r),
    }
}

#[derive(Eq, Copy, Clone, Debug)]
struct Chunk {
    offset: usize,
    size: usize,
}

impl Ord for Chunk {
    fn cmp(&self, other: &Self) -> Ordering {
        self.size.cmp(&other.size)
    }
}

impl PartialOrd for Chunk {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size
    }
}

/// Bookkeeping of the free and busy regions of the arena.
///
/// Only the process that created the arena allocates, so this state lives in
/// that process' private memory and deals in offsets only.
pub(crate) struct ArenaAllocator {
    size: usize,
    available: usize,
    free_list: BinaryHeap<Chunk>,
    busy_list: Vec<Chunk>,
}

impl ArenaAllocator {
    /// Manages the region `[start, end)` of the arena.
    pub(crate) fn new(start: usize, end: usize) -> ArenaAllocator {
        let start = align_up(start, CHUNK_ALIGNMENT);
        let size = end.saturating_sub(start);
        let mut free_list = BinaryHeap::new();
        if size > 0 {
            free_list.push(Chunk {
                offset: start,
                size,
            });
        }
        ArenaAllocator {
            size,
            available: size,
            free_list,
            busy_list: Vec::new(),
        }
    }

    /// Returns the offset of a region of at least `len` bytes.
    pub(crate) fn alloc(&mut self, len: usize) -> Option<usize> {
        log::trace!("ArenaAllocator::alloc({})", len);
        let required_len = align_up(len.max(1), CHUNK_ALIGNMENT);
        if self.available < required_len {
            log::debug!(
                "Arena does not have {} free bytes ({} available)",
                required_len,
                self.available
            );
            return None;
        }
        match self.take_chunk(required_len) {
            Some(offset) => Some(offset),
            None => {
                // The bytes are there but scattered
                self.defragment();
                self.take_chunk(required_len)
            }
        }
    }

    // The biggest free chunk is always picked: it leaves the biggest left-over.
    fn take_chunk(&mut self, required_len: usize) -> Option<usize> {
        match self.free_list.pop() {
            Some(mut chunk) if chunk.size >= required_len => {
                if chunk.size - required_len >= MIN_FREE_CHUNK_SIZE {
                    let free_chunk = Chunk {
                        offset: chunk.offset + required_len,
                        size: chunk.size - required_len,
                    };
                    self.free_list.push(free_chunk);
                    chunk.size = required_len;
                }
                self.available -= chunk.size;
                log::trace!("Allocated chunk {:?}", chunk);
                self.busy_list.push(chunk);
                Some(chunk.offset)
            }
            Some(chunk) => {
                self.free_list.push(chunk);
                None
            }
            None => None,
        }
    }

    /// Gives back the region starting at `offset`. Returns `false` if no
    /// allocation starts there.
    pub(crate) fn free(&mut self, offset: usize) -> bool {
        match self.busy_list.iter().position(|c| c.offset == offset) {
            Some(idx) => {
                let chunk = self.busy_list.swap_remove(idx);
                log::trace!("Freed chunk {:?}", chunk);
                self.available += chunk.size;
                self.free_list.push(chunk);
                true
            }
            None => false,
        }
    }

    /// Size in bytes of the allocation starting at `offset`.
    pub(crate) fn allocation_size(&self, offset: usize) -> Option<usize> {
        self.busy_list
            .iter()
            .find(|c| c.offset == offset)
            .map(|c| c.size)
    }

    /// Merges adjacent free chunks, returns how many chunks were merged away.
    pub(crate) fn defragment(&mut self) -> usize {
        if self.free_list.len() < 2 {
            return 0;
        }
        let mut chunks: Vec<Chunk> = self.free_list.drain().collect();
        chunks.sort_by_key(|c| c.offset);
        let before = chunks.len();
        let mut current = chunks[0];
        for next in chunks.into_iter().skip(1) {
            if current.offset + current.size == next.offset {
                current.size += next.size;
            } else {
                self.free_list.push(current);
                current = next;
            }
        }
        self.free_list.push(current);
        before - self.free_list.len()
    }

    #[inline]
    pub(crate) fn available(&self) -> usize {
        self.available
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size
    }
}

impl std::fmt::Debug for ArenaAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaAllocator")
            .field("size", &self.size)
            .field("available", &self.available)
            .field("free_list.len", &self.free_list.len())
            .field("busy_list.len", &self.busy_list.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_splits_and_aligns() {
        let mut a = ArenaAllocator::new(100, 4196);
        let x = a.alloc(10).unwrap();
        let y = a.alloc(10).unwrap();
        assert_eq!(x % CHUNK_ALIGNMENT, 0);
        assert_eq!(y % CHUNK_ALIGNMENT, 0);
        assert_ne!(x, y);
        assert_eq!(a.allocation_size(x), Some(16));
        assert_eq!(a.available(), a.size() - 32);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut a = ArenaAllocator::new(0, 1024);
        assert!(a.alloc(2048).is_none());
        let x = a.alloc(1000).unwrap();
        assert!(a.alloc(100).is_none());
        assert!(a.free(x));
        assert!(a.alloc(100).is_some());
    }

    #[test]
    fn free_unknown_offset() {
        let mut a = ArenaAllocator::new(0, 1024);
        assert!(!a.free(8));
    }

    #[test]
    fn freed_neighbours_are_merged() {
        let mut a = ArenaAllocator::new(0, 1024);
        let chunks: Vec<usize> = (0..4).map(|_| a.alloc(256).unwrap()).collect();
        assert!(a.alloc(8).is_none());
        for c in chunks.iter() {
            assert!(a.free(*c));
        }
        // Only a defragmented arena can serve the whole size again
        assert_eq!(a.available(), 1024);
        assert_eq!(a.alloc(1024), Some(0));
    }
}
