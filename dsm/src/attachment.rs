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
use crate::arena::Arena;
use crate::config::DsmConfig;
use crate::protocol::MessageQueue;
use crate::registry::{BufferMap, ClientTable, PendingQueue};
use crate::sync::SyncBlock;
use dsm_util::core::DsmResult;
use std::ptr::NonNull;

const SYNC_BLOCK: &str = "SyncBlock";
const CONTROL_QUEUE: &str = "ControlQueue";
const PENDING_QUEUE: &str = "PendingQueue";
const LOCAL_BUFFERS: &str = "LocalBuffers";
const REMOTE_BUFFERS: &str = "RemoteBuffers";
const CLIENTS: &str = "Clients";

/// A process' view of an arena and of the shared structures inside it.
pub struct Attachment {
    arena: Arena,
    sync: NonNull<SyncBlock>,
    queue: NonNull<MessageQueue>,
    pending: NonNull<PendingQueue>,
    local_map: NonNull<BufferMap>,
    remote_map: NonNull<BufferMap>,
    clients: NonNull<ClientTable>,
}

// The pointers target the mapping owned by `arena`, which lives as long as
// self. The structures themselves are Sync.
unsafe impl Send for Attachment {}
unsafe impl Sync for Attachment {}

impl Attachment {
    /// Creates the arena of `config` and builds every shared structure in it.
    pub fn create(config: &DsmConfig) -> DsmResult<Attachment> {
        let arena = Arena::create(
            &config.arena_name(),
            config.arena_size,
            config.max_buffer_size,
        )?;
        let sync = NonNull::from(arena.construct::<SyncBlock>(SYNC_BLOCK)?);
        let queue = NonNull::from(arena.construct::<MessageQueue>(CONTROL_QUEUE)?);
        let pending = NonNull::from(arena.construct::<PendingQueue>(PENDING_QUEUE)?);
        let local_map = NonNull::from(arena.construct::<BufferMap>(LOCAL_BUFFERS)?);
        let remote_map = NonNull::from(arena.construct::<BufferMap>(REMOTE_BUFFERS)?);
        let clients = NonNull::from(arena.construct::<ClientTable>(CLIENTS)?);
        log::trace!("Shared structures built: {:?}", arena);
        Ok(Attachment {
            arena,
            sync,
            queue,
            pending,
            local_map,
            remote_map,
            clients,
        })
    }

    /// Opens the arena of `config` and locates every shared structure in it.
    pub fn open(config: &DsmConfig) -> DsmResult<Attachment> {
        let arena = Arena::open(&config.arena_name())?;
        let sync = NonNull::from(arena.find::<SyncBlock>(SYNC_BLOCK)?);
        let queue = NonNull::from(arena.find::<MessageQueue>(CONTROL_QUEUE)?);
        let pending = NonNull::from(arena.find::<PendingQueue>(PENDING_QUEUE)?);
        let local_map = NonNull::from(arena.find::<BufferMap>(LOCAL_BUFFERS)?);
        let remote_map = NonNull::from(arena.find::<BufferMap>(REMOTE_BUFFERS)?);
        let clients = NonNull::from(arena.find::<ClientTable>(CLIENTS)?);
        Ok(Attachment {
            arena,
            sync,
            queue,
            pending,
            local_map,
            remote_map,
            clients,
        })
    }

    #[inline]
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    #[inline]
    pub fn sync(&self) -> &SyncBlock {
        unsafe { self.sync.as_ref() }
    }

    #[inline]
    pub fn queue(&self) -> &MessageQueue {
        unsafe { self.queue.as_ref() }
    }

    #[inline]
    pub fn pending(&self) -> &PendingQueue {
        unsafe { self.pending.as_ref() }
    }

    #[inline]
    pub fn local_map(&self) -> &BufferMap {
        unsafe { self.local_map.as_ref() }
    }

    #[inline]
    pub fn remote_map(&self) -> &BufferMap {
        unsafe { self.remote_map.as_ref() }
    }

    #[inline]
    pub fn clients(&self) -> &ClientTable {
        unsafe { self.clients.as_ref() }
    }
}
