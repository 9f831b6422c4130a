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
use crate::attachment::Attachment;
use crate::config::DsmConfig;
use crate::protocol::{ControlMessage, Operation};
use crate::registry::{
    BufferDefinition, BufferDescriptor, BufferKey, BufferMap, DefinitionPayload,
};
use crate::remote::{self, FetchReply, RemoteResponder};
use async_std::task;
use dsm_util::core::{DsmErrorKind, DsmResult};
use dsm_util::dsmerror;
use std::fmt::Write;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Created,
    WaitingForFirstClient,
    Running,
    ShuttingDown,
}

/// Stops a running server from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    attachment: Arc<Attachment>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.attachment.sync().wake_all();
    }
}

/// The owner of an arena.
///
/// Drains the control queue, materializes the pending definitions into the
/// registries and answers the fetch requests of remote servers. Dropping the
/// server destroys the arena.
pub struct DsmServer {
    config: DsmConfig,
    attachment: Arc<Attachment>,
    state: ServerState,
    stop: Arc<AtomicBool>,
    responder: Option<RemoteResponder>,
}

impl DsmServer {
    /// Creates the arena. Fails if it already exists.
    pub fn new(config: DsmConfig) -> DsmResult<DsmServer> {
        config.validate()?;
        let attachment = Arc::new(Attachment::create(&config)?);
        if !config.wait_for_client {
            attachment.sync().release();
        }
        log::info!(
            "Server {} created arena {} ({} bytes)",
            config.server_id,
            attachment.arena().name(),
            attachment.arena().size()
        );
        Ok(DsmServer {
            config,
            attachment,
            state: ServerState::Created,
            stop: Arc::new(AtomicBool::new(false)),
            responder: None,
        })
    }

    #[inline]
    pub fn config(&self) -> &DsmConfig {
        &self.config
    }

    #[inline]
    pub fn state(&self) -> ServerState {
        self.state
    }

    #[inline]
    pub fn arena_name(&self) -> &str {
        self.attachment.arena().name()
    }

    /// The address the fetch responder is bound to, once started.
    pub fn responder_address(&self) -> Option<SocketAddr> {
        self.responder.as_ref().map(|r| r.local_addr())
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: self.stop.clone(),
            attachment: self.attachment.clone(),
        }
    }

    /// Starts the fetch responder, then waits for a first client.
    ///
    /// Returns `false` if a shutdown was requested before any client showed up.
    pub fn start(&mut self) -> DsmResult<bool> {
        if self.state != ServerState::Created {
            return Ok(self.state == ServerState::Running);
        }
        if self.config.serve_remote {
            let responder =
                RemoteResponder::spawn(self.attachment.clone(), self.config.responder_address())?;
            self.responder = Some(responder);
        }

        self.state = ServerState::WaitingForFirstClient;
        log::debug!("Server {} waiting for a first client", self.config.server_id);
        if self
            .attachment
            .sync()
            .await_peer(self.config.poll_interval(), &self.stop)
        {
            self.state = ServerState::Running;
            log::info!("Server {} running", self.config.server_id);
            Ok(true)
        } else {
            self.shutdown();
            Ok(false)
        }
    }

    /// Serves until a shutdown is requested through a [`ShutdownHandle`].
    pub fn run(&mut self) -> DsmResult<()> {
        if !self.start()? {
            return Ok(());
        }
        let poll = self.config.poll_interval();
        while !self.stop.load(Ordering::Acquire) {
            let modified = self.attachment.sync().wait_modified(poll);
            if modified.any() || !self.attachment.queue().is_empty() {
                self.process_pending();
            }
        }
        self.shutdown();
        Ok(())
    }

    /// Stops the responder. The arena is destroyed when the server is dropped.
    pub fn shutdown(&mut self) {
        if self.state == ServerState::ShuttingDown {
            return;
        }
        self.state = ServerState::ShuttingDown;
        self.stop.store(true, Ordering::Release);
        if let Some(responder) = self.responder.take() {
            responder.stop();
        }
        log::info!("Server {} shutting down", self.config.server_id);
    }

    /// Drains the control queue and materializes every resulting definition.
    /// Returns the number of control messages consumed.
    pub fn process_pending(&self) -> usize {
        let mut processed = 0;
        while let Some(msg) = self.attachment.queue().try_receive() {
            processed += 1;
            match msg {
                Ok(msg) => {
                    log::debug!("Control message: {}", msg);
                    self.handle_message(msg);
                }
                Err(e) => log::warn!("Dropping control message: {}", e),
            }
        }
        self.materialize_pending();
        processed
    }

    fn handle_message(&self, msg: ControlMessage) {
        let client_id = msg.client_id;
        let creates = matches!(
            msg.operation,
            Operation::CreateLocal { .. } | Operation::FetchRemote { .. }
        );
        if creates && !self.attachment.clients().is_attached(client_id) {
            log::debug!("Dropping {}: client {} is gone", msg, client_id);
            return;
        }
        match msg.operation {
            Operation::CreateLocal {
                name,
                size,
                local_only,
            } => {
                if size > self.config.max_buffer_size {
                    log::warn!(
                        "Dropping {}: {} bytes exceed the maximum of {}",
                        name,
                        size,
                        self.config.max_buffer_size
                    );
                    return;
                }
                self.enqueue(BufferDefinition {
                    name,
                    token: self.attachment.clients().token(client_id),
                    client_id,
                    payload: DefinitionPayload::Local { size, local_only },
                });
            }
            Operation::FetchRemote {
                name,
                addr,
                port_offset,
            } => {
                let endpoint =
                    remote::fetch_endpoint(addr, self.config.request_base_port, port_offset);
                self.enqueue(BufferDefinition {
                    name,
                    token: self.attachment.clients().token(client_id),
                    client_id,
                    payload: DefinitionPayload::Remote { endpoint },
                });
            }
            Operation::DisconnectLocal { name } => {
                self.materialize_pending();
                self.erase(self.attachment.local_map(), &BufferKey::local(name));
            }
            Operation::DisconnectRemote {
                name,
                addr,
                port_offset,
            } => {
                self.materialize_pending();
                let endpoint =
                    remote::fetch_endpoint(addr, self.config.request_base_port, port_offset);
                self.erase(
                    self.attachment.remote_map(),
                    &BufferKey::remote(name, endpoint),
                );
            }
            Operation::DisconnectClient => {
                self.materialize_pending();
                let maps = [self.attachment.local_map(), self.attachment.remote_map()];
                for map in maps.iter() {
                    for (key, descriptor) in map.erase_owned_by(client_id) {
                        log::debug!("Erased {} of client {}", key, client_id);
                        self.release(&descriptor);
                    }
                }
            }
        }
    }

    fn enqueue(&self, def: BufferDefinition) {
        let pending = self.attachment.pending();
        let res = match pending.push(&def) {
            Err(_) => {
                // Make room and retry once
                self.materialize_pending();
                pending.push(&def)
            }
            res => res,
        };
        match res {
            Ok(true) => log::trace!("Pending: {}", def),
            Ok(false) => log::debug!("Duplicate definition skipped: {}", def),
            Err(e) => log::warn!("Dropping definition {}: {}", def, e),
        }
    }

    fn erase(&self, map: &BufferMap, key: &BufferKey) {
        match map.erase(key) {
            Some(descriptor) => {
                log::debug!("Erased {}", key);
                self.release(&descriptor);
            }
            None => log::debug!("Nothing to erase for {}", key),
        }
    }

    fn release(&self, descriptor: &BufferDescriptor) {
        if let Err(e) = self.attachment.arena().deallocate(descriptor.handle) {
            log::warn!("{}", e);
        }
    }

    /// Materializes every pending definition, oldest first. Returns how many
    /// changed a registry.
    pub fn materialize_pending(&self) -> usize {
        let mut materialized = 0;
        for def in self.attachment.pending().drain() {
            match self.materialize(&def) {
                Ok(true) => materialized += 1,
                Ok(false) => log::debug!("Duplicate registration skipped: {}", def),
                Err(e) => log::warn!("Dropping definition {}: {}", def, e),
            }
        }
        materialized
    }

    fn materialize(&self, def: &BufferDefinition) -> DsmResult<bool> {
        if let Some(token) = &self.config.token {
            if &def.token != token {
                let e = format!("client {} presented a wrong token", def.client_id);
                return dsmerror!(DsmErrorKind::Unauthorized { descr: e });
            }
        }
        match def.payload {
            DefinitionPayload::Local { size, local_only } => {
                self.materialize_local(def, size, local_only)
            }
            DefinitionPayload::Remote { endpoint } => self.materialize_remote(def, endpoint),
        }
    }

    fn materialize_local(
        &self,
        def: &BufferDefinition,
        size: u16,
        local_only: bool,
    ) -> DsmResult<bool> {
        let map = self.attachment.local_map();
        let key = def.key();
        if map.contains(&key) {
            return Ok(false);
        }
        let arena = self.attachment.arena();
        let descriptor = BufferDescriptor {
            handle: arena.allocate(size as usize)?,
            len: size,
            owner: def.client_id,
            local_only,
        };
        match map.insert(&key, descriptor) {
            Ok(true) => {
                log::debug!("Materialized {} at {}", def, descriptor.handle);
                Ok(true)
            }
            Ok(false) => {
                self.release(&descriptor);
                Ok(false)
            }
            Err(e) => {
                self.release(&descriptor);
                Err(e)
            }
        }
    }

    fn materialize_remote(&self, def: &BufferDefinition, endpoint: SocketAddrV4) -> DsmResult<bool> {
        let port_offset = endpoint
            .port()
            .wrapping_sub(self.config.request_base_port) as u8;
        let request = ControlMessage::new(
            def.client_id,
            Operation::FetchRemote {
                name: def.name.clone(),
                addr: *endpoint.ip(),
                port_offset,
            },
        );
        let data = match task::block_on(remote::fetch(
            &request,
            endpoint,
            self.config.fetch_timeout(),
        ))? {
            FetchReply::Found(data) => data,
            FetchReply::NotFound => {
                let e = format!("{} is not served by {}", def.name, endpoint);
                return dsmerror!(DsmErrorKind::NotFound { descr: e });
            }
        };
        if data.is_empty() || data.len() > self.config.max_buffer_size as usize {
            let e = format!("{} bytes fetched for {}", data.len(), def.name);
            return dsmerror!(DsmErrorKind::InvalidMessage { descr: e });
        }

        let map = self.attachment.remote_map();
        let arena = self.attachment.arena();
        let key = def.key();
        match map.lookup(&key) {
            // Refresh in place
            Some(current) if current.len as usize == data.len() => {
                map.with_contents_mut(arena, &key, |contents| contents.copy_from_slice(&data))?;
                log::debug!("Refreshed {}", key);
                Ok(true)
            }
            Some(current) => {
                let descriptor = self.store(&data, current.owner)?;
                match map.replace(&key, descriptor) {
                    Some(previous) => self.release(&previous),
                    None => self.release(&descriptor),
                }
                log::debug!("Refreshed {} ({} bytes)", key, data.len());
                Ok(true)
            }
            None => {
                let descriptor = self.store(&data, def.client_id)?;
                match map.insert(&key, descriptor) {
                    Ok(true) => {
                        log::debug!("Materialized {} at {}", def, descriptor.handle);
                        Ok(true)
                    }
                    Ok(false) => {
                        self.release(&descriptor);
                        Ok(false)
                    }
                    Err(e) => {
                        self.release(&descriptor);
                        Err(e)
                    }
                }
            }
        }
    }

    // Copies `data` into a new allocation, not yet visible to anybody.
    fn store(&self, data: &[u8], owner: u8) -> DsmResult<BufferDescriptor> {
        let arena = self.attachment.arena();
        let handle = arena.allocate(data.len())?;
        match arena.translate(handle, data.len()) {
            Ok(ptr) => unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), data.len())
            },
            Err(e) => {
                let _ = arena.deallocate(handle);
                return Err(e);
            }
        }
        Ok(BufferDescriptor {
            handle,
            len: data.len() as u16,
            owner,
            local_only: false,
        })
    }

    pub fn pending_definitions(&self) -> Vec<BufferDefinition> {
        self.attachment.pending().snapshot()
    }

    pub fn local_buffers(&self) -> Vec<(BufferKey, BufferDescriptor)> {
        self.attachment.local_map().entries()
    }

    pub fn remote_buffers(&self) -> Vec<(BufferKey, BufferDescriptor)> {
        self.attachment.remote_map().entries()
    }

    /// A human readable listing of the pending definitions and of both registries.
    pub fn dump(&self) -> String {
        let arena = self.attachment.arena();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Arena {} ({} bytes, {} available), state {:?}",
            arena.name(),
            arena.size(),
            arena.available().unwrap_or(0),
            self.state
        );

        let _ = writeln!(out, "Clients: {:?}", self.attachment.clients().attached());

        let pending = self.pending_definitions();
        let _ = writeln!(out, "Pending definitions: {}", pending.len());
        for def in pending.iter() {
            let _ = writeln!(out, "  {}", def);
        }

        let maps = [
            ("Local buffers", self.attachment.local_map()),
            ("Remote buffers", self.attachment.remote_map()),
        ];
        for (title, map) in maps.iter() {
            let entries = map.entries();
            let _ = writeln!(out, "{}: {}", title, entries.len());
            for (key, descriptor) in entries.iter() {
                let contents = map
                    .with_contents(arena, key, |data| hex::encode(data))
                    .unwrap_or_else(|_| "-".to_string());
                let _ = writeln!(
                    out,
                    "  {} [{} bytes at {}, client {}{}] {}",
                    key,
                    descriptor.len,
                    descriptor.handle,
                    descriptor.owner,
                    if descriptor.local_only { ", local only" } else { "" },
                    contents
                );
            }
        }
        out
    }
}

impl Drop for DsmServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
