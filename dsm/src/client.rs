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
use crate::defaults::CLIENT_DROP_TIMEOUT;
use crate::protocol::{self, BufferName, ControlMessage, Operation};
use crate::registry::{BufferKey, BufferMap};
use crate::remote;
use dsm_util::core::DsmResult;
use dsm_util::dsmlock;
use std::collections::HashSet;
use std::net::SocketAddrV4;
use std::sync::Mutex;
use std::time::Duration;

/// A process attached to the arena of a server.
///
/// Registrations and disconnections are asynchronous: they are posted to the
/// server, which applies them the next time it drains its queue. Existence
/// checks and contents accesses go straight to the shared registries.
///
/// Control operations report failures as `false` or `None`, the cause being
/// logged at debug level.
pub struct DsmClient {
    client_id: u8,
    config: DsmConfig,
    attachment: Attachment,
    local_keys: Mutex<HashSet<BufferKey>>,
    remote_keys: Mutex<HashSet<BufferKey>>,
}

impl DsmClient {
    /// Attaches to the arena of server `config.server_id` and waits for the
    /// server to be ready.
    ///
    /// With `reset` set, every buffer left behind by a previous client with
    /// the same id is disconnected first.
    pub fn new(config: DsmConfig, client_id: u8, reset: bool) -> DsmResult<DsmClient> {
        let client_id = client_id & 0x7f;
        let attachment = Attachment::open(&config)?;
        attachment
            .clients()
            .attach(client_id, config.token.as_deref())?;
        let client = DsmClient {
            client_id,
            config,
            attachment,
            local_keys: Mutex::new(HashSet::new()),
            remote_keys: Mutex::new(HashSet::new()),
        };
        if reset {
            log::debug!("Client {} resetting its previous registrations", client_id);
            client.send(Operation::DisconnectClient);
        }
        client.attachment.sync().announce(None);
        log::debug!(
            "Client {} attached to {}",
            client_id,
            client.attachment.arena().name()
        );
        Ok(client)
    }

    #[inline]
    pub fn client_id(&self) -> u8 {
        self.client_id
    }

    #[inline]
    pub fn config(&self) -> &DsmConfig {
        &self.config
    }

    /// Number of control messages not yet consumed by the server.
    #[inline]
    pub fn pending_messages(&self) -> usize {
        self.attachment.queue().len()
    }

    fn send(&self, operation: Operation) {
        let scope = operation.scope();
        let msg = ControlMessage::new(self.client_id, operation);
        log::trace!("Sending {}", msg);
        self.attachment.queue().send(&msg);
        self.attachment.sync().mark_modified(scope);
    }

    fn endpoint(&self, ipaddr: &str, port_offset: u8) -> DsmResult<SocketAddrV4> {
        let addr = protocol::ipv4(ipaddr)?;
        let port_offset = protocol::port_offset(port_offset)?;
        Ok(remote::fetch_endpoint(
            addr,
            self.config.request_base_port,
            port_offset,
        ))
    }

    fn remote_key(&self, name: &str, ipaddr: &str, port_offset: u8) -> Option<BufferKey> {
        let key = || -> DsmResult<BufferKey> {
            let name = BufferName::new(name)?;
            let endpoint = self.endpoint(ipaddr, port_offset)?;
            Ok(BufferKey::remote(name, endpoint))
        };
        match key() {
            Ok(key) => Some(key),
            Err(e) => {
                log::debug!("{}", e);
                None
            }
        }
    }

    // The registry key a control operation refers to.
    fn operation_key(&self, operation: &Operation) -> Option<BufferKey> {
        match operation {
            Operation::CreateLocal { name, .. } | Operation::DisconnectLocal { name } => {
                Some(BufferKey::local(name.clone()))
            }
            Operation::FetchRemote {
                name,
                addr,
                port_offset,
            }
            | Operation::DisconnectRemote {
                name,
                addr,
                port_offset,
            } => Some(BufferKey::remote(
                name.clone(),
                remote::fetch_endpoint(*addr, self.config.request_base_port, *port_offset),
            )),
            Operation::DisconnectClient => None,
        }
    }

    /// Whether `key` is in `map`, or will be once the server has consumed
    /// what is already queued.
    fn is_requested(&self, map: &BufferMap, key: &BufferKey) -> bool {
        let mut requested = map.contains(key)
            || self
                .attachment
                .pending()
                .snapshot()
                .iter()
                .any(|def| def.key() == *key);
        for msg in self.attachment.queue().snapshot() {
            match &msg.operation {
                Operation::DisconnectClient => {
                    if msg.client_id == self.client_id {
                        requested = false;
                    }
                }
                op => {
                    if self.operation_key(op).as_ref() == Some(key) {
                        requested = matches!(
                            op,
                            Operation::CreateLocal { .. } | Operation::FetchRemote { .. }
                        );
                    }
                }
            }
        }
        requested
    }

    // Records `key` as registered by this client. Returns `false` if it already
    // was and the buffer exists or is on its way.
    fn remember(
        &self,
        known: &Mutex<HashSet<BufferKey>>,
        map: &BufferMap,
        key: &BufferKey,
    ) -> bool {
        if dsmlock!(known).insert(key.clone()) {
            return true;
        }
        if self.is_requested(map, key) {
            log::debug!("{} already registered by client {}", key, self.client_id);
            return false;
        }
        log::debug!("{} is gone, client {} registers it again", key, self.client_id);
        true
    }

    fn local_key(&self, name: &str) -> Option<BufferKey> {
        match BufferName::new(name) {
            Ok(name) => Some(BufferKey::local(name)),
            Err(e) => {
                log::debug!("{}", e);
                None
            }
        }
    }

    /*************************************/
    /*          LOCAL BUFFERS            */
    /*************************************/
    /// Asks the server for a buffer of `length` bytes named `name`.
    ///
    /// Returns `false` on an invalid name or length, or if this client already
    /// registered `name` and the buffer exists or is about to. A buffer that
    /// went away since, through a disconnection or a rejection by the server,
    /// is asked for again.
    pub fn register_local_buffer(&self, name: &str, length: usize, local_only: bool) -> bool {
        let name = match BufferName::new(name) {
            Ok(name) => name,
            Err(e) => {
                log::debug!("{}", e);
                return false;
            }
        };
        let max = self.attachment.arena().max_buffer_size() as usize;
        if length == 0 || length > max {
            log::debug!("Invalid length {} for {} (max {})", length, name, max);
            return false;
        }
        let key = BufferKey::local(name.clone());
        if !self.remember(&self.local_keys, self.attachment.local_map(), &key) {
            return false;
        }
        self.send(Operation::CreateLocal {
            name,
            size: length as u16,
            local_only,
        });
        true
    }

    pub fn disconnect_from_local_buffer(&self, name: &str) -> bool {
        let name = match BufferName::new(name) {
            Ok(name) => name,
            Err(e) => {
                log::debug!("{}", e);
                return false;
            }
        };
        dsmlock!(self.local_keys).remove(&BufferKey::local(name.clone()));
        self.send(Operation::DisconnectLocal { name });
        true
    }

    pub fn does_local_exist(&self, name: &str) -> bool {
        self.local_key(name)
            .map_or(false, |key| self.attachment.local_map().contains(&key))
    }

    /// Declared length of the local buffer `name`.
    pub fn local_buffer_len(&self, name: &str) -> Option<usize> {
        let key = self.local_key(name)?;
        self.attachment
            .local_map()
            .lookup(&key)
            .map(|d| d.len as usize)
    }

    /// A copy of the whole contents of the local buffer `name`.
    pub fn get_local_buffer_contents(&self, name: &str) -> Option<Vec<u8>> {
        let key = self.local_key(name)?;
        self.get_contents(self.attachment.local_map(), &key)
    }

    /// The contents of the local buffer `name` as a string, invalid UTF-8
    /// sequences being replaced.
    pub fn get_local_buffer_string(&self, name: &str) -> Option<String> {
        self.get_local_buffer_contents(name)
            .map(|data| String::from_utf8_lossy(&data).into_owned())
    }

    /// Copies the whole contents of the local buffer `name` into `dst`.
    ///
    /// Fails if `dst` is shorter than the buffer.
    pub fn read_local_buffer(&self, name: &str, dst: &mut [u8]) -> bool {
        self.local_key(name)
            .map_or(false, |key| self.read(self.attachment.local_map(), &key, dst))
    }

    /// Writes `data` at the beginning of the local buffer `name`.
    ///
    /// `data` is truncated to the buffer length, a shorter `data` is padded
    /// with zeroes.
    pub fn set_local_buffer_contents(&self, name: &str, data: &[u8]) -> bool {
        self.local_key(name)
            .map_or(false, |key| self.write(self.attachment.local_map(), &key, data))
    }

    /*************************************/
    /*          REMOTE BUFFERS           */
    /*************************************/
    /// Asks the server for a local copy of the buffer `name` served by the
    /// remote server at `ipaddr`, port offset `port_offset`.
    pub fn register_remote_buffer(&self, name: &str, ipaddr: &str, port_offset: u8) -> bool {
        let key = match self.remote_key(name, ipaddr, port_offset) {
            Some(key) => key,
            None => return false,
        };
        if !self.remember(&self.remote_keys, self.attachment.remote_map(), &key) {
            return false;
        }
        self.send_remote(key, port_offset, true)
    }

    /// Asks the server to fetch the remote buffer again, replacing the local copy.
    pub fn refetch_remote_buffer(&self, name: &str, ipaddr: &str, port_offset: u8) -> bool {
        match self.remote_key(name, ipaddr, port_offset) {
            Some(key) => {
                dsmlock!(self.remote_keys).insert(key.clone());
                self.send_remote(key, port_offset, true)
            }
            None => false,
        }
    }

    pub fn disconnect_from_remote_buffer(&self, name: &str, ipaddr: &str, port_offset: u8) -> bool {
        match self.remote_key(name, ipaddr, port_offset) {
            Some(key) => {
                dsmlock!(self.remote_keys).remove(&key);
                self.send_remote(key, port_offset, false)
            }
            None => false,
        }
    }

    fn send_remote(&self, key: BufferKey, port_offset: u8, fetch: bool) -> bool {
        let addr = match key.endpoint {
            Some(endpoint) => *endpoint.ip(),
            None => return false,
        };
        let name = key.name;
        let operation = if fetch {
            Operation::FetchRemote {
                name,
                addr,
                port_offset,
            }
        } else {
            Operation::DisconnectRemote {
                name,
                addr,
                port_offset,
            }
        };
        self.send(operation);
        true
    }

    pub fn does_remote_exist(&self, name: &str, ipaddr: &str, port_offset: u8) -> bool {
        self.remote_key(name, ipaddr, port_offset)
            .map_or(false, |key| self.attachment.remote_map().contains(&key))
    }

    pub fn remote_buffer_len(&self, name: &str, ipaddr: &str, port_offset: u8) -> Option<usize> {
        let key = self.remote_key(name, ipaddr, port_offset)?;
        self.attachment
            .remote_map()
            .lookup(&key)
            .map(|d| d.len as usize)
    }

    pub fn get_remote_buffer_contents(
        &self,
        name: &str,
        ipaddr: &str,
        port_offset: u8,
    ) -> Option<Vec<u8>> {
        let key = self.remote_key(name, ipaddr, port_offset)?;
        self.get_contents(self.attachment.remote_map(), &key)
    }

    pub fn get_remote_buffer_string(
        &self,
        name: &str,
        ipaddr: &str,
        port_offset: u8,
    ) -> Option<String> {
        self.get_remote_buffer_contents(name, ipaddr, port_offset)
            .map(|data| String::from_utf8_lossy(&data).into_owned())
    }

    pub fn read_remote_buffer(
        &self,
        name: &str,
        ipaddr: &str,
        port_offset: u8,
        dst: &mut [u8],
    ) -> bool {
        self.remote_key(name, ipaddr, port_offset)
            .map_or(false, |key| self.read(self.attachment.remote_map(), &key, dst))
    }

    /// Writes into the local copy of a remote buffer. The remote original is
    /// left untouched.
    pub fn set_remote_buffer_contents(
        &self,
        name: &str,
        ipaddr: &str,
        port_offset: u8,
        data: &[u8],
    ) -> bool {
        self.remote_key(name, ipaddr, port_offset)
            .map_or(false, |key| self.write(self.attachment.remote_map(), &key, data))
    }

    /*************************************/
    /*            CONTENTS               */
    /*************************************/
    fn get_contents(&self, map: &BufferMap, key: &BufferKey) -> Option<Vec<u8>> {
        match map.with_contents(self.attachment.arena(), key, |data| data.to_vec()) {
            Ok(data) => Some(data),
            Err(e) => {
                log::debug!("{}", e);
                None
            }
        }
    }

    fn read(&self, map: &BufferMap, key: &BufferKey, dst: &mut [u8]) -> bool {
        let res = map.with_contents(self.attachment.arena(), key, |data| {
            if dst.len() < data.len() {
                log::debug!(
                    "{} bytes can not hold the {} bytes of {}",
                    dst.len(),
                    data.len(),
                    key
                );
                return false;
            }
            dst[..data.len()].copy_from_slice(data);
            true
        });
        match res {
            Ok(done) => done,
            Err(e) => {
                log::debug!("{}", e);
                false
            }
        }
    }

    fn write(&self, map: &BufferMap, key: &BufferKey, data: &[u8]) -> bool {
        let res = map.with_contents_mut(self.attachment.arena(), key, |contents| {
            let len = data.len().min(contents.len());
            contents[..len].copy_from_slice(&data[..len]);
            for b in contents[len..].iter_mut() {
                *b = 0;
            }
        });
        match res {
            Ok(()) => true,
            Err(e) => {
                log::debug!("{}", e);
                false
            }
        }
    }
}

impl Drop for DsmClient {
    fn drop(&mut self) {
        self.attachment.clients().detach(self.client_id);
        let msg = ControlMessage::new(self.client_id, Operation::DisconnectClient);
        let timeout = Duration::from_millis(*CLIENT_DROP_TIMEOUT);
        match self.attachment.queue().send_timeout(&msg, timeout) {
            Ok(()) => self.attachment.sync().mark_modified(msg.operation.scope()),
            Err(e) => log::warn!("Client {} could not say goodbye: {}", self.client_id, e),
        }
    }
}
