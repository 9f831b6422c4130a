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
use crate::arena::ArenaObject;
use crate::defaults::{MAX_CLIENTS, MAX_TOKEN_LEN};
use crate::sync::RawShmMutex;
use dsm_util::core::{DsmErrorKind, DsmResult};
use dsm_util::dsmerror;
use std::cell::UnsafeCell;

#[repr(C)]
#[derive(Clone, Copy)]
struct ClientRecord {
    attached: u8,
    token_len: u8,
    token: [u8; MAX_TOKEN_LEN],
}

/// One record per client id: whether it is attached and the token it presents.
#[repr(C)]
pub struct ClientTable {
    lock: RawShmMutex,
    records: UnsafeCell<[ClientRecord; MAX_CLIENTS]>,
}

unsafe impl Sync for ClientTable {}
unsafe impl Send for ClientTable {}
unsafe impl ArenaObject for ClientTable {}

impl ClientTable {
    fn record(client_id: u8) -> usize {
        client_id as usize % MAX_CLIENTS
    }

    pub fn attach(&self, client_id: u8, token: Option<&str>) -> DsmResult<()> {
        let token = token.unwrap_or("").as_bytes();
        if token.len() > MAX_TOKEN_LEN {
            let e = format!("token longer than {} bytes", MAX_TOKEN_LEN);
            return dsmerror!(DsmErrorKind::InvalidConfig { descr: e });
        }
        let mut field = [0u8; MAX_TOKEN_LEN];
        field[..token.len()].copy_from_slice(token);

        let _guard = self.lock.guard();
        let records = unsafe { &mut *self.records.get() };
        records[Self::record(client_id)] = ClientRecord {
            attached: 1,
            token_len: token.len() as u8,
            token: field,
        };
        Ok(())
    }

    pub fn detach(&self, client_id: u8) {
        let _guard = self.lock.guard();
        let records = unsafe { &mut *self.records.get() };
        records[Self::record(client_id)] = ClientRecord {
            attached: 0,
            token_len: 0,
            token: [0; MAX_TOKEN_LEN],
        };
    }

    pub fn is_attached(&self, client_id: u8) -> bool {
        let _guard = self.lock.guard();
        let records = unsafe { &*self.records.get() };
        records[Self::record(client_id)].attached != 0
    }

    /// The token presented by `client_id`, empty if none.
    pub fn token(&self, client_id: u8) -> String {
        let _guard = self.lock.guard();
        let records = unsafe { &*self.records.get() };
        let r = &records[Self::record(client_id)];
        String::from_utf8_lossy(&r.token[..r.token_len as usize]).into_owned()
    }

    /// Ids of the attached clients.
    pub fn attached(&self) -> Vec<u8> {
        let _guard = self.lock.guard();
        let records = unsafe { &*self.records.get() };
        records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.attached != 0)
            .map(|(id, _)| id as u8)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_and_detach() {
        let table: ClientTable = unsafe { std::mem::zeroed() };
        assert!(table.attached().is_empty());
        table.attach(3, Some("secret")).unwrap();
        table.attach(7, None).unwrap();
        assert!(table.is_attached(3));
        assert_eq!(table.token(3), "secret");
        assert_eq!(table.token(7), "");
        assert_eq!(table.attached(), vec![3, 7]);
        table.detach(3);
        assert!(!table.is_attached(3));
        assert_eq!(table.token(3), "");
        assert!(table.attach(1, Some("a token way too long")).is_err());
    }
}
