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
use dsm_util::dsmconfigurable;

// Size in bytes of a control message on the queue
pub const MESSAGE_SIZE: usize = 32;
// Maximum number of in-flight control messages
pub const MAX_NUM_MESSAGES: usize = 10;
// Maximum length in bytes of a buffer name
pub const MAX_NAME_LEN: usize = 26;
// Highest server id and highest remote port offset (4 bits each)
pub const MAX_SERVER_ID: u8 = 15;
pub const MAX_PORT_OFFSET: u8 = 15;
// Client ids are 7 bits on the wire
pub const MAX_CLIENTS: usize = 128;
// Maximum length in bytes of a client token
pub const MAX_TOKEN_LEN: usize = 16;
// Number of entries of each buffer registry
pub const MAP_CAPACITY: usize = 64;
// Number of buffer definitions waiting to be materialized
pub const PENDING_CAPACITY: usize = 32;

dsmconfigurable! {
    // Size in bytes of the shared memory arena
    pub static ref ARENA_SIZE: usize = 65_536;
    // The arena of server N is named ARENA_PREFIX followed by N
    pub static ref ARENA_PREFIX: String = "server".to_string();
    // Maximum size in bytes of a single buffer
    // NOTE: the size travels as a 16 bit integer on the wire, and must fit
    //       several times in the arena.
    pub static ref MAX_BUFFER_SIZE: u16 = 4_096;
    // The fetch responder of server N listens on REQUEST_BASE_PORT + N
    pub static ref REQUEST_BASE_PORT: u16 = 24_000;
    // Timeout in milliseconds of a remote fetch
    pub static ref FETCH_TIMEOUT: u64 = 1_000;
    // Interval in milliseconds at which the server re-checks its shutdown flag
    pub static ref SERVER_POLL_INTERVAL: u64 = 100;
    // Time in milliseconds a dropping client waits for room on the queue
    pub static ref CLIENT_DROP_TIMEOUT: u64 = 1_000;
}
