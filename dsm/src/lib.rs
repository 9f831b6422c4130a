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

//! Distributed shared memory.
//!
//! A [`DsmServer`] owns a shared memory arena holding named buffers. Any
//! number of [`DsmClient`]s attach to the arena: they ask the server to create
//! or drop buffers through a bounded control queue, and read or write the
//! buffer contents directly in shared memory, under a per-buffer
//! reader/writer lock.
//!
//! A client can also bind a buffer hosted by another server, possibly on
//! another host: the server fetches it over UDP and keeps a local copy.
//!
//! # Example
//! ```no_run
//! use dsm::{DsmClient, DsmConfig, DsmServer};
//!
//! let mut config = DsmConfig::default();
//! config.wait_for_client = false;
//! let server = DsmServer::new(config.clone()).unwrap();
//!
//! let client = DsmClient::new(config, 1, true).unwrap();
//! client.register_local_buffer("temp", 4, false);
//! server.process_pending();
//! client.set_local_buffer_contents("temp", &[1, 2, 3, 4]);
//! assert_eq!(client.get_local_buffer_contents("temp"), Some(vec![1, 2, 3, 4]));
//! ```
pub mod arena;
mod attachment;
mod client;
mod config;
pub mod defaults;
pub mod protocol;
pub mod registry;
pub mod remote;
mod server;
pub mod sync;

pub use attachment::Attachment;
pub use client::DsmClient;
pub use config::DsmConfig;
pub use server::{DsmServer, ServerState, ShutdownHandle};

pub use dsm_util::core::{DsmError, DsmErrorKind, DsmResult};
