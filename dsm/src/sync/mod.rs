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
//! Synchronization primitives that live inside the arena.
//!
//! Every type here is `#[repr(C)]`, holds only atomics and is valid when
//! all-zero, so it can be placed in shared memory and used concurrently by
//! every process that maps the arena.
mod block;
mod condition;
mod lock;

pub use block::*;
pub use condition::*;
pub use lock::*;
