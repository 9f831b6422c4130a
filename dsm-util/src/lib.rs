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
//! Internal utilities shared by the dsm crates.
//!
//! This crate is not meant to be used directly: it provides the error type,
//! a handful of macros and the cross-process wait primitives the shared
//! memory structures of `dsm` are built on.
pub use lazy_static::lazy_static;

pub mod core;
pub mod sync;
