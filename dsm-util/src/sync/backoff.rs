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
use std::time::Duration;

const SPIN_LIMIT: u32 = 6;
const YIELD_LIMIT: u32 = 10;
const SLEEP_TIME: Duration = Duration::from_micros(50);

/// Exponential backoff for spin-waiting on a word shared with other processes.
///
/// The first rounds busy-spin, then the thread yields, and past that it sleeps
/// for a short period on every round.
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    pub fn new() -> Backoff {
        Backoff::default()
    }

    pub fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..1 << self.step {
                std::hint::spin_loop();
            }
        } else if self.step <= YIELD_LIMIT {
            std::thread::yield_now();
        } else {
            std::thread::sleep(SLEEP_TIME);
        }
        if self.step <= YIELD_LIMIT {
            self.step += 1;
        }
    }
}
