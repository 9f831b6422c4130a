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

// This macro performs a standard lock on Mutex<T>
// For performance reasons, it first performs a try_lock() and,
// if it fails, it falls back on lock(). A poisoned lock is recovered
// since the guarded state is plain bookkeeping.
#[macro_export]
macro_rules! dsmlock {
    ($var:expr) => {
        match $var.try_lock() {
            Ok(guard) => guard,
            Err(_) => $var
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        }
    };
}

// This macro allows to define some compile time configurable static constants
#[macro_export]
macro_rules! dsmconfigurable {
    ($(#[$attr:meta])* static ref $N:ident : $T:ty = $e:expr; $($t:tt)*) => {
        $crate::lazy_static!($(#[$attr])* static ref $N : $T = match option_env!(stringify!($N)) {
            Some(value) => value.parse().unwrap_or_else(|_| $e),
            None => $e,
        };);
        $crate::dsmconfigurable!($($t)*);
    };
    ($(#[$attr:meta])* pub static ref $N:ident : $T:ty = $e:expr; $($t:tt)*) => {
        $crate::lazy_static!($(#[$attr])* pub static ref $N : $T = match option_env!(stringify!($N)) {
            Some(value) => value.parse().unwrap_or_else(|_| $e),
            None => $e,
        };);
        $crate::dsmconfigurable!($($t)*);
    };
    () => ()
}

// This macro is a shorthand for the creation of a DsmError wrapped in Err
#[macro_export]
macro_rules! dsmerror {
    ($kind:expr) => {
        Err($crate::core::DsmError::new($kind, file!(), line!(), None))
    };
    ($kind:expr, $source:expr) => {
        Err($crate::core::DsmError::new(
            $kind,
            file!(),
            line!(),
            Some(Box::new($source)),
        ))
    };
}

// This macro is a shorthand for the creation of a bare DsmError
#[macro_export]
macro_rules! dsmerror2 {
    ($kind:expr) => {
        $crate::core::DsmError::new($kind, file!(), line!(), None)
    };
    ($kind:expr, $source:expr) => {
        $crate::core::DsmError::new($kind, file!(), line!(), Some(Box::new($source)))
    };
}
