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
use std::fmt;

pub type BoxedStdErr = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type DsmResult<T> = Result<T, DsmError>;

#[derive(Debug, Clone, PartialEq)]
pub enum DsmErrorKind {
    ArenaError { descr: String },
    ArenaExhausted { descr: String },
    RegistryFull { descr: String },
    InvalidName { descr: String },
    InvalidMessage { descr: String },
    InvalidEndpoint { descr: String },
    InvalidConfig { descr: String },
    NotFound { descr: String },
    IoError { descr: String },
    Timeout { descr: String },
    Unauthorized { descr: String },
}

impl fmt::Display for DsmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DsmErrorKind::ArenaError { descr } => write!(f, "Arena error: {}", descr),
            DsmErrorKind::ArenaExhausted { descr } => write!(f, "Arena exhausted: {}", descr),
            DsmErrorKind::RegistryFull { descr } => write!(f, "Registry full: {}", descr),
            DsmErrorKind::InvalidName { descr } => write!(f, "Invalid buffer name: {}", descr),
            DsmErrorKind::InvalidMessage { descr } => write!(f, "Invalid message: {}", descr),
            DsmErrorKind::InvalidEndpoint { descr } => write!(f, "Invalid endpoint: {}", descr),
            DsmErrorKind::InvalidConfig { descr } => write!(f, "Invalid configuration: {}", descr),
            DsmErrorKind::NotFound { descr } => write!(f, "Not found: {}", descr),
            DsmErrorKind::IoError { descr } => write!(f, "IO error: {}", descr),
            DsmErrorKind::Timeout { descr } => write!(f, "Timeout: {}", descr),
            DsmErrorKind::Unauthorized { descr } => write!(f, "Unauthorized: {}", descr),
        }
    }
}

#[derive(Debug)]
pub struct DsmError {
    kind: DsmErrorKind,
    file: &'static str,
    line: u32,
    source: Option<BoxedStdErr>,
}

impl DsmError {
    pub fn new(
        kind: DsmErrorKind,
        file: &'static str,
        line: u32,
        source: Option<BoxedStdErr>,
    ) -> DsmError {
        DsmError {
            kind,
            file,
            line,
            source,
        }
    }

    pub fn get_kind(&self) -> &DsmErrorKind {
        &self.kind
    }
}

impl std::error::Error for DsmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.source {
            Some(s) => Some(s.as_ref()),
            None => None,
        }
    }
}

impl fmt::Display for DsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}:{}.", self.kind, self.file, self.line)?;
        if let Some(s) = &self.source {
            write!(f, " - Caused by {}", *s)?;
        }
        Ok(())
    }
}
