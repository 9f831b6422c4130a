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
//! The control-plane messages exchanged between clients and their server.
//!
//! A message is exactly [`MESSAGE_SIZE`] bytes:
//!
//! ```text
//!  7 6 5 4 3 2 1 0
//! +-+-+-+-+-+-+-+-+
//! |X|  client id  |  byte 0
//! +-+-+-+-+-+-+-+-+
//! | offset| code  |  byte 1
//! +-+-+-+-+-+-+-+-+
//! ~     name      ~  bytes 2..28, NUL padded
//! +---------------+
//! ~    footer     ~  bytes 28..32
//! +---------------+
//! ```
//!
//! The footer holds the little-endian size for the create operations, the
//! IPv4 octets for the remote operations and zeroes otherwise.
mod queue;

pub use queue::*;

use crate::defaults::{MAX_NAME_LEN, MAX_PORT_OFFSET, MESSAGE_SIZE};
use crate::sync::Scope;
use dsm_util::core::{DsmError, DsmErrorKind, DsmResult};
use dsm_util::{dsmerror, dsmerror2};
use std::convert::TryFrom;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

const NAME_START: usize = 2;
const FOOTER_START: usize = NAME_START + MAX_NAME_LEN;
const CLIENT_ID_MASK: u8 = 0x7f;
const CODE_MASK: u8 = 0x0f;
const OFFSET_SHIFT: u8 = 4;

/*************************************/
/*              NAMES                */
/*************************************/
/// A validated buffer name: 1 to [`MAX_NAME_LEN`] bytes, no NUL.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferName(String);

impl BufferName {
    pub fn new(name: &str) -> DsmResult<BufferName> {
        if name.is_empty() {
            let e = "empty name".to_string();
            return dsmerror!(DsmErrorKind::InvalidName { descr: e });
        }
        if name.len() > MAX_NAME_LEN {
            let e = format!("{} is longer than {} bytes", name, MAX_NAME_LEN);
            return dsmerror!(DsmErrorKind::InvalidName { descr: e });
        }
        if name.as_bytes().contains(&0) {
            let e = format!("{:?} contains a NUL byte", name);
            return dsmerror!(DsmErrorKind::InvalidName { descr: e });
        }
        Ok(BufferName(name.to_string()))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The NUL padded name field of a message.
    pub fn to_field(&self) -> [u8; MAX_NAME_LEN] {
        let mut field = [0u8; MAX_NAME_LEN];
        field[..self.0.len()].copy_from_slice(self.0.as_bytes());
        field
    }

    pub fn from_field(field: &[u8]) -> DsmResult<BufferName> {
        let field = &field[..field.len().min(MAX_NAME_LEN)];
        let len = field.iter().position(|b| *b == 0).unwrap_or(field.len());
        if field[len..].iter().any(|b| *b != 0) {
            let e = "garbage after the name padding".to_string();
            return dsmerror!(DsmErrorKind::InvalidName { descr: e });
        }
        let name = std::str::from_utf8(&field[..len]).map_err(|e| {
            dsmerror2!(DsmErrorKind::InvalidName {
                descr: e.to_string()
            })
        })?;
        BufferName::new(name)
    }
}

impl FromStr for BufferName {
    type Err = DsmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BufferName::new(s)
    }
}

impl fmt::Display for BufferName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validates a remote port offset.
pub fn port_offset(offset: u8) -> DsmResult<u8> {
    if offset > MAX_PORT_OFFSET {
        let e = format!("port offset {} exceeds {}", offset, MAX_PORT_OFFSET);
        return dsmerror!(DsmErrorKind::InvalidEndpoint { descr: e });
    }
    Ok(offset)
}

/// Parses a dotted-quad IPv4 address.
pub fn ipv4(addr: &str) -> DsmResult<Ipv4Addr> {
    addr.parse::<Ipv4Addr>().map_err(|e| {
        dsmerror2!(DsmErrorKind::InvalidEndpoint {
            descr: format!("{}: {}", addr, e)
        })
    })
}

/*************************************/
/*             MESSAGES              */
/*************************************/
pub mod code {
    pub const CREATE_LOCAL: u8 = 0x00;
    pub const CREATE_LOCALONLY: u8 = 0x01;
    pub const FETCH_REMOTE: u8 = 0x02;
    pub const DISCONNECT_LOCAL: u8 = 0x03;
    pub const DISCONNECT_REMOTE: u8 = 0x04;
    pub const DISCONNECT_CLIENT: u8 = 0x05;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    CreateLocal {
        name: BufferName,
        size: u16,
        local_only: bool,
    },
    FetchRemote {
        name: BufferName,
        addr: Ipv4Addr,
        port_offset: u8,
    },
    DisconnectLocal {
        name: BufferName,
    },
    DisconnectRemote {
        name: BufferName,
        addr: Ipv4Addr,
        port_offset: u8,
    },
    DisconnectClient,
}

impl Operation {
    pub fn code(&self) -> u8 {
        match self {
            Operation::CreateLocal {
                local_only: false, ..
            } => code::CREATE_LOCAL,
            Operation::CreateLocal {
                local_only: true, ..
            } => code::CREATE_LOCALONLY,
            Operation::FetchRemote { .. } => code::FETCH_REMOTE,
            Operation::DisconnectLocal { .. } => code::DISCONNECT_LOCAL,
            Operation::DisconnectRemote { .. } => code::DISCONNECT_REMOTE,
            Operation::DisconnectClient => code::DISCONNECT_CLIENT,
        }
    }

    /// The registry this operation changes.
    pub fn scope(&self) -> Scope {
        match self {
            Operation::FetchRemote { .. } | Operation::DisconnectRemote { .. } => Scope::Remote,
            _ => Scope::Local,
        }
    }

    pub fn name(&self) -> Option<&BufferName> {
        match self {
            Operation::CreateLocal { name, .. }
            | Operation::FetchRemote { name, .. }
            | Operation::DisconnectLocal { name }
            | Operation::DisconnectRemote { name, .. } => Some(name),
            Operation::DisconnectClient => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlMessage {
    pub client_id: u8,
    pub operation: Operation,
}

impl ControlMessage {
    pub fn new(client_id: u8, operation: Operation) -> ControlMessage {
        ControlMessage {
            client_id: client_id & CLIENT_ID_MASK,
            operation,
        }
    }

    pub fn encode(&self) -> [u8; MESSAGE_SIZE] {
        let mut buf = [0u8; MESSAGE_SIZE];
        buf[0] = self.client_id & CLIENT_ID_MASK;
        let mut header = self.operation.code();
        match &self.operation {
            Operation::CreateLocal { name, size, .. } => {
                buf[NAME_START..FOOTER_START].copy_from_slice(&name.to_field());
                buf[FOOTER_START..FOOTER_START + 2].copy_from_slice(&size.to_le_bytes());
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
            } => {
                header |= (port_offset & CODE_MASK) << OFFSET_SHIFT;
                buf[NAME_START..FOOTER_START].copy_from_slice(&name.to_field());
                buf[FOOTER_START..].copy_from_slice(&addr.octets());
            }
            Operation::DisconnectLocal { name } => {
                buf[NAME_START..FOOTER_START].copy_from_slice(&name.to_field());
            }
            Operation::DisconnectClient => {}
        }
        buf[1] = header;
        buf
    }

    pub fn decode(buf: &[u8]) -> DsmResult<ControlMessage> {
        if buf.len() != MESSAGE_SIZE {
            let e = format!("{} bytes instead of {}", buf.len(), MESSAGE_SIZE);
            return dsmerror!(DsmErrorKind::InvalidMessage { descr: e });
        }
        if buf[0] & !CLIENT_ID_MASK != 0 {
            let e = format!("reserved bit set in client id {:#04x}", buf[0]);
            return dsmerror!(DsmErrorKind::InvalidMessage { descr: e });
        }
        let client_id = buf[0];
        let code = buf[1] & CODE_MASK;
        let port_offset = buf[1] >> OFFSET_SHIFT;
        let name_field = &buf[NAME_START..FOOTER_START];
        let footer = &buf[FOOTER_START..];
        let addr = || Ipv4Addr::new(footer[0], footer[1], footer[2], footer[3]);

        let operation = match code {
            code::CREATE_LOCAL | code::CREATE_LOCALONLY => {
                let size = u16::from_le_bytes([footer[0], footer[1]]);
                if size == 0 {
                    let e = "zero sized buffer".to_string();
                    return dsmerror!(DsmErrorKind::InvalidMessage { descr: e });
                }
                Operation::CreateLocal {
                    name: BufferName::from_field(name_field)?,
                    size,
                    local_only: code == code::CREATE_LOCALONLY,
                }
            }
            code::FETCH_REMOTE => Operation::FetchRemote {
                name: BufferName::from_field(name_field)?,
                addr: addr(),
                port_offset,
            },
            code::DISCONNECT_LOCAL => Operation::DisconnectLocal {
                name: BufferName::from_field(name_field)?,
            },
            code::DISCONNECT_REMOTE => Operation::DisconnectRemote {
                name: BufferName::from_field(name_field)?,
                addr: addr(),
                port_offset,
            },
            code::DISCONNECT_CLIENT => Operation::DisconnectClient,
            unknown => {
                let e = format!("unknown option code {:#04x}", unknown);
                return dsmerror!(DsmErrorKind::InvalidMessage { descr: e });
            }
        };
        Ok(ControlMessage {
            client_id,
            operation,
        })
    }
}

impl TryFrom<&[u8]> for ControlMessage {
    type Error = DsmError;

    fn try_from(buf: &[u8]) -> Result<Self, Self::Error> {
        ControlMessage::decode(buf)
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.operation {
            Operation::CreateLocal {
                name,
                size,
                local_only,
            } => write!(
                f,
                "client {} CREATE_LOCAL{} {} ({} bytes)",
                self.client_id,
                if *local_only { "ONLY" } else { "" },
                name,
                size
            ),
            Operation::FetchRemote {
                name,
                addr,
                port_offset,
            } => write!(
                f,
                "client {} FETCH_REMOTE {} from {}+{}",
                self.client_id, name, addr, port_offset
            ),
            Operation::DisconnectLocal { name } => {
                write!(f, "client {} DISCONNECT_LOCAL {}", self.client_id, name)
            }
            Operation::DisconnectRemote {
                name,
                addr,
                port_offset,
            } => write!(
                f,
                "client {} DISCONNECT_REMOTE {} from {}+{}",
                self.client_id, name, addr, port_offset
            ),
            Operation::DisconnectClient => write!(f, "client {} DISCONNECT_CLIENT", self.client_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> BufferName {
        BufferName::new(s).unwrap()
    }

    #[test]
    fn name_validation() {
        assert!(BufferName::new("").is_err());
        assert!(BufferName::new("a\0b").is_err());
        assert!(BufferName::new(&"x".repeat(MAX_NAME_LEN)).is_ok());
        assert!(BufferName::new(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
        assert!("temp".parse::<BufferName>().is_ok());
    }

    #[test]
    fn create_local_layout() {
        let msg = ControlMessage::new(
            5,
            Operation::CreateLocal {
                name: name("temp"),
                size: 0x0104,
                local_only: true,
            },
        );
        let buf = msg.encode();
        assert_eq!(buf[0], 5);
        assert_eq!(buf[1], code::CREATE_LOCALONLY);
        assert_eq!(&buf[2..6], b"temp");
        assert!(buf[6..28].iter().all(|b| *b == 0));
        assert_eq!(&buf[28..], &[0x04, 0x01, 0, 0]);
        assert_eq!(ControlMessage::decode(&buf).unwrap(), msg);
    }

    #[test]
    fn remote_layout_packs_port_offset() {
        let msg = ControlMessage::new(
            0x7f,
            Operation::FetchRemote {
                name: name("sensor"),
                addr: Ipv4Addr::new(192, 168, 1, 20),
                port_offset: 9,
            },
        );
        let buf = msg.encode();
        assert_eq!(buf[1], 0x92);
        assert_eq!(&buf[28..], &[192, 168, 1, 20]);
        assert_eq!(ControlMessage::decode(&buf).unwrap(), msg);
    }

    #[test]
    fn client_id_is_seven_bits() {
        let msg = ControlMessage::new(0xff, Operation::DisconnectClient);
        assert_eq!(msg.client_id, 0x7f);
        let mut buf = msg.encode();
        assert_eq!(buf[0], 0x7f);
        buf[0] = 0x80;
        assert!(ControlMessage::decode(&buf).is_err());
    }

    #[test]
    fn malformed_messages_are_rejected() {
        let mut buf = [0u8; MESSAGE_SIZE];
        // Unknown code
        buf[1] = 0x0e;
        assert!(ControlMessage::decode(&buf).is_err());
        // Missing name
        buf[1] = code::DISCONNECT_LOCAL;
        assert!(ControlMessage::decode(&buf).is_err());
        // Zero size
        buf[1] = code::CREATE_LOCAL;
        buf[2] = b'a';
        assert!(ControlMessage::decode(&buf).is_err());
        // Wrong length
        assert!(ControlMessage::decode(&buf[..31]).is_err());
    }

    #[test]
    fn endpoint_validation() {
        assert!(port_offset(15).is_ok());
        assert!(port_offset(16).is_err());
        assert_eq!(ipv4("10.0.0.1").unwrap(), Ipv4Addr::new(10, 0, 0, 1));
        assert!(ipv4("10.0.0").is_err());
        assert!(ipv4("localhost").is_err());
    }
}
