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
//! Fetching buffers hosted by other servers.
//!
//! Every server answers on UDP port `request_base_port + server_id`. A request
//! is a FETCH_REMOTE control message. The reply is a status byte followed,
//! when the buffer was found, by its little-endian 16-bit length and its
//! contents:
//!
//! ```text
//! +--------+--------+--------+~~~~~~~~~~~~~+
//! | status |  len (LE u16)   |  contents   |
//! +--------+--------+--------+~~~~~~~~~~~~~+
//! ```
mod responder;

pub use responder::*;

use crate::protocol::ControlMessage;
use async_std::net::UdpSocket;
use async_std::prelude::*;
use dsm_util::core::{DsmErrorKind, DsmResult};
use dsm_util::{dsmerror, dsmerror2};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

pub const REPLY_FOUND: u8 = 0x00;
pub const REPLY_NOT_FOUND: u8 = 0x01;
const REPLY_HEADER_LEN: usize = 3;
const REPLY_MAX_LEN: usize = REPLY_HEADER_LEN + u16::MAX as usize;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchReply {
    Found(Vec<u8>),
    NotFound,
}

impl FetchReply {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            FetchReply::Found(data) => {
                let len = data.len().min(u16::MAX as usize);
                let mut buf = Vec::with_capacity(REPLY_HEADER_LEN + len);
                buf.push(REPLY_FOUND);
                buf.extend_from_slice(&(len as u16).to_le_bytes());
                buf.extend_from_slice(&data[..len]);
                buf
            }
            FetchReply::NotFound => vec![REPLY_NOT_FOUND],
        }
    }

    pub fn decode(buf: &[u8]) -> DsmResult<FetchReply> {
        match buf.first() {
            Some(&REPLY_NOT_FOUND) => Ok(FetchReply::NotFound),
            Some(&REPLY_FOUND) if buf.len() >= REPLY_HEADER_LEN => {
                let len = u16::from_le_bytes([buf[1], buf[2]]) as usize;
                let data = &buf[REPLY_HEADER_LEN..];
                if data.len() != len {
                    let e = format!("reply announces {} bytes but carries {}", len, data.len());
                    return dsmerror!(DsmErrorKind::InvalidMessage { descr: e });
                }
                Ok(FetchReply::Found(data.to_vec()))
            }
            _ => {
                let e = format!("malformed fetch reply of {} bytes", buf.len());
                dsmerror!(DsmErrorKind::InvalidMessage { descr: e })
            }
        }
    }
}

/// The address a server answers fetches on, given the base port.
#[inline]
pub fn fetch_endpoint(addr: Ipv4Addr, request_base_port: u16, port_offset: u8) -> SocketAddrV4 {
    SocketAddrV4::new(addr, request_base_port.wrapping_add(port_offset as u16))
}

async fn exchange(
    socket: &UdpSocket,
    request: &[u8],
    endpoint: SocketAddrV4,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    socket.send_to(request, endpoint).await?;
    loop {
        let (n, from) = socket.recv_from(buf).await?;
        if from.port() == endpoint.port() {
            return Ok(n);
        }
        log::debug!("Ignoring datagram from {} while fetching from {}", from, endpoint);
    }
}

/// Sends `request` to the server answering on `endpoint` and waits at most
/// `timeout` for its reply.
pub async fn fetch(
    request: &ControlMessage,
    endpoint: SocketAddrV4,
    timeout: Duration,
) -> DsmResult<FetchReply> {
    let local: SocketAddr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
    let socket = UdpSocket::bind(local).await.map_err(|e| {
        let e = format!("Can not bind a UDP socket to fetch from {}: {}", endpoint, e);
        log::warn!("{}", e);
        dsmerror2!(DsmErrorKind::IoError { descr: e })
    })?;

    log::debug!("Fetching {} from {}", request, endpoint);
    let mut buf = vec![0u8; REPLY_MAX_LEN];
    let n = match exchange(&socket, &request.encode(), endpoint, &mut buf)
        .timeout(timeout)
        .await
    {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            let e = format!("Fetch from {} failed: {}", endpoint, e);
            return dsmerror!(DsmErrorKind::IoError { descr: e });
        }
        Err(_) => {
            let e = format!("no reply from {} after {:?}", endpoint, timeout);
            return dsmerror!(DsmErrorKind::Timeout { descr: e });
        }
    };
    let reply = FetchReply::decode(&buf[..n])?;
    log::debug!(
        "Fetch reply from {}: {}",
        endpoint,
        match &reply {
            FetchReply::Found(data) => format!("{} bytes", data.len()),
            FetchReply::NotFound => "not found".to_string(),
        }
    );
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_layout() {
        let found = FetchReply::Found(vec![9, 8, 7]);
        assert_eq!(found.encode(), vec![REPLY_FOUND, 3, 0, 9, 8, 7]);
        assert_eq!(FetchReply::decode(&found.encode()).unwrap(), found);
        assert_eq!(FetchReply::NotFound.encode(), vec![REPLY_NOT_FOUND]);
        assert_eq!(
            FetchReply::decode(&[REPLY_NOT_FOUND]).unwrap(),
            FetchReply::NotFound
        );
    }

    #[test]
    fn malformed_replies() {
        assert!(FetchReply::decode(&[]).is_err());
        assert!(FetchReply::decode(&[0x07]).is_err());
        assert!(FetchReply::decode(&[REPLY_FOUND, 4, 0, 1]).is_err());
    }

    #[test]
    fn endpoint_derivation() {
        let ip = Ipv4Addr::new(10, 0, 0, 7);
        assert_eq!(
            fetch_endpoint(ip, 24_000, 15),
            "10.0.0.7:24015".parse::<SocketAddrV4>().unwrap()
        );
    }
}
