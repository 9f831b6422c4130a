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
use super::FetchReply;
use crate::attachment::Attachment;
use crate::defaults::MESSAGE_SIZE;
use crate::protocol::{ControlMessage, Operation};
use crate::registry::BufferKey;
use async_std::channel::{bounded, Receiver, Sender};
use async_std::net::UdpSocket;
use async_std::prelude::*;
use async_std::task::{self, JoinHandle};
use dsm_util::core::{DsmErrorKind, DsmResult};
use dsm_util::{dsmerror, dsmerror2};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

// Time to wait before serving again after a socket error
const RESPONDER_THROTTLE_TIME: Duration = Duration::from_millis(10);

/// Answers the fetch requests of remote servers with the contents of the
/// local buffers that are not local-only.
pub struct RemoteResponder {
    local_addr: SocketAddr,
    signal: Sender<()>,
    handle: JoinHandle<()>,
}

impl RemoteResponder {
    pub fn spawn(attachment: Arc<Attachment>, addr: SocketAddrV4) -> DsmResult<RemoteResponder> {
        let socket = task::block_on(UdpSocket::bind(addr)).map_err(|e| {
            let e = format!("Can not create the fetch responder on {}: {}", addr, e);
            log::warn!("{}", e);
            dsmerror2!(DsmErrorKind::IoError { descr: e })
        })?;
        let local_addr = socket.local_addr().map_err(|e| {
            let e = format!("Can not create the fetch responder on {}: {}", addr, e);
            log::warn!("{}", e);
            dsmerror2!(DsmErrorKind::IoError { descr: e })
        })?;

        let (signal, receiver) = bounded::<()>(1);
        let handle = task::spawn(responder_task(socket, attachment, receiver));
        log::debug!("Fetch responder listening on {}", local_addr);
        Ok(RemoteResponder {
            local_addr,
            signal,
            handle,
        })
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the responder and waits for its task to terminate.
    pub fn stop(self) {
        let RemoteResponder {
            local_addr,
            signal,
            handle,
        } = self;
        task::block_on(async move {
            let _ = signal.send(()).await;
            handle.await;
        });
        log::debug!("Fetch responder on {} stopped", local_addr);
    }
}

/// The reply to the raw fetch request `request`.
pub fn answer(attachment: &Attachment, request: &[u8]) -> DsmResult<FetchReply> {
    let msg = ControlMessage::decode(request)?;
    let name = match msg.operation {
        Operation::FetchRemote { name, .. } => name,
        _ => {
            let e = format!("not a fetch request: {}", msg);
            return dsmerror!(DsmErrorKind::InvalidMessage { descr: e });
        }
    };
    let key = BufferKey::local(name);
    match attachment.local_map().lookup(&key) {
        Some(descriptor) if !descriptor.local_only => {
            match attachment
                .local_map()
                .with_contents(attachment.arena(), &key, |data| data.to_vec())
            {
                Ok(data) => Ok(FetchReply::Found(data)),
                // Erased in the meantime
                Err(_) => Ok(FetchReply::NotFound),
            }
        }
        _ => Ok(FetchReply::NotFound),
    }
}

async fn responder_task(socket: UdpSocket, attachment: Arc<Attachment>, stop: Receiver<()>) {
    let serve = async {
        let mut buf = [0u8; 2 * MESSAGE_SIZE];
        loop {
            let (n, from) = match socket.recv_from(&mut buf).await {
                Ok(res) => res,
                Err(e) => {
                    log::warn!("Fetch responder error: {}", e);
                    task::sleep(RESPONDER_THROTTLE_TIME).await;
                    continue;
                }
            };
            let reply = match answer(&attachment, &buf[..n]) {
                Ok(reply) => reply,
                Err(e) => {
                    log::warn!("Invalid fetch request from {}: {}", from, e);
                    continue;
                }
            };
            log::debug!("Answering fetch request from {}: {:?}", from, reply);
            if let Err(e) = socket.send_to(&reply.encode(), from).await {
                log::warn!("Can not answer {}: {}", from, e);
            }
        }
    };
    let stop = async {
        let _ = stop.recv().await;
    };
    serve.race(stop).await;
}
