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
use crate::defaults::*;
use dsm_util::core::{DsmErrorKind, DsmResult};
use dsm_util::{dsmerror, dsmerror2};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

/// The configuration shared by a server and the clients attached to it.
///
/// Missing fields take their compile-time defaults, so an empty JSON object
/// is a valid configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DsmConfig {
    /// Identity of the server, selects the arena name and the responder port.
    pub server_id: u8,
    pub arena_prefix: String,
    pub arena_size: usize,
    pub max_buffer_size: u16,
    pub request_base_port: u16,
    /// Address the fetch responder binds to.
    pub listen_address: Ipv4Addr,
    pub fetch_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// When set, the server blocks in `start` until a first client shows up.
    pub wait_for_client: bool,
    /// When set, the server answers fetch requests of remote hosts.
    pub serve_remote: bool,
    /// Server side: the token clients must present. Client side: the token presented.
    pub token: Option<String>,
}

impl Default for DsmConfig {
    fn default() -> DsmConfig {
        DsmConfig {
            server_id: 0,
            arena_prefix: ARENA_PREFIX.clone(),
            arena_size: *ARENA_SIZE,
            max_buffer_size: *MAX_BUFFER_SIZE,
            request_base_port: *REQUEST_BASE_PORT,
            listen_address: Ipv4Addr::UNSPECIFIED,
            fetch_timeout_ms: *FETCH_TIMEOUT,
            poll_interval_ms: *SERVER_POLL_INTERVAL,
            wait_for_client: true,
            serve_remote: true,
            token: None,
        }
    }
}

impl DsmConfig {
    pub fn from_json(json: &str) -> DsmResult<DsmConfig> {
        let config: DsmConfig = serde_json::from_str(json).map_err(|e| {
            dsmerror2!(DsmErrorKind::InvalidConfig {
                descr: e.to_string()
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> DsmResult<DsmConfig> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            dsmerror2!(DsmErrorKind::InvalidConfig {
                descr: format!("{}: {}", path.display(), e)
            })
        })?;
        DsmConfig::from_json(&json)
    }

    pub fn validate(&self) -> DsmResult<()> {
        if self.server_id > MAX_SERVER_ID {
            let e = format!("server id {} exceeds {}", self.server_id, MAX_SERVER_ID);
            return dsmerror!(DsmErrorKind::InvalidConfig { descr: e });
        }
        if self.arena_prefix.is_empty() {
            let e = "empty arena prefix".to_string();
            return dsmerror!(DsmErrorKind::InvalidConfig { descr: e });
        }
        if self.max_buffer_size == 0 || self.max_buffer_size as usize >= self.arena_size {
            let e = format!(
                "max buffer size {} does not fit an arena of {} bytes",
                self.max_buffer_size, self.arena_size
            );
            return dsmerror!(DsmErrorKind::InvalidConfig { descr: e });
        }
        if let Some(token) = &self.token {
            if token.len() > MAX_TOKEN_LEN {
                let e = format!("token longer than {} bytes", MAX_TOKEN_LEN);
                return dsmerror!(DsmErrorKind::InvalidConfig { descr: e });
            }
        }
        Ok(())
    }

    /// The name of the arena owned by server `server_id`.
    ///
    /// Out of range ids fall back to server 0.
    pub fn arena_name(&self) -> String {
        let id = if self.server_id > MAX_SERVER_ID {
            0
        } else {
            self.server_id
        };
        format!("{}{}", self.arena_prefix, id)
    }

    /// The port a remote server with the given offset answers fetches on.
    pub fn request_port(&self, port_offset: u8) -> u16 {
        self.request_base_port.wrapping_add(port_offset as u16)
    }

    /// The address the local fetch responder listens on.
    pub fn responder_address(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.listen_address, self.request_port(self.server_id))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_name_falls_back_to_server_zero() {
        let mut config = DsmConfig::default();
        config.server_id = 3;
        assert_eq!(config.arena_name(), "server3");
        config.server_id = 42;
        assert_eq!(config.arena_name(), "server0");
    }

    #[test]
    fn empty_json_yields_defaults() {
        let config = DsmConfig::from_json("{}").unwrap();
        assert_eq!(config, DsmConfig::default());
    }

    #[test]
    fn json_overrides_fields() {
        let json = r#"{ "server_id": 2, "request_base_port": 30000, "token": "secret" }"#;
        let config = DsmConfig::from_json(json).unwrap();
        assert_eq!(config.server_id, 2);
        assert_eq!(config.request_port(5), 30005);
        assert_eq!(config.responder_address().port(), 30002);
        assert_eq!(config.token.as_deref(), Some("secret"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(DsmConfig::from_json(r#"{ "server_id": 16 }"#).is_err());
        assert!(DsmConfig::from_json(r#"{ "token": "a token that is way too long" }"#).is_err());
        assert!(DsmConfig::from_json(r#"{ "arena_size": 1024, "max_buffer_size": 4096 }"#).is_err());
        assert!(DsmConfig::from_json("not json").is_err());
    }
}
