// This file is part of mpmd, a daemon which manages the peripherals of USRP-class embedded devices together with their device-tree overlays and firmware.
//
// Copyright 2025 Canonical Ltd.
//
// SPDX-License-Identifier: GPL-3.0-only
//
// mpmd is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License version 3, as published by the Free Software Foundation.
//
// mpmd is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranties of MERCHANTABILITY, SATISFACTORY QUALITY, or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with this program.  If not, see http://www.gnu.org/licenses/.

//! The discovery responder.
//!
//! A single UDP socket answering two fixed probes: the discovery magic gets a
//! comma-separated `key=value` descriptor of this device, an echo-prefixed
//! payload is reflected back verbatim (a diagnostic aid for path-MTU and
//! packet-loss debugging). Anything else is dropped. The responder never
//! changes state, and network errors never propagate out of its task.

use crate::config::{DISCOVERY_MAGIC, ECHO_MAGIC, ECHO_MAX_PAYLOAD};
use crate::error::MpmError;
use crate::state::SharedState;
use log::{debug, info};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Notify;

/// Build the probe reply from the static device info plus live claim status.
///
/// `product` and `serial` lead the list so even a truncating parser finds
/// them; `claimed` reflects the shared state at probe time.
fn build_reply(device_info: &BTreeMap<String, String>, claimed: bool) -> String {
    let mut pairs: Vec<String> = Vec::with_capacity(device_info.len() + 1);
    for key in ["product", "serial"] {
        if let Some(value) = device_info.get(key) {
            pairs.push(format!("{key}={value}"));
        }
    }
    for (key, value) in device_info {
        if key == "product" || key == "serial" {
            continue;
        }
        pairs.push(format!("{key}={value}"));
    }
    pairs.push(format!("claimed={claimed}"));
    pairs.join(",")
}

pub struct DiscoveryServer {
    socket: UdpSocket,
    device_info: BTreeMap<String, String>,
    state: Arc<SharedState>,
}

impl DiscoveryServer {
    pub async fn bind(
        addr: &str,
        device_info: BTreeMap<String, String>,
        state: Arc<SharedState>,
    ) -> Result<DiscoveryServer, MpmError> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            MpmError::Internal(format!("Could not bind discovery socket {addr}: {e}"))
        })?;
        info!(
            "Discovery responder listening on {}",
            socket.local_addr().unwrap()
        );
        Ok(DiscoveryServer {
            socket,
            device_info,
            state,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr().expect("socket has no address")
    }

    pub async fn run(self, shutdown: Arc<Notify>) {
        // One extra byte so an oversized datagram is distinguishable from a
        // maximal one.
        let mut buf = vec![0u8; ECHO_MAGIC.len() + ECHO_MAX_PAYLOAD + 1];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, peer)) => self.handle_datagram(&buf[..len], peer).await,
                        Err(e) => debug!("discovery recv failed: {e}"),
                    }
                }
                _ = shutdown.notified() => {
                    info!("Discovery responder shutting down");
                    break;
                }
            }
        }
    }

    async fn handle_datagram(&self, payload: &[u8], peer: SocketAddr) {
        if payload.len() > ECHO_MAGIC.len() + ECHO_MAX_PAYLOAD {
            debug!("discarding oversized datagram ({} bytes) from {peer}", payload.len());
            return;
        }
        if payload == DISCOVERY_MAGIC {
            let reply = build_reply(&self.device_info, self.state.claim_status());
            debug!("probe from {peer}, replying '{reply}'");
            if let Err(e) = self.socket.send_to(reply.as_bytes(), peer).await {
                debug!("discovery reply to {peer} failed: {e}");
            }
        } else if payload.starts_with(ECHO_MAGIC) {
            if let Err(e) = self.socket.send_to(payload, peer).await {
                debug!("echo reply to {peer} failed: {e}");
            }
        } else {
            debug!("ignoring unknown datagram ({} bytes) from {peer}", payload.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;

    fn info() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("product".to_string(), "mock".to_string()),
            ("serial".to_string(), "AAAA".to_string()),
            ("rev".to_string(), "1".to_string()),
        ])
    }

    #[gtest]
    fn reply_leads_with_product_and_serial() {
        let reply = build_reply(&info(), false);
        expect_that!(reply, starts_with("product=mock,serial=AAAA"));
        expect_that!(reply, contains_substring("rev=1"));
        expect_that!(reply, ends_with("claimed=false"));
    }

    #[gtest]
    fn reply_parses_as_key_value_pairs() {
        let reply = build_reply(&info(), true);
        let map: BTreeMap<&str, &str> = reply
            .split(',')
            .map(|pair| pair.split_once('=').unwrap())
            .collect();
        expect_that!(map.get("product"), some(eq(&"mock")));
        expect_that!(map.get("serial"), some(eq(&"AAAA")));
        expect_that!(map.get("claimed"), some(eq(&"true")));
    }
}
