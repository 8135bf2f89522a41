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

//! systemd watchdog integration.
//!
//! A plain thread (deliberately not a tokio task: it must keep ticking even
//! if the runtime is wedged) sends `sd_notify` datagrams to `NOTIFY_SOCKET`:
//! `READY=1` once, then `WATCHDOG=1` every third of the watchdog timeout for
//! as long as `system_ready` holds. Clearing the flag stops the pings within
//! one interval, after which systemd takes the daemon down.

use crate::state::SharedState;
use log::{debug, info, warn};
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixDatagram};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Read the notification socket address systemd passed us, if any.
pub fn notify_socket_from_env() -> Option<String> {
    std::env::var("NOTIFY_SOCKET").ok().filter(|s| !s.is_empty())
}

fn send_notification(socket: &UnixDatagram, dest: &str, message: &str) -> std::io::Result<()> {
    if let Some(abstract_name) = dest.strip_prefix('@') {
        let addr = SocketAddr::from_abstract_name(abstract_name.as_bytes())?;
        socket.send_to_addr(message.as_bytes(), &addr)?;
    } else {
        socket.send_to(message.as_bytes(), dest)?;
    }
    Ok(())
}

/// Start the watchdog thread.
///
/// `timeout` is the full watchdog window (`WATCHDOG_USEC`); pings go out at a
/// third of it. With no notification socket the thread still runs, so the
/// liveness loop behaves identically under systemd and on a bench.
pub fn spawn(
    state: Arc<SharedState>,
    timeout: Duration,
    notify_socket: Option<String>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("watchdog".to_string())
        .spawn(move || watchdog_loop(state, timeout, notify_socket))
        .expect("could not spawn watchdog thread")
}

fn watchdog_loop(state: Arc<SharedState>, timeout: Duration, notify_socket: Option<String>) {
    let interval = timeout / 3;
    let socket = match &notify_socket {
        Some(dest) => match UnixDatagram::unbound() {
            Ok(socket) => {
                if let Err(e) = send_notification(&socket, dest, "READY=1") {
                    warn!("Could not notify readiness: {e}");
                }
                info!("Watchdog pinging {dest} every {} ms", interval.as_millis());
                Some((socket, dest.clone()))
            }
            Err(e) => {
                warn!("Could not open notification socket: {e}");
                None
            }
        },
        None => {
            debug!("No NOTIFY_SOCKET, watchdog runs without systemd");
            None
        }
    };

    while state.system_ready() {
        if let Some((socket, dest)) = &socket {
            if let Err(e) = send_notification(socket, dest, "WATCHDOG=1") {
                debug!("Watchdog ping failed: {e}");
            }
        }
        std::thread::sleep(interval);
    }
    if let Some((socket, dest)) = &socket {
        let _ = send_notification(socket, dest, "STOPPING=1");
    }
    info!("Watchdog stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;
    use std::time::Instant;

    fn bound_receiver(dir: &std::path::Path) -> (UnixDatagram, String) {
        let path = dir.join("notify.sock");
        let receiver = UnixDatagram::bind(&path).unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        (receiver, path.to_string_lossy().into_owned())
    }

    fn recv_message(receiver: &UnixDatagram) -> String {
        let mut buf = [0u8; 64];
        let n = receiver.recv(&mut buf).unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[gtest]
    fn pings_flow_while_ready_and_stop_after_clear() {
        let dir = tempfile::tempdir().unwrap();
        let (receiver, dest) = bound_receiver(dir.path());
        let state = Arc::new(SharedState::new(Duration::from_secs(1)));
        state.set_system_ready(true);

        // 90 ms window -> a ping every 30 ms.
        let handle = spawn(
            Arc::clone(&state),
            Duration::from_millis(90),
            Some(dest),
        );
        expect_that!(recv_message(&receiver), eq("READY=1"));
        let start = Instant::now();
        expect_that!(recv_message(&receiver), eq("WATCHDOG=1"));
        expect_that!(recv_message(&receiver), eq("WATCHDOG=1"));
        // Two pings must arrive well within one full timeout window.
        expect_that!(start.elapsed() < Duration::from_millis(200), eq(true));

        state.set_system_ready(false);
        handle.join().unwrap();
        // Drain until the terminal message; the thread stopped within one
        // interval of the clear.
        let mut last = String::new();
        while let Ok(()) = {
            let mut buf = [0u8; 64];
            receiver.recv(&mut buf).map(|n| {
                last = String::from_utf8_lossy(&buf[..n]).into_owned();
            })
        } {
            if last == "STOPPING=1" {
                break;
            }
        }
        expect_that!(last, eq("STOPPING=1"));
    }

    #[gtest]
    fn runs_without_notify_socket() {
        let state = Arc::new(SharedState::new(Duration::from_secs(1)));
        state.set_system_ready(true);
        let handle = spawn(Arc::clone(&state), Duration::from_millis(30), None);
        std::thread::sleep(Duration::from_millis(50));
        state.set_system_ready(false);
        handle.join().unwrap();
    }
}
