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

//! Shared daemon state: liveness flag and the claim lease.
//!
//! The discovery responder, the RPC server, the watchdog and the peripheral
//! manager all hold an `Arc<SharedState>`. Everything mutable across those
//! tasks lives here and nowhere else.

use crate::error::MpmError;
use log::{info, warn};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Upper bound on claim token length, in bytes.
pub const MAX_TOKEN_LEN: usize = 256;

/// An exclusive lease on the device: the opaque token identifies the owner,
/// the deadline advances on every successful `reclaim`.
#[derive(Debug, Clone)]
pub struct Claim {
    pub token: String,
    pub session_id: String,
    pub deadline: Instant,
}

/// Process-wide shared state.
///
/// Invariant: `claim_status` is true iff the claim slot holds a token. Both
/// are only ever changed together, under the claim mutex.
pub struct SharedState {
    system_ready: AtomicBool,
    claim_status: AtomicBool,
    claim: Mutex<Option<Claim>>,
    claim_timeout: Duration,
}

impl SharedState {
    pub fn new(claim_timeout: Duration) -> Self {
        SharedState {
            system_ready: AtomicBool::new(false),
            claim_status: AtomicBool::new(false),
            claim: Mutex::new(None),
            claim_timeout,
        }
    }

    /// True while the daemon is serving; clearing it requests graceful shutdown.
    pub fn system_ready(&self) -> bool {
        self.system_ready.load(Ordering::SeqCst)
    }

    pub fn set_system_ready(&self, ready: bool) {
        self.system_ready.store(ready, Ordering::SeqCst);
    }

    /// Lock-free view of whether a host currently holds the claim; safe to
    /// read from the discovery responder on every probe.
    pub fn claim_status(&self) -> bool {
        self.claim_status.load(Ordering::SeqCst)
    }

    pub fn claim_timeout(&self) -> Duration {
        self.claim_timeout
    }

    /// Take the claim for `session_id`. Fails while another claim is live.
    pub fn try_claim(&self, session_id: &str) -> Result<String, MpmError> {
        let mut slot = self.claim.lock().expect("claim lock poisoned");
        if let Some(claim) = slot.as_ref() {
            return Err(MpmError::InvalidToken(format!(
                "Device is already claimed by session '{}'",
                claim.session_id
            )));
        }
        let token = generate_token()?;
        info!("Claimed by session '{session_id}'");
        *slot = Some(Claim {
            token: token.clone(),
            session_id: session_id.to_string(),
            deadline: Instant::now() + self.claim_timeout,
        });
        self.claim_status.store(true, Ordering::SeqCst);
        Ok(token)
    }

    /// Push the claim deadline out by one timeout. Returns false when the
    /// token does not match the live claim (including when none is live).
    pub fn reclaim(&self, token: &str) -> bool {
        let mut slot = self.claim.lock().expect("claim lock poisoned");
        match slot.as_mut() {
            Some(claim) if claim.token == token => {
                claim.deadline = Instant::now() + self.claim_timeout;
                true
            }
            _ => false,
        }
    }

    /// Release the claim iff `token` matches.
    pub fn unclaim(&self, token: &str) -> bool {
        let mut slot = self.claim.lock().expect("claim lock poisoned");
        match slot.as_ref() {
            Some(claim) if claim.token == token => {
                info!("Claim released by session '{}'", claim.session_id);
                *slot = None;
                self.claim_status.store(false, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    /// Authorize a token-required RPC call.
    pub fn check_token(&self, token: &str) -> Result<(), MpmError> {
        let slot = self.claim.lock().expect("claim lock poisoned");
        match slot.as_ref() {
            Some(claim) if claim.token == token => Ok(()),
            Some(_) => Err(MpmError::InvalidToken(
                "Token does not match the current claim".to_string(),
            )),
            None => Err(MpmError::InvalidToken(
                "Device is not claimed".to_string(),
            )),
        }
    }

    /// Drop the claim if its deadline has passed. Returns the expired
    /// session id so the caller can log it.
    pub fn expire_claim_if_overdue(&self) -> Option<String> {
        let mut slot = self.claim.lock().expect("claim lock poisoned");
        let expired = match slot.as_ref() {
            Some(claim) if Instant::now() >= claim.deadline => Some(claim.session_id.clone()),
            _ => None,
        };
        if let Some(session) = &expired {
            warn!("Claim of session '{session}' expired without reclaim");
            *slot = None;
            self.claim_status.store(false, Ordering::SeqCst);
        }
        expired
    }
}

/// Produce a fresh opaque, printable claim token.
fn generate_token() -> Result<String, MpmError> {
    let mut raw = [0u8; 32];
    getrandom::getrandom(&mut raw)
        .map_err(|e| MpmError::Internal(format!("Could not gather token entropy: {e}")))?;
    let token = hex::encode(raw);
    debug_assert!(token.len() <= MAX_TOKEN_LEN);
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;

    fn state(timeout_ms: u64) -> SharedState {
        SharedState::new(Duration::from_millis(timeout_ms))
    }

    #[gtest]
    fn claim_is_exclusive() {
        let s = state(1000);
        let tok1 = s.try_claim("h1").unwrap();
        assert_that!(s.claim_status(), eq(true));
        let second = s.try_claim("h2");
        expect_that!(
            second,
            err(displays_as(contains_substring("already claimed")))
        );
        assert_that!(s.unclaim(&tok1), eq(true));
        expect_that!(s.claim_status(), eq(false));
        expect_that!(s.try_claim("h2"), ok(anything()));
    }

    #[gtest]
    fn claim_status_tracks_token_presence() {
        let s = state(1000);
        expect_that!(s.claim_status(), eq(false));
        let tok = s.try_claim("h1").unwrap();
        expect_that!(s.claim_status(), eq(true));
        s.unclaim(&tok);
        expect_that!(s.claim_status(), eq(false));
    }

    #[gtest]
    fn wrong_token_is_rejected_everywhere() {
        let s = state(1000);
        let _tok = s.try_claim("h1").unwrap();
        expect_that!(s.reclaim("bogus"), eq(false));
        expect_that!(s.unclaim("bogus"), eq(false));
        expect_that!(
            s.check_token("bogus"),
            err(displays_as(contains_substring("MpmError::InvalidToken")))
        );
    }

    #[gtest]
    fn unclaimed_check_fails() {
        let s = state(1000);
        expect_that!(
            s.check_token("anything"),
            err(displays_as(contains_substring("not claimed")))
        );
    }

    #[gtest]
    fn reclaim_extends_deadline() {
        let s = state(50);
        let tok = s.try_claim("h1").unwrap();
        for _ in 0..5 {
            std::thread::sleep(Duration::from_millis(20));
            assert_that!(s.reclaim(&tok), eq(true));
            assert_that!(s.expire_claim_if_overdue(), none());
        }
        // Stop reclaiming: the lease must lapse.
        std::thread::sleep(Duration::from_millis(80));
        expect_that!(s.expire_claim_if_overdue(), some(eq(&"h1".to_string())));
        expect_that!(s.claim_status(), eq(false));
        expect_that!(s.try_claim("h2"), ok(anything()));
    }

    #[gtest]
    fn tokens_are_unique_and_printable() {
        let s = state(1000);
        let tok1 = s.try_claim("h1").unwrap();
        s.unclaim(&tok1);
        let tok2 = s.try_claim("h1").unwrap();
        expect_that!(tok1, not(eq(&tok2.clone())));
        expect_that!(tok2.len() <= MAX_TOKEN_LEN, eq(true));
        expect_that!(tok2.chars().all(|c| c.is_ascii_hexdigit()), eq(true));
    }
}
