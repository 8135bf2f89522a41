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

use std::time::{Duration, Instant};

/// Poll `predicate` until it returns true or `timeout` elapses, sleeping
/// `interval` between attempts. Returns whether the predicate succeeded.
///
/// The predicate is always evaluated at least once, so a zero timeout still
/// performs a single check. The loop sleeps between attempts and never
/// busy-spins.
pub fn poll_with_timeout(
    mut predicate: impl FnMut() -> bool,
    timeout: Duration,
    interval: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(interval.min(deadline.saturating_duration_since(Instant::now())));
    }
}

/// Fallible variant: keep calling `op` until it returns `Ok`, the error is
/// returned only if the timeout expires first.
pub fn poll_result_with_timeout<T, E>(
    mut op: impl FnMut() -> Result<T, E>,
    timeout: Duration,
    interval: Duration,
) -> Result<T, E> {
    let deadline = Instant::now() + timeout;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) => {
                if Instant::now() >= deadline {
                    return Err(e);
                }
            }
        }
        std::thread::sleep(interval.min(deadline.saturating_duration_since(Instant::now())));
    }
}
