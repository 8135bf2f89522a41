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

//! LMK-family reference clock / PLL driver.
//!
//! Owns the board's reference clock path: programs the divider tree, selects
//! the reference source and reports PLL lock. Register access is serialized
//! behind the driver's own lock so the init path and RPC-driven reads can
//! interleave safely.

use crate::chips::RegIo;
use crate::error::MpmError;
use crate::poll::poll_with_timeout;
use crate::sensors::SensorValue;
use log::{debug, info};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Value the ID register must read back.
pub const LMK_CHIP_ID: u32 = 0x051C;

/// How long to wait for PLL lock after programming.
pub const LOCK_TIMEOUT: Duration = Duration::from_millis(500);
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

mod regs {
    pub const CHIP_ID: u16 = 0x000;
    pub const RESET: u16 = 0x001;
    pub const REF_SELECT: u16 = 0x002;
    pub const PLL1_ENABLE: u16 = 0x010;
    pub const PLL1_STATUS: u16 = 0x011;
    pub const DIVIDER_BASE: u16 = 0x020;
}

/// PLL lock bit in `PLL1_STATUS`.
const STATUS_LOCKED: u32 = 1 << 0;

/// Selectable reference inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefSource {
    Internal,
    External,
    Gpsdo,
}

impl RefSource {
    fn mux_value(&self) -> u32 {
        match self {
            RefSource::Internal => 0,
            RefSource::External => 1,
            RefSource::Gpsdo => 2,
        }
    }

    pub fn from_name(name: &str) -> Result<Self, MpmError> {
        match name {
            "internal" => Ok(RefSource::Internal),
            "external" => Ok(RefSource::External),
            "gpsdo" => Ok(RefSource::Gpsdo),
            other => Err(MpmError::Argument(format!(
                "'{other}' is not a valid reference source (internal, external, gpsdo)"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RefSource::Internal => "internal",
            RefSource::External => "external",
            RefSource::Gpsdo => "gpsdo",
        }
    }
}

/// Divider tree for the default 10 MHz reference -> 125 MHz output plan.
const DIVIDER_TABLE: &[(u16, u32)] = &[
    (regs::DIVIDER_BASE, 25),
    (regs::DIVIDER_BASE + 1, 2),
    (regs::DIVIDER_BASE + 2, 10),
    (regs::DIVIDER_BASE + 3, 1),
];

pub struct LmkClock {
    name: String,
    io: Mutex<Box<dyn RegIo>>,
    ref_source: Mutex<RefSource>,
}

impl LmkClock {
    pub fn new(name: &str, io: Box<dyn RegIo>) -> Self {
        LmkClock {
            name: name.to_string(),
            io: Mutex::new(io),
            ref_source: Mutex::new(RefSource::Internal),
        }
    }

    fn hw_err(&self, what: &str) -> MpmError {
        MpmError::Hardware(format!("{}: {what}", self.name))
    }

    /// Full bring-up: identify, reset, program the divider tree, enable the
    /// PLL and wait for lock.
    pub fn init(&self) -> Result<(), MpmError> {
        {
            let mut io = self.io.lock().expect("lmk lock poisoned");
            let id = io.peek(regs::CHIP_ID)?;
            if id != LMK_CHIP_ID {
                return Err(self.hw_err(&format!(
                    "unexpected chip id 0x{id:04X}, expected 0x{LMK_CHIP_ID:04X}"
                )));
            }
            io.poke(regs::RESET, 1)?;
            io.poke(regs::RESET, 0)?;
            for &(addr, value) in DIVIDER_TABLE {
                io.poke(addr, value)?;
            }
            io.poke(
                regs::REF_SELECT,
                self.ref_source.lock().expect("ref lock poisoned").mux_value(),
            )?;
            io.poke(regs::PLL1_ENABLE, 1)?;
            debug!("{}: dividers programmed, PLL enabled", self.name);
        }
        self.wait_for_lock()?;
        info!("{}: PLL locked", self.name);
        Ok(())
    }

    fn wait_for_lock(&self) -> Result<(), MpmError> {
        let locked = poll_with_timeout(
            || self.pll_locked().unwrap_or(false),
            LOCK_TIMEOUT,
            LOCK_POLL_INTERVAL,
        );
        if !locked {
            return Err(self.hw_err(&format!(
                "PLL did not lock within {} ms",
                LOCK_TIMEOUT.as_millis()
            )));
        }
        Ok(())
    }

    pub fn pll_locked(&self) -> Result<bool, MpmError> {
        let mut io = self.io.lock().expect("lmk lock poisoned");
        Ok(io.peek(regs::PLL1_STATUS)? & STATUS_LOCKED != 0)
    }

    /// Switch the reference input and re-lock. Returns the name actually in
    /// effect.
    pub fn set_ref_source(&self, source: RefSource) -> Result<&'static str, MpmError> {
        {
            let mut io = self.io.lock().expect("lmk lock poisoned");
            io.poke(regs::REF_SELECT, source.mux_value())?;
        }
        *self.ref_source.lock().expect("ref lock poisoned") = source;
        self.wait_for_lock()?;
        Ok(source.name())
    }

    pub fn ref_source(&self) -> RefSource {
        *self.ref_source.lock().expect("ref lock poisoned")
    }

    /// Disable outputs; called from the tear-down path.
    pub fn power_down(&self) -> Result<(), MpmError> {
        let mut io = self.io.lock().expect("lmk lock poisoned");
        io.poke(regs::PLL1_ENABLE, 0)?;
        Ok(())
    }

    /// Sensor reader for `ref_locked`.
    pub fn lock_sensor(self: &Arc<Self>) -> crate::sensors::SensorFn {
        let clock = Arc::clone(self);
        Box::new(move || match clock.pll_locked() {
            Ok(locked) => SensorValue::boolean("ref_locked", locked),
            Err(_) => SensorValue::not_available("ref_locked"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chips::MockRegIo;
    use googletest::prelude::*;

    fn lockable_io() -> Box<MockRegIo> {
        // ID present and lock bit already asserted, as a healthy chip would
        // settle well inside the poll window.
        Box::new(MockRegIo::with_regs(&[
            (regs::CHIP_ID, LMK_CHIP_ID),
            (regs::PLL1_STATUS, STATUS_LOCKED),
        ]))
    }

    #[gtest]
    fn init_locks_with_healthy_chip() {
        let clock = LmkClock::new("mb_clock", lockable_io());
        expect_that!(clock.init(), ok(anything()));
        expect_that!(clock.pll_locked().unwrap(), eq(true));
    }

    #[gtest]
    fn wrong_chip_id_fails_with_chip_identity() {
        let io = Box::new(MockRegIo::with_regs(&[(regs::CHIP_ID, 0xBEEF)]));
        let clock = LmkClock::new("mb_clock", io);
        expect_that!(
            clock.init(),
            err(displays_as(contains_substring("mb_clock: unexpected chip id")))
        );
    }

    #[gtest]
    fn missing_lock_times_out_with_hardware_error() {
        let io = Box::new(MockRegIo::with_regs(&[(regs::CHIP_ID, LMK_CHIP_ID)]));
        let clock = LmkClock::new("mb_clock", io);
        expect_that!(
            clock.init(),
            err(displays_as(contains_substring("did not lock")))
        );
    }

    #[gtest]
    fn ref_source_switch_reports_achieved_source() {
        let clock = LmkClock::new("mb_clock", lockable_io());
        clock.init().unwrap();
        let name = clock.set_ref_source(RefSource::External).unwrap();
        expect_that!(name, eq("external"));
        expect_that!(clock.ref_source(), eq(RefSource::External));
    }

    #[gtest]
    fn invalid_ref_source_name_is_an_argument_error() {
        expect_that!(
            RefSource::from_name("atomic"),
            err(displays_as(contains_substring("not a valid reference source")))
        );
    }

    #[gtest]
    fn lock_sensor_reports_boolean() {
        let clock = Arc::new(LmkClock::new("mb_clock", lockable_io()));
        clock.init().unwrap();
        let sensor = clock.lock_sensor();
        let reading = sensor();
        expect_that!(reading.name, eq("ref_locked"));
        expect_that!(reading.value, eq("true"));
    }
}
