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

//! Daughterboard managers: one per populated RF slot.
//!
//! A daughterboard's lifecycle is strictly scoped to its parent peripheral
//! manager: the PM reads the slot EEPROM, recognizes the PID, powers the slot
//! and only then constructs and initializes the manager. Construction is
//! dispatched on the EEPROM PID.

pub mod garnet;

use crate::chips::RegIo;
use crate::chips::cpld::MbCpld;
use crate::eeprom::tlv::DbEeprom;
use crate::error::MpmError;
use crate::sensors::SensorValue;
use std::collections::BTreeMap;
use std::sync::Arc;

/// RF channels per daughterboard; global channel index = slot * this + chan.
pub const CHANS_PER_DBOARD: usize = 2;

/// Contract every daughterboard manager implements.
pub trait Daughterboard: Send {
    fn slot(&self) -> usize;
    fn pid(&self) -> u16;
    fn eeprom(&self) -> &DbEeprom;

    /// Power the board, verify compatibility and bring the RF chain up.
    fn init(&mut self, args: &BTreeMap<String, String>) -> Result<(), MpmError>;

    /// Drop power unconditionally; outputs default to open on power loss.
    fn tear_down(&mut self) -> Result<(), MpmError>;

    fn sensor_names(&self) -> Vec<String>;
    fn get_sensor(&self, name: &str) -> Result<SensorValue, MpmError>;

    /// Tuning setters return the value actually achieved, which may differ
    /// from the target by hardware step size. Out-of-range targets are
    /// errors, never silently clamped.
    fn set_rx_freq(&mut self, chan: usize, freq: f64) -> Result<f64, MpmError>;
    fn set_tx_freq(&mut self, chan: usize, freq: f64) -> Result<f64, MpmError>;
    fn set_rx_gain(&mut self, chan: usize, gain: f64) -> Result<f64, MpmError>;
    fn set_tx_gain(&mut self, chan: usize, gain: f64) -> Result<f64, MpmError>;

    /// Raw register access; only reachable for callers holding the claim.
    fn peek(&mut self, addr: u16) -> Result<u32, MpmError>;
    fn poke(&mut self, addr: u16, value: u32) -> Result<(), MpmError>;
}

/// Construct the manager matching an EEPROM PID.
///
/// # Returns: `Result<Box<dyn Daughterboard>, MpmError>`
/// * `Ok(manager)` - Slot powered off, manager not yet initialized
/// * `Err(MpmError::Argument)` - PID not recognized
pub fn dboard_for_pid(
    slot: usize,
    eeprom: DbEeprom,
    cpld: Arc<MbCpld>,
    io: Box<dyn RegIo>,
) -> Result<Box<dyn Daughterboard>, MpmError> {
    match eeprom.pid {
        garnet::GARNET_PID => Ok(Box::new(garnet::GarnetDboard::new(slot, eeprom, cpld, io))),
        pid => Err(MpmError::Argument(format!(
            "Unrecognized daughterboard PID 0x{pid:04X} in slot {slot}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chips::MockRegIo;
    use crate::chips::cpld::healthy_cpld_regs;
    use googletest::prelude::*;

    fn eeprom(pid: u16) -> DbEeprom {
        DbEeprom {
            pid,
            rev: 1,
            rev_compat: 0,
            serial: "ABC1234".to_string(),
        }
    }

    #[gtest]
    fn known_pid_constructs() {
        let cpld = Arc::new(MbCpld::new(Box::new(MockRegIo::with_regs(
            &healthy_cpld_regs(&[garnet::GARNET_PID]),
        ))));
        let db = dboard_for_pid(
            0,
            eeprom(garnet::GARNET_PID),
            cpld,
            Box::new(MockRegIo::new()),
        )
        .unwrap();
        expect_that!(db.pid(), eq(garnet::GARNET_PID));
        expect_that!(db.slot(), eq(0));
    }

    #[gtest]
    fn unknown_pid_is_rejected() {
        let cpld = Arc::new(MbCpld::new(Box::new(MockRegIo::new())));
        let result = dboard_for_pid(1, eeprom(0x9999), cpld, Box::new(MockRegIo::new()));
        expect_that!(
            result,
            err(displays_as(contains_substring("Unrecognized daughterboard PID")))
        );
    }
}
