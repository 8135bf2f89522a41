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

//! Motherboard CPLD driver.
//!
//! The CPLD gates daughterboard power and advertises which daughterboard
//! PIDs the board revision can drive. Power switching is verified by
//! readback; the outputs default to open on power loss, so dropping power in
//! the tear-down path is always safe.

use crate::chips::RegIo;
use crate::error::MpmError;
use log::{debug, info};
use std::sync::Mutex;

/// Value the signature register must read back.
pub const CPLD_SIGNATURE: u32 = 0xCB1D;

mod regs {
    pub const SIGNATURE: u16 = 0x00;
    pub const REVISION: u16 = 0x01;
    pub const DB_POWER: u16 = 0x10;
    /// Window of compatible daughterboard PIDs, one per register, zero
    /// terminated.
    pub const COMPAT_BASE: u16 = 0x20;
    pub const COMPAT_LEN: u16 = 8;
}

pub struct MbCpld {
    io: Mutex<Box<dyn RegIo>>,
}

impl MbCpld {
    pub fn new(io: Box<dyn RegIo>) -> Self {
        MbCpld { io: Mutex::new(io) }
    }

    /// Verify the signature and log the image revision.
    pub fn init(&self) -> Result<(), MpmError> {
        let mut io = self.io.lock().expect("cpld lock poisoned");
        let signature = io.peek(regs::SIGNATURE)?;
        if signature != CPLD_SIGNATURE {
            return Err(MpmError::Hardware(format!(
                "mb_cpld: bad signature 0x{signature:04X}, expected 0x{CPLD_SIGNATURE:04X}"
            )));
        }
        let revision = io.peek(regs::REVISION)?;
        info!("mb_cpld: signature ok, image revision {revision}");
        Ok(())
    }

    pub fn revision(&self) -> Result<u32, MpmError> {
        let mut io = self.io.lock().expect("cpld lock poisoned");
        io.peek(regs::REVISION)
    }

    /// The daughterboard PIDs this CPLD image can drive.
    pub fn compatible_db_pids(&self) -> Result<Vec<u16>, MpmError> {
        let mut io = self.io.lock().expect("cpld lock poisoned");
        let mut pids = Vec::new();
        for i in 0..regs::COMPAT_LEN {
            let value = io.peek(regs::COMPAT_BASE + i)?;
            if value == 0 {
                break;
            }
            pids.push((value & 0xFFFF) as u16);
        }
        Ok(pids)
    }

    /// Switch base power of daughterboard `slot` and verify by readback.
    pub fn enable_db_power(&self, slot: usize, enable: bool) -> Result<(), MpmError> {
        if slot >= 8 {
            return Err(MpmError::Argument(format!("DB slot {slot} out of range")));
        }
        let mut io = self.io.lock().expect("cpld lock poisoned");
        let current = io.peek(regs::DB_POWER)?;
        let desired = if enable {
            current | (1 << slot)
        } else {
            current & !(1 << slot)
        };
        io.poke(regs::DB_POWER, desired)?;
        let readback = io.peek(regs::DB_POWER)?;
        if readback != desired {
            return Err(MpmError::Hardware(format!(
                "mb_cpld: DB power readback mismatch: wrote 0x{desired:02X}, read 0x{readback:02X}"
            )));
        }
        debug!("mb_cpld: DB slot {slot} power {}", if enable { "on" } else { "off" });
        Ok(())
    }

    pub fn db_power_enabled(&self, slot: usize) -> Result<bool, MpmError> {
        let mut io = self.io.lock().expect("cpld lock poisoned");
        Ok(io.peek(regs::DB_POWER)? & (1 << slot) != 0)
    }
}

#[cfg(test)]
pub(crate) fn healthy_cpld_regs(compatible_pids: &[u16]) -> Vec<(u16, u32)> {
    let mut seed = vec![(regs::SIGNATURE, CPLD_SIGNATURE), (regs::REVISION, 7)];
    for (i, pid) in compatible_pids.iter().enumerate() {
        seed.push((regs::COMPAT_BASE + i as u16, *pid as u32));
    }
    seed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chips::MockRegIo;
    use googletest::prelude::*;

    fn cpld(compatible: &[u16]) -> MbCpld {
        MbCpld::new(Box::new(MockRegIo::with_regs(&healthy_cpld_regs(
            compatible,
        ))))
    }

    #[gtest]
    fn init_checks_signature() {
        let good = cpld(&[]);
        expect_that!(good.init(), ok(anything()));
        let bad = MbCpld::new(Box::new(MockRegIo::new()));
        expect_that!(
            bad.init(),
            err(displays_as(contains_substring("bad signature")))
        );
    }

    #[gtest]
    fn compat_window_reads_until_zero() {
        let c = cpld(&[0x4510, 0x4511]);
        expect_that!(
            c.compatible_db_pids().unwrap(),
            eq(&vec![0x4510u16, 0x4511])
        );
        expect_that!(cpld(&[]).compatible_db_pids().unwrap().is_empty(), eq(true));
    }

    #[gtest]
    fn db_power_sequencing_reads_back() {
        let c = cpld(&[0x4510]);
        c.enable_db_power(0, true).unwrap();
        expect_that!(c.db_power_enabled(0).unwrap(), eq(true));
        expect_that!(c.db_power_enabled(1).unwrap(), eq(false));
        c.enable_db_power(0, false).unwrap();
        expect_that!(c.db_power_enabled(0).unwrap(), eq(false));
    }

    #[gtest]
    fn bad_slot_is_rejected() {
        let c = cpld(&[]);
        expect_that!(
            c.enable_db_power(9, true),
            err(displays_as(contains_substring("out of range")))
        );
    }
}
