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

//! The Garnet RF daughterboard: two transceive channels, 1 MHz - 6 GHz.
//!
//! Tuning goes through the board's control CPLD register window; frequencies
//! are programmed in kHz steps and gains in half-dB steps, so setters round
//! to those grids and report what was actually achieved.

use crate::chips::RegIo;
use crate::chips::cpld::MbCpld;
use crate::dboard::{CHANS_PER_DBOARD, Daughterboard};
use crate::eeprom::tlv::DbEeprom;
use crate::error::MpmError;
use crate::sensors::SensorValue;
use log::{debug, info};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

pub const GARNET_PID: u16 = 0x4510;

/// EEPROM rev-compat values this driver knows how to run.
pub const DBOARD_SUPPORTED_COMPAT_REVS: &[u16] = &[0, 1];

pub const FREQ_MIN_HZ: f64 = 1e6;
pub const FREQ_MAX_HZ: f64 = 6e9;
/// Synthesizer step.
pub const FREQ_STEP_HZ: f64 = 1e3;

pub const GAIN_MIN_DB: f64 = 0.0;
pub const GAIN_MAX_DB: f64 = 60.0;
/// Attenuator step.
pub const GAIN_STEP_DB: f64 = 0.5;

mod regs {
    /// Tune words in kHz, one register per channel, RX then TX.
    pub const RX_FREQ_BASE: u16 = 0x40;
    pub const TX_FREQ_BASE: u16 = 0x42;
    /// Gain words in half-dB, RX then TX.
    pub const RX_GAIN_BASE: u16 = 0x44;
    pub const TX_GAIN_BASE: u16 = 0x46;
    /// Per-channel LO lock bits.
    pub const LO_STATUS: u16 = 0x48;
    /// Die temperature in centi-degrees, signed.
    pub const TEMPERATURE: u16 = 0x49;
}

pub struct GarnetDboard {
    slot: usize,
    eeprom: DbEeprom,
    cpld: Arc<MbCpld>,
    io: Mutex<Box<dyn RegIo>>,
    powered: bool,
}

fn round_to_step(value: f64, step: f64) -> f64 {
    (value / step).round() * step
}

fn check_chan(chan: usize) -> Result<(), MpmError> {
    if chan >= CHANS_PER_DBOARD {
        return Err(MpmError::Argument(format!(
            "Channel {chan} out of range ({CHANS_PER_DBOARD} channels)"
        )));
    }
    Ok(())
}

impl GarnetDboard {
    pub fn new(slot: usize, eeprom: DbEeprom, cpld: Arc<MbCpld>, io: Box<dyn RegIo>) -> Self {
        GarnetDboard {
            slot,
            eeprom,
            cpld,
            io: Mutex::new(io),
            powered: false,
        }
    }

    fn require_power(&self) -> Result<(), MpmError> {
        if !self.powered {
            return Err(MpmError::Hardware(format!(
                "Garnet slot {} is not powered", self.slot
            )));
        }
        Ok(())
    }

    fn set_freq(&mut self, base: u16, chan: usize, freq: f64) -> Result<f64, MpmError> {
        check_chan(chan)?;
        self.require_power()?;
        if !(FREQ_MIN_HZ..=FREQ_MAX_HZ).contains(&freq) {
            return Err(MpmError::Argument(format!(
                "Frequency {freq} Hz outside [{FREQ_MIN_HZ}, {FREQ_MAX_HZ}]"
            )));
        }
        let achieved = round_to_step(freq, FREQ_STEP_HZ);
        let khz = (achieved / 1e3) as u32;
        let mut io = self.io.lock().expect("garnet lock poisoned");
        io.poke(base + chan as u16, khz)?;
        debug!("garnet[{}]: chan {chan} tuned to {achieved} Hz", self.slot);
        Ok(achieved)
    }

    fn set_gain(&mut self, base: u16, chan: usize, gain: f64) -> Result<f64, MpmError> {
        check_chan(chan)?;
        self.require_power()?;
        if !(GAIN_MIN_DB..=GAIN_MAX_DB).contains(&gain) {
            return Err(MpmError::Argument(format!(
                "Gain {gain} dB outside [{GAIN_MIN_DB}, {GAIN_MAX_DB}]"
            )));
        }
        let achieved = round_to_step(gain, GAIN_STEP_DB);
        let half_db = (achieved / GAIN_STEP_DB) as u32;
        let mut io = self.io.lock().expect("garnet lock poisoned");
        io.poke(base + chan as u16, half_db)?;
        Ok(achieved)
    }
}

impl Daughterboard for GarnetDboard {
    fn slot(&self) -> usize {
        self.slot
    }

    fn pid(&self) -> u16 {
        GARNET_PID
    }

    fn eeprom(&self) -> &DbEeprom {
        &self.eeprom
    }

    fn init(&mut self, _args: &BTreeMap<String, String>) -> Result<(), MpmError> {
        if !DBOARD_SUPPORTED_COMPAT_REVS.contains(&self.eeprom.rev_compat) {
            return Err(MpmError::Hardware(format!(
                "Garnet slot {}: EEPROM rev-compat {} not in supported set {:?}",
                self.slot, self.eeprom.rev_compat, DBOARD_SUPPORTED_COMPAT_REVS
            )));
        }
        self.cpld.enable_db_power(self.slot, true)?;
        if !self.cpld.db_power_enabled(self.slot)? {
            return Err(MpmError::Hardware(format!(
                "Garnet slot {}: base power readback shows off after enable",
                self.slot
            )));
        }
        self.powered = true;
        info!(
            "garnet[{}]: serial {} rev {} up",
            self.slot, self.eeprom.serial, self.eeprom.rev
        );
        Ok(())
    }

    fn tear_down(&mut self) -> Result<(), MpmError> {
        // Unconditional: even a half-initialized board must lose power.
        self.powered = false;
        self.cpld.enable_db_power(self.slot, false)
    }

    fn sensor_names(&self) -> Vec<String> {
        vec!["lo_locked".to_string(), "temperature".to_string()]
    }

    fn get_sensor(&self, name: &str) -> Result<SensorValue, MpmError> {
        match name {
            "lo_locked" => {
                if !self.powered {
                    return Ok(SensorValue::not_available("lo_locked"));
                }
                let mut io = self.io.lock().expect("garnet lock poisoned");
                let status = io.peek(regs::LO_STATUS)?;
                let mask = (1u32 << CHANS_PER_DBOARD) - 1;
                Ok(SensorValue::boolean("lo_locked", status & mask == mask))
            }
            "temperature" => {
                if !self.powered {
                    return Ok(SensorValue::not_available("temperature"));
                }
                let mut io = self.io.lock().expect("garnet lock poisoned");
                let centi = io.peek(regs::TEMPERATURE)? as i32;
                Ok(SensorValue::realnum(
                    "temperature",
                    f64::from(centi) / 100.0,
                    "C",
                ))
            }
            other => Err(MpmError::Argument(format!(
                "No sensor named '{other}' on garnet slot {}",
                self.slot
            ))),
        }
    }

    fn set_rx_freq(&mut self, chan: usize, freq: f64) -> Result<f64, MpmError> {
        self.set_freq(regs::RX_FREQ_BASE, chan, freq)
    }

    fn set_tx_freq(&mut self, chan: usize, freq: f64) -> Result<f64, MpmError> {
        self.set_freq(regs::TX_FREQ_BASE, chan, freq)
    }

    fn set_rx_gain(&mut self, chan: usize, gain: f64) -> Result<f64, MpmError> {
        self.set_gain(regs::RX_GAIN_BASE, chan, gain)
    }

    fn set_tx_gain(&mut self, chan: usize, gain: f64) -> Result<f64, MpmError> {
        self.set_gain(regs::TX_GAIN_BASE, chan, gain)
    }

    fn peek(&mut self, addr: u16) -> Result<u32, MpmError> {
        let mut io = self.io.lock().expect("garnet lock poisoned");
        io.peek(addr)
    }

    fn poke(&mut self, addr: u16, value: u32) -> Result<(), MpmError> {
        let mut io = self.io.lock().expect("garnet lock poisoned");
        io.poke(addr, value)
    }
}
