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

//! Peripheral managers: the device-specific top layer.
//!
//! A peripheral manager owns the motherboard hardware and its daughterboard
//! managers, registers sensors and updateable components, and tears the
//! hardware down safely on exit. Product variants register themselves in a
//! PID-keyed registry; at startup the daemon reads the motherboard EEPROM and
//! constructs the variant matching its PID.

pub mod carbide;
pub mod mock;

use crate::config::Config;
use crate::dboard::Daughterboard;
use crate::eeprom::MbEeprom;
use crate::error::MpmError;
use crate::sensors::SensorRegistry;
use crate::update::ComponentUpdater;
use log::info;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, OnceLock};

/// Device-specific business logic behind the RPC surface.
pub trait PeripheralManager: Send {
    fn product(&self) -> String;

    /// Small-string descriptors: product, serial, rev, … Served by discovery
    /// and by `get_device_info`.
    fn device_info(&self) -> BTreeMap<String, String>;

    /// Bring the hardware up. Idempotent and fail-loud: any error aborts the
    /// daemon during startup.
    fn init(&mut self) -> Result<(), MpmError>;

    /// Release clocks, disable outputs and close device files, in reverse
    /// init order.
    fn tear_down(&mut self) -> Result<(), MpmError>;

    fn sensors(&self) -> &SensorRegistry;
    fn updater(&self) -> &ComponentUpdater;
    fn dboards(&mut self) -> &mut [Box<dyn Daughterboard>];
    fn num_dboards(&self) -> usize;

    /// Decoded motherboard EEPROM fields, for `get_mb_eeprom`.
    fn mb_eeprom_info(&self) -> BTreeMap<String, String>;

    /// GPIO source matrix: banks, the closed source set, and transactional
    /// per-bank assignment.
    fn gpio_banks(&self) -> Vec<String>;
    fn gpio_srcs(&self, bank: &str) -> Result<Vec<String>, MpmError>;
    fn get_gpio_src(&self, bank: &str) -> Result<Vec<String>, MpmError>;
    fn set_gpio_src(&mut self, bank: &str, sources: &[String]) -> Result<(), MpmError>;

    /// BufferFS-backed user EEPROM region.
    fn get_user_eeprom_blob(&self, key: &str) -> Result<Vec<u8>, MpmError>;
    fn set_user_eeprom_blob(&mut self, key: &str, data: Vec<u8>) -> Result<(), MpmError>;
}

/// Constructor stored in the product registry: takes the already-parsed
/// motherboard EEPROM and the daemon config.
pub type PmConstructor = fn(MbEeprom, &Config) -> Result<Box<dyn PeripheralManager>, MpmError>;

/// PID-keyed registry of product constructors, filled at daemon startup.
pub static PM_REGISTRY: OnceLock<Mutex<HashMap<u16, PmConstructor>>> = OnceLock::new();

fn init_pm_registry() -> Mutex<HashMap<u16, PmConstructor>> {
    Mutex::new(HashMap::new())
}

pub fn register_pm(pid: u16, constructor: PmConstructor) {
    let mut registry = PM_REGISTRY
        .get_or_init(init_pm_registry)
        .lock()
        .expect("couldnt get PM_REGISTRY");
    registry.insert(pid, constructor);
}

/// Construct the peripheral manager for a motherboard EEPROM.
pub fn pm_for_eeprom(
    eeprom: MbEeprom,
    config: &Config,
) -> Result<Box<dyn PeripheralManager>, MpmError> {
    let registry = PM_REGISTRY
        .get()
        .ok_or(MpmError::Internal(String::from(
            "couldn't get PM_REGISTRY",
        )))?
        .lock()
        .map_err(|_| MpmError::Internal(String::from("couldn't lock PM_REGISTRY")))?;
    let constructor = registry.get(&eeprom.pid).ok_or_else(|| {
        MpmError::Argument(format!(
            "No peripheral manager registered for PID 0x{:04X}",
            eeprom.pid
        ))
    })?;
    info!("Constructing peripheral manager for PID 0x{:04X}", eeprom.pid);
    constructor(eeprom, config)
}

/// Register every built-in product variant. Called once from main.
pub fn register_products() {
    register_pm(carbide::CARBIDE_PID, carbide::construct);
}

/// Build the peripheral manager for this device: the mock when forced by
/// config, otherwise the variant matching the motherboard EEPROM PID.
pub fn discover_pm(config: &Config) -> Result<Box<dyn PeripheralManager>, MpmError> {
    if config.mock {
        info!("Mock mode: skipping hardware inventory");
        return Ok(Box::new(mock::MockPm::new(config)?));
    }
    let raw = crate::sys::nvmem::read_eeprom(
        std::path::Path::new(crate::config::NVMEM_DEVICES_DIR),
        "mb_eeprom",
    )?;
    let eeprom = crate::eeprom::parse_mb_eeprom(&raw)?;
    pm_for_eeprom(eeprom, config)
}
