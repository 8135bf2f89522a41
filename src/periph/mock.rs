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

//! A hardware-free peripheral manager.
//!
//! Selected with `--mock` (or `MPM_MOCK=1`): every chip sits on an in-memory
//! register file, the update paths land in a scratch directory and the single
//! daughterboard is a Garnet over mock registers. Development hosts and the
//! integration tests run the full daemon against this variant.

use crate::chips::MockRegIo;
use crate::chips::cpld::MbCpld;
use crate::chips::ioexp::PORT_WIDTH;
use crate::compat::CompatNumber;
use crate::config::Config;
use crate::dboard::garnet::{GARNET_PID, GarnetDboard};
use crate::dboard::Daughterboard;
use crate::eeprom::bufferfs::{BUFFERFS_ALIGNMENT, BufferFs};
use crate::eeprom::tlv::DbEeprom;
use crate::error::MpmError;
use crate::periph::PeripheralManager;
use crate::sensors::{SensorRegistry, SensorValue};
use crate::update::{ComponentCompat, ComponentUpdater, UpdateableComponent};
use crate::sys::io::fs_create_dir;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const MOCK_PRODUCT: &str = "mock";
pub const MOCK_SERIAL: &str = "AAAA";

/// Register seed that makes the mock CPLD look healthy and garnet-compatible.
fn mock_cpld_regs() -> Vec<(u16, u32)> {
    vec![
        (0x00, crate::chips::cpld::CPLD_SIGNATURE),
        (0x01, 1),
        (0x20, GARNET_PID as u32),
    ]
}

pub struct MockPm {
    base_dir: PathBuf,
    device_info: BTreeMap<String, String>,
    sensors: SensorRegistry,
    updater: ComponentUpdater,
    dbs: Vec<Box<dyn Daughterboard>>,
    gpio_src: Vec<usize>,
    user_eeprom: Mutex<BufferFs>,
}

const GPIO_BANK: &str = "GPIO0";
const GPIO_SRCS: &[&str] = &["PS", "MPM", "USER_APP", "DB0_RF0"];

impl MockPm {
    pub fn new(_config: &Config) -> Result<MockPm, MpmError> {
        let base_dir =
            std::env::temp_dir().join(format!("mpmd-mock-{}", std::process::id()));
        Self::with_dir(&base_dir)
    }

    /// Build against an explicit scratch directory (tests own the tempdir).
    pub fn with_dir(base_dir: &Path) -> Result<MockPm, MpmError> {
        fs_create_dir(base_dir)?;
        let mut updater = ComponentUpdater::new(MOCK_PRODUCT);
        let compat = ComponentCompat {
            current: CompatNumber::new(5, 1),
            oldest: CompatNumber::new(5, 0),
        };
        updater.add_component(UpdateableComponent {
            id: "fpga".to_string(),
            path: base_dir.join("fpga.bin"),
            output: None,
            reset: false,
            check_dts_for_compatibility: false,
            swap_words: false,
            compat,
        });
        updater.add_component(UpdateableComponent {
            id: "dts".to_string(),
            path: base_dir.join("current.dts"),
            output: None,
            reset: false,
            check_dts_for_compatibility: true,
            swap_words: false,
            compat,
        });

        let mut device_info = BTreeMap::new();
        device_info.insert("product".to_string(), MOCK_PRODUCT.to_string());
        device_info.insert("serial".to_string(), MOCK_SERIAL.to_string());
        device_info.insert("rev".to_string(), "1".to_string());
        device_info.insert("pid".to_string(), "0x0001".to_string());
        device_info.insert(
            "mpm_version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );

        let cpld = Arc::new(MbCpld::new(Box::new(MockRegIo::with_regs(
            &mock_cpld_regs(),
        ))));
        let db_eeprom = DbEeprom {
            pid: GARNET_PID,
            rev: 1,
            rev_compat: 0,
            serial: "MOCKDB01".to_string(),
        };
        let db: Box<dyn Daughterboard> = Box::new(GarnetDboard::new(
            0,
            db_eeprom,
            cpld,
            Box::new(MockRegIo::with_regs(&[(0x48, 0x3), (0x49, 4150)])),
        ));

        let mut sensors = SensorRegistry::new();
        sensors.register(
            "temperature",
            Box::new(|| SensorValue::realnum("temperature", 42.0, "C")),
        );
        sensors.register(
            "ref_locked",
            Box::new(|| SensorValue::boolean("ref_locked", true)),
        );
        // GPS is never powered on the mock; the sensor still answers.
        sensors.register(
            "gps_locked",
            Box::new(|| SensorValue::not_available("gps_locked")),
        );

        Ok(MockPm {
            base_dir: base_dir.to_owned(),
            device_info,
            sensors,
            updater,
            dbs: vec![db],
            gpio_src: vec![0; PORT_WIDTH],
            user_eeprom: Mutex::new(BufferFs::new(4 * BUFFERFS_ALIGNMENT, BUFFERFS_ALIGNMENT)?),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

impl PeripheralManager for MockPm {
    fn product(&self) -> String {
        MOCK_PRODUCT.to_string()
    }

    fn device_info(&self) -> BTreeMap<String, String> {
        self.device_info.clone()
    }

    fn init(&mut self) -> Result<(), MpmError> {
        for db in &mut self.dbs {
            db.init(&BTreeMap::new())?;
        }
        Ok(())
    }

    fn tear_down(&mut self) -> Result<(), MpmError> {
        for db in &mut self.dbs {
            db.tear_down()?;
        }
        Ok(())
    }

    fn sensors(&self) -> &SensorRegistry {
        &self.sensors
    }

    fn updater(&self) -> &ComponentUpdater {
        &self.updater
    }

    fn dboards(&mut self) -> &mut [Box<dyn Daughterboard>] {
        &mut self.dbs
    }

    fn num_dboards(&self) -> usize {
        self.dbs.len()
    }

    fn mb_eeprom_info(&self) -> BTreeMap<String, String> {
        let mut info = BTreeMap::new();
        info.insert("version".to_string(), "2".to_string());
        info.insert("pid".to_string(), "0x0001".to_string());
        info.insert("rev".to_string(), "1".to_string());
        info.insert("serial".to_string(), MOCK_SERIAL.to_string());
        info
    }

    fn gpio_banks(&self) -> Vec<String> {
        vec![GPIO_BANK.to_string()]
    }

    fn gpio_srcs(&self, bank: &str) -> Result<Vec<String>, MpmError> {
        if bank != GPIO_BANK {
            return Err(MpmError::Argument(format!("No GPIO bank named '{bank}'")));
        }
        Ok(GPIO_SRCS.iter().map(|s| s.to_string()).collect())
    }

    fn get_gpio_src(&self, bank: &str) -> Result<Vec<String>, MpmError> {
        if bank != GPIO_BANK {
            return Err(MpmError::Argument(format!("No GPIO bank named '{bank}'")));
        }
        Ok(self
            .gpio_src
            .iter()
            .map(|&idx| GPIO_SRCS[idx].to_string())
            .collect())
    }

    fn set_gpio_src(&mut self, bank: &str, sources: &[String]) -> Result<(), MpmError> {
        if bank != GPIO_BANK {
            return Err(MpmError::Argument(format!("No GPIO bank named '{bank}'")));
        }
        if sources.len() != PORT_WIDTH {
            return Err(MpmError::Argument(format!(
                "Bank {GPIO_BANK} has {PORT_WIDTH} pins, got {} sources",
                sources.len()
            )));
        }
        let mut indices = Vec::with_capacity(PORT_WIDTH);
        for source in sources {
            let idx = GPIO_SRCS
                .iter()
                .position(|s| s == source)
                .ok_or_else(|| {
                    MpmError::Argument(format!(
                        "'{source}' is not a valid GPIO source (one of {GPIO_SRCS:?})"
                    ))
                })?;
            indices.push(idx);
        }
        self.gpio_src = indices;
        Ok(())
    }

    fn get_user_eeprom_blob(&self, key: &str) -> Result<Vec<u8>, MpmError> {
        let fs = self.user_eeprom.lock().expect("user eeprom lock poisoned");
        fs.get_blob(key).map(<[u8]>::to_vec)
    }

    fn set_user_eeprom_blob(&mut self, key: &str, data: Vec<u8>) -> Result<(), MpmError> {
        let mut fs = self.user_eeprom.lock().expect("user eeprom lock poisoned");
        fs.set_blob(key, data)
    }
}
