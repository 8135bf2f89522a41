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

//! The Carbide motherboard: the reference product variant.
//!
//! Two RF daughterboard slots, an LMK reference clock, a motherboard CPLD
//! gating daughterboard power, and a port expander driving the front-panel
//! GPIO source matrix. Component images live under
//! `/lib/firmware/carbide/`.

use crate::chips::cpld::MbCpld;
use crate::chips::ioexp::{PORT_WIDTH, PortExpander};
use crate::chips::lmk::LmkClock;
use crate::chips::{RegIo, UioRegIo};
use crate::compat::CompatNumber;
use crate::config::{self, Config};
use crate::dboard::{Daughterboard, dboard_for_pid};
use crate::eeprom::bufferfs::{BUFFERFS_ALIGNMENT, BufferFs};
use crate::eeprom::tlv::parse_db_eeprom;
use crate::eeprom::MbEeprom;
use crate::error::MpmError;
use crate::periph::PeripheralManager;
use crate::sensors::{SensorRegistry, SensorValue};
use crate::sys::io::{fs_create_dir, fs_read_attr, fs_read_bytes, fs_write_bytes};
use crate::sys::nvmem;
use crate::sys::uio::{UioDevice, find_uio_device};
use crate::update::{ComponentCompat, ComponentUpdater, UpdateableComponent};
use log::{info, warn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const CARBIDE_PID: u16 = 0x0410;
pub const PRODUCT_NAME: &str = "carbide";
pub const NUM_DB_SLOTS: usize = 2;

/// Compat window of the FPGA image this MPM build expects.
pub const FPGA_COMPAT: ComponentCompat = ComponentCompat {
    current: CompatNumber::new(5, 2),
    oldest: CompatNumber::new(5, 0),
};

/// Compat window of the device tree.
pub const DTS_COMPAT: ComponentCompat = ComponentCompat {
    current: CompatNumber::new(5, 1),
    oldest: CompatNumber::new(5, 0),
};

/// The single front-panel GPIO bank.
pub const GPIO_BANK: &str = "GPIO0";

/// Closed set of logical sources a front-panel pin can be routed to.
pub const GPIO_SRCS: &[&str] = &["PS", "MPM", "USER_APP", "DB0_RF0", "DB1_RF0"];

/// Select lines are spread over bit planes: port `k` bit `p` carries bit `k`
/// of pin `p`'s source index.
const GPIO_SEL_PLANES: usize = 3;

/// Size of the BufferFS region in the user EEPROM.
pub const USER_EEPROM_SIZE: usize = 4 * BUFFERFS_ALIGNMENT;

/// Hardware handles the Carbide PM drives. Production code fills this via
/// [`CarbideIo::discover`]; tests inject mock register files.
pub struct CarbideIo {
    pub cpld_io: Box<dyn RegIo>,
    pub lmk_io: Box<dyn RegIo>,
    pub ioexp_io: Box<dyn RegIo>,
    /// Per-slot daughterboard register windows; `None` for empty slots.
    pub db_ios: Vec<Option<Box<dyn RegIo>>>,
    /// Per-slot raw daughterboard EEPROM images.
    pub db_eeproms: Vec<Option<Vec<u8>>>,
    /// Backing file of the BufferFS user region.
    pub user_eeprom_path: PathBuf,
    pub firmware_dir: PathBuf,
    /// Thermal zone temperature attribute (millidegrees), if present.
    pub thermal_zone: Option<PathBuf>,
}

impl CarbideIo {
    /// Resolve all hardware through UIO and nvmem lookups.
    pub fn discover() -> Result<CarbideIo, MpmError> {
        let open = |label: &str| -> Result<Box<dyn RegIo>, MpmError> {
            let (path, size) = find_uio_device(label)?;
            Ok(Box::new(UioRegIo::new(UioDevice::open(&path, size, false)?)))
        };
        let nvmem_dir = Path::new(config::NVMEM_DEVICES_DIR);
        let mut db_ios = Vec::new();
        let mut db_eeproms = Vec::new();
        for slot in 0..NUM_DB_SLOTS {
            db_ios.push(open(&format!("db{slot}-regs")).ok());
            db_eeproms.push(nvmem::read_eeprom(nvmem_dir, &format!("db{slot}_eeprom")).ok());
        }
        let firmware_dir = PathBuf::from(config::FIRMWARE_DIR).join(PRODUCT_NAME);
        let user_eeprom_path = nvmem::nvmem_paths_for_symbol(nvmem_dir, "user_eeprom")?
            .into_iter()
            .next()
            .ok_or_else(|| MpmError::Argument("No user_eeprom nvmem provider".into()))?;
        Ok(CarbideIo {
            cpld_io: open("mb-cpld")?,
            lmk_io: open("mb-clock")?,
            ioexp_io: open("mb-ioexp")?,
            db_ios,
            db_eeproms,
            user_eeprom_path,
            firmware_dir,
            thermal_zone: Some(PathBuf::from("/sys/class/thermal/thermal_zone0/temp")),
        })
    }
}

/// Registry constructor for [`CARBIDE_PID`].
pub fn construct(
    eeprom: MbEeprom,
    config: &Config,
) -> Result<Box<dyn PeripheralManager>, MpmError> {
    let io = CarbideIo::discover()?;
    Ok(Box::new(CarbidePm::new(eeprom, io, config)?))
}

pub struct CarbidePm {
    eeprom: MbEeprom,
    product: String,
    device_info: BTreeMap<String, String>,
    sensors: SensorRegistry,
    updater: ComponentUpdater,
    dbs: Vec<Box<dyn Daughterboard>>,
    cpld: Arc<MbCpld>,
    lmk: Arc<LmkClock>,
    ioexp: PortExpander,
    db_ios: Vec<Option<Box<dyn RegIo>>>,
    db_eeproms: Vec<Option<Vec<u8>>>,
    gpio_src: Vec<usize>,
    user_eeprom_path: PathBuf,
    thermal_zone: Option<PathBuf>,
    initialized: bool,
}

impl CarbidePm {
    pub fn new(eeprom: MbEeprom, io: CarbideIo, config: &Config) -> Result<CarbidePm, MpmError> {
        let product = config
            .product_override
            .clone()
            .unwrap_or_else(|| PRODUCT_NAME.to_string());

        fs_create_dir(&io.firmware_dir)?;
        let mut updater = ComponentUpdater::new(&product);
        updater.add_component(UpdateableComponent {
            id: "fpga".to_string(),
            path: io.firmware_dir.join("fpga.bin"),
            output: None,
            reset: true,
            check_dts_for_compatibility: false,
            swap_words: true,
            compat: FPGA_COMPAT,
        });
        updater.add_component(UpdateableComponent {
            id: "dts".to_string(),
            path: io.firmware_dir.join("current.dts"),
            output: Some(io.firmware_dir.join("current.dtbo")),
            reset: false,
            check_dts_for_compatibility: true,
            swap_words: false,
            compat: DTS_COMPAT,
        });

        Ok(CarbidePm {
            eeprom,
            product,
            device_info: BTreeMap::new(),
            sensors: SensorRegistry::new(),
            updater,
            dbs: Vec::new(),
            cpld: Arc::new(MbCpld::new(io.cpld_io)),
            lmk: Arc::new(LmkClock::new("mb_clock", io.lmk_io)),
            ioexp: PortExpander::new(io.ioexp_io, GPIO_SEL_PLANES),
            db_ios: io.db_ios,
            db_eeproms: io.db_eeproms,
            gpio_src: vec![0; PORT_WIDTH],
            user_eeprom_path: io.user_eeprom_path,
            thermal_zone: io.thermal_zone,
            initialized: false,
        })
    }

    fn build_device_info(&mut self) {
        let mut info = BTreeMap::new();
        info.insert("product".to_string(), self.product());
        info.insert("serial".to_string(), self.eeprom.serial.clone());
        info.insert("rev".to_string(), self.eeprom.rev.to_string());
        info.insert("pid".to_string(), format!("0x{:04X}", self.eeprom.pid));
        info.insert(
            "mpm_version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        info.insert(
            "fpga_compat".to_string(),
            FPGA_COMPAT.current.to_string(),
        );
        if let Some(mac) = self.eeprom.mac_addresses.first() {
            info.insert(
                "mac".to_string(),
                mac.iter()
                    .map(|b| format!("{b:02X}"))
                    .collect::<Vec<_>>()
                    .join(":"),
            );
        }
        self.device_info = info;
    }

    fn init_dboards(&mut self) -> Result<(), MpmError> {
        if !self.dbs.is_empty() {
            // Re-init after a reset: the managers survive tear_down, only
            // their hardware state needs rebuilding.
            for db in &mut self.dbs {
                db.init(&BTreeMap::new())?;
            }
            return Ok(());
        }
        let compatible_pids = self.cpld.compatible_db_pids()?;
        for slot in 0..NUM_DB_SLOTS {
            let Some(raw) = self.db_eeproms[slot].as_deref() else {
                info!("DB slot {slot} is empty");
                continue;
            };
            let db_eeprom = parse_db_eeprom(raw)?;
            if !compatible_pids.contains(&db_eeprom.pid) {
                return Err(MpmError::Hardware(format!(
                    "MB CPLD cannot drive DB PID 0x{:04X} in slot {slot} \
                     (compatible: {compatible_pids:04X?})",
                    db_eeprom.pid
                )));
            }
            let db_io = self.db_ios[slot].take().ok_or_else(|| {
                MpmError::Hardware(format!(
                    "Slot {slot} has an EEPROM but no register window"
                ))
            })?;
            // PID recognized and compatible; only now does the slot get power
            // (inside the daughterboard's own init).
            let mut db = dboard_for_pid(slot, db_eeprom, Arc::clone(&self.cpld), db_io)?;
            db.init(&BTreeMap::new())?;
            self.dbs.push(db);
        }
        Ok(())
    }

    fn register_sensors(&mut self) {
        self.sensors.register("ref_locked", self.lmk.lock_sensor());
        let thermal_zone = self.thermal_zone.clone();
        self.sensors.register(
            "temperature",
            Box::new(move || {
                let Some(path) = &thermal_zone else {
                    return SensorValue::not_available("temperature");
                };
                match fs_read_attr(path).ok().and_then(|s| s.parse::<i64>().ok()) {
                    Some(millideg) => SensorValue::realnum(
                        "temperature",
                        millideg as f64 / 1000.0,
                        "C",
                    ),
                    None => SensorValue::not_available("temperature"),
                }
            }),
        );
    }

    fn init_gpio_matrix(&mut self) -> Result<(), MpmError> {
        for plane in 0..GPIO_SEL_PLANES {
            self.ioexp.set_directions(plane, 0xFF)?;
            self.ioexp.write_port(plane, 0)?;
        }
        self.gpio_src = vec![0; PORT_WIDTH];
        Ok(())
    }

    fn load_user_eeprom(&self) -> Result<BufferFs, MpmError> {
        if !self.user_eeprom_path.exists() {
            return BufferFs::new(USER_EEPROM_SIZE, BUFFERFS_ALIGNMENT);
        }
        let raw = fs_read_bytes(&self.user_eeprom_path)?;
        BufferFs::from_bytes(&raw, BUFFERFS_ALIGNMENT)
    }
}

impl PeripheralManager for CarbidePm {
    fn product(&self) -> String {
        self.product.clone()
    }

    fn device_info(&self) -> BTreeMap<String, String> {
        self.device_info.clone()
    }

    fn init(&mut self) -> Result<(), MpmError> {
        if self.initialized {
            warn!("init called on an initialized PM, re-initializing");
            self.tear_down()?;
        }
        self.build_device_info();
        self.cpld.init()?;
        self.init_dboards()?;
        self.lmk.init()?;
        self.init_gpio_matrix()?;
        self.register_sensors();
        self.initialized = true;
        info!(
            "carbide serial {} up with {} daughterboard(s)",
            self.eeprom.serial,
            self.dbs.len()
        );
        Ok(())
    }

    fn tear_down(&mut self) -> Result<(), MpmError> {
        // Reverse init order; daughterboard power is dropped last, only after
        // the clocks are disabled.
        self.lmk.power_down()?;
        for db in &mut self.dbs {
            db.tear_down()?;
        }
        self.initialized = false;
        info!("carbide torn down");
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
        info.insert("version".to_string(), self.eeprom.version.to_string());
        info.insert("pid".to_string(), format!("0x{:04X}", self.eeprom.pid));
        info.insert("rev".to_string(), self.eeprom.rev.to_string());
        info.insert("serial".to_string(), self.eeprom.serial.clone());
        for (i, mac) in self.eeprom.mac_addresses.iter().enumerate() {
            info.insert(
                format!("mac{i}"),
                mac.iter()
                    .map(|b| format!("{b:02X}"))
                    .collect::<Vec<_>>()
                    .join(":"),
            );
        }
        if let Some(dt_compat) = self.eeprom.dt_compat {
            info.insert("dt_compat".to_string(), dt_compat.to_string());
        }
        if let Some(mcu_compat) = self.eeprom.mcu_compat {
            info.insert("mcu_compat".to_string(), mcu_compat.to_string());
        }
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
        // Validate the whole list before touching hardware; either the whole
        // bank applies or none of it does.
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
        for plane in 0..GPIO_SEL_PLANES {
            let mut value = 0u8;
            for (pin, idx) in indices.iter().enumerate() {
                value |= (((idx >> plane) & 1) as u8) << pin;
            }
            self.ioexp.write_port(plane, value)?;
        }
        self.gpio_src = indices;
        Ok(())
    }

    fn get_user_eeprom_blob(&self, key: &str) -> Result<Vec<u8>, MpmError> {
        let fs = self.load_user_eeprom()?;
        fs.get_blob(key).map(<[u8]>::to_vec)
    }

    fn set_user_eeprom_blob(&mut self, key: &str, data: Vec<u8>) -> Result<(), MpmError> {
        let mut fs = self.load_user_eeprom()?;
        fs.set_blob(key, data)?;
        // Whole-buffer persistence: one write, never per entry.
        fs_write_bytes(&self.user_eeprom_path, true, &fs.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chips::MockRegIo;
    use crate::chips::cpld::healthy_cpld_regs;
    use crate::dboard::garnet::GARNET_PID;
    use crate::eeprom::tlv::DbEeprom;
    use googletest::prelude::*;

    const LMK_ID_REG: &[(u16, u32)] = &[(0x000, 0x051C), (0x011, 1)];

    fn mb_eeprom() -> MbEeprom {
        MbEeprom {
            version: 2,
            mcu_flags: [0; 16],
            pid: CARBIDE_PID,
            rev: 3,
            serial: "31C9A5F".to_string(),
            mac_addresses: vec![[0x02, 0, 0xAA, 0xBB, 0xCC, 1]; 2],
            dt_compat: Some(5),
            mcu_compat: Some(2),
        }
    }

    fn garnet_image() -> Vec<u8> {
        DbEeprom {
            pid: GARNET_PID,
            rev: 1,
            rev_compat: 0,
            serial: "ABC1234".to_string(),
        }
        .serialize()
        .unwrap()
    }

    fn mock_io(dir: &Path, db_pid_ok: bool) -> CarbideIo {
        let compatible = if db_pid_ok { vec![GARNET_PID] } else { vec![0x1111] };
        CarbideIo {
            cpld_io: Box::new(MockRegIo::with_regs(&healthy_cpld_regs(&compatible))),
            lmk_io: Box::new(MockRegIo::with_regs(LMK_ID_REG)),
            ioexp_io: Box::new(MockRegIo::new()),
            db_ios: vec![Some(Box::new(MockRegIo::new())), None],
            db_eeproms: vec![Some(garnet_image()), None],
            user_eeprom_path: dir.join("user_eeprom"),
            firmware_dir: dir.join("firmware"),
            thermal_zone: None,
        }
    }

    fn pm(dir: &Path) -> CarbidePm {
        let mut pm = CarbidePm::new(mb_eeprom(), mock_io(dir, true), &Config::default()).unwrap();
        pm.init().unwrap();
        pm
    }

    #[gtest]
    fn init_builds_device_info_and_dboards() {
        let dir = tempfile::tempdir().unwrap();
        let pm = pm(dir.path());
        let info = pm.device_info();
        expect_that!(info.get("product"), some(eq(&"carbide".to_string())));
        expect_that!(info.get("serial"), some(eq(&"31C9A5F".to_string())));
        expect_that!(pm.num_dboards(), eq(1));
    }

    #[gtest]
    fn incompatible_db_pid_aborts_init() {
        let dir = tempfile::tempdir().unwrap();
        let mut pm =
            CarbidePm::new(mb_eeprom(), mock_io(dir.path(), false), &Config::default()).unwrap();
        expect_that!(
            pm.init(),
            err(displays_as(contains_substring("MB CPLD cannot drive")))
        );
    }

    #[gtest]
    fn sensors_registered_and_thermal_degrades_to_na() {
        let dir = tempfile::tempdir().unwrap();
        let pm = pm(dir.path());
        let reading = pm.sensors().read("ref_locked").unwrap();
        expect_that!(reading.value, eq("true"));
        let temp = pm.sensors().read("temperature").unwrap();
        expect_that!(temp.value, eq("n/a"));
    }

    #[gtest]
    fn gpio_bank_is_transactional() {
        let dir = tempfile::tempdir().unwrap();
        let mut pm = pm(dir.path());
        let sources: Vec<String> = ["MPM", "PS", "USER_APP", "PS", "PS", "PS", "DB0_RF0", "PS"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        pm.set_gpio_src(GPIO_BANK, &sources).unwrap();
        expect_that!(pm.get_gpio_src(GPIO_BANK).unwrap(), eq(&sources.clone()));

        // One bad name anywhere leaves the bank untouched.
        let mut bad = sources.clone();
        bad[7] = "JTAG".to_string();
        expect_that!(
            pm.set_gpio_src(GPIO_BANK, &bad),
            err(displays_as(contains_substring("not a valid GPIO source")))
        );
        expect_that!(pm.get_gpio_src(GPIO_BANK).unwrap(), eq(&sources));
    }

    #[gtest]
    fn wrong_source_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut pm = pm(dir.path());
        expect_that!(
            pm.set_gpio_src(GPIO_BANK, &["PS".to_string()]),
            err(displays_as(contains_substring("8 pins")))
        );
    }

    #[gtest]
    fn user_eeprom_blobs_persist_across_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let mut pm1 = pm(dir.path());
        pm1.set_user_eeprom_blob("cal_rx", b"table".to_vec()).unwrap();
        expect_that!(
            pm1.get_user_eeprom_blob("cal_rx").unwrap(),
            eq(&b"table".to_vec())
        );
        // A second PM over the same backing file sees the blob.
        let pm2 = pm(dir.path());
        expect_that!(
            pm2.get_user_eeprom_blob("cal_rx").unwrap(),
            eq(&b"table".to_vec())
        );
    }

    #[gtest]
    fn tear_down_drops_db_power_and_reset_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let mut pm = pm(dir.path());
        pm.tear_down().unwrap();
        expect_that!(pm.cpld.db_power_enabled(0).unwrap(), eq(false));
        // A reset re-runs init over the surviving managers.
        pm.init().unwrap();
        expect_that!(pm.num_dboards(), eq(1));
        expect_that!(pm.cpld.db_power_enabled(0).unwrap(), eq(true));
    }
}
