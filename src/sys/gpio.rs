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

//! sysfs GPIO access.
//!
//! Lines are requested with a direction and released (unexported) when the
//! handle drops, unless explicitly held for the lifetime of the daemon.

use crate::config;
use crate::error::MpmError;
use crate::sys::io::{fs_read_attr, fs_read_dir, fs_write};
use log::trace;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    fn as_sysfs(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

/// A requested GPIO line. Export state is owned by this handle.
#[derive(Debug)]
pub struct GpioLine {
    number: u32,
    direction: Direction,
    hold: bool,
}

impl GpioLine {
    /// Export line `number` and set its direction.
    ///
    /// An already-exported line is reused rather than treated as an error, so
    /// a daemon restart after an unclean exit can reacquire its pins.
    pub fn request(number: u32, direction: Direction) -> Result<GpioLine, MpmError> {
        let line_dir = Self::line_dir(number);
        if !line_dir.exists() {
            trace!("Exporting GPIO {number}");
            fs_write(
                &Path::new(config::GPIO_CONTROL_DIR).join("export"),
                false,
                number.to_string(),
            )?;
        }
        fs_write(&line_dir.join("direction"), false, direction.as_sysfs())?;
        Ok(GpioLine {
            number,
            direction,
            hold: false,
        })
    }

    /// Keep the line exported after this handle drops.
    pub fn hold(mut self) -> Self {
        self.hold = true;
        self
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn get(&self) -> Result<bool, MpmError> {
        let value = fs_read_attr(&Self::line_dir(self.number).join("value"))?;
        match value.as_str() {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(MpmError::Hardware(format!(
                "GPIO {} reported unexpected value '{other}'",
                self.number
            ))),
        }
    }

    pub fn set(&self, value: bool) -> Result<(), MpmError> {
        if self.direction != Direction::Out {
            return Err(MpmError::NotPermitted(format!(
                "GPIO {} was requested as an input",
                self.number
            )));
        }
        fs_write(
            &Self::line_dir(self.number).join("value"),
            false,
            if value { "1" } else { "0" },
        )
    }

    fn line_dir(number: u32) -> PathBuf {
        Path::new(config::GPIO_CONTROL_DIR).join(format!("gpio{number}"))
    }
}

impl Drop for GpioLine {
    fn drop(&mut self) {
        if self.hold {
            return;
        }
        let _ = fs_write(
            &Path::new(config::GPIO_CONTROL_DIR).join("unexport"),
            false,
            self.number.to_string(),
        );
    }
}

/// Resolve a named line to its global GPIO number.
///
/// Scans `/sys/class/gpio/gpiochip*/label` for `chip_label` and adds `offset`
/// to the chip's base number.
pub fn lookup_line(chip_label: &str, offset: u32) -> Result<u32, MpmError> {
    let control_dir = Path::new(config::GPIO_CONTROL_DIR);
    for entry in fs_read_dir(control_dir)? {
        if !entry.starts_with("gpiochip") {
            continue;
        }
        let chip_dir = control_dir.join(&entry);
        let Ok(label) = fs_read_attr(&chip_dir.join("label")) else {
            continue;
        };
        if label == chip_label {
            let base: u32 = fs_read_attr(&chip_dir.join("base"))?
                .parse()
                .map_err(|_| {
                    MpmError::Hardware(format!("Unparseable base for gpiochip '{chip_label}'"))
                })?;
            let ngpio: u32 = fs_read_attr(&chip_dir.join("ngpio"))?
                .parse()
                .unwrap_or(u32::MAX);
            if offset >= ngpio {
                return Err(MpmError::Argument(format!(
                    "Line offset {offset} is outside gpiochip '{chip_label}' ({ngpio} lines)"
                )));
            }
            return Ok(base + offset);
        }
    }
    Err(MpmError::Argument(format!(
        "No gpiochip labelled '{chip_label}' found"
    )))
}
