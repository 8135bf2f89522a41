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

//! I²C and SPI bus adapter resolution.
//!
//! Chip drivers name their bus by the device-tree node name; this module
//! walks the corresponding sysfs class directories to find the character
//! device. A name matching zero or more than one adapter is a hard error, a
//! wrong guess here would poke registers on the wrong chip.

use crate::config;
use crate::error::MpmError;
use crate::sys::io::{fs_read_attr, fs_read_dir};
use log::trace;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

fn resolve_unique(
    class_dir: &Path,
    of_node_name: &str,
    kind: &str,
) -> Result<String, MpmError> {
    let mut matches: Vec<String> = Vec::new();
    for entry in fs_read_dir(class_dir)? {
        let of_name_path = class_dir.join(&entry).join("device/of_node/name");
        let Ok(name) = fs_read_attr(&of_name_path) else {
            continue;
        };
        if name == of_node_name {
            matches.push(entry);
        }
    }
    matches.sort();
    match matches.len() {
        0 => Err(MpmError::Argument(format!(
            "No {kind} adapter with OF node name '{of_node_name}' found"
        ))),
        1 => Ok(matches.remove(0)),
        n => Err(MpmError::Argument(format!(
            "OF node name '{of_node_name}' matches {n} {kind} adapters: {matches:?}"
        ))),
    }
}

/// Resolve an I²C adapter by its device-tree node name.
///
/// # Returns: `Result<PathBuf, MpmError>`
/// * `Ok(path)` - e.g. `/dev/i2c-3`
/// * `Err(MpmError::Argument)` - No match, or more than one
pub fn i2c_adapter_path(of_node_name: &str) -> Result<PathBuf, MpmError> {
    let entry = resolve_unique(
        Path::new(config::I2C_DEV_CLASS_DIR),
        of_node_name,
        "i2c",
    )?;
    let path = PathBuf::from("/dev").join(entry);
    trace!("Resolved i2c node '{of_node_name}' to {path:?}");
    Ok(path)
}

/// Resolve a SPI device by its device-tree node name.
///
/// # Returns: `Result<PathBuf, MpmError>`
/// * `Ok(path)` - e.g. `/dev/spidev1.0`
/// * `Err(MpmError::Argument)` - No match, or more than one
pub fn spi_device_path(of_node_name: &str) -> Result<PathBuf, MpmError> {
    let entry = resolve_unique(
        Path::new(config::SPIDEV_CLASS_DIR),
        of_node_name,
        "spi",
    )?;
    let path = PathBuf::from("/dev").join(entry);
    trace!("Resolved spi node '{of_node_name}' to {path:?}");
    Ok(path)
}

/// A single-writer bus. Acquisition is scoped: the guard releases on every
/// exit path, including panics mid-transaction.
pub struct SharedBus {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SharedBus {
    pub fn new(path: PathBuf) -> Self {
        SharedBus {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn acquire(&self) -> BusGuard<'_> {
        BusGuard {
            path: &self.path,
            _guard: self.lock.lock().expect("bus lock poisoned"),
        }
    }
}

/// Exclusive access to a bus device for the lifetime of the guard.
pub struct BusGuard<'a> {
    path: &'a Path,
    _guard: MutexGuard<'a, ()>,
}

impl BusGuard<'_> {
    pub fn path(&self) -> &Path {
        self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::io::{fs_create_dir, fs_write};
    use googletest::prelude::*;

    fn fake_class_dir(entries: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (entry, of_name) in entries {
            let of_dir = dir.path().join(entry).join("device/of_node");
            fs_create_dir(&of_dir).unwrap();
            fs_write(&of_dir.join("name"), true, format!("{of_name}\0")).unwrap();
        }
        dir
    }

    #[gtest]
    fn unique_match_resolves() {
        let dir = fake_class_dir(&[("i2c-0", "pmbus"), ("i2c-1", "db0_i2c")]);
        let entry = resolve_unique(dir.path(), "db0_i2c", "i2c").unwrap();
        expect_that!(entry, eq("i2c-1"));
    }

    #[gtest]
    fn missing_match_is_hard_error() {
        let dir = fake_class_dir(&[("i2c-0", "pmbus")]);
        expect_that!(
            resolve_unique(dir.path(), "db0_i2c", "i2c"),
            err(displays_as(contains_substring("No i2c adapter")))
        );
    }

    #[gtest]
    fn ambiguous_match_is_hard_error() {
        let dir = fake_class_dir(&[("i2c-0", "db_i2c"), ("i2c-1", "db_i2c")]);
        expect_that!(
            resolve_unique(dir.path(), "db_i2c", "i2c"),
            err(displays_as(contains_substring("matches 2 i2c adapters")))
        );
    }

    #[gtest]
    fn bus_guard_serializes_access() {
        let bus = SharedBus::new(PathBuf::from("/dev/spidev0.0"));
        let guard = bus.acquire();
        expect_that!(guard.path().to_str(), some(eq("/dev/spidev0.0")));
        drop(guard);
        // Reacquirable after release.
        let _second = bus.acquire();
    }
}
