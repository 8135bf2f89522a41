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

//! EEPROM path resolution through the kernel nvmem subsystem.
//!
//! EEPROMs appear under `/sys/bus/nvmem/devices/<provider>/nvmem`. A provider
//! is matched either by its device-tree node name (`of_node/name`) or by its
//! directory name carrying the platform address prefix. Multiple matches are
//! legitimate here (a board revision may stack EEPROMs), so the result is an
//! ordered list and the caller decides.

use crate::error::MpmError;
use crate::sys::io::{fs_read_attr, fs_read_bytes, fs_read_dir};
use log::trace;
use std::path::{Path, PathBuf};

/// Return the ordered list of nvmem content paths matching `symbol`.
pub fn nvmem_paths_for_symbol(devices_dir: &Path, symbol: &str) -> Result<Vec<PathBuf>, MpmError> {
    let mut matches: Vec<PathBuf> = Vec::new();
    for entry in fs_read_dir(devices_dir)? {
        let provider_dir = devices_dir.join(&entry);
        let of_name = fs_read_attr(&provider_dir.join("of_node/name")).ok();
        if of_name.as_deref() == Some(symbol) || entry.starts_with(symbol) {
            matches.push(provider_dir.join("nvmem"));
        }
    }
    matches.sort();
    trace!("nvmem lookup for '{symbol}' found {} provider(s)", matches.len());
    Ok(matches)
}

/// Read the full content of the first nvmem provider matching `symbol`.
pub fn read_eeprom(devices_dir: &Path, symbol: &str) -> Result<Vec<u8>, MpmError> {
    let paths = nvmem_paths_for_symbol(devices_dir, symbol)?;
    let first = paths.first().ok_or_else(|| {
        MpmError::Argument(format!("No nvmem provider matching '{symbol}' found"))
    })?;
    fs_read_bytes(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::io::{fs_create_dir, fs_write, fs_write_bytes};
    use googletest::prelude::*;

    fn fake_provider(root: &Path, dir_name: &str, of_name: Option<&str>, content: &[u8]) {
        let provider = root.join(dir_name);
        fs_create_dir(&provider).unwrap();
        if let Some(of_name) = of_name {
            fs_create_dir(&provider.join("of_node")).unwrap();
            fs_write(&provider.join("of_node/name"), true, format!("{of_name}\0")).unwrap();
        }
        fs_write_bytes(&provider.join("nvmem"), true, content).unwrap();
    }

    #[gtest]
    fn matches_by_of_node_name_and_prefix() {
        let dir = tempfile::tempdir().unwrap();
        fake_provider(dir.path(), "1-00500", Some("mb_eeprom"), b"MB");
        fake_provider(dir.path(), "db0_eeprom2", None, b"DB");
        fake_provider(dir.path(), "2-00510", Some("other"), b"XX");

        let mb = nvmem_paths_for_symbol(dir.path(), "mb_eeprom").unwrap();
        assert_that!(mb.len(), eq(1));
        let db = nvmem_paths_for_symbol(dir.path(), "db0_eeprom").unwrap();
        assert_that!(db.len(), eq(1));
        expect_that!(read_eeprom(dir.path(), "mb_eeprom").unwrap(), eq(b"MB".to_vec()));
    }

    #[gtest]
    fn result_is_ordered() {
        let dir = tempfile::tempdir().unwrap();
        fake_provider(dir.path(), "user_eeprom1", None, b"B");
        fake_provider(dir.path(), "user_eeprom0", None, b"A");
        let paths = nvmem_paths_for_symbol(dir.path(), "user_eeprom").unwrap();
        assert_that!(paths.len(), eq(2));
        expect_that!(
            paths[0].to_string_lossy().contains("user_eeprom0"),
            eq(true)
        );
    }

    #[gtest]
    fn no_match_read_is_an_argument_error() {
        let dir = tempfile::tempdir().unwrap();
        expect_that!(
            read_eeprom(dir.path(), "mb_eeprom"),
            err(displays_as(contains_substring("No nvmem provider")))
        );
    }
}
