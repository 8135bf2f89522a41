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

//! Userspace I/O register windows.
//!
//! A UIO device (`/dev/uioN`) exposes one memory-mappable register window per
//! map. This module opens the device, maps a declared length and provides
//! volatile 32-bit and 16-bit accessors. Whether the window is writable is
//! decided at map time and enforced by the type of the mapping, not checked
//! per access.

use crate::config;
use crate::error::MpmError;
use crate::sys::io::{fs_read_attr, fs_read_dir};
use log::trace;
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// Minimum (and granularity of) mappable window length.
pub const PAGE_SIZE: usize = 4096;

enum Mapping {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

/// An open, mapped UIO register window.
pub struct UioDevice {
    path: PathBuf,
    mapping: Mapping,
    len: usize,
}

impl UioDevice {
    /// Open `/dev/uioN` and map `len` bytes of its first map region.
    ///
    /// # Arguments
    ///
    /// * `path` - The UIO character device (e.g. `/dev/uio0`)
    /// * `len` - Window length; must be at least one page
    /// * `read_only` - Map without write permission; pokes will fail
    ///
    /// # Returns: `Result<UioDevice, MpmError>`
    /// * `Ok(UioDevice)` - Device mapped and ready for access
    /// * `Err(MpmError::Argument)` - `len` below one page
    /// * `Err(MpmError::IORead)` - Device could not be opened
    /// * `Err(MpmError::Hardware)` - mmap failed
    pub fn open(path: &Path, len: usize, read_only: bool) -> Result<UioDevice, MpmError> {
        if len < PAGE_SIZE {
            return Err(MpmError::Argument(format!(
                "UIO map length {len} is below the page size ({PAGE_SIZE})"
            )));
        }
        trace!("Mapping {len} bytes of {path:?} (read_only={read_only})");
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .map_err(|e| MpmError::IORead {
                file: path.into(),
                e,
            })?;
        let mapping = if read_only {
            // SAFETY: the kernel guarantees the UIO map region outlives the fd;
            // no other mapping of this window exists within the daemon.
            unsafe { MmapOptions::new().len(len).map(&file) }
                .map(Mapping::ReadOnly)
        } else {
            unsafe { MmapOptions::new().len(len).map_mut(&file) }
                .map(Mapping::ReadWrite)
        }
        .map_err(|e| MpmError::Hardware(format!("mmap of {path:?} failed: {e}")))?;
        Ok(UioDevice {
            path: path.to_owned(),
            mapping,
            len,
        })
    }

    pub fn read_only(&self) -> bool {
        matches!(self.mapping, Mapping::ReadOnly(..))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check_access(&self, offset: usize, width: usize) -> Result<(), MpmError> {
        if offset % width != 0 {
            return Err(MpmError::Argument(format!(
                "Offset 0x{offset:X} is not {width}-byte aligned"
            )));
        }
        if offset + width > self.len {
            return Err(MpmError::Argument(format!(
                "Offset 0x{offset:X} is outside the {} byte window of {:?}",
                self.len, self.path
            )));
        }
        Ok(())
    }

    fn base(&self) -> *const u8 {
        match &self.mapping {
            Mapping::ReadOnly(map) => map.as_ptr(),
            Mapping::ReadWrite(map) => map.as_ptr(),
        }
    }

    pub fn peek32(&self, offset: usize) -> Result<u32, MpmError> {
        self.check_access(offset, 4)?;
        // SAFETY: bounds and alignment checked above; volatile because the
        // window is device memory.
        Ok(unsafe { (self.base().add(offset) as *const u32).read_volatile() })
    }

    pub fn peek16(&self, offset: usize) -> Result<u16, MpmError> {
        self.check_access(offset, 2)?;
        Ok(unsafe { (self.base().add(offset) as *const u16).read_volatile() })
    }

    pub fn poke32(&mut self, offset: usize, value: u32) -> Result<(), MpmError> {
        self.check_access(offset, 4)?;
        let Mapping::ReadWrite(map) = &mut self.mapping else {
            return Err(MpmError::NotPermitted(format!(
                "{:?} was mapped read-only",
                self.path
            )));
        };
        unsafe { (map.as_mut_ptr().add(offset) as *mut u32).write_volatile(value) };
        Ok(())
    }

    pub fn poke16(&mut self, offset: usize, value: u16) -> Result<(), MpmError> {
        self.check_access(offset, 2)?;
        let Mapping::ReadWrite(map) = &mut self.mapping else {
            return Err(MpmError::NotPermitted(format!(
                "{:?} was mapped read-only",
                self.path
            )));
        };
        unsafe { (map.as_mut_ptr().add(offset) as *mut u16).write_volatile(value) };
        Ok(())
    }
}

/// Find the UIO device whose declared name matches `label`.
///
/// Scans `/sys/class/uio/uio*/name` and returns the matching character device
/// path together with the size of its first map region.
///
/// # Returns: `Result<(PathBuf, usize), MpmError>`
/// * `Ok((path, size))` - e.g. `("/dev/uio0", 0x10000)`
/// * `Err(MpmError::Argument)` - No device with that label
pub fn find_uio_device(label: &str) -> Result<(PathBuf, usize), MpmError> {
    let class_dir = Path::new(config::UIO_CLASS_DIR);
    for entry in fs_read_dir(class_dir)? {
        let name = fs_read_attr(&class_dir.join(&entry).join("name"))?;
        if name == label {
            let size_str = fs_read_attr(&class_dir.join(&entry).join("maps/map0/size"))?;
            let size = usize::from_str_radix(size_str.trim_start_matches("0x"), 16).map_err(
                |_| MpmError::Hardware(format!("Unparseable map size '{size_str}' for {entry}")),
            )?;
            return Ok((PathBuf::from("/dev").join(entry), size));
        }
    }
    Err(MpmError::Argument(format!(
        "No UIO device labelled '{label}' found"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;

    // A plain file stands in for /dev/uioN: mmap semantics are identical as
    // far as the accessors are concerned.
    fn backing_file(len: usize) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uio0");
        std::fs::write(&path, vec![0u8; len]).unwrap();
        (dir, path)
    }

    #[gtest]
    fn short_window_is_rejected() {
        let (_dir, path) = backing_file(PAGE_SIZE);
        let result = UioDevice::open(&path, 16, false);
        expect_that!(
            result,
            err(displays_as(contains_substring("below the page size")))
        );
    }

    #[gtest]
    fn poke_then_peek_roundtrips() {
        let (_dir, path) = backing_file(PAGE_SIZE);
        let mut dev = UioDevice::open(&path, PAGE_SIZE, false).unwrap();
        dev.poke32(0x10, 0xDEAD_BEEF).unwrap();
        expect_that!(dev.peek32(0x10).unwrap(), eq(0xDEAD_BEEF));
        dev.poke16(0x20, 0xA55A).unwrap();
        expect_that!(dev.peek16(0x20).unwrap(), eq(0xA55A));
    }

    #[gtest]
    fn read_only_mapping_refuses_pokes() {
        let (_dir, path) = backing_file(PAGE_SIZE);
        let mut dev = UioDevice::open(&path, PAGE_SIZE, true).unwrap();
        assert_that!(dev.read_only(), eq(true));
        expect_that!(dev.peek32(0).unwrap(), eq(0));
        expect_that!(
            dev.poke32(0, 1),
            err(displays_as(contains_substring("MpmError::NotPermitted")))
        );
    }

    #[gtest]
    fn out_of_bounds_and_misaligned_access_fail() {
        let (_dir, path) = backing_file(PAGE_SIZE);
        let dev = UioDevice::open(&path, PAGE_SIZE, true).unwrap();
        expect_that!(
            dev.peek32(PAGE_SIZE),
            err(displays_as(contains_substring("outside")))
        );
        expect_that!(
            dev.peek32(2),
            err(displays_as(contains_substring("aligned")))
        );
    }
}
