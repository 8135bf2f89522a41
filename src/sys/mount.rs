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

//! Programmatic mount and unmount of block devices, with `/etc/mtab` checks
//! for idempotence. Used for the recovery/update partitions some products
//! keep unmounted during normal operation.

use crate::config;
use crate::error::MpmError;
use crate::sys::io::fs_read;
use log::{info, trace};
use std::path::{Path, PathBuf};
use std::process::Command;

/// A mountable block device / mountpoint pair.
#[derive(Debug, Clone)]
pub struct MountPoint {
    device: PathBuf,
    mountpoint: PathBuf,
    fstype: String,
    options: Option<String>,
}

impl MountPoint {
    pub fn new(
        device: &Path,
        mountpoint: &Path,
        fstype: &str,
        options: Option<&str>,
    ) -> Self {
        MountPoint {
            device: device.to_owned(),
            mountpoint: mountpoint.to_owned(),
            fstype: fstype.to_string(),
            options: options.map(str::to_string),
        }
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Check `/etc/mtab` for an entry whose mountpoint matches ours.
    pub fn is_mounted(&self) -> Result<bool, MpmError> {
        let mtab = fs_read(Path::new(config::MTAB_PATH))?;
        Ok(mtab_contains(&mtab, &self.mountpoint))
    }

    /// Mount the device. Returns false (without running mount) when the
    /// mountpoint is already occupied.
    pub fn mount(&self) -> Result<bool, MpmError> {
        if self.is_mounted()? {
            trace!("{:?} already mounted", self.mountpoint);
            return Ok(false);
        }
        let mut cmd = Command::new("mount");
        cmd.arg("-t").arg(&self.fstype);
        if let Some(options) = &self.options {
            cmd.arg("-o").arg(options);
        }
        cmd.arg(&self.device).arg(&self.mountpoint);
        run_checked(cmd, "mount")?;
        info!("Mounted {:?} at {:?}", self.device, self.mountpoint);
        Ok(true)
    }

    /// Unmount. Returns false when nothing was mounted there.
    pub fn unmount(&self) -> Result<bool, MpmError> {
        if !self.is_mounted()? {
            trace!("{:?} not mounted, nothing to do", self.mountpoint);
            return Ok(false);
        }
        let mut cmd = Command::new("umount");
        cmd.arg(&self.mountpoint);
        run_checked(cmd, "umount")?;
        info!("Unmounted {:?}", self.mountpoint);
        Ok(true)
    }
}

fn mtab_contains(mtab: &str, mountpoint: &Path) -> bool {
    mtab.lines().any(|line| {
        line.split_whitespace()
            .nth(1)
            .is_some_and(|mp| Path::new(mp) == mountpoint)
    })
}

fn run_checked(mut cmd: Command, what: &str) -> Result<(), MpmError> {
    let output = cmd
        .output()
        .map_err(|e| MpmError::Internal(format!("Could not execute {what}: {e}")))?;
    if !output.status.success() {
        return Err(MpmError::Hardware(format!(
            "{what} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;

    #[gtest]
    fn mtab_parsing_matches_second_field() {
        let mtab = "\
/dev/mmcblk0p1 /boot vfat rw 0 0
configfs /sys/kernel/config configfs rw 0 0
/dev/mmcblk0p2 / ext4 rw 0 0
";
        expect_that!(mtab_contains(mtab, Path::new("/boot")), eq(true));
        expect_that!(
            mtab_contains(mtab, Path::new("/sys/kernel/config")),
            eq(true)
        );
        expect_that!(mtab_contains(mtab, Path::new("/data")), eq(false));
        // Device fields must not be confused with mountpoints.
        expect_that!(
            mtab_contains(mtab, Path::new("/dev/mmcblk0p1")),
            eq(false)
        );
    }
}
