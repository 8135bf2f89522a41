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

//! Device tree overlay management through the Linux configfs mechanism.
//!
//! Overlays are managed in `/sys/kernel/config/device-tree/overlays/<handle>/`:
//! ```text
//! /sys/kernel/config/device-tree/overlays/my_overlay/
//! ├── dtbo       # Device tree blob
//! ├── path       # Write overlay source path here to apply; read to verify
//! └── status     # Read to check if overlay was applied successfully
//! ```
//!
//! Application flow: create the overlay directory, write the overlay source
//! path to the `path` file, then verify through both the `path` and `status`
//! files. Sometimes an overlay shows "applied" status but an empty path,
//! which indicates a failure.

use crate::config;
use crate::error::MpmError;
use crate::sys::io::{fs_create_dir, fs_read_attr, fs_remove_dir, fs_write};
use log::{info, trace};
use std::path::{Path, PathBuf};

/// One device tree overlay, identified by its configfs directory name.
#[derive(Debug)]
pub struct DtOverlay {
    handle: String,
    overlay_fs_path: PathBuf,
}

impl DtOverlay {
    pub fn new(handle: &str) -> Self {
        let overlay_fs_path = PathBuf::from(config::OVERLAY_CONTROL_DIR).join(handle);
        trace!("overlay_fs_path will be {overlay_fs_path:?}");
        DtOverlay {
            handle: handle.to_string(),
            overlay_fs_path,
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn overlay_fs_path(&self) -> &Path {
        &self.overlay_fs_path
    }

    fn vfs_status(&self) -> Result<String, MpmError> {
        fs_read_attr(&self.overlay_fs_path.join("status"))
    }

    fn vfs_path(&self) -> Result<PathBuf, MpmError> {
        fs_read_attr(&self.overlay_fs_path.join("path")).map(PathBuf::from)
    }

    /// Verify that the overlay took effect after writing the `path` file.
    fn check_applied(&self, source_path_rel: &Path) -> Result<(), MpmError> {
        let path_file_contents = self.vfs_path()?;
        if !path_file_contents.ends_with(source_path_rel) {
            return Err(MpmError::OverlayStatus(format!(
                "When trying to apply overlay '{source_path_rel:?}', the resulting vfs path contained '{path_file_contents:?}'"
            )));
        }
        let status = self.vfs_status()?;
        if !status.contains("applied") {
            return Err(MpmError::OverlayStatus(format!(
                "After writing to configfs, overlay status does not show 'applied'. Instead it is '{status}'"
            )));
        }
        info!("Overlay '{}' is applied", self.handle);
        Ok(())
    }

    /// Apply the overlay from `source_path_rel` (relative to the firmware
    /// search path). The overlay directory must not already exist.
    ///
    /// # Returns: `Result<(), MpmError>`
    /// * `Ok(())` - Overlay applied and verified
    /// * `Err(MpmError::Argument)` - Overlay with this handle already exists
    /// * `Err(MpmError::Internal)` - configfs didn't create the `path` file (not mounted?)
    /// * `Err(MpmError::OverlayStatus)` - Overlay didn't apply correctly
    pub fn apply(&self, source_path_rel: &Path) -> Result<(), MpmError> {
        if self.overlay_fs_path.exists() {
            return Err(MpmError::Argument(format!(
                "Overlay with this handle already exists at {:?}. \
                 Remove the overlay and try again.",
                self.overlay_fs_path
            )));
        }

        fs_create_dir(&self.overlay_fs_path)?;
        trace!("Created dir {:?}", self.overlay_fs_path);

        let overlay_path_file = self.overlay_fs_path.join("path");
        if !overlay_path_file.exists() {
            return Err(MpmError::Internal(format!(
                "Overlay at {:?} did not initialise a new overlay: \
                 the `path` virtual file did not get created by the kernel. \
                 Is the parent dir mounted as a configfs directory?",
                self.overlay_fs_path
            )));
        }

        fs_write(&overlay_path_file, false, source_path_rel.to_string_lossy())?;
        trace!("'{source_path_rel:?}' successfully written to {overlay_path_file:?}");
        self.check_applied(source_path_rel)
    }

    /// Idempotent apply: an overlay already in "applied" state is left alone,
    /// a half-applied one is removed and re-applied.
    pub fn apply_safe(&self, source_path_rel: &Path) -> Result<(), MpmError> {
        if self.overlay_fs_path.exists() {
            if self.is_applied() {
                info!("Overlay '{}' already applied, nothing to do", self.handle);
                return Ok(());
            }
            self.remove()?;
        }
        self.apply(source_path_rel)
    }

    /// Remove the overlay directory, deactivating the overlay and restoring
    /// the original device tree state.
    pub fn remove(&self) -> Result<(), MpmError> {
        fs_remove_dir(&self.overlay_fs_path)
    }

    /// Combined status string: `"<path-in-tree> <status>"`, or `"not present"`
    /// if the overlay directory doesn't exist.
    pub fn status(&self) -> Result<String, MpmError> {
        if !self.overlay_fs_path.exists() {
            return Ok("not present".into());
        }
        let path = self.vfs_path()?;
        let status = self.vfs_status()?;
        Ok(format!("{path:?} {status}"))
    }

    pub fn is_applied(&self) -> bool {
        self.vfs_status()
            .map(|s| s.contains("applied"))
            .unwrap_or(false)
    }
}
