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

//! Device-tree source handling for component updates.
//!
//! Incoming DTS images embed their compatibility claims as comments:
//!
//! ```text
//! // mpm_version fpga_current_version 5.2
//! // mpm_version fpga_oldest_compatible_version 5.0
//! ```
//!
//! These are parsed into per-component version windows and checked against
//! the daemon's own declared compatibility before anything is written.
//! After writing, the source is compiled to a `.dtbo` with the system `dtc`.

use crate::compat::CompatNumber;
use crate::error::MpmError;
use crate::update::ComponentCompat;
use log::{info, warn};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;

/// Version window a DTS image claims for one component.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionWindow {
    pub current: Option<CompatNumber>,
    pub oldest: Option<CompatNumber>,
}

/// Extract every `// mpm_version` tag from a DTS source.
///
/// Unparseable tags are a hard error: a DTS that advertises versions we
/// cannot read must not pass the gate by accident.
pub fn parse_version_tags(dts: &str) -> Result<BTreeMap<String, VersionWindow>, MpmError> {
    let mut windows: BTreeMap<String, VersionWindow> = BTreeMap::new();
    for line in dts.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("//") else {
            continue;
        };
        let mut fields = rest.split_whitespace();
        if fields.next() != Some("mpm_version") {
            continue;
        }
        let (Some(name), Some(version)) = (fields.next(), fields.next()) else {
            return Err(MpmError::Argument(format!(
                "Malformed mpm_version tag: '{line}'"
            )));
        };
        let version: CompatNumber = version.parse()?;
        if let Some(component) = name.strip_suffix("_current_version") {
            windows.entry(component.to_string()).or_default().current = Some(version);
        } else if let Some(component) = name.strip_suffix("_oldest_compatible_version") {
            windows.entry(component.to_string()).or_default().oldest = Some(version);
        } else {
            return Err(MpmError::Argument(format!(
                "Unrecognized mpm_version field '{name}'"
            )));
        }
    }
    Ok(windows)
}

/// Gate one component's claimed window against what the daemon is running.
///
/// The image is accepted iff its current major equals the running current
/// major and its oldest-compatible version does not exceed the running
/// current version. The check is direction-asymmetric: an image whose
/// *oldest* claim has a different (lower) major is accepted with a log line,
/// only its *current* major must match exactly. Minor mismatches warn.
pub fn check_component_compat(
    component: &str,
    window: &VersionWindow,
    running: &ComponentCompat,
) -> Result<(), MpmError> {
    let Some(image_current) = window.current else {
        // No claim for this component, nothing to gate on.
        return Ok(());
    };
    if image_current.major != running.current.major {
        return Err(MpmError::Argument(format!(
            "Image '{component}' version {image_current} is incompatible with running major {}",
            running.current.major
        )));
    }
    if image_current.minor != running.current.minor {
        warn!(
            "Image '{component}' version {image_current} differs from running {} in minor only",
            running.current
        );
    }
    if let Some(image_oldest) = window.oldest {
        if image_oldest > running.current {
            return Err(MpmError::Argument(format!(
                "Image '{component}' requires at least version {image_oldest}, running {}",
                running.current
            )));
        }
        if image_oldest.major != running.oldest.major {
            info!(
                "Image '{component}' oldest-compatible {image_oldest} differs from ours ({})",
                running.oldest
            );
        }
    }
    Ok(())
}

/// Compile a DTS source to a `.dtbo` using the system `dtc`.
///
/// # Returns: `Result<(), MpmError>`
/// * `Ok(())` - Compiler exited successfully
/// * `Err(MpmError::Internal)` - `dtc` could not be executed
/// * `Err(MpmError::Argument)` - Compiler reported a non-zero exit
pub fn compile_dts(dtc_command: &str, source: &Path, output: &Path) -> Result<(), MpmError> {
    let result = Command::new(dtc_command)
        .arg("-I")
        .arg("dts")
        .arg("-O")
        .arg("dtb")
        .arg("-o")
        .arg(output)
        .arg(source)
        .output()
        .map_err(|e| MpmError::Internal(format!("Could not execute {dtc_command}: {e}")))?;
    if !result.status.success() {
        return Err(MpmError::Argument(format!(
            "dtc failed on {source:?} with {}: {}",
            result.status,
            String::from_utf8_lossy(&result.stderr).trim()
        )));
    }
    Ok(())
}
