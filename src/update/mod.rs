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

//! Component update handling: FPGA bitstreams, device-tree sources and other
//! updateable images.
//!
//! Every update runs the same state machine:
//!
//! ```text
//! IDLE ── stage ──▶ STAGED ── verify ──▶ VERIFIED | REJECTED
//! VERIFIED ── write to canonical path ──▶ WRITTEN
//! WRITTEN ── component.reset? ──▶ APPLYING ──▶ IDLE
//! REJECTED ──▶ IDLE (error surfaced via RPC)
//! ```
//!
//! Writes go to a temp file first and are renamed into place, so a failed or
//! interrupted update never leaves a half-written image at the canonical
//! path.

pub mod dts;
pub mod fpga_image;

use crate::compat::CompatNumber;
use crate::error::MpmError;
use crate::sys::io::fs_write_atomic;
use crate::update::fpga_image::bit_to_bin;
use log::{debug, info};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// States an in-flight update moves through; used for progress logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateState {
    Idle,
    Staged,
    Verified,
    Rejected,
    Written,
    Applying,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpdateState::Idle => "IDLE",
            UpdateState::Staged => "STAGED",
            UpdateState::Verified => "VERIFIED",
            UpdateState::Rejected => "REJECTED",
            UpdateState::Written => "WRITTEN",
            UpdateState::Applying => "APPLYING",
        };
        f.write_str(s)
    }
}

/// The compat window the daemon itself declares for one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentCompat {
    pub current: CompatNumber,
    pub oldest: CompatNumber,
}

/// Static description of one updateable component.
#[derive(Debug, Clone)]
pub struct UpdateableComponent {
    pub id: String,
    /// Canonical destination of the (possibly transformed) image.
    pub path: PathBuf,
    /// Secondary artifact, e.g. the `.dtbo` compiled from a DTS.
    pub output: Option<PathBuf>,
    /// Whether applying this component requires a peripheral manager restart.
    pub reset: bool,
    /// Gate the image's embedded `mpm_version` claims before writing.
    pub check_dts_for_compatibility: bool,
    /// 32-bit byte swap the FPGA body for the configuration port.
    pub swap_words: bool,
    pub compat: ComponentCompat,
}

/// What `update_component` reports back on success.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub id: String,
    pub written_path: PathBuf,
    pub needs_reset: bool,
}

/// Executes component updates against a fixed component table.
pub struct ComponentUpdater {
    product: String,
    dtc_command: String,
    components: BTreeMap<String, UpdateableComponent>,
}

impl ComponentUpdater {
    pub fn new(product: &str) -> Self {
        ComponentUpdater {
            product: product.to_string(),
            dtc_command: "dtc".to_string(),
            components: BTreeMap::new(),
        }
    }

    /// Use a different device-tree compiler binary (tests point this at a
    /// stub).
    pub fn with_dtc_command(mut self, command: &str) -> Self {
        self.dtc_command = command.to_string();
        self
    }

    pub fn add_component(&mut self, component: UpdateableComponent) {
        self.components.insert(component.id.clone(), component);
    }

    pub fn component_ids(&self) -> Vec<String> {
        self.components.keys().cloned().collect()
    }

    pub fn component(&self, id: &str) -> Option<&UpdateableComponent> {
        self.components.get(id)
    }

    fn transition(&self, id: &str, from: UpdateState, to: UpdateState) -> UpdateState {
        debug!("update '{id}': {from} -> {to}");
        to
    }

    /// Run one update through the state machine.
    ///
    /// `metadata` may carry a `filename` key whose extension selects the
    /// FPGA transform (`.bit` is converted, `.bin` copied verbatim); without
    /// it the image is sniffed.
    pub fn update(
        &self,
        id: &str,
        data: &[u8],
        metadata: &BTreeMap<String, String>,
    ) -> Result<UpdateOutcome, MpmError> {
        let component = self.components.get(id).ok_or_else(|| {
            MpmError::Argument(format!("'{id}' is not an updateable component"))
        })?;
        let mut state = self.transition(id, UpdateState::Idle, UpdateState::Staged);
        info!("Staged {} byte image for component '{id}'", data.len());

        let result = self.verify_and_write(component, data, metadata);
        match &result {
            Ok(_) => {
                state = self.transition(id, UpdateState::Staged, UpdateState::Verified);
                state = self.transition(id, state, UpdateState::Written);
                if component.reset {
                    state = self.transition(id, state, UpdateState::Applying);
                }
                self.transition(id, state, UpdateState::Idle);
            }
            Err(_) => {
                state = self.transition(id, state, UpdateState::Rejected);
                self.transition(id, state, UpdateState::Idle);
            }
        }
        result
    }

    fn verify_and_write(
        &self,
        component: &UpdateableComponent,
        data: &[u8],
        metadata: &BTreeMap<String, String>,
    ) -> Result<UpdateOutcome, MpmError> {
        match component.id.as_str() {
            "dts" => self.write_dts(component, data),
            _ => self.write_fpga_like(component, data, metadata),
        }
    }

    /// FPGA-style components: `.bit` images are transformed to raw `.bin`
    /// (with the part name checked against the product), `.bin` images are
    /// copied verbatim.
    fn write_fpga_like(
        &self,
        component: &UpdateableComponent,
        data: &[u8],
        metadata: &BTreeMap<String, String>,
    ) -> Result<UpdateOutcome, MpmError> {
        let is_bit = match metadata
            .get("filename")
            .and_then(|f| Path::new(f).extension())
            .and_then(|e| e.to_str())
        {
            Some("bit") => true,
            Some("bin") => false,
            Some(other) => {
                return Err(MpmError::Argument(format!(
                    "Unsupported image extension '.{other}' for component '{}'",
                    component.id
                )));
            }
            // No filename given: a .bit file always starts with the 0x0009
            // field length, a raw bitstream never does.
            None => data.len() >= 2 && data[0] == 0x00 && data[1] == 0x09,
        };

        let image = if is_bit {
            let (header, bin) = bit_to_bin(data, component.swap_words)?;
            if !header.part_name.contains(&self.product) {
                return Err(MpmError::Argument(format!(
                    "Image was built for part '{}', this device is a '{}'",
                    header.part_name, self.product
                )));
            }
            info!(
                "Converted .bit for part '{}' ({} body bytes)",
                header.part_name,
                bin.len()
            );
            bin
        } else {
            data.to_vec()
        };

        fs_write_atomic(&component.path, &image)?;
        info!("Wrote component '{}' to {:?}", component.id, component.path);
        Ok(UpdateOutcome {
            id: component.id.clone(),
            written_path: component.path.clone(),
            needs_reset: component.reset,
        })
    }

    /// DTS component: gate embedded version claims, persist the source, then
    /// compile it to the `.dtbo` the overlay machinery consumes.
    fn write_dts(
        &self,
        component: &UpdateableComponent,
        data: &[u8],
    ) -> Result<UpdateOutcome, MpmError> {
        let source = std::str::from_utf8(data)
            .map_err(|_| MpmError::Argument("DTS image is not valid UTF-8".into()))?;
        if component.check_dts_for_compatibility {
            let windows = dts::parse_version_tags(source)?;
            for (name, window) in &windows {
                // Components we don't know about are ignored; our components
                // missing from the image are tolerated.
                if let Some(known) = self.components.get(name) {
                    dts::check_component_compat(name, window, &known.compat)?;
                }
            }
        }
        fs_write_atomic(&component.path, data)?;
        if let Some(output) = &component.output {
            dts::compile_dts(&self.dtc_command, &component.path, output)?;
            info!("Compiled {:?} to {:?}", component.path, output);
        }
        Ok(UpdateOutcome {
            id: component.id.clone(),
            written_path: component.path.clone(),
            needs_reset: component.reset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::fpga_image::build_bit_file;
    use googletest::prelude::*;
    use std::path::Path;

    fn updater_with_fpga(dir: &Path, swap_words: bool) -> ComponentUpdater {
        let mut updater = ComponentUpdater::new("carbide");
        updater.add_component(UpdateableComponent {
            id: "fpga".to_string(),
            path: dir.join("fpga.bin"),
            output: None,
            reset: true,
            check_dts_for_compatibility: false,
            swap_words,
            compat: ComponentCompat {
                current: CompatNumber::new(5, 1),
                oldest: CompatNumber::new(5, 0),
            },
        });
        updater.add_component(UpdateableComponent {
            id: "dts".to_string(),
            path: dir.join("current.dts"),
            output: None,
            reset: false,
            check_dts_for_compatibility: true,
            swap_words: false,
            compat: ComponentCompat {
                current: CompatNumber::new(5, 1),
                oldest: CompatNumber::new(5, 0),
            },
        });
        updater
    }

    #[gtest]
    fn unknown_component_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let updater = updater_with_fpga(dir.path(), false);
        expect_that!(
            updater.update("bootloader", &[], &BTreeMap::new()),
            err(displays_as(contains_substring("not an updateable component")))
        );
    }

    #[gtest]
    fn bit_image_with_matching_part_is_transformed_and_written() {
        let dir = tempfile::tempdir().unwrap();
        let updater = updater_with_fpga(dir.path(), false);
        let body = [0xAA, 0xBB, 0xCC, 0xDD];
        let bit = build_bit_file("xc7z100-carbide-2", &body);
        let outcome = updater.update("fpga", &bit, &BTreeMap::new()).unwrap();
        expect_that!(outcome.needs_reset, eq(true));
        let written = std::fs::read(dir.path().join("fpga.bin")).unwrap();
        expect_that!(written, eq(body.to_vec()));
    }

    #[gtest]
    fn bit_image_with_wrong_part_is_rejected_and_nothing_written() {
        let dir = tempfile::tempdir().unwrap();
        let updater = updater_with_fpga(dir.path(), false);
        let bit = build_bit_file("xc7z100-sapphire-2", &[0; 4]);
        expect_that!(
            updater.update("fpga", &bit, &BTreeMap::new()),
            err(displays_as(contains_substring("this device is a 'carbide'")))
        );
        expect_that!(dir.path().join("fpga.bin").exists(), eq(false));
    }

    #[gtest]
    fn bin_image_is_copied_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let updater = updater_with_fpga(dir.path(), false);
        let raw = vec![0x01, 0x02, 0x03];
        let mut metadata = BTreeMap::new();
        metadata.insert("filename".to_string(), "carbide_100.bin".to_string());
        updater.update("fpga", &raw, &metadata).unwrap();
        expect_that!(std::fs::read(dir.path().join("fpga.bin")).unwrap(), eq(raw));
    }

    #[gtest]
    fn swap_words_is_applied_for_zynq_targets() {
        let dir = tempfile::tempdir().unwrap();
        let updater = updater_with_fpga(dir.path(), true);
        let bit = build_bit_file("xc7z100-carbide-2", &[0x11, 0x22, 0x33, 0x44]);
        updater.update("fpga", &bit, &BTreeMap::new()).unwrap();
        let written = std::fs::read(dir.path().join("fpga.bin")).unwrap();
        expect_that!(written, eq(vec![0x44, 0x33, 0x22, 0x11]));
    }

    #[gtest]
    fn unsupported_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let updater = updater_with_fpga(dir.path(), false);
        let mut metadata = BTreeMap::new();
        metadata.insert("filename".to_string(), "image.rpd".to_string());
        expect_that!(
            updater.update("fpga", &[0; 4], &metadata),
            err(displays_as(contains_substring("Unsupported image extension")))
        );
    }

    #[gtest]
    fn dts_with_compatible_claims_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let updater = updater_with_fpga(dir.path(), false);
        let dts = "// mpm_version fpga_current_version 5.3\n\
                   // mpm_version fpga_oldest_compatible_version 5.0\n\
                   /dts-v1/;\n";
        updater
            .update("dts", dts.as_bytes(), &BTreeMap::new())
            .unwrap();
        expect_that!(
            std::fs::read_to_string(dir.path().join("current.dts")).unwrap(),
            eq(dts)
        );
    }

    #[gtest]
    fn dts_with_wrong_major_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let updater = updater_with_fpga(dir.path(), false);
        let dts = "// mpm_version fpga_current_version 6.0\n/dts-v1/;\n";
        expect_that!(
            updater.update("dts", dts.as_bytes(), &BTreeMap::new()),
            err(displays_as(contains_substring("incompatible with running major")))
        );
        expect_that!(dir.path().join("current.dts").exists(), eq(false));
    }

    #[gtest]
    fn dts_claims_for_unknown_components_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let updater = updater_with_fpga(dir.path(), false);
        let dts = "// mpm_version gps_current_version 99.0\n/dts-v1/;\n";
        expect_that!(
            updater.update("dts", dts.as_bytes(), &BTreeMap::new()),
            ok(anything())
        );
    }
}
