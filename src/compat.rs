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

//! Compatibility numbers used to gate FPGA, device-tree and component updates.

use crate::error::MpmError;
use std::fmt;
use std::str::FromStr;

/// A `(major, minor)` compatibility number with total ordering: majors compare
/// first, minors break ties. A trailing build field (`X.Y.Z`) is accepted on
/// parse and discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompatNumber {
    pub major: u32,
    pub minor: u32,
}

impl CompatNumber {
    pub const fn new(major: u32, minor: u32) -> Self {
        CompatNumber { major, minor }
    }
}

impl fmt::Display for CompatNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for CompatNumber {
    type Err = MpmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.trim().split('.');
        let major = fields.next();
        let minor = fields.next();
        let build = fields.next();
        if fields.next().is_some() {
            return Err(MpmError::Argument(format!(
                "'{s}' is not a valid compat number (too many fields)"
            )));
        }
        let parse = |field: Option<&str>, name: &str| -> Result<u32, MpmError> {
            field
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| MpmError::Argument(format!("'{s}' has no numeric {name} field")))
        };
        let major = parse(major, "major")?;
        let minor = parse(minor, "minor")?;
        if let Some(build) = build {
            // Build numbers carry no compatibility meaning but must still be numeric.
            parse(Some(build), "build")?;
        }
        Ok(CompatNumber { major, minor })
    }
}
