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

use log::error;
use std::path::PathBuf;

/// Error codes as they appear in the error slot of an RPC response.
///
/// These are the only codes a remote caller ever sees; every [`MpmError`]
/// variant maps onto exactly one of them via [`MpmError::wire_code`].
pub mod wire_code {
    pub const INVALID_TOKEN: i64 = 1;
    pub const UNKNOWN_METHOD: i64 = 2;
    pub const BAD_ARGUMENT: i64 = 3;
    pub const HARDWARE_ERROR: i64 = 4;
    pub const NOT_PERMITTED: i64 = 5;
    pub const INTERNAL_ERROR: i64 = 6;
}

#[derive(Debug, thiserror::Error)]
pub enum MpmError {
    #[error("MpmError::InvalidToken: {0}")]
    InvalidToken(String),
    #[error("MpmError::UnknownMethod: no method named '{0}'")]
    UnknownMethod(String),
    #[error("MpmError::Argument: {0}")]
    Argument(String),
    #[error("MpmError::Hardware: {0}")]
    Hardware(String),
    #[error("MpmError::NotPermitted: {0}")]
    NotPermitted(String),
    #[error("MpmError::Eeprom: {0}")]
    Eeprom(String),
    #[error("MpmError::OverlayStatus: Overlay was not applied: {0}")]
    OverlayStatus(String),
    #[error("MpmError::IORead: An IO error occurred when reading from {file:?}: {e}")]
    IORead { file: PathBuf, e: std::io::Error },
    #[error("MpmError::IOWrite: An IO error occurred when writing to {file:?}: {e}")]
    IOWrite { file: PathBuf, e: std::io::Error },
    #[error("MpmError::IOCreate: An IO error occurred when creating {file:?}: {e}")]
    IOCreate { file: PathBuf, e: std::io::Error },
    #[error("MpmError::IODelete: An IO error occurred when deleting {file:?}: {e}")]
    IODelete { file: PathBuf, e: std::io::Error },
    #[error("MpmError::IOReadDir: An IO error occurred when reading directory {dir:?}: {e}")]
    IOReadDir { dir: PathBuf, e: std::io::Error },
    #[error("MpmError::Internal: An internal error occurred: {0}")]
    Internal(String),
}

impl MpmError {
    /// Map this error onto the wire-stable RPC error taxonomy.
    ///
    /// EEPROM format violations are argument errors from the caller's point of
    /// view (a bad image or blob was presented); all local I/O failures and
    /// overlay/readback mismatches surface as hardware errors.
    pub fn wire_code(&self) -> i64 {
        match self {
            MpmError::InvalidToken(..) => wire_code::INVALID_TOKEN,
            MpmError::UnknownMethod(..) => wire_code::UNKNOWN_METHOD,
            MpmError::Argument(..) | MpmError::Eeprom(..) => wire_code::BAD_ARGUMENT,
            MpmError::Hardware(..)
            | MpmError::OverlayStatus(..)
            | MpmError::IORead { .. }
            | MpmError::IOWrite { .. }
            | MpmError::IOCreate { .. }
            | MpmError::IODelete { .. }
            | MpmError::IOReadDir { .. } => wire_code::HARDWARE_ERROR,
            MpmError::NotPermitted(..) => wire_code::NOT_PERMITTED,
            MpmError::Internal(..) => wire_code::INTERNAL_ERROR,
        }
    }

    /// Render this error into the error slot of an RPC response: `[code, message]`.
    ///
    /// This is the only place errors are stringified for a remote caller; the
    /// full context stays in the log buffer.
    pub fn to_wire(&self) -> rmpv::Value {
        error!("{self}");
        rmpv::Value::Array(vec![
            rmpv::Value::from(self.wire_code()),
            rmpv::Value::from(self.to_string()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;

    #[gtest]
    fn wire_codes_are_stable() {
        expect_that!(MpmError::InvalidToken("x".into()).wire_code(), eq(1));
        expect_that!(MpmError::UnknownMethod("x".into()).wire_code(), eq(2));
        expect_that!(MpmError::Argument("x".into()).wire_code(), eq(3));
        expect_that!(MpmError::Eeprom("x".into()).wire_code(), eq(3));
        expect_that!(MpmError::Hardware("x".into()).wire_code(), eq(4));
        expect_that!(MpmError::NotPermitted("x".into()).wire_code(), eq(5));
        expect_that!(MpmError::Internal("x".into()).wire_code(), eq(6));
    }

    #[gtest]
    fn wire_error_carries_code_and_message() {
        let err = MpmError::Argument("bad blob".into());
        let wire = err.to_wire();
        let arr = wire.as_array().unwrap();
        assert_that!(arr.len(), eq(2));
        expect_that!(arr[0].as_i64(), some(eq(3)));
        expect_that!(
            arr[1].as_str().unwrap(),
            contains_substring("MpmError::Argument")
        );
    }
}
