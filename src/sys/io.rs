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

//! Error Wrapping File System I/O Helpers
//!
//! Convenient wrappers around standard file system operations with automatic
//! conversion to `MpmError` types. All functions include trace logging and
//! carry the attempted path in the error. Sysfs attribute files, nvmem blobs
//! and firmware images all go through these helpers.

use crate::error::MpmError;
use log::trace;
use std::fs::OpenOptions;
use std::fs::{create_dir_all, remove_dir};
use std::io::{Read, Write};
use std::path::Path;

/// Read the contents of a file to a String.
///
/// # Returns: `Result<String, MpmError>`
/// * `Ok(String)` - The complete contents of the file
/// * `Err(MpmError::IORead)` - If the file cannot be read
pub fn fs_read(file_path: &Path) -> Result<String, MpmError> {
    trace!("Attempting to read from {file_path:?}");
    let mut buf: String = String::new();
    let result = OpenOptions::new()
        .read(true)
        .open(file_path)
        .and_then(|mut f| f.read_to_string(&mut buf));

    match result {
        Ok(_) => {
            trace!("Reading done");
            Ok(buf)
        }
        Err(e) => Err(MpmError::IORead {
            file: file_path.into(),
            e,
        }),
    }
}

/// Read a sysfs attribute: like [`fs_read`] but with trailing newlines and
/// NUL terminators stripped (driver virtual files often NUL-terminate
/// instead of EOF-terminating).
pub fn fs_read_attr(file_path: &Path) -> Result<String, MpmError> {
    fs_read(file_path).map(|s| s.trim_end_matches(['\n', '\0']).to_string())
}

/// Read the raw bytes of a file (nvmem content, firmware images).
///
/// # Returns: `Result<Vec<u8>, MpmError>`
/// * `Ok(Vec<u8>)` - The complete contents of the file
/// * `Err(MpmError::IORead)` - If the file cannot be read
pub fn fs_read_bytes(file_path: &Path) -> Result<Vec<u8>, MpmError> {
    trace!("Attempting to read bytes from {file_path:?}");
    let mut buf: Vec<u8> = Vec::new();
    let result = OpenOptions::new()
        .read(true)
        .open(file_path)
        .and_then(|mut f| f.read_to_end(&mut buf));

    match result {
        Ok(_) => Ok(buf),
        Err(e) => Err(MpmError::IORead {
            file: file_path.into(),
            e,
        }),
    }
}

/// Write a string value to a file.
///
/// # Arguments
///
/// * `file_path` - Path to the file to write
/// * `create` - If `true`, create the file if it doesn't exist; if `false`, the file must already exist
/// * `value` - The string value to write
///
/// # Returns: `Result<(), MpmError>`
/// * `Ok(())` - Write succeeded
/// * `Err(MpmError::IOWrite)` - If the write fails
pub fn fs_write(file_path: &Path, create: bool, value: impl AsRef<str>) -> Result<(), MpmError> {
    trace!(
        "Attempting to write {:?} to {:?}",
        value.as_ref(),
        file_path
    );
    let result = OpenOptions::new()
        .create(create)
        .read(false)
        .write(true)
        .open(file_path)
        .and_then(|mut f| write!(f, "{}", value.as_ref()));
    match result {
        Ok(_) => {
            trace!("Write done.");
            Ok(())
        }
        Err(e) => Err(MpmError::IOWrite {
            file: file_path.into(),
            e,
        }),
    }
}

/// Write binary data to a file, truncating any existing content.
///
/// # Returns: `Result<(), MpmError>`
/// * `Ok(())` - Write succeeded
/// * `Err(MpmError::IOWrite)` - If the write fails
pub fn fs_write_bytes(file_path: &Path, create: bool, data: &[u8]) -> Result<(), MpmError> {
    trace!("Attempting to write {} bytes to {file_path:?}", data.len());
    let result = OpenOptions::new()
        .create(create)
        .write(true)
        .truncate(true)
        .open(file_path)
        .and_then(|mut f| f.write_all(data));

    match result {
        Ok(_) => {
            trace!("Write done.");
            Ok(())
        }
        Err(e) => Err(MpmError::IOWrite {
            file: file_path.into(),
            e,
        }),
    }
}

/// Write binary data next to `file_path` and rename it into place.
///
/// Component images must never be observable half-written: the data lands in
/// `<name>.tmp` in the same directory (same filesystem, so the rename is
/// atomic) and only then replaces the destination.
///
/// # Returns: `Result<(), MpmError>`
/// * `Ok(())` - Data fully written and renamed into place
/// * `Err(MpmError::IOWrite)` - Write or rename failed; destination untouched
pub fn fs_write_atomic(file_path: &Path, data: &[u8]) -> Result<(), MpmError> {
    let mut tmp = file_path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp_path = Path::new(&tmp);
    fs_write_bytes(tmp_path, true, data)?;
    std::fs::rename(tmp_path, file_path).map_err(|e| {
        let _ = std::fs::remove_file(tmp_path);
        MpmError::IOWrite {
            file: file_path.into(),
            e,
        }
    })
}

/// Recursively create directories up to the specified path.
///
/// # Returns: `Result<(), MpmError>`
/// * `Ok(())` - Directory created (or already existed)
/// * `Err(MpmError::IOCreate)` - If directory creation fails
pub fn fs_create_dir(path: &Path) -> Result<(), MpmError> {
    trace!("Attempting to Create '{path:?}'");
    let result = create_dir_all(path);
    match result {
        Ok(_) => {
            trace!("Directory created at {path:?}.");
            Ok(())
        }
        Err(e) => Err(MpmError::IOCreate {
            file: path.into(),
            e,
        }),
    }
}

/// Remove an empty directory. Works correctly with configfs directories,
/// which reject recursive removal.
///
/// # Returns: `Result<(), MpmError>`
/// * `Ok(())` - Directory removed successfully
/// * `Err(MpmError::IODelete)` - If removal fails
pub fn fs_remove_dir(path: &Path) -> Result<(), MpmError> {
    trace!("Attempting to delete '{path:?}'");
    let result = remove_dir(path);
    match result {
        Ok(_) => {
            trace!("Deleted {path:?}");
            Ok(())
        }
        Err(e) => Err(MpmError::IODelete {
            file: path.into(),
            e,
        }),
    }
}

/// Read the contents of a directory and return entry names (not full paths).
/// Entries that cannot be read are silently skipped.
///
/// # Returns: `Result<Vec<String>, MpmError>`
/// * `Ok(Vec<String>)` - List of entry names in the directory
/// * `Err(MpmError::IOReadDir)` - If the directory cannot be read
pub fn fs_read_dir(dir: &Path) -> Result<Vec<String>, MpmError> {
    trace!("Attempting to read directory '{dir:?}'");
    std::fs::read_dir(dir).map_or_else(
        |e| {
            Err(MpmError::IOReadDir {
                dir: dir.to_owned(),
                e,
            })
        },
        |iter| {
            let ret = iter
                .filter_map(Result::ok)
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect();
            trace!("Dir reading done.");
            Ok(ret)
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;

    #[gtest]
    fn read_write_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attr");
        fs_write(&path, true, "operating\n").unwrap();
        expect_that!(fs_read(&path).unwrap(), eq("operating\n"));
        expect_that!(fs_read_attr(&path).unwrap(), eq("operating"));
    }

    #[gtest]
    fn attr_read_strips_nul_terminators() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compatible");
        fs_write_bytes(&path, true, b"acme,carbide\0").unwrap();
        expect_that!(fs_read_attr(&path).unwrap(), eq("acme,carbide"));
    }

    #[gtest]
    fn missing_file_read_is_io_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = fs_read(&dir.path().join("nope"));
        expect_that!(
            result,
            err(displays_as(contains_substring("MpmError::IORead")))
        );
    }

    #[gtest]
    fn write_without_create_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = fs_write(&dir.path().join("nope"), false, "x");
        expect_that!(
            result,
            err(displays_as(contains_substring("MpmError::IOWrite")))
        );
    }

    #[gtest]
    fn atomic_write_replaces_content_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fpga.bin");
        fs_write_atomic(&path, b"old image").unwrap();
        fs_write_atomic(&path, b"new image").unwrap();
        expect_that!(fs_read_bytes(&path).unwrap(), eq(&b"new image".to_vec()));
        let entries = fs_read_dir(dir.path()).unwrap();
        expect_that!(entries, elements_are![eq(&"fpga.bin".to_string())]);
    }
}
