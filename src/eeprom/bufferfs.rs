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

//! BufferFS: a small key-addressed blob store living inside the user region
//! of an EEPROM.
//!
//! The buffer is a sequence of entries, each aligned to a block boundary:
//!
//! ```text
//! {magic_tag:u8, key:asciiz, length:u32 LE, payload:[length], pad to alignment}
//! ```
//!
//! Keys are unique, total used space never exceeds `max_size`, and updates
//! that do not fit fail without modifying the store. Persistence is atomic at
//! the whole-buffer level: callers serialize with [`BufferFs::to_bytes`] and
//! write the entire region in one operation, never per entry.

use crate::error::MpmError;

/// Default block alignment of entries.
pub const BUFFERFS_ALIGNMENT: usize = 1024;

/// First byte of every live entry.
pub const ENTRY_MAGIC: u8 = 0xB5;

/// In-memory view of a BufferFS region.
#[derive(Debug, Clone)]
pub struct BufferFs {
    entries: Vec<(String, Vec<u8>)>,
    max_size: usize,
    alignment: usize,
}

fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

fn entry_size(key: &str, payload_len: usize, alignment: usize) -> usize {
    // magic + key + NUL + length field + payload
    align_up(1 + key.len() + 1 + 4 + payload_len, alignment)
}

fn validate_key(key: &str) -> Result<(), MpmError> {
    if key.is_empty() || !key.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(MpmError::Argument(format!(
            "BufferFS key '{key}' must be non-empty printable ASCII"
        )));
    }
    Ok(())
}

impl BufferFs {
    /// Create an empty store of `max_size` bytes with the given alignment.
    pub fn new(max_size: usize, alignment: usize) -> Result<Self, MpmError> {
        if alignment == 0 || max_size == 0 || max_size % alignment != 0 {
            return Err(MpmError::Argument(format!(
                "BufferFS size {max_size} must be a non-zero multiple of alignment {alignment}"
            )));
        }
        Ok(BufferFs {
            entries: Vec::new(),
            max_size,
            alignment,
        })
    }

    /// Parse an existing region. Scanning stops at the first byte that is not
    /// an entry magic; a fresh (erased) EEPROM region therefore parses as an
    /// empty store.
    pub fn from_bytes(buf: &[u8], alignment: usize) -> Result<Self, MpmError> {
        let mut fs = BufferFs::new(buf.len(), alignment)?;
        let mut offset = 0usize;
        while offset < buf.len() && buf[offset] == ENTRY_MAGIC {
            let key_start = offset + 1;
            let key_end = buf[key_start..]
                .iter()
                .position(|&b| b == 0)
                .map(|p| key_start + p)
                .ok_or_else(|| {
                    MpmError::Eeprom(format!("Unterminated BufferFS key at offset {offset}"))
                })?;
            let key = std::str::from_utf8(&buf[key_start..key_end])
                .ok()
                .filter(|k| k.bytes().all(|b| b.is_ascii_graphic()))
                .ok_or_else(|| {
                    MpmError::Eeprom(format!("Non-ASCII BufferFS key at offset {offset}"))
                })?
                .to_string();
            let len_start = key_end + 1;
            if len_start + 4 > buf.len() {
                return Err(MpmError::Eeprom(format!(
                    "Truncated BufferFS length field for key '{key}'"
                )));
            }
            let length =
                u32::from_le_bytes(buf[len_start..len_start + 4].try_into().unwrap()) as usize;
            let payload_start = len_start + 4;
            if payload_start + length > buf.len() {
                return Err(MpmError::Eeprom(format!(
                    "BufferFS entry '{key}' overruns the region"
                )));
            }
            if fs.entries.iter().any(|(k, _)| *k == key) {
                return Err(MpmError::Eeprom(format!(
                    "Duplicate BufferFS key '{key}'"
                )));
            }
            let payload = buf[payload_start..payload_start + length].to_vec();
            fs.entries.push((key, payload));
            offset += entry_size(&fs.entries.last().unwrap().0, length, alignment);
        }
        Ok(fs)
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Total bytes the current entries occupy once serialized.
    pub fn used_size(&self) -> usize {
        self.entries
            .iter()
            .map(|(key, payload)| entry_size(key, payload.len(), self.alignment))
            .sum()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn get_blob(&self, key: &str) -> Result<&[u8], MpmError> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, payload)| payload.as_slice())
            .ok_or_else(|| MpmError::Argument(format!("No BufferFS entry named '{key}'")))
    }

    /// Insert or replace a blob. Fails without modifying the store when the
    /// result would not fit in `max_size`.
    pub fn set_blob(&mut self, key: &str, payload: Vec<u8>) -> Result<(), MpmError> {
        validate_key(key)?;
        let others: usize = self
            .entries
            .iter()
            .filter(|(k, _)| k != key)
            .map(|(k, p)| entry_size(k, p.len(), self.alignment))
            .sum();
        let needed = others + entry_size(key, payload.len(), self.alignment);
        if needed > self.max_size {
            return Err(MpmError::Argument(format!(
                "Blob '{key}' does not fit: {needed} bytes needed, {} available",
                self.max_size
            )));
        }
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = payload,
            None => self.entries.push((key.to_string(), payload)),
        }
        Ok(())
    }

    pub fn remove_blob(&mut self, key: &str) -> Result<(), MpmError> {
        let position = self
            .entries
            .iter()
            .position(|(k, _)| k == key)
            .ok_or_else(|| MpmError::Argument(format!("No BufferFS entry named '{key}'")))?;
        self.entries.remove(position);
        Ok(())
    }

    /// Serialize the whole region, zero-padded to `max_size`. This is the
    /// unit of persistence.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.max_size];
        let mut offset = 0usize;
        for (key, payload) in &self.entries {
            buf[offset] = ENTRY_MAGIC;
            let key_start = offset + 1;
            buf[key_start..key_start + key.len()].copy_from_slice(key.as_bytes());
            let len_start = key_start + key.len() + 1;
            buf[len_start..len_start + 4]
                .copy_from_slice(&(payload.len() as u32).to_le_bytes());
            let payload_start = len_start + 4;
            buf[payload_start..payload_start + payload.len()].copy_from_slice(payload);
            offset += entry_size(key, payload.len(), self.alignment);
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;

    fn small_fs() -> BufferFs {
        BufferFs::new(4 * BUFFERFS_ALIGNMENT, BUFFERFS_ALIGNMENT).unwrap()
    }

    #[gtest]
    fn set_then_get_returns_value() {
        let mut fs = small_fs();
        fs.set_blob("cal_rx", b"rx calibration table".to_vec()).unwrap();
        expect_that!(
            fs.get_blob("cal_rx").unwrap(),
            eq(b"rx calibration table".as_slice())
        );
    }

    #[gtest]
    fn overwrite_returns_latest_value() {
        let mut fs = small_fs();
        fs.set_blob("k", b"v".to_vec()).unwrap();
        fs.set_blob("k", b"v2".to_vec()).unwrap();
        expect_that!(fs.get_blob("k").unwrap(), eq(b"v2".as_slice()));
        expect_that!(fs.keys().len(), eq(1));
    }

    #[gtest]
    fn unknown_key_is_not_found() {
        let fs = small_fs();
        expect_that!(
            fs.get_blob("missing"),
            err(displays_as(contains_substring("No BufferFS entry")))
        );
    }

    #[gtest]
    fn oversized_blob_is_rejected_and_store_unchanged() {
        let mut fs = small_fs();
        fs.set_blob("keep", b"ok".to_vec()).unwrap();
        let huge = vec![0u8; 4 * BUFFERFS_ALIGNMENT];
        expect_that!(
            fs.set_blob("big", huge),
            err(displays_as(contains_substring("does not fit")))
        );
        expect_that!(fs.keys(), elements_are![eq(&"keep".to_string())]);
        expect_that!(fs.get_blob("keep").unwrap(), eq(b"ok".as_slice()));
    }

    #[gtest]
    fn serialization_roundtrips_through_bytes() {
        let mut fs = small_fs();
        fs.set_blob("alpha", vec![1, 2, 3]).unwrap();
        fs.set_blob("beta", vec![0xFF; 100]).unwrap();
        let bytes = fs.to_bytes();
        assert_that!(bytes.len(), eq(fs.max_size()));
        let reparsed = BufferFs::from_bytes(&bytes, BUFFERFS_ALIGNMENT).unwrap();
        expect_that!(reparsed.get_blob("alpha").unwrap(), eq([1, 2, 3].as_slice()));
        expect_that!(reparsed.get_blob("beta").unwrap(), eq(vec![0xFF; 100].as_slice()));
    }

    #[gtest]
    fn erased_region_parses_empty() {
        let fs = BufferFs::from_bytes(&[0u8; 2048], BUFFERFS_ALIGNMENT).unwrap();
        expect_that!(fs.keys().is_empty(), eq(true));
    }

    #[gtest]
    fn entries_are_block_aligned() {
        let mut fs = small_fs();
        fs.set_blob("a", vec![9]).unwrap();
        fs.set_blob("b", vec![8]).unwrap();
        let bytes = fs.to_bytes();
        expect_that!(bytes[0], eq(ENTRY_MAGIC));
        expect_that!(bytes[BUFFERFS_ALIGNMENT], eq(ENTRY_MAGIC));
    }

    #[gtest]
    fn removal_frees_space() {
        let mut fs = BufferFs::new(BUFFERFS_ALIGNMENT, BUFFERFS_ALIGNMENT).unwrap();
        fs.set_blob("only", vec![0u8; 16]).unwrap();
        expect_that!(
            fs.set_blob("other", vec![0u8; 16]),
            err(anything())
        );
        fs.remove_blob("only").unwrap();
        expect_that!(fs.set_blob("other", vec![0u8; 16]), ok(anything()));
    }

    #[gtest]
    fn bad_keys_are_rejected() {
        let mut fs = small_fs();
        expect_that!(fs.set_blob("", vec![]), err(anything()));
        expect_that!(fs.set_blob("has space", vec![]), err(anything()));
    }
}
