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

//! Tag-length-value EEPROM layout, used by daughterboards.
//!
//! Little-endian 12-byte header `{magic:u32, crc32:u32, size:u32}` followed
//! by `size` bytes of back-to-back records `{tag:u8, len:u8, value:[len]}`.
//! The CRC is computed over the `size` field and the TLV body, excluding the
//! magic and the CRC field itself. Magic mismatch, size exceeding the buffer,
//! CRC mismatch and an unrecognized length for a known tag all fail loudly.

use crate::error::MpmError;

/// `"USRP"` read as a little-endian u32.
pub const TLV_MAGIC: u32 = 0x5553_5250;

/// Header length: magic + crc + size.
pub const TLV_HEADER_LEN: usize = 12;

/// Known record tags.
pub mod tag {
    /// `{pid:u16, rev:u16, rev_compat:u16, serial:[u8;8]}`, little-endian.
    pub const BOARD_INFO: u8 = 0x10;
    /// One 6-byte MAC address.
    pub const MAC_ADDR: u8 = 0x11;
}

const BOARD_INFO_LEN: usize = 14;
const SERIAL_LEN: usize = 8;

/// One raw TLV record. Unknown tags are carried through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvRecord {
    pub tag: u8,
    pub value: Vec<u8>,
}

/// Parse a TLV image into its records, validating header and CRC.
pub fn parse_records(buf: &[u8]) -> Result<Vec<TlvRecord>, MpmError> {
    if buf.len() < TLV_HEADER_LEN {
        return Err(MpmError::Eeprom(format!(
            "TLV buffer too short for header: {} bytes",
            buf.len()
        )));
    }
    let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    if magic != TLV_MAGIC {
        return Err(MpmError::Eeprom(format!(
            "Bad TLV magic 0x{magic:08X}, expected 0x{TLV_MAGIC:08X}"
        )));
    }
    let stored_crc = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    let size = u32::from_le_bytes(buf[8..12].try_into().unwrap()) as usize;
    if size > buf.len() - TLV_HEADER_LEN {
        return Err(MpmError::Eeprom(format!(
            "TLV size field ({size}) exceeds buffer ({} bytes of payload)",
            buf.len() - TLV_HEADER_LEN
        )));
    }
    let body = &buf[TLV_HEADER_LEN..TLV_HEADER_LEN + size];
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[8..12]);
    hasher.update(body);
    let computed_crc = hasher.finalize();
    if stored_crc != computed_crc {
        return Err(MpmError::Eeprom(format!(
            "TLV CRC mismatch: stored 0x{stored_crc:08X}, computed 0x{computed_crc:08X}"
        )));
    }

    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset < body.len() {
        if offset + 2 > body.len() {
            return Err(MpmError::Eeprom(
                "Truncated TLV record header at end of body".into(),
            ));
        }
        let tag = body[offset];
        let len = body[offset + 1] as usize;
        offset += 2;
        if offset + len > body.len() {
            return Err(MpmError::Eeprom(format!(
                "TLV record 0x{tag:02X} overruns the body (len {len})"
            )));
        }
        records.push(TlvRecord {
            tag,
            value: body[offset..offset + len].to_vec(),
        });
        offset += len;
    }
    Ok(records)
}

/// Serialize records into a fresh TLV image, computing size and CRC.
pub fn serialize_records(records: &[TlvRecord]) -> Result<Vec<u8>, MpmError> {
    let mut body = Vec::new();
    for record in records {
        if record.value.len() > u8::MAX as usize {
            return Err(MpmError::Argument(format!(
                "TLV record 0x{:02X} value too long ({} bytes)",
                record.tag,
                record.value.len()
            )));
        }
        body.push(record.tag);
        body.push(record.value.len() as u8);
        body.extend_from_slice(&record.value);
    }
    let size = body.len() as u32;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&size.to_le_bytes());
    hasher.update(&body);
    let crc = hasher.finalize();

    let mut buf = Vec::with_capacity(TLV_HEADER_LEN + body.len());
    buf.extend_from_slice(&TLV_MAGIC.to_le_bytes());
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(&size.to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Decoded daughterboard identity, from the `BOARD_INFO` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbEeprom {
    pub pid: u16,
    pub rev: u16,
    pub rev_compat: u16,
    pub serial: String,
}

impl DbEeprom {
    pub fn to_record(&self) -> Result<TlvRecord, MpmError> {
        if self.serial.len() > SERIAL_LEN || !self.serial.is_ascii() {
            return Err(MpmError::Argument(format!(
                "Serial '{}' does not fit the {SERIAL_LEN} byte ASCII field",
                self.serial
            )));
        }
        let mut value = Vec::with_capacity(BOARD_INFO_LEN);
        value.extend_from_slice(&self.pid.to_le_bytes());
        value.extend_from_slice(&self.rev.to_le_bytes());
        value.extend_from_slice(&self.rev_compat.to_le_bytes());
        let mut serial = [0u8; SERIAL_LEN];
        serial[..self.serial.len()].copy_from_slice(self.serial.as_bytes());
        value.extend_from_slice(&serial);
        Ok(TlvRecord {
            tag: tag::BOARD_INFO,
            value,
        })
    }

    /// Serialize into a complete one-record TLV image.
    pub fn serialize(&self) -> Result<Vec<u8>, MpmError> {
        serialize_records(&[self.to_record()?])
    }
}

/// Parse a daughterboard EEPROM: a TLV image that must contain a well-formed
/// `BOARD_INFO` record. Unknown tags are tolerated and ignored.
pub fn parse_db_eeprom(buf: &[u8]) -> Result<DbEeprom, MpmError> {
    let records = parse_records(buf)?;
    let info = records
        .iter()
        .find(|r| r.tag == tag::BOARD_INFO)
        .ok_or_else(|| MpmError::Eeprom("TLV image carries no BOARD_INFO record".into()))?;
    if info.value.len() != BOARD_INFO_LEN {
        return Err(MpmError::Eeprom(format!(
            "BOARD_INFO record has length {}, expected {BOARD_INFO_LEN}",
            info.value.len()
        )));
    }
    let value = &info.value;
    let serial = value[6..6 + SERIAL_LEN]
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect::<String>();
    Ok(DbEeprom {
        pid: u16::from_le_bytes(value[0..2].try_into().unwrap()),
        rev: u16::from_le_bytes(value[2..4].try_into().unwrap()),
        rev_compat: u16::from_le_bytes(value[4..6].try_into().unwrap()),
        serial,
    })
}
