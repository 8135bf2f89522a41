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

//! Xilinx `.bit` file handling.
//!
//! A `.bit` file carries a small tagged header in front of the raw
//! configuration body:
//!
//! ```text
//! u16   length of the initial field, always 0x0009
//! [9]   sync bytes
//! u16   0x0001
//! 'a'   u16 length, design name (NUL terminated)
//! 'b'   u16 length, part name
//! 'c'   u16 length, build date
//! 'd'   u16 length, build time
//! 'e'   u32 length, configuration body
//! ```
//!
//! All header integers are big-endian. The kernel FPGA manager wants only the
//! body (a `.bin`), optionally 32-bit byte-swapped for Zynq-style targets.

use crate::error::MpmError;

/// Parsed `.bit` header fields `a`..`e`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitFileHeader {
    pub design_name: String,
    pub part_name: String,
    pub date: String,
    pub time: String,
    pub body_offset: usize,
    pub body_len: usize,
}

fn take_u16(data: &[u8], offset: &mut usize) -> Result<u16, MpmError> {
    let bytes = data
        .get(*offset..*offset + 2)
        .ok_or_else(|| MpmError::Argument("Truncated .bit header".into()))?;
    *offset += 2;
    Ok(u16::from_be_bytes(bytes.try_into().unwrap()))
}

fn take_u32(data: &[u8], offset: &mut usize) -> Result<u32, MpmError> {
    let bytes = data
        .get(*offset..*offset + 4)
        .ok_or_else(|| MpmError::Argument("Truncated .bit header".into()))?;
    *offset += 4;
    Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
}

fn take_string(data: &[u8], offset: &mut usize) -> Result<String, MpmError> {
    let len = take_u16(data, offset)? as usize;
    let bytes = data
        .get(*offset..*offset + len)
        .ok_or_else(|| MpmError::Argument("Truncated .bit header string".into()))?;
    *offset += len;
    Ok(bytes
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect())
}

/// Parse the header of a `.bit` image.
///
/// # Returns: `Result<BitFileHeader, MpmError>`
/// * `Ok(BitFileHeader)` - Header fields plus body location
/// * `Err(MpmError::Argument)` - Field-0 length is not 0x0009, a key is out
///   of order, or any field is truncated
pub fn parse_bit_header(data: &[u8]) -> Result<BitFileHeader, MpmError> {
    let mut offset = 0usize;
    let field0_len = take_u16(data, &mut offset)?;
    if field0_len != 0x0009 {
        return Err(MpmError::Argument(format!(
            "Not a .bit file: initial field length is 0x{field0_len:04X}, expected 0x0009"
        )));
    }
    offset += 9; // sync field
    let _ = take_u16(data, &mut offset)?;

    let mut take_keyed_string = |expected: u8| -> Result<String, MpmError> {
        let key = *data
            .get(offset)
            .ok_or_else(|| MpmError::Argument("Truncated .bit header".into()))?;
        if key != expected {
            return Err(MpmError::Argument(format!(
                "Unexpected .bit header key '{}', expected '{}'",
                key as char, expected as char
            )));
        }
        offset += 1;
        take_string(data, &mut offset)
    };

    let design_name = take_keyed_string(b'a')?;
    let part_name = take_keyed_string(b'b')?;
    let date = take_keyed_string(b'c')?;
    let time = take_keyed_string(b'd')?;

    let key = *data
        .get(offset)
        .ok_or_else(|| MpmError::Argument("Truncated .bit header".into()))?;
    if key != b'e' {
        return Err(MpmError::Argument(format!(
            "Unexpected .bit header key '{}', expected 'e'",
            key as char
        )));
    }
    offset += 1;
    let body_len = take_u32(data, &mut offset)? as usize;
    if offset + body_len > data.len() {
        return Err(MpmError::Argument(format!(
            ".bit body length {body_len} overruns the file ({} bytes left)",
            data.len() - offset
        )));
    }

    Ok(BitFileHeader {
        design_name,
        part_name,
        date,
        time,
        body_offset: offset,
        body_len,
    })
}

/// Convert a `.bit` image into the raw `.bin` the FPGA manager consumes.
///
/// The body is preserved bit-exactly apart from the optional 32-bit byte
/// swap Zynq-style configuration ports require.
pub fn bit_to_bin(data: &[u8], swap_words: bool) -> Result<(BitFileHeader, Vec<u8>), MpmError> {
    let header = parse_bit_header(data)?;
    let body = &data[header.body_offset..header.body_offset + header.body_len];
    if !swap_words {
        return Ok((header, body.to_vec()));
    }
    if body.len() % 4 != 0 {
        return Err(MpmError::Argument(format!(
            "Cannot word-swap a body of {} bytes (not a multiple of 4)",
            body.len()
        )));
    }
    let mut swapped = Vec::with_capacity(body.len());
    for word in body.chunks_exact(4) {
        swapped.extend_from_slice(&[word[3], word[2], word[1], word[0]]);
    }
    Ok((header, swapped))
}

/// Assemble a minimal `.bit` image around `body`. The counterpart of
/// [`bit_to_bin`], used by the test suites and by bench tooling that needs
/// synthetic images.
pub fn build_bit_file(part_name: &str, body: &[u8]) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&0x0009u16.to_be_bytes());
    data.extend_from_slice(&[0x0F, 0xF0, 0x0F, 0xF0, 0x0F, 0xF0, 0x0F, 0xF0, 0x00]);
    data.extend_from_slice(&0x0001u16.to_be_bytes());
    for (key, value) in [
        (b'a', "top;UserID=0XFFFFFFFF"),
        (b'b', part_name),
        (b'c', "2025/06/01"),
        (b'd', "12:00:00"),
    ] {
        data.push(key);
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        data.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        data.extend_from_slice(&bytes);
    }
    data.push(b'e');
    data.extend_from_slice(&(body.len() as u32).to_be_bytes());
    data.extend_from_slice(body);
    data
}
