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

//! Chip drivers: per-chip register maps and init/tune sequences.
//!
//! Every driver is generic over [`RegIo`], the transport that moves register
//! words. Real hardware goes through a UIO window or a bus character device;
//! the mock peripheral manager and the tests use [`MockRegIo`].

pub mod cpld;
pub mod ioexp;
pub mod lmk;

use crate::error::MpmError;
use crate::sys::uio::UioDevice;
use std::collections::BTreeMap;

/// Word-based register transport.
pub trait RegIo: Send {
    fn peek(&mut self, addr: u16) -> Result<u32, MpmError>;
    fn poke(&mut self, addr: u16, value: u32) -> Result<(), MpmError>;
}

/// Registers behind a UIO window; register addresses are word indices.
pub struct UioRegIo {
    dev: UioDevice,
}

impl UioRegIo {
    pub fn new(dev: UioDevice) -> Self {
        UioRegIo { dev }
    }
}

impl RegIo for UioRegIo {
    fn peek(&mut self, addr: u16) -> Result<u32, MpmError> {
        self.dev.peek32(addr as usize * 4)
    }

    fn poke(&mut self, addr: u16, value: u32) -> Result<(), MpmError> {
        self.dev.poke32(addr as usize * 4, value)
    }
}

/// In-memory register file. Reads of unwritten registers return the values
/// seeded at construction (so mock chips can present IDs and status bits).
#[derive(Debug, Default)]
pub struct MockRegIo {
    regs: BTreeMap<u16, u32>,
}

impl MockRegIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_regs(seed: &[(u16, u32)]) -> Self {
        MockRegIo {
            regs: seed.iter().copied().collect(),
        }
    }
}

impl RegIo for MockRegIo {
    fn peek(&mut self, addr: u16) -> Result<u32, MpmError> {
        Ok(self.regs.get(&addr).copied().unwrap_or(0))
    }

    fn poke(&mut self, addr: u16, value: u32) -> Result<(), MpmError> {
        self.regs.insert(addr, value);
        Ok(())
    }
}
