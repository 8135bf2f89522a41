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

//! TCA-style port expander driver.
//!
//! Each 8-bit port has an input, an output and a direction register. Output
//! and direction changes always write the whole port register in one access,
//! which is what makes per-port source switching transactional at the
//! hardware level.

use crate::chips::RegIo;
use crate::error::MpmError;
use std::sync::Mutex;

/// Pins per port.
pub const PORT_WIDTH: usize = 8;

mod regs {
    /// Per-port register stride; port N's registers start at N * STRIDE.
    pub const STRIDE: u16 = 0x10;
    pub const INPUT: u16 = 0x0;
    pub const OUTPUT: u16 = 0x1;
    pub const DIRECTION: u16 = 0x2;
}

pub struct PortExpander {
    io: Mutex<Box<dyn RegIo>>,
    num_ports: usize,
}

impl PortExpander {
    pub fn new(io: Box<dyn RegIo>, num_ports: usize) -> Self {
        PortExpander {
            io: Mutex::new(io),
            num_ports,
        }
    }

    pub fn num_ports(&self) -> usize {
        self.num_ports
    }

    fn port_reg(&self, port: usize, which: u16) -> Result<u16, MpmError> {
        if port >= self.num_ports {
            return Err(MpmError::Argument(format!(
                "Port {port} is out of range ({} ports)",
                self.num_ports
            )));
        }
        Ok(port as u16 * regs::STRIDE + which)
    }

    pub fn read_port(&self, port: usize) -> Result<u8, MpmError> {
        let reg = self.port_reg(port, regs::INPUT)?;
        let mut io = self.io.lock().expect("ioexp lock poisoned");
        Ok((io.peek(reg)? & 0xFF) as u8)
    }

    pub fn read_output(&self, port: usize) -> Result<u8, MpmError> {
        let reg = self.port_reg(port, regs::OUTPUT)?;
        let mut io = self.io.lock().expect("ioexp lock poisoned");
        Ok((io.peek(reg)? & 0xFF) as u8)
    }

    /// Set all eight output bits of `port` in a single register write.
    pub fn write_port(&self, port: usize, value: u8) -> Result<(), MpmError> {
        let reg = self.port_reg(port, regs::OUTPUT)?;
        let mut io = self.io.lock().expect("ioexp lock poisoned");
        io.poke(reg, value as u32)
    }

    /// Set the direction mask of `port` (bit set = output) in one write.
    pub fn set_directions(&self, port: usize, output_mask: u8) -> Result<(), MpmError> {
        let reg = self.port_reg(port, regs::DIRECTION)?;
        let mut io = self.io.lock().expect("ioexp lock poisoned");
        io.poke(reg, output_mask as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chips::MockRegIo;
    use googletest::prelude::*;

    fn expander() -> PortExpander {
        PortExpander::new(Box::new(MockRegIo::new()), 2)
    }

    #[gtest]
    fn whole_port_write_reads_back() {
        let exp = expander();
        exp.write_port(1, 0b1010_0101).unwrap();
        expect_that!(exp.read_output(1).unwrap(), eq(0b1010_0101));
    }

    #[gtest]
    fn out_of_range_port_is_rejected() {
        let exp = expander();
        expect_that!(
            exp.write_port(2, 0),
            err(displays_as(contains_substring("out of range")))
        );
    }

    #[gtest]
    fn directions_are_per_port() {
        let exp = expander();
        exp.set_directions(0, 0x0F).unwrap();
        exp.set_directions(1, 0xF0).unwrap();
        exp.write_port(0, 0x01).unwrap();
        expect_that!(exp.read_output(0).unwrap(), eq(0x01));
        expect_that!(exp.read_output(1).unwrap(), eq(0x00));
    }
}
