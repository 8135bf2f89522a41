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

//! mpmd: the module peripheral manager daemon.
//!
//! Runs on the embedded ARM inside a USRP-class device and mediates between
//! remote hosts and the on-device hardware: discovery over UDP, control over
//! MessagePack-RPC, exclusive access through a token claim, and safe
//! bring-up/tear-down of clocks, daughterboards and updateable components.

pub mod chips;
pub mod comm;
pub mod compat;
pub mod config;
pub mod dboard;
pub mod eeprom;
pub mod error;
pub mod log_buf;
pub mod periph;
pub mod poll;
pub mod sensors;
pub mod state;
pub mod sys;
pub mod update;
pub mod watchdog;
