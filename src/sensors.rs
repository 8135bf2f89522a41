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

//! Named, typed, read-only observables exposed over RPC.
//!
//! Subsystems contribute readers into a [`SensorRegistry`] at construction
//! time; nothing is grafted onto the peripheral manager after the fact.

use crate::error::MpmError;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorDataType {
    Integer,
    Realnum,
    Boolean,
    String,
}

impl SensorDataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorDataType::Integer => "INTEGER",
            SensorDataType::Realnum => "REALNUM",
            SensorDataType::Boolean => "BOOLEAN",
            SensorDataType::String => "STRING",
        }
    }
}

/// One sensor reading. `value` is the canonical string rendering; typed
/// callers re-parse according to `ty`.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorValue {
    pub name: String,
    pub ty: SensorDataType,
    pub unit: String,
    pub value: String,
}

impl SensorValue {
    pub fn integer(name: &str, value: i64, unit: &str) -> Self {
        SensorValue {
            name: name.to_string(),
            ty: SensorDataType::Integer,
            unit: unit.to_string(),
            value: value.to_string(),
        }
    }

    pub fn realnum(name: &str, value: f64, unit: &str) -> Self {
        SensorValue {
            name: name.to_string(),
            ty: SensorDataType::Realnum,
            unit: unit.to_string(),
            value: format!("{value}"),
        }
    }

    pub fn boolean(name: &str, value: bool) -> Self {
        SensorValue {
            name: name.to_string(),
            ty: SensorDataType::Boolean,
            unit: String::new(),
            value: value.to_string(),
        }
    }

    pub fn string(name: &str, value: &str, unit: &str) -> Self {
        SensorValue {
            name: name.to_string(),
            ty: SensorDataType::String,
            unit: unit.to_string(),
            value: value.to_string(),
        }
    }

    /// The reading a sensor method returns when its hardware is powered down
    /// or otherwise absent. Always well-formed, never an error.
    pub fn not_available(name: &str) -> Self {
        SensorValue::string(name, "n/a", "")
    }

    pub fn to_wire(&self) -> rmpv::Value {
        rmpv::Value::Map(vec![
            ("name".into(), rmpv::Value::from(self.name.as_str())),
            ("type".into(), rmpv::Value::from(self.ty.as_str())),
            ("unit".into(), rmpv::Value::from(self.unit.as_str())),
            ("value".into(), rmpv::Value::from(self.value.as_str())),
        ])
    }
}

/// Zero-argument sensor reader. Readers are infallible: hardware that cannot
/// currently answer must report [`SensorValue::not_available`].
pub type SensorFn = Box<dyn Fn() -> SensorValue + Send + Sync>;

/// Sensor name -> reader map owned by a peripheral manager.
#[derive(Default)]
pub struct SensorRegistry {
    readers: BTreeMap<String, SensorFn>,
}

impl SensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reader under `name`; a later registration under the same
    /// name replaces the earlier one.
    pub fn register(&mut self, name: &str, reader: SensorFn) {
        self.readers.insert(name.to_string(), reader);
    }

    pub fn names(&self) -> Vec<String> {
        self.readers.keys().cloned().collect()
    }

    pub fn read(&self, name: &str) -> Result<SensorValue, MpmError> {
        let reader = self.readers.get(name).ok_or_else(|| {
            MpmError::Argument(format!("No sensor named '{name}'"))
        })?;
        Ok(reader())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;

    #[gtest]
    fn registry_reads_and_enumerates() {
        let mut registry = SensorRegistry::new();
        registry.register(
            "temp",
            Box::new(|| SensorValue::realnum("temp", 41.5, "C")),
        );
        registry.register(
            "ref_locked",
            Box::new(|| SensorValue::boolean("ref_locked", true)),
        );
        expect_that!(
            registry.names(),
            elements_are![eq(&"ref_locked".to_string()), eq(&"temp".to_string())]
        );
        let reading = registry.read("temp").unwrap();
        expect_that!(reading.value, eq("41.5"));
        expect_that!(reading.ty, eq(SensorDataType::Realnum));
    }

    #[gtest]
    fn unknown_sensor_is_an_argument_error() {
        let registry = SensorRegistry::new();
        expect_that!(
            registry.read("gps_time"),
            err(displays_as(contains_substring("No sensor named")))
        );
    }

    #[gtest]
    fn not_available_reading_is_well_formed() {
        let reading = SensorValue::not_available("gps_locked");
        expect_that!(reading.value, eq("n/a"));
        expect_that!(reading.ty, eq(SensorDataType::String));
        let wire = reading.to_wire();
        assert_that!(wire.as_map().unwrap().len(), eq(4));
    }
}
