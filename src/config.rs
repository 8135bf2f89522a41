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

use crate::error::MpmError;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// UDP port the discovery responder listens on.
pub const DISCOVERY_PORT: u16 = 49600;

/// TCP port the MessagePack-RPC server listens on.
pub const RPC_PORT: u16 = 49601;

/// Fixed probe payload a host broadcasts to enumerate devices.
pub const DISCOVERY_MAGIC: &[u8] = b"MPM-DISC";

/// Prefix of a diagnostic echo probe. The remainder of the payload
/// (up to [`ECHO_MAX_PAYLOAD`] bytes) is reflected back verbatim.
pub const ECHO_MAGIC: &[u8] = b"MPM-ECHO";

/// Upper bound on the arbitrary part of an echo probe.
pub const ECHO_MAX_PAYLOAD: usize = 8192;

/// Default location of the daemon configuration file.
pub static CONFIG_FILE_PATH: &str = "/etc/mpm.conf";

/// Root of the firmware tree; component images land in `<root>/<product>/`.
pub static FIRMWARE_DIR: &str = "/lib/firmware";

/// The default location of the device-tree overlay directory within the config
/// filesystem. Typically `/sys/kernel/config/device-tree/overlays/`, but often
/// remounted to `/config/device-tree/overlays/`.
pub static OVERLAY_CONTROL_DIR: &str = "/sys/kernel/config/device-tree/overlays/";

/// Where the kernel exposes nvmem providers (EEPROMs among them).
pub static NVMEM_DEVICES_DIR: &str = "/sys/bus/nvmem/devices/";

/// sysfs GPIO control directory.
pub static GPIO_CONTROL_DIR: &str = "/sys/class/gpio/";

/// sysfs class directory for UIO devices.
pub static UIO_CLASS_DIR: &str = "/sys/class/uio/";

/// sysfs class directory for i2c character devices.
pub static I2C_DEV_CLASS_DIR: &str = "/sys/class/i2c-dev/";

/// sysfs class directory for spidev character devices.
pub static SPIDEV_CLASS_DIR: &str = "/sys/class/spidev/";

/// Mounted-filesystem table consulted for mount idempotence.
pub static MTAB_PATH: &str = "/etc/mtab";

/// Watchdog timeout assumed when systemd does not provide `WATCHDOG_USEC`.
pub const DEFAULT_WATCHDOG_USEC: u64 = 30_000_000;

/// Number of records the RPC-retrievable log ring holds by default.
pub const DEFAULT_LOG_BUF_SIZE: usize = 100;

/// How long a claim survives without a `reclaim`, by default.
pub const DEFAULT_CLAIM_TIMEOUT_MS: u64 = 2000;

/// Runtime configuration, merged from (in increasing priority) hard
/// defaults, the `mpm.conf` file and `MPM_*` environment variables.
///
/// The file format is a small INI subset: `[section]` headers are accepted
/// and ignored, `key = value` pairs are collected, `#`/`;` start comments.
#[derive(Debug, Clone)]
pub struct Config {
    /// Size of the RPC log ring; 0 disables the ring entirely.
    pub log_buf_size: usize,
    /// Claim lease duration; a claim not reclaimed within this window expires.
    pub claim_timeout: Duration,
    /// Force the hardware-free mock peripheral manager.
    pub mock: bool,
    /// Override the product name detected from the motherboard EEPROM.
    pub product_override: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_buf_size: DEFAULT_LOG_BUF_SIZE,
            claim_timeout: Duration::from_millis(DEFAULT_CLAIM_TIMEOUT_MS),
            mock: false,
            product_override: None,
        }
    }
}

impl Config {
    /// Load configuration from `path`, then apply `MPM_*` environment
    /// overrides. A missing file is not an error; a malformed line is.
    pub fn load(path: &Path) -> Result<Config, MpmError> {
        let mut config = Config::default();
        if path.exists() {
            let text = crate::sys::io::fs_read(path)?;
            config.apply_pairs(&parse_ini(&text)?);
        } else {
            debug!("No config file at {path:?}, using defaults");
        }
        config.apply_env();
        Ok(config)
    }

    fn apply_pairs(&mut self, pairs: &BTreeMap<String, String>) {
        for (key, value) in pairs {
            self.apply_pair(key, value);
        }
    }

    fn apply_pair(&mut self, key: &str, value: &str) {
        match key {
            "log_buf_size" => match value.parse() {
                Ok(n) => self.log_buf_size = n,
                Err(_) => warn!("Ignoring non-numeric log_buf_size '{value}'"),
            },
            "claim_timeout_ms" => match value.parse() {
                Ok(ms) => self.claim_timeout = Duration::from_millis(ms),
                Err(_) => warn!("Ignoring non-numeric claim_timeout_ms '{value}'"),
            },
            "mock" => self.mock = matches!(value, "1" | "true" | "yes"),
            "product" => self.product_override = Some(value.to_string()),
            _ => debug!("Unknown config key '{key}' ignored"),
        }
    }

    fn apply_env(&mut self) {
        for (key, short) in [
            ("MPM_LOG_BUF_SIZE", "log_buf_size"),
            ("MPM_CLAIM_TIMEOUT_MS", "claim_timeout_ms"),
            ("MPM_MOCK", "mock"),
            ("MPM_PRODUCT", "product"),
        ] {
            if let Ok(value) = std::env::var(key) {
                debug!("Applying environment override {key}={value}");
                self.apply_pair(short, &value);
            }
        }
    }
}

/// Resolve the watchdog timeout from `WATCHDOG_USEC` (microseconds), falling
/// back to [`DEFAULT_WATCHDOG_USEC`] when unset or unparseable.
pub fn watchdog_timeout() -> Duration {
    let usec = std::env::var("WATCHDOG_USEC")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_WATCHDOG_USEC);
    Duration::from_micros(usec)
}

/// Parse the INI subset described on [`Config`] into a flat key/value map.
fn parse_ini(text: &str) -> Result<BTreeMap<String, String>, MpmError> {
    let mut pairs = BTreeMap::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(MpmError::Argument(format!(
                "Malformed config line {}: '{raw}'",
                lineno + 1
            )));
        };
        pairs.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;
    use rstest::*;

    #[gtest]
    fn parses_sections_comments_and_pairs() {
        let text = "# comment\n[mpm]\nlog_buf_size = 42\n; other\nclaim_timeout_ms=500\n";
        let pairs = parse_ini(text).unwrap();
        expect_that!(pairs.get("log_buf_size"), some(eq(&"42".to_string())));
        expect_that!(pairs.get("claim_timeout_ms"), some(eq(&"500".to_string())));
    }

    #[gtest]
    fn malformed_line_is_an_error() {
        let result = parse_ini("not a pair\n");
        assert_that!(
            result,
            err(displays_as(contains_substring("Malformed config line 1")))
        );
    }

    #[gtest]
    #[rstest]
    #[case("log_buf_size", "7")]
    #[case("claim_timeout_ms", "750")]
    #[case("mock", "true")]
    #[case("product", "carbide")]
    fn known_keys_apply(#[case] key: &str, #[case] value: &str) {
        let mut config = Config::default();
        config.apply_pair(key, value);
        match key {
            "log_buf_size" => expect_that!(config.log_buf_size, eq(7)),
            "claim_timeout_ms" => {
                expect_that!(config.claim_timeout, eq(Duration::from_millis(750)))
            }
            "mock" => expect_that!(config.mock, eq(true)),
            "product" => {
                expect_that!(config.product_override, some(eq(&"carbide".to_string())))
            }
            _ => unreachable!(),
        }
    }

    #[gtest]
    fn bad_numeric_value_keeps_default() {
        let mut config = Config::default();
        config.apply_pair("log_buf_size", "many");
        expect_that!(config.log_buf_size, eq(DEFAULT_LOG_BUF_SIZE));
    }
}
