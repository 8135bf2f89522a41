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

//! Process-wide logging with two sinks: stderr for the console/journal and a
//! bounded ring that the `get_log_buf` RPC drains for centralized display on
//! the host side.
//!
//! The ring is handed around as an explicit `Arc<LogRing>` dependency; the
//! `log` macro facade only ever sees the installed [`MpmLogger`].

use log::{Level, LevelFilter, Metadata, Record};
use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// One immutable log record, as retrieved by `get_log_buf`.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub timestamp: SystemTime,
    pub level: Level,
    pub source: String,
    pub message: String,
}

impl LogRecord {
    /// Wire form: a string-keyed map with a float `timestamp` in epoch seconds.
    pub fn to_wire(&self) -> rmpv::Value {
        let secs = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        rmpv::Value::Map(vec![
            ("timestamp".into(), rmpv::Value::from(secs)),
            ("level".into(), rmpv::Value::from(self.level.as_str())),
            ("source".into(), rmpv::Value::from(self.source.as_str())),
            ("message".into(), rmpv::Value::from(self.message.as_str())),
        ])
    }
}

/// Bounded FIFO of log records. Once full, the oldest record is dropped for
/// each new one; records are immutable once enqueued.
pub struct LogRing {
    records: Mutex<VecDeque<LogRecord>>,
    capacity: usize,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        LogRing {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, record: LogRecord) {
        if self.capacity == 0 {
            return;
        }
        let mut records = self.records.lock().expect("log ring lock poisoned");
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Return and remove every buffered record, oldest first.
    pub fn drain(&self) -> Vec<LogRecord> {
        let mut records = self.records.lock().expect("log ring lock poisoned");
        records.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("log ring lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The installed `log::Log` implementation: formats to stderr at the
/// configured level and tees every enabled record into the ring.
pub struct MpmLogger {
    level: LevelFilter,
    ring: Option<Arc<LogRing>>,
}

impl log::Log for MpmLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = format!("{}", record.args());
        let source = record.target().to_string();
        let _ = writeln!(
            std::io::stderr(),
            "[{:<5}] [{}] {}",
            record.level(),
            source,
            message
        );
        if let Some(ring) = &self.ring {
            ring.push(LogRecord {
                timestamp: SystemTime::now(),
                level: record.level(),
                source,
                message,
            });
        }
    }

    fn flush(&self) {}
}

/// Install the global logger. `ring` is `None` when the operator passed
/// `--no-logbuf`. The level honors `RUST_LOG` when it parses as a plain level
/// name, defaulting to `info`.
pub fn init(ring: Option<Arc<LogRing>>) -> Result<(), log::SetLoggerError> {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);
    log::set_boxed_logger(Box::new(MpmLogger { level, ring }))?;
    log::set_max_level(level);
    Ok(())
}
