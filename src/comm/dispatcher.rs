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

//! The RPC method table.
//!
//! Methods are registered explicitly at construction: the framework entries
//! (claim lifecycle, introspection, update, reset) plus one entry per
//! peripheral-manager operation. Each entry carries its name, docstring and
//! whether the caller must present the claim token as the first argument.
//! Token checking happens here, before any handler runs; a handler never sees
//! the token.

use crate::dboard::CHANS_PER_DBOARD;
use crate::error::MpmError;
use crate::log_buf::LogRing;
use crate::periph::PeripheralManager;
use crate::state::SharedState;
use log::{debug, info};
use rmpv::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type RpcHandler = Box<dyn Fn(&[Value]) -> Result<Value, MpmError> + Send + Sync>;

pub struct MethodEntry {
    pub requires_token: bool,
    pub doc: String,
    handler: RpcHandler,
}

type SharedPm = Arc<Mutex<Box<dyn PeripheralManager>>>;

pub struct Dispatcher {
    methods: BTreeMap<String, MethodEntry>,
    state: Arc<SharedState>,
}

// --- argument extraction -------------------------------------------------

fn arg<'a>(args: &'a [Value], index: usize) -> Result<&'a Value, MpmError> {
    args.get(index)
        .ok_or_else(|| MpmError::Argument(format!("Missing argument {index}")))
}

fn arg_str<'a>(args: &'a [Value], index: usize) -> Result<&'a str, MpmError> {
    arg(args, index)?
        .as_str()
        .ok_or_else(|| MpmError::Argument(format!("Argument {index} must be a string")))
}

fn arg_usize(args: &[Value], index: usize) -> Result<usize, MpmError> {
    arg(args, index)?
        .as_u64()
        .map(|v| v as usize)
        .ok_or_else(|| MpmError::Argument(format!("Argument {index} must be an unsigned integer")))
}

fn arg_u32(args: &[Value], index: usize) -> Result<u32, MpmError> {
    arg(args, index)?
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| MpmError::Argument(format!("Argument {index} must fit in 32 bits")))
}

fn arg_f64(args: &[Value], index: usize) -> Result<f64, MpmError> {
    let value = arg(args, index)?;
    value
        .as_f64()
        .or_else(|| value.as_i64().map(|v| v as f64))
        .ok_or_else(|| MpmError::Argument(format!("Argument {index} must be a number")))
}

fn arg_bytes(args: &[Value], index: usize) -> Result<Vec<u8>, MpmError> {
    match arg(args, index)? {
        Value::Binary(bytes) => Ok(bytes.clone()),
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        _ => Err(MpmError::Argument(format!(
            "Argument {index} must be binary data"
        ))),
    }
}

fn arg_str_vec(args: &[Value], index: usize) -> Result<Vec<String>, MpmError> {
    arg(args, index)?
        .as_array()
        .ok_or_else(|| MpmError::Argument(format!("Argument {index} must be an array")))?
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| MpmError::Argument(format!("Argument {index} must hold strings")))
        })
        .collect()
}

fn arg_str_map(args: &[Value], index: usize) -> Result<BTreeMap<String, String>, MpmError> {
    let Some(pairs) = arg(args, index)?.as_map() else {
        return Err(MpmError::Argument(format!("Argument {index} must be a map")));
    };
    let mut map = BTreeMap::new();
    for (key, value) in pairs {
        let (Some(key), Some(value)) = (key.as_str(), value.as_str()) else {
            return Err(MpmError::Argument(format!(
                "Argument {index} must map strings to strings"
            )));
        };
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}

fn string_map_to_wire(map: &BTreeMap<String, String>) -> Value {
    Value::Map(
        map.iter()
            .map(|(k, v)| (Value::from(k.as_str()), Value::from(v.as_str())))
            .collect(),
    )
}

// --- dispatcher ----------------------------------------------------------

impl Dispatcher {
    /// Build the full method table over a ready peripheral manager.
    pub fn new(
        state: Arc<SharedState>,
        ring: Option<Arc<LogRing>>,
        pm: SharedPm,
    ) -> Self {
        let mut dispatcher = Dispatcher {
            methods: BTreeMap::new(),
            state,
        };
        dispatcher.register_framework_methods(ring, Arc::clone(&pm));
        dispatcher.register_pm_methods(pm);
        dispatcher
    }

    /// Add one entry; later registrations under the same name replace
    /// earlier ones.
    pub fn register(
        &mut self,
        name: &str,
        requires_token: bool,
        doc: &str,
        handler: RpcHandler,
    ) {
        self.methods.insert(
            name.to_string(),
            MethodEntry {
                requires_token,
                doc: doc.to_string(),
                handler,
            },
        );
    }

    /// Look up, authorize and run one method call.
    pub fn dispatch(&self, method: &str, args: &[Value]) -> Result<Value, MpmError> {
        let entry = self
            .methods
            .get(method)
            .ok_or_else(|| MpmError::UnknownMethod(method.to_string()))?;
        debug!("dispatching '{method}' ({} args)", args.len());
        if entry.requires_token {
            let token = arg_str(args, 0).map_err(|_| {
                MpmError::InvalidToken(format!(
                    "Method '{method}' requires the claim token as its first argument"
                ))
            })?;
            self.state.check_token(token)?;
            (entry.handler)(&args[1..])
        } else {
            (entry.handler)(args)
        }
    }

    pub fn method_names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    fn register_framework_methods(&mut self, ring: Option<Arc<LogRing>>, pm: SharedPm) {
        let state = Arc::clone(&self.state);
        self.register(
            "claim",
            false,
            "Claim the device; returns the claim token",
            Box::new(move |args| {
                let session_id = arg_str(args, 0)?;
                state.try_claim(session_id).map(Value::from)
            }),
        );

        let state = Arc::clone(&self.state);
        self.register(
            "reclaim",
            false,
            "Extend the claim deadline; returns whether the token matched",
            Box::new(move |args| Ok(Value::from(state.reclaim(arg_str(args, 0)?)))),
        );

        let state = Arc::clone(&self.state);
        self.register(
            "unclaim",
            false,
            "Release the claim; returns whether the token matched",
            Box::new(move |args| Ok(Value::from(state.unclaim(arg_str(args, 0)?)))),
        );

        self.register(
            "ping",
            false,
            "Liveness probe; echoes its optional payload",
            Box::new(|args| {
                Ok(match args.first() {
                    Some(payload) => payload.clone(),
                    None => Value::from("pong"),
                })
            }),
        );

        self.register(
            "get_log_buf",
            false,
            "Return and drain the buffered log records",
            Box::new(move |_args| {
                let records = match &ring {
                    Some(ring) => ring.drain(),
                    None => Vec::new(),
                };
                Ok(Value::Array(records.iter().map(|r| r.to_wire()).collect()))
            }),
        );

        let pm_info = Arc::clone(&pm);
        self.register(
            "get_device_info",
            false,
            "Device descriptor: product, serial, rev, ...",
            Box::new(move |_args| {
                let pm = pm_info.lock().expect("pm lock poisoned");
                Ok(string_map_to_wire(&pm.device_info()))
            }),
        );

        let pm_eeprom = Arc::clone(&pm);
        self.register(
            "get_mb_eeprom",
            false,
            "Decoded motherboard EEPROM fields",
            Box::new(move |_args| {
                let pm = pm_eeprom.lock().expect("pm lock poisoned");
                Ok(string_map_to_wire(&pm.mb_eeprom_info()))
            }),
        );

        let pm_update = Arc::clone(&pm);
        self.register(
            "update_component",
            true,
            "Stage, verify and write a component image",
            Box::new(move |args| {
                let id = arg_str(args, 0)?;
                let data = arg_bytes(args, 1)?;
                let metadata = if args.len() > 2 {
                    arg_str_map(args, 2)?
                } else {
                    BTreeMap::new()
                };
                let mut pm = pm_update.lock().expect("pm lock poisoned");
                let outcome = pm.updater().update(id, &data, &metadata)?;
                if outcome.needs_reset {
                    info!("Component '{id}' requires a restart, re-initializing");
                    pm.tear_down()?;
                    pm.init()?;
                }
                Ok(Value::Map(vec![
                    (
                        "path".into(),
                        Value::from(outcome.written_path.to_string_lossy().as_ref()),
                    ),
                    ("reset".into(), Value::from(outcome.needs_reset)),
                ]))
            }),
        );

        let pm_reset = Arc::clone(&pm);
        self.register(
            "reset",
            true,
            "Controlled restart of the peripheral manager",
            Box::new(move |_args| {
                let mut pm = pm_reset.lock().expect("pm lock poisoned");
                pm.tear_down()?;
                pm.init()?;
                Ok(Value::from(true))
            }),
        );

        // list_methods needs the finished table; registered last from new().
    }

    /// Close the table: build `list_methods` over everything registered so
    /// far (including itself).
    fn finalize(&mut self) {
        let mut listing: Vec<(String, String, bool)> = self
            .methods
            .iter()
            .map(|(name, entry)| (name.clone(), entry.doc.clone(), entry.requires_token))
            .collect();
        listing.push((
            "list_methods".to_string(),
            "Enumerate methods as (name, doc, requires_token)".to_string(),
            false,
        ));
        listing.sort();
        self.register(
            "list_methods",
            false,
            "Enumerate methods as (name, doc, requires_token)",
            Box::new(move |_args| {
                Ok(Value::Array(
                    listing
                        .iter()
                        .map(|(name, doc, requires_token)| {
                            Value::Array(vec![
                                Value::from(name.as_str()),
                                Value::from(doc.as_str()),
                                Value::from(*requires_token),
                            ])
                        })
                        .collect(),
                ))
            }),
        );
    }

    fn register_pm_methods(&mut self, pm: SharedPm) {
        let pm_sensors = Arc::clone(&pm);
        self.register(
            "enumerate_sensors",
            false,
            "Names of the motherboard sensors",
            Box::new(move |_args| {
                let pm = pm_sensors.lock().expect("pm lock poisoned");
                Ok(Value::Array(
                    pm.sensors().names().iter().map(|n| Value::from(n.as_str())).collect(),
                ))
            }),
        );

        let pm_sensor = Arc::clone(&pm);
        self.register(
            "get_sensor",
            false,
            "Read one motherboard sensor",
            Box::new(move |args| {
                let pm = pm_sensor.lock().expect("pm lock poisoned");
                Ok(pm.sensors().read(arg_str(args, 0)?)?.to_wire())
            }),
        );

        let pm_db_sensors = Arc::clone(&pm);
        self.register(
            "enumerate_db_sensors",
            false,
            "Names of one daughterboard's sensors",
            Box::new(move |args| {
                let slot = arg_usize(args, 0)?;
                let mut pm = pm_db_sensors.lock().expect("pm lock poisoned");
                let db = db_at(&mut pm, slot)?;
                Ok(Value::Array(
                    db.sensor_names().iter().map(|n| Value::from(n.as_str())).collect(),
                ))
            }),
        );

        let pm_db_sensor = Arc::clone(&pm);
        self.register(
            "get_db_sensor",
            false,
            "Read one daughterboard sensor",
            Box::new(move |args| {
                let slot = arg_usize(args, 0)?;
                let name = arg_str(args, 1)?.to_string();
                let mut pm = pm_db_sensor.lock().expect("pm lock poisoned");
                let db = db_at(&mut pm, slot)?;
                Ok(db.get_sensor(&name)?.to_wire())
            }),
        );

        let pm_num = Arc::clone(&pm);
        self.register(
            "get_num_dboards",
            false,
            "Number of populated daughterboard slots",
            Box::new(move |_args| {
                let pm = pm_num.lock().expect("pm lock poisoned");
                Ok(Value::from(pm.num_dboards() as u64))
            }),
        );

        let pm_components = Arc::clone(&pm);
        self.register(
            "get_updateable_components",
            false,
            "Ids accepted by update_component",
            Box::new(move |_args| {
                let pm = pm_components.lock().expect("pm lock poisoned");
                Ok(Value::Array(
                    pm.updater()
                        .component_ids()
                        .iter()
                        .map(|id| Value::from(id.as_str()))
                        .collect(),
                ))
            }),
        );

        // Tuning: channel indices are global, slot = chan / CHANS_PER_DBOARD.
        for (name, which) in [
            ("set_rx_freq", Tune::RxFreq),
            ("set_tx_freq", Tune::TxFreq),
            ("set_rx_gain", Tune::RxGain),
            ("set_tx_gain", Tune::TxGain),
        ] {
            let pm_tune = Arc::clone(&pm);
            self.register(
                name,
                true,
                "Tune a channel; returns the achieved value",
                Box::new(move |args| {
                    let chan = arg_usize(args, 0)?;
                    let target = arg_f64(args, 1)?;
                    let mut pm = pm_tune.lock().expect("pm lock poisoned");
                    let db = db_at(&mut pm, chan / CHANS_PER_DBOARD)?;
                    let db_chan = chan % CHANS_PER_DBOARD;
                    let achieved = match which {
                        Tune::RxFreq => db.set_rx_freq(db_chan, target)?,
                        Tune::TxFreq => db.set_tx_freq(db_chan, target)?,
                        Tune::RxGain => db.set_rx_gain(db_chan, target)?,
                        Tune::TxGain => db.set_tx_gain(db_chan, target)?,
                    };
                    Ok(Value::from(achieved))
                }),
            );
        }

        let pm_peek = Arc::clone(&pm);
        self.register(
            "db_peek",
            true,
            "Read a daughterboard register",
            Box::new(move |args| {
                let slot = arg_usize(args, 0)?;
                let addr = arg_u32(args, 1)? as u16;
                let mut pm = pm_peek.lock().expect("pm lock poisoned");
                let db = db_at(&mut pm, slot)?;
                Ok(Value::from(db.peek(addr)?))
            }),
        );

        let pm_poke = Arc::clone(&pm);
        self.register(
            "db_poke",
            true,
            "Write a daughterboard register",
            Box::new(move |args| {
                let slot = arg_usize(args, 0)?;
                let addr = arg_u32(args, 1)? as u16;
                let value = arg_u32(args, 2)?;
                let mut pm = pm_poke.lock().expect("pm lock poisoned");
                let db = db_at(&mut pm, slot)?;
                db.poke(addr, value)?;
                Ok(Value::Nil)
            }),
        );

        let pm_banks = Arc::clone(&pm);
        self.register(
            "get_gpio_banks",
            false,
            "Names of the GPIO source banks",
            Box::new(move |_args| {
                let pm = pm_banks.lock().expect("pm lock poisoned");
                Ok(Value::Array(
                    pm.gpio_banks().iter().map(|b| Value::from(b.as_str())).collect(),
                ))
            }),
        );

        let pm_srcs = Arc::clone(&pm);
        self.register(
            "get_gpio_srcs",
            false,
            "Valid sources for a GPIO bank",
            Box::new(move |args| {
                let pm = pm_srcs.lock().expect("pm lock poisoned");
                Ok(Value::Array(
                    pm.gpio_srcs(arg_str(args, 0)?)?
                        .iter()
                        .map(|s| Value::from(s.as_str()))
                        .collect(),
                ))
            }),
        );

        let pm_get_src = Arc::clone(&pm);
        self.register(
            "get_gpio_src",
            false,
            "Current source of every pin in a bank",
            Box::new(move |args| {
                let pm = pm_get_src.lock().expect("pm lock poisoned");
                Ok(Value::Array(
                    pm.get_gpio_src(arg_str(args, 0)?)?
                        .iter()
                        .map(|s| Value::from(s.as_str()))
                        .collect(),
                ))
            }),
        );

        let pm_set_src = Arc::clone(&pm);
        self.register(
            "set_gpio_src",
            true,
            "Route a whole GPIO bank; all pins or none",
            Box::new(move |args| {
                let bank = arg_str(args, 0)?.to_string();
                let sources = arg_str_vec(args, 1)?;
                let mut pm = pm_set_src.lock().expect("pm lock poisoned");
                pm.set_gpio_src(&bank, &sources)?;
                Ok(Value::Nil)
            }),
        );

        let pm_get_blob = Arc::clone(&pm);
        self.register(
            "get_user_eeprom_blob",
            true,
            "Read a blob from the user EEPROM region",
            Box::new(move |args| {
                let pm = pm_get_blob.lock().expect("pm lock poisoned");
                Ok(Value::Binary(pm.get_user_eeprom_blob(arg_str(args, 0)?)?))
            }),
        );

        let pm_set_blob = Arc::clone(&pm);
        self.register(
            "set_user_eeprom_blob",
            true,
            "Write a blob into the user EEPROM region",
            Box::new(move |args| {
                let key = arg_str(args, 0)?.to_string();
                let data = arg_bytes(args, 1)?;
                let mut pm = pm_set_blob.lock().expect("pm lock poisoned");
                pm.set_user_eeprom_blob(&key, data)?;
                Ok(Value::Nil)
            }),
        );

        self.finalize();
    }
}

#[derive(Clone, Copy)]
enum Tune {
    RxFreq,
    TxFreq,
    RxGain,
    TxGain,
}

fn db_at<'a>(
    pm: &'a mut std::sync::MutexGuard<'_, Box<dyn PeripheralManager>>,
    slot: usize,
) -> Result<&'a mut Box<dyn crate::dboard::Daughterboard>, MpmError> {
    let num = pm.num_dboards();
    pm.dboards()
        .get_mut(slot)
        .ok_or_else(|| MpmError::Argument(format!("No daughterboard in slot {slot} ({num} present)")))
}

/// Background task that lapses overdue claims at deadline granularity.
pub fn spawn_claim_expiry(state: Arc<SharedState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let granularity = (state.claim_timeout() / 4)
            .clamp(Duration::from_millis(50), Duration::from_secs(1));
        loop {
            tokio::time::sleep(granularity).await;
            if !state.system_ready() {
                break;
            }
            state.expire_claim_if_overdue();
        }
    })
}
