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

use clap::Parser;
use log::{error, info};
use mpmd::comm::discovery::DiscoveryServer;
use mpmd::comm::dispatcher::{Dispatcher, spawn_claim_expiry};
use mpmd::comm::rpc::RpcServer;
use mpmd::config::{self, Config};
use mpmd::log_buf::{self, LogRing};
use mpmd::periph::{self, PeripheralManager};
use mpmd::state::SharedState;
use mpmd::watchdog;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Notify;

#[derive(Parser, Debug)]
#[command(name = "mpmd")]
#[command(about = "Module peripheral manager daemon")]
struct Args {
    /// Disable the RPC-retrievable log buffer (console sink only).
    #[arg(long)]
    no_logbuf: bool,
    /// Run against the hardware-free mock peripheral manager.
    #[arg(long)]
    mock: bool,
    /// Path to the configuration file.
    #[arg(long, default_value = config::CONFIG_FILE_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut cfg = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Could not load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    cfg.mock |= args.mock;

    let ring = if args.no_logbuf || cfg.log_buf_size == 0 {
        None
    } else {
        Some(Arc::new(LogRing::new(cfg.log_buf_size)))
    };
    if let Err(e) = log_buf::init(ring.clone()) {
        eprintln!("Could not install logger: {e}");
        return ExitCode::FAILURE;
    }

    // Hardware inventory and bring-up. Any failure here is fatal; the daemon
    // never serves half-initialized hardware.
    periph::register_products();
    let mut pm = match periph::discover_pm(&cfg) {
        Ok(pm) => pm,
        Err(e) => {
            error!("Device discovery failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = pm.init() {
        error!("Hardware initialization failed: {e}");
        return ExitCode::FAILURE;
    }
    let device_info = pm.device_info();
    info!(
        "Serving {} serial {}",
        device_info.get("product").map(String::as_str).unwrap_or("?"),
        device_info.get("serial").map(String::as_str).unwrap_or("?"),
    );

    let state = Arc::new(SharedState::new(cfg.claim_timeout));
    let pm: Arc<Mutex<Box<dyn PeripheralManager>>> = Arc::new(Mutex::new(pm));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&state),
        ring.clone(),
        Arc::clone(&pm),
    ));
    let shutdown = Arc::new(Notify::new());

    let discovery = match DiscoveryServer::bind(
        &format!("0.0.0.0:{}", config::DISCOVERY_PORT),
        device_info,
        Arc::clone(&state),
    )
    .await
    {
        Ok(server) => server,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let rpc = match RpcServer::bind(
        &format!("0.0.0.0:{}", config::RPC_PORT),
        Arc::clone(&dispatcher),
        Arc::clone(&state),
    )
    .await
    {
        Ok(server) => server,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    state.set_system_ready(true);
    let watchdog_handle = watchdog::spawn(
        Arc::clone(&state),
        config::watchdog_timeout(),
        watchdog::notify_socket_from_env(),
    );
    let discovery_task = tokio::spawn(discovery.run(Arc::clone(&shutdown)));
    let rpc_task = tokio::spawn(rpc.run(Arc::clone(&shutdown)));
    let expiry_task = spawn_claim_expiry(Arc::clone(&state));

    wait_for_shutdown(&state).await;

    // Orderly exit: stop serving, then release the hardware, then let the
    // watchdog thread finish its final notification.
    state.set_system_ready(false);
    shutdown.notify_waiters();
    let _ = discovery_task.await;
    let _ = rpc_task.await;
    let _ = expiry_task.await;
    if let Err(e) = pm.lock().expect("pm lock poisoned").tear_down() {
        error!("Tear-down reported: {e}");
    }
    if watchdog_handle.join().is_err() {
        error!("Watchdog thread panicked");
    }
    info!("Clean shutdown");
    ExitCode::SUCCESS
}

/// Block until a termination signal arrives or `system_ready` is cleared
/// internally.
async fn wait_for_shutdown(state: &Arc<SharedState>) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("Could not install SIGTERM handler: {e}");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM, shutting down");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                if !state.system_ready() {
                    info!("system_ready cleared, shutting down");
                    break;
                }
            }
        }
    }
}
