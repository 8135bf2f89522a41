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

mod client;

use clap::{Parser, Subcommand};
use client::RpcClient;
use log::debug;
use rmpv::Value;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "mpm_cli")]
#[command(bin_name = "mpm_cli")]
struct Cli {
    #[arg(
        long = "addr",
        default_value = "127.0.0.1:49601",
        help = "RPC address of the daemon"
    )]
    addr: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Broadcast a discovery probe and list the devices that answered.
    Discover {
        #[arg(long, default_value = "255.255.255.255:49600")]
        broadcast: String,
        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,
    },
    /// List the daemon's RPC methods.
    Methods,
    /// Print the device descriptor.
    Info,
    /// Claim the device and print the token.
    Claim {
        #[arg(long, default_value = "mpm_cli")]
        session: String,
    },
    /// Release a claim.
    Unclaim { token: String },
    /// Call an arbitrary method. Arguments are coerced: integers, floats and
    /// booleans when they parse as such, strings otherwise.
    Call {
        method: String,
        args: Vec<String>,
        #[arg(long, help = "Claim token, passed as the first argument")]
        token: Option<String>,
    },
}

fn coerce(arg: &str) -> Value {
    if let Ok(v) = arg.parse::<u64>() {
        return Value::from(v);
    }
    if let Ok(v) = arg.parse::<i64>() {
        return Value::from(v);
    }
    if let Ok(v) = arg.parse::<f64>() {
        return Value::from(v);
    }
    match arg {
        "true" => Value::from(true),
        "false" => Value::from(false),
        _ => Value::from(arg),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();
    debug!("parsed cli command with {cli:?}");
    match cli.command {
        Commands::Discover {
            broadcast,
            timeout_ms,
        } => {
            let replies = client::discover(&broadcast, Duration::from_millis(timeout_ms))?;
            if replies.is_empty() {
                println!("no devices found");
            }
            for (peer, reply) in replies {
                println!("{}\t{reply}", peer.ip());
            }
        }
        Commands::Methods => {
            let listing = RpcClient::connect(&cli.addr)?.request("list_methods", vec![])?;
            for entry in listing.as_array().into_iter().flatten() {
                if let Some(fields) = entry.as_array() {
                    println!(
                        "{}{}\t{}",
                        fields[0].as_str().unwrap_or("?"),
                        if fields[2].as_bool().unwrap_or(false) {
                            " [token]"
                        } else {
                            ""
                        },
                        fields[1].as_str().unwrap_or(""),
                    );
                }
            }
        }
        Commands::Info => {
            let info = RpcClient::connect(&cli.addr)?.request("get_device_info", vec![])?;
            for (key, value) in info.as_map().into_iter().flatten() {
                println!("{}={}", key.as_str().unwrap_or("?"), value);
            }
        }
        Commands::Claim { session } => {
            let token = RpcClient::connect(&cli.addr)?
                .request("claim", vec![Value::from(session.as_str())])?;
            println!("{}", token.as_str().unwrap_or(""));
        }
        Commands::Unclaim { token } => {
            let released = RpcClient::connect(&cli.addr)?
                .request("unclaim", vec![Value::from(token.as_str())])?;
            println!("{released}");
        }
        Commands::Call {
            method,
            args,
            token,
        } => {
            let mut values: Vec<Value> = Vec::new();
            if let Some(token) = token {
                values.push(Value::from(token.as_str()));
            }
            values.extend(args.iter().map(|a| coerce(a)));
            let result = RpcClient::connect(&cli.addr)?.request(&method, values)?;
            println!("{result}");
        }
    }
    Ok(())
}
