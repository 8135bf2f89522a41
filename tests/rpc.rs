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

//! End-to-end exercises of the RPC server over real TCP connections.

use googletest::prelude::*;
use mpmd::comm::dispatcher::{Dispatcher, spawn_claim_expiry};
use mpmd::comm::rpc::RpcServer;
use mpmd::error::wire_code;
use mpmd::log_buf::LogRing;
use mpmd::periph::PeripheralManager;
use mpmd::periph::mock::MockPm;
use mpmd::state::SharedState;
use mpmd::update::fpga_image::build_bit_file;
use rmpv::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;

/// Minimal async MessagePack-RPC client for the tests.
struct TestClient {
    stream: TcpStream,
    buf: Vec<u8>,
    next_msgid: u64,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> TestClient {
        TestClient {
            stream: TcpStream::connect(addr).await.expect("connect failed"),
            buf: Vec::new(),
            next_msgid: 0,
        }
    }

    /// Returns `(error, result)` from the response frame.
    async fn call(&mut self, method: &str, args: Vec<Value>) -> (Value, Value) {
        let msgid = self.next_msgid;
        self.next_msgid += 1;
        let request = Value::Array(vec![
            Value::from(0u64),
            Value::from(msgid),
            Value::from(method),
            Value::Array(args),
        ]);
        let mut encoded = Vec::new();
        rmpv::encode::write_value(&mut encoded, &request).unwrap();
        self.stream.write_all(&encoded).await.unwrap();

        let mut chunk = [0u8; 4096];
        loop {
            if !self.buf.is_empty() {
                let mut cursor = std::io::Cursor::new(self.buf.as_slice());
                if let Ok(value) = rmpv::decode::read_value(&mut cursor) {
                    let used = cursor.position() as usize;
                    self.buf.drain(..used);
                    let fields = match value {
                        Value::Array(fields) => fields,
                        other => panic!("response is not an array: {other}"),
                    };
                    assert_eq!(fields[0].as_u64(), Some(1));
                    assert_eq!(fields[1].as_u64(), Some(msgid));
                    return (fields[2].clone(), fields[3].clone());
                }
            }
            let n = self.stream.read(&mut chunk).await.unwrap();
            assert_ne!(n, 0, "connection closed mid-response");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Like `call` but asserts success and returns the result.
    async fn call_ok(&mut self, method: &str, args: Vec<Value>) -> Value {
        let (error, result) = self.call(method, args).await;
        assert!(error.is_nil(), "{method} failed: {error}");
        result
    }

    async fn call_err_code(&mut self, method: &str, args: Vec<Value>) -> i64 {
        let (error, result) = self.call(method, args).await;
        assert!(result.is_nil());
        error.as_array().expect("no error array")[0]
            .as_i64()
            .expect("no error code")
    }
}

struct Fixture {
    addr: SocketAddr,
    state: Arc<SharedState>,
    shutdown: Arc<Notify>,
    scratch: PathBuf,
    _dir: tempfile::TempDir,
}

async fn start_server(claim_timeout: Duration) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let scratch = dir.path().to_owned();
    let mut pm = MockPm::with_dir(dir.path()).unwrap();
    pm.init().unwrap();
    let state = Arc::new(SharedState::new(claim_timeout));
    state.set_system_ready(true);
    let pm: Arc<Mutex<Box<dyn PeripheralManager>>> = Arc::new(Mutex::new(Box::new(pm)));
    let ring = Arc::new(LogRing::new(50));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&state),
        Some(ring),
        pm,
    ));
    let server = RpcServer::bind("127.0.0.1:0", dispatcher, Arc::clone(&state))
        .await
        .unwrap();
    let addr = server.local_addr();
    let shutdown = Arc::new(Notify::new());
    tokio::spawn(server.run(Arc::clone(&shutdown)));
    spawn_claim_expiry(Arc::clone(&state));
    Fixture {
        addr,
        state,
        shutdown,
        scratch,
        _dir: dir,
    }
}

#[gtest]
#[tokio::test]
async fn list_methods_has_tokenless_framework_surface() {
    let fixture = start_server(Duration::from_secs(1)).await;
    let mut client = TestClient::connect(fixture.addr).await;
    let listing = client.call_ok("list_methods", vec![]).await;
    let entries: std::collections::BTreeMap<String, bool> = listing
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| {
            let fields = entry.as_array().unwrap();
            (
                fields[0].as_str().unwrap().to_string(),
                fields[2].as_bool().unwrap(),
            )
        })
        .collect();
    for name in [
        "claim",
        "unclaim",
        "reclaim",
        "list_methods",
        "get_log_buf",
        "ping",
        "get_device_info",
    ] {
        assert_that!(entries.get(name), some(eq(&false)), "method {name}");
    }
}

#[gtest]
#[tokio::test]
async fn claim_cycle_over_the_wire() {
    let fixture = start_server(Duration::from_secs(1)).await;
    let mut client = TestClient::connect(fixture.addr).await;

    let tok1 = client
        .call_ok("claim", vec![Value::from("h1")])
        .await
        .as_str()
        .unwrap()
        .to_string();

    // Second claim, even from a second connection, is refused.
    let mut second = TestClient::connect(fixture.addr).await;
    let code = second.call_err_code("claim", vec![Value::from("h2")]).await;
    expect_that!(code, eq(wire_code::INVALID_TOKEN));

    let released = client
        .call_ok("unclaim", vec![Value::from(tok1.as_str())])
        .await;
    expect_that!(released.as_bool(), some(eq(true)));

    let tok2 = second.call_ok("claim", vec![Value::from("h2")]).await;
    expect_that!(tok2.as_str(), some(not(eq(tok1.as_str()))));
}

#[gtest]
#[tokio::test]
async fn token_methods_reject_foreign_tokens() {
    let fixture = start_server(Duration::from_secs(1)).await;
    let mut client = TestClient::connect(fixture.addr).await;
    let _tok = client.call_ok("claim", vec![Value::from("h1")]).await;
    let code = client
        .call_err_code(
            "set_rx_gain",
            vec![Value::from("wrong-token"), Value::from(0u64), Value::from(10.0)],
        )
        .await;
    expect_that!(code, eq(wire_code::INVALID_TOKEN));
}

#[gtest]
#[tokio::test]
async fn reclaim_keeps_claim_alive_and_silence_expires_it() {
    let fixture = start_server(Duration::from_millis(300)).await;
    let mut client = TestClient::connect(fixture.addr).await;
    let tok = client
        .call_ok("claim", vec![Value::from("h1")])
        .await
        .as_str()
        .unwrap()
        .to_string();

    // Reclaim at a quarter of the timeout: the claim must survive well past
    // several timeout windows.
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(75)).await;
        let ok = client
            .call_ok("reclaim", vec![Value::from(tok.as_str())])
            .await;
        assert_that!(ok.as_bool(), some(eq(true)));
    }

    // Stop reclaiming; the expiry task lapses the claim.
    tokio::time::sleep(Duration::from_millis(700)).await;
    expect_that!(fixture.state.claim_status(), eq(false));
    let retaken = client.call_ok("claim", vec![Value::from("h2")]).await;
    expect_that!(retaken.as_str(), some(anything()));
}

#[gtest]
#[tokio::test]
async fn requests_within_a_connection_are_answered_in_order() {
    let fixture = start_server(Duration::from_secs(1)).await;
    let mut client = TestClient::connect(fixture.addr).await;
    for i in 0..10u64 {
        let result = client
            .call_ok("ping", vec![Value::from(format!("seq-{i}"))])
            .await;
        expect_that!(result.as_str(), some(eq(format!("seq-{i}").as_str())));
    }
}

#[gtest]
#[tokio::test]
async fn fpga_update_writes_transformed_image() {
    let fixture = start_server(Duration::from_secs(1)).await;
    let mut client = TestClient::connect(fixture.addr).await;
    let tok = client
        .call_ok("claim", vec![Value::from("h1")])
        .await
        .as_str()
        .unwrap()
        .to_string();

    let body = [0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04];
    let bit = build_bit_file("xc7z045-mock-3", &body);
    client
        .call_ok(
            "update_component",
            vec![
                Value::from(tok.as_str()),
                Value::from("fpga"),
                Value::Binary(bit),
                Value::Map(vec![]),
            ],
        )
        .await;
    let written = std::fs::read(fixture.scratch.join("fpga.bin")).unwrap();
    expect_that!(written, eq(&body.to_vec()));

    // Mismatched part name is a BadArgument and leaves no image behind.
    let bad = build_bit_file("xc7z045-other-3", &body);
    let code = client
        .call_err_code(
            "update_component",
            vec![
                Value::from(tok.as_str()),
                Value::from("fpga"),
                Value::Binary(bad),
                Value::Map(vec![]),
            ],
        )
        .await;
    expect_that!(code, eq(wire_code::BAD_ARGUMENT));
}

#[gtest]
#[tokio::test]
async fn get_log_buf_returns_structured_records() {
    let fixture = start_server(Duration::from_secs(1)).await;
    let mut client = TestClient::connect(fixture.addr).await;
    let records = client.call_ok("get_log_buf", vec![]).await;
    assert_that!(records.is_array(), eq(true));
    for record in records.as_array().unwrap() {
        let keys: Vec<&str> = record
            .as_map()
            .unwrap()
            .iter()
            .map(|(k, _)| k.as_str().unwrap())
            .collect();
        expect_that!(
            keys,
            unordered_elements_are![
                eq(&"timestamp"),
                eq(&"level"),
                eq(&"source"),
                eq(&"message")
            ]
        );
    }
}

#[gtest]
#[tokio::test]
async fn shutdown_refuses_new_connections() {
    let fixture = start_server(Duration::from_secs(1)).await;
    // Healthy first.
    let mut client = TestClient::connect(fixture.addr).await;
    client.call_ok("ping", vec![]).await;

    fixture.state.set_system_ready(false);
    fixture.shutdown.notify_waiters();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let refused = TcpStream::connect(fixture.addr).await;
    expect_that!(refused.is_err(), eq(true));
}
