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

//! The MessagePack-RPC server.
//!
//! One task per TCP connection; within a connection requests are read,
//! dispatched and answered strictly in order. The wire format is
//! MessagePack-RPC v1: requests `[0, msgid, method, args]`, responses
//! `[1, msgid, error, result]` where `error` is `[code, message]` or nil.

use crate::comm::dispatcher::Dispatcher;
use crate::error::MpmError;
use crate::state::SharedState;
use log::{debug, info, warn};
use rmpv::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

const REQUEST_TYPE: u64 = 0;
const RESPONSE_TYPE: u64 = 1;

/// Try to pull one complete MessagePack value off the front of `buf`.
///
/// Returns `Ok(None)` when the buffer holds only a prefix of a value; the
/// connection task reads more and tries again.
fn try_decode(buf: &mut Vec<u8>) -> Result<Option<Value>, MpmError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut cursor = std::io::Cursor::new(buf.as_slice());
    match rmpv::decode::read_value(&mut cursor) {
        Ok(value) => {
            let used = cursor.position() as usize;
            buf.drain(..used);
            Ok(Some(value))
        }
        Err(e) if is_incomplete(&e) => Ok(None),
        Err(e) => Err(MpmError::Argument(format!("Undecodable RPC frame: {e}"))),
    }
}

fn is_incomplete(e: &rmpv::decode::Error) -> bool {
    use rmpv::decode::Error;
    match e {
        Error::InvalidMarkerRead(io) | Error::InvalidDataRead(io) => {
            io.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

/// Split a decoded request into `(msgid, method, args)`.
fn parse_request(value: Value) -> Result<(u64, String, Vec<Value>), MpmError> {
    let Value::Array(mut fields) = value else {
        return Err(MpmError::Argument("RPC request is not an array".into()));
    };
    if fields.len() != 4 {
        return Err(MpmError::Argument(format!(
            "RPC request has {} fields, expected 4",
            fields.len()
        )));
    }
    let args = match fields.pop().unwrap() {
        Value::Array(args) => args,
        _ => return Err(MpmError::Argument("RPC args field is not an array".into())),
    };
    let method = fields
        .pop()
        .unwrap()
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| MpmError::Argument("RPC method field is not a string".into()))?;
    let msgid = fields
        .pop()
        .unwrap()
        .as_u64()
        .ok_or_else(|| MpmError::Argument("RPC msgid field is not an integer".into()))?;
    let msg_type = fields
        .pop()
        .unwrap()
        .as_u64()
        .ok_or_else(|| MpmError::Argument("RPC type field is not an integer".into()))?;
    if msg_type != REQUEST_TYPE {
        return Err(MpmError::Argument(format!(
            "RPC message type {msg_type} is not a request"
        )));
    }
    Ok((msgid, method, args))
}

fn encode_response(msgid: u64, result: Result<Value, MpmError>) -> Vec<u8> {
    let (error, result) = match result {
        Ok(value) => (Value::Nil, value),
        Err(e) => (e.to_wire(), Value::Nil),
    };
    let response = Value::Array(vec![
        Value::from(RESPONSE_TYPE),
        Value::from(msgid),
        error,
        result,
    ]);
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &response)
        .expect("encoding a response into a Vec cannot fail");
    buf
}

pub struct RpcServer {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    state: Arc<SharedState>,
}

impl RpcServer {
    pub async fn bind(
        addr: &str,
        dispatcher: Arc<Dispatcher>,
        state: Arc<SharedState>,
    ) -> Result<RpcServer, MpmError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| MpmError::Internal(format!("Could not bind RPC socket {addr}: {e}")))?;
        info!("RPC server listening on {}", listener.local_addr().unwrap());
        Ok(RpcServer {
            listener,
            dispatcher,
            state,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr().expect("listener has no address")
    }

    /// Accept loop; returns when `shutdown` fires, dropping the listener so
    /// the port refuses further connections.
    pub async fn run(self, shutdown: Arc<Notify>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("RPC connection from {peer}");
                            let dispatcher = Arc::clone(&self.dispatcher);
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, dispatcher, state).await {
                                    debug!("RPC connection from {peer} closed: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            warn!("RPC accept failed: {e}");
                        }
                    }
                }
                _ = shutdown.notified() => {
                    info!("RPC server shutting down");
                    break;
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    dispatcher: Arc<Dispatcher>,
    state: Arc<SharedState>,
) -> Result<(), MpmError> {
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        // Serve every complete request already buffered, strictly in order.
        while let Some(request) = try_decode(&mut buf)? {
            let (msgid, method, args) = parse_request(request)?;
            let result = if state.system_ready() {
                dispatcher.dispatch(&method, &args)
            } else {
                Err(MpmError::Internal("Daemon is shutting down".into()))
            };
            let response = encode_response(msgid, result);
            stream.write_all(&response).await.map_err(|e| {
                MpmError::Internal(format!("Could not write RPC response: {e}"))
            })?;
        }
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| MpmError::Internal(format!("RPC read failed: {e}")))?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;

    fn encode_request(msgid: u64, method: &str, args: Vec<Value>) -> Vec<u8> {
        let request = Value::Array(vec![
            Value::from(REQUEST_TYPE),
            Value::from(msgid),
            Value::from(method),
            Value::Array(args),
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &request).unwrap();
        buf
    }

    #[gtest]
    fn partial_frames_wait_for_more_bytes() {
        let full = encode_request(7, "ping", vec![]);
        let mut buf = full[..full.len() - 3].to_vec();
        expect_that!(try_decode(&mut buf).unwrap(), none());
        buf.extend_from_slice(&full[full.len() - 3..]);
        let value = try_decode(&mut buf).unwrap().unwrap();
        let (msgid, method, args) = parse_request(value).unwrap();
        expect_that!(msgid, eq(7));
        expect_that!(method, eq("ping"));
        expect_that!(args.is_empty(), eq(true));
        expect_that!(buf.is_empty(), eq(true));
    }

    #[gtest]
    fn pipelined_frames_decode_in_order() {
        let mut buf = encode_request(1, "a", vec![]);
        buf.extend(encode_request(2, "b", vec![]));
        let first = parse_request(try_decode(&mut buf).unwrap().unwrap()).unwrap();
        let second = parse_request(try_decode(&mut buf).unwrap().unwrap()).unwrap();
        expect_that!(first.0, eq(1));
        expect_that!(second.0, eq(2));
        expect_that!(try_decode(&mut buf).unwrap(), none());
    }

    #[gtest]
    fn malformed_requests_are_rejected() {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &Value::from("not an array")).unwrap();
        let value = try_decode(&mut buf).unwrap().unwrap();
        expect_that!(
            parse_request(value),
            err(displays_as(contains_substring("not an array")))
        );

        // A response-typed message must not dispatch.
        let response = Value::Array(vec![
            Value::from(RESPONSE_TYPE),
            Value::from(1u64),
            Value::Nil,
            Value::Nil,
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &response).unwrap();
        let value = try_decode(&mut buf).unwrap().unwrap();
        expect_that!(
            parse_request(value),
            err(displays_as(contains_substring("not a request")))
        );
    }

    #[gtest]
    fn error_responses_carry_code_and_message() {
        let encoded = encode_response(3, Err(MpmError::UnknownMethod("nope".into())));
        let mut cursor = std::io::Cursor::new(encoded.as_slice());
        let value = rmpv::decode::read_value(&mut cursor).unwrap();
        let fields = value.as_array().unwrap();
        expect_that!(fields[0].as_u64(), some(eq(RESPONSE_TYPE)));
        expect_that!(fields[1].as_u64(), some(eq(3)));
        let error = fields[2].as_array().unwrap();
        expect_that!(error[0].as_i64(), some(eq(2)));
        expect_that!(fields[3].is_nil(), eq(true));
    }
}
