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

//! Small synchronous client for the daemon's two protocols: the UDP
//! discovery probe and MessagePack-RPC over TCP.

use log::debug;
use rmpv::Value;
use std::error::Error;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::time::Duration;

const DISCOVERY_MAGIC: &[u8] = b"MPM-DISC";

/// Broadcast a probe and collect every reply arriving within `timeout`.
pub fn discover(
    broadcast_addr: &str,
    timeout: Duration,
) -> Result<Vec<(SocketAddr, String)>, Box<dyn Error>> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_broadcast(true)?;
    socket.set_read_timeout(Some(timeout))?;
    socket.send_to(DISCOVERY_MAGIC, broadcast_addr)?;

    let mut replies = Vec::new();
    let mut buf = [0u8; 2048];
    loop {
        match socket.recv_from(&mut buf) {
            Ok((len, peer)) => {
                let reply = String::from_utf8_lossy(&buf[..len]).into_owned();
                debug!("reply from {peer}: {reply}");
                replies.push((peer, reply));
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(replies)
}

/// One MessagePack-RPC connection.
pub struct RpcClient {
    stream: TcpStream,
    buf: Vec<u8>,
    next_msgid: u64,
}

impl RpcClient {
    pub fn connect(addr: &str) -> Result<RpcClient, Box<dyn Error>> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        Ok(RpcClient {
            stream,
            buf: Vec::new(),
            next_msgid: 0,
        })
    }

    /// Issue one request and block for its response. RPC-level errors come
    /// back as `Err` with the server's code and message.
    pub fn request(&mut self, method: &str, args: Vec<Value>) -> Result<Value, Box<dyn Error>> {
        let msgid = self.next_msgid;
        self.next_msgid += 1;
        let request = Value::Array(vec![
            Value::from(0u64),
            Value::from(msgid),
            Value::from(method),
            Value::Array(args),
        ]);
        let mut encoded = Vec::new();
        rmpv::encode::write_value(&mut encoded, &request)?;
        self.stream.write_all(&encoded)?;

        let response = self.read_value()?;
        let Value::Array(fields) = response else {
            return Err("response is not an array".into());
        };
        if fields.len() != 4 || fields[0].as_u64() != Some(1) {
            return Err("malformed RPC response".into());
        }
        if fields[1].as_u64() != Some(msgid) {
            return Err("response msgid does not match request".into());
        }
        if !fields[2].is_nil() {
            return Err(format!("RPC error: {}", fields[2]).into());
        }
        Ok(fields[3].clone())
    }

    fn read_value(&mut self) -> Result<Value, Box<dyn Error>> {
        let mut chunk = [0u8; 4096];
        loop {
            if !self.buf.is_empty() {
                let mut cursor = std::io::Cursor::new(self.buf.as_slice());
                match rmpv::decode::read_value(&mut cursor) {
                    Ok(value) => {
                        let used = cursor.position() as usize;
                        self.buf.drain(..used);
                        return Ok(value);
                    }
                    Err(e) if is_incomplete(&e) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err("connection closed mid-response".into());
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
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
