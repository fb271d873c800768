// C2T - CPU Testing Tool
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! A remote-serial debug stub serving the toy machine.
//!
//! It speaks enough of the protocol for [`DebugSession`](crate::DebugSession):
//! `qSupported ? g P m M Z0 z0 c s k D`. A `c` stops before executing an
//! instruction that carries a breakpoint, so resuming from a kept breakpoint
//! requires stepping over it first, as with real stubs.
//!
//! The stub can also answer the line-based management console (`stop`,
//! `system_reset`, `quit`) of an emulator.

use std::{io, net::Ipv4Addr, sync::Arc};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tracing::{debug, trace};

use super::{
    image::MemoryImage,
    machine::{Step, ToyMachine},
};
use crate::{
    image::ProgramImage,
    rsp::packet::{decode_body, encode_packet, read_frame, Frame},
};

/// Instructions a single `c` may execute before the stub gives up and stops.
pub const STEP_LIMIT: usize = 1_000_000;

/// How a debug connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Served {
    /// The client sent `k`
    Killed,
    /// The client sent `D`
    Detached,
    /// The client closed the connection
    Disconnected,
}

enum Reply {
    Packet(String),
    Close(Option<String>, Served),
}

/// Debug stub for a [`ToyMachine`].
#[derive(Debug, Clone, Default)]
pub struct MockStub {
    machine: Arc<Mutex<ToyMachine>>,
    packets: Arc<Mutex<Vec<String>>>,
    corrupt: Option<u64>,
}

impl MockStub {
    /// Stub for an empty machine, as an emulator waiting for an upload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stub with `image` already loaded and started at `main`, as a native
    /// debug stub launched on a binary.
    pub fn with_program(image: &MemoryImage, stack_pointer: u32) -> Self {
        let mut machine = ToyMachine::default();
        for section in image.sections() {
            machine.write(section.address, &section.data);
        }
        let entry = image.symbol("main").unwrap_or_default();
        machine.boot(u32::try_from(entry).unwrap_or_default(), stack_pointer);
        Self { machine: Arc::new(Mutex::new(machine)), ..Self::default() }
    }

    /// Flip the byte stored at `address` whenever a write covers it.
    pub fn corrupt_upload_at(mut self, address: u64) -> Self {
        self.corrupt = Some(address);
        self
    }

    /// Every packet received so far, decoded.
    pub fn packets(&self) -> Vec<String> {
        self.packets.lock().clone()
    }

    /// Shared machine state.
    pub fn machine(&self) -> Arc<Mutex<ToyMachine>> {
        self.machine.clone()
    }

    /// Clear memory and registers; breakpoints survive like in a real stub.
    pub fn reset_machine(&self) {
        let mut machine = self.machine.lock();
        let breakpoints = std::mem::take(&mut machine.breakpoints);
        *machine = ToyMachine::default();
        machine.breakpoints = breakpoints;
    }

    /// Listen on an ephemeral loopback port and serve one connection.
    pub async fn spawn(self) -> io::Result<(u16, JoinHandle<io::Result<Served>>)> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let port = listener.local_addr()?.port();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            self.serve_connection(stream).await
        });
        Ok((port, handle))
    }

    /// Serve one debug connection until it ends.
    pub async fn serve_connection(&self, stream: TcpStream) -> io::Result<Served> {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        loop {
            let frame = read_frame(&mut reader).await.map_err(io::Error::other)?;
            let body = match frame {
                Frame::Eof => return Ok(Served::Disconnected),
                Frame::Ack | Frame::Nack | Frame::Interrupt => continue,
                Frame::Packet { checksum_ok: false, .. } => {
                    write.write_all(b"-").await?;
                    continue;
                }
                Frame::Packet { body, .. } => body,
            };
            write.write_all(b"+").await?;
            let payload =
                String::from_utf8_lossy(&decode_body(&body).map_err(io::Error::other)?).into_owned();
            trace!("stub <- {payload}");
            self.packets.lock().push(payload.clone());

            match self.handle(&payload) {
                Reply::Packet(reply) => {
                    write.write_all(&encode_packet(reply.as_bytes())).await?;
                }
                Reply::Close(reply, served) => {
                    if let Some(reply) = reply {
                        write.write_all(&encode_packet(reply.as_bytes())).await?;
                    }
                    write.flush().await?;
                    debug!(?served, "Debug connection closed by client request");
                    return Ok(served);
                }
            }
            write.flush().await?;
        }
    }

    /// Serve the management console on `stream`. Returns true after `quit`.
    pub async fn serve_console(&self, stream: TcpStream) -> io::Result<bool> {
        let (read, mut write) = stream.into_split();
        write.write_all(b"toy machine monitor\r\n(qemu) ").await?;
        let mut lines = BufReader::new(read).lines();
        while let Some(line) = lines.next_line().await? {
            let output = match line.trim() {
                "stop" | "" => String::new(),
                "system_reset" => {
                    self.reset_machine();
                    String::new()
                }
                "quit" => return Ok(true),
                other => format!("unknown command: '{other}'\r\n"),
            };
            write.write_all(format!("{output}(qemu) ").as_bytes()).await?;
        }
        Ok(false)
    }

    fn handle(&self, payload: &str) -> Reply {
        let mut machine = self.machine.lock();
        let reply = if payload.starts_with("qSupported") {
            "PacketSize=4000;swbreak+".to_string()
        } else if payload == "?" {
            stop_reply(&machine, Step::Continue)
        } else if payload == "g" {
            hex::encode(machine.register_bytes())
        } else if let Some(rest) = payload.strip_prefix('P') {
            write_register(&mut machine, rest)
        } else if let Some(rest) = payload.strip_prefix('m') {
            read_memory(&machine, rest)
        } else if let Some(rest) = payload.strip_prefix('M') {
            self.write_memory(&mut machine, rest)
        } else if let Some(rest) = payload.strip_prefix("Z0,") {
            match breakpoint(rest) {
                Some(address) => {
                    machine.breakpoints.insert(address);
                    "OK".into()
                }
                None => "E01".into(),
            }
        } else if let Some(rest) = payload.strip_prefix("z0,") {
            match breakpoint(rest) {
                Some(address) => {
                    machine.breakpoints.remove(&address);
                    "OK".into()
                }
                None => "E01".into(),
            }
        } else if payload == "c" {
            resume(&mut machine)
        } else if payload == "s" {
            let step = if machine.exited.is_some() { Step::Halted } else { machine.step() };
            stop_reply(&machine, step)
        } else if payload == "k" {
            return Reply::Close(None, Served::Killed);
        } else if payload == "D" {
            return Reply::Close(Some("OK".into()), Served::Detached);
        } else {
            String::new()
        };
        Reply::Packet(reply)
    }

    fn write_memory(&self, machine: &mut ToyMachine, args: &str) -> String {
        let parsed = args.split_once(':').and_then(|(range, data)| {
            let (address, _) = range.split_once(',')?;
            Some((u64::from_str_radix(address, 16).ok()?, hex::decode(data).ok()?))
        });
        let Some((address, mut data)) = parsed else {
            return "E01".into();
        };
        if let Some(corrupt) = self.corrupt {
            if let Some(offset) = corrupt.checked_sub(address) {
                if let Some(byte) = usize::try_from(offset).ok().and_then(|o| data.get_mut(o)) {
                    *byte ^= 0xff;
                }
            }
        }
        ok_or_error(machine.write(address, &data))
    }
}

fn ok_or_error(ok: bool) -> String {
    if ok {
        "OK".into()
    } else {
        "E14".into()
    }
}

fn breakpoint(args: &str) -> Option<u32> {
    let (address, _kind) = args.split_once(',')?;
    u32::from_str_radix(address, 16).ok()
}

fn stop_reply(machine: &ToyMachine, step: Step) -> String {
    match (machine.exited, step) {
        (Some(code), Step::Fault) => format!("X{code:02x}"),
        (Some(code), _) => format!("W{code:02x}"),
        (None, _) => "S05".into(),
    }
}

fn write_register(machine: &mut ToyMachine, args: &str) -> String {
    let parsed = args.split_once('=').and_then(|(index, value)| {
        let index = usize::from_str_radix(index, 16).ok()?;
        let bytes: [u8; 4] = hex::decode(value).ok()?.try_into().ok()?;
        Some((index, u32::from_le_bytes(bytes)))
    });
    match parsed {
        Some((index, value)) if machine.set_reg(index, value) => "OK".into(),
        _ => "E01".into(),
    }
}

fn read_memory(machine: &ToyMachine, args: &str) -> String {
    let parsed = args.split_once(',').and_then(|(address, len)| {
        Some((u64::from_str_radix(address, 16).ok()?, usize::from_str_radix(len, 16).ok()?))
    });
    match parsed.and_then(|(address, len)| machine.read(address, len)) {
        Some(bytes) => hex::encode(bytes),
        None => "E14".into(),
    }
}

fn resume(machine: &mut ToyMachine) -> String {
    if machine.exited.is_some() {
        return stop_reply(machine, Step::Halted);
    }
    for _ in 0..STEP_LIMIT {
        if machine.breakpoints.contains(&machine.pc()) {
            return "S05".into();
        }
        match machine.step() {
            Step::Continue => {}
            step => return stop_reply(machine, step),
        }
    }
    "S05".into()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use c2t_common::logging::ensure_test_logging;

    use super::*;
    use crate::{
        rsp::{RspClient, StopReason},
        test_utils::machine::Insn,
    };

    async fn client(stub: MockStub) -> (RspClient, JoinHandle<io::Result<Served>>) {
        let (port, handle) = stub.spawn().await.unwrap();
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        (RspClient::new(stream, Duration::from_secs(5)), handle)
    }

    fn program() -> MemoryImage {
        MemoryImage::assemble(
            0x100,
            &[
                (Some(7), Insn::Li(0, 0x10)),
                (None, Insn::Li(1, 0x20)),
                (Some(8), Insn::Add(0, 1)),
                (Some(10), Insn::St(0, 0x2000)),
                (Some(20), Insn::Halt),
            ],
        )
    }

    #[tokio::test]
    async fn test_breakpoint_stops_before_instruction() {
        ensure_test_logging(None);
        let (mut client, handle) = client(MockStub::with_program(&program(), 0xf000)).await;

        assert!(client.supported().await.unwrap().contains("swbreak+"));
        assert_eq!(client.halt_reason().await.unwrap(), StopReason::Signal(5));
        client.insert_breakpoint(0x118, 4).await.unwrap();
        assert_eq!(client.cont(Duration::from_secs(5)).await.unwrap(), StopReason::Signal(5));

        // Stopped on the store: r0 holds the sum, memory is untouched.
        let registers = client.read_registers().await.unwrap();
        assert_eq!(&registers[..8], "30000000");
        assert_eq!(&registers[40..48], "18010000");
        assert_eq!(client.read_memory(0x2000, 4).await.unwrap(), vec![0; 4]);

        // Resuming on the breakpoint traps again until it is stepped over.
        assert_eq!(client.cont(Duration::from_secs(5)).await.unwrap(), StopReason::Signal(5));
        client.remove_breakpoint(0x118, 4).await.unwrap();
        assert_eq!(client.step().await.unwrap(), StopReason::Signal(5));
        assert_eq!(client.read_memory(0x2000, 4).await.unwrap(), vec![0x30, 0, 0, 0]);
        assert_eq!(client.cont(Duration::from_secs(5)).await.unwrap(), StopReason::Exited(0));

        client.kill().await.unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), Served::Killed);
    }

    #[tokio::test]
    async fn test_upload_corruption_and_faults() {
        ensure_test_logging(None);
        let stub = MockStub::new().corrupt_upload_at(0x101);
        let packets = stub.clone();
        let (mut client, handle) = client(stub).await;

        client.write_memory(0x100, &[1, 2, 3]).await.unwrap();
        assert_eq!(client.read_memory(0x100, 3).await.unwrap(), vec![1, 0xfd, 3]);
        assert!(client.read_memory(0xffff_0000, 4).await.is_err());

        // The flipped byte names a register that does not exist.
        client.write_register(5, "00010000").await.unwrap();
        assert_eq!(client.cont(Duration::from_secs(5)).await.unwrap(), StopReason::Terminated(4));

        client.detach().await.unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), Served::Detached);
        assert!(packets.packets().iter().any(|p| p.starts_with("M100,3:")));
    }
}
