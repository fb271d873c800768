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

//! Client side of the remote-serial debug protocol.

use std::time::Duration;

use tokio::{
    io::{AsyncWriteExt, BufStream},
    net::TcpStream,
    time::timeout,
};
use tracing::{debug, trace, warn};

use super::packet::{decode_body, encode_packet, read_frame, Frame};
use crate::{C2tError, C2tResult};

/// Number of times a packet is re-sent after a negative acknowledgement.
const MAX_RESENDS: usize = 3;

/// Largest memory chunk moved by a single `m`/`M` packet.
const MEMORY_CHUNK: usize = 0x200;

/// Why the remote stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Stopped by a signal (`S`/`T` replies), e.g. SIGTRAP at a breakpoint
    Signal(u8),
    /// The program exited with a status (`W` reply)
    Exited(u8),
    /// The program was terminated by a signal (`X` reply)
    Terminated(u8),
}

impl StopReason {
    /// Parse a stop-reply payload.
    pub fn parse(reply: &str) -> C2tResult<Self> {
        let kind = reply.chars().next();
        let code = reply
            .get(1..3)
            .and_then(|digits| u8::from_str_radix(digits, 16).ok())
            .ok_or_else(|| C2tError::protocol(format!("malformed stop reply `{reply}`")))?;
        match kind {
            Some('S' | 'T') => Ok(Self::Signal(code)),
            Some('W') => Ok(Self::Exited(code)),
            Some('X') => Ok(Self::Terminated(code)),
            _ => Err(C2tError::protocol(format!("unexpected stop reply `{reply}`"))),
        }
    }

    /// Whether the program is gone.
    pub fn is_exit(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Terminated(_))
    }
}

/// A connection to a remote-serial debug stub.
#[derive(Debug)]
pub struct RspClient {
    stream: BufStream<TcpStream>,
    reply_timeout: Duration,
    peer: String,
}

impl RspClient {
    /// Wrap an established connection.
    pub fn new(stream: TcpStream, reply_timeout: Duration) -> Self {
        let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "?".into());
        Self { stream: BufStream::new(stream), reply_timeout, peer }
    }

    /// Address of the stub.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Send a packet and wait for its acknowledgement.
    async fn send(&mut self, payload: &str) -> C2tResult<()> {
        trace!(peer = %self.peer, "-> {payload}");
        let packet = encode_packet(payload.as_bytes());
        for _ in 0..=MAX_RESENDS {
            self.stream.write_all(&packet).await?;
            self.stream.flush().await?;
            match self.read_frame(self.reply_timeout).await? {
                Frame::Ack => return Ok(()),
                Frame::Nack => {
                    debug!(peer = %self.peer, "Packet rejected by stub, resending");
                }
                Frame::Eof => return Err(C2tError::protocol("stub closed the connection")),
                other => {
                    return Err(C2tError::protocol(format!(
                        "expected acknowledgement for `{payload}`, got {other:?}"
                    )))
                }
            }
        }
        Err(C2tError::protocol(format!("stub kept rejecting `{payload}`")))
    }

    /// Wait for the next packet, acknowledging it.
    async fn receive(&mut self, wait: Duration) -> C2tResult<String> {
        loop {
            match self.read_frame(wait).await? {
                Frame::Packet { body, checksum_ok: true } => {
                    self.stream.write_all(b"+").await?;
                    self.stream.flush().await?;
                    let reply = String::from_utf8(decode_body(&body)?)
                        .map_err(|_| C2tError::protocol("reply is not valid text"))?;
                    trace!(peer = %self.peer, "<- {reply}");
                    return Ok(reply);
                }
                Frame::Packet { checksum_ok: false, .. } => {
                    warn!(peer = %self.peer, "Reply checksum mismatch, requesting retransmission");
                    self.stream.write_all(b"-").await?;
                    self.stream.flush().await?;
                }
                Frame::Eof => return Err(C2tError::protocol("stub closed the connection")),
                Frame::Ack | Frame::Nack | Frame::Interrupt => {}
            }
        }
    }

    async fn read_frame(&mut self, wait: Duration) -> C2tResult<Frame> {
        timeout(wait, read_frame(&mut self.stream)).await.map_err(|_| {
            C2tError::protocol(format!("no reply from {} within {wait:?}", self.peer))
        })?
    }

    /// Send `payload` and return the reply, mapping `Exx` replies to errors.
    pub async fn request(&mut self, payload: &str) -> C2tResult<String> {
        self.send(payload).await?;
        let reply = self.receive(self.reply_timeout).await?;
        check_error(payload, &reply)?;
        Ok(reply)
    }

    /// Send `payload` and require an `OK` reply.
    async fn request_ok(&mut self, payload: &str) -> C2tResult<()> {
        match self.request(payload).await?.as_str() {
            "OK" => Ok(()),
            "" => Err(C2tError::protocol(format!("stub does not support `{payload}`"))),
            other => Err(C2tError::protocol(format!("unexpected reply `{other}` to `{payload}`"))),
        }
    }

    /// Exchange feature lists (`qSupported`).
    pub async fn supported(&mut self) -> C2tResult<String> {
        self.request("qSupported:swbreak+").await
    }

    /// Ask why the target is halted (`?`).
    pub async fn halt_reason(&mut self) -> C2tResult<StopReason> {
        let reply = self.request("?").await?;
        StopReason::parse(&reply)
    }

    /// Read the whole register file as a hex string (`g`).
    pub async fn read_registers(&mut self) -> C2tResult<String> {
        let reply = self.request("g").await?;
        if reply.is_empty() {
            return Err(C2tError::protocol("stub returned no registers"));
        }
        Ok(reply)
    }

    /// Write one register (`P`), `value` already hex-encoded in target order.
    pub async fn write_register(&mut self, index: usize, value: &str) -> C2tResult<()> {
        self.request_ok(&format!("P{index:x}={value}")).await
    }

    /// Read `len` bytes at `address` (`m`).
    pub async fn read_memory(&mut self, address: u64, len: usize) -> C2tResult<Vec<u8>> {
        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            let chunk = (len - data.len()).min(MEMORY_CHUNK);
            let at = address + data.len() as u64;
            let reply = self.request(&format!("m{at:x},{chunk:x}")).await?;
            let bytes = hex::decode(&reply).map_err(|e| {
                C2tError::protocol(format!("bad memory reply at {at:#x}: {e}"))
            })?;
            if bytes.is_empty() {
                return Err(C2tError::protocol(format!("stub returned no memory at {at:#x}")));
            }
            data.extend_from_slice(&bytes[..bytes.len().min(chunk)]);
        }
        Ok(data)
    }

    /// Write `data` at `address` (`M`).
    pub async fn write_memory(&mut self, address: u64, data: &[u8]) -> C2tResult<()> {
        for (i, chunk) in data.chunks(MEMORY_CHUNK).enumerate() {
            let at = address + (i * MEMORY_CHUNK) as u64;
            self.request_ok(&format!("M{at:x},{:x}:{}", chunk.len(), hex::encode(chunk))).await?;
        }
        Ok(())
    }

    /// Insert a software breakpoint (`Z0`).
    pub async fn insert_breakpoint(&mut self, address: u64, kind: u32) -> C2tResult<()> {
        self.request_ok(&format!("Z0,{address:x},{kind:x}")).await
    }

    /// Remove a software breakpoint (`z0`).
    pub async fn remove_breakpoint(&mut self, address: u64, kind: u32) -> C2tResult<()> {
        self.request_ok(&format!("z0,{address:x},{kind:x}")).await
    }

    /// Resume and wait up to `wait` for the next stop (`c`).
    pub async fn cont(&mut self, wait: Duration) -> C2tResult<StopReason> {
        self.send("c").await?;
        self.wait_stop(wait).await
    }

    /// Execute a single instruction (`s`).
    pub async fn step(&mut self) -> C2tResult<StopReason> {
        self.send("s").await?;
        self.wait_stop(self.reply_timeout).await
    }

    async fn wait_stop(&mut self, wait: Duration) -> C2tResult<StopReason> {
        loop {
            let reply = self.receive(wait).await?;
            // Console output from the program, not a stop
            if let Some(hex_text) = reply.strip_prefix('O').filter(|s| !s.is_empty()) {
                if let Ok(bytes) = hex::decode(hex_text) {
                    debug!(peer = %self.peer, "program output: {}", String::from_utf8_lossy(&bytes));
                    continue;
                }
            }
            check_error("stop", &reply)?;
            return StopReason::parse(&reply);
        }
    }

    /// Kill the program (`k`). No reply is expected.
    pub async fn kill(&mut self) -> C2tResult<()> {
        self.send("k").await
    }

    /// Detach from the program (`D`).
    pub async fn detach(&mut self) -> C2tResult<()> {
        self.request_ok("D").await
    }
}

fn check_error(payload: &str, reply: &str) -> C2tResult<()> {
    let bytes = reply.as_bytes();
    if bytes.len() == 3 && bytes[0] == b'E' && bytes[1..].iter().all(u8::is_ascii_hexdigit) {
        let command = payload.split([',', ':']).next().unwrap_or(payload);
        return Err(C2tError::protocol(format!("stub answered `{command}` with error {reply}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stop_replies() {
        assert_eq!(StopReason::parse("S05").unwrap(), StopReason::Signal(5));
        assert_eq!(StopReason::parse("T0505:00000000;").unwrap(), StopReason::Signal(5));
        assert_eq!(StopReason::parse("W00").unwrap(), StopReason::Exited(0));
        assert_eq!(StopReason::parse("X09").unwrap(), StopReason::Terminated(9));
        assert!(StopReason::parse("OK").is_err());
        assert!(StopReason::parse("").is_err());
    }

    #[test]
    fn test_error_replies() {
        assert!(check_error("m1000,4", "E14").is_err());
        assert!(check_error("m1000,4", "e1a0").is_ok());
        assert!(check_error("g", "EE001122").is_ok());
    }
}
