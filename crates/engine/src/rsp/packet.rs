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

//! Packet framing of the remote-serial debug protocol.
//!
//! Packets travel as `$<payload>#<checksum>` where the checksum is the sum of
//! the payload bytes modulo 256 in two hex digits. Inside the payload `#`,
//! `$`, `}` and `*` are escaped as `}` followed by the byte XOR `0x20`; replies
//! may additionally use `*` run-length encoding.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{C2tError, C2tResult};

const ESCAPE: u8 = b'}';
const RUN_LENGTH: u8 = b'*';

/// Something read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `+`
    Ack,
    /// `-`
    Nack,
    /// Ctrl-C interrupt request (`0x03`)
    Interrupt,
    /// A `$...#xx` packet with its raw (still encoded) body
    Packet {
        /// Body between `$` and `#`
        body: Vec<u8>,
        /// Whether the transmitted checksum matched
        checksum_ok: bool,
    },
    /// The peer closed the connection
    Eof,
}

/// Modulo-256 sum of `data`.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Escape `payload` and wrap it into a complete packet.
pub fn encode_packet(payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + 4);
    for &b in payload {
        if matches!(b, b'#' | b'$' | ESCAPE | RUN_LENGTH) {
            body.push(ESCAPE);
            body.push(b ^ 0x20);
        } else {
            body.push(b);
        }
    }
    let mut packet = Vec::with_capacity(body.len() + 4);
    packet.push(b'$');
    packet.extend_from_slice(&body);
    packet.push(b'#');
    packet.extend_from_slice(format!("{:02x}", checksum(&body)).as_bytes());
    packet
}

/// Undo escaping and run-length encoding of a received packet body.
pub fn decode_body(body: &[u8]) -> C2tResult<Vec<u8>> {
    let mut out: Vec<u8> = Vec::with_capacity(body.len());
    let mut iter = body.iter().copied();
    while let Some(b) = iter.next() {
        match b {
            ESCAPE => {
                let escaped = iter
                    .next()
                    .ok_or_else(|| C2tError::protocol("packet ends inside an escape"))?;
                out.push(escaped ^ 0x20);
            }
            RUN_LENGTH => {
                let count = iter
                    .next()
                    .ok_or_else(|| C2tError::protocol("packet ends inside a run-length"))?;
                let repeat = count
                    .checked_sub(29)
                    .ok_or_else(|| C2tError::protocol("invalid run-length count"))?;
                let last = *out
                    .last()
                    .ok_or_else(|| C2tError::protocol("run-length without a preceding byte"))?;
                out.extend(std::iter::repeat(last).take(usize::from(repeat)));
            }
            _ => out.push(b),
        }
    }
    Ok(out)
}

/// Read the next frame from `reader`.
///
/// Bytes outside of packets other than acknowledgements and interrupts are
/// skipped, as are `%` notification packets.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> C2tResult<Frame> {
    loop {
        let Some(b) = read_byte(reader).await? else {
            return Ok(Frame::Eof);
        };
        match b {
            b'+' => return Ok(Frame::Ack),
            b'-' => return Ok(Frame::Nack),
            0x03 => return Ok(Frame::Interrupt),
            b'$' => {
                let (body, checksum_ok) = read_body(reader).await?;
                return Ok(Frame::Packet { body, checksum_ok });
            }
            b'%' => {
                read_body(reader).await?;
            }
            _ => {}
        }
    }
}

async fn read_body<R: AsyncRead + Unpin>(reader: &mut R) -> C2tResult<(Vec<u8>, bool)> {
    let mut body = Vec::new();
    loop {
        match read_byte(reader).await? {
            Some(b'#') => break,
            Some(b) => body.push(b),
            None => return Err(C2tError::protocol("connection closed inside a packet")),
        }
    }
    let mut digits = [0u8; 2];
    reader
        .read_exact(&mut digits)
        .await
        .map_err(|e| C2tError::protocol(format!("connection lost reading checksum: {e}")))?;
    let expected = std::str::from_utf8(&digits)
        .ok()
        .and_then(|s| u8::from_str_radix(s, 16).ok())
        .ok_or_else(|| C2tError::protocol("malformed packet checksum"))?;
    let ok = expected == checksum(&body);
    Ok((body, ok))
}

async fn read_byte<R: AsyncRead + Unpin>(reader: &mut R) -> C2tResult<Option<u8>> {
    let mut byte = [0u8; 1];
    match reader.read(&mut byte).await {
        Ok(0) => Ok(None),
        Ok(_) => Ok(Some(byte[0])),
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => Ok(None),
        Err(e) => Err(C2tError::protocol(format!("connection lost: {e}"))),
    }
}
