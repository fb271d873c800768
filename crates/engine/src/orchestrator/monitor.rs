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

//! Client for the emulator's line-based management console.

use std::time::Duration;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tracing::debug;

use crate::{C2tError, C2tResult};

/// Prompt printed by the console when it is ready for a command.
pub const PROMPT: &str = "(qemu) ";

/// A connection to the management console of an emulator.
#[derive(Debug)]
pub struct MonitorClient {
    stream: TcpStream,
    reply_timeout: Duration,
}

impl MonitorClient {
    /// Take over `stream` and wait for the first prompt.
    pub async fn connect(stream: TcpStream, reply_timeout: Duration) -> C2tResult<Self> {
        let mut monitor = Self { stream, reply_timeout };
        let banner = monitor.read_until_prompt().await?;
        debug!(banner = banner.trim(), "Monitor connected");
        Ok(monitor)
    }

    async fn read_until_prompt(&mut self) -> C2tResult<String> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 512];
        while !buf.ends_with(PROMPT.as_bytes()) {
            let n = timeout(self.reply_timeout, self.stream.read(&mut chunk))
                .await
                .map_err(|_| C2tError::protocol("monitor did not answer in time"))??;
            if n == 0 {
                return Err(C2tError::protocol("monitor closed the connection"));
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        buf.truncate(buf.len() - PROMPT.len());
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Run `command` and return its output.
    pub async fn command(&mut self, command: &str) -> C2tResult<String> {
        debug!(command, "Monitor command");
        self.stream.write_all(format!("{command}\n").as_bytes()).await?;
        self.stream.flush().await?;
        self.read_until_prompt().await
    }

    /// Pause the virtual CPU.
    pub async fn stop(&mut self) -> C2tResult<()> {
        self.command("stop").await.map(drop)
    }

    /// Reset the machine in place.
    pub async fn system_reset(&mut self) -> C2tResult<()> {
        self.command("system_reset").await.map(drop)
    }

    /// Ask the emulator to exit. The console closes without a prompt.
    pub async fn quit(mut self) -> C2tResult<()> {
        self.stream.write_all(b"quit\n").await?;
        self.stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncBufReadExt, BufReader},
        net::TcpListener,
    };

    use super::*;

    #[tokio::test]
    async fn test_commands_wait_for_prompt() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            write.write_all(b"QEMU monitor - type 'help'\r\n(qemu) ").await.unwrap();
            let mut lines = BufReader::new(read).lines();
            let mut seen = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                seen.push(line.clone());
                if line != "quit" {
                    write.write_all(format!("{line}\r\n(qemu) ").as_bytes()).await.unwrap();
                }
            }
            seen
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut monitor = MonitorClient::connect(stream, Duration::from_secs(5)).await.unwrap();
        monitor.stop().await.unwrap();
        let echoed = monitor.command("info status").await.unwrap();
        assert_eq!(echoed.trim(), "info status");
        monitor.quit().await.unwrap();
        assert_eq!(server.await.unwrap(), ["stop", "info status", "quit"]);
    }
}
