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

//! C2T mock debug stub
//!
//! Serves the toy machine over the remote-serial protocol. Started without a
//! program it behaves like an emulator waiting for an upload, optionally with
//! a management console; started with `--program` it behaves like a native
//! debug stub launched on that binary.

use std::{net::Ipv4Addr, path::PathBuf};

use c2t_common::init_simple_logging;
use c2t_engine::test_utils::{MemoryImage, MockStub, Served};
use clap::Parser;
use eyre::Result;
use tokio::net::TcpListener;
use tracing::{info, warn, Level};

/// Toy machine debug stub
#[derive(Parser, Debug)]
#[command(name = "c2t-mock-stub")]
#[command(version)]
struct Args {
    /// Debug port to listen on
    #[arg(long)]
    port: u16,

    /// Management console port
    #[arg(long)]
    control_port: Option<u16>,

    /// Program image to load and start at `main`
    #[arg(long)]
    program: Option<PathBuf>,

    /// Initial stack pointer when a program is given
    #[arg(long, default_value = "0xf000", value_parser = parse_number)]
    stack_pointer: u32,

    /// Flip the byte uploaded to this address
    #[arg(long, value_parser = parse_number)]
    corrupt_upload_at: Option<u32>,
}

fn parse_number(text: &str) -> Result<u32, String> {
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid number `{text}`: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_simple_logging(Level::INFO)?;

    let native = args.program.is_some();
    let mut stub = match &args.program {
        Some(path) => MockStub::with_program(&MemoryImage::read(path)?, args.stack_pointer),
        None => MockStub::new(),
    };
    if let Some(address) = args.corrupt_upload_at {
        stub = stub.corrupt_upload_at(u64::from(address));
    }

    let debug = TcpListener::bind((Ipv4Addr::LOCALHOST, args.port)).await?;
    let console = match args.control_port {
        Some(port) => Some(TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?),
        None => None,
    };
    info!(port = args.port, control_port = ?args.control_port, native, "Mock stub listening");

    let console_stub = stub.clone();
    let console_task = async move {
        let Some(listener) = console else {
            return std::future::pending::<Result<()>>().await;
        };
        loop {
            let (stream, _) = listener.accept().await?;
            if console_stub.serve_console(stream).await? {
                info!("Console asked to quit");
                return Ok(());
            }
        }
    };

    let debug_task = async move {
        loop {
            let (stream, peer) = debug.accept().await?;
            info!(%peer, "Debugger attached");
            match stub.serve_connection(stream).await {
                Ok(Served::Killed) => return Ok::<(), eyre::Report>(()),
                Ok(Served::Detached) if native => return Ok(()),
                Ok(served) => info!(?served, "Debugger went away"),
                Err(e) => warn!("Debug connection failed: {e}"),
            }
        }
    };

    tokio::select! {
        result = console_task => result,
        result = debug_task => result,
    }
}
