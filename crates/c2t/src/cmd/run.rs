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

//! `c2t run`: the differential run.

use std::{io::IsTerminal, path::PathBuf};

use c2t_common::init_logging;
use c2t_engine::{Orchestrator, RunMode, RunOptions};
use clap::Args;
use eyre::{eyre, Result, WrapErr};
use tracing::{info, warn};

use super::{load_config, parse_filter};

/// Arguments of `c2t run`
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Configuration file
    pub config: PathBuf,

    /// Only run tests whose name matches this regex
    #[arg(long)]
    pub test: Option<String>,

    /// Kill the emulator and debug stub right away instead of asking them to exit
    #[arg(long)]
    pub kill: bool,

    /// Override the configured device management mode
    #[arg(long, value_enum)]
    pub mode: Option<RunMode>,

    /// Log to the console only
    #[arg(long)]
    pub no_file_log: bool,
}

/// Run every selected test, stopping at the first failure.
pub async fn run(args: RunArgs, verbose: bool) -> Result<()> {
    let _guard = init_logging("c2t", verbose, !args.no_file_log)?;

    let config = load_config(&args.config)?;
    let options = RunOptions {
        filter: parse_filter(args.test.as_deref())?,
        mode: args.mode,
        kill: args.kill,
        progress: std::io::stderr().is_terminal(),
    };
    let orchestrator = Orchestrator::new(config, options)?;
    info!(config = %args.config.display(), mode = %orchestrator.mode(), "Starting c2t");

    let summary = tokio::select! {
        result = orchestrator.run() => result.wrap_err("test run failed")?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, killing child processes");
            orchestrator.supervisor().kill_all();
            return Err(eyre!("interrupted"));
        }
    };

    if summary.passed.is_empty() {
        println!("no tests matched");
    } else {
        for name in &summary.passed {
            println!("PASS {name}");
        }
        println!("{} passed", summary.passed.len());
    }
    Ok(())
}
