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

//! C2T - CPU Testing Tool
//!
//! Compiles annotated C tests for an emulated CPU and for a native reference
//! machine, runs both under remote debug stubs and reports the first point
//! where their registers or variables disagree.

use std::process::ExitCode;

use c2t_engine::C2tError;
use clap::{Parser, Subcommand};

mod cmd;

/// Exit code for failures that have no more specific kind.
const EXIT_OTHER: u8 = 6;

/// Command-line interface for C2T
#[derive(Debug, Parser)]
#[command(name = "c2t")]
#[command(about = "Differential CPU testing: emulated target against a native oracle")]
#[command(version)]
struct Cli {
    /// Log at DEBUG level (RUST_LOG still wins)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Command to execute
    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Debug, Subcommand)]
enum Commands {
    /// Build, run and compare every test
    Run(cmd::run::RunArgs),
    /// Validate a configuration file
    Check(cmd::check::CheckArgs),
    /// List the tests and their directives
    List(cmd::list::ListArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => cmd::run::run(args, cli.verbose).await,
        Commands::Check(args) => cmd::check::run(args, cli.verbose),
        Commands::List(args) => cmd::list::run(args, cli.verbose),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            let code = exit_code(&report);
            match report.downcast_ref::<C2tError>() {
                // The divergence report is the result of the run, not a crash
                Some(C2tError::Divergence(divergence)) => print!("FAIL {divergence}"),
                _ => eprintln!("error: {report:?}"),
            }
            ExitCode::from(code)
        }
    }
}

/// Exit code for `report`, chosen by the engine error it wraps.
fn exit_code(report: &eyre::Report) -> u8 {
    report
        .chain()
        .find_map(|cause| cause.downcast_ref::<C2tError>())
        .and_then(|err| u8::try_from(err.exit_code()).ok())
        .unwrap_or(EXIT_OTHER)
}
