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

//! `c2t list`: show the tests a run would execute.

use std::path::PathBuf;

use c2t_common::init_logging;
use c2t_engine::orchestrator::discover_tests;
use clap::Args;
use eyre::Result;

use super::{load_config, parse_filter};

/// Arguments of `c2t list`
#[derive(Debug, Args)]
pub struct ListArgs {
    /// Configuration file
    pub config: PathBuf,

    /// Only list tests whose name matches this regex
    #[arg(long)]
    pub test: Option<String>,
}

/// Print every discovered test with its directives.
pub fn run(args: ListArgs, verbose: bool) -> Result<()> {
    let _guard = init_logging("c2t", verbose, false)?;

    let config = load_config(&args.config)?;
    let pattern = args.test.as_deref().or(config.test_filter.as_deref());
    let filter = parse_filter(pattern)?;
    for planned in discover_tests(&config.tests_dir, filter.as_ref())? {
        let specs: Vec<String> = planned.specs.iter().map(ToString::to_string).collect();
        println!("{}\t{}", planned.test.name(), specs.join(" "));
    }
    Ok(())
}
