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

//! `c2t check`: validate a configuration without running anything.

use std::path::PathBuf;

use c2t_common::init_logging;
use clap::Args;
use eyre::Result;

use super::load_config;

/// Arguments of `c2t check`
#[derive(Debug, Args)]
pub struct CheckArgs {
    /// Configuration file
    pub config: PathBuf,
}

/// Validate the configuration and print what it resolves to.
pub fn run(args: CheckArgs, verbose: bool) -> Result<()> {
    let _guard = init_logging("c2t", verbose, false)?;

    let config = load_config(&args.config)?;
    config.validate()?;
    let target = config.target.machine.layout()?;
    let oracle = config.oracle.machine.layout()?;

    println!("tests:  {}", config.tests_dir.display());
    println!("work:   {}", config.work_dir.display());
    println!("mode:   {}", config.mode);
    for (side, arch, layout) in [
        ("target", &config.target.machine.arch, &target),
        ("oracle", &config.oracle.machine.arch, &oracle),
    ] {
        println!(
            "{side}: {arch} ({} registers, pc={}, sp={}, {})",
            layout.registers().len(),
            layout.pc(),
            layout.sp(),
            if layout.little_endian() { "little-endian" } else { "big-endian" },
        );
    }
    let observed: Vec<String> = config
        .target
        .machine
        .observe
        .iter()
        .map(|(alias, register)| {
            let oracle_register =
                config.oracle.machine.observe.get(alias).map(String::as_str).unwrap_or("?");
            format!("{alias}={register}/{oracle_register}")
        })
        .collect();
    println!("observe: {}", observed.join(" "));
    println!("ok");
    Ok(())
}
