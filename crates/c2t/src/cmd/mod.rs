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

//! Subcommands of the `c2t` binary.

pub mod check;
pub mod list;
pub mod run;

use std::path::Path;

use c2t_engine::C2tConfig;
use eyre::{Result, WrapErr};
use regex::Regex;

/// Load the configuration at `path`.
pub fn load_config(path: &Path) -> Result<C2tConfig> {
    C2tConfig::load(path).wrap_err_with(|| format!("loading {}", path.display()))
}

/// Parse a test-name filter.
pub fn parse_filter(filter: Option<&str>) -> Result<Option<Regex>> {
    filter
        .map(|pattern| {
            Regex::new(pattern)
                .map_err(|e| c2t_engine::C2tError::Config(format!("bad test filter: {e}")))
        })
        .transpose()
        .map_err(Into::into)
}
