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

use std::{fmt::Display, str::FromStr};

use eyre::{bail, Error, Result};
use serde::{Deserialize, Serialize};

/// What a breakpoint does when the program reaches its source line.
///
/// Each variant corresponds to exactly one in-source directive keyword.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BreakpointCommand {
    /// `br`: record the line once, then remove the breakpoint.
    Break,
    /// `bre`: record the line once and end the session there.
    BreakEnd,
    /// `brc`: record the line on every pass.
    Cycle,
    /// `chc`: record variable values on every pass.
    CycleDump,
    /// `ch`: record variable values once, then remove the breakpoint.
    Dump,
}

impl BreakpointCommand {
    /// All commands, in directive-table order.
    pub const ALL: [Self; 5] = [Self::Break, Self::BreakEnd, Self::Cycle, Self::Dump, Self::CycleDump];

    /// The keyword used for this command in test sources.
    pub fn directive(&self) -> &'static str {
        match self {
            Self::Break => "br",
            Self::BreakEnd => "bre",
            Self::Cycle => "brc",
            Self::Dump => "ch",
            Self::CycleDump => "chc",
        }
    }

    /// Whether the action retires after its first hit.
    pub fn is_one_shot(&self) -> bool {
        matches!(self, Self::Break | Self::BreakEnd | Self::Dump)
    }

    /// Whether a hit captures variable values.
    pub fn captures_variables(&self) -> bool {
        matches!(self, Self::Dump | Self::CycleDump)
    }

    /// Whether a hit is the terminal measurement point of the session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::BreakEnd)
    }
}

impl Display for BreakpointCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.directive())
    }
}

impl FromStr for BreakpointCommand {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match Self::ALL.iter().find(|cmd| cmd.directive() == s) {
            Some(cmd) => Ok(*cmd),
            None => bail!(
                "unknown directive `{s}` (expected one of: {})",
                Self::ALL.map(|cmd| cmd.directive()).join(", ")
            ),
        }
    }
}

/// A single directive bound to a source line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BreakpointSpec {
    /// Source line number (1-based).
    pub line: u32,
    /// Action performed on hit.
    pub command: BreakpointCommand,
    /// Variable restricting a dump, if any.
    pub variable: Option<String>,
}

impl BreakpointSpec {
    /// Create a spec without a bound variable.
    pub fn new(line: u32, command: BreakpointCommand) -> Self {
        Self { line, command, variable: None }
    }

    /// Bind a variable to this spec.
    pub fn with_variable(mut self, variable: impl Into<String>) -> Self {
        self.variable = Some(variable.into());
        self
    }
}

impl Display for BreakpointSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.command)?;
        if let Some(var) = &self.variable {
            write!(f, ".{var}")?;
        }
        Ok(())
    }
}
