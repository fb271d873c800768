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

//! Lock-step comparison of the oracle and target dump streams.

use std::{collections::BTreeSet, fmt};

use c2t_common::{Dump, DumpEvent};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{C2tError, C2tResult};

/// What differed between a pair of dumps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DivergenceKind {
    /// Different source lines: the programs took different paths
    Line,
    /// An observed register differs
    Register(String),
    /// A variable differs
    Variable(String),
    /// A variable was captured on one side only
    MissingVariable(String),
    /// One stream ended before the other
    Length,
}

impl fmt::Display for DivergenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Line => write!(f, "source lines differ"),
            Self::Register(alias) => write!(f, "register `{alias}` differs"),
            Self::Variable(name) => write!(f, "variable `{name}` differs"),
            Self::MissingVariable(name) => write!(f, "variable `{name}` captured on one side only"),
            Self::Length => write!(f, "dump streams have different lengths"),
        }
    }
}

/// The first mismatch between the two streams of a test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    /// Test name
    pub test: String,
    /// Position of the pair in the streams, from 0
    pub index: usize,
    /// What differed
    pub kind: DivergenceKind,
    /// Oracle dump, absent if its stream had ended
    pub oracle: Option<Dump>,
    /// Target dump, absent if its stream had ended
    pub target: Option<Dump>,
}

impl Divergence {
    /// Source line of the diverging pair, taken from whichever side has one.
    pub fn line(&self) -> Option<u32> {
        self.oracle.as_ref().or(self.target.as_ref()).map(|d| d.line)
    }
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "test `{}` diverged at dump #{}", self.test, self.index)?;
        if let Some(line) = self.line() {
            write!(f, " (line {line})")?;
        }
        writeln!(f, ": {}", self.kind)?;
        for (side, dump) in [("oracle", &self.oracle), ("target", &self.target)] {
            match dump {
                Some(dump) => writeln!(f, "  {side}: {dump}")?,
                None => writeln!(f, "  {side}: <end of stream>")?,
            }
        }
        Ok(())
    }
}

/// Outcome of comparing the streams of one test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComparisonResult {
    /// Every pair matched
    Equal {
        /// Number of matched pairs
        dumps: usize,
    },
    /// The first mismatch
    Divergent(Box<Divergence>),
}

impl ComparisonResult {
    /// Turn a divergence into an error, returning the number of matched dumps otherwise.
    pub fn into_result(self) -> C2tResult<usize> {
        match self {
            Self::Equal { dumps } => Ok(dumps),
            Self::Divergent(divergence) => Err(C2tError::Divergence(divergence)),
        }
    }
}

/// Compare one pair of dumps: line, observed registers, captured variables.
pub fn compare_dumps(oracle: &Dump, target: &Dump) -> Option<DivergenceKind> {
    if oracle.line != target.line {
        return Some(DivergenceKind::Line);
    }
    let aliases: BTreeSet<&String> = oracle.registers.keys().chain(target.registers.keys()).collect();
    for alias in aliases {
        if oracle.registers.get(alias) != target.registers.get(alias) {
            return Some(DivergenceKind::Register(alias.clone()));
        }
    }
    let names: BTreeSet<&String> = oracle.variables.keys().chain(target.variables.keys()).collect();
    for name in names {
        match (oracle.variables.get(name), target.variables.get(name)) {
            (Some(a), Some(b)) if a == b => {}
            (Some(_), Some(_)) => return Some(DivergenceKind::Variable(name.clone())),
            _ => return Some(DivergenceKind::MissingVariable(name.clone())),
        }
    }
    None
}

/// Drain both streams in lock-step and report the first mismatch.
///
/// A stream closing without [`DumpEvent::End`] means its session failed and
/// is reported as a protocol error.
pub async fn compare(
    test: &str,
    oracle: &mut mpsc::Receiver<DumpEvent>,
    target: &mut mpsc::Receiver<DumpEvent>,
) -> C2tResult<ComparisonResult> {
    let mut index = 0;
    loop {
        let (o, t) = tokio::join!(oracle.recv(), target.recv());
        let (o, t) = match (o, t) {
            (None, _) => {
                return Err(C2tError::protocol("oracle dump stream closed without an end marker"))
            }
            (_, None) => {
                return Err(C2tError::protocol("target dump stream closed without an end marker"))
            }
            (Some(DumpEvent::End), Some(DumpEvent::End)) => {
                info!(test, dumps = index, "Dump streams match");
                return Ok(ComparisonResult::Equal { dumps: index });
            }
            (Some(o), Some(t)) => (into_dump(o), into_dump(t)),
        };

        let kind = match (&o, &t) {
            (Some(o), Some(t)) => compare_dumps(o, t),
            _ => Some(DivergenceKind::Length),
        };
        if let Some(kind) = kind {
            let divergence = Divergence { test: test.to_string(), index, kind, oracle: o, target: t };
            info!(test, index, kind = %divergence.kind, "Dump streams diverge");
            return Ok(ComparisonResult::Divergent(Box::new(divergence)));
        }
        debug!(test, index, "Dumps match");
        index += 1;
    }
}

fn into_dump(event: DumpEvent) -> Option<Dump> {
    match event {
        DumpEvent::Dump(dump) => Some(dump),
        DumpEvent::End => None,
    }
}
