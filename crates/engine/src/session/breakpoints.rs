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

//! Breakpoint bookkeeping: directives grouped by line, resolved to addresses.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use c2t_common::{BreakpointCommand, BreakpointSpec};
use tracing::warn;

use crate::{image::ProgramImage, C2tError, C2tResult};

/// Which variables a hit captures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Capture {
    /// Every variable visible at the PC
    All,
    /// Just these (possibly none)
    Named(Vec<String>),
}

/// What to do about one breakpoint hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HitPlan {
    pub(crate) line: u32,
    pub(crate) capture: Capture,
    /// The measurement ends after this hit
    pub(crate) terminal: bool,
    /// The line still has live actions, so its breakpoints stay installed
    pub(crate) keep: bool,
}

#[derive(Debug, Clone)]
struct Action {
    command: BreakpointCommand,
    variable: Option<String>,
    live: bool,
}

#[derive(Debug, Clone)]
struct LineEntry {
    actions: Vec<Action>,
    addresses: Vec<u64>,
}

/// Breakpoints of one loaded program.
#[derive(Debug, Default)]
pub(crate) struct BreakpointTable {
    lines: BTreeMap<u32, LineEntry>,
    by_address: HashMap<u64, u32>,
    installed: BTreeSet<u64>,
}

impl BreakpointTable {
    /// Group `specs` by line and resolve every line through `image`.
    pub(crate) fn resolve(specs: &[BreakpointSpec], image: &dyn ProgramImage) -> C2tResult<Self> {
        let mut table = Self::default();
        for spec in specs {
            let entry = table.lines.entry(spec.line).or_insert_with(|| LineEntry {
                actions: Vec::new(),
                addresses: Vec::new(),
            });
            entry.actions.push(Action {
                command: spec.command,
                variable: spec.variable.clone(),
                live: true,
            });
        }
        for (&line, entry) in &mut table.lines {
            let addresses = image.line_addresses(line);
            if addresses.is_empty() {
                return Err(C2tError::DebugInfo(format!(
                    "line {line} carries a directive but no code"
                )));
            }
            for address in addresses {
                match table.by_address.get(&address) {
                    Some(other) => {
                        warn!("Lines {other} and {line} share address {address:#x}, keeping line {other}");
                    }
                    None => {
                        table.by_address.insert(address, line);
                        entry.addresses.push(address);
                    }
                }
            }
        }
        Ok(table)
    }

    /// Every address to install, in ascending order.
    pub(crate) fn addresses(&self) -> Vec<u64> {
        let mut all: Vec<u64> = self.by_address.keys().copied().collect();
        all.sort_unstable();
        all
    }

    /// Addresses of `line`.
    pub(crate) fn line_addresses(&self, line: u32) -> &[u64] {
        self.lines.get(&line).map(|e| e.addresses.as_slice()).unwrap_or_default()
    }

    /// Whether a hit at `address` would be handled.
    pub(crate) fn is_armed(&self, address: u64) -> bool {
        self.installed.contains(&address)
    }

    pub(crate) fn mark_installed(&mut self, address: u64) {
        self.installed.insert(address);
    }

    /// Forget `address`, returning whether it was installed.
    pub(crate) fn mark_removed(&mut self, address: u64) -> bool {
        self.installed.remove(&address)
    }

    /// Take every still-installed address.
    pub(crate) fn drain_installed(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.installed).into_iter().collect()
    }

    /// Run the live actions of the line at `address`, retiring one-shot ones.
    pub(crate) fn hit(&mut self, address: u64) -> Option<HitPlan> {
        if !self.installed.contains(&address) {
            return None;
        }
        let line = *self.by_address.get(&address)?;
        let entry = self.lines.get_mut(&line)?;

        let mut all = false;
        let mut named = Vec::new();
        let mut terminal = false;
        for action in entry.actions.iter_mut().filter(|a| a.live) {
            if action.command.captures_variables() {
                match &action.variable {
                    Some(name) if !named.contains(name) => named.push(name.clone()),
                    Some(_) => {}
                    None => all = true,
                }
            }
            terminal |= action.command.is_terminal();
            if action.command.is_one_shot() {
                action.live = false;
            }
        }
        let keep = entry.actions.iter().any(|a| a.live);
        let capture = if all { Capture::All } else { Capture::Named(named) };
        Some(HitPlan { line, capture, terminal, keep })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryImage;
    use BreakpointCommand::*;

    fn image() -> MemoryImage {
        MemoryImage::default().with_line(3, &[0x10]).with_line(5, &[0x20, 0x40]).with_line(7, &[0x30])
    }

    fn armed(specs: &[BreakpointSpec]) -> BreakpointTable {
        let mut table = BreakpointTable::resolve(specs, &image()).unwrap();
        for address in table.addresses() {
            table.mark_installed(address);
        }
        table
    }

    #[test]
    fn test_line_without_code_is_rejected() {
        let err = BreakpointTable::resolve(&[BreakpointSpec::new(4, Break)], &image()).unwrap_err();
        assert!(err.to_string().contains("line 4"));
    }

    #[test]
    fn test_one_shot_retires_after_first_hit() {
        let mut table = armed(&[BreakpointSpec::new(3, Break)]);
        let plan = table.hit(0x10).unwrap();
        assert_eq!(plan, HitPlan { line: 3, capture: Capture::Named(vec![]), terminal: false, keep: false });
    }

    #[test]
    fn test_grouped_line_keeps_cycle_actions() {
        let mut table = armed(&[
            BreakpointSpec::new(5, Break),
            BreakpointSpec::new(5, CycleDump).with_variable("c"),
            BreakpointSpec::new(5, Dump).with_variable("a"),
        ]);
        assert_eq!(table.line_addresses(5), &[0x20, 0x40]);

        let first = table.hit(0x40).unwrap();
        assert_eq!(first.capture, Capture::Named(vec!["c".into(), "a".into()]));
        assert!(first.keep);

        let second = table.hit(0x20).unwrap();
        assert_eq!(second.capture, Capture::Named(vec!["c".into()]));
        assert!(second.keep);
    }

    #[test]
    fn test_dump_all_and_terminal() {
        let mut table = armed(&[BreakpointSpec::new(3, Dump), BreakpointSpec::new(7, BreakEnd)]);
        assert_eq!(table.hit(0x10).unwrap().capture, Capture::All);
        let end = table.hit(0x30).unwrap();
        assert!(end.terminal);
        assert!(!end.keep);
    }

    #[test]
    fn test_unknown_or_removed_address() {
        let mut table = armed(&[BreakpointSpec::new(3, Cycle)]);
        assert!(table.hit(0x11).is_none());
        assert!(table.mark_removed(0x10));
        assert!(table.hit(0x10).is_none());
        assert!(table.drain_installed().is_empty());
    }
}
