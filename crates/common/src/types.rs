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

//! Shared data model of the CPU testing tool.
//!
//! - [`TestCase`] / [`Artifact`] / [`Arch`] describe what gets built and for which architecture
//! - [`BreakpointCommand`] / [`BreakpointSpec`] describe the directives embedded in test sources
//! - [`Dump`] / [`DumpEvent`] carry the execution snapshots compared between toolchains

mod breakpoint;
mod dump;
mod test_case;

pub use breakpoint::*;
pub use dump::*;
pub use test_case::*;
