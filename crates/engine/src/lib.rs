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

//! C2T Engine - differential CPU testing
//!
//! Runs small annotated C programs twice, once on an emulated CPU (the
//! target) and once natively under a debug stub (the oracle), stops both at
//! the annotated source lines, and compares the captured register and
//! variable values dump by dump.
//!
//! The pipeline is:
//! - [`annotation`] extracts breakpoint directives from test sources
//! - [`builder`] compiles each test for both machines, ahead of the run
//! - [`image`] reads load sections, line tables and variable locations
//! - [`session`] drives one remote-serial debug connection and emits dumps
//! - [`comparator`] checks the two dump streams in lockstep
//! - [`orchestrator`] launches processes and ties everything together

pub mod annotation;
pub mod builder;
pub mod comparator;
pub mod config;
pub mod error;
pub mod image;
pub mod orchestrator;
pub mod rsp;
pub mod session;

/// Toy machine and debug stub used to exercise the engine without emulators
pub mod test_utils;

pub use builder::Builder;
pub use comparator::{compare, ComparisonResult, Divergence, DivergenceKind};
pub use config::{C2tConfig, RunMode};
pub use error::{C2tError, C2tResult};
pub use orchestrator::{Orchestrator, RunOptions, RunSummary};
pub use session::DebugSession;
