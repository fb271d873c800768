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

//! C2T Common - Shared functionality for C2T components
//!
//! This crate provides the data model shared by the test engine and the
//! `c2t` binary (test cases, breakpoint directives, execution dumps) together
//! with the logging setup used across the workspace.

/// Data model for test cases, breakpoint directives and execution dumps
pub mod types;

/// Logging setup and utilities for consistent logging across C2T components
pub mod logging;

pub use logging::*;
pub use types::*;
