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

use std::{
    fmt::Display,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

/// Architecture identifier, also used as the binary-name suffix.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Arch(String);

impl Arch {
    /// Create an architecture identifier.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Arch {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// One annotated test source file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TestCase {
    name: String,
    source: PathBuf,
}

impl TestCase {
    /// Create a test case from its source path. The name is the file stem.
    ///
    /// Returns `None` for paths without a usable file stem.
    pub fn from_path(source: impl Into<PathBuf>) -> Option<Self> {
        let source = source.into();
        let name = source.file_stem()?.to_str()?.to_string();
        if name.is_empty() {
            return None;
        }
        Some(Self { name, source })
    }

    /// Test name (source file stem).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the source file.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Base name of the intermediate representation for `arch`.
    pub fn ir_name(&self, arch: &Arch) -> String {
        format!("{}_{arch}_ir", self.name)
    }

    /// Base name of the executable for `arch`.
    pub fn binary_name(&self, arch: &Arch) -> String {
        format!("{}_{arch}", self.name)
    }
}

impl Display for TestCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// An executable produced for one test on one architecture.
///
/// Handed from a builder to a debug session exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Test the artifact was built from.
    pub test: TestCase,
    /// Architecture it was built for.
    pub arch: Arch,
    /// Path of the executable.
    pub path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_derived_from_stem() {
        let test = TestCase::from_path("tests/add_u32_two_operands.c").unwrap();
        assert_eq!(test.name(), "add_u32_two_operands");

        let arm = Arch::from("arm");
        assert_eq!(test.binary_name(&arm), "add_u32_two_operands_arm");
        assert_eq!(test.ir_name(&arm), "add_u32_two_operands_arm_ir");
    }

    #[test]
    fn test_paths_without_stem_are_rejected() {
        assert!(TestCase::from_path("/").is_none());
        assert!(TestCase::from_path("").is_none());
    }
}
