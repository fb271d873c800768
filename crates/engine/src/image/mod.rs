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

//! Program images: what a debug session needs to know about an executable.
//!
//! A [`ProgramImage`] exposes the loadable sections, symbols, the line table
//! of the test's own source file and the variables declared in it. The ELF
//! implementation lives in [`elf`]; sessions only depend on the trait.

use std::{ops::Range, sync::Arc};

use c2t_common::Artifact;
use serde::{Deserialize, Serialize};

use crate::C2tResult;

pub mod elf;

pub use elf::ElfImage;

/// Sections uploaded to an emulated device, in upload order.
pub const UPLOAD_SECTIONS: [&str; 4] = [".text", ".rodata", ".data", ".bss"];

/// A loadable section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSection {
    /// Section name, e.g. `.text`
    pub name: String,
    /// Load address
    pub address: u64,
    /// Contents (zero-filled for `.bss`)
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

/// Where a variable lives while the program runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableLocation {
    /// Fixed address
    Static(u64),
    /// Offset from the enclosing function's frame base
    FrameOffset(i64),
    /// Held in a register (DWARF numbering)
    Register(u16),
    /// Offset from a register value (DWARF numbering)
    RegisterOffset {
        /// DWARF register number
        register: u16,
        /// Byte offset
        offset: i64,
    },
}

/// A named variable declared in the test source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableInfo {
    /// Variable name
    pub name: String,
    /// Location expression
    pub location: VariableLocation,
    /// Size in bytes
    pub size: u64,
    /// Whether the value is a single scalar subject to byte order
    pub scalar: bool,
    /// PC ranges where the variable is in scope; empty means everywhere
    pub scope: Vec<Range<u64>>,
}

impl VariableInfo {
    /// Whether the variable can be read when stopped at `pc`.
    pub fn visible_at(&self, pc: u64) -> bool {
        self.scope.is_empty() || self.scope.iter().any(|r| r.contains(&pc))
    }
}

/// The frame base of the function executing at some PC: `register + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameBase {
    /// DWARF register number
    pub register: u16,
    /// Byte offset added to the register value
    pub offset: i64,
}

/// Debug information and loadable contents of one executable.
pub trait ProgramImage: Send + Sync + std::fmt::Debug {
    /// Whether the target stores scalars little-endian.
    fn little_endian(&self) -> bool;

    /// Loadable sections.
    fn sections(&self) -> &[LoadSection];

    /// Section named `name`.
    fn section(&self, name: &str) -> Option<&LoadSection> {
        self.sections().iter().find(|s| s.name == name)
    }

    /// Address of symbol `name`.
    fn symbol(&self, name: &str) -> Option<u64>;

    /// Addresses where execution of source `line` starts.
    fn line_addresses(&self, line: u32) -> Vec<u64>;

    /// Source line containing `address`.
    fn line_at(&self, address: u64) -> Option<u32>;

    /// Variables declared in the test source.
    fn variables(&self) -> &[VariableInfo];

    /// Frame base of the function executing at `pc`.
    fn frame_base(&self, pc: u64) -> C2tResult<Option<FrameBase>>;
}

/// Produces a [`ProgramImage`] for a built artifact.
pub trait ImageLoader: Send + Sync {
    /// Load the image of `artifact`.
    fn load(&self, artifact: &Artifact) -> C2tResult<Box<dyn ProgramImage>>;
}

/// Loads artifacts as ELF executables with DWARF debug info.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElfLoader;

impl ImageLoader for ElfLoader {
    fn load(&self, artifact: &Artifact) -> C2tResult<Box<dyn ProgramImage>> {
        Ok(Box::new(ElfImage::open(&artifact.path, artifact.test.source())?))
    }
}

impl<T: ImageLoader + ?Sized> ImageLoader for Arc<T> {
    fn load(&self, artifact: &Artifact) -> C2tResult<Box<dyn ProgramImage>> {
        (**self).load(artifact)
    }
}

pub(crate) mod hex_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(D::Error::custom)
    }
}
