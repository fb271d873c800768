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

//! In-memory program images for the toy machine.

use std::{collections::BTreeMap, fs, path::Path};

use c2t_common::Artifact;
use serde::{Deserialize, Serialize};

use super::machine::{Insn, INSN_SIZE};
use crate::{
    image::{FrameBase, ImageLoader, LoadSection, ProgramImage, VariableInfo, VariableLocation},
    C2tError, C2tResult,
};

/// A [`ProgramImage`] whose debug information is spelled out by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryImage {
    /// Byte order of scalars
    pub little_endian: bool,
    /// Loadable sections
    pub sections: Vec<LoadSection>,
    /// Symbol addresses
    pub symbols: BTreeMap<String, u64>,
    /// Line → addresses where the line starts
    pub lines: BTreeMap<u32, Vec<u64>>,
    /// Declared variables
    pub variables: Vec<VariableInfo>,
    /// Frame base used for every PC
    pub frame_base: Option<FrameBase>,
}

impl Default for MemoryImage {
    fn default() -> Self {
        Self {
            little_endian: true,
            sections: Vec::new(),
            symbols: BTreeMap::new(),
            lines: BTreeMap::new(),
            variables: Vec::new(),
            frame_base: None,
        }
    }
}

impl MemoryImage {
    /// Assemble `listing` at `base`. Each entry may start a source line;
    /// `main` is placed at `base`.
    pub fn assemble(base: u64, listing: &[(Option<u32>, Insn)]) -> Self {
        let mut image = Self::default().with_symbol("main", base);
        let mut text = Vec::new();
        for (i, (line, insn)) in listing.iter().enumerate() {
            if let Some(line) = line {
                image.lines.entry(*line).or_default().push(base + i as u64 * INSN_SIZE);
            }
            text.extend_from_slice(&insn.encode());
        }
        image.with_section(".text", base, text)
    }

    /// Add a section.
    pub fn with_section(mut self, name: &str, address: u64, data: Vec<u8>) -> Self {
        self.sections.push(LoadSection { name: name.to_string(), address, data });
        self
    }

    /// Add a symbol.
    pub fn with_symbol(mut self, name: &str, address: u64) -> Self {
        self.symbols.insert(name.to_string(), address);
        self
    }

    /// Map `line` to `addresses`.
    pub fn with_line(mut self, line: u32, addresses: &[u64]) -> Self {
        self.lines.insert(line, addresses.to_vec());
        self
    }

    /// Declare a 32-bit scalar at a fixed address, visible everywhere.
    pub fn with_static(mut self, name: &str, address: u64) -> Self {
        self.variables.push(VariableInfo {
            name: name.to_string(),
            location: VariableLocation::Static(address),
            size: 4,
            scalar: true,
            scope: Vec::new(),
        });
        self
    }

    /// Declare a variable.
    pub fn with_variable(mut self, variable: VariableInfo) -> Self {
        self.variables.push(variable);
        self
    }

    /// Set the frame base.
    pub fn with_frame_base(mut self, register: u16, offset: i64) -> Self {
        self.frame_base = Some(FrameBase { register, offset });
        self
    }

    /// Read an image written by [`save`](Self::save).
    pub fn read(path: &Path) -> C2tResult<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| C2tError::DebugInfo(format!("{}: {e}", path.display())))
    }

    /// Write the image as JSON.
    pub fn save(&self, path: &Path) -> C2tResult<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| C2tError::DebugInfo(format!("cannot encode image: {e}")))?;
        fs::write(path, text)?;
        Ok(())
    }
}

impl ProgramImage for MemoryImage {
    fn little_endian(&self) -> bool {
        self.little_endian
    }

    fn sections(&self) -> &[LoadSection] {
        &self.sections
    }

    fn symbol(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    fn line_addresses(&self, line: u32) -> Vec<u64> {
        self.lines.get(&line).cloned().unwrap_or_default()
    }

    fn line_at(&self, address: u64) -> Option<u32> {
        self.lines
            .iter()
            .flat_map(|(line, addresses)| addresses.iter().map(move |a| (*a, *line)))
            .filter(|(a, _)| *a <= address)
            .max_by_key(|(a, _)| *a)
            .map(|(_, line)| line)
    }

    fn variables(&self) -> &[VariableInfo] {
        &self.variables
    }

    fn frame_base(&self, _pc: u64) -> C2tResult<Option<FrameBase>> {
        Ok(self.frame_base)
    }
}

/// Loads artifacts that are JSON-encoded [`MemoryImage`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonImageLoader;

impl ImageLoader for JsonImageLoader {
    fn load(&self, artifact: &Artifact) -> C2tResult<Box<dyn ProgramImage>> {
        Ok(Box::new(MemoryImage::read(&artifact.path)?))
    }
}
