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

use std::{collections::BTreeMap, fmt::Display};

use serde::{Deserialize, Serialize};

/// Snapshot of the observable program state at one breakpoint hit.
///
/// Registers are keyed by their observation alias (the name shared by both
/// toolchains), not by the architecture register name. Variable values are
/// raw bytes, scalars normalised to little-endian.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dump {
    /// Program counter at the hit.
    pub address: u64,
    /// Source line the hit belongs to.
    pub line: u32,
    /// Observed register values by alias.
    pub registers: BTreeMap<String, u64>,
    /// Captured variable values by name.
    #[serde(with = "hex_map")]
    pub variables: BTreeMap<String, Vec<u8>>,
}

impl Dump {
    /// Create an empty dump for a hit at `address` on `line`.
    pub fn new(address: u64, line: u32) -> Self {
        Self { address, line, ..Default::default() }
    }

    /// Add an observed register.
    pub fn with_register(mut self, alias: impl Into<String>, value: u64) -> Self {
        self.registers.insert(alias.into(), value);
        self
    }

    /// Add a captured variable.
    pub fn with_variable(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.variables.insert(name.into(), bytes.into());
        self
    }
}

impl Display for Dump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {} @ {:#x}", self.line, self.address)?;
        for (alias, value) in &self.registers {
            write!(f, " {alias}={value:#x}")?;
        }
        for (name, bytes) in &self.variables {
            write!(f, " {name}=[{}]", hex::encode(bytes))?;
        }
        Ok(())
    }
}

/// Item of a session's dump stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpEvent {
    /// A snapshot, in program execution order.
    Dump(Dump),
    /// The session finished; no more dumps follow.
    End,
}

mod hex_map {
    use std::collections::BTreeMap;

    use serde::{de::Error, Deserialize, Deserializer, Serialize, Serializer};

    pub(super) fn serialize<S: Serializer>(
        map: &BTreeMap<String, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        map.iter()
            .map(|(k, v)| (k, hex::encode(v)))
            .collect::<BTreeMap<_, _>>()
            .serialize(serializer)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<u8>>, D::Error> {
        BTreeMap::<String, String>::deserialize(deserializer)?
            .into_iter()
            .map(|(k, v)| hex::decode(&v).map(|bytes| (k, bytes)).map_err(D::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_display_lists_surface() {
        let dump = Dump::new(0x8000, 10).with_register("acc", 0x42).with_variable("c", [1u8, 0, 0, 0]);
        assert_eq!(dump.to_string(), "line 10 @ 0x8000 acc=0x42 c=[01000000]");
    }

    #[test]
    fn test_dump_json_uses_hex_variables() {
        let dump = Dump::new(4, 2).with_variable("a", [0xefu8, 0xcd]);
        let json = serde_json::to_value(&dump).unwrap();
        assert_eq!(json["variables"]["a"], "efcd");
        let back: Dump = serde_json::from_value(json).unwrap();
        assert_eq!(back, dump);
    }
}
