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

//! Register file layouts of the supported architectures.
//!
//! A layout describes the `g` packet of the remote-serial protocol: register
//! names in transfer order, their widths, the byte order, which registers are
//! the program counter and the stack pointer, and how DWARF register numbers
//! map onto register names.

use serde::{Deserialize, Serialize};

use crate::{C2tError, C2tResult};

/// One register in a `g` packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterInfo {
    /// Register name
    pub name: String,
    /// Width in bits, a multiple of 8 and at most 64
    pub bits: u32,
}

/// Register file layout of one architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterLayout {
    registers: Vec<RegisterInfo>,
    little_endian: bool,
    pc: String,
    sp: String,
    dwarf: Vec<String>,
    breakpoint_kind: u32,
}

fn numbered(prefix: &str, count: usize) -> impl Iterator<Item = String> + '_ {
    (0..count).map(move |n| format!("{prefix}{n}"))
}

fn sized(names: impl IntoIterator<Item = String>, bits: u32) -> Vec<RegisterInfo> {
    names.into_iter().map(|name| RegisterInfo { name, bits }).collect()
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl RegisterLayout {
    /// Names of the built-in architecture presets.
    pub const PRESETS: [&'static str; 6] = ["arm", "aarch64", "i386", "x86_64", "riscv32", "riscv64"];

    /// Create a layout from its parts. DWARF numbering defaults to the
    /// register order.
    pub fn new(
        registers: Vec<RegisterInfo>,
        little_endian: bool,
        pc: impl Into<String>,
        sp: impl Into<String>,
    ) -> Self {
        let dwarf = registers.iter().map(|r| r.name.clone()).collect();
        Self { registers, little_endian, pc: pc.into(), sp: sp.into(), dwarf, breakpoint_kind: 4 }
    }

    /// Built-in layout for `arch`, if there is one.
    pub fn preset(arch: &str) -> Option<Self> {
        let layout = match arch {
            "arm" => {
                let regs: Vec<String> =
                    numbered("r", 13).chain(names(&["sp", "lr", "pc"])).collect();
                Self::new(sized(regs, 32), true, "pc", "sp")
            }
            "aarch64" => {
                let mut regs = sized(numbered("x", 31).chain(names(&["sp", "pc"])), 64);
                regs.push(RegisterInfo { name: "cpsr".into(), bits: 32 });
                let dwarf = numbered("x", 31).chain(names(&["sp"])).collect();
                Self::new(regs, true, "pc", "sp").with_dwarf_names(dwarf)
            }
            "i386" => {
                let regs =
                    names(&["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "eip", "eflags"]);
                Self::new(sized(regs, 32), true, "eip", "esp").with_breakpoint_kind(1)
            }
            "x86_64" => {
                let mut regs = sized(
                    names(&["rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp"])
                        .into_iter()
                        .chain(numbered("r", 16).skip(8))
                        .chain(names(&["rip"])),
                    64,
                );
                regs.push(RegisterInfo { name: "eflags".into(), bits: 32 });
                let dwarf = names(&["rax", "rdx", "rcx", "rbx", "rsi", "rdi", "rbp", "rsp"])
                    .into_iter()
                    .chain(numbered("r", 16).skip(8))
                    .chain(names(&["rip"]))
                    .collect();
                Self::new(regs, true, "rip", "rsp").with_dwarf_names(dwarf).with_breakpoint_kind(1)
            }
            "riscv32" => {
                let regs: Vec<String> = numbered("x", 32).chain(names(&["pc"])).collect();
                Self::new(sized(regs, 32), true, "pc", "x2")
            }
            "riscv64" => {
                let regs: Vec<String> = numbered("x", 32).chain(names(&["pc"])).collect();
                Self::new(sized(regs, 64), true, "pc", "x2")
            }
            _ => return None,
        };
        Some(layout)
    }

    /// Override the DWARF register numbering (index = DWARF number).
    pub fn with_dwarf_names(mut self, dwarf: Vec<String>) -> Self {
        self.dwarf = dwarf;
        self
    }

    /// Override the byte order of register values.
    pub fn with_little_endian(mut self, little_endian: bool) -> Self {
        self.little_endian = little_endian;
        self
    }

    /// Override which registers are the program counter and stack pointer.
    pub fn with_roles(mut self, pc: impl Into<String>, sp: impl Into<String>) -> Self {
        self.pc = pc.into();
        self.sp = sp.into();
        self
    }

    /// Override the `kind` argument of software breakpoint packets.
    pub fn with_breakpoint_kind(mut self, kind: u32) -> Self {
        self.breakpoint_kind = kind;
        self
    }

    /// Registers in transfer order.
    pub fn registers(&self) -> &[RegisterInfo] {
        &self.registers
    }

    /// Whether register values are transferred little-endian.
    pub fn little_endian(&self) -> bool {
        self.little_endian
    }

    /// Name of the program counter.
    pub fn pc(&self) -> &str {
        &self.pc
    }

    /// Name of the stack pointer.
    pub fn sp(&self) -> &str {
        &self.sp
    }

    /// `kind` argument for `Z0`/`z0` packets.
    pub fn breakpoint_kind(&self) -> u32 {
        self.breakpoint_kind
    }

    /// Position of `name` in the register file.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.registers.iter().position(|r| r.name == name)
    }

    /// Register name of DWARF register `number`.
    pub fn dwarf_name(&self, number: u16) -> Option<&str> {
        self.dwarf.get(usize::from(number)).map(String::as_str)
    }

    /// Check the layout is usable: widths, unique names, PC/SP present.
    pub fn check(&self) -> Result<(), String> {
        if self.registers.is_empty() {
            return Err("register list is empty".into());
        }
        for (i, reg) in self.registers.iter().enumerate() {
            if reg.bits == 0 || reg.bits % 8 != 0 || reg.bits > 64 {
                return Err(format!("register `{}` has unsupported width {}", reg.name, reg.bits));
            }
            if self.registers[..i].iter().any(|r| r.name == reg.name) {
                return Err(format!("register `{}` is listed twice", reg.name));
            }
        }
        for (role, name) in [("pc", &self.pc), ("sp", &self.sp)] {
            if self.index_of(name).is_none() {
                return Err(format!("{role} register `{name}` is not in the register list"));
            }
        }
        Ok(())
    }

    /// Decode the hex payload of a `g` reply.
    ///
    /// Stubs may send fewer registers than the layout lists, decoding stops
    /// where the payload ends. Registers reported as unavailable (`xx`) are
    /// left out.
    pub fn decode(&self, payload: &str) -> C2tResult<RegisterFile> {
        let mut values = Vec::with_capacity(self.registers.len());
        let mut rest = payload.as_bytes();
        for reg in &self.registers {
            let digits = (reg.bits / 4) as usize;
            if rest.len() < digits {
                break;
            }
            let (field, tail) = rest.split_at(digits);
            rest = tail;
            if field.iter().all(|&c| c == b'x' || c == b'X') {
                continue;
            }
            let bytes = hex::decode(field).map_err(|e| {
                C2tError::protocol(format!("bad register value for `{}`: {e}", reg.name))
            })?;
            values.push((reg.name.clone(), self.bytes_to_value(&bytes)));
        }
        if values.is_empty() {
            return Err(C2tError::protocol("register reply carries no registers"));
        }
        Ok(RegisterFile { values })
    }

    /// Encode `value` as the hex payload for register `index`.
    pub fn encode(&self, index: usize, value: u64) -> C2tResult<String> {
        let reg = self
            .registers
            .get(index)
            .ok_or_else(|| C2tError::protocol(format!("no register at index {index}")))?;
        let width = (reg.bits / 8) as usize;
        let bytes = if self.little_endian {
            value.to_le_bytes()[..width].to_vec()
        } else {
            value.to_be_bytes()[8 - width..].to_vec()
        };
        Ok(hex::encode(bytes))
    }

    fn bytes_to_value(&self, bytes: &[u8]) -> u64 {
        let fold = |acc: u64, b: &u8| (acc << 8) | u64::from(*b);
        if self.little_endian {
            bytes.iter().rev().fold(0, fold)
        } else {
            bytes.iter().fold(0, fold)
        }
    }
}

/// Register values decoded from a `g` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterFile {
    values: Vec<(String, u64)>,
}

impl RegisterFile {
    /// Value of register `name`.
    pub fn get(&self, name: &str) -> Option<u64> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    /// Value of register `name`, as a protocol error when absent.
    pub fn require(&self, name: &str) -> C2tResult<u64> {
        self.get(name)
            .ok_or_else(|| C2tError::protocol(format!("stub did not report register `{name}`")))
    }

    /// All decoded registers in transfer order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.values.iter().map(|(n, v)| (n.as_str(), *v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_consistent() {
        for arch in RegisterLayout::PRESETS {
            let layout = RegisterLayout::preset(arch).unwrap();
            layout.check().unwrap_or_else(|e| panic!("{arch}: {e}"));
        }
        assert!(RegisterLayout::preset("pdp11").is_none());
    }

    #[test]
    fn test_dwarf_numbering() {
        let x86 = RegisterLayout::preset("x86_64").unwrap();
        assert_eq!(x86.dwarf_name(1), Some("rdx"));
        assert_eq!(x86.dwarf_name(6), Some("rbp"));
        assert_eq!(x86.dwarf_name(16), Some("rip"));
        let arm = RegisterLayout::preset("arm").unwrap();
        assert_eq!(arm.dwarf_name(11), Some("r11"));
        assert_eq!(arm.dwarf_name(13), Some("sp"));
    }

    #[test]
    fn test_decode_little_endian_truncated_payload() {
        let arm = RegisterLayout::preset("arm").unwrap();
        // r0 = 0x12345678, r1 unavailable, r2 = 1
        let regs = arm.decode("78563412xxxxxxxx01000000").unwrap();
        assert_eq!(regs.get("r0"), Some(0x1234_5678));
        assert_eq!(regs.get("r1"), None);
        assert_eq!(regs.get("r2"), Some(1));
        assert_eq!(regs.get("pc"), None);
    }

    #[test]
    fn test_decode_big_endian() {
        let layout = RegisterLayout::new(
            vec![
                RegisterInfo { name: "d0".into(), bits: 32 },
                RegisterInfo { name: "pc".into(), bits: 16 },
            ],
            false,
            "pc",
            "d0",
        );
        let regs = layout.decode("000001000400").unwrap();
        assert_eq!(regs.get("d0"), Some(0x100));
        assert_eq!(regs.get("pc"), Some(0x400));
    }

    #[test]
    fn test_encode_matches_decode() {
        let x86 = RegisterLayout::preset("x86_64").unwrap();
        let rip = x86.index_of("rip").unwrap();
        assert_eq!(x86.encode(rip, 0x401000).unwrap(), "0010400000000000");
        let arm = RegisterLayout::preset("arm").unwrap();
        assert_eq!(arm.encode(13, 0x2000_0000).unwrap(), "00000020");
    }

    #[test]
    fn test_check_rejects_missing_pc() {
        let layout = RegisterLayout::new(
            vec![RegisterInfo { name: "r0".into(), bits: 32 }],
            true,
            "pc",
            "r0",
        );
        assert!(layout.check().unwrap_err().contains("pc register"));
    }
}
