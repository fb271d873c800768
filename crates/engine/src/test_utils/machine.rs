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

//! A toy CPU for exercising debug sessions without a real emulator.
//!
//! Six 32-bit registers (`r0`..`r3`, `sp`, `pc`) and 64 KiB of memory.
//! Every instruction is eight bytes: opcode, destination register, source
//! register, padding, then a little-endian 32-bit immediate.

use std::collections::BTreeSet;

/// Size of one encoded instruction.
pub const INSN_SIZE: u64 = 8;

/// Bytes of addressable memory.
pub const MEMORY_SIZE: usize = 0x1_0000;

/// Register names in `g` packet order.
pub const REGISTERS: [&str; 6] = ["r0", "r1", "r2", "r3", "sp", "pc"];

const SP: usize = 4;
const PC: usize = 5;

/// A toy instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insn {
    /// Stop the program with exit status 0
    Halt,
    /// `rd = imm`
    Li(u8, u32),
    /// `rd = rd + rs`
    Add(u8, u8),
    /// `rd = rd - rs`
    Sub(u8, u8),
    /// `mem32[imm] = rd`
    St(u8, u32),
    /// `rd = mem32[imm]`
    Ld(u8, u32),
    /// `rd -= 1; if rd != 0 { pc = imm }`
    Djnz(u8, u32),
}

impl Insn {
    /// Encode to the eight-byte instruction format.
    pub fn encode(self) -> [u8; 8] {
        let (op, rd, rs, imm) = match self {
            Self::Halt => (0x00, 0, 0, 0),
            Self::Li(rd, imm) => (0x01, rd, 0, imm),
            Self::Add(rd, rs) => (0x02, rd, rs, 0),
            Self::Sub(rd, rs) => (0x03, rd, rs, 0),
            Self::St(rd, imm) => (0x04, rd, 0, imm),
            Self::Ld(rd, imm) => (0x05, rd, 0, imm),
            Self::Djnz(rd, imm) => (0x06, rd, 0, imm),
        };
        let imm = imm.to_le_bytes();
        [op, rd, rs, 0, imm[0], imm[1], imm[2], imm[3]]
    }
}

/// Encode a sequence of instructions.
pub fn assemble(program: &[Insn]) -> Vec<u8> {
    program.iter().flat_map(|insn| insn.encode()).collect()
}

/// Result of executing one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Ready for the next instruction
    Continue,
    /// Executed `Halt`
    Halted,
    /// Bad opcode, register or address
    Fault,
}

/// Machine state.
#[derive(Debug, Clone)]
pub struct ToyMachine {
    regs: [u32; 6],
    memory: Vec<u8>,
    /// Software breakpoint addresses
    pub breakpoints: BTreeSet<u32>,
    /// Set once the program halted or faulted
    pub exited: Option<u8>,
}

impl Default for ToyMachine {
    fn default() -> Self {
        Self { regs: [0; 6], memory: vec![0; MEMORY_SIZE], breakpoints: BTreeSet::new(), exited: None }
    }
}

impl ToyMachine {
    /// Register `index`.
    pub fn reg(&self, index: usize) -> Option<u32> {
        self.regs.get(index).copied()
    }

    /// Set register `index`; false if there is no such register.
    pub fn set_reg(&mut self, index: usize, value: u32) -> bool {
        match self.regs.get_mut(index) {
            Some(reg) => {
                *reg = value;
                true
            }
            None => false,
        }
    }

    /// Program counter.
    pub fn pc(&self) -> u32 {
        self.regs[PC]
    }

    /// Set the program counter and stack pointer.
    pub fn boot(&mut self, pc: u32, sp: u32) {
        self.regs[PC] = pc;
        self.regs[SP] = sp;
    }

    /// Registers in `g` order, each little-endian.
    pub fn register_bytes(&self) -> Vec<u8> {
        self.regs.iter().flat_map(|r| r.to_le_bytes()).collect()
    }

    /// Read `len` bytes at `address`.
    pub fn read(&self, address: u64, len: usize) -> Option<&[u8]> {
        let start = usize::try_from(address).ok()?;
        self.memory.get(start..start.checked_add(len)?)
    }

    /// Write `data` at `address`; false if out of range.
    pub fn write(&mut self, address: u64, data: &[u8]) -> bool {
        let Ok(start) = usize::try_from(address) else {
            return false;
        };
        match start.checked_add(data.len()).and_then(|end| self.memory.get_mut(start..end)) {
            Some(target) => {
                target.copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    fn load32(&self, address: u32) -> Option<u32> {
        let bytes = self.read(u64::from(address), 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Execute the instruction at `pc`.
    pub fn step(&mut self) -> Step {
        let Some(insn) = self.read(u64::from(self.pc()), INSN_SIZE as usize) else {
            self.exited = Some(0x0b);
            return Step::Fault;
        };
        let (op, rd, rs) = (insn[0], usize::from(insn[1]), usize::from(insn[2]));
        let imm = u32::from_le_bytes([insn[4], insn[5], insn[6], insn[7]]);
        if rd >= 4 || rs >= 4 {
            self.exited = Some(0x04);
            return Step::Fault;
        }
        let next = self.pc().wrapping_add(INSN_SIZE as u32);
        self.regs[PC] = next;
        match op {
            0x00 => {
                self.exited = Some(0);
                return Step::Halted;
            }
            0x01 => self.regs[rd] = imm,
            0x02 => self.regs[rd] = self.regs[rd].wrapping_add(self.regs[rs]),
            0x03 => self.regs[rd] = self.regs[rd].wrapping_sub(self.regs[rs]),
            0x04 => {
                let value = self.regs[rd].to_le_bytes();
                if !self.write(u64::from(imm), &value) {
                    self.exited = Some(0x0b);
                    return Step::Fault;
                }
            }
            0x05 => match self.load32(imm) {
                Some(value) => self.regs[rd] = value,
                None => {
                    self.exited = Some(0x0b);
                    return Step::Fault;
                }
            },
            0x06 => {
                self.regs[rd] = self.regs[rd].wrapping_sub(1);
                if self.regs[rd] != 0 {
                    self.regs[PC] = imm;
                }
            }
            _ => {
                self.exited = Some(0x04);
                return Step::Fault;
            }
        }
        Step::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(program: &[Insn]) -> ToyMachine {
        let mut machine = ToyMachine::default();
        assert!(machine.write(0x100, &assemble(program)));
        machine.boot(0x100, 0xf000);
        while machine.step() == Step::Continue {}
        machine
    }

    #[test]
    fn test_arithmetic_and_memory() {
        let machine = run(&[
            Insn::Li(0, 0x10),
            Insn::Li(1, 0x20),
            Insn::Add(0, 1),
            Insn::St(0, 0x2000),
            Insn::Ld(2, 0x2000),
            Insn::Sub(2, 1),
            Insn::Halt,
        ]);
        assert_eq!(machine.exited, Some(0));
        assert_eq!(machine.reg(0), Some(0x30));
        assert_eq!(machine.reg(2), Some(0x10));
        assert_eq!(machine.read(0x2000, 4), Some(&[0x30, 0, 0, 0][..]));
    }

    #[test]
    fn test_loop_counts_down() {
        // r1 counts 3..1, r0 accumulates r2 each pass
        let machine = run(&[
            Insn::Li(1, 3),
            Insn::Li(2, 5),
            Insn::Add(0, 2),
            Insn::Djnz(1, 0x110),
            Insn::Halt,
        ]);
        assert_eq!(machine.reg(0), Some(15));
        assert_eq!(machine.reg(1), Some(0));
    }

    #[test]
    fn test_fault_on_bad_opcode() {
        let mut machine = ToyMachine::default();
        machine.write(0, &[0xff, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(machine.step(), Step::Fault);
        assert_eq!(machine.exited, Some(0x04));
    }
}
