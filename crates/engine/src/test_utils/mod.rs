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

//! A toy CPU with a remote-serial stub, standing in for an emulator and a
//! native debug stub so the whole pipeline runs without external tools.

mod image;
mod machine;
mod stub;

pub use image::{JsonImageLoader, MemoryImage};
pub use machine::{assemble, Insn, Step, ToyMachine, INSN_SIZE, MEMORY_SIZE, REGISTERS};
pub use stub::{MockStub, Served, STEP_LIMIT};
