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

//! ELF executables with DWARF debug information.
//!
//! Sections and symbols come from the ELF headers (`goblin`); the line table,
//! variable locations and frame bases come from DWARF (`gimli`). Only the
//! compilation unit of the test source is considered, so runtime and library
//! code never contributes lines or variables.

use std::{
    collections::{BTreeMap, HashMap},
    ffi::OsStr,
    fs,
    ops::Range,
    path::Path,
};

use gimli::{
    AttributeValue, DebuggingInformationEntry, Dwarf, EndianSlice, EntriesTreeNode, Operation,
    RunTimeEndian, Unit, UnwindSection,
};
use goblin::elf::{header::EM_ARM, section_header::SHT_NOBITS, sym::STT_FUNC, Elf};
use tracing::debug;

use super::{
    FrameBase, LoadSection, ProgramImage, VariableInfo, VariableLocation, UPLOAD_SECTIONS,
};
use crate::{C2tError, C2tResult};

type Slice<'a> = EndianSlice<'a, RunTimeEndian>;

/// Typedef/qualifier chains longer than this are treated as unsupported.
const MAX_TYPE_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy)]
enum FrameBaseExpr {
    Register(u16),
    RegisterOffset(u16, i64),
    Cfa,
}

#[derive(Debug, Default)]
struct Collector {
    line_starts: BTreeMap<u32, Vec<u64>>,
    rows: BTreeMap<u64, u32>,
    variables: Vec<VariableInfo>,
    frame_bases: Vec<(Vec<Range<u64>>, FrameBaseExpr)>,
}

struct RawSection<'a> {
    address: u64,
    size: u64,
    data: &'a [u8],
    nobits: bool,
}

/// An ELF executable loaded for debugging.
#[derive(Debug)]
pub struct ElfImage {
    little_endian: bool,
    address_size: u8,
    sections: Vec<LoadSection>,
    symbols: HashMap<String, u64>,
    line_starts: BTreeMap<u32, Vec<u64>>,
    rows: BTreeMap<u64, u32>,
    variables: Vec<VariableInfo>,
    frame_bases: Vec<(Vec<Range<u64>>, FrameBaseExpr)>,
    debug_frame: Option<Vec<u8>>,
    eh_frame: Option<(u64, Vec<u8>)>,
}

impl ElfImage {
    /// Load the executable at `path`, built from the test source `source`.
    pub fn open(path: &Path, source: &Path) -> C2tResult<Self> {
        let bytes = fs::read(path).map_err(|e| {
            C2tError::debug_info(format!("cannot read {}: {e}", path.display()))
        })?;
        let source_name = source
            .file_name()
            .and_then(OsStr::to_str)
            .ok_or_else(|| C2tError::debug_info(format!("bad source path {}", source.display())))?;
        Self::parse(&bytes, source_name).map_err(|e| match e {
            C2tError::DebugInfo(msg) => C2tError::DebugInfo(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    /// Parse an executable image; `source_name` is the file name of the test source.
    pub fn parse(bytes: &[u8], source_name: &str) -> C2tResult<Self> {
        let elf = Elf::parse(bytes)?;
        let little_endian = elf.little_endian;
        let endian = if little_endian { RunTimeEndian::Little } else { RunTimeEndian::Big };
        let address_size = if elf.is_64 { 8 } else { 4 };

        let mut raw: HashMap<&str, RawSection<'_>> = HashMap::new();
        for header in &elf.section_headers {
            let Some(name) = elf.shdr_strtab.get_at(header.sh_name) else {
                continue;
            };
            let data = match header.file_range() {
                Some(range) => bytes.get(range).ok_or_else(|| {
                    C2tError::debug_info(format!("section {name} lies outside the file"))
                })?,
                None => &[],
            };
            raw.insert(
                name,
                RawSection {
                    address: header.sh_addr,
                    size: header.sh_size,
                    data,
                    nobits: header.sh_type == SHT_NOBITS,
                },
            );
        }

        let sections = UPLOAD_SECTIONS
            .iter()
            .filter_map(|name| {
                let section = raw.get(name)?;
                let data = if section.nobits {
                    vec![0; usize::try_from(section.size).ok()?]
                } else {
                    section.data.to_vec()
                };
                Some(LoadSection { name: name.to_string(), address: section.address, data })
            })
            .collect();

        let thumb = elf.header.e_machine == EM_ARM;
        let mut symbols = HashMap::new();
        for sym in elf.syms.iter() {
            let Some(name) = elf.strtab.get_at(sym.st_name) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            // Thumb function symbols carry the mode in bit 0
            let value = if thumb && sym.st_type() == STT_FUNC { sym.st_value & !1 } else { sym.st_value };
            symbols.entry(name.to_string()).or_insert(value);
        }

        let dwarf = Dwarf::load(|id| -> Result<_, gimli::Error> {
            let data = raw.get(id.name()).map(|s| s.data).unwrap_or(&[]);
            Ok(EndianSlice::new(data, endian))
        })?;

        let mut collector = Collector::default();
        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;
            let is_test_unit = unit
                .name
                .map(|name| file_name_matches(&name.to_string_lossy(), source_name))
                .unwrap_or(false);
            if !is_test_unit {
                continue;
            }
            collect_lines(&dwarf, &unit, source_name, &mut collector)?;
            let mut tree = unit.entries_tree(None)?;
            walk(&dwarf, &unit, tree.root()?, &[], &mut collector)?;
        }

        if collector.rows.is_empty() {
            return Err(C2tError::debug_info(format!(
                "no line information for {source_name} (was it compiled with -g?)"
            )));
        }
        for addresses in collector.line_starts.values_mut() {
            addresses.sort_unstable();
            addresses.dedup();
        }
        debug!(
            source = source_name,
            lines = collector.line_starts.len(),
            variables = collector.variables.len(),
            "Loaded debug information"
        );

        Ok(Self {
            little_endian,
            address_size,
            sections,
            symbols,
            line_starts: collector.line_starts,
            rows: collector.rows,
            variables: collector.variables,
            frame_bases: collector.frame_bases,
            debug_frame: raw.get(".debug_frame").map(|s| s.data.to_vec()),
            eh_frame: raw.get(".eh_frame").map(|s| (s.address, s.data.to_vec())),
        })
    }

    fn endian(&self) -> RunTimeEndian {
        if self.little_endian {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        }
    }

    /// Canonical frame address rule at `pc` from the call frame information.
    fn cfa(&self, pc: u64) -> C2tResult<FrameBase> {
        if let Some(data) = &self.debug_frame {
            let mut section = gimli::DebugFrame::new(data, self.endian());
            section.set_address_size(self.address_size);
            let bases = gimli::BaseAddresses::default();
            let mut ctx = gimli::UnwindContext::new();
            match section.unwind_info_for_address(
                &bases,
                &mut ctx,
                pc,
                gimli::DebugFrame::cie_from_offset,
            ) {
                Ok(row) => return cfa_rule(row.cfa(), pc),
                Err(gimli::Error::NoUnwindInfoForAddress) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if let Some((address, data)) = &self.eh_frame {
            let mut section = gimli::EhFrame::new(data, self.endian());
            section.set_address_size(self.address_size);
            let bases = gimli::BaseAddresses::default().set_eh_frame(*address);
            let mut ctx = gimli::UnwindContext::new();
            match section.unwind_info_for_address(
                &bases,
                &mut ctx,
                pc,
                gimli::EhFrame::cie_from_offset,
            ) {
                Ok(row) => return cfa_rule(row.cfa(), pc),
                Err(gimli::Error::NoUnwindInfoForAddress) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Err(C2tError::debug_info(format!("no call frame information covers {pc:#x}")))
    }
}

impl ProgramImage for ElfImage {
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
        self.line_starts.get(&line).cloned().unwrap_or_default()
    }

    fn line_at(&self, address: u64) -> Option<u32> {
        self.rows.range(..=address).next_back().map(|(_, line)| *line)
    }

    fn variables(&self) -> &[VariableInfo] {
        &self.variables
    }

    fn frame_base(&self, pc: u64) -> C2tResult<Option<FrameBase>> {
        let Some((_, expr)) =
            self.frame_bases.iter().find(|(ranges, _)| ranges.iter().any(|r| r.contains(&pc)))
        else {
            return Ok(None);
        };
        match *expr {
            FrameBaseExpr::Register(register) => Ok(Some(FrameBase { register, offset: 0 })),
            FrameBaseExpr::RegisterOffset(register, offset) => {
                Ok(Some(FrameBase { register, offset }))
            }
            FrameBaseExpr::Cfa => self.cfa(pc).map(Some),
        }
    }
}

fn cfa_rule<T: gimli::ReaderOffset>(rule: &gimli::CfaRule<T>, pc: u64) -> C2tResult<FrameBase> {
    match rule {
        gimli::CfaRule::RegisterAndOffset { register, offset } => {
            Ok(FrameBase { register: register.0, offset: *offset })
        }
        _ => Err(C2tError::debug_info(format!("CFA at {pc:#x} is not register-relative"))),
    }
}

fn file_name_matches(path: &str, source_name: &str) -> bool {
    Path::new(path).file_name() == Some(OsStr::new(source_name))
}

fn collect_lines<'a>(
    dwarf: &Dwarf<Slice<'a>>,
    unit: &Unit<Slice<'a>>,
    source_name: &str,
    out: &mut Collector,
) -> C2tResult<()> {
    let Some(program) = unit.line_program.clone() else {
        return Ok(());
    };
    let mut rows = program.rows();
    let mut previous: Option<u32> = None;
    while let Some((header, row)) = rows.next_row()? {
        if row.end_sequence() {
            previous = None;
            continue;
        }
        let in_source = match row.file(header) {
            Some(file) => {
                let name = dwarf.attr_string(unit, file.path_name())?;
                file_name_matches(&name.to_string_lossy(), source_name)
            }
            None => false,
        };
        let current = match row.line() {
            Some(line) if in_source => u32::try_from(line.get()).ok(),
            _ => None,
        };
        if let Some(line) = current {
            out.rows.insert(row.address(), line);
            // Rows continuing the line they follow are not new entry points
            if row.is_stmt() && previous != Some(line) {
                out.line_starts.entry(line).or_default().push(row.address());
            }
        }
        previous = current;
    }
    Ok(())
}

fn walk<'a>(
    dwarf: &Dwarf<Slice<'a>>,
    unit: &Unit<Slice<'a>>,
    node: EntriesTreeNode<'_, '_, '_, Slice<'a>>,
    scope: &[Range<u64>],
    out: &mut Collector,
) -> C2tResult<()> {
    let entry = node.entry();
    let mut inner = scope.to_vec();
    match entry.tag() {
        gimli::DW_TAG_subprogram | gimli::DW_TAG_lexical_block => {
            let ranges = die_ranges(dwarf, unit, entry)?;
            if entry.tag() == gimli::DW_TAG_subprogram {
                if let Some(expr) = frame_base_expr(unit, entry)? {
                    out.frame_bases.push((ranges.clone(), expr));
                }
            }
            if !ranges.is_empty() {
                inner = ranges;
            }
        }
        gimli::DW_TAG_variable | gimli::DW_TAG_formal_parameter => {
            if let Some(var) = variable(dwarf, unit, entry, scope)? {
                out.variables.push(var);
            }
        }
        _ => {}
    }
    let mut children = node.children();
    while let Some(child) = children.next()? {
        walk(dwarf, unit, child, &inner, out)?;
    }
    Ok(())
}

fn die_ranges<'a>(
    dwarf: &Dwarf<Slice<'a>>,
    unit: &Unit<Slice<'a>>,
    entry: &DebuggingInformationEntry<'_, '_, Slice<'a>>,
) -> C2tResult<Vec<Range<u64>>> {
    let mut ranges = Vec::new();
    let mut iter = dwarf.die_ranges(unit, entry)?;
    while let Some(range) = iter.next()? {
        if range.begin < range.end {
            ranges.push(range.begin..range.end);
        }
    }
    Ok(ranges)
}

fn frame_base_expr<'a>(
    unit: &Unit<Slice<'a>>,
    entry: &DebuggingInformationEntry<'_, '_, Slice<'a>>,
) -> C2tResult<Option<FrameBaseExpr>> {
    let Some(AttributeValue::Exprloc(expr)) = entry.attr_value(gimli::DW_AT_frame_base)? else {
        return Ok(None);
    };
    let mut ops = expr.operations(unit.encoding());
    Ok(match ops.next()? {
        Some(Operation::Register { register }) => Some(FrameBaseExpr::Register(register.0)),
        Some(Operation::RegisterOffset { register, offset, .. }) => {
            Some(FrameBaseExpr::RegisterOffset(register.0, offset))
        }
        Some(Operation::CallFrameCFA) => Some(FrameBaseExpr::Cfa),
        _ => None,
    })
}

fn variable<'a>(
    dwarf: &Dwarf<Slice<'a>>,
    unit: &Unit<Slice<'a>>,
    entry: &DebuggingInformationEntry<'_, '_, Slice<'a>>,
    scope: &[Range<u64>],
) -> C2tResult<Option<VariableInfo>> {
    let Some(name) = entry.attr_value(gimli::DW_AT_name)? else {
        return Ok(None);
    };
    let name = dwarf.attr_string(unit, name)?.to_string_lossy().into_owned();
    let Some(AttributeValue::Exprloc(expr)) = entry.attr_value(gimli::DW_AT_location)? else {
        debug!(variable = %name, "Skipping variable without a simple location");
        return Ok(None);
    };
    let mut ops = expr.operations(unit.encoding());
    let location = match ops.next()? {
        Some(Operation::Address { address }) => VariableLocation::Static(address),
        Some(Operation::AddressIndex { index }) => {
            VariableLocation::Static(dwarf.address(unit, index)?)
        }
        Some(Operation::FrameOffset { offset }) => VariableLocation::FrameOffset(offset),
        Some(Operation::Register { register }) => VariableLocation::Register(register.0),
        Some(Operation::RegisterOffset { register, offset, .. }) => {
            VariableLocation::RegisterOffset { register: register.0, offset }
        }
        _ => {
            debug!(variable = %name, "Skipping variable with unsupported location expression");
            return Ok(None);
        }
    };
    let Some((size, scalar)) = type_size(unit, entry)? else {
        debug!(variable = %name, "Skipping variable of unsized type");
        return Ok(None);
    };
    Ok(Some(VariableInfo { name, location, size, scalar, scope: scope.to_vec() }))
}

/// Byte size of the entry's type and whether it is a scalar.
fn type_size<'a>(
    unit: &Unit<Slice<'a>>,
    entry: &DebuggingInformationEntry<'_, '_, Slice<'a>>,
) -> C2tResult<Option<(u64, bool)>> {
    let mut next = entry.attr_value(gimli::DW_AT_type)?;
    for _ in 0..MAX_TYPE_DEPTH {
        let Some(AttributeValue::UnitRef(offset)) = next else {
            return Ok(None);
        };
        let die = unit.entry(offset)?;
        let byte_size = die.attr_value(gimli::DW_AT_byte_size)?.and_then(|v| v.udata_value());
        match die.tag() {
            gimli::DW_TAG_base_type | gimli::DW_TAG_enumeration_type => {
                return Ok(byte_size.map(|size| (size, true)))
            }
            gimli::DW_TAG_pointer_type => {
                let size = byte_size.unwrap_or_else(|| u64::from(unit.encoding().address_size));
                return Ok(Some((size, true)));
            }
            gimli::DW_TAG_structure_type | gimli::DW_TAG_union_type | gimli::DW_TAG_array_type => {
                return Ok(byte_size.map(|size| (size, false)))
            }
            gimli::DW_TAG_typedef
            | gimli::DW_TAG_volatile_type
            | gimli::DW_TAG_const_type
            | gimli::DW_TAG_restrict_type => {
                next = die.attr_value(gimli::DW_AT_type)?;
            }
            _ => return Ok(None),
        }
    }
    Ok(None)
}
