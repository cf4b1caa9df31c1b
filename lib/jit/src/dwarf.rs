//! DWARF line-table consumption.
//!
//! The code generator emits one line-table row per WebAssembly operator,
//! with the DWARF line number carrying the operator index. This module
//! walks the (already relocated) line programs once per load and answers
//! per-function range queries, yielding the offset → operator-index maps
//! attached to each [`crate::JitFunction`].

use gimli::{EndianSlice, LittleEndian, SectionId};
use std::collections::{BTreeMap, HashMap};

/// All line-table rows of one object, sorted by loaded address.
pub(crate) struct LineInfoTable {
    rows: Vec<(u64, u32)>,
}

impl LineInfoTable {
    /// Parses every line program in the object's relocated DWARF sections.
    /// Missing sections read as empty; an object without debug info yields
    /// an empty table.
    pub fn parse(debug_sections: &HashMap<String, Vec<u8>>) -> Result<Self, gimli::Error> {
        let dwarf = gimli::Dwarf::load(|id: SectionId| {
            let bytes = debug_sections
                .get(id.name())
                .map(|bytes| bytes.as_slice())
                .unwrap_or(&[]);
            Ok::<_, gimli::Error>(EndianSlice::new(bytes, LittleEndian))
        })?;

        let mut rows = Vec::new();
        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;
            let Some(program) = unit.line_program.clone() else {
                continue;
            };
            let mut iter = program.rows();
            while let Some((_, row)) = iter.next_row()? {
                if row.end_sequence() {
                    continue;
                }
                // The line number is the operator index; line 0 is
                // operator 0.
                let op_index = row.line().map(|line| line.get() as u32).unwrap_or(0);
                rows.push((row.address(), op_index));
            }
        }
        rows.sort_unstable_by_key(|&(address, _)| address);
        Ok(Self { rows })
    }

    /// The offset → operator-index map for the function occupying
    /// `[base_address, base_address + num_bytes)`.
    pub fn offset_to_op_index(&self, base_address: usize, num_bytes: usize) -> BTreeMap<u32, u32> {
        let base = base_address as u64;
        let end = base + num_bytes as u64;
        let start = self.rows.partition_point(|&(address, _)| address < base);

        let mut map = BTreeMap::new();
        for &(address, op_index) in &self.rows[start..] {
            if address >= end {
                break;
            }
            map.insert((address - base) as u32, op_index);
        }
        map
    }
}
