//! Windows x86-64 SEH unwind registry and table fixup.
//!
//! The generic relocation pass does not touch `.pdata`/`.xdata`: their
//! 32-bit image-relative entries are applied here instead, from raw copies
//! saved before placement, with the personality-routine reference redirected
//! to a trampoline inside the image. The trampoline keeps the personality
//! field within the ±2 GB image-relative range even though
//! `__C_specific_handler` itself lives wherever the C runtime was mapped.

use crate::error::LoadError;
use crate::loader::{full_addend, relocation_value, write_relocation_value};
use crate::resolver::SymbolResolver;
use kiln_vm::ImageMemory;
use object::read::File;
use object::{Object, ObjectSection};
use std::collections::HashMap;
use std::mem;
use std::ptr;
use winapi::um::winnt;

/// The symbol every SEH personality reference resolves through.
const PERSONALITY_SYMBOL: &str = "__C_specific_handler";

/// An SEH function table registered with the platform.
#[derive(Debug)]
pub struct UnwindRegistration {
    function_table: usize,
}

impl UnwindRegistration {
    /// Registers the fixed-up `.pdata` range as the image's function table.
    pub unsafe fn register(
        image_base: *const u8,
        pdata: *const u8,
        pdata_len: usize,
    ) -> Result<Self, String> {
        let function_table = pdata as *mut winnt::RUNTIME_FUNCTION;
        let num_entries = (pdata_len / mem::size_of::<winnt::RUNTIME_FUNCTION>()) as u32;
        if winnt::RtlAddFunctionTable(function_table, num_entries, image_base as u64) == 0 {
            return Err("RtlAddFunctionTable failed".to_string());
        }
        Ok(Self {
            function_table: function_table as usize,
        })
    }
}

impl Drop for UnwindRegistration {
    fn drop(&mut self) {
        unsafe {
            winnt::RtlDeleteFunctionTable(self.function_table as *mut winnt::RUNTIME_FUNCTION);
        }
    }
}

/// Whether `name` is one of the SEH table sections the generic relocation
/// pass must leave alone.
pub fn is_seh_section(name: &str) -> bool {
    name == ".pdata" || name == ".xdata"
}

/// A raw copy of an SEH table section, taken before placement.
pub struct SavedSection {
    section_index: usize,
    bytes: Vec<u8>,
}

/// The saved `.pdata`/`.xdata` copies for one load.
pub struct SavedSehSections {
    pdata: Option<SavedSection>,
    xdata: Option<SavedSection>,
}

/// Copies the raw `.pdata` and `.xdata` bytes out of the object.
pub fn save_seh_sections(object_file: &File<'_>) -> Result<SavedSehSections, LoadError> {
    let mut pdata = None;
    let mut xdata = None;
    for section in object_file.sections() {
        let Ok(name) = section.name() else { continue };
        if !is_seh_section(name) {
            continue;
        }
        let saved = SavedSection {
            section_index: section.index().0,
            bytes: section.data()?.to_vec(),
        };
        if name == ".pdata" {
            pdata = Some(saved);
        } else {
            xdata = Some(saved);
        }
    }
    Ok(SavedSehSections { pdata, xdata })
}

/// Applies the image-relative SEH fixups.
///
/// Builds a 16-byte `jmp [rip+0]` trampoline to the personality routine in
/// the code section, restores the table bytes from the saved copies, and
/// re-applies their relocations with every value converted to an
/// image-relative 32-bit offset and personality references redirected to
/// the trampoline. Returns the loaded `.pdata` range to register.
pub fn process_seh_tables(
    object_file: &File<'_>,
    image: &mut ImageMemory,
    section_load_addresses: &HashMap<usize, usize>,
    resolver: &SymbolResolver<'_>,
    saved: SavedSehSections,
) -> Result<Option<(usize, usize)>, LoadError> {
    let Some(pdata) = saved.pdata else {
        return Ok(None);
    };

    let personality = resolver
        .resolve(PERSONALITY_SYMBOL)
        .ok_or_else(|| LoadError::UnresolvedSymbol(PERSONALITY_SYMBOL.to_string()))?;

    // jmp [rip+0]; dq personality
    let trampoline = image.allocate_code(16, 16);
    unsafe {
        trampoline.write(0xff);
        trampoline.add(1).write(0x25);
        ptr::write_bytes(trampoline.add(2), 0, 4);
        (trampoline.add(6) as *mut u64).write_unaligned(personality as u64);
    }

    let pdata_len = pdata.bytes.len();
    for saved_section in [Some(&pdata), saved.xdata.as_ref()].into_iter().flatten() {
        apply_seh_relocations(
            object_file,
            image,
            section_load_addresses,
            resolver,
            saved_section,
            trampoline as usize,
        )?;
    }

    let pdata_address = *section_load_addresses
        .get(&pdata.section_index)
        .ok_or_else(|| LoadError::Object(".pdata section was not loaded".to_string()))?;
    Ok(Some((pdata_address, pdata_len)))
}

fn apply_seh_relocations(
    object_file: &File<'_>,
    image: &ImageMemory,
    section_load_addresses: &HashMap<usize, usize>,
    resolver: &SymbolResolver<'_>,
    saved: &SavedSection,
    trampoline: usize,
) -> Result<(), LoadError> {
    use object::read::RelocationTarget;
    use object::ObjectSymbol;

    let section = object_file.section_by_index(object::SectionIndex(saved.section_index))?;
    let load_address = *section_load_addresses
        .get(&saved.section_index)
        .ok_or_else(|| LoadError::Object("SEH section was not loaded".to_string()))?;

    // Restore the raw bytes so implicit addends read from the pristine copy.
    unsafe {
        ptr::copy_nonoverlapping(saved.bytes.as_ptr(), load_address as *mut u8, saved.bytes.len());
    }

    let image_base = image.image_base() as usize;
    for (offset, relocation) in section.relocations() {
        let mut symbol_name = String::new();
        let target = match relocation.target() {
            RelocationTarget::Symbol(symbol_index) => {
                let symbol = object_file.symbol_by_index(symbol_index)?;
                symbol_name = symbol.name().unwrap_or("").to_string();
                if symbol_name == PERSONALITY_SYMBOL {
                    // The table must reference the in-image trampoline, not
                    // the routine's real (image-external) address.
                    trampoline as i64
                } else if symbol.is_undefined() {
                    resolver
                        .resolve(&symbol_name)
                        .ok_or_else(|| LoadError::UnresolvedSymbol(symbol_name.clone()))?
                        as i64
                } else {
                    let section_index = symbol.section_index().ok_or_else(|| {
                        LoadError::Object(format!("symbol {symbol_name} has no section"))
                    })?;
                    let symbol_section_address = *section_load_addresses
                        .get(&section_index.0)
                        .ok_or_else(|| {
                            LoadError::Object(format!(
                                "relocation against unloaded section (symbol {symbol_name})"
                            ))
                        })?;
                    symbol_section_address as i64 + symbol.address() as i64
                }
            }
            RelocationTarget::Section(section_index) => *section_load_addresses
                .get(&section_index.0)
                .ok_or_else(|| {
                    LoadError::Object("relocation against unloaded section".to_string())
                })? as i64,
            _ => {
                return Err(LoadError::UnsupportedRelocation(format!(
                    "{:?}",
                    relocation.kind()
                )))
            }
        };

        let addend = full_addend(&saved.bytes, offset as usize, &relocation);
        let place = load_address + offset as usize;
        let value = relocation_value(
            &relocation,
            target,
            addend,
            place as i64,
            image_base as i64,
            &symbol_name,
        )?;
        unsafe { write_relocation_value(place as *mut u8, relocation.size(), value) };
    }

    Ok(())
}
