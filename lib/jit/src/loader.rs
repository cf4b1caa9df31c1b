//! Object placement and relocation.
//!
//! This is the adapter between a raw relocatable object and the image
//! memory manager: it sizes the image, copies each allocatable section into
//! the code / read-only / read-write section it belongs to, resolves the
//! object's undefined symbols through the [`SymbolResolver`], applies
//! relocations in place, and enumerates the defined function symbols with
//! their loaded addresses and byte lengths.
//!
//! The image handed back is fully relocated but not yet finalized; unwind
//! post-processing happens first (see [`crate::module`]).

use crate::error::LoadError;
use crate::resolver::SymbolResolver;
use kiln_vm::ImageMemory;
use object::read::{File, Relocation, RelocationTarget};
use object::{Object, ObjectSection, ObjectSymbol, RelocationKind, SectionKind, SymbolKind};
use std::collections::HashMap;
use std::ptr;

/// A defined function symbol with its loaded address range.
pub(crate) struct FunctionSymbol {
    pub name: String,
    pub address: usize,
    pub num_bytes: usize,
}

/// The result of placing and relocating one object.
pub(crate) struct LoadedObject {
    pub image: ImageMemory,
    pub functions: Vec<FunctionSymbol>,
    /// Relocated copies of the DWARF sections, keyed by section name, for
    /// the line-info consumer. Addresses in them are loaded addresses.
    pub debug_sections: HashMap<String, Vec<u8>>,
    /// Loaded address and length of `.eh_frame`, when the object has one.
    #[cfg(unix)]
    pub eh_frame: Option<(usize, usize)>,
    /// Loaded address and length of the fixed-up `.pdata` function table.
    #[cfg(all(windows, target_arch = "x86_64"))]
    pub pdata: Option<(usize, usize)>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum AllocationClass {
    Code,
    ReadOnly,
    ReadWrite,
}

fn allocation_class(kind: SectionKind) -> Option<AllocationClass> {
    match kind {
        SectionKind::Text => Some(AllocationClass::Code),
        SectionKind::Data | SectionKind::UninitializedData | SectionKind::Common => {
            Some(AllocationClass::ReadWrite)
        }
        SectionKind::ReadOnlyData
        | SectionKind::ReadOnlyDataWithRel
        | SectionKind::ReadOnlyString => Some(AllocationClass::ReadOnly),
        // Debug, note, metadata, and linker sections are not mapped into the
        // image; line tables are consumed from relocated heap copies.
        _ => None,
    }
}

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Loads `object_bytes` into a fresh image: reserve, place, relocate,
/// enumerate. Does not finalize page permissions.
pub(crate) fn load_object(
    object_bytes: &[u8],
    resolver: &SymbolResolver<'_>,
) -> Result<LoadedObject, LoadError> {
    let object_file = File::parse(object_bytes)?;

    // First pass: compute each class's space demand with the same cursor
    // arithmetic the allocator uses, so the reservation is exact.
    let mut num_bytes = [0usize; 3];
    let mut max_alignment = [1usize; 3];
    for section in object_file.sections() {
        let Some(class) = allocation_class(section.kind()) else {
            continue;
        };
        let size = section.size() as usize;
        if size == 0 {
            continue;
        }
        let alignment = (section.align() as usize).max(1);
        let slot = class as usize;
        num_bytes[slot] = align_up(num_bytes[slot], alignment) + align_up(size, alignment);
        max_alignment[slot] = max_alignment[slot].max(alignment);
    }

    let mut image = ImageMemory::reserve(
        num_bytes[AllocationClass::Code as usize],
        max_alignment[AllocationClass::Code as usize],
        num_bytes[AllocationClass::ReadOnly as usize],
        max_alignment[AllocationClass::ReadOnly as usize],
        num_bytes[AllocationClass::ReadWrite as usize],
        max_alignment[AllocationClass::ReadWrite as usize],
    );

    // Second pass: place the sections. Uninitialized data stays as the
    // zero-fill the fresh pages provide.
    let mut section_load_addresses = HashMap::new();
    for section in object_file.sections() {
        let Some(class) = allocation_class(section.kind()) else {
            continue;
        };
        let size = section.size() as usize;
        if size == 0 {
            continue;
        }
        let alignment = (section.align() as usize).max(1);
        let destination = match class {
            AllocationClass::Code => image.allocate_code(size, alignment),
            AllocationClass::ReadOnly => image.allocate_data(size, alignment, true),
            AllocationClass::ReadWrite => image.allocate_data(size, alignment, false),
        };
        let data = section.data()?;
        if !data.is_empty() {
            debug_assert_eq!(data.len(), size);
            unsafe { ptr::copy_nonoverlapping(data.as_ptr(), destination, data.len()) };
        }
        section_load_addresses.insert(section.index().0, destination as usize);
    }

    // The SEH tables are saved as raw bytes before any in-image fixup, then
    // re-applied image-relative by the post-processor below.
    #[cfg(all(windows, target_arch = "x86_64"))]
    let seh_tables = crate::unwind::save_seh_sections(&object_file)?;

    // Third pass: apply relocations to the placed sections.
    let image_base = image.image_base() as usize;
    for section in object_file.sections() {
        let Some(&load_address) = section_load_addresses.get(&section.index().0) else {
            continue;
        };
        #[cfg(all(windows, target_arch = "x86_64"))]
        {
            if crate::unwind::is_seh_section(section.name().unwrap_or("")) {
                continue;
            }
        }
        let data = section.data()?;
        for (offset, relocation) in section.relocations() {
            let (target, symbol_name) = resolve_relocation_target(
                &object_file,
                &section_load_addresses,
                resolver,
                &relocation,
            )?;
            let addend = full_addend(data, offset as usize, &relocation);
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
    }

    let debug_sections =
        relocate_debug_sections(&object_file, &section_load_addresses, resolver);

    #[cfg(all(windows, target_arch = "x86_64"))]
    let pdata = crate::unwind::process_seh_tables(
        &object_file,
        &mut image,
        &section_load_addresses,
        resolver,
        seh_tables,
    )?;

    #[cfg(unix)]
    let eh_frame = object_file.sections().find_map(|section| {
        let load_address = *section_load_addresses.get(&section.index().0)?;
        if matches!(section.name(), Ok(".eh_frame")) {
            Some((load_address, section.size() as usize))
        } else {
            None
        }
    });

    let functions = enumerate_functions(&object_file, &section_load_addresses)?;

    Ok(LoadedObject {
        image,
        functions,
        debug_sections,
        #[cfg(unix)]
        eh_frame,
        #[cfg(all(windows, target_arch = "x86_64"))]
        pdata,
    })
}

/// Resolves a relocation's target to a loaded address (or bound value) and
/// a name for error reporting.
fn resolve_relocation_target(
    object_file: &File<'_>,
    section_load_addresses: &HashMap<usize, usize>,
    resolver: &SymbolResolver<'_>,
    relocation: &Relocation,
) -> Result<(i64, String), LoadError> {
    match relocation.target() {
        RelocationTarget::Symbol(symbol_index) => {
            let symbol = object_file.symbol_by_index(symbol_index)?;
            let name = symbol.name().unwrap_or("").to_string();
            if symbol.is_undefined() {
                let value = resolver
                    .resolve(&name)
                    .ok_or_else(|| LoadError::UnresolvedSymbol(name.clone()))?;
                Ok((value as i64, name))
            } else {
                let section_index = symbol
                    .section_index()
                    .ok_or_else(|| LoadError::Object(format!("symbol {name} has no section")))?;
                let load_address =
                    *section_load_addresses
                        .get(&section_index.0)
                        .ok_or_else(|| {
                            LoadError::Object(format!(
                                "relocation against unloaded section (symbol {name})"
                            ))
                        })?;
                Ok((load_address as i64 + symbol.address() as i64, name))
            }
        }
        RelocationTarget::Section(section_index) => {
            let load_address = *section_load_addresses.get(&section_index.0).ok_or_else(|| {
                LoadError::Object(format!(
                    "relocation against unloaded section {}",
                    section_index.0
                ))
            })?;
            Ok((load_address as i64, format!("section {}", section_index.0)))
        }
        RelocationTarget::Absolute => Ok((0, "absolute".to_string())),
        _ => Err(LoadError::UnsupportedRelocation(format!(
            "{:?}",
            relocation.kind()
        ))),
    }
}

/// The relocation's addend, including the value stored in place for formats
/// that use implicit addends.
fn full_addend(section_data: &[u8], offset: usize, relocation: &Relocation) -> i64 {
    let mut addend = relocation.addend();
    if relocation.has_implicit_addend() {
        let in_place = match relocation.size() {
            32 => section_data
                .get(offset..offset + 4)
                .map(|bytes| i64::from(i32::from_le_bytes(bytes.try_into().unwrap()))),
            64 => section_data
                .get(offset..offset + 8)
                .map(|bytes| i64::from_le_bytes(bytes.try_into().unwrap())),
            _ => None,
        };
        addend = addend.wrapping_add(in_place.unwrap_or(0));
    }
    addend
}

/// Computes the value a relocation stores at its patch site.
pub(crate) fn relocation_value(
    relocation: &Relocation,
    target: i64,
    addend: i64,
    place: i64,
    image_base: i64,
    symbol_name: &str,
) -> Result<u64, LoadError> {
    let out_of_range = || LoadError::RelocationOutOfRange(symbol_name.to_string());
    match (relocation.kind(), relocation.size()) {
        (RelocationKind::Absolute, 64) => Ok(target.wrapping_add(addend) as u64),
        (RelocationKind::Absolute, 32) => {
            let value = target.wrapping_add(addend);
            u32::try_from(value).map(u64::from).map_err(|_| out_of_range())
        }
        (RelocationKind::Relative | RelocationKind::PltRelative, 32) => {
            let value = target.wrapping_add(addend).wrapping_sub(place);
            i32::try_from(value)
                .map(|value| value as u32 as u64)
                .map_err(|_| out_of_range())
        }
        (RelocationKind::Relative, 64) => {
            Ok(target.wrapping_add(addend).wrapping_sub(place) as u64)
        }
        // 32-bit image-relative, used by the Windows SEH tables.
        (RelocationKind::ImageOffset, 32) => {
            let value = target.wrapping_add(addend).wrapping_sub(image_base);
            u32::try_from(value).map(u64::from).map_err(|_| out_of_range())
        }
        (kind, size) => Err(LoadError::UnsupportedRelocation(format!(
            "{kind:?} (size {size})"
        ))),
    }
}

/// Stores `value` at `place` with the relocation's width.
pub(crate) unsafe fn write_relocation_value(place: *mut u8, size_bits: u8, value: u64) {
    match size_bits {
        32 => (place as *mut u32).write_unaligned(value as u32),
        64 => (place as *mut u64).write_unaligned(value),
        // relocation_value only produces 32- and 64-bit values.
        _ => unreachable!("unsupported relocation width {size_bits}"),
    }
}

/// Builds relocated heap copies of the DWARF sections.
///
/// Only absolute relocations are applied; the line tables reference code
/// through 8-byte absolute addresses, and anything else in the debug info
/// is best-effort. A relocation that cannot be resolved is skipped rather
/// than failing the load, since it can only degrade diagnostics.
fn relocate_debug_sections(
    object_file: &File<'_>,
    section_load_addresses: &HashMap<usize, usize>,
    resolver: &SymbolResolver<'_>,
) -> HashMap<String, Vec<u8>> {
    let mut debug_sections = HashMap::new();
    for section in object_file.sections() {
        if section.kind() != SectionKind::Debug {
            continue;
        }
        let Ok(name) = section.name() else { continue };
        if !name.starts_with(".debug") {
            continue;
        }
        let Ok(data) = section.data() else { continue };
        let mut bytes = data.to_vec();

        for (offset, relocation) in section.relocations() {
            if relocation.kind() != RelocationKind::Absolute {
                continue;
            }
            let Ok((target, _)) = resolve_relocation_target(
                object_file,
                section_load_addresses,
                resolver,
                &relocation,
            ) else {
                continue;
            };
            let addend = full_addend(data, offset as usize, &relocation);
            let value = target.wrapping_add(addend) as u64;
            let offset = offset as usize;
            match relocation.size() {
                32 => {
                    if let Some(patch) = bytes.get_mut(offset..offset + 4) {
                        patch.copy_from_slice(&(value as u32).to_le_bytes());
                    }
                }
                64 => {
                    if let Some(patch) = bytes.get_mut(offset..offset + 8) {
                        patch.copy_from_slice(&value.to_le_bytes());
                    }
                }
                _ => {}
            }
        }

        debug_sections.insert(name.to_string(), bytes);
    }
    debug_sections
}

/// Enumerates the defined function symbols with loaded addresses and byte
/// lengths.
///
/// A symbol that declares a size uses it; otherwise its length is the gap
/// to the next symbol in the same section, or to the section end.
fn enumerate_functions(
    object_file: &File<'_>,
    section_load_addresses: &HashMap<usize, usize>,
) -> Result<Vec<FunctionSymbol>, LoadError> {
    let mut symbols = Vec::new();
    for symbol in object_file.symbols() {
        if symbol.kind() != SymbolKind::Text || symbol.is_undefined() {
            continue;
        }
        let Ok(name) = symbol.name() else { continue };
        if name.is_empty() {
            continue;
        }
        let Some(section_index) = symbol.section_index() else {
            continue;
        };
        if !section_load_addresses.contains_key(&section_index.0) {
            continue;
        }
        symbols.push((
            section_index.0,
            symbol.address(),
            symbol.size(),
            name.to_string(),
        ));
    }

    // Paired iteration in address order gives the lengths of symbols that
    // don't declare one.
    symbols.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    let mut functions = Vec::with_capacity(symbols.len());
    for (position, (section_index, address, declared_size, name)) in symbols.iter().enumerate() {
        let num_bytes = if *declared_size > 0 {
            *declared_size
        } else {
            let next_in_section = symbols[position + 1..]
                .iter()
                .find(|(next_section, next_address, _, _)| {
                    next_section == section_index && next_address > address
                })
                .map(|(_, next_address, _, _)| *next_address);
            match next_in_section {
                Some(next_address) => next_address - address,
                None => {
                    let section = object_file
                        .section_by_index(object::SectionIndex(*section_index))?;
                    section.size().saturating_sub(*address)
                }
            }
        };

        let load_address = section_load_addresses[section_index];
        functions.push(FunctionSymbol {
            name: name.clone(),
            address: load_address + *address as usize,
            num_bytes: num_bytes as usize,
        });
    }

    Ok(functions)
}
