//! Binding tables: what the host supplies for each symbol the compiled
//! object imports.
//!
//! Symbol names are a contract with the code generator: imported entities
//! are referenced as `"functionImport" + index`, `"tableOffset" + index`,
//! `"memoryOffset" + index`, `"global" + index`, `"exceptionType" + index`,
//! and defined functions are exported as `"functionDef" + index`.
//! Intrinsics keep their natural linker names. All binding values are plain
//! `usize`s (either a host address or a byte offset into a runtime-data
//! block, depending on the binding kind), so tables are `Send + Sync`.

use kiln_vm::RuntimeDataOffsets;
use std::collections::HashMap;

/// A host function bound to a function import or intrinsic symbol.
///
/// The compiled module assumes the intrinsic calling convention, so the
/// address is used directly with no thunking.
#[derive(Clone, Copy, Debug)]
pub struct FunctionBinding {
    /// The address of the native function.
    pub address: usize,
}

/// A table bound to a `tableOffset` symbol.
#[derive(Clone, Copy, Debug)]
pub struct TableBinding {
    /// The table's slot index in the compartment runtime data.
    pub id: usize,
}

/// A memory bound to a `memoryOffset` symbol.
#[derive(Clone, Copy, Debug)]
pub struct MemoryBinding {
    /// The memory's slot index in the compartment runtime data.
    pub id: usize,
}

/// A global bound to a `global` symbol.
#[derive(Clone, Copy, Debug)]
pub enum GlobalBinding {
    /// A mutable global, stored per context; the symbol's value is the byte
    /// offset of its slot within the context's global data area.
    Mutable {
        /// Offset of the global's slot within the global data area.
        mutable_data_offset: usize,
    },
    /// An immutable global; the symbol's value is the address of the stored
    /// value itself.
    Immutable {
        /// Address of the global's immutable value.
        value_address: usize,
    },
}

/// An exception type instance bound to an `exceptionType` symbol.
#[derive(Clone, Copy, Debug)]
pub struct ExceptionTypeBinding {
    /// The address of the exception type instance.
    pub address: usize,
}

/// Builds the symbol name the code generator uses for an indexed external.
pub fn external_name(base_name: &str, index: usize) -> String {
    format!("{base_name}{index}")
}

fn add_binding(import_map: &mut HashMap<String, usize>, name: String, value: usize) {
    let previous = import_map.insert(name, value);
    debug_assert!(previous.is_none());
}

/// Flattens the typed binding tables into the name → value map the symbol
/// resolver consumes.
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_import_map(
    intrinsics: &HashMap<String, FunctionBinding>,
    function_imports: &[FunctionBinding],
    tables: &[TableBinding],
    memories: &[MemoryBinding],
    globals: &[GlobalBinding],
    exception_types: &[ExceptionTypeBinding],
    default_memory: Option<MemoryBinding>,
    default_table: Option<TableBinding>,
) -> HashMap<String, usize> {
    let offsets = RuntimeDataOffsets::for_host();
    let mut import_map = HashMap::new();

    for (name, binding) in intrinsics {
        add_binding(&mut import_map, name.clone(), binding.address);
    }

    for (index, binding) in function_imports.iter().enumerate() {
        add_binding(
            &mut import_map,
            external_name("functionImport", index),
            binding.address,
        );
    }

    // The compiled module uses table and memory symbol values as offsets
    // into the compartment runtime data, not as addresses.
    for (index, table) in tables.iter().enumerate() {
        add_binding(
            &mut import_map,
            external_name("tableOffset", index),
            offsets.table_base(table.id),
        );
    }
    for (index, memory) in memories.iter().enumerate() {
        add_binding(
            &mut import_map,
            external_name("memoryOffset", index),
            offsets.memory_base(memory.id),
        );
    }

    for (index, global) in globals.iter().enumerate() {
        let value = match *global {
            GlobalBinding::Mutable {
                mutable_data_offset,
            } => offsets.global_data(mutable_data_offset),
            GlobalBinding::Immutable { value_address } => value_address,
        };
        add_binding(&mut import_map, external_name("global", index), value);
    }

    for (index, exception_type) in exception_types.iter().enumerate() {
        add_binding(
            &mut import_map,
            external_name("exceptionType", index),
            exception_type.address,
        );
    }

    if let Some(memory) = default_memory {
        add_binding(
            &mut import_map,
            "defaultMemoryOffset".to_string(),
            offsets.memory_base(memory.id),
        );
    }
    if let Some(table) = default_table {
        add_binding(
            &mut import_map,
            "defaultTableOffset".to_string(),
            offsets.table_base(table.id),
        );
    }

    import_map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_map_uses_contract_names() {
        let mut intrinsics = HashMap::new();
        intrinsics.insert(
            "kiln_memory_grow".to_string(),
            FunctionBinding { address: 0x1000 },
        );

        let import_map = build_import_map(
            &intrinsics,
            &[FunctionBinding { address: 0x2000 }],
            &[TableBinding { id: 3 }],
            &[MemoryBinding { id: 1 }],
            &[
                GlobalBinding::Mutable {
                    mutable_data_offset: 16,
                },
                GlobalBinding::Immutable {
                    value_address: 0x3000,
                },
            ],
            &[ExceptionTypeBinding { address: 0x4000 }],
            Some(MemoryBinding { id: 1 }),
            None,
        );

        let offsets = RuntimeDataOffsets::for_host();
        assert_eq!(import_map["kiln_memory_grow"], 0x1000);
        assert_eq!(import_map["functionImport0"], 0x2000);
        assert_eq!(import_map["tableOffset0"], offsets.table_base(3));
        assert_eq!(import_map["memoryOffset0"], offsets.memory_base(1));
        assert_eq!(import_map["global0"], offsets.global_data(16));
        assert_eq!(import_map["global1"], 0x3000);
        assert_eq!(import_map["exceptionType0"], 0x4000);
        assert_eq!(import_map["defaultMemoryOffset"], offsets.memory_base(1));
        assert!(!import_map.contains_key("defaultTableOffset"));
        assert!(!import_map.contains_key("functionImport1"));
    }
}
