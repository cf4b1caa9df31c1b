//! The loaded-module record: one finalized image plus its function index.

use crate::dwarf::LineInfoTable;
use crate::error::LoadError;
use crate::function_index;
use crate::loader;
use crate::resolver::SymbolResolver;
use crate::unwind::UnwindRegistration;
use kiln_vm::ImageMemory;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

/// One function of a loaded module.
#[derive(Debug)]
pub struct JitFunction {
    base_address: usize,
    num_bytes: usize,
    name: String,
    offset_to_op_index: BTreeMap<u32, u32>,
}

impl JitFunction {
    /// The loaded address of the function's first byte.
    pub fn base_address(&self) -> usize {
        self.base_address
    }

    /// The function's length in bytes.
    pub fn num_bytes(&self) -> usize {
        self.num_bytes
    }

    /// The function's symbol name, e.g. `functionDef3`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `address` lies within the function's code.
    pub fn contains_address(&self, address: usize) -> bool {
        address >= self.base_address && address < self.base_address + self.num_bytes
    }

    /// The map from code offset to WebAssembly operator index.
    pub fn offset_to_op_index(&self) -> &BTreeMap<u32, u32> {
        &self.offset_to_op_index
    }

    /// The operator index covering `offset`: the value of the greatest
    /// mapped offset that does not exceed it.
    pub fn op_index_at_offset(&self, offset: u32) -> Option<u32> {
        self.offset_to_op_index
            .range(..=offset)
            .next_back()
            .map(|(_, &op_index)| op_index)
    }
}

/// A loaded object: the owned image, its functions, and their indexes.
///
/// Immutable after construction. Destruction is driven by [`crate::unload_module`],
/// which removes the module from the process-wide address index; when the
/// last handle drops, the function records are freed, the unwind info is
/// deregistered, and the image pages are decommitted (but stay reserved, so
/// stale code pointers fault rather than aliasing a later allocation).
#[derive(Debug)]
pub struct LoadedModule {
    functions: Vec<Arc<JitFunction>>,
    name_to_function: HashMap<String, Arc<JitFunction>>,
    /// Keyed by each function's *end* address, for the strict-upper-bound
    /// lookup in [`crate::get_jit_function_by_address`].
    pub(crate) address_to_function: BTreeMap<usize, Arc<JitFunction>>,
    // Declared before `image`: deregistration must precede the decommit.
    _unwind_registration: Option<UnwindRegistration>,
    image: ImageMemory,
}

impl LoadedModule {
    /// Loads one object: place, relocate, register unwind info, finalize
    /// permissions, enumerate functions, and publish into the global
    /// address index.
    ///
    /// On error nothing is published and the partial image is dropped.
    pub(crate) fn load(
        object_bytes: &[u8],
        import_map: &HashMap<String, usize>,
    ) -> Result<Arc<Self>, LoadError> {
        let start_time = Instant::now();

        let resolver = SymbolResolver::new(import_map);
        let loaded = loader::load_object(object_bytes, &resolver)?;
        let mut image = loaded.image;

        // Unwind registration must precede the permission flip; the tables
        // live in the image and are patched no further.
        #[cfg(unix)]
        let unwind_registration = match loaded.eh_frame {
            Some((address, len)) => Some(
                unsafe {
                    UnwindRegistration::register(image.image_base(), address as *const u8, len)
                }
                .map_err(LoadError::Unwind)?,
            ),
            None => None,
        };
        #[cfg(all(windows, target_arch = "x86_64"))]
        let unwind_registration = match loaded.pdata {
            Some((address, len)) => Some(
                unsafe {
                    UnwindRegistration::register(image.image_base(), address as *const u8, len)
                }
                .map_err(LoadError::Unwind)?,
            ),
            None => None,
        };
        #[cfg(not(any(unix, all(windows, target_arch = "x86_64"))))]
        let unwind_registration: Option<UnwindRegistration> = None;

        image.finalize();

        let line_info = LineInfoTable::parse(&loaded.debug_sections)?;

        let mut functions = Vec::with_capacity(loaded.functions.len());
        let mut name_to_function = HashMap::new();
        let mut address_to_function = BTreeMap::new();
        for symbol in &loaded.functions {
            let function = Arc::new(JitFunction {
                base_address: symbol.address,
                num_bytes: symbol.num_bytes,
                name: symbol.name.clone(),
                offset_to_op_index: line_info.offset_to_op_index(symbol.address, symbol.num_bytes),
            });
            functions.push(function.clone());
            let previous = name_to_function.insert(symbol.name.clone(), function.clone());
            debug_assert!(
                previous.is_none(),
                "duplicate function symbol {}",
                symbol.name
            );
            address_to_function.insert(symbol.address + symbol.num_bytes, function);
        }

        let module = Arc::new(Self {
            functions,
            name_to_function,
            address_to_function,
            _unwind_registration: unwind_registration,
            image,
        });
        function_index::register_module(&module);

        tracing::debug!(
            num_object_bytes = object_bytes.len(),
            num_functions = module.functions.len(),
            image_base = module.image_base(),
            elapsed = ?start_time.elapsed(),
            "loaded object",
        );
        Ok(module)
    }

    /// Every function of the module, in enumeration order.
    pub fn functions(&self) -> &[Arc<JitFunction>] {
        &self.functions
    }

    /// Looks up a function by its symbol name.
    pub fn function_by_name(&self, name: &str) -> Option<&Arc<JitFunction>> {
        self.name_to_function.get(name)
    }

    /// The lowest address of the module's image.
    pub fn image_base(&self) -> usize {
        self.image.image_base() as usize
    }

    /// The reserved size of the module's image in bytes.
    pub fn image_num_bytes(&self) -> usize {
        self.image.image_num_bytes()
    }

    /// One past the image's last byte: the module's global-index key.
    pub(crate) fn image_end(&self) -> usize {
        self.image_base() + self.image_num_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function_with_rows(rows: &[(u32, u32)]) -> JitFunction {
        JitFunction {
            base_address: 0x1000,
            num_bytes: 32,
            name: "functionDef0".to_string(),
            offset_to_op_index: rows.iter().copied().collect(),
        }
    }

    #[test]
    fn op_index_lookup_takes_the_preceding_row() {
        let function = function_with_rows(&[(0, 0), (8, 1), (20, 2)]);
        assert_eq!(function.op_index_at_offset(0), Some(0));
        assert_eq!(function.op_index_at_offset(7), Some(0));
        assert_eq!(function.op_index_at_offset(8), Some(1));
        assert_eq!(function.op_index_at_offset(19), Some(1));
        assert_eq!(function.op_index_at_offset(31), Some(2));

        let unmapped = function_with_rows(&[]);
        assert_eq!(unmapped.op_index_at_offset(0), None);
    }

    #[test]
    fn address_containment_is_half_open() {
        let function = function_with_rows(&[(0, 0)]);
        assert!(function.contains_address(0x1000));
        assert!(function.contains_address(0x101f));
        assert!(!function.contains_address(0xfff));
        assert!(!function.contains_address(0x1020));
    }
}
