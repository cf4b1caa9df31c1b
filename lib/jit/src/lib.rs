//! JIT object loading for the Kiln WebAssembly runtime.
//!
//! Given a freshly compiled native object and the bindings for the symbols
//! it imports, this crate lays the object out in executable memory with
//! correct page permissions, resolves and applies its relocations,
//! registers its unwind information with the platform, and indexes the
//! loaded code by address so traps and backtraces can map an instruction
//! pointer back to a function and a WebAssembly operator.
//!
//! The three entry points mirror a module's lifecycle: [`load_module`],
//! [`get_jit_function_by_address`], [`unload_module`].

#![deny(missing_docs, unused_extern_crates)]
#![warn(unused_import_braces)]

mod bindings;
mod dwarf;
mod error;
mod function_index;
mod loader;
mod module;
mod resolver;
mod unwind;

pub use crate::bindings::{
    external_name, ExceptionTypeBinding, FunctionBinding, GlobalBinding, MemoryBinding,
    TableBinding,
};
pub use crate::error::LoadError;
pub use crate::function_index::get_jit_function_by_address;
pub use crate::module::{JitFunction, LoadedModule};

use std::collections::HashMap;
use std::sync::Arc;

/// Loads a compiled object and publishes it into the global address index.
///
/// The typed binding tables are flattened into symbol bindings under the
/// code generator's naming contract (see [`bindings`](external_name)), the
/// object's undefined symbols are resolved against them (with built-in
/// runtime routines as the fallback), and the object's `functionDef`
/// symbols are returned in index order alongside the module handle.
///
/// On failure nothing is published and the partially built image is
/// reclaimed; a failed load is not automatically retryable.
#[allow(clippy::too_many_arguments)]
pub fn load_module(
    object_bytes: &[u8],
    intrinsics: &HashMap<String, FunctionBinding>,
    function_imports: &[FunctionBinding],
    num_function_defs: usize,
    tables: &[TableBinding],
    memories: &[MemoryBinding],
    globals: &[GlobalBinding],
    exception_types: &[ExceptionTypeBinding],
    default_memory: Option<MemoryBinding>,
    default_table: Option<TableBinding>,
) -> Result<(Arc<LoadedModule>, Vec<Arc<JitFunction>>), LoadError> {
    let import_map = bindings::build_import_map(
        intrinsics,
        function_imports,
        tables,
        memories,
        globals,
        exception_types,
        default_memory,
        default_table,
    );

    let module = LoadedModule::load(object_bytes, &import_map)?;

    let mut function_defs = Vec::with_capacity(num_function_defs);
    for index in 0..num_function_defs {
        let name = external_name("functionDef", index);
        let Some(function) = module.function_by_name(&name).cloned() else {
            // The module was already published; withdraw it so the failed
            // load leaves no trace in the index.
            function_index::unregister_module(&module);
            return Err(LoadError::MissingFunctionDef(name));
        };
        function_defs.push(function);
    }

    Ok((module, function_defs))
}

/// Removes a module from the global address index.
///
/// Lookups that already hold a function handle stay valid; the image itself
/// is reclaimed when the last handle drops, and its pages are decommitted
/// but kept reserved so stale code pointers fault instead of aliasing a
/// later allocation.
pub fn unload_module(module: &Arc<LoadedModule>) {
    function_index::unregister_module(module);
    tracing::debug!(image_base = module.image_base(), "unloaded module");
}
