//! The process-wide address → module index used by trap and backtrace
//! paths.
//!
//! This is the only cross-load shared mutable state in the crate. One
//! mutex guards the map; inserts happen at the end of a successful load,
//! removals at the start of unload, and lookups take a strict upper bound.
//! The lock is never held while reading a module's internal maps: those are
//! built before insertion and immutable afterwards.

use crate::module::{JitFunction, LoadedModule};
use lazy_static::lazy_static;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};

lazy_static! {
    // Keyed by image end address, so an upper-bound probe lands on the one
    // module whose image could contain the address.
    static ref ADDRESS_TO_MODULE_MAP: Mutex<BTreeMap<usize, Arc<LoadedModule>>> =
        Mutex::new(BTreeMap::new());
}

/// Publishes a freshly constructed module. Last step of a load.
pub(crate) fn register_module(module: &Arc<LoadedModule>) {
    if module.image_num_bytes() == 0 {
        // An empty image has no addresses to index.
        return;
    }
    let mut map = ADDRESS_TO_MODULE_MAP.lock().unwrap();
    let previous = map.insert(module.image_end(), module.clone());
    debug_assert!(previous.is_none(), "image end addresses must be unique");
}

/// Withdraws a module from the index. First step of an unload.
pub(crate) fn unregister_module(module: &Arc<LoadedModule>) {
    if module.image_num_bytes() == 0 {
        return;
    }
    let mut map = ADDRESS_TO_MODULE_MAP.lock().unwrap();
    map.remove(&module.image_end());
}

/// Maps an absolute instruction address to the JIT function containing it.
///
/// This is the trap/backtrace entry point: given a faulting or sampled
/// instruction pointer, find the owning function (and through its
/// offset map, the WebAssembly operator) in O(log n).
pub fn get_jit_function_by_address(address: usize) -> Option<Arc<JitFunction>> {
    // First module whose image ends strictly after the address. Clone the
    // handle out so the module's own maps are read without the lock.
    let module = {
        let map = ADDRESS_TO_MODULE_MAP.lock().unwrap();
        map.range((Bound::Excluded(address), Bound::Unbounded))
            .next()
            .map(|(_, module)| module.clone())?
    };

    // First function ending strictly after the address; end-address keying
    // makes this exact even for adjacent functions with no gap.
    let (_, function) = module
        .address_to_function
        .range((Bound::Excluded(address), Bound::Unbounded))
        .next()?;
    if function.contains_address(address) {
        Some(function.clone())
    } else {
        None
    }
}
