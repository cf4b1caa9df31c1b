//! Symbol resolution for one object load.

use std::collections::HashMap;

/// Resolves the undefined symbols of an object being loaded.
///
/// Stateless per load: it borrows the flattened binding table for the
/// duration of the load call only. Names missing from the table fall back
/// to the process-wide table of built-in runtime routines.
pub(crate) struct SymbolResolver<'a> {
    import_map: &'a HashMap<String, usize>,
}

impl<'a> SymbolResolver<'a> {
    pub fn new(import_map: &'a HashMap<String, usize>) -> Self {
        Self { import_map }
    }

    /// Returns the address or runtime-data offset bound to `name`, or
    /// `None` if the symbol is unresolved.
    pub fn resolve(&self, name: &str) -> Option<usize> {
        if let Some(&value) = self.import_map.get(name) {
            // A binding of zero would be indistinguishable from an
            // unresolved symbol.
            debug_assert_ne!(value, 0, "binding for {name} is zero");
            return Some(value);
        }
        kiln_vm::libcalls::runtime_symbol_address(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindings_take_precedence_over_runtime_symbols() {
        let mut import_map = HashMap::new();
        import_map.insert("trunc".to_string(), 0x1234usize);
        import_map.insert("functionImport0".to_string(), 0x5678usize);

        let resolver = SymbolResolver::new(&import_map);
        assert_eq!(resolver.resolve("trunc"), Some(0x1234));
        assert_eq!(resolver.resolve("functionImport0"), Some(0x5678));
        // Not bound, but built in.
        assert_eq!(
            resolver.resolve("ceilf"),
            kiln_vm::libcalls::runtime_symbol_address("ceilf")
        );
        assert_eq!(resolver.resolve("functionImport7"), None);
    }
}
