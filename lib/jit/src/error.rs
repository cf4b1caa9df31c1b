use thiserror::Error;

/// An error that aborts one module load.
///
/// A failed load publishes nothing: the partially built image is dropped
/// (and its pages decommitted) before the error propagates. None of these
/// are process-fatal; broken memory-manager invariants panic instead.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The object file could not be parsed.
    #[error("error parsing object file: {0}")]
    Object(String),

    /// The object referenced a symbol with no caller binding and no
    /// built-in runtime routine of that name.
    #[error("unresolved symbol: {0}")]
    UnresolvedSymbol(String),

    /// The object used a relocation kind this loader does not apply.
    #[error("unsupported relocation kind: {0}")]
    UnsupportedRelocation(String),

    /// A 32-bit relocation's target was out of its addressable range.
    #[error("relocation target out of range for symbol {0}")]
    RelocationOutOfRange(String),

    /// The object's DWARF line information could not be read.
    #[error("error reading DWARF line information: {0}")]
    Dwarf(#[from] gimli::Error),

    /// A `functionDef` symbol promised by the caller was not present in the
    /// loaded object.
    #[error("function definition symbol {0} is missing from the loaded object")]
    MissingFunctionDef(String),

    /// The platform rejected the module's unwind information.
    #[error("error registering unwind information: {0}")]
    Unwind(String),
}

impl From<object::read::Error> for LoadError {
    fn from(error: object::read::Error) -> Self {
        Self::Object(error.to_string())
    }
}
