//! Offsets of the runtime-data slots that generated code addresses.
//!
//! The code generator does not see runtime structures directly. Instead,
//! table and memory symbols are bound to byte offsets into the
//! compartment's runtime-data block, and mutable-global symbols to byte
//! offsets into the context's runtime-data block; generated code adds those
//! offsets to the live compartment/context base registers. The layouts here
//! are therefore a contract: they must match what the code generator
//! assumes, field for field.

/// The maximum number of memories addressable through one compartment.
pub const MAX_MEMORIES: usize = 255;

/// The maximum number of tables addressable through one compartment.
pub const MAX_TABLES: usize = 256;

/// Bytes reserved at the start of a context's runtime data for thunk
/// argument and return spill space, before the mutable-global data begins.
pub const MAX_THUNK_ARG_AND_RETURN_BYTES: usize = 256;

/// Computes byte offsets into the compartment and context runtime-data
/// blocks for a given pointer size.
#[derive(Clone, Copy, Debug)]
pub struct RuntimeDataOffsets {
    /// The size in bytes of a pointer in the target.
    pub pointer_size: u8,
}

impl RuntimeDataOffsets {
    /// Offsets for the host's own pointer size.
    pub fn for_host() -> Self {
        Self {
            pointer_size: std::mem::size_of::<usize>() as u8,
        }
    }

    fn pointer_size(&self) -> usize {
        usize::from(self.pointer_size)
    }

    /// The compartment back-pointer sits at the start of the block.
    pub fn compartment(&self) -> usize {
        0
    }

    /// Start of the per-memory base-address array.
    pub fn memory_bases_begin(&self) -> usize {
        self.compartment() + self.pointer_size()
    }

    /// The slot holding memory `id`'s base address.
    pub fn memory_base(&self, id: usize) -> usize {
        debug_assert!(id < MAX_MEMORIES);
        self.memory_bases_begin() + self.pointer_size() * id
    }

    /// Start of the per-table base-address array.
    pub fn table_bases_begin(&self) -> usize {
        self.memory_bases_begin() + self.pointer_size() * MAX_MEMORIES
    }

    /// The slot holding table `id`'s base address.
    pub fn table_base(&self, id: usize) -> usize {
        debug_assert!(id < MAX_TABLES);
        self.table_bases_begin() + self.pointer_size() * id
    }

    /// Start of the mutable-global data area in a context's runtime data.
    pub fn global_data_begin(&self) -> usize {
        MAX_THUNK_ARG_AND_RETURN_BYTES
    }

    /// The slot of a mutable global stored at `mutable_data_offset` within
    /// the global data area.
    pub fn global_data(&self, mutable_data_offset: usize) -> usize {
        self.global_data_begin() + mutable_data_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_do_not_overlap() {
        let offsets = RuntimeDataOffsets::for_host();
        let pointer_size = usize::from(offsets.pointer_size);

        assert_eq!(offsets.memory_base(0), pointer_size);
        assert_eq!(
            offsets.memory_base(1) - offsets.memory_base(0),
            pointer_size
        );
        assert_eq!(
            offsets.table_bases_begin(),
            offsets.memory_base(MAX_MEMORIES - 1) + pointer_size
        );
        assert!(offsets.table_base(MAX_TABLES - 1) > offsets.table_base(0));
        assert_eq!(offsets.global_data(8) - offsets.global_data(0), 8);
    }
}
