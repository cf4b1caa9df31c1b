//! Virtual-memory and runtime-data support for the Kiln WebAssembly
//! runtime.
//!
//! This crate owns the page-level plumbing under the JIT object loader: the
//! raw `Mmap` wrapper over the platform allocator, the three-section
//! executable image, the runtime-data layout contract shared with the code
//! generator, and the table of built-in runtime routines generated code may
//! call without an explicit binding.

#![deny(missing_docs, unused_extern_crates)]
#![warn(unused_import_braces)]

mod image;
mod mmap;
mod offsets;

pub mod libcalls;

pub use crate::image::ImageMemory;
pub use crate::mmap::Mmap;
pub use crate::offsets::{
    RuntimeDataOffsets, MAX_MEMORIES, MAX_TABLES, MAX_THUNK_ARG_AND_RETURN_BYTES,
};

/// The host's page size in bytes.
pub fn host_page_size() -> usize {
    region::page::size()
}
