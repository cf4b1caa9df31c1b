//! Serialization primitives for the Kiln WebAssembly runtime.
//!
//! This crate defines the bit-exact binary contract shared by the module
//! reader and writer: byte streams with a single cursor-advance primitive,
//! and a strict LEB128 variable-length integer codec that is byte-for-byte
//! compatible with the WebAssembly binary format's integer encoding.

#![deny(missing_docs, unused_extern_crates)]
#![warn(unused_import_braces)]

mod error;
mod native;
mod stream;
mod varint;

pub use crate::error::SerializeError;
pub use crate::native::*;
pub use crate::stream::{InputStream, OutputStream};
pub use crate::varint::*;
