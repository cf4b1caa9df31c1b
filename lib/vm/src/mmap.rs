//! Anonymous virtual-memory mappings.
//!
//! The image manager needs exactly three things from the platform: one
//! zeroed read-write mapping per image, per-range permission flips at
//! finalization, and a way to decommit every page at teardown without
//! giving the address range back to the OS. `Mmap` is that narrow wrapper;
//! it has no notion of partially committed mappings because an image is
//! committed in full the moment it is reserved.

use more_asserts::assert_le;
use std::io;
use std::ptr;
use std::slice;

/// One anonymous mapping, page-aligned and initially zeroed.
///
/// The address is stored as a `usize` rather than a pointer so the handle
/// is `Send + Sync`; any synchronization on the memory itself is the
/// caller's business.
#[derive(Debug)]
pub struct Mmap {
    address: usize,
    num_bytes: usize,
}

impl Mmap {
    /// An empty mapping.
    pub fn new() -> Self {
        Self {
            address: ptr::NonNull::<u8>::dangling().as_ptr() as usize,
            num_bytes: 0,
        }
    }

    /// Maps `num_bytes` (a page-size multiple) of zeroed read-write memory,
    /// committed in full.
    ///
    /// Per-section permissions are applied later through [`Mmap::protect`].
    #[cfg(unix)]
    pub fn reserve_committed(num_bytes: usize) -> Result<Self, String> {
        debug_assert_eq!(num_bytes % region::page::size(), 0);
        if num_bytes == 0 {
            return Ok(Self::new());
        }

        let address = unsafe {
            libc::mmap(
                ptr::null_mut(),
                num_bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if address == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().to_string());
        }
        Ok(Self {
            address: address as usize,
            num_bytes,
        })
    }

    /// Maps `num_bytes` (a page-size multiple) of zeroed read-write memory,
    /// committed in full.
    ///
    /// Per-section permissions are applied later through [`Mmap::protect`].
    #[cfg(windows)]
    pub fn reserve_committed(num_bytes: usize) -> Result<Self, String> {
        use winapi::um::memoryapi::VirtualAlloc;
        use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};

        debug_assert_eq!(num_bytes % region::page::size(), 0);
        if num_bytes == 0 {
            return Ok(Self::new());
        }

        let address = unsafe {
            VirtualAlloc(
                ptr::null_mut(),
                num_bytes,
                MEM_RESERVE | MEM_COMMIT,
                PAGE_READWRITE,
            )
        };
        if address.is_null() {
            return Err(io::Error::last_os_error().to_string());
        }
        Ok(Self {
            address: address as usize,
            num_bytes,
        })
    }

    /// Changes the permissions of the `len` bytes at `offset`. Both must be
    /// page-size multiples and lie within the mapping.
    pub fn protect(
        &mut self,
        offset: usize,
        len: usize,
        protection: region::Protection,
    ) -> Result<(), String> {
        let page_size = region::page::size();
        debug_assert_eq!(offset % page_size, 0);
        debug_assert_eq!(len % page_size, 0);
        assert_le!(offset + len, self.num_bytes);

        let start = (self.address + offset) as *const u8;
        unsafe { region::protect(start, len, protection) }.map_err(|error| error.to_string())
    }

    /// Decommits every page while keeping the reservation, so stale
    /// references to this memory fault instead of silently aliasing a later
    /// allocation.
    #[cfg(unix)]
    pub fn decommit_all(&self) -> Result<(), String> {
        if self.num_bytes == 0 {
            return Ok(());
        }

        // Map a fresh inaccessible reservation over the range; the physical
        // pages go back to the OS, the addresses stay claimed.
        let address = unsafe {
            libc::mmap(
                self.address as *mut libc::c_void,
                self.num_bytes,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        if address == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().to_string());
        }
        Ok(())
    }

    /// Decommits every page while keeping the reservation, so stale
    /// references to this memory fault instead of silently aliasing a later
    /// allocation.
    #[cfg(windows)]
    pub fn decommit_all(&self) -> Result<(), String> {
        use winapi::ctypes::c_void;
        use winapi::um::memoryapi::VirtualFree;
        use winapi::um::winnt::MEM_DECOMMIT;

        if self.num_bytes == 0 {
            return Ok(());
        }

        if unsafe { VirtualFree(self.address as *mut c_void, self.num_bytes, MEM_DECOMMIT) } == 0 {
            return Err(io::Error::last_os_error().to_string());
        }
        Ok(())
    }

    /// The mapped memory as a slice.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.address as *const u8, self.num_bytes) }
    }

    /// The mapped memory as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.address as *mut u8, self.num_bytes) }
    }

    /// The lowest mapped address.
    pub fn as_ptr(&self) -> *const u8 {
        self.address as *const u8
    }

    /// The lowest mapped address, mutably.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.address as *mut u8
    }

    /// The size of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.num_bytes
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.num_bytes == 0
    }
}

impl Drop for Mmap {
    #[cfg(unix)]
    fn drop(&mut self) {
        if self.num_bytes != 0 {
            let result =
                unsafe { libc::munmap(self.address as *mut libc::c_void, self.num_bytes) };
            debug_assert_eq!(result, 0, "munmap failed: {}", io::Error::last_os_error());
        }
    }

    #[cfg(windows)]
    fn drop(&mut self) {
        use winapi::ctypes::c_void;
        use winapi::um::memoryapi::VirtualFree;
        use winapi::um::winnt::MEM_RELEASE;

        if self.num_bytes != 0 {
            let result = unsafe { VirtualFree(self.address as *mut c_void, 0, MEM_RELEASE) };
            debug_assert_ne!(result, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mmap_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Mmap>();
    }

    #[test]
    fn reserved_memory_is_zeroed_and_writable() {
        let page_size = region::page::size();
        let mut map = Mmap::reserve_committed(page_size * 2).unwrap();
        assert_eq!(map.len(), page_size * 2);
        assert!(map.as_slice().iter().all(|&byte| byte == 0));
        map.as_mut_slice()[page_size] = 0xa5;
        assert_eq!(map.as_slice()[page_size], 0xa5);
    }

    #[test]
    fn empty_mapping_is_allowed() {
        let map = Mmap::reserve_committed(0).unwrap();
        assert!(map.is_empty());
        assert!(map.as_slice().is_empty());
        map.decommit_all().unwrap();
    }
}
