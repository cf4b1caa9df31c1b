//! Memory management for one loaded object image.
//!
//! An image is a single contiguous virtual-memory reservation holding three
//! logical sections in a fixed order: executable code, read-only data, and
//! read-write data. The single reservation guarantees that code and any
//! data it references (unwind tables, the personality trampoline) lie
//! within ±2 GB of each other, which 32-bit RIP-relative relocations in the
//! code section require.
//!
//! Lifecycle: `reserve` once, any number of `allocate_*` calls, `finalize`
//! once to flip the section page permissions, then drop. Dropping decommits
//! every page but deliberately keeps the reservation, so any dangling
//! pointer into the image faults instead of aliasing a later allocation.

use crate::mmap::Mmap;
use std::mem::ManuallyDrop;

/// Code size added to every image reservation on Windows x86-64 so the SEH
/// personality trampoline can be placed inside the code section.
#[cfg(all(windows, target_arch = "x86_64"))]
const SEH_TRAMPOLINE_PADDING: usize = 32;

#[derive(Debug, Default, Clone, Copy)]
struct Section {
    offset: usize,
    num_pages: usize,
    num_committed_bytes: usize,
}

/// The three-section virtual-memory image backing one loaded object.
#[derive(Debug)]
pub struct ImageMemory {
    // Never dropped: the reservation outlives the image on purpose. See the
    // module comment and `Drop`.
    mmap: ManuallyDrop<Mmap>,
    page_size_log2: u32,
    code: Section,
    read_only: Section,
    read_write: Section,
    is_finalized: bool,
}

fn align_up(size: usize, alignment: usize) -> usize {
    (size + alignment - 1) & !(alignment - 1)
}

fn shr_and_round_up(value: usize, shift: u32) -> usize {
    (value + (1usize << shift) - 1) >> shift
}

impl ImageMemory {
    /// Reserves one contiguous committed read-write range large enough for
    /// the three sections, at consecutive page boundaries in the order code,
    /// read-only, read-write.
    ///
    /// Called once, before any allocation. Virtual-memory exhaustion here is
    /// a broken invariant, not a recoverable condition, and panics.
    pub fn reserve(
        code_bytes: usize,
        _code_alignment: usize,
        read_only_bytes: usize,
        _read_only_alignment: usize,
        read_write_bytes: usize,
        _read_write_alignment: usize,
    ) -> Self {
        #[cfg(all(windows, target_arch = "x86_64"))]
        let code_bytes = code_bytes + SEH_TRAMPOLINE_PADDING;

        let page_size = region::page::size();
        debug_assert!(page_size.is_power_of_two());
        let page_size_log2 = page_size.trailing_zeros();

        let code_pages = shr_and_round_up(code_bytes, page_size_log2);
        let read_only_pages = shr_and_round_up(read_only_bytes, page_size_log2);
        let read_write_pages = shr_and_round_up(read_write_bytes, page_size_log2);
        let num_image_pages = code_pages + read_only_pages + read_write_pages;

        let mmap = Mmap::reserve_committed(num_image_pages << page_size_log2)
            .expect("memory allocation for JIT code failed");

        let code = Section {
            offset: 0,
            num_pages: code_pages,
            num_committed_bytes: 0,
        };
        let read_only = Section {
            offset: code_pages << page_size_log2,
            num_pages: read_only_pages,
            num_committed_bytes: 0,
        };
        let read_write = Section {
            offset: (code_pages + read_only_pages) << page_size_log2,
            num_pages: read_write_pages,
            num_committed_bytes: 0,
        };

        Self {
            mmap: ManuallyDrop::new(mmap),
            page_size_log2,
            code,
            read_only,
            read_write,
            is_finalized: false,
        }
    }

    /// Allocates `num_bytes` in the code section.
    pub fn allocate_code(&mut self, num_bytes: usize, alignment: usize) -> *mut u8 {
        self.allocate_bytes(num_bytes, alignment, SectionKind::Code)
    }

    /// Allocates `num_bytes` in the read-only or read-write data section.
    pub fn allocate_data(
        &mut self,
        num_bytes: usize,
        alignment: usize,
        read_only: bool,
    ) -> *mut u8 {
        let kind = if read_only {
            SectionKind::ReadOnly
        } else {
            SectionKind::ReadWrite
        };
        self.allocate_bytes(num_bytes, alignment, kind)
    }

    fn allocate_bytes(
        &mut self,
        num_bytes: usize,
        alignment: usize,
        kind: SectionKind,
    ) -> *mut u8 {
        assert!(!self.is_finalized);
        assert!(alignment.is_power_of_two());

        let section = match kind {
            SectionKind::Code => &mut self.code,
            SectionKind::ReadOnly => &mut self.read_only,
            SectionKind::ReadWrite => &mut self.read_write,
        };

        // Place the allocation at the lowest aligned uncommitted byte of the
        // section.
        let allocation_offset = align_up(section.num_committed_bytes, alignment);
        section.num_committed_bytes = allocation_offset + align_up(num_bytes, alignment);

        if section.num_committed_bytes > section.num_pages << self.page_size_log2 {
            panic!("didn't reserve enough space in section");
        }

        let image_offset = section.offset + allocation_offset;
        debug_assert_eq!(self.mmap.as_ptr() as usize & (alignment - 1), 0);
        unsafe { self.mmap.as_mut_ptr().add(image_offset) }
    }

    /// Applies the final per-section page permissions: code becomes
    /// read+execute, read-only data read-only, read-write data read-write.
    ///
    /// Must be called exactly once, before any code in the image runs.
    pub fn finalize(&mut self) {
        assert!(!self.is_finalized);
        self.is_finalized = true;

        let sections = [
            (self.code, region::Protection::READ_EXECUTE),
            (self.read_only, region::Protection::READ),
            (self.read_write, region::Protection::READ_WRITE),
        ];
        for (section, protection) in sections {
            if section.num_pages != 0 {
                self.mmap
                    .protect(
                        section.offset,
                        section.num_pages << self.page_size_log2,
                        protection,
                    )
                    .expect("unable to apply image section permissions");
            }
        }
    }

    /// Whether `finalize` has run.
    pub fn is_finalized(&self) -> bool {
        self.is_finalized
    }

    /// The lowest address of the image.
    pub fn image_base(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    /// The total reserved size of the image in bytes.
    pub fn image_num_bytes(&self) -> usize {
        (self.code.num_pages + self.read_only.num_pages + self.read_write.num_pages)
            << self.page_size_log2
    }

    /// The base address of the code section.
    pub fn code_base(&self) -> *const u8 {
        unsafe { self.mmap.as_ptr().add(self.code.offset) }
    }

    /// The reserved size of the code section in bytes.
    pub fn code_num_bytes(&self) -> usize {
        self.code.num_pages << self.page_size_log2
    }

    /// The base address of the read-only data section.
    pub fn read_only_base(&self) -> *const u8 {
        unsafe { self.mmap.as_ptr().add(self.read_only.offset) }
    }

    /// The reserved size of the read-only data section in bytes.
    pub fn read_only_num_bytes(&self) -> usize {
        self.read_only.num_pages << self.page_size_log2
    }

    /// The base address of the read-write data section.
    pub fn read_write_base(&self) -> *const u8 {
        unsafe { self.mmap.as_ptr().add(self.read_write.offset) }
    }

    /// The reserved size of the read-write data section in bytes.
    pub fn read_write_num_bytes(&self) -> usize {
        self.read_write.num_pages << self.page_size_log2
    }
}

#[derive(Clone, Copy)]
enum SectionKind {
    Code,
    ReadOnly,
    ReadWrite,
}

impl Drop for ImageMemory {
    fn drop(&mut self) {
        // Decommit the image pages but leave them reserved, to catch any
        // references to them that might erroneously remain. The inner Mmap
        // is never dropped, so the address range is never reused.
        let _ = self.mmap.decommit_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_are_contiguous_page_aligned_and_disjoint() {
        let page_size = region::page::size();
        let image = ImageMemory::reserve(100, 16, 9, 8, 17, 8);

        let code = image.code_base() as usize;
        let read_only = image.read_only_base() as usize;
        let read_write = image.read_write_base() as usize;

        assert_eq!(code % page_size, 0);
        assert_eq!(read_only % page_size, 0);
        assert_eq!(read_write % page_size, 0);

        assert_eq!(code, image.image_base() as usize);
        assert_eq!(read_only, code + image.code_num_bytes());
        assert_eq!(read_write, read_only + image.read_only_num_bytes());
        assert_eq!(
            image.image_num_bytes(),
            image.code_num_bytes() + image.read_only_num_bytes() + image.read_write_num_bytes()
        );

        assert!(image.code_num_bytes() >= 100);
        assert!(image.read_only_num_bytes() >= 9);
        assert!(image.read_write_num_bytes() >= 17);
    }

    #[test]
    fn allocations_respect_alignment_and_order() {
        let mut image = ImageMemory::reserve(4096, 16, 0, 1, 4096, 8);

        let first = image.allocate_code(10, 16) as usize;
        let second = image.allocate_code(1, 16) as usize;
        assert_eq!(first % 16, 0);
        assert_eq!(second % 16, 0);
        assert_eq!(second, first + 16);

        let data = image.allocate_data(24, 8, false) as usize;
        assert_eq!(data % 8, 0);
        assert_eq!(data, image.read_write_base() as usize);
    }

    #[test]
    #[should_panic(expected = "didn't reserve enough space in section")]
    fn allocation_overflow_is_fatal() {
        let mut image = ImageMemory::reserve(16, 16, 0, 1, 0, 1);
        let _ = image.allocate_code(region::page::size() + 1, 16);
    }

    #[test]
    fn writes_land_in_the_image() {
        let mut image = ImageMemory::reserve(64, 16, 0, 1, 64, 8);
        let code = image.allocate_code(4, 16);
        unsafe {
            code.write_bytes(0xc3, 4);
            assert_eq!(*image.code_base(), 0xc3);
        }
    }

    #[test]
    fn empty_reservation_is_allowed() {
        let image = ImageMemory::reserve(0, 1, 0, 1, 0, 1);
        assert_eq!(image.image_num_bytes(), 0);
        assert!(!image.is_finalized());
    }
}
