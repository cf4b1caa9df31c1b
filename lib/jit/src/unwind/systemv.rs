//! `.eh_frame` registration with the System V unwinder.

use std::ptr;

extern "C" {
    fn __register_frame(fde: *const u8);
    fn __deregister_frame(fde: *const u8);
}

/// The unwinder registrations made for one image's `.eh_frame` section.
///
/// Holds the addresses handed to `__register_frame`, so dropping the value
/// can undo exactly those calls.
#[derive(Debug)]
pub struct UnwindRegistration {
    registrations: Vec<usize>,
}

impl UnwindRegistration {
    /// Hands the image's `.eh_frame` records to the platform unwinder.
    ///
    /// The section must already be placed and relocated inside the image
    /// and must outlive the registration. Must complete before any code in
    /// the image can raise or unwind.
    ///
    /// `__register_frame` means different things to the two unwinders in
    /// the wild: libgcc expects the whole section once, libunwind expects
    /// one call per FDE. Both are fed from the same loaded range.
    pub unsafe fn register(
        _image_base: *const u8,
        eh_frame: *const u8,
        eh_frame_len: usize,
    ) -> Result<Self, String> {
        let mut registrations = Vec::new();
        if cfg!(any(
            all(target_os = "linux", target_env = "gnu"),
            target_os = "freebsd"
        )) {
            // libgcc scans to the zero-length terminator record itself. A
            // section holding nothing but that terminator has no frames to
            // register, and handing it over anyway corrupts deregistration.
            if eh_frame_len > 4 {
                __register_frame(eh_frame);
                registrations.push(eh_frame as usize);
            }
        } else {
            // Each record starts with a 4-byte length that excludes the
            // length field itself. The section leads with the CIE, which is
            // not registered; neither is a zero-length padding record.
            let mut offset = 0;
            while offset < eh_frame_len {
                let record = eh_frame.add(offset);
                let record_len = ptr::read_unaligned(record as *const u32) as usize;
                if offset != 0 && record_len != 0 {
                    __register_frame(record);
                    registrations.push(record as usize);
                }
                offset += record_len + 4;
            }
        }
        Ok(Self { registrations })
    }
}

impl Drop for UnwindRegistration {
    fn drop(&mut self) {
        // Undo newest-first: libgcc keeps registered frames in a PC-sorted
        // list, and popping our registrations in reverse order means each
        // deregistration unlinks the entry it finds at the head.
        while let Some(registration) = self.registrations.pop() {
            unsafe { __deregister_frame(registration as *const u8) };
        }
    }
}
