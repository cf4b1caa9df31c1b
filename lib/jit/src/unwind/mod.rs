//! Platform unwind-info registration.
//!
//! Two interchangeable strategies sit behind the `UnwindRegistration` name:
//! System V `.eh_frame` registration through the platform unwinder, and
//! Windows x86-64 `.pdata`/`.xdata` function tables. Registration happens
//! after relocation and before the image's final page permissions are
//! applied; dropping the registration deregisters everything it installed.

cfg_if::cfg_if! {
    if #[cfg(all(windows, target_arch = "x86_64"))] {
        mod windows_x64;
        pub(crate) use windows_x64::{
            is_seh_section, process_seh_tables, save_seh_sections, UnwindRegistration,
        };
    } else if #[cfg(unix)] {
        mod systemv;
        pub(crate) use systemv::UnwindRegistration;
    } else {
        mod dummy;
        pub(crate) use dummy::UnwindRegistration;
    }
}
