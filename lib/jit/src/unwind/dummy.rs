//! Fallback unwind registry for targets with neither `.eh_frame`
//! registration nor SEH function tables. Generated code still runs; stack
//! unwinding across its frames is simply unavailable.

#[derive(Debug)]
pub struct UnwindRegistration;

impl UnwindRegistration {
    #[allow(dead_code)]
    pub unsafe fn register(
        _image_base: *const u8,
        _unwind_info: *const u8,
        _unwind_info_len: usize,
    ) -> Result<Self, String> {
        Ok(Self)
    }
}
