//! Runtime library routines callable from generated code.
//!
//! The code generator emits calls to these under their natural linker
//! names; the loader resolves any symbol not present in the caller's
//! binding table against this table. The math routines exist because wasm
//! semantics differ from the host libm on NaN propagation and rounding, and
//! because generated code must not depend on the host C runtime being
//! linked in.

/// Raises an unrecoverable trap from generated code.
///
/// Trap dispatch (signal handling, stack capture, resumption) belongs to
/// the embedder's runtime layer. If generated code reaches this entry with
/// no such layer installed there is nothing meaningful to unwind to.
#[no_mangle]
pub extern "C" fn kiln_raise_trap(_trap_code: u32) -> ! {
    std::process::abort()
}

/// Implementation of f32.ceil.
#[no_mangle]
pub extern "C" fn kiln_f32_ceil(x: f32) -> f32 {
    x.ceil()
}

/// Implementation of f64.ceil.
#[no_mangle]
pub extern "C" fn kiln_f64_ceil(x: f64) -> f64 {
    x.ceil()
}

/// Implementation of f32.floor.
#[no_mangle]
pub extern "C" fn kiln_f32_floor(x: f32) -> f32 {
    x.floor()
}

/// Implementation of f64.floor.
#[no_mangle]
pub extern "C" fn kiln_f64_floor(x: f64) -> f64 {
    x.floor()
}

/// Implementation of f32.trunc.
#[no_mangle]
pub extern "C" fn kiln_f32_trunc(x: f32) -> f32 {
    x.trunc()
}

/// Implementation of f64.trunc.
#[no_mangle]
pub extern "C" fn kiln_f64_trunc(x: f64) -> f64 {
    x.trunc()
}

/// Implementation of f32.nearest.
#[no_mangle]
pub extern "C" fn kiln_f32_nearest(x: f32) -> f32 {
    // Rust has no round-half-to-even; steer the half-way cases through a
    // doubling that cannot itself land on .5.
    if x.fract().abs() != 0.5 {
        x.round()
    } else {
        (x / 2.0).round() * 2.0
    }
}

/// Implementation of f64.nearest.
#[no_mangle]
pub extern "C" fn kiln_f64_nearest(x: f64) -> f64 {
    if x.fract().abs() != 0.5 {
        x.round()
    } else {
        (x / 2.0).round() * 2.0
    }
}

#[cfg(all(windows, target_arch = "x86_64"))]
extern "C" {
    // The Windows x86-64 SEH personality routine, from the C runtime. The
    // unwind post-processor points every function's personality slot at a
    // trampoline to this.
    fn __C_specific_handler();
}

/// Looks up a built-in runtime routine by its linker name.
///
/// Returns `None` for names that are not built in; the loader then reports
/// the symbol as unresolved.
pub fn runtime_symbol_address(name: &str) -> Option<usize> {
    let address = match name {
        "kiln_raise_trap" => kiln_raise_trap as usize,
        "ceilf" => kiln_f32_ceil as usize,
        "ceil" => kiln_f64_ceil as usize,
        "floorf" => kiln_f32_floor as usize,
        "floor" => kiln_f64_floor as usize,
        "truncf" => kiln_f32_trunc as usize,
        "trunc" => kiln_f64_trunc as usize,
        "nearbyintf" => kiln_f32_nearest as usize,
        "nearbyint" => kiln_f64_nearest as usize,
        #[cfg(all(windows, target_arch = "x86_64"))]
        "__C_specific_handler" => __C_specific_handler as usize,
        _ => return None,
    };
    debug_assert_ne!(address, 0);
    Some(address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_rounds_half_to_even() {
        assert_eq!(kiln_f32_nearest(2.5), 2.0);
        assert_eq!(kiln_f32_nearest(3.5), 4.0);
        assert_eq!(kiln_f32_nearest(-0.5), 0.0);
        assert_eq!(kiln_f64_nearest(2.5), 2.0);
        assert_eq!(kiln_f64_nearest(-3.5), -4.0);
    }

    #[test]
    fn known_names_resolve() {
        assert_eq!(
            runtime_symbol_address("trunc"),
            Some(kiln_f64_trunc as usize)
        );
        assert!(runtime_symbol_address("kiln_raise_trap").is_some());
        assert_eq!(runtime_symbol_address("functionImport0"), None);
    }
}
