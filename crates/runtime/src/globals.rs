//! The four data symbols emitted code reads and writes through the GOT.

use std::ffi::{CStr, c_char};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

/// Safe/fast switch polled at every `on_` entry. Safe mode is the default.
#[unsafe(no_mangle)]
#[allow(non_upper_case_globals)]
pub static grug_on_fns_in_safe_mode: AtomicBool = AtomicBool::new(true);

/// Sticky per-call error flag. Emitted safe code sets it at every trap site
/// and every frame in the chain returns immediately while it is set.
#[unsafe(no_mangle)]
#[allow(non_upper_case_globals)]
pub static grug_has_runtime_error_happened: AtomicBool = AtomicBool::new(false);

/// Name of the `on_` function currently running, written by its safe-mode
/// prologue so the error handler can report it.
#[unsafe(no_mangle)]
#[allow(non_upper_case_globals)]
pub static grug_fn_name: AtomicPtr<c_char> = AtomicPtr::new(std::ptr::null_mut());

/// Path of the grug file the running `on_` function came from.
#[unsafe(no_mangle)]
#[allow(non_upper_case_globals)]
pub static grug_fn_path: AtomicPtr<c_char> = AtomicPtr::new(std::ptr::null_mut());

// Fast mode never writes grug_fn_name/grug_fn_path, so these placeholders
// are what the handler reports then.
static OPTIMIZED_OUT_NAME: &CStr = c"OPTIMIZED OUT FUNCTION NAME";
static OPTIMIZED_OUT_PATH: &CStr = c"OPTIMIZED OUT FUNCTION PATH";

/// Point the name/path globals back at their placeholders. The loader calls
/// this at the start of every regenerate pass.
pub fn reset_fn_name_and_path() {
    grug_fn_name.store(OPTIMIZED_OUT_NAME.as_ptr().cast_mut(), Ordering::Relaxed);
    grug_fn_path.store(OPTIMIZED_OUT_PATH.as_ptr().cast_mut(), Ordering::Relaxed);
}

fn read_c_string(ptr: &AtomicPtr<c_char>, fallback: &'static CStr) -> &'static str {
    let p = ptr.load(Ordering::Relaxed);
    if p.is_null() {
        return fallback.to_str().unwrap_or_default();
    }
    // The pointer was either stored by us or by emitted code, which only
    // ever stores addresses of NUL-terminated strings in its .data section.
    // The .data section outlives the call chain that reads this.
    unsafe { CStr::from_ptr(p) }.to_str().unwrap_or_default()
}

/// The function name the current (or last) safe-mode `on_` call recorded.
pub fn current_fn_name() -> &'static str {
    read_c_string(&grug_fn_name, OPTIMIZED_OUT_NAME)
}

/// The file path the current (or last) safe-mode `on_` call recorded.
pub fn current_fn_path() -> &'static str {
    read_c_string(&grug_fn_path, OPTIMIZED_OUT_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_placeholders_after_reset() {
        reset_fn_name_and_path();
        assert_eq!(current_fn_name(), "OPTIMIZED OUT FUNCTION NAME");
        assert_eq!(current_fn_path(), "OPTIMIZED OUT FUNCTION PATH");
    }

    #[test]
    #[serial]
    fn test_null_pointers_fall_back() {
        grug_fn_name.store(std::ptr::null_mut(), Ordering::Relaxed);
        assert_eq!(current_fn_name(), "OPTIMIZED OUT FUNCTION NAME");
        reset_fn_name_and_path();
    }
}
