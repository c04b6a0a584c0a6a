//! The safe/fast switch.
//!
//! Safe mode is significantly slower than fast mode, but guarantees mod
//! runtime errors (division by 0, stack overflow, functions taking too long)
//! cannot crash the process. The switch is polled by every `on_` function at
//! entry, so flipping it takes effect on the next call.

use std::sync::atomic::Ordering;

use crate::globals::grug_on_fns_in_safe_mode;

pub fn set_on_fns_to_safe_mode() {
    grug_on_fns_in_safe_mode.store(true, Ordering::Relaxed);
}

pub fn set_on_fns_to_fast_mode() {
    grug_on_fns_in_safe_mode.store(false, Ordering::Relaxed);
}

pub fn are_on_fns_in_safe_mode() -> bool {
    grug_on_fns_in_safe_mode.load(Ordering::Relaxed)
}

pub fn toggle_on_fns_mode() {
    grug_on_fns_in_safe_mode.fetch_xor(true, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_safe_mode_is_default_and_toggles() {
        set_on_fns_to_safe_mode();
        assert!(are_on_fns_in_safe_mode());

        toggle_on_fns_mode();
        assert!(!are_on_fns_in_safe_mode());

        toggle_on_fns_mode();
        assert!(are_on_fns_in_safe_mode());

        set_on_fns_to_fast_mode();
        assert!(!are_on_fns_in_safe_mode());

        set_on_fns_to_safe_mode();
    }
}
