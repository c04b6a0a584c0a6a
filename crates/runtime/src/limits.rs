//! Stack floor and deadline, the two thread-local sandbox limits.
//!
//! The first safe-mode `on_` function that calls a helper records
//! `rsp - GRUG_STACK_LIMIT` through `grug_get_max_rsp_addr`; each helper
//! entry compares rsp against `grug_get_max_rsp`. The deadline is armed by
//! `grug_set_time_limit` at `on_` entry and polled on loop back-edges,
//! `continue`, and helper returns.
//!
//! Both use `CLOCK_PROCESS_CPUTIME_ID`, so sleeping does not eat budget.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

const NS_PER_MS: u64 = 1_000_000;
const MS_PER_SEC: u64 = 1_000;
const NS_PER_SEC: i64 = 1_000_000_000;

/// Per-`on_` CPU-time budget in milliseconds, configured once at init.
static ON_FN_TIME_LIMIT_MS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static MAX_RSP: Cell<u64> = const { Cell::new(0) };
    static DEADLINE_SEC: Cell<i64> = const { Cell::new(0) };
    static DEADLINE_NSEC: Cell<i64> = const { Cell::new(0) };
}

/// Configure the per-`on_` time budget. Called by `Grug::init`.
pub fn set_on_fn_time_limit_ms(ms: u64) {
    ON_FN_TIME_LIMIT_MS.store(ms, Ordering::Relaxed);
}

pub(crate) fn on_fn_time_limit_ms() -> u64 {
    ON_FN_TIME_LIMIT_MS.load(Ordering::Relaxed)
}

fn process_cpu_time() -> libc::timespec {
    let mut now = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // clock_gettime on CLOCK_PROCESS_CPUTIME_ID cannot fail with a valid
    // pointer on any supported platform.
    unsafe {
        libc::clock_gettime(libc::CLOCK_PROCESS_CPUTIME_ID, &mut now);
    }
    now
}

#[unsafe(no_mangle)]
pub extern "C" fn grug_get_max_rsp() -> u64 {
    MAX_RSP.with(Cell::get)
}

#[unsafe(no_mangle)]
pub extern "C" fn grug_get_max_rsp_addr() -> *mut u64 {
    MAX_RSP.with(Cell::as_ptr)
}

#[unsafe(no_mangle)]
pub extern "C" fn grug_set_time_limit() {
    let limit_ms = on_fn_time_limit_ms();
    let limit_sec = (limit_ms / MS_PER_SEC) as i64;
    let limit_ns = ((limit_ms % MS_PER_SEC) * NS_PER_MS) as i64;

    let now = process_cpu_time();
    let mut sec = now.tv_sec + limit_sec;
    let mut nsec = now.tv_nsec + limit_ns;
    if nsec >= NS_PER_SEC {
        nsec -= NS_PER_SEC;
        sec += 1;
    }

    DEADLINE_SEC.with(|c| c.set(sec));
    DEADLINE_NSEC.with(|c| c.set(nsec));
}

#[unsafe(no_mangle)]
pub extern "C" fn grug_is_time_limit_exceeded() -> bool {
    let now = process_cpu_time();
    let sec = DEADLINE_SEC.with(Cell::get);
    let nsec = DEADLINE_NSEC.with(Cell::get);

    if now.tv_sec < sec {
        return false;
    }
    if now.tv_sec > sec {
        return true;
    }
    now.tv_nsec > nsec
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_deadline_not_exceeded_with_large_budget() {
        set_on_fn_time_limit_ms(10_000);
        grug_set_time_limit();
        assert!(!grug_is_time_limit_exceeded());
    }

    #[test]
    #[serial]
    fn test_deadline_exceeded_with_zero_budget() {
        set_on_fn_time_limit_ms(0);
        grug_set_time_limit();
        // Burn a little CPU time so the process clock moves past the
        // zero-width deadline.
        let mut x = 0u64;
        while !grug_is_time_limit_exceeded() && x < 500_000_000 {
            x = x.wrapping_add(1);
        }
        assert!(grug_is_time_limit_exceeded());
    }

    #[test]
    #[serial]
    fn test_max_rsp_addr_is_writable() {
        let addr = grug_get_max_rsp_addr();
        unsafe {
            *addr = 0xdead_0000;
        }
        assert_eq!(grug_get_max_rsp(), 0xdead_0000);
        unsafe {
            *addr = 0;
        }
    }
}
