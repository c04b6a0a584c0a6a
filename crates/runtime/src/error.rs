//! Runtime error dispatch.
//!
//! Emitted safe-mode code classifies a trap (division by zero, stack
//! overflow, deadline, i32 overflow, game-function error), sets the sticky
//! flag and calls `grug_call_runtime_error_handler` with the kind; the
//! dispatcher resolves a human-readable reason and hands everything to the
//! handler the host registered at init.

use std::cell::RefCell;
use std::sync::Mutex;
use std::sync::atomic::Ordering;

use grug_core::RuntimeErrorKind;

use crate::globals::{current_fn_name, current_fn_path, grug_has_runtime_error_happened};
use crate::limits::on_fn_time_limit_ms;

/// Host callback invoked for every runtime error an `on_` call raises.
pub type GrugRuntimeErrorHandler =
    fn(reason: &str, kind: RuntimeErrorKind, on_fn_name: &str, on_fn_path: &str);

static HANDLER: Mutex<Option<GrugRuntimeErrorHandler>> = Mutex::new(None);

thread_local! {
    // Reason text for GAME_FN_ERROR, set by the game function that rejected
    // its arguments; read back on the same thread by the dispatcher.
    static GAME_FN_REASON: RefCell<String> = const { RefCell::new(String::new()) };
}

/// Register the handler. `Grug::init` requires one.
pub fn set_runtime_error_handler(handler: GrugRuntimeErrorHandler) {
    *HANDLER.lock().unwrap() = Some(handler);
}

/// The bridge by which a game-supplied function signals that its arguments
/// were invalid: sets the sticky flag, so the current `on_` call chain
/// unwinds, and records the message for the handler.
pub fn game_function_error_happened(message: &str) {
    grug_has_runtime_error_happened.store(true, Ordering::Relaxed);
    GAME_FN_REASON.with(|reason| {
        let mut reason = reason.borrow_mut();
        reason.clear();
        reason.push_str(message);
    });
}

fn reason_for(kind: RuntimeErrorKind) -> String {
    match kind {
        RuntimeErrorKind::DivisionByZero => "Division of an i32 by 0".to_string(),
        RuntimeErrorKind::StackOverflow => {
            "Stack overflow, so check for accidental infinite recursion".to_string()
        }
        RuntimeErrorKind::TimeLimitExceeded => {
            format!("Took longer than {} milliseconds to run", on_fn_time_limit_ms())
        }
        RuntimeErrorKind::Overflow => "i32 overflow".to_string(),
        RuntimeErrorKind::GameFnError => {
            GAME_FN_REASON.with(|reason| reason.borrow().clone())
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn grug_call_runtime_error_handler(kind: u32) {
    let kind = RuntimeErrorKind::from_u32(kind).unwrap_or(RuntimeErrorKind::GameFnError);
    let reason = reason_for(kind);

    let handler = *HANDLER.lock().unwrap();
    if let Some(handler) = handler {
        handler(&reason, kind, current_fn_name(), current_fn_path());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::atomic::AtomicU32;

    static CALLS: AtomicU32 = AtomicU32::new(0);

    fn counting_handler(_reason: &str, _kind: RuntimeErrorKind, _name: &str, _path: &str) {
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    #[serial]
    fn test_game_fn_error_sets_flag_and_reason() {
        grug_has_runtime_error_happened.store(false, Ordering::Relaxed);
        game_function_error_happened("bad target id");
        assert!(grug_has_runtime_error_happened.load(Ordering::Relaxed));
        assert_eq!(reason_for(RuntimeErrorKind::GameFnError), "bad target id");
        grug_has_runtime_error_happened.store(false, Ordering::Relaxed);
    }

    #[test]
    #[serial]
    fn test_time_limit_reason_names_the_budget() {
        crate::set_on_fn_time_limit_ms(10);
        assert_eq!(
            reason_for(RuntimeErrorKind::TimeLimitExceeded),
            "Took longer than 10 milliseconds to run"
        );
    }

    #[test]
    #[serial]
    fn test_dispatch_reaches_registered_handler() {
        set_runtime_error_handler(counting_handler);
        let before = CALLS.load(Ordering::SeqCst);
        grug_call_runtime_error_handler(RuntimeErrorKind::Overflow as u32);
        assert_eq!(CALLS.load(Ordering::SeqCst), before + 1);
    }
}
