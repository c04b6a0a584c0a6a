//! Names and constants shared between emitted code and the runtime.

/// Classification passed to the host's runtime error handler.
///
/// The discriminants are fixed: the code generator embeds them as immediates
/// in the `mov edi, n` preceding each `grug_call_runtime_error_handler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RuntimeErrorKind {
    DivisionByZero = 0,
    StackOverflow = 1,
    TimeLimitExceeded = 2,
    Overflow = 3,
    GameFnError = 4,
}

impl RuntimeErrorKind {
    pub fn from_u32(n: u32) -> Option<RuntimeErrorKind> {
        match n {
            0 => Some(RuntimeErrorKind::DivisionByZero),
            1 => Some(RuntimeErrorKind::StackOverflow),
            2 => Some(RuntimeErrorKind::TimeLimitExceeded),
            3 => Some(RuntimeErrorKind::Overflow),
            4 => Some(RuntimeErrorKind::GameFnError),
            _ => None,
        }
    }
}

/// Prefix put on every imported game function symbol, so that the game's
/// `damage()` becomes the import `game_fn_damage` and can never collide with
/// libc or the grug runtime surface.
pub const GAME_FN_PREFIX: &str = "game_fn_";

/// How far below the recorded rsp a helper chain may grow before safe mode
/// raises STACK_OVERFLOW.
// 64 KiB: native JNI methods can use up to 80 KiB without risking a JVM
// crash, see https://pangin.pro/posts/stack-overflow-handling
pub const GRUG_STACK_LIMIT: u32 = 0x10000;

/// Imported function symbols every safe-mode object may reference.
pub mod import {
    pub const GET_MAX_RSP: &str = "grug_get_max_rsp";
    pub const GET_MAX_RSP_ADDR: &str = "grug_get_max_rsp_addr";
    pub const SET_TIME_LIMIT: &str = "grug_set_time_limit";
    pub const IS_TIME_LIMIT_EXCEEDED: &str = "grug_is_time_limit_exceeded";
    pub const CALL_RUNTIME_ERROR_HANDLER: &str = "grug_call_runtime_error_handler";
    pub const STRCMP: &str = "strcmp";
}

/// Imported global data symbols, reached through the GOT.
pub mod global {
    pub const ON_FNS_IN_SAFE_MODE: &str = "grug_on_fns_in_safe_mode";
    pub const HAS_RUNTIME_ERROR_HAPPENED: &str = "grug_has_runtime_error_happened";
    pub const FN_NAME: &str = "grug_fn_name";
    pub const FN_PATH: &str = "grug_fn_path";
}

/// Exported data symbols every produced object defines.
pub mod export {
    pub const GLOBALS_SIZE: &str = "globals_size";
    pub const INIT_GLOBALS: &str = "init_globals";
    pub const ON_FNS: &str = "on_fns";
    pub const RESOURCES: &str = "resources";
    pub const RESOURCES_SIZE: &str = "resources_size";
    pub const ENTITIES: &str = "entities";
    pub const ENTITIES_SIZE: &str = "entities_size";
    pub const ENTITY_TYPES: &str = "entity_types";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_round_trip() {
        for n in 0..5 {
            assert_eq!(RuntimeErrorKind::from_u32(n).unwrap() as u32, n);
        }
        assert_eq!(RuntimeErrorKind::from_u32(5), None);
    }
}
