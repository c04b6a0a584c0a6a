//! Runtime support surface for compiled grug mods.
//!
//! Every shared object the grug compiler produces imports a handful of
//! `grug_*` symbols. This crate provides them, so a host game links it (as
//! a staticlib or through `grug-loader`) and the dynamic loader resolves
//! the imports against the game executable.
//!
//! Two kinds of state live here:
//!
//! * **Exported globals** (`grug_on_fns_in_safe_mode`,
//!   `grug_has_runtime_error_happened`, `grug_fn_name`, `grug_fn_path`) are
//!   ordinary data symbols, because emitted code reaches them through plain
//!   `R_X86_64_GLOB_DAT` relocations. They are one byte / one pointer wide
//!   and accessed atomically on the Rust side.
//! * **Thread-local state** (the stack floor and the deadline) is only ever
//!   reached through the exported functions, so it can use `thread_local!`;
//!   mod functions run on whichever game thread calls them.

mod error;
mod globals;
mod limits;
mod mode;

pub use error::{
    GrugRuntimeErrorHandler, game_function_error_happened, set_runtime_error_handler,
};
pub use globals::{current_fn_name, current_fn_path, reset_fn_name_and_path};
pub use limits::set_on_fn_time_limit_ms;
pub use mode::{
    are_on_fns_in_safe_mode, set_on_fns_to_fast_mode, set_on_fns_to_safe_mode,
    toggle_on_fns_mode,
};

pub use grug_core::RuntimeErrorKind;
