//! Shared foundation for the grug toolchain.
//!
//! This crate pins down everything the compiler and the runtime must agree
//! on: the primitive type model with its byte sizes, the runtime error
//! classification passed to the host's error handler, the names of every
//! symbol a produced shared object exports or imports, and the two hash
//! functions whose iteration order is part of the output contract.

pub mod abi;
pub mod hash;
pub mod types;

pub use abi::{GAME_FN_PREFIX, GRUG_STACK_LIMIT, RuntimeErrorKind};
pub use hash::{BFD_HASH_BUCKET_COUNT, bfd_hash, elf_hash};
pub use types::Type;
