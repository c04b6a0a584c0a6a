//! Compile-plane error type.
//!
//! Every pipeline stage returns `Result<_, CompileError>`. The error carries
//! the message shown to the mod author, the path of the offending file, the
//! 1-based grug source line (0 when unknown), and the Rust source location
//! that raised it. The last one replaces the C implementation's
//! `grug_c_line_number` and exists purely to debug the compiler itself.

use std::fmt;
use std::panic::Location;
use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, CompileError>;

#[derive(Debug, Clone)]
pub struct CompileError {
    pub msg: String,
    pub path: PathBuf,
    /// 1-based line in the grug source file, 0 when not tied to a line.
    pub line: u32,
    /// Where in the compiler this error was raised.
    pub origin: &'static Location<'static>,
}

impl CompileError {
    #[track_caller]
    pub fn new(msg: impl Into<String>) -> CompileError {
        CompileError {
            msg: msg.into(),
            path: PathBuf::new(),
            line: 0,
            origin: Location::caller(),
        }
    }

    #[track_caller]
    pub fn at_line(line: u32, msg: impl Into<String>) -> CompileError {
        CompileError {
            msg: msg.into(),
            path: PathBuf::new(),
            line,
            origin: Location::caller(),
        }
    }

    pub fn with_path(mut self, path: &Path) -> CompileError {
        if self.path.as_os_str().is_empty() {
            self.path = path.to_path_buf();
        }
        self
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for CompileError {}

/// `bail!("...")` returns a `CompileError` built with `format!` semantics.
/// The `line` variant pins the grug source line.
macro_rules! bail {
    (line $line:expr, $($arg:tt)*) => {
        return Err($crate::error::CompileError::at_line($line, format!($($arg)*)))
    };
    ($($arg:tt)*) => {
        return Err($crate::error::CompileError::new(format!($($arg)*)))
    };
}

/// `ensure!(cond, "...")` bails unless the condition holds.
macro_rules! ensure {
    ($cond:expr, line $line:expr, $($arg:tt)*) => {
        if !$cond {
            bail!(line $line, $($arg)*);
        }
    };
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            bail!($($arg)*);
        }
    };
}

pub(crate) use {bail, ensure};

#[cfg(test)]
mod tests {
    use super::*;

    fn raise() -> Result<()> {
        bail!("the variable '{}' does not exist", "foo");
    }

    #[test]
    fn test_bail_formats_and_tracks_origin() {
        let err = raise().unwrap_err();
        assert_eq!(err.msg, "the variable 'foo' does not exist");
        assert!(err.origin.file().ends_with("error.rs"));
        assert_eq!(err.line, 0);
    }

    #[test]
    fn test_line_variant() {
        let err: CompileError = CompileError::at_line(7, "bad indentation");
        assert_eq!(err.line, 7);
    }

    #[test]
    fn test_with_path_does_not_overwrite() {
        let err = CompileError::new("x")
            .with_path(Path::new("mods/a.grug"))
            .with_path(Path::new("mods/b.grug"));
        assert_eq!(err.path, PathBuf::from("mods/a.grug"));
    }
}
