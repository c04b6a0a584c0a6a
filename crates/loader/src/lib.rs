//! grug mod loader.
//!
//! The host game constructs one [`Grug`] at startup and calls
//! [`Grug::regenerate_modified_mods`] whenever it wants changed mods picked
//! up (every frame is fine; unchanged files cost one `stat` each). Each
//! call walks the mods tree, recompiles sources newer than their DLLs,
//! hot-swaps the handles, and fills two queues the host drains afterwards:
//! [`Grug::reloads`] (recompiled files, with the old handle for instance
//! migration) and [`Grug::resource_reloads`] (resource files whose mtime
//! moved).
//!
//! Compile-time problems never crash or unload anything: the offending
//! file keeps its previously loaded DLL, the walk stops, and the error is
//! published on [`Grug::error`] with a `changed_since_last_read` flag so
//! the host can log it exactly once.
//!
//! The compile side is single-threaded (`&mut self`); the safe/fast mode
//! switches and `game_function_error_happened` re-exported here may be
//! called from game threads.

mod dll;
mod reload;
mod tree;

pub use tree::{GrugFile, GrugModified, InitGlobalsFn};

// Runtime-facing surface, re-exported so hosts depend on one crate
pub use grug_runtime::{
    GrugRuntimeErrorHandler, RuntimeErrorKind, are_on_fns_in_safe_mode,
    game_function_error_happened, set_on_fns_to_fast_mode, set_on_fns_to_safe_mode,
    toggle_on_fns_mode,
};

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use grugc::{CompileError, ModApi};

use crate::tree::ModDir;

/// The published error object. `origin_line` is the line inside the
/// toolchain that raised the error (for bug reports);
/// `changed_since_last_read` lets a polling host avoid re-logging the same
/// failure every frame.
#[derive(Debug, Clone, Default)]
pub struct GrugError {
    pub msg: String,
    pub path: PathBuf,
    pub origin_line: u32,
    pub changed_since_last_read: bool,
}

impl fmt::Display for GrugError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.as_os_str().is_empty() {
            write!(f, "{}", self.msg)
        } else {
            write!(f, "{}: {}", self.path.display(), self.msg)
        }
    }
}

impl From<CompileError> for GrugError {
    fn from(e: CompileError) -> GrugError {
        GrugError {
            origin_line: e.origin.line(),
            msg: e.msg,
            path: e.path,
            changed_since_last_read: true,
        }
    }
}

pub struct Grug {
    pub(crate) api: ModApi,
    pub(crate) mods_root: PathBuf,
    pub(crate) dll_root: PathBuf,

    pub(crate) mods: ModDir,
    /// Entity index from the last successful regenerate.
    pub(crate) entity_index: HashMap<String, GrugFile>,
    /// Index being built by the current pass; swapped in on success so a
    /// failed pass leaves lookups answering from the last good state.
    pub(crate) pending_entities: HashMap<String, GrugFile>,

    pub(crate) reloads: Vec<GrugModified>,
    pub(crate) resource_reloads: Vec<PathBuf>,

    pub(crate) error: GrugError,
    pub(crate) previous_error: Option<(String, PathBuf, u32)>,
    pub(crate) loading_error_in_grug_file: bool,
}

fn validate_dir_path(path: &Path, what: &str) -> Result<(), GrugError> {
    let Some(text) = path.to_str() else {
        return Err(GrugError {
            msg: format!("{} must be valid UTF-8", what),
            ..GrugError::default()
        });
    };
    if text.contains('\\') {
        return Err(GrugError {
            msg: format!("{} can't contain backslashes, so replace them with '/'", what),
            ..GrugError::default()
        });
    }
    if text.ends_with('/') {
        return Err(GrugError {
            msg: format!("{} can't have a trailing '/'", what),
            ..GrugError::default()
        });
    }
    Ok(())
}

impl Grug {
    /// Load the manifest, register the runtime error handler, and
    /// configure the per-`on_` CPU-time budget. Call exactly once.
    pub fn init(
        handler: GrugRuntimeErrorHandler,
        mod_api_json_path: &Path,
        mods_dir_path: &Path,
        dll_dir_path: &Path,
        on_fn_time_limit_ms: u64,
    ) -> Result<Grug, GrugError> {
        validate_dir_path(mods_dir_path, "mods_dir_path")?;
        validate_dir_path(dll_dir_path, "dll_dir_path")?;

        let api = ModApi::load(mod_api_json_path).map_err(GrugError::from)?;

        grug_runtime::set_runtime_error_handler(handler);
        grug_runtime::set_on_fn_time_limit_ms(on_fn_time_limit_ms);

        let root_name = mods_dir_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Grug {
            api,
            mods_root: mods_dir_path.to_path_buf(),
            dll_root: dll_dir_path.to_path_buf(),
            mods: ModDir::named(&root_name),
            entity_index: HashMap::new(),
            pending_entities: HashMap::new(),
            reloads: Vec::new(),
            resource_reloads: Vec::new(),
            error: GrugError::default(),
            previous_error: None,
            loading_error_in_grug_file: false,
        })
    }

    /// Walk the mods tree, recompiling and reloading what changed.
    /// Returns true when an error occurred; the details are on
    /// [`Grug::error`].
    pub fn regenerate_modified_mods(&mut self) -> bool {
        match self.regenerate_inner() {
            Ok(()) => {
                // A re-introduced typo after a successful pass is news
                // again, so forget the previous error
                self.previous_error = None;
                false
            }
            Err(e) => {
                self.publish_error(e);
                true
            }
        }
    }

    fn regenerate_inner(&mut self) -> grugc::Result<()> {
        self.reloads.clear();
        self.resource_reloads.clear();
        self.pending_entities.clear();
        self.loading_error_in_grug_file = false;
        grug_runtime::reset_fn_name_and_path();

        let mods_root = self.mods_root.clone();
        let dll_root = self.dll_root.clone();

        // The tree is moved out for the walk so the walker can borrow it
        // mutably while pushing into the queues on self
        let mut mods = std::mem::take(&mut self.mods);
        let walked = self.reload_mods_root(&mods_root, &dll_root, &mut mods);
        let checked = walked.and_then(|()| self.check_that_every_entity_exists(&mods));
        self.mods = mods;
        checked?;

        self.entity_index = std::mem::take(&mut self.pending_entities);
        Ok(())
    }

    fn publish_error(&mut self, e: CompileError) {
        let origin_line = e.origin.line();
        let changed = match &self.previous_error {
            Some((msg, path, line)) => {
                *msg != e.msg || *path != e.path || *line != origin_line
            }
            None => true,
        };
        self.previous_error = Some((e.msg.clone(), e.path.clone(), origin_line));
        self.error = GrugError {
            msg: e.msg,
            path: e.path,
            origin_line,
            changed_since_last_read: changed,
        };
    }

    /// The compiled file serving this `mod:entityname`, from the last
    /// successful regenerate. The returned data is invalidated by the next
    /// regenerate call, so don't store it.
    pub fn get_entity_file(&self, entity: &str) -> Option<&GrugFile> {
        self.entity_index.get(entity)
    }

    /// Files recompiled by the last regenerate call.
    pub fn reloads(&self) -> &[GrugModified] {
        &self.reloads
    }

    /// Resource files whose on-disk mtime moved since last observed.
    pub fn resource_reloads(&self) -> &[PathBuf] {
        &self.resource_reloads
    }

    /// The last published error.
    pub fn error(&self) -> &GrugError {
        &self.error
    }

    /// Whether the last error came from a grug file (as opposed to I/O or
    /// manifest trouble).
    pub fn loading_error_in_grug_file(&self) -> bool {
        self.loading_error_in_grug_file
    }
}
