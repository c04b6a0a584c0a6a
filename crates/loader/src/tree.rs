//! The in-memory mirror of the mods directory.
//!
//! Directories and files carry a `seen` flag: each regenerate pass marks
//! what it encounters and swap-removes the rest, so records (and their DLL
//! handles) die when their sources disappear from disk.

use std::ffi::c_void;
use std::path::PathBuf;

use crate::dll::Dll;

/// Signature of the exported `init_globals` function.
pub type InitGlobalsFn = unsafe extern "C" fn(globals: *mut c_void, entity_id: u64);

/// A loaded grug file.
#[derive(Debug)]
pub struct FileRecord {
    /// Filename, e.g. `ak47-Gun.grug`.
    pub name: String,
    /// Global entity name, `mod:entityname`.
    pub entity: String,
    /// PascalCase entity type from the filename.
    pub entity_type: String,

    pub dll: Option<Dll>,
    pub globals_size: usize,
    pub init_globals_fn: Option<InitGlobalsFn>,
    pub on_fns: *mut c_void,

    /// Last-seen mtime per entry of the DLL's `resources` array.
    pub resource_mtimes: Vec<i64>,

    pub seen: bool,
}

impl FileRecord {
    pub fn snapshot(&self) -> GrugFile {
        GrugFile {
            name: self.name.clone(),
            entity: self.entity.clone(),
            entity_type: self.entity_type.clone(),
            dll: self.dll.as_ref().map_or(std::ptr::null_mut(), Dll::raw),
            globals_size: self.globals_size,
            init_globals_fn: self.init_globals_fn,
            on_fns: self.on_fns,
        }
    }
}

/// What the host sees for one loaded file. The raw pointers stay valid
/// until the next `regenerate_modified_mods` call.
#[derive(Debug, Clone)]
pub struct GrugFile {
    pub name: String,
    pub entity: String,
    pub entity_type: String,
    pub dll: *mut c_void,
    pub globals_size: usize,
    pub init_globals_fn: Option<InitGlobalsFn>,
    /// Table with one pointer per hook the entity declares; null entries
    /// are hooks the mod leaves undefined.
    pub on_fns: *mut c_void,
}

/// A reload event: the host walks these after each regenerate call to swap
/// out the instances it spawned from the old DLL.
#[derive(Debug)]
pub struct GrugModified {
    pub path: PathBuf,
    /// Identity of the handle that was closed; dangling by design, only
    /// useful for comparisons against stored handles.
    pub old_dll: *mut c_void,
    pub file: GrugFile,
}

#[derive(Debug, Default)]
pub struct ModDir {
    pub name: String,
    pub dirs: Vec<ModDir>,
    pub files: Vec<FileRecord>,
    pub seen: bool,
    /// Whether this directory carries a valid about.json.
    pub is_mod: bool,
}

impl ModDir {
    pub fn named(name: &str) -> ModDir {
        ModDir { name: name.to_string(), ..ModDir::default() }
    }

    pub fn subdir_index(&self, name: &str) -> Option<usize> {
        self.dirs.iter().position(|d| d.name == name)
    }

    pub fn file_index(&self, name: &str) -> Option<usize> {
        self.files.iter().position(|f| f.name == name)
    }

    /// Drop every child this pass did not encounter. Dropping a
    /// `FileRecord` closes its DLL handle.
    pub fn reconcile_unseen(&mut self) {
        let mut i = self.dirs.len();
        while i > 0 {
            i -= 1;
            if !self.dirs[i].seen {
                self.dirs.swap_remove(i);
            }
        }

        let mut i = self.files.len();
        while i > 0 {
            i -= 1;
            if !self.files[i].seen {
                self.files.swap_remove(i);
            }
        }
    }

    pub fn clear_seen_flags(&mut self) {
        for dir in &mut self.dirs {
            dir.seen = false;
        }
        for file in &mut self.files {
            file.seen = false;
        }
    }
}
