//! The regenerate walk.
//!
//! Layout on disk: the mods root contains arbitrarily nested directories;
//! a directory with a valid `about.json` is a mod, and only mods (and
//! their subdirectories, up to 42 levels) may contain `.grug` files. Every
//! `.grug` compiles to a `.so` at the same relative path under the DLL
//! root.

use std::ffi::c_void;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use grugc::error::{CompileError, Result};
use grugc::json::{self, JsonValue};
use tracing::debug;

use crate::Grug;
use crate::dll::Dll;
use crate::tree::{FileRecord, GrugModified, InitGlobalsFn, ModDir};

const MAX_DIRECTORY_DEPTH: usize = 42;

// Same shape as the compiler's internal error macros; `CompileError::new`
// is #[track_caller], so the recorded origin is the line below.
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err(CompileError::new(format!($($arg)*)))
    };
}

macro_rules! ensure {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            bail!($($arg)*);
        }
    };
}

/// A mod's `about.json` must have `name`, `version`, `game_version` and
/// `author` as its first four fields, all non-empty strings. Returns false
/// when the file doesn't exist (the directory simply isn't a mod).
pub(crate) fn validate_about_file(about_json_path: &Path) -> Result<bool> {
    if !about_json_path.exists() {
        return Ok(false);
    }

    let root = json::read_json_tree(about_json_path)?;
    let JsonValue::Object(fields) = &root else {
        bail!("{} its root must be an object", about_json_path.display());
    };

    ensure!(
        fields.len() >= 4,
        "{} must have at least these 4 fields, in this order: \"name\", \"version\", \"game_version\", \"author\"",
        about_json_path.display()
    );

    for (i, expected_key) in ["name", "version", "game_version", "author"]
        .iter()
        .enumerate()
    {
        let (key, value) = &fields[i];
        ensure!(
            key == expected_key,
            "{} its root object must have \"{}\" as one of its first four fields, in order",
            about_json_path.display(),
            expected_key
        );
        let Some(text) = value.as_str() else {
            bail!(
                "{} its \"{}\" field must have a string as its value",
                about_json_path.display(),
                expected_key
            );
        };
        ensure!(
            !text.is_empty(),
            "{} its \"{}\" field value must not be an empty string",
            about_json_path.display(),
            expected_key
        );
    }

    for (key, _) in &fields[4..] {
        ensure!(
            !key.is_empty(),
            "{} its extra field keys must not be empty strings",
            about_json_path.display()
        );
    }

    Ok(true)
}

/// Directory entries, name-sorted so walks (and therefore error order and
/// queue order) are deterministic across filesystems.
fn sorted_entries(dir_path: &Path) -> Result<Vec<(String, fs::Metadata)>> {
    let reader = fs::read_dir(dir_path)
        .map_err(|e| CompileError::new(format!("opendir(\"{}\"): {}", dir_path.display(), e)))?;

    let mut entries = Vec::new();
    for entry in reader {
        let entry =
            entry.map_err(|e| CompileError::new(format!("readdir: {}", e)))?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            bail!("'{}' contains a file with a non-UTF-8 name", dir_path.display());
        };
        let metadata = fs::metadata(entry.path())
            .map_err(|e| CompileError::new(format!("stat: {}: {}", entry.path().display(), e)))?;
        entries.push((name, metadata));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

impl Grug {
    /// Walk the area above the mods: directories nest freely, mods are
    /// recognized by their about.json, and stray `.grug` files are errors.
    pub(crate) fn reload_mods_root(
        &mut self,
        mods_dir: &Path,
        dll_dir: &Path,
        dir: &mut ModDir,
    ) -> Result<()> {
        dir.clear_seen_flags();

        for (name, metadata) in sorted_entries(mods_dir)? {
            let entry_path = mods_dir.join(&name);
            let dll_entry_path = dll_dir.join(&name);

            if metadata.is_dir() {
                let is_mod = validate_about_file(&entry_path.join("about.json"))?;

                let subdir_index = match dir.subdir_index(&name) {
                    Some(i) => i,
                    None => {
                        dir.dirs.push(ModDir::named(&name));
                        dir.dirs.len() - 1
                    }
                };
                {
                    let subdir = &mut dir.dirs[subdir_index];
                    subdir.seen = true;
                    subdir.is_mod = is_mod;
                }

                if is_mod {
                    debug!(mod_name = %name, "walking mod");
                    self.reload_mod_dir(
                        &entry_path,
                        &dll_entry_path,
                        &mut dir.dirs[subdir_index],
                        &name,
                        1,
                    )?;
                } else {
                    self.reload_mods_root(
                        &entry_path,
                        &dll_entry_path,
                        &mut dir.dirs[subdir_index],
                    )?;
                }
            } else if metadata.is_file() {
                ensure!(
                    !name.ends_with(".grug"),
                    "Grug files must be contained in a valid mod directory, however no parent of '{}' has an about.json",
                    entry_path.display()
                );
            }
        }

        dir.reconcile_unseen();
        Ok(())
    }

    /// Walk one mod (or a subdirectory of one), reloading grug files.
    fn reload_mod_dir(
        &mut self,
        mods_dir: &Path,
        dll_dir: &Path,
        dir: &mut ModDir,
        mod_name: &str,
        depth: usize,
    ) -> Result<()> {
        ensure!(
            depth < MAX_DIRECTORY_DEPTH,
            "There is a mod that contains more than {} levels of nested directories",
            MAX_DIRECTORY_DEPTH
        );

        dir.clear_seen_flags();

        for (name, metadata) in sorted_entries(mods_dir)? {
            let entry_path = mods_dir.join(&name);
            let dll_entry_path = dll_dir.join(&name);

            if metadata.is_dir() {
                let subdir_index = match dir.subdir_index(&name) {
                    Some(i) => i,
                    None => {
                        dir.dirs.push(ModDir::named(&name));
                        dir.dirs.len() - 1
                    }
                };
                dir.dirs[subdir_index].seen = true;
                self.reload_mod_dir(
                    &entry_path,
                    &dll_entry_path,
                    &mut dir.dirs[subdir_index],
                    mod_name,
                    depth + 1,
                )?;
            } else if metadata.is_file() && name.ends_with(".grug") {
                self.reload_grug_file(
                    &entry_path,
                    &dll_entry_path,
                    &name,
                    metadata.mtime(),
                    dir,
                    mod_name,
                )?;
            }
        }

        dir.reconcile_unseen();
        Ok(())
    }

    fn reload_grug_file(
        &mut self,
        grug_path: &Path,
        dll_entry_path: &Path,
        filename: &str,
        grug_mtime: i64,
        dir: &mut ModDir,
        mod_name: &str,
    ) -> Result<()> {
        let (entity_name, entity_type) =
            grugc::split_entity_filename(filename).map_err(|e| e.with_path(grug_path))?;

        let dll_path = dll_entry_path.with_extension("so");
        let dll_mtime = fs::metadata(&dll_path).ok().map(|m| m.mtime());

        // Recompile when the DLL is missing or older than the source
        let needs_regeneration = match dll_mtime {
            None => true,
            Some(dll_mtime) => grug_mtime > dll_mtime,
        };

        let file_index = dir.file_index(filename);

        if needs_regeneration || file_index.is_none() {
            if needs_regeneration {
                // Everything the compiler rejects from here on is the mod
                // author's code
                self.loading_error_in_grug_file = true;
                grugc::compile_grug_file(
                    &self.api,
                    &self.mods_root.to_string_lossy(),
                    mod_name,
                    grug_path,
                    &dll_path,
                )
                .map_err(|e| e.with_path(grug_path))?;
                self.loading_error_in_grug_file = false;
            }

            // The old handle stays open across the compile so a failure
            // above leaves the game running the previous version; it has
            // to close before the dlopen below, or the loader would hand
            // back the stale mapping
            let old_dll: *mut c_void = match file_index {
                Some(i) => {
                    let old = dir.files[i].dll.take();
                    let raw = old.as_ref().map_or(std::ptr::null_mut(), Dll::raw);
                    drop(old);
                    raw
                }
                None => std::ptr::null_mut(),
            };

            let record = self.open_dll_into_record(
                &dll_path,
                filename,
                mod_name,
                entity_name,
                entity_type,
            )?;

            let file_index = match file_index {
                Some(i) => {
                    let file = &mut dir.files[i];
                    file.dll = record.dll;
                    file.globals_size = record.globals_size;
                    file.init_globals_fn = record.init_globals_fn;
                    file.on_fns = record.on_fns;
                    file.resource_mtimes = record.resource_mtimes;
                    i
                }
                None => {
                    dir.files.push(record);
                    dir.files.len() - 1
                }
            };

            if needs_regeneration {
                self.reloads.push(GrugModified {
                    path: grug_path.to_path_buf(),
                    old_dll,
                    file: dir.files[file_index].snapshot(),
                });
            }
        }

        let file_index = dir
            .file_index(filename)
            .expect("the record was created or updated above");
        dir.files[file_index].seen = true;

        self.add_entity(filename, mod_name, &dir.files[file_index])?;
        self.scan_resources(&mut dir.files[file_index])
    }

    fn open_dll_into_record(
        &self,
        dll_path: &Path,
        filename: &str,
        mod_name: &str,
        entity_name: &str,
        entity_type: &str,
    ) -> Result<FileRecord> {
        let dll = Dll::open(dll_path)?;

        let Some(globals_size) = dll.sym_u64("globals_size") else {
            bail!(
                "Retrieving the globals_size variable with dlsym() failed for {}",
                dll_path.display()
            );
        };
        let Some(init_globals_address) = dll.sym("init_globals") else {
            bail!(
                "Retrieving the init_globals() function with dlsym() failed for {}",
                dll_path.display()
            );
        };
        // The symbol was produced by our own code generator with exactly
        // this signature.
        let init_globals_fn: InitGlobalsFn =
            unsafe { std::mem::transmute(init_globals_address) };

        // on_fns is optional: an entity without declared hooks exports none
        let on_fns = dll.sym("on_fns").unwrap_or(std::ptr::null_mut());

        let Some(resources_size) = dll.sym_u64("resources_size") else {
            bail!(
                "Retrieving the resources_size variable with dlsym() failed for {}",
                dll_path.display()
            );
        };

        let mut resource_mtimes = Vec::with_capacity(resources_size as usize);
        for i in 0..resources_size as usize {
            let Some(resource) = dll.sym_c_string_array_entry("resources", i) else {
                bail!(
                    "Retrieving the resources variable with dlsym() failed for {}",
                    dll_path.display()
                );
            };
            let metadata = fs::metadata(&resource)
                .map_err(|e| CompileError::new(format!("{}: {}", resource, e)))?;
            resource_mtimes.push(metadata.mtime());
        }

        Ok(FileRecord {
            name: filename.to_string(),
            entity: format!("{}:{}", mod_name, entity_name),
            entity_type: entity_type.to_string(),
            dll: Some(dll),
            globals_size: globals_size as usize,
            init_globals_fn: Some(init_globals_fn),
            on_fns,
            resource_mtimes,
            seen: false,
        })
    }

    fn add_entity(&mut self, filename: &str, mod_name: &str, file: &FileRecord) -> Result<()> {
        ensure!(
            !self.pending_entities.contains_key(&file.entity),
            "The entity '{}' already exists, because there are two grug files called '{}' in the mod '{}'",
            file.entity,
            filename,
            mod_name
        );
        self.pending_entities.insert(file.entity.clone(), file.snapshot());
        Ok(())
    }

    /// Stat every resource the loaded object references; mtimes that moved
    /// past the stored value enqueue a resource reload.
    fn scan_resources(&mut self, file: &mut FileRecord) -> Result<()> {
        if file.resource_mtimes.is_empty() {
            return Ok(());
        }
        let Some(dll) = file.dll.as_ref() else {
            return Ok(());
        };

        let mut resources = Vec::with_capacity(file.resource_mtimes.len());
        for i in 0..file.resource_mtimes.len() {
            let Some(resource) = dll.sym_c_string_array_entry("resources", i) else {
                bail!("Retrieving the resources variable with dlsym() failed for '{}'", file.name);
            };
            resources.push(resource);
        }

        for (i, resource) in resources.into_iter().enumerate() {
            let metadata = fs::metadata(&resource)
                .map_err(|e| CompileError::new(format!("{}: {}", resource, e)))?;
            let mtime = metadata.mtime();
            if mtime > file.resource_mtimes[i] {
                file.resource_mtimes[i] = mtime;
                self.resource_reloads.push(PathBuf::from(resource));
            }
        }
        Ok(())
    }

    /// Post-walk check: every entity referenced by every loaded object must
    /// exist, and its type tag (when non-empty) must match the referenced
    /// file's entity type.
    pub(crate) fn check_that_every_entity_exists(&self, dir: &ModDir) -> Result<()> {
        for file in &dir.files {
            let Some(dll) = file.dll.as_ref() else {
                continue;
            };

            let Some(entities_size) = dll.sym_u64("entities_size") else {
                bail!(
                    "Retrieving the entities_size variable with dlsym() failed for '{}'",
                    file.name
                );
            };

            for i in 0..entities_size as usize {
                let Some(entity) = dll.sym_c_string_array_entry("entities", i) else {
                    bail!(
                        "Retrieving the entities variable with dlsym() failed for '{}'",
                        file.name
                    );
                };

                let Some(found) = self.pending_entities.get(&entity) else {
                    bail!("The entity '{}' does not exist", entity);
                };

                let Some(json_entity_type) = dll.sym_c_string_array_entry("entity_types", i)
                else {
                    bail!(
                        "Retrieving the entity_types variable with dlsym() failed for '{}'",
                        file.name
                    );
                };

                ensure!(
                    json_entity_type.is_empty() || found.entity_type == json_entity_type,
                    "The entity '{}' has the type '{}', whereas the expected type from mod_api.json is '{}'",
                    entity,
                    found.entity_type,
                    json_entity_type
                );
            }
        }

        for subdir in &dir.dirs {
            self.check_that_every_entity_exists(subdir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Grug, RuntimeErrorKind};
    use serial_test::serial;
    use std::fs;

    fn noop_handler(_reason: &str, _kind: RuntimeErrorKind, _name: &str, _path: &str) {}

    const MOD_API: &str = r#"{
        "entities": {
            "Greeter": {
                "description": "says hi",
                "on_functions": {
                    "on_start": {"description": "called once"}
                }
            }
        },
        "game_functions": {
            "noop": {"description": "does nothing"}
        }
    }"#;

    const ABOUT: &str = r#"{
        "name": "Hello",
        "version": "1.0.0",
        "game_version": "1.0.0",
        "author": "somebody"
    }"#;

    struct Fixture {
        _dir: tempfile::TempDir,
        mods: std::path::PathBuf,
        dlls: std::path::PathBuf,
        grug: Grug,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mods = dir.path().join("mods");
        let dlls = dir.path().join("mod_dlls");
        fs::create_dir_all(&mods).unwrap();
        fs::create_dir_all(&dlls).unwrap();

        let api_path = dir.path().join("mod_api.json");
        fs::write(&api_path, MOD_API).unwrap();

        let grug = Grug::init(noop_handler, &api_path, &mods, &dlls, 10).unwrap();
        Fixture { _dir: dir, mods, dlls, grug }
    }

    fn write_mod(fixture: &Fixture, mod_name: &str, filename: &str, source: &str) {
        let mod_dir = fixture.mods.join(mod_name);
        fs::create_dir_all(&mod_dir).unwrap();
        fs::write(mod_dir.join("about.json"), ABOUT).unwrap();
        fs::write(mod_dir.join(filename), source).unwrap();
    }

    #[test]
    #[serial]
    fn test_empty_mods_dir_succeeds() {
        let mut f = fixture();
        assert!(!f.grug.regenerate_modified_mods(), "{}", f.grug.error());
        assert!(f.grug.reloads().is_empty());
        assert!(f.grug.resource_reloads().is_empty());
    }

    #[test]
    #[serial]
    fn test_stray_grug_file_outside_mod_rejected() {
        let mut f = fixture();
        fs::write(f.mods.join("stray-Greeter.grug"), "on_start() {\n    noop()\n}\n").unwrap();

        assert!(f.grug.regenerate_modified_mods());
        assert!(
            f.grug.error().msg.contains("must be contained in a valid mod directory"),
            "{}",
            f.grug.error().msg
        );
    }

    #[test]
    #[serial]
    fn test_invalid_about_json_rejected() {
        let mut f = fixture();
        let mod_dir = f.mods.join("hello");
        fs::create_dir_all(&mod_dir).unwrap();
        fs::write(mod_dir.join("about.json"), r#"{"name": "Hello"}"#).unwrap();

        assert!(f.grug.regenerate_modified_mods());
        assert!(f.grug.error().msg.contains("4 fields"), "{}", f.grug.error().msg);
    }

    #[test]
    #[serial]
    fn test_dir_without_about_json_is_not_a_mod() {
        let mut f = fixture();
        // A directory with no about.json and no grug files is just a
        // grouping directory
        fs::create_dir_all(f.mods.join("category")).unwrap();
        assert!(!f.grug.regenerate_modified_mods(), "{}", f.grug.error());
    }

    #[test]
    #[serial]
    fn test_bad_filename_reports_error() {
        let mut f = fixture();
        write_mod(&f, "hello", "nodash.grug", "on_start() {\n    noop()\n}\n");

        assert!(f.grug.regenerate_modified_mods());
        assert!(
            f.grug.error().msg.contains("missing an entity type"),
            "{}",
            f.grug.error().msg
        );
    }

    #[test]
    #[serial]
    fn test_compile_error_published_with_path() {
        let mut f = fixture();
        write_mod(&f, "hello", "hi-Greeter.grug", "on_start() {\n        noop()\n}\n");

        assert!(f.grug.regenerate_modified_mods());
        let error = f.grug.error();
        assert!(error.msg.contains("Expected 4 spaces"), "{}", error.msg);
        assert!(error.path.ends_with("hi-Greeter.grug"));
        assert!(error.origin_line > 0);
        assert!(f.grug.loading_error_in_grug_file());
    }

    #[test]
    #[serial]
    fn test_error_dedup_flag() {
        let mut f = fixture();
        write_mod(&f, "hello", "hi-Greeter.grug", "on_start() {\n        noop()\n}\n");

        assert!(f.grug.regenerate_modified_mods());
        assert!(f.grug.error().changed_since_last_read);

        assert!(f.grug.regenerate_modified_mods());
        assert!(
            !f.grug.error().changed_since_last_read,
            "the same failure twice in a row is not news"
        );
    }

    #[test]
    #[serial]
    fn test_compile_writes_dll_on_disk() {
        let mut f = fixture();
        write_mod(&f, "hello", "hi-Greeter.grug", "on_start() {\n    noop()\n}\n");

        // Whether the subsequent dlopen resolves the grug_* imports
        // depends on how the test binary was linked, so only the compile
        // side is asserted here
        let _ = f.grug.regenerate_modified_mods();

        let dll_path = f.dlls.join("hello").join("hi-Greeter.so");
        let bytes = fs::read(&dll_path).unwrap();
        assert_eq!(&bytes[..4], b"\x7fELF");
    }

    #[test]
    #[serial]
    fn test_failed_pass_preserves_entity_index() {
        let mut f = fixture();
        write_mod(&f, "hello", "hi-Greeter.grug", "on_start() {\n    noop()\n}\n");
        let loaded = !f.grug.regenerate_modified_mods();

        if loaded {
            assert!(f.grug.get_entity_file("hello:hi").is_some());

            // Introduce a typo; the failed pass must keep answering from
            // the last good index
            std::thread::sleep(std::time::Duration::from_millis(1100));
            write_mod(&f, "hello", "hi-Greeter.grug", "on_start() {\n        noop()\n}\n");
            assert!(f.grug.regenerate_modified_mods());
            assert!(f.grug.get_entity_file("hello:hi").is_some());
        }
    }

    #[test]
    fn test_validate_about_file_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("about.json");
        fs::write(&path, ABOUT).unwrap();
        assert!(validate_about_file(&path).unwrap());
    }

    #[test]
    fn test_validate_about_file_missing_is_not_a_mod() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!validate_about_file(&dir.path().join("about.json")).unwrap());
    }

    #[test]
    fn test_validate_about_file_field_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("about.json");
        fs::write(
            &path,
            r#"{"version": "1", "name": "x", "game_version": "1", "author": "a"}"#,
        )
        .unwrap();
        let err = validate_about_file(&path).unwrap_err();
        assert!(err.msg.contains("\"name\""), "{}", err.msg);
    }

    #[test]
    fn test_validate_about_file_rejects_empty_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("about.json");
        fs::write(
            &path,
            r#"{"name": "", "version": "1", "game_version": "1", "author": "a"}"#,
        )
        .unwrap();
        assert!(validate_about_file(&path).is_err());
    }

    #[test]
    fn test_validate_about_file_allows_extra_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("about.json");
        fs::write(
            &path,
            r#"{"name": "x", "version": "1", "game_version": "1", "author": "a", "homepage": "https://example.com"}"#,
        )
        .unwrap();
        assert!(validate_about_file(&path).unwrap());
    }
}
