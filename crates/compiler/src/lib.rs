//! grug compiler library.
//!
//! Compiles grug mod scripts straight to x86-64 ELF shared objects:
//!
//! ```text
//! path -> bytes -> tokens -> AST -> typed AST -> machine code -> .so
//! ```
//!
//! The pipeline is single-pass and allocation-friendly: every stage returns
//! `Result<_, CompileError>` and the driver [`compile_grug_file`] runs them
//! in order against a loaded [`ModApi`] manifest. The produced object
//! exports `globals_size`, `init_globals`, the defined `on_*` hooks, the
//! `resources`/`entities`/`entity_types` arrays and a `_safe`/`_fast` pair
//! per helper function; it imports the game functions it calls plus the
//! `grug_*` runtime support surface (provided by the `grug-runtime` crate).
//!
//! Parsing round-trips: [`dump::dump`] turns an AST back into the exact
//! source text, which is what external mod-rewriting tooling builds on.

pub mod ast;
pub mod astjson;
pub mod codegen;
pub mod dump;
pub mod elf;
pub mod error;
pub mod json;
pub mod modapi;
pub mod parser;
pub mod tokenizer;
pub mod typeck;

pub use error::{CompileError, Result};
pub use modapi::ModApi;

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::{bail, ensure};

/// Split a grug filename into its entity name and entity type:
/// `knife-rack-Weapon.grug` → `("knife-rack", "Weapon")`. The LAST dash
/// separates the two, and the type must be PascalCase.
pub fn split_entity_filename(filename: &str) -> Result<(&str, &str)> {
    let Some(stem) = filename.strip_suffix(".grug") else {
        bail!("'{}' is missing the '.grug' extension in its filename", filename);
    };

    let Some((entity_name, entity_type)) = stem.rsplit_once('-') else {
        bail!(
            "'{}' is missing an entity type in its name; use a dash to specify it, like 'ak47-Gun.grug'",
            filename
        );
    };
    ensure!(
        !entity_name.is_empty(),
        "'{}' is missing an entity name before its dash",
        filename
    );
    ensure!(
        !entity_type.is_empty(),
        "'{}' is missing an entity type in its name; use a dash to specify it, like 'ak47-Gun.grug'",
        filename
    );

    modapi::check_custom_id_is_pascal(entity_type)?;
    Ok((entity_name, entity_type))
}

/// Compile one grug source file to a shared object on disk.
///
/// `mods_root` and `mod_name` feed the resource-path and entity-reference
/// rewriting (`"foo.wav"` becomes `{mods_root}/{mod_name}/foo.wav`,
/// `"knife"` becomes `{mod_name}:knife`). Parent directories of `dll_path`
/// are created as needed.
pub fn compile_grug_file(
    api: &ModApi,
    mods_root: &str,
    mod_name: &str,
    grug_path: &Path,
    dll_path: &Path,
) -> Result<()> {
    let filename = grug_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let (_, entity_type) = split_entity_filename(filename)?;

    let bytes = compile_grug_source_to_object(
        api,
        mods_root,
        mod_name,
        &grug_path.to_string_lossy(),
        entity_type,
        &read_source(grug_path)?,
    )?;

    if let Some(parent) = dll_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| CompileError::new(format!("mkdir {}: {}", parent.display(), e)))?;
    }
    fs::write(dll_path, bytes)
        .map_err(|e| CompileError::new(format!("{}: {}", dll_path.display(), e)))?;

    debug!(grug = %grug_path.display(), dll = %dll_path.display(), "regenerated dll");
    Ok(())
}

/// The in-memory half of [`compile_grug_file`]: source text in, shared
/// object bytes out.
pub fn compile_grug_source_to_object(
    api: &ModApi,
    mods_root: &str,
    mod_name: &str,
    grug_path: &str,
    entity_type: &str,
    source: &str,
) -> Result<Vec<u8>> {
    let path = Path::new(grug_path);

    let mut ast = parser::parse(source).map_err(|e| e.with_path(path))?;
    debug!(
        globals = ast.globals.len(),
        on_fns = ast.on_fns.len(),
        helper_fns = ast.helper_fns.len(),
        "parsed"
    );

    let globals = typeck::fill_result_types(&mut ast, api, mod_name, entity_type)
        .map_err(|e| e.with_path(path))?;
    debug!(globals_bytes = globals.total_bytes, "type propagation done");

    let object = codegen::compile(&ast, api, &globals, grug_path, mod_name, mods_root)
        .map_err(|e| e.with_path(path))?;
    debug!(
        text_bytes = object.code.len(),
        imports = object.used_extern_fns.len(),
        "compiled"
    );

    let entity = match api.entity(entity_type) {
        Some(entity) => entity,
        None => bail!("The entity '{}' was not declared by mod_api.json", entity_type),
    };
    elf::write_shared_object(&object, entity).map_err(|e| e.with_path(path))
}

fn read_source(grug_path: &Path) -> Result<String> {
    fs::read_to_string(grug_path)
        .map_err(|e| CompileError::new(format!("{}: {}", grug_path.display(), e)).with_path(grug_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_entity_filename() {
        assert_eq!(split_entity_filename("ak47-Gun.grug").unwrap(), ("ak47", "Gun"));
        assert_eq!(
            split_entity_filename("knife-rack-Weapon.grug").unwrap(),
            ("knife-rack", "Weapon")
        );
    }

    #[test]
    fn test_split_rejects_missing_dash() {
        let err = split_entity_filename("ak47.grug").unwrap_err();
        assert!(err.msg.contains("missing an entity type"), "{}", err.msg);
    }

    #[test]
    fn test_split_rejects_missing_extension() {
        let err = split_entity_filename("ak47-Gun").unwrap_err();
        assert!(err.msg.contains(".grug"), "{}", err.msg);
    }

    #[test]
    fn test_split_rejects_empty_type() {
        assert!(split_entity_filename("foo-.grug").is_err());
        assert!(split_entity_filename("-Gun.grug").is_err());
    }

    #[test]
    fn test_split_rejects_lowercase_type() {
        let err = split_entity_filename("ak47-gun.grug").unwrap_err();
        assert!(err.msg.contains("PascalCase"), "{}", err.msg);
    }

    #[test]
    fn test_compile_source_to_object_end_to_end() {
        let api = ModApi::from_tree(
            &json::parse_json(
                r#"{
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
                }"#,
            )
            .unwrap(),
        )
        .unwrap();

        let bytes = compile_grug_source_to_object(
            &api,
            "mods",
            "hello",
            "mods/hello/hello-Greeter.grug",
            "Greeter",
            "on_start() {\n    noop()\n}\n",
        )
        .unwrap();
        assert_eq!(&bytes[..4], b"\x7fELF");
    }

    #[test]
    fn test_compile_file_writes_dll_and_parents() {
        let api = ModApi::from_tree(
            &json::parse_json(
                r#"{
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
                }"#,
            )
            .unwrap(),
        )
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let mods = dir.path().join("mods").join("hello");
        std::fs::create_dir_all(&mods).unwrap();
        let grug_path = mods.join("hi-Greeter.grug");
        std::fs::write(&grug_path, "on_start() {\n    noop()\n}\n").unwrap();

        let dll_path = dir.path().join("dlls").join("hello").join("hi-Greeter.so");
        compile_grug_file(
            &api,
            &dir.path().join("mods").to_string_lossy(),
            "hello",
            &grug_path,
            &dll_path,
        )
        .unwrap();

        let bytes = std::fs::read(&dll_path).unwrap();
        assert_eq!(&bytes[..4], b"\x7fELF");
    }

    #[test]
    fn test_compile_error_carries_path() {
        let api = ModApi::from_tree(
            &json::parse_json(r#"{"entities": {}, "game_functions": {}}"#).unwrap(),
        )
        .unwrap();

        let err = compile_grug_source_to_object(
            &api,
            "mods",
            "hello",
            "mods/hello/hi-Greeter.grug",
            "Greeter",
            "on_start() {\n    noop()\n}\n",
        )
        .unwrap_err();
        assert_eq!(err.path, std::path::PathBuf::from("mods/hello/hi-Greeter.grug"));
    }
}
