//! End-to-end pipeline tests: source text through tokenizer, parser, type
//! propagation, code generation and the ELF writer, asserting on the
//! produced object rather than on any single stage.

use grugc::codegen::{self, ObjectCode};
use grugc::json::parse_json;
use grugc::modapi::ModApi;
use grugc::parser::parse;
use grugc::typeck::fill_result_types;
use grugc::{dump, elf};

const MOD_API: &str = r#"{
    "entities": {
        "Counter": {
            "description": "counts things",
            "on_functions": {
                "on_spawn": {
                    "description": "called at spawn",
                    "arguments": [{"name": "strength", "type": "i32"}]
                },
                "on_tick": {"description": "called per frame"}
            }
        },
        "Weapon": {"description": "pointy"}
    },
    "game_functions": {
        "play": {
            "description": "play a sound",
            "arguments": [
                {"name": "path", "type": "resource", "resource_extension": ".wav"}
            ]
        },
        "equip": {
            "description": "equip an entity",
            "arguments": [{"name": "what", "type": "entity", "entity_type": "Weapon"}]
        },
        "rand": {
            "description": "random i32",
            "return_type": "i32",
            "arguments": [{"name": "min", "type": "i32"}, {"name": "max", "type": "i32"}]
        },
        "log": {
            "description": "log a message",
            "arguments": [{"name": "message", "type": "string"}]
        }
    }
}"#;

fn api() -> ModApi {
    ModApi::from_tree(&parse_json(MOD_API).unwrap()).unwrap()
}

fn compile(source: &str) -> (ObjectCode, Vec<u8>) {
    let api = api();
    let mut ast = parse(source).unwrap();
    let globals = fill_result_types(&mut ast, &api, "tools", "Counter").unwrap();
    let object = codegen::compile(
        &ast,
        &api,
        &globals,
        "mods/tools/widget-Counter.grug",
        "tools",
        "mods",
    )
    .unwrap();
    let bytes = elf::write_shared_object(&object, api.entity("Counter").unwrap()).unwrap();
    (object, bytes)
}

const FULL_MOD: &str = concat!(
    "# tracks how often we were poked\n",
    "pokes: i32 = 0\n",
    "threshold: i32 = rand(3, 9)\n",
    "\n",
    "on_spawn(strength: i32) {\n",
    "    pokes = strength\n",
    "    play(\"sounds/spawn.wav\")\n",
    "}\n",
    "\n",
    "on_tick() {\n",
    "    pokes = pokes + 1\n",
    "    if pokes > threshold {\n",
    "        equip(\"swords:rusty-blade\")\n",
    "        pokes = 0\n",
    "    } else if pokes == threshold {\n",
    "        helper_warn()\n",
    "    }\n",
    "\n",
    "    while pokes % 2 == 1 {\n",
    "        pokes = helper_halve(pokes)\n",
    "    }\n",
    "}\n",
    "\n",
    "helper_warn() {\n",
    "    log(\"almost there\")\n",
    "}\n",
    "\n",
    "helper_halve(n: i32) i32 {\n",
    "    return n / 2\n",
    "}\n",
);

#[test]
fn test_full_mod_compiles_to_valid_elf() {
    let (object, bytes) = compile(FULL_MOD);
    assert_eq!(&bytes[..4], b"\x7fELF");

    // init_globals + 2 on fns + 2 helpers x 2 modes
    assert_eq!(object.text_symbols.len(), 7);
    assert_eq!(
        object.text_symbols,
        vec![
            "init_globals",
            "on_spawn",
            "on_tick",
            "helper_warn_safe",
            "helper_warn_fast",
            "helper_halve_safe",
            "helper_halve_fast",
        ]
    );
}

#[test]
fn test_full_mod_round_trips_through_dumper() {
    let ast = parse(FULL_MOD).unwrap();
    assert_eq!(dump::dump(&ast), FULL_MOD);
}

#[test]
fn test_round_trip_survives_type_propagation() {
    // Type propagation reclassifies string literals to resources and
    // entity references in place; the dumper must still reproduce the
    // original text
    let api = api();
    let mut ast = parse(FULL_MOD).unwrap();
    fill_result_types(&mut ast, &api, "tools", "Counter").unwrap();
    assert_eq!(dump::dump(&ast), FULL_MOD);
}

#[test]
fn test_globals_block_layout() {
    let (object, _) = compile(FULL_MOD);
    // me (8) + pokes (4) + threshold (4)
    assert_eq!(object.globals_bytes, 16);
    assert_eq!(object.global_variables_count, 3);
}

#[test]
fn test_resource_rooted_and_interned() {
    let (object, _) = compile(FULL_MOD);
    assert_eq!(object.resources.len(), 1);
    let path = &object.data_strings[object.resources[0] as usize];
    assert_eq!(path, "mods/tools/sounds/spawn.wav");
}

#[test]
fn test_entity_reference_kept_verbatim_with_type_tag() {
    let (object, _) = compile(FULL_MOD);
    assert_eq!(object.entity_dependencies.len(), 1);
    assert_eq!(object.entity_types.len(), 1);
    assert_eq!(
        object.data_strings[object.entity_dependencies[0] as usize],
        "swords:rusty-blade"
    );
    assert_eq!(object.data_strings[object.entity_types[0] as usize], "Weapon");
}

#[test]
fn test_same_resource_twice_yields_one_entry() {
    let source = concat!(
        "on_tick() {\n",
        "    play(\"foo.wav\")\n",
        "    play(\"foo.wav\")\n",
        "}\n",
    );
    let (object, _) = compile(source);
    assert_eq!(object.resources.len(), 1);
}

#[test]
fn test_imports_cover_game_and_runtime_surface() {
    let (object, _) = compile(FULL_MOD);
    let imports = &object.used_extern_fns;
    assert!(imports.contains(&"game_fn_play".to_string()));
    assert!(imports.contains(&"game_fn_equip".to_string()));
    assert!(imports.contains(&"game_fn_rand".to_string()));
    assert!(imports.contains(&"game_fn_log".to_string()));
    assert!(imports.contains(&"grug_call_runtime_error_handler".to_string()));
    assert!(imports.contains(&"grug_is_time_limit_exceeded".to_string()));
    assert!(imports.contains(&"grug_set_time_limit".to_string()));
    assert!(imports.contains(&"grug_get_max_rsp".to_string()));
    assert!(imports.contains(&"grug_get_max_rsp_addr".to_string()));
}

#[test]
fn test_minimal_file_needs_no_got_or_plt() {
    // An empty grug file is legal: the object only exports the me-sized
    // globals block and an init_globals shortcut, importing nothing, so
    // the section-header count collapses to the 11 unconditional sections
    let api = api();
    let mut ast = parse("").unwrap();
    let globals = fill_result_types(&mut ast, &api, "tools", "Counter").unwrap();
    let object = codegen::compile(
        &ast,
        &api,
        &globals,
        "mods/tools/empty-Counter.grug",
        "tools",
        "mods",
    )
    .unwrap();
    assert_eq!(object.globals_bytes, 8);
    assert!(object.used_extern_fns.is_empty());

    let bytes = elf::write_shared_object(&object, api.entity("Counter").unwrap()).unwrap();
    let section_count = u16::from_le_bytes([bytes[0x3c], bytes[0x3d]]);
    let shstrndx = u16::from_le_bytes([bytes[0x3e], bytes[0x3f]]);
    assert_eq!(section_count, 11);
    assert_eq!(shstrndx, 10);
}

#[test]
fn test_global_initializer_may_call_game_fn() {
    let source = "seed: i32 = rand(1, 100)\n\non_tick() {\n    log(\"hi\")\n}\n";
    let (object, bytes) = compile(source);
    assert!(object.used_extern_fns.contains(&"game_fn_rand".to_string()));
    assert_eq!(&bytes[..4], b"\x7fELF");
}

#[test]
fn test_error_messages_carry_grug_line_numbers() {
    let api = api();
    let source = "on_tick() {\n    x: i32 = 1 +\n}\n";
    let err = parse(source).unwrap_err();
    assert!(err.msg.contains("on line 2"), "{}", err.msg);
    let _ = api;
}

#[test]
fn test_sandbox_checks_absent_from_fast_helper() {
    let source = concat!(
        "on_tick() {\n",
        "    helper_f(6)\n",
        "}\n",
        "\n",
        "helper_f(n: i32) i32 {\n",
        "    return n / (n - 6)\n",
        "}\n",
    );
    let (object, _) = compile(source);

    let safe_start = object.helper_fn_offsets["helper_f_safe"];
    let fast_start = object.helper_fn_offsets["helper_f_fast"];
    let safe_body = &object.code[safe_start..fast_start];
    let fast_body = &object.code[fast_start..];

    // The divide-by-zero guard tests r11 (4d 85 db) before the idiv; the
    // fast body goes straight to cdq + idiv
    let test_r11 = [0x4d, 0x85, 0xdb];
    let contains = |haystack: &[u8], needle: &[u8]| {
        haystack.windows(needle.len()).any(|w| w == needle)
    };
    assert!(contains(safe_body, &test_r11));
    assert!(!contains(fast_body, &test_r11));
}

#[test]
fn test_on_fns_in_wrong_order_rejected_at_link_time() {
    let api = api();
    let source = concat!(
        "on_tick() {\n",
        "    log(\"a\")\n",
        "}\n",
        "\n",
        "on_spawn(strength: i32) {\n",
        "    log(\"b\")\n",
        "}\n",
    );
    let mut ast = parse(source).unwrap();
    let globals = fill_result_types(&mut ast, &api, "tools", "Counter").unwrap();
    let object = codegen::compile(
        &ast,
        &api,
        &globals,
        "mods/tools/x-Counter.grug",
        "tools",
        "mods",
    )
    .unwrap();
    let err = elf::write_shared_object(&object, api.entity("Counter").unwrap()).unwrap_err();
    assert!(err.msg.contains("needs to be moved"), "{}", err.msg);
}
