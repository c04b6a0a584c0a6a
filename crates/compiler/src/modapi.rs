//! Mod API manifest loader.
//!
//! `mod_api.json` declares the entities the game knows about (and the `on_`
//! hooks each one may define) plus the game functions mod code is allowed to
//! call. The manifest is strict: key order is fixed, every description is a
//! non-empty string, and `resource`/`entity` arguments must carry their
//! extension / entity-type tag. Everything is validated and interned here so
//! the rest of the pipeline can assume a well-formed [`ModApi`].

use std::collections::HashMap;
use std::path::Path;

use grug_core::Type;

use crate::error::{Result, bail, ensure};
use crate::json::{self, JsonValue};

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: Type,
    pub type_name: String,
    /// Required extension when `ty` is `resource`, e.g. ".wav".
    pub resource_extension: Option<String>,
    /// Required entity type when `ty` is `entity`; empty string means "any".
    pub entity_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OnFunction {
    pub name: String,
    pub params: Vec<Param>,
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub name: String,
    pub on_functions: Vec<OnFunction>,
}

impl Entity {
    /// The hook with this name, along with its slot in the exported
    /// `on_fns` table.
    pub fn on_fn(&self, name: &str) -> Option<(usize, &OnFunction)> {
        self.on_functions
            .iter()
            .enumerate()
            .find(|(_, f)| f.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct GameFunction {
    pub name: String,
    pub return_type: Type,
    pub return_type_name: String,
    pub params: Vec<Param>,
}

#[derive(Debug)]
pub struct ModApi {
    entities: Vec<Entity>,
    entity_index: HashMap<String, usize>,
    game_fns: HashMap<String, GameFunction>,
}

impl ModApi {
    pub fn load(path: &Path) -> Result<ModApi> {
        let root = json::read_json_tree(path)?;
        ModApi::from_tree(&root).map_err(|e| e.with_path(path))
    }

    pub fn from_tree(root: &JsonValue) -> Result<ModApi> {
        let fields = match root.as_object() {
            Some(fields) => fields,
            None => bail!("mod_api.json its root must be an object"),
        };

        ensure!(
            fields.len() == 2,
            "mod_api.json must only have these 2 fields, in this order: \"entities\", \"game_functions\""
        );

        ensure!(
            fields[0].0 == "entities",
            "mod_api.json its root object must have \"entities\" as its first field"
        );
        let entities_object = match fields[0].1.as_object() {
            Some(object) => object,
            None => bail!("mod_api.json its \"entities\" field must have an object as its value"),
        };
        let entities = parse_entities(entities_object)?;

        ensure!(
            fields[1].0 == "game_functions",
            "mod_api.json its root object must have \"game_functions\" as its second field"
        );
        let game_fns_object = match fields[1].1.as_object() {
            Some(object) => object,
            None => {
                bail!("mod_api.json its \"game_functions\" field must have an object as its value")
            }
        };
        let game_fns = parse_game_fns(game_fns_object)?;

        let entity_index = entities
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.clone(), i))
            .collect();

        Ok(ModApi { entities, entity_index, game_fns })
    }

    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.entity_index.get(name).map(|&i| &self.entities[i])
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn game_fn(&self, name: &str) -> Option<&GameFunction> {
        self.game_fns.get(name)
    }
}

/// Custom id types are PascalCase: first character uppercase, the rest
/// alphanumeric.
pub fn check_custom_id_is_pascal(type_name: &str) -> Result<()> {
    ensure!(
        type_name.chars().next().is_some_and(|c| c.is_ascii_uppercase()),
        "'{}' seems like a custom ID type, but isn't in PascalCase",
        type_name
    );
    for c in type_name.chars() {
        ensure!(
            c.is_ascii_alphanumeric(),
            "'{}' seems like a custom ID type, but it contains '{}', which isn't uppercase/lowercase/a digit",
            type_name,
            c
        );
    }
    Ok(())
}

fn check_custom_id_type_capitalization(type_name: &str) -> Result<()> {
    match type_name {
        "bool" | "i32" | "f32" | "string" | "resource" | "entity" | "id" => Ok(()),
        _ => check_custom_id_is_pascal(type_name),
    }
}

fn parse_entities(entities: &[(String, JsonValue)]) -> Result<Vec<Entity>> {
    let mut result = Vec::with_capacity(entities.len());

    for (name, value) in entities {
        ensure!(!name.is_empty(), "\"entities\" its names must not be an empty string");
        check_custom_id_is_pascal(name)?;

        let fields = match value.as_object() {
            Some(fields) => fields,
            None => bail!("\"entities\" must only contain object values"),
        };
        ensure!(
            !fields.is_empty(),
            "\"entities\" its objects must have at least a \"description\" field"
        );
        ensure!(fields.len() <= 2, "\"entities\" its objects must not have more than 2 fields");

        ensure!(
            fields[0].0 == "description",
            "\"entities\" must have \"description\" as the first field"
        );
        let description = match fields[0].1.as_str() {
            Some(s) => s,
            None => bail!("\"entities\" its descriptions must be strings"),
        };
        ensure!(!description.is_empty(), "\"entities\" its descriptions must not be an empty string");

        let mut on_functions = Vec::new();
        if fields.len() > 1 {
            ensure!(
                fields[1].0 == "on_functions",
                "\"entities\" its second field was something other than \"on_functions\""
            );
            let fns = match fields[1].1.as_object() {
                Some(fns) => fns,
                None => {
                    bail!("\"entities\" its \"on_functions\" field must have an object as its value")
                }
            };
            on_functions = parse_on_fns(fns)?;
        }

        result.push(Entity { name: name.clone(), on_functions });
    }

    Ok(result)
}

fn parse_on_fns(fns: &[(String, JsonValue)]) -> Result<Vec<OnFunction>> {
    let mut result = Vec::with_capacity(fns.len());

    for (name, value) in fns {
        ensure!(!name.is_empty(), "\"on_functions\" its function names must not be an empty string");
        ensure!(
            name.starts_with("on_"),
            "\"on_functions\" its function names must start with 'on_'"
        );

        let fields = match value.as_object() {
            Some(fields) => fields,
            None => bail!("\"on_functions\" its array must only contain objects"),
        };
        ensure!(
            !fields.is_empty(),
            "\"on_functions\" its objects must have at least a \"description\" field"
        );
        ensure!(
            fields.len() <= 2,
            "\"on_functions\" its objects must not have more than 2 fields"
        );

        ensure!(
            fields[0].0 == "description",
            "\"on_functions\" its functions must have \"description\" as the first field"
        );
        let description = match fields[0].1.as_str() {
            Some(s) => s,
            None => bail!("\"on_functions\" its function descriptions must be strings"),
        };
        ensure!(
            !description.is_empty(),
            "\"on_functions\" its function descriptions must not be an empty string"
        );

        let mut params = Vec::new();
        if fields.len() > 1 {
            ensure!(
                fields[1].0 == "arguments",
                "\"on_functions\" its functions must have \"arguments\" as the second field"
            );
            let arguments = match fields[1].1.as_array() {
                Some(arguments) => arguments,
                None => bail!("\"on_functions\" its function arguments must be arrays"),
            };
            for argument in arguments {
                let param = parse_argument(argument, "on_functions")?;
                ensure!(
                    param.ty != Type::Resource,
                    "\"on_functions\" its function argument types must not be 'resource'"
                );
                ensure!(
                    param.ty != Type::Entity,
                    "\"on_functions\" its function argument types must not be 'entity'"
                );
                params.push(param);
            }
        }

        result.push(OnFunction { name: name.clone(), params });
    }

    Ok(result)
}

fn parse_argument(value: &JsonValue, section: &str) -> Result<Param> {
    let fields = match value.as_object() {
        Some(fields) => fields,
        None => bail!("\"{}\" its function arguments must only contain objects", section),
    };
    ensure!(
        fields.len() >= 2,
        "\"{}\" must have the function argument fields \"name\" and \"type\"",
        section
    );
    ensure!(
        fields.len() <= 3,
        "\"{}\" its function arguments can't have more than 3 fields",
        section
    );

    ensure!(
        fields[0].0 == "name",
        "\"{}\" its function arguments must always have \"name\" as their first field",
        section
    );
    let name = match fields[0].1.as_str() {
        Some(s) => s,
        None => bail!("\"{}\" its function arguments must always have string values", section),
    };

    ensure!(
        fields[1].0 == "type",
        "\"{}\" its function arguments must always have \"type\" as their second field",
        section
    );
    let type_name = match fields[1].1.as_str() {
        Some(s) => s,
        None => bail!("\"{}\" its function arguments must always have string values", section),
    };
    let ty = Type::parse(type_name);
    check_custom_id_type_capitalization(type_name)?;

    let mut resource_extension = None;
    let mut entity_type = None;

    match ty {
        Type::Resource => {
            ensure!(
                fields.len() == 3 && fields[2].0 == "resource_extension",
                "\"{}\" its function arguments has a \"type\" field with the value \"resource\", which means a \"resource_extension\" field is required",
                section
            );
            let extension = match fields[2].1.as_str() {
                Some(s) => s,
                None => {
                    bail!("\"{}\" its function argument fields must always have string values", section)
                }
            };
            resource_extension = Some(extension.to_string());
        }
        Type::Entity => {
            ensure!(
                fields.len() == 3 && fields[2].0 == "entity_type",
                "\"{}\" its function arguments has a \"type\" field with the value \"entity\", which means an \"entity_type\" field is required",
                section
            );
            let tag = match fields[2].1.as_str() {
                Some(s) => s,
                None => {
                    bail!("\"{}\" its function argument fields must always have string values", section)
                }
            };
            entity_type = Some(tag.to_string());
        }
        _ => {
            ensure!(
                fields.len() == 2,
                "\"{}\" its function argument fields had an unexpected 3rd \"{}\" field",
                section,
                fields[2].0
            );
        }
    }

    Ok(Param {
        name: name.to_string(),
        ty,
        type_name: type_name.to_string(),
        resource_extension,
        entity_type,
    })
}

fn parse_game_fns(fns: &[(String, JsonValue)]) -> Result<HashMap<String, GameFunction>> {
    let mut result = HashMap::with_capacity(fns.len());

    for (name, value) in fns {
        ensure!(
            !name.is_empty(),
            "\"game_functions\" its function names must not be an empty string"
        );
        ensure!(
            !name.starts_with("on_"),
            "\"game_functions\" its function names must not start with 'on_'"
        );

        let fields = match value.as_object() {
            Some(fields) => fields,
            None => bail!("\"game_functions\" its array must only contain objects"),
        };
        ensure!(
            !fields.is_empty(),
            "\"game_functions\" its objects must have at least a \"description\" field"
        );
        ensure!(
            fields.len() <= 3,
            "\"game_functions\" its objects must not have more than 3 fields"
        );

        ensure!(
            fields[0].0 == "description",
            "\"game_functions\" its functions must have \"description\" as the first field"
        );
        let description = match fields[0].1.as_str() {
            Some(s) => s,
            None => bail!("\"game_functions\" its function descriptions must be strings"),
        };
        ensure!(
            !description.is_empty(),
            "\"game_functions\" its function descriptions must not be an empty string"
        );

        let mut field_index = 1;
        let mut return_type = Type::Void;
        let mut return_type_name = String::new();

        if fields.len() > 1 && fields[1].0 == "return_type" {
            let type_name = match fields[1].1.as_str() {
                Some(s) => s,
                None => bail!("\"game_functions\" its function return types must be strings"),
            };
            return_type = Type::parse(type_name);
            return_type_name = type_name.to_string();
            check_custom_id_type_capitalization(type_name)?;
            ensure!(
                return_type != Type::Resource,
                "\"game_functions\" its function return types must not be 'resource'"
            );
            ensure!(
                return_type != Type::Entity,
                "\"game_functions\" its function return types must not be 'entity'"
            );
            field_index = 2;
        }

        let mut params = Vec::new();
        if fields.len() > field_index {
            ensure!(
                fields[field_index].0 == "arguments",
                "\"game_functions\" its second or third field was something other than \"return_type\" and \"arguments\""
            );
            let arguments = match fields[field_index].1.as_array() {
                Some(arguments) => arguments,
                None => bail!("\"game_functions\" its function arguments must be arrays"),
            };
            ensure!(
                !arguments.is_empty(),
                "\"game_functions\" its \"arguments\" array must not be empty (just remove the \"arguments\" key entirely)"
            );
            for argument in arguments {
                params.push(parse_argument(argument, "game_functions")?);
            }
            field_index += 1;
        }

        ensure!(
            fields.len() == field_index,
            "\"game_functions\" its second or third field was something other than \"return_type\" and \"arguments\""
        );

        result.insert(
            name.clone(),
            GameFunction {
                name: name.clone(),
                return_type,
                return_type_name,
                params,
            },
        );
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json::parse_json;

    fn api(text: &str) -> Result<ModApi> {
        ModApi::from_tree(&parse_json(text).unwrap())
    }

    const MINIMAL: &str = r#"{
        "entities": {
            "Greeter": {
                "description": "says hi",
                "on_functions": {
                    "on_start": {"description": "called once"}
                }
            }
        },
        "game_functions": {}
    }"#;

    #[test]
    fn test_minimal_manifest() {
        let api = api(MINIMAL).unwrap();
        let entity = api.entity("Greeter").unwrap();
        assert_eq!(entity.on_functions.len(), 1);
        let (slot, on_fn) = entity.on_fn("on_start").unwrap();
        assert_eq!(slot, 0);
        assert!(on_fn.params.is_empty());
        assert!(api.entity("Villain").is_none());
    }

    #[test]
    fn test_root_key_order_enforced() {
        let err = api(r#"{"game_functions": {}, "entities": {}}"#).unwrap_err();
        assert!(err.msg.contains("\"entities\" as its first field"), "{}", err.msg);
    }

    #[test]
    fn test_entity_name_must_be_pascal() {
        let err = api(r#"{
            "entities": {"greeter": {"description": "d"}},
            "game_functions": {}
        }"#)
        .unwrap_err();
        assert!(err.msg.contains("PascalCase"), "{}", err.msg);
    }

    #[test]
    fn test_on_fn_name_prefix_enforced() {
        let err = api(r#"{
            "entities": {
                "E": {"description": "d", "on_functions": {"start": {"description": "d"}}}
            },
            "game_functions": {}
        }"#)
        .unwrap_err();
        assert!(err.msg.contains("must start with 'on_'"));
    }

    #[test]
    fn test_game_fn_rejects_on_prefix() {
        let err = api(r#"{
            "entities": {},
            "game_functions": {"on_hit": {"description": "d"}}
        }"#)
        .unwrap_err();
        assert!(err.msg.contains("must not start with 'on_'"));
    }

    #[test]
    fn test_resource_argument_requires_extension() {
        let err = api(r#"{
            "entities": {},
            "game_functions": {
                "play": {
                    "description": "d",
                    "arguments": [{"name": "path", "type": "resource"}]
                }
            }
        }"#)
        .unwrap_err();
        assert!(err.msg.contains("resource_extension"), "{}", err.msg);
    }

    #[test]
    fn test_resource_argument_with_extension() {
        let api = api(r#"{
            "entities": {},
            "game_functions": {
                "play": {
                    "description": "d",
                    "arguments": [
                        {"name": "path", "type": "resource", "resource_extension": ".wav"}
                    ]
                }
            }
        }"#)
        .unwrap();
        let fn_ = api.game_fn("play").unwrap();
        assert_eq!(fn_.params[0].resource_extension.as_deref(), Some(".wav"));
        assert_eq!(fn_.return_type, Type::Void);
    }

    #[test]
    fn test_entity_argument_requires_entity_type() {
        let err = api(r#"{
            "entities": {},
            "game_functions": {
                "equip": {
                    "description": "d",
                    "arguments": [{"name": "e", "type": "entity"}]
                }
            }
        }"#)
        .unwrap_err();
        assert!(err.msg.contains("entity_type"), "{}", err.msg);
    }

    #[test]
    fn test_plain_argument_rejects_third_field() {
        let err = api(r#"{
            "entities": {},
            "game_functions": {
                "f": {
                    "description": "d",
                    "arguments": [{"name": "n", "type": "i32", "extra": "x"}]
                }
            }
        }"#)
        .unwrap_err();
        assert!(err.msg.contains("unexpected 3rd"), "{}", err.msg);
    }

    #[test]
    fn test_return_type_parsed() {
        let api = api(r#"{
            "entities": {},
            "game_functions": {
                "opponent": {"description": "d", "return_type": "Human"}
            }
        }"#)
        .unwrap();
        let fn_ = api.game_fn("opponent").unwrap();
        assert_eq!(fn_.return_type, Type::Id);
        assert_eq!(fn_.return_type_name, "Human");
    }

    #[test]
    fn test_return_type_never_resource() {
        let err = api(r#"{
            "entities": {},
            "game_functions": {
                "f": {"description": "d", "return_type": "resource"}
            }
        }"#)
        .unwrap_err();
        assert!(err.msg.contains("must not be 'resource'"));
    }

    #[test]
    fn test_empty_arguments_array_rejected() {
        let err = api(r#"{
            "entities": {},
            "game_functions": {
                "f": {"description": "d", "arguments": []}
            }
        }"#)
        .unwrap_err();
        assert!(err.msg.contains("must not be empty"));
    }
}
