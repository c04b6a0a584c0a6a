//! Ordered JSON tree reader.
//!
//! The mod API manifest and `about.json` care about things
//! `serde_json::Value` throws away: the order keys appear in, duplicate keys
//! (which must be rejected, not last-one-wins), and a recursion bound. A
//! `DeserializeSeed` that threads the depth through the visitor gives all
//! three on top of serde_json's tokenizer. Only strings, arrays, and objects
//! are valid values; the manifest format has no numbers, booleans, or nulls.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::de::{self, DeserializeSeed, Deserializer, MapAccess, SeqAccess, Visitor};

use crate::error::{CompileError, Result};

pub const MAX_RECURSION_DEPTH: usize = 42;

#[derive(Debug, Clone, PartialEq)]
pub enum JsonValue {
    String(String),
    Array(Vec<JsonValue>),
    Object(Vec<(String, JsonValue)>),
}

impl JsonValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            JsonValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[JsonValue]> {
        match self {
            JsonValue::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&[(String, JsonValue)]> {
        match self {
            JsonValue::Object(fields) => Some(fields),
            _ => None,
        }
    }
}

struct TreeSeed {
    depth: usize,
}

impl<'de> DeserializeSeed<'de> for TreeSeed {
    type Value = JsonValue;

    fn deserialize<D>(self, deserializer: D) -> std::result::Result<JsonValue, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(TreeVisitor { depth: self.depth })
    }
}

struct TreeVisitor {
    depth: usize,
}

impl<'de> Visitor<'de> for TreeVisitor {
    type Value = JsonValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a string, array, or object")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<JsonValue, E> {
        Ok(JsonValue::String(value.to_string()))
    }

    fn visit_string<E: de::Error>(self, value: String) -> std::result::Result<JsonValue, E> {
        Ok(JsonValue::String(value))
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<JsonValue, A::Error>
    where
        A: SeqAccess<'de>,
    {
        if self.depth >= MAX_RECURSION_DEPTH {
            return Err(de::Error::custom("Max recursion depth exceeded"));
        }

        let mut values = Vec::new();
        while let Some(value) = seq.next_element_seed(TreeSeed { depth: self.depth + 1 })? {
            values.push(value);
        }
        Ok(JsonValue::Array(values))
    }

    fn visit_map<A>(self, mut map: A) -> std::result::Result<JsonValue, A::Error>
    where
        A: MapAccess<'de>,
    {
        if self.depth >= MAX_RECURSION_DEPTH {
            return Err(de::Error::custom("Max recursion depth exceeded"));
        }

        let mut fields: Vec<(String, JsonValue)> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        while let Some(key) = map.next_key::<String>()? {
            if !seen.insert(key.clone()) {
                return Err(de::Error::custom(format!("Duplicate key \"{}\"", key)));
            }
            let value = map.next_value_seed(TreeSeed { depth: self.depth + 1 })?;
            fields.push((key, value));
        }
        Ok(JsonValue::Object(fields))
    }

    // Everything below is valid JSON but not a valid manifest value.

    fn visit_bool<E: de::Error>(self, _: bool) -> std::result::Result<JsonValue, E> {
        Err(de::Error::custom("booleans are not allowed; use strings"))
    }

    fn visit_i64<E: de::Error>(self, _: i64) -> std::result::Result<JsonValue, E> {
        Err(de::Error::custom("numbers are not allowed; use strings"))
    }

    fn visit_u64<E: de::Error>(self, _: u64) -> std::result::Result<JsonValue, E> {
        Err(de::Error::custom("numbers are not allowed; use strings"))
    }

    fn visit_f64<E: de::Error>(self, _: f64) -> std::result::Result<JsonValue, E> {
        Err(de::Error::custom("numbers are not allowed; use strings"))
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<JsonValue, E> {
        Err(de::Error::custom("null is not allowed; use strings"))
    }
}

/// Parse a JSON string into an ordered tree.
pub fn parse_json(text: &str) -> Result<JsonValue> {
    let mut deserializer = serde_json::Deserializer::from_str(text);
    let value = TreeSeed { depth: 0 }
        .deserialize(&mut deserializer)
        .map_err(|e| CompileError::new(format!("JSON error: {}", e)))?;
    deserializer
        .end()
        .map_err(|e| CompileError::new(format!("JSON error: {}", e)))?;
    Ok(value)
}

/// Read and parse a JSON file into an ordered tree.
pub fn read_json_tree(path: &Path) -> Result<JsonValue> {
    let text = fs::read_to_string(path)
        .map_err(|e| CompileError::new(format!("{}: {}", path.display(), e)).with_path(path))?;
    parse_json(&text).map_err(|e| {
        CompileError::new(format!("JSON error: {}: {}", path.display(), e.msg)).with_path(path)
    })
}
