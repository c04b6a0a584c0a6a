//! The grug primitive type model.

use std::fmt;

/// Every type a grug expression can have.
///
/// `Resource` and `Entity` only ever appear in the mod API manifest; at
/// runtime both are plain C strings. `Id` covers the opaque 8-byte handles
/// the game hands out, including every PascalCase custom id type declared in
/// the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    Bool,
    I32,
    F32,
    String,
    Id,
    Resource,
    Entity,
}

impl Type {
    /// Parse a manifest/source type name. Anything that is not a built-in
    /// name is a custom id type.
    pub fn parse(name: &str) -> Type {
        match name {
            "bool" => Type::Bool,
            "i32" => Type::I32,
            "f32" => Type::F32,
            "string" => Type::String,
            "resource" => Type::Resource,
            "entity" => Type::Entity,
            _ => Type::Id,
        }
    }

    /// Byte size inside a globals block or a stack frame.
    pub fn size(self) -> usize {
        match self {
            Type::Void => 0,
            Type::Bool => 1,
            Type::I32 | Type::F32 => 4,
            Type::String | Type::Id | Type::Resource | Type::Entity => 8,
        }
    }

    /// Whether values of this type travel through the general purpose
    /// registers (as opposed to xmm0..xmm7) in the System V calling
    /// convention.
    pub fn is_integer_class(self) -> bool {
        !matches!(self, Type::F32)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Type::Void => "void",
            Type::Bool => "bool",
            Type::I32 => "i32",
            Type::F32 => "f32",
            Type::String => "string",
            Type::Id => "id",
            Type::Resource => "resource",
            Type::Entity => "entity",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_builtins() {
        assert_eq!(Type::parse("bool"), Type::Bool);
        assert_eq!(Type::parse("i32"), Type::I32);
        assert_eq!(Type::parse("f32"), Type::F32);
        assert_eq!(Type::parse("string"), Type::String);
        assert_eq!(Type::parse("resource"), Type::Resource);
        assert_eq!(Type::parse("entity"), Type::Entity);
        assert_eq!(Type::parse("id"), Type::Id);
    }

    #[test]
    fn test_parse_custom_id() {
        assert_eq!(Type::parse("Weapon"), Type::Id);
        assert_eq!(Type::parse("Human"), Type::Id);
    }

    #[test]
    fn test_sizes() {
        assert_eq!(Type::Bool.size(), 1);
        assert_eq!(Type::I32.size(), 4);
        assert_eq!(Type::F32.size(), 4);
        assert_eq!(Type::String.size(), 8);
        assert_eq!(Type::Id.size(), 8);
    }

    #[test]
    fn test_register_class() {
        assert!(Type::I32.is_integer_class());
        assert!(Type::String.is_integer_class());
        assert!(!Type::F32.is_integer_class());
    }
}
