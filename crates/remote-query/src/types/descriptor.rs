//! Structural type/member descriptors carried by portable expressions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::QueryError;

fn is_false(b: &bool) -> bool {
    !*b
}

/// A structural type descriptor: qualified name plus generic arguments.
/// Anonymous types are described by their ordered property list instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generic_arguments: Vec<TypeInfo>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_anonymous: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Vec<PropertyInfo>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyInfo {
    pub name: String,
    pub property_type: TypeInfo,
}

impl TypeInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            generic_arguments: Vec::new(),
            is_anonymous: false,
            properties: None,
        }
    }

    pub fn generic(name: impl Into<String>, generic_arguments: Vec<TypeInfo>) -> Self {
        Self {
            name: name.into(),
            generic_arguments,
            is_anonymous: false,
            properties: None,
        }
    }

    pub fn anonymous(properties: Vec<PropertyInfo>) -> Self {
        Self {
            name: String::new(),
            generic_arguments: Vec::new(),
            is_anonymous: true,
            properties: Some(properties),
        }
    }

    /// The single generic argument of `Queryable<T>`, `List<T>` and friends.
    pub fn element_type(&self) -> Option<&TypeInfo> {
        match self.name.as_str() {
            "Queryable" | "List" | "Array" => self.generic_arguments.first(),
            "Grouping" => self.generic_arguments.get(1),
            _ => None,
        }
    }

    /// Key used by type caches. Two descriptors with the same signature
    /// resolve to the same native type.
    pub fn signature(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_anonymous {
            let props = self.properties.as_deref().unwrap_or(&[]);
            if props.is_empty() {
                return f.write_str("{ }");
            }
            f.write_str("{ ")?;
            for (i, p) in props.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}: {}", p.name, p.property_type)?;
            }
            return f.write_str(" }");
        }
        f.write_str(&self.name)?;
        if !self.generic_arguments.is_empty() {
            f.write_str("<")?;
            for (i, arg) in self.generic_arguments.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{arg}")?;
            }
            f.write_str(">")?;
        }
        Ok(())
    }
}

impl FromStr for TypeInfo {
    type Err = QueryError;

    /// Parses the textual form produced by `Display`, e.g.
    /// `List<Nullable<i32>>` or `{ Name: string, Total: f64 }`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = TypeParser {
            input: s.as_bytes(),
            pos: 0,
        };
        let ty = parser.parse_type()?;
        parser.skip_ws();
        if parser.pos != parser.input.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(ty)
    }
}

struct TypeParser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl TypeParser<'_> {
    fn error(&self, message: &str) -> QueryError {
        QueryError::TypeResolution(format!(
            "Cannot parse type '{}' at offset {}: {message}",
            String::from_utf8_lossy(self.input),
            self.pos
        ))
    }

    fn skip_ws(&mut self) {
        while self.pos < self.input.len() && self.input[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn eat(&mut self, c: u8) -> bool {
        self.skip_ws();
        if self.input.get(self.pos) == Some(&c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> Result<String, QueryError> {
        self.skip_ws();
        let start = self.pos;
        while self.pos < self.input.len() {
            let c = self.input[self.pos];
            if c.is_ascii_alphanumeric() || c == b'_' || c == b'.' || c == b'#' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(self.error("expected a name"));
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.pos]).into_owned())
    }

    fn parse_type(&mut self) -> Result<TypeInfo, QueryError> {
        if self.eat(b'{') {
            let mut properties = Vec::new();
            if self.eat(b'}') {
                return Ok(TypeInfo::anonymous(properties));
            }
            loop {
                let name = self.ident()?;
                if !self.eat(b':') {
                    return Err(self.error("expected ':'"));
                }
                let property_type = self.parse_type()?;
                properties.push(PropertyInfo {
                    name,
                    property_type,
                });
                if self.eat(b',') {
                    continue;
                }
                if self.eat(b'}') {
                    return Ok(TypeInfo::anonymous(properties));
                }
                return Err(self.error("expected ',' or '}'"));
            }
        }

        let name = self.ident()?;
        let mut args = Vec::new();
        if self.eat(b'<') {
            loop {
                args.push(self.parse_type()?);
                if self.eat(b',') {
                    continue;
                }
                if self.eat(b'>') {
                    break;
                }
                return Err(self.error("expected ',' or '>'"));
            }
        }
        Ok(TypeInfo::generic(name, args))
    }
}

/// Descriptor of a field/property (or built-in member such as `Length`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberInfo {
    pub declaring_type: TypeInfo,
    pub name: String,
    pub member_type: TypeInfo,
}

/// Descriptor of a method, closed over its generic arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodInfo {
    pub declaring_type: TypeInfo,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generic_arguments: Vec<TypeInfo>,
    pub parameter_types: Vec<TypeInfo>,
    pub return_type: TypeInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConstructorInfo {
    pub declaring_type: TypeInfo,
    pub parameter_types: Vec<TypeInfo>,
}

impl fmt::Display for MethodInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.declaring_type, self.name)?;
        if !self.generic_arguments.is_empty() {
            let args: Vec<String> = self.generic_arguments.iter().map(|a| a.to_string()).collect();
            write!(f, "<{}>", args.join(","))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse_generic() {
        let ty = TypeInfo::generic(
            "Map",
            vec![
                TypeInfo::named("string"),
                TypeInfo::generic("List", vec![TypeInfo::named("i32")]),
            ],
        );
        assert_eq!(ty.to_string(), "Map<string,List<i32>>");
        let parsed: TypeInfo = "Map<string, List<i32>>".parse().unwrap();
        assert_eq!(parsed, ty);
    }

    #[test]
    fn test_parse_anonymous() {
        let parsed: TypeInfo = "{ Name: string, Total: Nullable<f64> }".parse().unwrap();
        assert!(parsed.is_anonymous);
        let props = parsed.properties.as_ref().unwrap();
        assert_eq!(props.len(), 2);
        assert_eq!(props[1].property_type.to_string(), "Nullable<f64>");
        assert_eq!(parsed.to_string(), "{ Name: string, Total: Nullable<f64> }");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("List<i32".parse::<TypeInfo>().is_err());
        assert!("".parse::<TypeInfo>().is_err());
        assert!("i32 extra".parse::<TypeInfo>().is_err());
    }

    #[test]
    fn test_serde_omits_defaults() {
        let json = serde_json::to_string(&TypeInfo::named("Product")).unwrap();
        assert_eq!(json, r#"{"name":"Product"}"#);
    }
}
