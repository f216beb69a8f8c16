//! # Path Parameter Types
//!
//! Placeholder parsing and typed conversion for path parameters.
//!
//! A placeholder is written `{name}`, `{name?}` (optional) and may carry a
//! type specifier: `{id:int}`, `{page?:int}`. Matching always captures the
//! raw string; the type only drives conversion through [`Params`] accessors.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;

/// Supported path parameter types
///
/// Used during route registration to specify expected types.
/// Default is `String`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ParamType {
    /// String type (default) - no conversion
    #[default]
    String,
    /// Integer type - parses to i64
    Int,
    /// Float type - parses to f64
    Float,
    /// Boolean type - parses "true"/"false" or "1"/"0"
    Bool,
}

impl ParamType {
    /// Parse type specifier from route pattern (e.g., "int" from "{id:int}")
    #[must_use]
    pub fn from_specifier(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "int" | "integer" | "i64" => Self::Int,
            "float" | "f64" | "number" => Self::Float,
            "bool" | "boolean" => Self::Bool,
            _ => Self::String,
        }
    }

    /// Get the type name for error messages
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// Converted parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// String value (no conversion performed)
    String(String),
    /// Integer value (i64)
    Int(i64),
    /// Float value (f64)
    Float(f64),
    /// Boolean value
    Bool(bool),
}

impl ParamValue {
    /// Get as i64 if Int variant
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as f64 if Float variant
    #[must_use]
    pub const fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Get as bool if Bool variant
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// Convert raw string to typed value based on `ParamType`
///
/// # Errors
///
/// Returns `Error::InvalidRoutePattern` if conversion fails.
pub fn convert_param(raw: &str, param_type: ParamType) -> Result<ParamValue> {
    let invalid = |target: &str| Error::InvalidRoutePattern {
        pattern: raw.to_string(),
        reason: format!("Cannot convert '{raw}' to {target}"),
    };
    match param_type {
        ParamType::String => Ok(ParamValue::String(raw.to_string())),
        ParamType::Int => raw
            .parse::<i64>()
            .map(ParamValue::Int)
            .map_err(|_| invalid("integer")),
        ParamType::Float => raw
            .parse::<f64>()
            .map(ParamValue::Float)
            .map_err(|_| invalid("float")),
        ParamType::Bool => match raw.to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(ParamValue::Bool(true)),
            "false" | "0" | "no" => Ok(ParamValue::Bool(false)),
            _ => Err(invalid("boolean")),
        },
    }
}

/// A parsed `{...}` placeholder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    /// Parameter name
    pub name: String,
    /// Whether the segment may be absent
    pub optional: bool,
    /// Declared conversion type
    pub param_type: ParamType,
}

/// Parse the inside of a `{...}` placeholder
///
/// Examples:
/// - `id` -> required string `id`
/// - `id:int` -> required int `id`
/// - `category?` -> optional string `category`
///
/// Returns `None` when the name is not a valid identifier.
#[must_use]
pub fn parse_placeholder(inner: &str) -> Option<Placeholder> {
    let (head, type_spec) = match inner.split_once(':') {
        Some((head, spec)) => (head, Some(spec)),
        None => (inner, None),
    };
    let (name, optional) = match head.strip_suffix('?') {
        Some(name) => (name, true),
        None => (head, false),
    };

    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return None;
    }

    Some(Placeholder {
        name: name.to_string(),
        optional,
        param_type: type_spec.map(ParamType::from_specifier).unwrap_or_default(),
    })
}

/// Path parameters extracted from a matched route
///
/// Holds the raw captured strings and the declared type of each placeholder.
/// Optional placeholders that matched nothing are absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    values: HashMap<String, String>,
    types: HashMap<String, ParamType>,
}

impl Params {
    /// Create an empty parameter map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a raw value with its declared type
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>, ty: ParamType) {
        let name = name.into();
        self.types.insert(name.clone(), ty);
        self.values.insert(name, value.into());
    }

    /// Raw string value of a parameter
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Whether a parameter was captured
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Value converted according to its declared type
    ///
    /// Falls back to `ParamValue::String` when conversion fails.
    #[must_use]
    pub fn get_typed(&self, name: &str) -> Option<ParamValue> {
        let raw = self.values.get(name)?;
        let ty = self.types.get(name).copied().unwrap_or_default();
        Some(convert_param(raw, ty).unwrap_or_else(|_| ParamValue::String(raw.clone())))
    }

    /// Get a parameter as i64 (convenience method)
    #[must_use]
    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(|raw| raw.parse().ok())
    }

    /// Get a parameter as f64 (convenience method)
    #[must_use]
    pub fn get_float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|raw| raw.parse().ok())
    }

    /// Get a parameter as bool (convenience method)
    #[must_use]
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name)
            .and_then(|raw| convert_param(raw, ParamType::Bool).ok())
            .and_then(|v| v.as_bool())
    }

    /// Number of captured parameters
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no parameter was captured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over raw `(name, value)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_type_from_specifier() {
        assert_eq!(ParamType::from_specifier("int"), ParamType::Int);
        assert_eq!(ParamType::from_specifier("INT"), ParamType::Int);
        assert_eq!(ParamType::from_specifier("integer"), ParamType::Int);
        assert_eq!(ParamType::from_specifier("float"), ParamType::Float);
        assert_eq!(ParamType::from_specifier("bool"), ParamType::Bool);
        assert_eq!(ParamType::from_specifier("unknown"), ParamType::String);
    }

    #[test]
    fn test_convert_int() {
        assert_eq!(convert_param("123", ParamType::Int).unwrap(), ParamValue::Int(123));
        assert_eq!(convert_param("-456", ParamType::Int).unwrap(), ParamValue::Int(-456));
        assert!(convert_param("abc", ParamType::Int).is_err());
    }

    #[test]
    fn test_convert_bool() {
        assert_eq!(convert_param("true", ParamType::Bool).unwrap(), ParamValue::Bool(true));
        assert_eq!(convert_param("0", ParamType::Bool).unwrap(), ParamValue::Bool(false));
        assert!(convert_param("maybe", ParamType::Bool).is_err());
    }

    #[test]
    fn test_parse_placeholder() {
        assert_eq!(
            parse_placeholder("id"),
            Some(Placeholder {
                name: "id".to_string(),
                optional: false,
                param_type: ParamType::String,
            })
        );
        let p = parse_placeholder("page?:int").unwrap();
        assert!(p.optional);
        assert_eq!(p.param_type, ParamType::Int);
        assert_eq!(p.name, "page");

        assert!(parse_placeholder("").is_none());
        assert!(parse_placeholder("9lives").is_none());
        assert!(parse_placeholder("a-b").is_none());
    }

    #[test]
    fn test_params_typed_access() {
        let mut params = Params::new();
        params.insert("id", "42", ParamType::Int);
        params.insert("slug", "hello", ParamType::String);

        assert_eq!(params.get("id"), Some("42"));
        assert_eq!(params.get_int("id"), Some(42));
        assert_eq!(params.get_typed("id"), Some(ParamValue::Int(42)));
        assert_eq!(
            params.get_typed("slug"),
            Some(ParamValue::String("hello".to_string()))
        );
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_invalid_type_fallback_to_string() {
        let mut params = Params::new();
        params.insert("id", "abc", ParamType::Int);
        assert_eq!(
            params.get_typed("id"),
            Some(ParamValue::String("abc".to_string()))
        );
        assert_eq!(params.get_int("id"), None);
    }
}
