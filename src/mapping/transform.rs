//! Value transforms applied by mapping steps
//!
//! A transform is a pure function from one JSON value to another, addressed
//! by a tag such as `uppercase` or `date-format:%d.%m.%Y` (name, optional
//! `:argument`). Built-in transforms are registered by
//! [`TransformRegistry::with_builtins`]; additional ones can be added at
//! startup through [`TransformRegistry::register`]. Tags are resolved once,
//! at compile time, so execution never does a string lookup.

use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::sync::Arc;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, NaiveDate};
use serde_json::{Number, Value};
use thiserror::Error;

/// Why a transform rejected a value. Recovered per record by the executor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("source value is missing")]
    MissingValue,

    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("{0}")]
    Invalid(String),
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn require_str(value: Option<&Value>) -> Result<&str, TransformError> {
    let value = value.ok_or(TransformError::MissingValue)?;
    value.as_str().ok_or(TransformError::TypeMismatch {
        expected: "string",
        found: type_name(value),
    })
}

/// A pure value transform.
pub trait Transform: Send + Sync {
    /// Name used in tags, e.g. `"uppercase"`.
    fn name(&self) -> &str;

    /// Validate the tag argument at compile time. The default accepts only a
    /// missing argument.
    fn check_arg(&self, arg: Option<&str>) -> Result<(), String> {
        match arg {
            None => Ok(()),
            Some(_) => Err(format!("transform '{}' takes no argument", self.name())),
        }
    }

    /// Apply the transform. `value` is `None` when the source field is
    /// missing or null.
    fn apply(&self, value: Option<&Value>, arg: Option<&str>) -> Result<Value, TransformError>;
}

struct Uppercase;

impl Transform for Uppercase {
    fn name(&self) -> &str {
        "uppercase"
    }

    fn apply(&self, value: Option<&Value>, _arg: Option<&str>) -> Result<Value, TransformError> {
        Ok(Value::String(require_str(value)?.to_uppercase()))
    }
}

struct Lowercase;

impl Transform for Lowercase {
    fn name(&self) -> &str {
        "lowercase"
    }

    fn apply(&self, value: Option<&Value>, _arg: Option<&str>) -> Result<Value, TransformError> {
        Ok(Value::String(require_str(value)?.to_lowercase()))
    }
}

struct Trim;

impl Transform for Trim {
    fn name(&self) -> &str {
        "trim"
    }

    fn apply(&self, value: Option<&Value>, _arg: Option<&str>) -> Result<Value, TransformError> {
        Ok(Value::String(require_str(value)?.trim().to_string()))
    }
}

struct ToText;

impl Transform for ToText {
    fn name(&self) -> &str {
        "to-string"
    }

    fn apply(&self, value: Option<&Value>, _arg: Option<&str>) -> Result<Value, TransformError> {
        match value.ok_or(TransformError::MissingValue)? {
            Value::String(s) => Ok(Value::String(s.clone())),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            other => Err(TransformError::TypeMismatch {
                expected: "scalar",
                found: type_name(other),
            }),
        }
    }
}

struct ToNumber;

impl Transform for ToNumber {
    fn name(&self) -> &str {
        "to-number"
    }

    fn apply(&self, value: Option<&Value>, _arg: Option<&str>) -> Result<Value, TransformError> {
        match value.ok_or(TransformError::MissingValue)? {
            Value::Number(n) => Ok(Value::Number(n.clone())),
            Value::String(s) => {
                let s = s.trim();
                if let Ok(i) = s.parse::<i64>() {
                    return Ok(Value::Number(i.into()));
                }
                s.parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(|| TransformError::Invalid(format!("'{}' is not a number", s)))
            }
            other => Err(TransformError::TypeMismatch {
                expected: "number or numeric string",
                found: type_name(other),
            }),
        }
    }
}

/// `date-format:<strftime pattern>`. Accepts RFC 3339 timestamps and plain
/// `YYYY-MM-DD` dates.
struct DateFormat;

impl Transform for DateFormat {
    fn name(&self) -> &str {
        "date-format"
    }

    fn check_arg(&self, arg: Option<&str>) -> Result<(), String> {
        let pattern = arg
            .filter(|p| !p.is_empty())
            .ok_or_else(|| "transform 'date-format' requires a pattern".to_string())?;
        if StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error)) {
            return Err(format!("invalid date pattern '{}'", pattern));
        }
        Ok(())
    }

    fn apply(&self, value: Option<&Value>, arg: Option<&str>) -> Result<Value, TransformError> {
        let input = require_str(value)?.trim();
        let pattern = arg.unwrap_or("%Y-%m-%d");

        // Writing through fmt::Write reports unsupported specifiers (e.g. %H
        // on a plain date) as an error instead of panicking.
        let mut out = String::new();
        let written = if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
            write!(out, "{}", ts.format(pattern))
        } else if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
            write!(out, "{}", date.format(pattern))
        } else {
            return Err(TransformError::Invalid(format!(
                "'{}' is not a recognised date",
                input
            )));
        };
        written.map_err(|_| {
            TransformError::Invalid(format!("pattern '{}' does not apply to '{}'", pattern, input))
        })?;
        Ok(Value::String(out))
    }
}

/// `default:<literal>` fills a missing value. The literal is parsed as JSON
/// when possible, otherwise taken as a string.
struct DefaultValue;

impl DefaultValue {
    fn literal(arg: Option<&str>) -> Value {
        let raw = arg.unwrap_or_default();
        serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
    }
}

impl Transform for DefaultValue {
    fn name(&self) -> &str {
        "default"
    }

    fn check_arg(&self, arg: Option<&str>) -> Result<(), String> {
        match arg {
            Some(_) => Ok(()),
            None => Err("transform 'default' requires a value".to_string()),
        }
    }

    fn apply(&self, value: Option<&Value>, arg: Option<&str>) -> Result<Value, TransformError> {
        Ok(value.cloned().unwrap_or_else(|| Self::literal(arg)))
    }
}

/// A transform tag resolved against a registry.
#[derive(Clone)]
pub struct BoundTransform {
    transform: Arc<dyn Transform>,
    arg: Option<String>,
    tag: String,
}

impl BoundTransform {
    pub fn apply(&self, value: Option<&Value>) -> Result<Value, TransformError> {
        self.transform.apply(value, self.arg.as_deref())
    }

    /// The tag this transform was resolved from.
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl fmt::Debug for BoundTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BoundTransform").field(&self.tag).finish()
    }
}

/// Named set of transforms available to the mapping compiler
#[derive(Clone, Default)]
pub struct TransformRegistry {
    transforms: HashMap<String, Arc<dyn Transform>>,
}

impl TransformRegistry {
    /// An empty registry. Most callers want [`TransformRegistry::with_builtins`].
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in transform.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Uppercase));
        registry.register(Arc::new(Lowercase));
        registry.register(Arc::new(Trim));
        registry.register(Arc::new(ToText));
        registry.register(Arc::new(ToNumber));
        registry.register(Arc::new(DateFormat));
        registry.register(Arc::new(DefaultValue));
        registry
    }

    /// Register a transform under its own name, replacing any previous one.
    pub fn register(&mut self, transform: Arc<dyn Transform>) {
        let name = transform.name().to_string();
        if self.transforms.insert(name.clone(), transform).is_some() {
            tracing::debug!(transform = %name, "Replaced registered transform");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.transforms.contains_key(name)
    }

    /// Registered transform names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.transforms.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolve a tag (`name` or `name:arg`) and validate its argument.
    pub fn resolve(&self, tag: &str) -> Result<BoundTransform, String> {
        let tag = tag.trim();
        let (name, arg) = match tag.split_once(':') {
            Some((name, arg)) => (name, Some(arg)),
            None => (tag, None),
        };

        let transform = self
            .transforms
            .get(name)
            .cloned()
            .ok_or_else(|| format!("unknown transform '{}'", name))?;
        transform.check_arg(arg)?;

        Ok(BoundTransform {
            transform,
            arg: arg.map(str::to_string),
            tag: tag.to_string(),
        })
    }
}

impl fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformRegistry")
            .field("transforms", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn apply(tag: &str, value: Value) -> Result<Value, TransformError> {
        TransformRegistry::with_builtins()
            .resolve(tag)
            .unwrap()
            .apply(Some(&value))
    }

    #[test]
    fn test_builtin_names() {
        let registry = TransformRegistry::with_builtins();
        assert_eq!(
            registry.names(),
            vec![
                "date-format",
                "default",
                "lowercase",
                "to-number",
                "to-string",
                "trim",
                "uppercase"
            ]
        );
    }

    #[test]
    fn test_string_transforms() {
        assert_eq!(apply("uppercase", json!("ann")).unwrap(), json!("ANN"));
        assert_eq!(apply("lowercase", json!("ANN")).unwrap(), json!("ann"));
        assert_eq!(apply("trim", json!("  x ")).unwrap(), json!("x"));
    }

    #[test]
    fn test_string_transform_type_mismatch() {
        let err = apply("uppercase", json!(12)).unwrap_err();
        assert_eq!(
            err,
            TransformError::TypeMismatch {
                expected: "string",
                found: "number"
            }
        );
    }

    #[test]
    fn test_missing_value() {
        let bound = TransformRegistry::with_builtins().resolve("trim").unwrap();
        assert_eq!(bound.apply(None).unwrap_err(), TransformError::MissingValue);
    }

    #[test]
    fn test_to_number() {
        assert_eq!(apply("to-number", json!("42")).unwrap(), json!(42));
        assert_eq!(apply("to-number", json!(" 2.5 ")).unwrap(), json!(2.5));
        assert_eq!(apply("to-number", json!(7)).unwrap(), json!(7));
        assert!(apply("to-number", json!("abc")).is_err());
        assert!(apply("to-number", json!(true)).is_err());
    }

    #[test]
    fn test_to_string() {
        assert_eq!(apply("to-string", json!(42)).unwrap(), json!("42"));
        assert_eq!(apply("to-string", json!(false)).unwrap(), json!("false"));
        assert!(apply("to-string", json!({"a": 1})).is_err());
    }

    #[test]
    fn test_date_format() {
        assert_eq!(
            apply("date-format:%d.%m.%Y", json!("2024-03-05")).unwrap(),
            json!("05.03.2024")
        );
        assert_eq!(
            apply("date-format:%Y/%m/%d %H:%M", json!("2024-03-05T14:30:00Z")).unwrap(),
            json!("2024/03/05 14:30")
        );
        assert!(apply("date-format:%d.%m.%Y", json!("yesterday")).is_err());
    }

    #[test]
    fn test_date_format_time_on_plain_date_is_error() {
        let err = apply("date-format:%H:%M", json!("2024-03-05")).unwrap_err();
        assert!(matches!(err, TransformError::Invalid(_)));
    }

    #[test]
    fn test_default_fills_missing_only() {
        let registry = TransformRegistry::with_builtins();
        let bound = registry.resolve("default:unknown").unwrap();
        assert_eq!(bound.apply(None).unwrap(), json!("unknown"));
        assert_eq!(bound.apply(Some(&json!("set"))).unwrap(), json!("set"));

        let numeric = registry.resolve("default:0").unwrap();
        assert_eq!(numeric.apply(None).unwrap(), json!(0));
    }

    #[test]
    fn test_resolve_errors() {
        let registry = TransformRegistry::with_builtins();
        assert!(registry
            .resolve("reverse")
            .unwrap_err()
            .contains("unknown transform"));
        assert!(registry.resolve("uppercase:x").is_err());
        assert!(registry.resolve("date-format").is_err());
        assert!(registry.resolve("date-format:").is_err());
        assert!(registry.resolve("date-format:%Q").is_err());
        assert!(registry.resolve("default").is_err());
    }

    #[test]
    fn test_register_custom_transform() {
        struct Reverse;

        impl Transform for Reverse {
            fn name(&self) -> &str {
                "reverse"
            }

            fn apply(
                &self,
                value: Option<&Value>,
                _arg: Option<&str>,
            ) -> Result<Value, TransformError> {
                Ok(Value::String(require_str(value)?.chars().rev().collect()))
            }
        }

        let mut registry = TransformRegistry::with_builtins();
        registry.register(Arc::new(Reverse));
        assert!(registry.contains("reverse"));

        let bound = registry.resolve("reverse").unwrap();
        assert_eq!(bound.tag(), "reverse");
        assert_eq!(bound.apply(Some(&json!("abc"))).unwrap(), json!("cba"));
    }
}
