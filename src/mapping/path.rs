//! Dotted field paths into JSON records.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

fn segment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex is valid"))
}

/// A parsed path such as `address.city`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    raw: String,
    segments: Vec<String>,
}

impl FieldPath {
    /// Parse a dotted path. Every segment must be non-empty and consist of
    /// ASCII letters, digits, `_` or `-`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err("field path cannot be empty".to_string());
        }

        let segments: Vec<String> = trimmed.split('.').map(str::to_string).collect();
        if let Some(bad) = segments.iter().find(|s| !segment_pattern().is_match(s)) {
            return Err(format!(
                "invalid segment '{}' in field path '{}'",
                bad, trimmed
            ));
        }

        Ok(Self {
            raw: trimmed.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when `other` is this path or nested beneath it (or vice versa).
    /// Two such targets would overwrite each other.
    pub fn overlaps(&self, other: &FieldPath) -> bool {
        let shorter = self.segments.len().min(other.segments.len());
        self.segments[..shorter] == other.segments[..shorter]
    }

    /// Read the value at this path. Missing intermediate objects and explicit
    /// nulls both read as `None`.
    pub fn read<'a>(&self, record: &'a Value) -> Option<&'a Value> {
        let mut current = record;
        for segment in &self.segments {
            current = current.as_object()?.get(segment)?;
        }
        if current.is_null() {
            None
        } else {
            Some(current)
        }
    }

    /// Write `value` at this path, creating intermediate objects. Fails if an
    /// intermediate value exists and is not an object.
    pub fn write(&self, record: &mut Map<String, Value>, value: Value) -> Result<(), String> {
        let (last, parents) = self
            .segments
            .split_last()
            .ok_or_else(|| "field path cannot be empty".to_string())?;

        let mut current = record;
        for segment in parents {
            let entry = current
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            current = entry.as_object_mut().ok_or_else(|| {
                format!("cannot write '{}': '{}' is not an object", self.raw, segment)
            })?;
        }
        current.insert(last.clone(), value);
        Ok(())
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_valid_paths() {
        assert_eq!(FieldPath::parse("email").unwrap().as_str(), "email");
        assert_eq!(
            FieldPath::parse(" address.city ").unwrap().as_str(),
            "address.city"
        );
        assert!(FieldPath::parse("UF_CRM_1-2").is_ok());
    }

    #[test]
    fn test_parse_invalid_paths() {
        assert!(FieldPath::parse("").is_err());
        assert!(FieldPath::parse("a..b").is_err());
        assert!(FieldPath::parse(".a").is_err());
        assert!(FieldPath::parse("first name").is_err());
    }

    #[test]
    fn test_read_nested() {
        let record = json!({"address": {"city": "Riga"}, "email": null});
        let city = FieldPath::parse("address.city").unwrap();
        assert_eq!(city.read(&record), Some(&json!("Riga")));

        assert!(FieldPath::parse("email").unwrap().read(&record).is_none());
        assert!(FieldPath::parse("address.zip").unwrap().read(&record).is_none());
        assert!(FieldPath::parse("address.city.x").unwrap().read(&record).is_none());
    }

    #[test]
    fn test_write_creates_parents() {
        let mut out = Map::new();
        FieldPath::parse("contact.email")
            .unwrap()
            .write(&mut out, json!("a@b.c"))
            .unwrap();
        assert_eq!(Value::Object(out), json!({"contact": {"email": "a@b.c"}}));
    }

    #[test]
    fn test_write_through_scalar_fails() {
        let mut out = Map::new();
        out.insert("contact".to_string(), json!("flat"));
        let err = FieldPath::parse("contact.email")
            .unwrap()
            .write(&mut out, json!(1))
            .unwrap_err();
        assert!(err.contains("not an object"));
    }

    #[test]
    fn test_overlaps() {
        let a = FieldPath::parse("contact").unwrap();
        let b = FieldPath::parse("contact.email").unwrap();
        let c = FieldPath::parse("contact_email").unwrap();
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
        assert!(a.overlaps(&a.clone()));
    }
}
