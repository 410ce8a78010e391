//! Metadata values attached to files, symbols and chunks.
//!
//! Handlers need different keys (`selector`, `tag`, `qualified_name`, ...), so
//! metadata stays an open map. Values are restricted to a small closed set.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single metadata value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Str(String),
    StrList(Vec<String>),
}

/// Sorted key/value bag. Sorting keeps the JSON form canonical for hashing.
pub type Metadata = BTreeMap<String, MetaValue>;

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<usize> for MetaValue {
    fn from(value: usize) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<Vec<String>> for MetaValue {
    fn from(value: Vec<String>) -> Self {
        Self::StrList(value)
    }
}

impl MetaValue {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Lenient integer view: ints, bools and numeric strings.
    #[must_use]
    pub fn coerce_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Str(s) => s.trim().parse().ok(),
            Self::StrList(_) => None,
        }
    }
}

/// Convenience accessors over a [`Metadata`] map.
pub trait MetadataExt {
    fn get_str(&self, key: &str) -> Option<&str>;
    fn get_int(&self, key: &str) -> Option<i64>;
    fn get_flag(&self, key: &str) -> bool;
    fn put(&mut self, key: &str, value: impl Into<MetaValue>);
}

impl MetadataExt for Metadata {
    fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MetaValue::as_str)
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(MetaValue::coerce_int)
    }

    fn get_flag(&self, key: &str) -> bool {
        match self.get(key) {
            Some(MetaValue::Bool(b)) => *b,
            Some(MetaValue::Int(i)) => *i != 0,
            Some(MetaValue::Str(s)) => !s.is_empty(),
            Some(MetaValue::StrList(items)) => !items.is_empty(),
            None => false,
        }
    }

    fn put(&mut self, key: &str, value: impl Into<MetaValue>) {
        self.insert(key.to_string(), value.into());
    }
}

/// Builds a [`Metadata`] map from `key => value` pairs.
#[macro_export]
macro_rules! meta {
    () => { $crate::parser::metadata::Metadata::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::parser::metadata::Metadata::new();
        $(
            map.insert($key.to_string(), $crate::parser::metadata::MetaValue::from($value));
        )+
        map
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_shape_is_plain() {
        let map = meta! {
            "kind" => "rule",
            "part_total" => 2_i64,
            "overflow" => true,
            "decorators" => vec!["staticmethod".to_string()],
        };
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(
            json,
            r#"{"decorators":["staticmethod"],"kind":"rule","overflow":true,"part_total":2}"#
        );

        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_coerce_int() {
        let map = meta! { "a" => "42", "b" => true, "c" => "x" };
        assert_eq!(map.get_int("a"), Some(42));
        assert_eq!(map.get_int("b"), Some(1));
        assert_eq!(map.get_int("c"), None);
        assert_eq!(map.get_int("missing"), None);
    }
}
