//! Launch options and their command-line form
//!
//! `{ server: true, rpcport: 18332 }` becomes `["-server=1", "-rpcport=18332"]`.

use crate::error::{NodeError, Result};
use indexmap::IndexMap;
use std::fmt;

/// A scalar launch option value
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl OptionValue {
    /// Loose truthiness used for network switches such as `regtest`
    pub fn is_truthy(&self) -> bool {
        match self {
            OptionValue::Bool(b) => *b,
            OptionValue::Int(i) => *i != 0,
            OptionValue::Float(f) => *f != 0.0 && !f.is_nan(),
            OptionValue::Str(s) => !s.is_empty(),
        }
    }

    /// Value as written after `=` in a flag; booleans become `1`/`0`
    pub fn to_flag_value(&self) -> String {
        match self {
            OptionValue::Bool(true) => "1".to_string(),
            OptionValue::Bool(false) => "0".to_string(),
            other => other.to_string(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view, accepting numeric strings
    pub fn as_u16(&self) -> Option<u16> {
        match self {
            OptionValue::Int(i) => u16::try_from(*i).ok(),
            OptionValue::Str(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{}", b),
            OptionValue::Int(i) => write!(f, "{}", i),
            OptionValue::Float(x) => write!(f, "{}", x),
            OptionValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Bool(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Int(value)
    }
}

impl From<i32> for OptionValue {
    fn from(value: i32) -> Self {
        OptionValue::Int(value.into())
    }
}

impl From<u16> for OptionValue {
    fn from(value: u16) -> Self {
        OptionValue::Int(value.into())
    }
}

impl From<u32> for OptionValue {
    fn from(value: u32) -> Self {
        OptionValue::Int(value.into())
    }
}

impl From<f64> for OptionValue {
    fn from(value: f64) -> Self {
        OptionValue::Float(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Str(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        OptionValue::Str(value)
    }
}

/// Insertion-ordered map of launch options
///
/// Setting an existing key replaces its value in place, so defaults keep
/// their position when a caller overrides them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchOptions {
    entries: IndexMap<String, OptionValue>,
}

impl LaunchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<OptionValue>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// True when the key is present and truthy
    pub fn flag(&self, key: &str) -> bool {
        self.get(key).map(OptionValue::is_truthy).unwrap_or(false)
    }

    /// Layer `overrides` on top of `self`
    pub fn merge(mut self, overrides: LaunchOptions) -> Self {
        for (key, value) in overrides.entries {
            self.entries.insert(key, value);
        }
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for LaunchOptions
where
    K: Into<String>,
    V: Into<OptionValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut options = LaunchOptions::new();
        for (key, value) in iter {
            options.set(key, value);
        }
        options
    }
}

/// Convert options into `-key=value` arguments, in insertion order
///
/// Any key with an uppercase character rejects the whole set.
pub fn to_flags(options: &LaunchOptions) -> Result<Vec<String>> {
    if let Some((key, _)) = options.iter().find(|(k, _)| k.chars().any(char::is_uppercase)) {
        return Err(NodeError::InvalidOptionKey {
            key: key.to_string(),
        });
    }

    Ok(options
        .iter()
        .map(|(key, value)| format!("-{}={}", key, value.to_flag_value()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_preserve_order() {
        let options = LaunchOptions::new().with("server", true).with("rpcport", 18332u16);
        assert_eq!(to_flags(&options).unwrap(), vec!["-server=1", "-rpcport=18332"]);
    }

    #[test]
    fn test_false_is_zero() {
        let options = LaunchOptions::new().with("listen", false).with("datadir", "/tmp/x");
        assert_eq!(to_flags(&options).unwrap(), vec!["-listen=0", "-datadir=/tmp/x"]);
    }

    #[test]
    fn test_uppercase_key_rejects_everything() {
        let options = LaunchOptions::new()
            .with("server", true)
            .with("rpcPort", 18332u16);

        match to_flags(&options) {
            Err(NodeError::InvalidOptionKey { key }) => assert_eq!(key, "rpcPort"),
            other => panic!("expected InvalidOptionKey, got {:?}", other),
        }
    }

    #[test]
    fn test_merge_replaces_in_place() {
        let defaults = LaunchOptions::new().with("server", true).with("rpcuser", "a");
        let merged = defaults.merge(LaunchOptions::new().with("regtest", true).with("server", false));

        let keys: Vec<_> = merged.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["server", "rpcuser", "regtest"]);
        assert_eq!(merged.get("server"), Some(&OptionValue::Bool(false)));
    }

    #[test]
    fn test_truthiness() {
        assert!(OptionValue::from(1).is_truthy());
        assert!(!OptionValue::from(0).is_truthy());
        assert!(!OptionValue::from("").is_truthy());
        assert!(OptionValue::from("1").is_truthy());
    }

    #[test]
    fn test_empty_options() {
        assert!(to_flags(&LaunchOptions::new()).unwrap().is_empty());
    }
}
