//! Parsed configuration trees
//!
//! A [`Configuration`] is an immutable snapshot of one loaded source. Builders
//! hand it out behind an `Arc`, so a reader always holds a complete tree even
//! while a reload publishes a newer one.
//!
//! Values are addressed with dotted keys (`server.port`, `hosts.0`).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

use crate::ConfigError;

/// Source format of a configuration file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Toml,
    Json,
}

impl Format {
    /// Guess the format from a file extension
    pub fn from_path(path: impl AsRef<Path>) -> Option<Self> {
        let ext = path.as_ref().extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "toml" => Some(Self::Toml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    /// Parse a document into a JSON tree
    pub fn parse(self, content: &str) -> Result<Value, ConfigError> {
        match self {
            Self::Toml => toml::from_str::<Value>(content)
                .map_err(|e| ConfigError::parse(format!("TOML parse error: {e}"))),
            Self::Json => serde_json::from_str(content)
                .map_err(|e| ConfigError::parse(format!("JSON parse error: {e}"))),
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Toml => write!(f, "toml"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Immutable configuration tree
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    root: Value,
    location: Option<String>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self::empty()
    }
}

impl Configuration {
    /// An empty configuration (no keys defined)
    pub fn empty() -> Self {
        Self {
            root: Value::Object(Map::new()),
            location: None,
        }
    }

    /// Wrap an already parsed tree
    pub fn from_value(root: Value) -> Self {
        Self {
            root,
            location: None,
        }
    }

    /// Parse from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Self::parse(Format::Toml, toml_str)
    }

    /// Parse a document of the given format
    pub fn parse(format: Format, content: &str) -> Result<Self, ConfigError> {
        format.parse(content).map(Self::from_value)
    }

    /// Record where this tree was loaded from
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Location this tree was loaded from, if any
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    /// Look up a value by dotted key. `null` counts as undefined.
    pub fn get(&self, key: &str) -> Option<&Value> {
        if key.is_empty() {
            return Some(&self.root);
        }

        let mut current = &self.root;
        for segment in key.split('.') {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }

        if current.is_null() { None } else { Some(current) }
    }

    /// Scalar value rendered as a string
    pub fn get_string(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Integer value; numeric strings are accepted
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Boolean value; `"true"`/`"false"` strings are accepted
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Whether `key` resolves to a defined value
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// True if the tree defines no keys at all
    pub fn is_empty(&self) -> bool {
        match &self.root {
            Value::Object(map) => map.is_empty(),
            Value::Null => true,
            _ => false,
        }
    }

    /// Get immutable access to the underlying JSON tree
    pub fn as_json(&self) -> &Value {
        &self.root
    }

    /// Convert to a specific config type
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        serde_json::from_value(self.root.clone())
            .map_err(|e| ConfigError::parse(format!("Failed to deserialize config: {e}")))
    }

    /// Deep-merge layers into one tree. Later layers take precedence.
    pub fn merged<'a>(layers: impl IntoIterator<Item = &'a Configuration>) -> Self {
        let mut root = Value::Object(Map::new());
        for layer in layers {
            deep_merge(&mut root, layer.root.clone());
        }
        Self::from_value(root)
    }
}

/// Deep merge two JSON values (right takes precedence for conflicts)
fn deep_merge(left: &mut Value, right: Value) {
    match (left, right) {
        (Value::Object(left_map), Value::Object(right_map)) => {
            for (key, right_value) in right_map {
                if let Some(left_value) = left_map.get_mut(&key) {
                    deep_merge(left_value, right_value);
                } else {
                    left_map.insert(key, right_value);
                }
            }
        }
        (_, Value::Null) => {}
        (left, right) => {
            *left = right;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_path() {
        assert_eq!(Format::from_path("conf/app.toml"), Some(Format::Toml));
        assert_eq!(Format::from_path("conf/APP.JSON"), Some(Format::Json));
        assert_eq!(Format::from_path("conf/app.xml"), None);
        assert_eq!(Format::from_path("conf/app"), None);
    }

    #[test]
    fn test_dotted_access() {
        let config = Configuration::from_toml(
            r#"
rowsPerPage = 50

[server]
host = "0.0.0.0"
ports = [8080, 8081]
secure = true
"#,
        )
        .unwrap();

        assert_eq!(config.get_string("rowsPerPage").as_deref(), Some("50"));
        assert_eq!(config.get_i64("rowsPerPage"), Some(50));
        assert_eq!(config.get_string("server.host").as_deref(), Some("0.0.0.0"));
        assert_eq!(config.get_i64("server.ports.1"), Some(8081));
        assert_eq!(config.get_bool("server.secure"), Some(true));
        assert!(config.get("server.ports.7").is_none());
        assert!(config.get("server.host.inner").is_none());
        // objects have no scalar rendering
        assert!(config.get_string("server").is_none());
        assert!(config.contains_key("server"));
    }

    #[test]
    fn test_null_is_undefined() {
        let config = Configuration::from_value(serde_json::json!({ "a": null, "b": 1 }));
        assert!(!config.contains_key("a"));
        assert!(config.contains_key("b"));
    }

    #[test]
    fn test_parse_error() {
        let err = Configuration::parse(Format::Json, "{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_deep_merge() {
        let mut left = serde_json::json!({
            "a": {
                "b": 1,
                "c": 2
            }
        });

        let right = serde_json::json!({
            "a": {
                "c": 3,
                "d": 4
            }
        });

        deep_merge(&mut left, right);

        assert_eq!(left["a"]["b"], 1);
        assert_eq!(left["a"]["c"], 3);
        assert_eq!(left["a"]["d"], 4);
    }

    #[test]
    fn test_merged_precedence() {
        let defaults = Configuration::from_value(serde_json::json!({
            "rowsPerPage": 50,
            "theme": { "color": "blue", "font": "serif" }
        }));
        let tenant = Configuration::from_value(serde_json::json!({
            "rowsPerPage": 25,
            "theme": { "color": "red" }
        }));

        let merged = Configuration::merged([&defaults, &tenant]);
        assert_eq!(merged.get_i64("rowsPerPage"), Some(25));
        assert_eq!(merged.get_string("theme.color").as_deref(), Some("red"));
        assert_eq!(merged.get_string("theme.font").as_deref(), Some("serif"));
    }

    #[test]
    fn test_deserialize() {
        #[derive(Deserialize)]
        struct Page {
            #[serde(rename = "rowsPerPage")]
            rows_per_page: u32,
        }

        let config = Configuration::from_toml("rowsPerPage = 15").unwrap();
        let page: Page = config.deserialize().unwrap();
        assert_eq!(page.rows_per_page, 15);
    }
}
