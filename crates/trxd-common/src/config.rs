//! Named configuration values.
//!
//! The framework reads every tunable through [`ConfigProvider`], keyed by a
//! `(group, name)` pair such as `("SERVER_SOCKET_ADP", "PORT")`. Lookups are
//! case-insensitive. A missing or unparsable value yields `None` and the
//! caller falls back to its default.
//!
//! [`MapConfig`] is the in-memory provider. It loads from a JSON document
//! shaped as groups of named values:
//!
//! ```
//! use trxd_common::config::{ConfigProvider, MapConfig};
//!
//! let config = MapConfig::from_json_str(r#"{
//!     "SERVER_SOCKET_ADP": { "PORT": 53501, "KEEP_ALIVE": "Y" },
//!     "TSE_SERVER": { "TRX_THRESHOLD": "40" }
//! }"#).unwrap();
//!
//! assert_eq!(config.get_int("SERVER_SOCKET_ADP", "PORT"), Some(53501));
//! assert_eq!(config.get_bool("server_socket_adp", "keep_alive"), Some(true));
//! assert_eq!(config.get_int("TSE_SERVER", "TRX_THRESHOLD"), Some(40));
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;

use crate::error::{Result, TrxError};

/// Source of named string/int/bool configuration values.
pub trait ConfigProvider: Send + Sync {
    fn get_string(&self, group: &str, name: &str) -> Option<String>;

    fn get_int(&self, group: &str, name: &str) -> Option<i64> {
        self.get_string(group, name)
            .and_then(|s| s.trim().parse().ok())
    }

    fn get_bool(&self, group: &str, name: &str) -> Option<bool> {
        self.get_string(group, name).and_then(|s| parse_bool(&s))
    }
}

/// Accepts the usual spellings: `Y`/`N`, `YES`/`NO`, `TRUE`/`FALSE`, `T`/`F`, `1`/`0`.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_uppercase().as_str() {
        "Y" | "YES" | "TRUE" | "T" | "1" | "ON" => Some(true),
        "N" | "NO" | "FALSE" | "F" | "0" | "OFF" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapConfig {
    groups: HashMap<String, HashMap<String, String>>,
}

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets one value, replacing any previous one.
    pub fn set(&mut self, group: &str, name: &str, value: impl ToString) {
        self.groups
            .entry(group.to_ascii_uppercase())
            .or_default()
            .insert(name.to_ascii_uppercase(), value.to_string());
    }

    pub fn with(mut self, group: &str, name: &str, value: impl ToString) -> Self {
        self.set(group, name, value);
        self
    }

    /// Parses a `{ "GROUP": { "NAME": value } }` document.
    ///
    /// Scalar values of any JSON type are accepted and stored as text.
    ///
    /// # Errors
    ///
    /// Returns `Json` for malformed input and `Config` when the document is
    /// not an object of objects or a value is not a scalar.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let root: Value = serde_json::from_str(json)?;
        let groups = root
            .as_object()
            .ok_or_else(|| TrxError::Config("configuration root must be an object".into()))?;

        let mut config = Self::new();
        for (group, entries) in groups {
            let entries = entries.as_object().ok_or_else(|| {
                TrxError::Config(format!("configuration group '{}' must be an object", group))
            })?;
            for (name, value) in entries {
                let text = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => {
                        return Err(TrxError::Config(format!(
                            "value of {}/{} must be a string, number or bool",
                            group, name
                        )))
                    }
                };
                config.set(group, name, text);
            }
        }
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            TrxError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&text)
    }
}

impl ConfigProvider for MapConfig {
    fn get_string(&self, group: &str, name: &str) -> Option<String> {
        self.groups
            .get(&group.to_ascii_uppercase())
            .and_then(|entries| entries.get(&name.to_ascii_uppercase()))
            .cloned()
    }
}
