use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ContainerId, MetatypeId, MetatypeKeyId};

/// A runtime-defined node type, scoped to a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metatype {
    pub id: MetatypeId,
    pub container_id: ContainerId,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Value kind accepted by a metatype key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// UTF-8 text. Numbers and booleans are stringified.
    String,
    /// JSON number, or a string that parses as one.
    Number,
    /// JSON boolean, or `"true"` / `"false"`.
    Boolean,
    /// RFC 3339 timestamp or `YYYY-MM-DD` date, kept as supplied.
    Date,
    /// One of the key's `options`, matched exactly.
    Enumeration,
    /// Name of an uploaded file.
    File,
}

impl DataType {
    /// Lowercase name used in error messages and storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::Enumeration => "enumeration",
            Self::File => "file",
        }
    }

    /// Whether values of this type are strings that a regex can apply to.
    #[must_use]
    pub fn is_textual(self) -> bool {
        matches!(self, Self::String | Self::Date | Self::File)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional constraints layered on top of the data type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyValidation {
    /// Pattern the whole value must match. Textual types only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    /// Lower bound: numeric value, or character count for text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Upper bound: numeric value, or character count for text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl KeyValidation {
    /// True when no constraint is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regex.is_none() && self.min.is_none() && self.max.is_none()
    }
}

/// Definition of one property slot on a metatype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetatypeKey {
    pub id: MetatypeKeyId,
    pub metatype_id: MetatypeId,
    /// Display name.
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Property name looked up in payloads. Unique within the metatype.
    pub property_name: String,
    pub data_type: DataType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
    /// Allowed values, in order. Required for [`DataType::Enumeration`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<KeyValidation>,
}

/// Fields accepted when defining a new key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMetatypeKey {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub property_name: String,
    pub data_type: DataType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default_value: Option<serde_json::Value>,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub validation: Option<KeyValidation>,
}

impl NewMetatypeKey {
    /// Shorthand for a key with only a name, type and required flag.
    #[must_use]
    pub fn new(property_name: &str, data_type: DataType, required: bool) -> Self {
        Self {
            name: property_name.to_string(),
            description: String::new(),
            property_name: property_name.to_string(),
            data_type,
            required,
            default_value: None,
            options: Vec::new(),
            validation: None,
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: &[&str]) -> Self {
        self.options = options.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default_value = Some(value);
        self
    }

    #[must_use]
    pub fn with_regex(mut self, pattern: &str) -> Self {
        self.validation
            .get_or_insert_with(KeyValidation::default)
            .regex = Some(pattern.to_string());
        self
    }

    #[must_use]
    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        let validation = self.validation.get_or_insert_with(KeyValidation::default);
        validation.min = min;
        validation.max = max;
        self
    }

    /// Binds the definition to a metatype, minting its id.
    #[must_use]
    pub fn into_key(self, metatype_id: MetatypeId) -> MetatypeKey {
        MetatypeKey {
            id: MetatypeKeyId::new(),
            metatype_id,
            name: self.name,
            description: self.description,
            property_name: self.property_name,
            data_type: self.data_type,
            required: self.required,
            default_value: self.default_value,
            options: self.options,
            validation: self.validation.filter(|v| !v.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn data_type_serializes_snake_case() {
        assert_eq!(serde_json::to_value(DataType::Enumeration).unwrap(), json!("enumeration"));
        let parsed: DataType = serde_json::from_value(json!("boolean")).unwrap();
        assert_eq!(parsed, DataType::Boolean);
    }

    #[test]
    fn key_deserializes_with_defaults() {
        let key: NewMetatypeKey = serde_json::from_value(json!({
            "name": "Test 2",
            "property_name": "color",
            "data_type": "enumeration",
            "required": true,
            "options": ["yellow", "blue"]
        }))
        .unwrap();
        assert_eq!(key.options, vec!["yellow", "blue"]);
        assert!(key.default_value.is_none());
        assert!(key.validation.is_none());
    }

    #[test]
    fn empty_validation_is_dropped_when_bound() {
        let mut def = NewMetatypeKey::new("flower", DataType::String, true);
        def.validation = Some(KeyValidation::default());
        let key = def.into_key(MetatypeId::new());
        assert!(key.validation.is_none());
    }

    #[test]
    fn builder_sets_constraints() {
        let key = NewMetatypeKey::new("code", DataType::String, true)
            .with_regex("[A-Z]+")
            .with_range(Some(2.0), None)
            .into_key(MetatypeId::new());
        let validation = key.validation.unwrap();
        assert_eq!(validation.regex.as_deref(), Some("[A-Z]+"));
        assert_eq!(validation.min, Some(2.0));
        assert!(validation.max.is_none());
    }

    #[test]
    fn textual_types() {
        assert!(DataType::String.is_textual());
        assert!(DataType::Date.is_textual());
        assert!(DataType::File.is_textual());
        assert!(!DataType::Number.is_textual());
        assert!(!DataType::Enumeration.is_textual());
    }
}
