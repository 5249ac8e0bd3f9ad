//! Type mappings: how a payload shape becomes node properties.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{
    ContainerId, DataSourceId, GraphId, IdentityHints, MetatypeId, PropertyMap, TypeMappingId,
};

/// Copies the value at `source_key` (a dot path) into `property_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyTransformation {
    pub source_key: String,
    pub property_name: String,
}

/// Associates one payload shape of a data source with a metatype and graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeMapping {
    pub id: TypeMappingId,
    pub container_id: ContainerId,
    pub data_source_id: DataSourceId,
    /// See [`crate::hash::shape_hash`].
    pub shape_hash: String,
    pub metatype_id: MetatypeId,
    pub graph_id: GraphId,
    /// Dot path whose value becomes the node's `original_data_id`.
    pub unique_identifier_key: Option<String>,
    /// Dot path whose value becomes the node's `composite_original_id`.
    pub composite_identifier_key: Option<String>,
    /// Empty means the payload's top-level object is used as-is.
    pub transformations: Vec<KeyTransformation>,
    pub active: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Fields accepted when creating or replacing a type mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTypeMapping {
    pub shape_hash: String,
    pub metatype_id: MetatypeId,
    pub graph_id: GraphId,
    #[serde(default)]
    pub unique_identifier_key: Option<String>,
    #[serde(default)]
    pub composite_identifier_key: Option<String>,
    #[serde(default)]
    pub transformations: Vec<KeyTransformation>,
    #[serde(default = "default_active")]
    pub active: bool,
    pub created_by: String,
}

fn default_active() -> bool {
    true
}

impl NewTypeMapping {
    /// A pass-through mapping with no identifier keys.
    #[must_use]
    pub fn new(shape_hash: &str, metatype_id: MetatypeId, graph_id: GraphId, created_by: &str) -> Self {
        Self {
            shape_hash: shape_hash.to_string(),
            metatype_id,
            graph_id,
            unique_identifier_key: None,
            composite_identifier_key: None,
            transformations: Vec::new(),
            active: true,
            created_by: created_by.to_string(),
        }
    }

    #[must_use]
    pub fn with_unique_identifier(mut self, path: &str) -> Self {
        self.unique_identifier_key = Some(path.to_string());
        self
    }

    #[must_use]
    pub fn with_composite_identifier(mut self, path: &str) -> Self {
        self.composite_identifier_key = Some(path.to_string());
        self
    }

    #[must_use]
    pub fn with_transformation(mut self, source_key: &str, property_name: &str) -> Self {
        self.transformations.push(KeyTransformation {
            source_key: source_key.to_string(),
            property_name: property_name.to_string(),
        });
        self
    }

    /// Mints a mapping owned by `data_source_id`.
    #[must_use]
    pub fn into_mapping(self, container_id: ContainerId, data_source_id: DataSourceId) -> TypeMapping {
        let now = Utc::now();
        TypeMapping {
            id: TypeMappingId::new(),
            container_id,
            data_source_id,
            shape_hash: self.shape_hash,
            metatype_id: self.metatype_id,
            graph_id: self.graph_id,
            unique_identifier_key: self.unique_identifier_key,
            composite_identifier_key: self.composite_identifier_key,
            transformations: self.transformations,
            active: self.active,
            created_by: self.created_by,
            created_at: now,
            modified_at: now,
        }
    }
}

/// Properties and identity extracted from one staged payload.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRecord {
    pub properties: PropertyMap,
    pub original_data_id: Option<String>,
    pub composite_original_id: Option<String>,
}

impl MappedRecord {
    /// Identity hints for a record staged under `data_source_id`.
    #[must_use]
    pub fn identity(&self, data_source_id: DataSourceId) -> IdentityHints {
        IdentityHints {
            data_source_id: Some(data_source_id),
            original_data_id: self.original_data_id.clone(),
            composite_original_id: self.composite_original_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MappingError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("identifier path {path} not present in payload")]
    MissingIdentifier { path: String },
    #[error("identifier at {path} is not a string, number or boolean")]
    InvalidIdentifier { path: String },
}

impl TypeMapping {
    /// Transforms a staged payload into node properties and identity.
    ///
    /// Transformations whose source path is absent are skipped; the validator
    /// decides whether the resulting property set is acceptable.
    ///
    /// # Errors
    ///
    /// [`MappingError::NotAnObject`] when no transformation is configured and
    /// the payload is not an object; identifier errors when a configured
    /// identifier path is missing or holds a structured value.
    pub fn apply(&self, data: &Value) -> Result<MappedRecord, MappingError> {
        let properties = if self.transformations.is_empty() {
            data.as_object().cloned().ok_or(MappingError::NotAnObject)?
        } else {
            let mut properties = PropertyMap::new();
            for t in &self.transformations {
                match lookup(data, &t.source_key) {
                    Some(value) => {
                        properties.insert(t.property_name.clone(), value.clone());
                    }
                    None => tracing::debug!(
                        mapping = %self.id,
                        source_key = %t.source_key,
                        "transformation source absent"
                    ),
                }
            }
            properties
        };

        Ok(MappedRecord {
            properties,
            original_data_id: identifier(data, self.unique_identifier_key.as_deref())?,
            composite_original_id: identifier(data, self.composite_identifier_key.as_deref())?,
        })
    }
}

/// Resolves a dot path. Numeric segments index into arrays.
#[must_use]
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn identifier(data: &Value, path: Option<&str>) -> Result<Option<String>, MappingError> {
    let Some(path) = path else {
        return Ok(None);
    };
    match lookup(data, path) {
        None | Some(Value::Null) => Err(MappingError::MissingIdentifier {
            path: path.to_string(),
        }),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(_) => Err(MappingError::InvalidIdentifier {
            path: path.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn mapping(new: NewTypeMapping) -> TypeMapping {
        new.into_mapping(ContainerId::new(), DataSourceId::new())
    }

    fn base() -> NewTypeMapping {
        NewTypeMapping::new("abc", MetatypeId::new(), GraphId::new(), "tester")
    }

    #[test]
    fn lookup_walks_objects_and_arrays() {
        let data = json!({"a": {"b": [{"c": 1}, {"c": 2}]}});
        assert_eq!(lookup(&data, "a.b.1.c"), Some(&json!(2)));
        assert_eq!(lookup(&data, "a.b.x"), None);
        assert_eq!(lookup(&data, "a.missing"), None);
    }

    #[test]
    fn empty_transformations_pass_object_through() {
        let data = json!({"flower": "Daisy", "color": "yellow"});
        let mapped = mapping(base()).apply(&data).unwrap();
        assert_eq!(Value::Object(mapped.properties), data);
        assert!(mapped.original_data_id.is_none());
    }

    #[test]
    fn pass_through_requires_an_object() {
        assert_eq!(
            mapping(base()).apply(&json!([1, 2])),
            Err(MappingError::NotAnObject)
        );
    }

    #[test]
    fn transformations_rename_and_skip_missing() {
        let m = mapping(
            base()
                .with_transformation("plant.name", "flower")
                .with_transformation("plant.hue", "color")
                .with_transformation("plant.absent", "notRequired"),
        );
        let mapped = m
            .apply(&json!({"plant": {"name": "Daisy", "hue": "blue"}, "ignored": 1}))
            .unwrap();
        assert_eq!(
            Value::Object(mapped.properties),
            json!({"flower": "Daisy", "color": "blue"})
        );
    }

    #[test]
    fn identifiers_are_stringified() {
        let m = mapping(
            base()
                .with_unique_identifier("meta.id")
                .with_composite_identifier("serial"),
        );
        let mapped = m.apply(&json!({"meta": {"id": 42}, "serial": true})).unwrap();
        assert_eq!(mapped.original_data_id.as_deref(), Some("42"));
        assert_eq!(mapped.composite_original_id.as_deref(), Some("true"));

        let ds = DataSourceId::new();
        let hints = mapped.identity(ds);
        assert_eq!(hints.data_source_id, Some(ds));
        assert!(hints.resolution_key().is_some());
    }

    #[test]
    fn missing_or_structured_identifier_fails() {
        let m = mapping(base().with_unique_identifier("id"));
        assert_eq!(
            m.apply(&json!({"name": "x"})),
            Err(MappingError::MissingIdentifier { path: "id".into() })
        );
        assert_eq!(
            m.apply(&json!({"id": null})),
            Err(MappingError::MissingIdentifier { path: "id".into() })
        );
        assert_eq!(
            m.apply(&json!({"id": {"nested": 1}})),
            Err(MappingError::InvalidIdentifier { path: "id".into() })
        );
    }

    #[test]
    fn new_mapping_defaults_to_active() {
        let parsed: NewTypeMapping = serde_json::from_value(json!({
            "shape_hash": "abc",
            "metatype_id": MetatypeId::new(),
            "graph_id": GraphId::new(),
            "created_by": "tester",
        }))
        .unwrap();
        assert!(parsed.active);
        assert!(parsed.transformations.is_empty());
    }
}
