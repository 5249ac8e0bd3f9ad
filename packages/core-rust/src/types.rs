use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Raw or normalized node properties: an untyped JSON object.
pub type PropertyMap = serde_json::Map<String, serde_json::Value>;

/// Generate a UUID-backed identifier newtype.
macro_rules! id_type {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Mints a fresh random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

id_type!(
    /// Top-level tenant scope grouping graphs, metatypes and data sources.
    ContainerId
);
id_type!(
    /// A partition of nodes within a container.
    GraphId
);
id_type!(
    /// A runtime-defined node type.
    MetatypeId
);
id_type!(
    /// One property slot of a metatype.
    MetatypeKeyId
);
id_type!(
    /// Stable lineage identifier of a node. Shared by all of its revisions.
    NodeId
);
id_type!(
    /// A configured ingestion endpoint.
    DataSourceId
);
id_type!(
    /// One ingestion run against a data source.
    ImportId
);
id_type!(
    /// One raw payload captured during an import.
    StagedRecordId
);
id_type!(
    /// A stored payload-shape to metatype association.
    TypeMappingId
);

/// Source-native identifiers supplied alongside a payload.
///
/// Used by the identity resolver to match an incoming record against an
/// existing node without the caller knowing the internal [`NodeId`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityHints {
    /// Ingestion source that produced the record.
    pub data_source_id: Option<DataSourceId>,
    /// Globally unique (per source) identifier.
    pub original_data_id: Option<String>,
    /// Identifier only unique in combination with `data_source_id`.
    pub composite_original_id: Option<String>,
}

impl IdentityHints {
    /// Returns the key the resolver should match on, if any.
    ///
    /// The original id takes precedence over the composite id. Both require a
    /// data source.
    #[must_use]
    pub fn resolution_key(&self) -> Option<IdentityKey> {
        self.keys().into_iter().next()
    }

    /// Every identity key these hints claim, original first.
    #[must_use]
    pub fn keys(&self) -> Vec<IdentityKey> {
        let Some(data_source_id) = self.data_source_id else {
            return Vec::new();
        };
        let mut keys = Vec::with_capacity(2);
        if let Some(id) = &self.original_data_id {
            keys.push(IdentityKey::Original {
                data_source_id,
                id: id.clone(),
            });
        }
        if let Some(id) = &self.composite_original_id {
            keys.push(IdentityKey::Composite {
                data_source_id,
                id: id.clone(),
            });
        }
        keys
    }
}

/// An external identity that must map to at most one current node per graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdentityKey {
    /// `(data_source_id, original_data_id)`.
    Original {
        data_source_id: DataSourceId,
        id: String,
    },
    /// `(data_source_id, composite_original_id)`.
    Composite {
        data_source_id: DataSourceId,
        id: String,
    },
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Original { data_source_id, id } => {
                write!(f, "original_data_id={id} (data source {data_source_id})")
            }
            Self::Composite { data_source_id, id } => {
                write!(f, "composite_original_id={id} (data source {data_source_id})")
            }
        }
    }
}

/// An instance of a metatype inside a graph, as seen through its current revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub container_id: ContainerId,
    pub graph_id: GraphId,
    pub metatype_id: MetatypeId,
    /// Normalized against the metatype's keys at write time.
    pub properties: PropertyMap,
    pub data_source_id: Option<DataSourceId>,
    pub original_data_id: Option<String>,
    pub composite_original_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Node {
    /// The identity hints carried by this node.
    #[must_use]
    pub fn identity(&self) -> IdentityHints {
        IdentityHints {
            data_source_id: self.data_source_id,
            original_data_id: self.original_data_id.clone(),
            composite_original_id: self.composite_original_id.clone(),
        }
    }
}

/// One stored version of a node. The current revision has no `valid_to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRevision {
    pub node: Node,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
}

impl NodeRevision {
    /// Whether this revision is the node's current one.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.valid_to.is_none()
    }
}

/// A configured ingestion endpoint.
///
/// `config` may hold credentials and is stored and returned verbatim. Serving
/// layers must pass it through [`redact_config`] before transmitting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub id: DataSourceId,
    pub container_id: ContainerId,
    pub name: String,
    pub adapter_type: String,
    pub data_format: String,
    pub config: serde_json::Value,
    /// Gate on automatic processing of staged records.
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Fields accepted when creating a data source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewDataSource {
    pub name: String,
    pub adapter_type: String,
    pub data_format: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub active: bool,
}

/// Keys removed from a data source `config` before it leaves the server.
pub const SECRET_CONFIG_KEYS: [&str; 3] = ["token", "username", "password"];

/// Strips credential fields from a data source configuration in place.
///
/// Non-object configurations are left untouched.
pub fn redact_config(config: &mut serde_json::Value) {
    if let Some(map) = config.as_object_mut() {
        for key in SECRET_CONFIG_KEYS {
            map.remove(key);
        }
    }
}

/// One ingestion run against a data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Import {
    pub id: ImportId,
    pub data_source_id: DataSourceId,
    pub created_by: String,
    /// Free-text label such as `"manual upload"` or `"file upload"`.
    pub reference: String,
    pub created_at: DateTime<Utc>,
}

/// A raw payload awaiting mapping and validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedRecord {
    pub id: StagedRecordId,
    pub data_source_id: DataSourceId,
    pub import_id: ImportId,
    pub data: serde_json::Value,
    /// Structural fingerprint of `data`, see [`crate::hash::shape_hash`].
    pub shape_hash: String,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Terminal failure detail. Only set together with `processed_at`.
    pub errors: Option<serde_json::Value>,
    /// Node produced by a successful processing pass.
    pub node_id: Option<NodeId>,
}

impl StagedRecord {
    /// Whether the record still awaits processing.
    #[must_use]
    pub fn is_unprocessed(&self) -> bool {
        self.processed_at.is_none()
    }
}
