//! Typed views over the universal tables.
//!
//! Rows store dynamic values as text plus a type hint. [`FieldValue`] is the typed form
//! callers work with; [`EnhancedEntity`] is an entity with its dynamic fields, metadata
//! and relationships folded back into maps.

use crate::entities::{CoreEntityModel, RelationshipModel};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt;

/// A dynamic field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// `true`/`false`, stored as `"true"`/`"false"`
    Boolean(bool),
    /// Any finite number
    Number(f64),
    /// Plain text
    Text(String),
    /// Arbitrary JSON (arrays, objects)
    Json(Json),
}

impl FieldValue {
    /// Type hint written to `field_type`.
    #[must_use]
    pub const fn field_type(&self) -> &'static str {
        match self {
            Self::Boolean(_) => "boolean",
            Self::Number(_) => "number",
            Self::Text(_) => "text",
            Self::Json(_) => "json",
        }
    }

    /// Text written to `field_value`.
    #[must_use]
    pub fn to_storage(&self) -> String {
        match self {
            Self::Boolean(b) => b.to_string(),
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s.clone(),
            Self::Json(v) => v.to_string(),
        }
    }

    /// Decodes a stored value. The type hint is advisory: unknown hints and values
    /// that do not parse as their hinted type come back as [`FieldValue::Text`].
    #[must_use]
    pub fn from_storage(field_value: &str, field_type: &str) -> Self {
        let parsed = match field_type {
            "boolean" | "bool" => field_value.parse::<bool>().ok().map(Self::Boolean),
            "number" | "numeric" | "decimal" | "integer" => {
                field_value.parse::<f64>().ok().map(Self::Number)
            }
            "json" => serde_json::from_str(field_value).ok().map(Self::Json),
            _ => None,
        };
        parsed.unwrap_or_else(|| Self::Text(field_value.to_string()))
    }

    /// Borrow the text of a `Text` value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view of `Number` values and numeric text.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_storage())
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<Json> for FieldValue {
    fn from(value: Json) -> Self {
        Self::Json(value)
    }
}

/// A metadata entry to write for an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMetadata {
    /// Kind of metadata (e.g. `"ai_reasoning"`)
    pub metadata_type: String,
    /// Optional grouping
    pub metadata_category: Option<String>,
    /// Key within the type
    pub metadata_key: String,
    /// JSON payload
    pub metadata_value: Json,
}

impl NewMetadata {
    /// Metadata entry without a category.
    pub fn new(metadata_type: impl Into<String>, metadata_key: impl Into<String>, value: Json) -> Self {
        Self {
            metadata_type: metadata_type.into(),
            metadata_category: None,
            metadata_key: metadata_key.into(),
            metadata_value: value,
        }
    }
}

/// Everything needed to create an entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewEntity {
    /// Tenant; mandatory
    pub organization_id: String,
    /// Kind of business object
    pub entity_type: String,
    /// Display name
    pub entity_name: String,
    /// Business code
    pub entity_code: String,
    /// Dynamic attributes
    #[serde(default)]
    pub dynamic_fields: BTreeMap<String, FieldValue>,
    /// Metadata entries
    #[serde(default)]
    pub metadata: Vec<NewMetadata>,
}

impl NewEntity {
    /// Entity with identity fields only.
    pub fn new(
        organization_id: impl Into<String>,
        entity_type: impl Into<String>,
        entity_name: impl Into<String>,
        entity_code: impl Into<String>,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            entity_type: entity_type.into(),
            entity_name: entity_name.into(),
            entity_code: entity_code.into(),
            ..Self::default()
        }
    }

    /// Adds a dynamic field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.dynamic_fields.insert(name.into(), value.into());
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, metadata: NewMetadata) -> Self {
        self.metadata.push(metadata);
        self
    }
}

/// Changes to apply to an existing entity. `None` leaves the attribute untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdate {
    /// New display name
    pub entity_name: Option<String>,
    /// New business code
    pub entity_code: Option<String>,
    /// Reactivate or deactivate
    pub is_active: Option<bool>,
    /// Replacement set of dynamic fields; existing fields not listed are removed
    pub dynamic_fields: Option<BTreeMap<String, FieldValue>>,
    /// Metadata entries to supersede
    #[serde(default)]
    pub metadata: Vec<NewMetadata>,
}

/// An entity reassembled from the universal tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedEntity {
    /// The entity row
    #[serde(flatten)]
    pub entity: CoreEntityModel,
    /// Dynamic fields keyed by field name
    pub dynamic_fields: BTreeMap<String, FieldValue>,
    /// Active metadata values keyed by metadata type, then key
    pub metadata: BTreeMap<String, BTreeMap<String, Json>>,
    /// Active relationships where the entity is source or target
    pub relationships: Vec<RelationshipModel>,
}

impl EnhancedEntity {
    /// Entity id shorthand.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.entity.id
    }

    /// Looks up a dynamic field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.dynamic_fields.get(name)
    }

    /// Looks up an active metadata value.
    #[must_use]
    pub fn metadata_value(&self, metadata_type: &str, key: &str) -> Option<&Json> {
        self.metadata.get(metadata_type).and_then(|m| m.get(key))
    }
}
