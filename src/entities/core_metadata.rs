//! Metadata entity - versioned side-channel data attached to an entity.
//!
//! Superseded rows are never deleted: they get `is_active = false` and an
//! `effective_to` timestamp. At most one row per (`entity_id`, `metadata_type`,
//! `metadata_key`) is active.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Metadata database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "core_metadata")]
pub struct Model {
    /// UUID of the metadata row
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Tenant that owns the row
    pub organization_id: String,
    /// Type of the entity the metadata describes
    pub entity_type: String,
    /// Entity the metadata describes
    pub entity_id: String,
    /// Kind of metadata (e.g. `"ai_reasoning"`, `"cost_analysis"`)
    pub metadata_type: String,
    /// Free-form grouping
    pub metadata_category: Option<String>,
    /// Key within the metadata type
    pub metadata_key: String,
    /// JSON payload
    #[sea_orm(column_type = "Json")]
    pub metadata_value: Json,
    /// Whether this is the current version for its key
    pub is_active: bool,
    /// When this version became current
    pub effective_from: DateTimeUtc,
    /// When this version was superseded
    pub effective_to: Option<DateTimeUtc>,
}

/// Relations of the metadata table
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each metadata row belongs to one entity
    #[sea_orm(
        belongs_to = "super::core_entity::Entity",
        from = "Column::EntityId",
        to = "super::core_entity::Column::Id"
    )]
    CoreEntity,
}

impl Related<super::core_entity::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CoreEntity.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
