//! Relationship entity - a typed, directed edge between two rows.
//!
//! The source is usually an entity, but can be a universal transaction (e.g.
//! `transaction_has_gl_intelligence`), so no foreign keys are declared.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Relationship database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "core_relationships")]
pub struct Model {
    /// UUID of the edge
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Tenant that owns the edge
    pub organization_id: String,
    /// Edge origin
    pub source_entity_id: String,
    /// Edge destination
    pub target_entity_id: String,
    /// Edge type (e.g. `"package_includes_module"`)
    pub relationship_type: String,
    /// Optional JSON payload carried by the edge
    #[sea_orm(column_type = "Json", nullable)]
    pub relationship_data: Option<Json>,
    /// Soft delete flag
    pub is_active: bool,
    /// When the edge was created
    pub created_at: DateTimeUtc,
}

/// Relationships are keyed by id only
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
