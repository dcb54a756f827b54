//! Core entity - the generic row behind every business object.
//!
//! Clients, products, recipes, GL accounts and derived intelligence records all live
//! here, distinguished by `entity_type`. `entity_code` is unique per
//! (`organization_id`, `entity_type`); rows are soft-deleted through `is_active`.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Core entity database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "core_entities")]
pub struct Model {
    /// UUID of the entity
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Tenant that owns the entity
    pub organization_id: String,
    /// Kind of business object (e.g. `"customer"`, `"product"`)
    pub entity_type: String,
    /// Display name
    pub entity_name: String,
    /// Business code, unique within organization and type
    pub entity_code: String,
    /// Soft delete flag - false once the entity is deleted
    pub is_active: bool,
    /// When the entity was created
    pub created_at: DateTimeUtc,
    /// When the entity row was last modified
    pub updated_at: DateTimeUtc,
}

/// Relations of the core entity table
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// One entity has many dynamic fields
    #[sea_orm(has_many = "super::core_dynamic_data::Entity")]
    DynamicData,
    /// One entity has many metadata rows
    #[sea_orm(has_many = "super::core_metadata::Entity")]
    Metadata,
}

impl Related<super::core_dynamic_data::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DynamicData.def()
    }
}

impl Related<super::core_metadata::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Metadata.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
