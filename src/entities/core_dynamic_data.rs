//! Dynamic data entity - one open-ended key/value attribute of a core entity.
//!
//! `field_type` is a hint (`"text"`, `"number"`, `"boolean"`, `"json"`) used to decode
//! `field_value`; it is not enforced by the database.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Dynamic field database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "core_dynamic_data")]
pub struct Model {
    /// UUID of the field row
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Tenant, copied from the owning entity
    pub organization_id: String,
    /// Owning entity
    pub entity_id: String,
    /// Field name, unique per entity
    pub field_name: String,
    /// Value in its text storage form
    pub field_value: String,
    /// Type hint for `field_value`
    pub field_type: String,
    /// When the field was first written
    pub created_at: DateTimeUtc,
    /// When the field value last changed
    pub updated_at: DateTimeUtc,
}

/// Relations of the dynamic data table
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each field belongs to one entity
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
