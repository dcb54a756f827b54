//! Universal transaction entity - an immutable record of a business event.
//!
//! `transaction_number` is unique per (`organization_id`, `transaction_type`).
//! Entity lifecycle events (`entity_created`, `entity_updated`, `entity_deleted`)
//! are logged here with `reference_entity_id` pointing at the entity.
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Universal transaction database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "universal_transactions")]
pub struct Model {
    /// UUID of the transaction
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Tenant that owns the transaction
    pub organization_id: String,
    /// Type of event (e.g. `"invoice"`, `"journal_entry"`, `"entity_created"`)
    pub transaction_type: String,
    /// Business number, unique within organization and type
    pub transaction_number: String,
    /// When the event happened
    pub transaction_date: DateTimeUtc,
    /// Status of the event (e.g. `"posted"`, `"draft"`)
    pub transaction_status: String,
    /// Entity the event refers to, if any
    pub reference_entity_id: Option<String>,
    /// JSON payload
    #[sea_orm(column_type = "Json")]
    pub transaction_data: Json,
}

/// Transactions are keyed by id only
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
