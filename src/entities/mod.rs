//! Entity module - SeaORM definitions of the five universal tables.
//! Every business object is represented through these tables; adding a new
//! object type never requires a new table.

pub mod core_dynamic_data;
pub mod core_entity;
pub mod core_metadata;
pub mod core_relationship;
pub mod universal_transaction;

// Re-export specific types to avoid conflicts
pub use core_dynamic_data::{
    Column as DynamicDataColumn, Entity as DynamicData, Model as DynamicDataModel,
};
pub use core_entity::{Column as CoreEntityColumn, Entity as CoreEntity, Model as CoreEntityModel};
pub use core_metadata::{Column as MetadataColumn, Entity as Metadata, Model as MetadataModel};
pub use core_relationship::{
    Column as RelationshipColumn, Entity as Relationship, Model as RelationshipModel,
};
pub use universal_transaction::{
    Column as UniversalTransactionColumn, Entity as UniversalTransaction,
    Model as UniversalTransactionModel,
};
