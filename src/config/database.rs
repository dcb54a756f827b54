//! Database configuration module for the universal schema.
//!
//! Handles connecting through `SeaORM` and creating the five universal tables from the
//! entity definitions with `Schema::create_table_from_entity`. Uniqueness rules that
//! span several columns (entity codes, transaction numbers, dynamic field names) are
//! created as unique indexes so the storage layer, not the advisory duplicate checks,
//! is the final guarantee.

use crate::entities::{
    CoreEntity, DynamicData, Metadata, Relationship, UniversalTransaction, core_dynamic_data,
    core_entity, core_metadata, core_relationship, universal_transaction,
};
use crate::errors::Result;
use sea_orm::sea_query::{Index, IndexCreateStatement};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Schema};
use tracing::{debug, info, instrument};

const DEFAULT_DATABASE_URL: &str = "sqlite://data/universal_schema.sqlite?mode=rwc";

/// Gets the database URL from the `DATABASE_URL` environment variable, falling back to
/// a local `SQLite` file.
#[must_use]
pub fn get_database_url() -> String {
    std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string())
}

/// Establishes a connection to the given database URL.
#[instrument]
pub async fn create_connection(database_url: &str) -> Result<DatabaseConnection> {
    debug!("Connecting to database");
    Database::connect(database_url).await.map_err(Into::into)
}

/// Creates the universal tables and their unique indexes if they do not exist yet.
pub async fn create_tables<C>(db: &C) -> Result<()>
where
    C: ConnectionTrait,
{
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);

    let tables = [
        schema
            .create_table_from_entity(CoreEntity)
            .if_not_exists()
            .to_owned(),
        schema
            .create_table_from_entity(DynamicData)
            .if_not_exists()
            .to_owned(),
        schema
            .create_table_from_entity(Metadata)
            .if_not_exists()
            .to_owned(),
        schema
            .create_table_from_entity(Relationship)
            .if_not_exists()
            .to_owned(),
        schema
            .create_table_from_entity(UniversalTransaction)
            .if_not_exists()
            .to_owned(),
    ];
    for table in &tables {
        db.execute(builder.build(table)).await?;
    }

    for index in unique_indexes() {
        db.execute(builder.build(&index)).await?;
    }
    for index in lookup_indexes() {
        db.execute(builder.build(&index)).await?;
    }

    info!("Universal tables ensured");
    Ok(())
}

fn unique_indexes() -> Vec<IndexCreateStatement> {
    vec![
        Index::create()
            .name("idx_core_entities_org_type_code")
            .table(CoreEntity)
            .col(core_entity::Column::OrganizationId)
            .col(core_entity::Column::EntityType)
            .col(core_entity::Column::EntityCode)
            .unique()
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("idx_universal_transactions_org_type_number")
            .table(UniversalTransaction)
            .col(universal_transaction::Column::OrganizationId)
            .col(universal_transaction::Column::TransactionType)
            .col(universal_transaction::Column::TransactionNumber)
            .unique()
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("idx_core_dynamic_data_entity_field")
            .table(DynamicData)
            .col(core_dynamic_data::Column::EntityId)
            .col(core_dynamic_data::Column::FieldName)
            .unique()
            .if_not_exists()
            .to_owned(),
    ]
}

fn lookup_indexes() -> Vec<IndexCreateStatement> {
    vec![
        Index::create()
            .name("idx_core_metadata_entity_type_key")
            .table(Metadata)
            .col(core_metadata::Column::EntityId)
            .col(core_metadata::Column::MetadataType)
            .col(core_metadata::Column::MetadataKey)
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("idx_core_relationships_source")
            .table(Relationship)
            .col(core_relationship::Column::SourceEntityId)
            .col(core_relationship::Column::RelationshipType)
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("idx_core_relationships_target")
            .table(Relationship)
            .col(core_relationship::Column::TargetEntityId)
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("idx_core_dynamic_data_org_field")
            .table(DynamicData)
            .col(core_dynamic_data::Column::OrganizationId)
            .col(core_dynamic_data::Column::FieldName)
            .if_not_exists()
            .to_owned(),
    ]
}
