//! Shared test utilities.
//!
//! Helpers for setting up an in-memory database and creating entities and
//! transactions with sensible defaults.

use crate::{
    core::{
        entity,
        transaction::{self, NewTransaction},
    },
    entities,
    errors::Result,
    models::{EnhancedEntity, NewEntity},
};
use sea_orm::DatabaseConnection;
use serde_json::Value as Json;
use std::sync::Once;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Routes `tracing` output through the test harness. Set `RUST_LOG` to see it.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Creates an in-memory `SQLite` database with all tables and indexes.
/// This is the standard setup for all database tests.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    init_test_tracing();
    let db = sea_orm::Database::connect("sqlite::memory:").await?;
    crate::config::database::create_tables(&db).await?;
    Ok(db)
}

/// Creates an entity with no dynamic fields or metadata.
pub async fn create_test_entity(
    db: &DatabaseConnection,
    organization_id: &str,
    entity_type: &str,
    entity_name: &str,
    entity_code: &str,
) -> Result<EnhancedEntity> {
    entity::create_entity(
        db,
        NewEntity::new(organization_id, entity_type, entity_name, entity_code),
    )
    .await
}

/// Creates an entity from a fully built [`NewEntity`].
pub async fn create_entity_with_fields(
    db: &DatabaseConnection,
    new_entity: NewEntity,
) -> Result<EnhancedEntity> {
    entity::create_entity(db, new_entity).await
}

/// Records a transaction dated now with status `posted`.
pub async fn create_test_transaction(
    db: &DatabaseConnection,
    organization_id: &str,
    transaction_type: &str,
    transaction_number: &str,
    transaction_data: Json,
) -> Result<entities::UniversalTransactionModel> {
    transaction::record_transaction(
        db,
        NewTransaction::new(organization_id, transaction_type, transaction_number)
            .with_data(transaction_data),
    )
    .await
}
