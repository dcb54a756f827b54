//! Metadata versioning - reads and writes of the `core_metadata` table.
//!
//! A metadata key has one active row at a time. Writing a new value deactivates the
//! current row (stamping `effective_to`) and inserts a fresh active row, so history is
//! never lost.

use crate::{
    entities::{Metadata, core_metadata},
    errors::{Result, ensure_organization},
    models::NewMetadata,
};
use chrono::Utc;
use sea_orm::{ConnectionTrait, QueryOrder, Set, prelude::*, sea_query::Expr};
use tracing::debug;
use uuid::Uuid;

/// Deactivates the active rows for the key and inserts the new value.
///
/// Runs on whatever connection it is given; callers wrap it in a database
/// transaction so both steps land together.
pub(crate) async fn supersede_metadata<C>(
    db: &C,
    organization_id: &str,
    entity_type: &str,
    entity_id: &str,
    metadata: &NewMetadata,
) -> Result<core_metadata::Model>
where
    C: ConnectionTrait,
{
    if metadata.metadata_type.trim().is_empty() || metadata.metadata_key.trim().is_empty() {
        return Err(crate::errors::Error::validation(
            "metadata_type and metadata_key are required",
        ));
    }

    let now = Utc::now();
    let superseded = Metadata::update_many()
        .col_expr(core_metadata::Column::IsActive, Expr::value(false))
        .col_expr(core_metadata::Column::EffectiveTo, Expr::value(now))
        .filter(core_metadata::Column::OrganizationId.eq(organization_id))
        .filter(core_metadata::Column::EntityId.eq(entity_id))
        .filter(core_metadata::Column::MetadataType.eq(metadata.metadata_type.as_str()))
        .filter(core_metadata::Column::MetadataKey.eq(metadata.metadata_key.as_str()))
        .filter(core_metadata::Column::IsActive.eq(true))
        .exec(db)
        .await?;
    if superseded.rows_affected > 0 {
        debug!(
            "Superseded {} active version(s) of {}.{} for {}",
            superseded.rows_affected, metadata.metadata_type, metadata.metadata_key, entity_id
        );
    }

    core_metadata::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        organization_id: Set(organization_id.to_string()),
        entity_type: Set(entity_type.to_string()),
        entity_id: Set(entity_id.to_string()),
        metadata_type: Set(metadata.metadata_type.clone()),
        metadata_category: Set(metadata.metadata_category.clone()),
        metadata_key: Set(metadata.metadata_key.clone()),
        metadata_value: Set(metadata.metadata_value.clone()),
        is_active: Set(true),
        effective_from: Set(now),
        effective_to: Set(None),
    }
    .insert(db)
    .await
    .map_err(Into::into)
}

/// Active metadata rows of an entity, ordered by type and key.
pub async fn get_active_metadata<C>(
    db: &C,
    organization_id: &str,
    entity_id: &str,
) -> Result<Vec<core_metadata::Model>>
where
    C: ConnectionTrait,
{
    ensure_organization(organization_id)?;
    Metadata::find()
        .filter(core_metadata::Column::OrganizationId.eq(organization_id))
        .filter(core_metadata::Column::EntityId.eq(entity_id))
        .filter(core_metadata::Column::IsActive.eq(true))
        .order_by_asc(core_metadata::Column::MetadataType)
        .order_by_asc(core_metadata::Column::MetadataKey)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Every version of one metadata key, newest first.
pub async fn get_metadata_history<C>(
    db: &C,
    organization_id: &str,
    entity_id: &str,
    metadata_type: &str,
    metadata_key: &str,
) -> Result<Vec<core_metadata::Model>>
where
    C: ConnectionTrait,
{
    ensure_organization(organization_id)?;
    Metadata::find()
        .filter(core_metadata::Column::OrganizationId.eq(organization_id))
        .filter(core_metadata::Column::EntityId.eq(entity_id))
        .filter(core_metadata::Column::MetadataType.eq(metadata_type))
        .filter(core_metadata::Column::MetadataKey.eq(metadata_key))
        .order_by_desc(core_metadata::Column::EffectiveFrom)
        .all(db)
        .await
        .map_err(Into::into)
}
