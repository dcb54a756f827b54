//! Generic entity and relationship service.
//!
//! Every business object is a `core_entities` row plus dynamic fields, versioned
//! metadata and typed relationships. Multi-table writes run in one database
//! transaction together with an audit row in `universal_transactions`, so a failure
//! part way through leaves nothing behind.

use crate::{
    core::{
        duplicates::{DuplicatePolicy, FieldAction, check_dynamic_data_duplicates},
        metadata::supersede_metadata,
        transaction::record_entity_event,
    },
    entities::{
        CoreEntity, CoreEntityModel, DynamicData, DynamicDataModel, Metadata, MetadataModel,
        Relationship, RelationshipModel, core_dynamic_data, core_entity, core_metadata,
        core_relationship,
    },
    errors::{Error, Result, ensure_organization},
    models::{EnhancedEntity, EntityUpdate, FieldValue, NewEntity, NewMetadata},
};
use chrono::Utc;
use sea_orm::{
    Condition, ConnectionTrait, QueryOrder, QuerySelect, Set, TransactionTrait, prelude::*,
    sea_query::Expr,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value as Json, json};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Metadata type used to archive superseded values of versioned fields.
pub const FIELD_VERSION_METADATA: &str = "field_version";

/// Rows returned by [`search_entities`] when no page size is given.
pub const DEFAULT_SEARCH_PAGE_SIZE: usize = 50;

fn validate_new_entity(new_entity: &NewEntity) -> Result<()> {
    ensure_organization(&new_entity.organization_id)?;
    for (label, value) in [
        ("entity_type", &new_entity.entity_type),
        ("entity_name", &new_entity.entity_name),
        ("entity_code", &new_entity.entity_code),
    ] {
        if value.trim().is_empty() {
            return Err(Error::validation(format!("{label} is required")));
        }
    }
    validate_field_names(new_entity.dynamic_fields.keys())
}

fn validate_field_names<'a>(names: impl Iterator<Item = &'a String>) -> Result<()> {
    for name in names {
        if name.trim().is_empty() {
            return Err(Error::validation("dynamic field names must not be blank"));
        }
        // Stored names are trimmed, so " price" would collide with "price".
        if name.trim() != name {
            return Err(Error::validation(format!(
                "dynamic field name '{name}' has leading or trailing whitespace"
            )));
        }
    }
    Ok(())
}

/// Builds the error for an entity code that is already taken.
async fn duplicate_code_error<C>(
    db: &C,
    organization_id: &str,
    entity_type: &str,
    entity_code: &str,
) -> Result<Error>
where
    C: ConnectionTrait,
{
    let duplicate_ids: Vec<String> = CoreEntity::find()
        .select_only()
        .column(core_entity::Column::Id)
        .filter(core_entity::Column::OrganizationId.eq(organization_id))
        .filter(core_entity::Column::EntityType.eq(entity_type))
        .filter(core_entity::Column::EntityCode.eq(entity_code))
        .into_tuple()
        .all(db)
        .await?;
    Ok(Error::DuplicateEntity {
        message: format!("{entity_type} code '{entity_code}' already exists"),
        duplicate_ids,
    })
}

async fn insert_dynamic_fields<C>(
    db: &C,
    entity: &CoreEntityModel,
    fields: &BTreeMap<String, FieldValue>,
) -> Result<Vec<DynamicDataModel>>
where
    C: ConnectionTrait,
{
    let mut rows = Vec::with_capacity(fields.len());
    for (name, value) in fields {
        rows.push(insert_field(db, &entity.organization_id, &entity.id, name, value).await?);
    }
    Ok(rows)
}

async fn insert_field<C>(
    db: &C,
    organization_id: &str,
    entity_id: &str,
    field_name: &str,
    value: &FieldValue,
) -> Result<DynamicDataModel>
where
    C: ConnectionTrait,
{
    let now = Utc::now();
    core_dynamic_data::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        organization_id: Set(organization_id.to_string()),
        entity_id: Set(entity_id.to_string()),
        field_name: Set(field_name.trim().to_string()),
        field_value: Set(value.to_storage()),
        field_type: Set(value.field_type().to_string()),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .map_err(Into::into)
}

async fn overwrite_field<C>(db: &C, field_id: &str, value: &FieldValue) -> Result<()>
where
    C: ConnectionTrait,
{
    DynamicData::update_many()
        .col_expr(core_dynamic_data::Column::FieldValue, Expr::value(value.to_storage()))
        .col_expr(core_dynamic_data::Column::FieldType, Expr::value(value.field_type()))
        .col_expr(core_dynamic_data::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(core_dynamic_data::Column::Id.eq(field_id))
        .exec(db)
        .await?;
    Ok(())
}

/// Writes one dynamic field, updating the row when the field already exists.
pub(crate) async fn upsert_field<C>(
    db: &C,
    organization_id: &str,
    entity_id: &str,
    field_name: &str,
    value: &FieldValue,
) -> Result<()>
where
    C: ConnectionTrait,
{
    let existing = DynamicData::find()
        .filter(core_dynamic_data::Column::OrganizationId.eq(organization_id))
        .filter(core_dynamic_data::Column::EntityId.eq(entity_id))
        .filter(core_dynamic_data::Column::FieldName.eq(field_name))
        .one(db)
        .await?;
    match existing {
        Some(row) => overwrite_field(db, &row.id, value).await,
        None => insert_field(db, organization_id, entity_id, field_name, value)
            .await
            .map(|_| ()),
    }
}

fn fold_entity(
    entity: CoreEntityModel,
    fields: Vec<DynamicDataModel>,
    metadata: Vec<MetadataModel>,
    relationships: Vec<RelationshipModel>,
) -> EnhancedEntity {
    let dynamic_fields = fields
        .into_iter()
        .map(|f| {
            let value = FieldValue::from_storage(&f.field_value, &f.field_type);
            (f.field_name, value)
        })
        .collect();

    let mut folded: BTreeMap<String, BTreeMap<String, Json>> = BTreeMap::new();
    for m in metadata {
        folded
            .entry(m.metadata_type)
            .or_default()
            .insert(m.metadata_key, m.metadata_value);
    }

    EnhancedEntity {
        entity,
        dynamic_fields,
        metadata: folded,
        relationships,
    }
}

/// Creates an entity with its dynamic fields and metadata.
///
/// Entity row, fields, metadata and the `entity_created` audit row are written in one
/// database transaction. A taken code fails with [`Error::DuplicateEntity`].
#[instrument(skip(db, new_entity), fields(org = %new_entity.organization_id, code = %new_entity.entity_code))]
pub async fn create_entity<C>(db: &C, new_entity: NewEntity) -> Result<EnhancedEntity>
where
    C: ConnectionTrait + TransactionTrait,
{
    validate_new_entity(&new_entity)?;

    let txn = db.begin().await?;
    let now = Utc::now();
    let entity_model = core_entity::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        organization_id: Set(new_entity.organization_id.clone()),
        entity_type: Set(new_entity.entity_type.trim().to_string()),
        entity_name: Set(new_entity.entity_name.trim().to_string()),
        entity_code: Set(new_entity.entity_code.trim().to_string()),
        is_active: Set(true),
        created_at: Set(now),
        updated_at: Set(now),
    };

    let entity = match entity_model.insert(&txn).await.map_err(Error::from) {
        Ok(entity) => entity,
        Err(err) if err.is_unique_violation() => {
            txn.rollback().await?;
            return Err(duplicate_code_error(
                db,
                &new_entity.organization_id,
                new_entity.entity_type.trim(),
                new_entity.entity_code.trim(),
            )
            .await?);
        }
        Err(err) => return Err(err),
    };

    let fields = insert_dynamic_fields(&txn, &entity, &new_entity.dynamic_fields).await?;

    let mut metadata = Vec::with_capacity(new_entity.metadata.len());
    for entry in &new_entity.metadata {
        metadata.push(
            supersede_metadata(
                &txn,
                &entity.organization_id,
                &entity.entity_type,
                &entity.id,
                entry,
            )
            .await?,
        );
    }
    // Repeated keys in one request: only the last write is active.
    metadata.retain(|m| {
        new_entity
            .metadata
            .iter()
            .rev()
            .find(|n| n.metadata_type == m.metadata_type && n.metadata_key == m.metadata_key)
            .is_some_and(|n| n.metadata_value == m.metadata_value)
    });

    record_entity_event(
        &txn,
        "entity_created",
        &entity,
        json!({
            "entity_name": entity.entity_name,
            "dynamic_fields": fields.len(),
            "metadata": metadata.len(),
        }),
    )
    .await?;
    txn.commit().await?;

    info!(
        "Created {} '{}' ({}) for {}",
        entity.entity_type, entity.entity_name, entity.entity_code, entity.organization_id
    );
    Ok(fold_entity(entity, fields, metadata, Vec::new()))
}

/// Loads one entity with its dynamic fields, active metadata and active relationships.
pub async fn get_entity_with_enhanced_data<C>(
    db: &C,
    organization_id: &str,
    entity_id: &str,
) -> Result<Option<EnhancedEntity>>
where
    C: ConnectionTrait,
{
    let mut loaded =
        load_enhanced_entities(db, organization_id, &[entity_id.to_string()]).await?;
    Ok(loaded.pop())
}

/// Loads many entities with four queries in total, whatever the batch size.
///
/// Results follow the order of `entity_ids`; ids that do not exist for the
/// organization are skipped.
#[instrument(skip(db, entity_ids), fields(count = entity_ids.len()))]
pub async fn load_enhanced_entities<C>(
    db: &C,
    organization_id: &str,
    entity_ids: &[String],
) -> Result<Vec<EnhancedEntity>>
where
    C: ConnectionTrait,
{
    ensure_organization(organization_id)?;
    if entity_ids.is_empty() {
        return Ok(Vec::new());
    }

    let entities = CoreEntity::find()
        .filter(core_entity::Column::OrganizationId.eq(organization_id))
        .filter(core_entity::Column::Id.is_in(entity_ids.iter().cloned()))
        .all(db)
        .await?;
    if entities.is_empty() {
        return Ok(Vec::new());
    }
    let found: Vec<String> = entities.iter().map(|e| e.id.clone()).collect();

    let (fields, metadata, relationships) = tokio::try_join!(
        DynamicData::find()
            .filter(core_dynamic_data::Column::OrganizationId.eq(organization_id))
            .filter(core_dynamic_data::Column::EntityId.is_in(found.clone()))
            .order_by_asc(core_dynamic_data::Column::FieldName)
            .all(db),
        Metadata::find()
            .filter(core_metadata::Column::OrganizationId.eq(organization_id))
            .filter(core_metadata::Column::EntityId.is_in(found.clone()))
            .filter(core_metadata::Column::IsActive.eq(true))
            .all(db),
        Relationship::find()
            .filter(core_relationship::Column::OrganizationId.eq(organization_id))
            .filter(core_relationship::Column::IsActive.eq(true))
            .filter(
                Condition::any()
                    .add(core_relationship::Column::SourceEntityId.is_in(found.clone()))
                    .add(core_relationship::Column::TargetEntityId.is_in(found.clone())),
            )
            .order_by_asc(core_relationship::Column::CreatedAt)
            .all(db),
    )?;

    let mut fields_by_entity: HashMap<String, Vec<DynamicDataModel>> = HashMap::new();
    for field in fields {
        fields_by_entity
            .entry(field.entity_id.clone())
            .or_default()
            .push(field);
    }
    let mut metadata_by_entity: HashMap<String, Vec<MetadataModel>> = HashMap::new();
    for row in metadata {
        metadata_by_entity
            .entry(row.entity_id.clone())
            .or_default()
            .push(row);
    }
    let mut entities_by_id: HashMap<String, CoreEntityModel> =
        entities.into_iter().map(|e| (e.id.clone(), e)).collect();

    let mut loaded = Vec::with_capacity(entities_by_id.len());
    for id in entity_ids {
        let Some(entity) = entities_by_id.remove(id) else {
            continue;
        };
        let edges = relationships
            .iter()
            .filter(|r| r.source_entity_id == *id || r.target_entity_id == *id)
            .cloned()
            .collect();
        loaded.push(fold_entity(
            entity,
            fields_by_entity.remove(id).unwrap_or_default(),
            metadata_by_entity.remove(id).unwrap_or_default(),
            edges,
        ));
    }
    debug!("Loaded {} of {} entities", loaded.len(), entity_ids.len());
    Ok(loaded)
}

async fn find_entity<C>(db: &C, organization_id: &str, entity_id: &str) -> Result<CoreEntityModel>
where
    C: ConnectionTrait,
{
    CoreEntity::find_by_id(entity_id)
        .filter(core_entity::Column::OrganizationId.eq(organization_id))
        .one(db)
        .await?
        .ok_or_else(|| Error::EntityNotFound {
            id: entity_id.to_string(),
        })
}

/// Applies an [`EntityUpdate`] and returns the reloaded entity.
///
/// Supplied dynamic fields replace the whole existing set. Supplied metadata
/// supersedes the active version of each key.
#[instrument(skip(db, update))]
pub async fn update_entity<C>(
    db: &C,
    organization_id: &str,
    entity_id: &str,
    update: EntityUpdate,
) -> Result<EnhancedEntity>
where
    C: ConnectionTrait + TransactionTrait,
{
    ensure_organization(organization_id)?;
    if let Some(fields) = &update.dynamic_fields {
        validate_field_names(fields.keys())?;
    }

    let txn = db.begin().await?;
    let entity = find_entity(&txn, organization_id, entity_id).await?;
    let entity_type = entity.entity_type.clone();
    let mut active: core_entity::ActiveModel = entity.into();
    let mut changed: Vec<&str> = Vec::new();

    if let Some(name) = &update.entity_name {
        if name.trim().is_empty() {
            return Err(Error::validation("entity_name must not be blank"));
        }
        active.entity_name = Set(name.trim().to_string());
        changed.push("entity_name");
    }
    let new_code = update.entity_code.as_deref().map(str::trim);
    if let Some(code) = new_code {
        if code.is_empty() {
            return Err(Error::validation("entity_code must not be blank"));
        }
        active.entity_code = Set(code.to_string());
        changed.push("entity_code");
    }
    if let Some(is_active) = update.is_active {
        active.is_active = Set(is_active);
        changed.push("is_active");
    }
    active.updated_at = Set(Utc::now());

    let entity = match active.update(&txn).await.map_err(Error::from) {
        Ok(entity) => entity,
        Err(err) if err.is_unique_violation() => {
            txn.rollback().await?;
            return Err(duplicate_code_error(
                db,
                organization_id,
                &entity_type,
                new_code.unwrap_or_default(),
            )
            .await?);
        }
        Err(err) => return Err(err),
    };

    if let Some(fields) = &update.dynamic_fields {
        DynamicData::delete_many()
            .filter(core_dynamic_data::Column::OrganizationId.eq(organization_id))
            .filter(core_dynamic_data::Column::EntityId.eq(entity_id))
            .exec(&txn)
            .await?;
        insert_dynamic_fields(&txn, &entity, fields).await?;
        changed.push("dynamic_fields");
    }
    for entry in &update.metadata {
        supersede_metadata(&txn, organization_id, &entity.entity_type, entity_id, entry).await?;
    }
    if !update.metadata.is_empty() {
        changed.push("metadata");
    }

    record_entity_event(&txn, "entity_updated", &entity, json!({ "changed": changed })).await?;
    txn.commit().await?;
    info!("Updated {} {}: {:?}", entity.entity_type, entity_id, changed);

    get_entity_with_enhanced_data(db, organization_id, entity_id)
        .await?
        .ok_or_else(|| Error::EntityNotFound {
            id: entity_id.to_string(),
        })
}

/// Soft-deletes an entity and deactivates every relationship touching it.
///
/// Deleting an already inactive entity is a no-op.
#[instrument(skip(db))]
pub async fn delete_entity<C>(db: &C, organization_id: &str, entity_id: &str) -> Result<()>
where
    C: ConnectionTrait + TransactionTrait,
{
    ensure_organization(organization_id)?;
    let txn = db.begin().await?;
    let entity = find_entity(&txn, organization_id, entity_id).await?;
    if !entity.is_active {
        debug!("Entity {} already inactive", entity_id);
        return Ok(());
    }

    let mut active: core_entity::ActiveModel = entity.into();
    active.is_active = Set(false);
    active.updated_at = Set(Utc::now());
    let entity = active.update(&txn).await?;

    let edges = Relationship::update_many()
        .col_expr(core_relationship::Column::IsActive, Expr::value(false))
        .filter(core_relationship::Column::OrganizationId.eq(organization_id))
        .filter(core_relationship::Column::IsActive.eq(true))
        .filter(
            Condition::any()
                .add(core_relationship::Column::SourceEntityId.eq(entity_id))
                .add(core_relationship::Column::TargetEntityId.eq(entity_id)),
        )
        .exec(&txn)
        .await?;

    record_entity_event(
        &txn,
        "entity_deleted",
        &entity,
        json!({ "relationships_deactivated": edges.rows_affected }),
    )
    .await?;
    txn.commit().await?;
    info!(
        "Deleted {} {} and {} relationship(s)",
        entity.entity_type, entity_id, edges.rows_affected
    );
    Ok(())
}

/// Inserts a relationship row without checking the endpoints.
pub(crate) async fn insert_relationship<C>(
    db: &C,
    organization_id: &str,
    source_entity_id: &str,
    target_entity_id: &str,
    relationship_type: &str,
    relationship_data: Option<Json>,
) -> Result<RelationshipModel>
where
    C: ConnectionTrait,
{
    core_relationship::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        organization_id: Set(organization_id.to_string()),
        source_entity_id: Set(source_entity_id.to_string()),
        target_entity_id: Set(target_entity_id.to_string()),
        relationship_type: Set(relationship_type.to_string()),
        relationship_data: Set(relationship_data),
        is_active: Set(true),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .map_err(Into::into)
}

/// Links two active entities of the organization.
#[instrument(skip(db, relationship_data))]
pub async fn create_relationship<C>(
    db: &C,
    organization_id: &str,
    source_entity_id: &str,
    target_entity_id: &str,
    relationship_type: &str,
    relationship_data: Option<Json>,
) -> Result<RelationshipModel>
where
    C: ConnectionTrait,
{
    ensure_organization(organization_id)?;
    if relationship_type.trim().is_empty() {
        return Err(Error::validation("relationship_type is required"));
    }

    let found: Vec<String> = CoreEntity::find()
        .select_only()
        .column(core_entity::Column::Id)
        .filter(core_entity::Column::OrganizationId.eq(organization_id))
        .filter(core_entity::Column::IsActive.eq(true))
        .filter(core_entity::Column::Id.is_in([source_entity_id, target_entity_id]))
        .into_tuple()
        .all(db)
        .await?;
    for endpoint in [source_entity_id, target_entity_id] {
        if !found.iter().any(|id| id == endpoint) {
            return Err(Error::EntityNotFound {
                id: endpoint.to_string(),
            });
        }
    }

    let relationship = insert_relationship(
        db,
        organization_id,
        source_entity_id,
        target_entity_id,
        relationship_type.trim(),
        relationship_data,
    )
    .await?;
    debug!(
        "Linked {} -[{}]-> {}",
        source_entity_id, relationship.relationship_type, target_entity_id
    );
    Ok(relationship)
}

/// Marks a relationship inactive.
pub async fn deactivate_relationship<C>(
    db: &C,
    organization_id: &str,
    relationship_id: &str,
) -> Result<()>
where
    C: ConnectionTrait,
{
    ensure_organization(organization_id)?;
    let result = Relationship::update_many()
        .col_expr(core_relationship::Column::IsActive, Expr::value(false))
        .filter(core_relationship::Column::Id.eq(relationship_id))
        .filter(core_relationship::Column::OrganizationId.eq(organization_id))
        .exec(db)
        .await?;
    if result.rows_affected == 0 {
        return Err(Error::RelationshipNotFound {
            id: relationship_id.to_string(),
        });
    }
    Ok(())
}

/// Active relationships where the entity is source or target, optionally of one type.
pub async fn get_relationships<C>(
    db: &C,
    organization_id: &str,
    entity_id: &str,
    relationship_type: Option<&str>,
) -> Result<Vec<RelationshipModel>>
where
    C: ConnectionTrait,
{
    ensure_organization(organization_id)?;
    let mut query = Relationship::find()
        .filter(core_relationship::Column::OrganizationId.eq(organization_id))
        .filter(core_relationship::Column::IsActive.eq(true))
        .filter(
            Condition::any()
                .add(core_relationship::Column::SourceEntityId.eq(entity_id))
                .add(core_relationship::Column::TargetEntityId.eq(entity_id)),
        );
    if let Some(relationship_type) = relationship_type {
        query = query.filter(core_relationship::Column::RelationshipType.eq(relationship_type));
    }
    query
        .order_by_asc(core_relationship::Column::CreatedAt)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Case-insensitive substring search on name or code over active entities, ordered
/// by name. A `page_size` of zero means [`DEFAULT_SEARCH_PAGE_SIZE`].
///
/// Matching is done after loading: SQL `lower()` only folds ASCII on SQLite.
#[instrument(skip(db))]
pub async fn search_entities<C>(
    db: &C,
    organization_id: &str,
    query: &str,
    entity_type: Option<&str>,
    page_size: usize,
) -> Result<Vec<CoreEntityModel>>
where
    C: ConnectionTrait,
{
    ensure_organization(organization_id)?;
    let needle = query.trim().to_lowercase();
    let page_size = if page_size == 0 {
        DEFAULT_SEARCH_PAGE_SIZE
    } else {
        page_size
    };

    let mut select = CoreEntity::find()
        .filter(core_entity::Column::OrganizationId.eq(organization_id))
        .filter(core_entity::Column::IsActive.eq(true));
    if let Some(entity_type) = entity_type {
        select = select.filter(core_entity::Column::EntityType.eq(entity_type));
    }
    let candidates = select
        .order_by_asc(core_entity::Column::EntityName)
        .all(db)
        .await?;

    Ok(candidates
        .into_iter()
        .filter(|e| {
            e.entity_name.to_lowercase().contains(&needle)
                || e.entity_code.to_lowercase().contains(&needle)
        })
        .take(page_size)
        .collect())
}

/// What [`apply_dynamic_data_resolution`] did with each proposed field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicDataResolution {
    /// Fields that did not exist yet
    pub inserted: Vec<String>,
    /// Fields overwritten in place
    pub updated: Vec<String>,
    /// Fields whose previous value was archived before overwriting
    pub versioned: Vec<String>,
    /// Fields left alone because the value was unchanged
    pub unchanged: Vec<String>,
}

/// Writes proposed dynamic fields following the per-field actions of
/// [`check_dynamic_data_duplicates`].
///
/// Versioned fields archive the previous value as `field_version` metadata keyed
/// by field name before being overwritten.
#[instrument(skip(db, fields, policy))]
pub async fn apply_dynamic_data_resolution<C>(
    db: &C,
    organization_id: &str,
    entity_id: &str,
    fields: &BTreeMap<String, FieldValue>,
    policy: &DuplicatePolicy,
) -> Result<DynamicDataResolution>
where
    C: ConnectionTrait + TransactionTrait,
{
    ensure_organization(organization_id)?;
    validate_field_names(fields.keys())?;

    let txn = db.begin().await?;
    let entity = find_entity(&txn, organization_id, entity_id).await?;
    let check =
        check_dynamic_data_duplicates(&txn, organization_id, entity_id, fields, policy).await?;

    let mut resolution = DynamicDataResolution::default();
    for (name, value) in fields {
        let Some(collision) = check.field_collisions.iter().find(|c| &c.field_name == name)
        else {
            insert_field(&txn, organization_id, entity_id, name, value).await?;
            resolution.inserted.push(name.clone());
            continue;
        };
        match collision.action {
            FieldAction::KeepExisting => resolution.unchanged.push(name.clone()),
            FieldAction::CreateVersion => {
                let archived = NewMetadata {
                    metadata_type: FIELD_VERSION_METADATA.to_string(),
                    metadata_category: Some("dynamic_data".to_string()),
                    metadata_key: name.clone(),
                    metadata_value: json!({
                        "value": collision.existing_value,
                        "field_type": collision.existing_value.field_type(),
                        "replaced_by": value,
                        "superseded_at": Utc::now(),
                    }),
                };
                supersede_metadata(&txn, organization_id, &entity.entity_type, entity_id, &archived)
                    .await?;
                overwrite_field(&txn, &collision.existing_id, value).await?;
                resolution.versioned.push(name.clone());
            }
            FieldAction::Update => {
                overwrite_field(&txn, &collision.existing_id, value).await?;
                resolution.updated.push(name.clone());
            }
        }
    }
    txn.commit().await?;

    debug!("Resolved dynamic data for {}: {:?}", entity_id, resolution);
    Ok(resolution)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::float_cmp)]
    use super::*;
    use crate::core::metadata::get_metadata_history;
    use crate::core::transaction::list_transactions_for_entity;
    use crate::test_utils::*;

    #[tokio::test]
    async fn test_create_entity_round_trip() -> Result<()> {
        let db = setup_test_db().await?;
        let created = create_entity(
            &db,
            NewEntity::new("org-1", "product", " Latte ", "PRD-001")
                .with_field("price", 4.5)
                .with_field("vegan", true)
                .with_field("tags", json!(["hot", "milk"]))
                .with_metadata(NewMetadata::new("ai_reasoning", "category", json!("beverage"))),
        )
        .await?;
        assert_eq!(created.entity.entity_name, "Latte");

        let loaded = get_entity_with_enhanced_data(&db, "org-1", created.id())
            .await?
            .unwrap();
        assert_eq!(loaded.field("price"), Some(&FieldValue::Number(4.5)));
        assert_eq!(loaded.field("vegan"), Some(&FieldValue::Boolean(true)));
        assert_eq!(loaded.field("tags"), Some(&FieldValue::Json(json!(["hot", "milk"]))));
        assert_eq!(
            loaded.metadata_value("ai_reasoning", "category"),
            Some(&json!("beverage"))
        );
        assert_eq!(loaded.dynamic_fields, created.dynamic_fields);
        assert_eq!(loaded.metadata, created.metadata);

        let audit = list_transactions_for_entity(&db, "org-1", created.id()).await?;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].transaction_type, "entity_created");
        Ok(())
    }

    #[tokio::test]
    async fn test_entities_are_invisible_to_other_organizations() -> Result<()> {
        let db = setup_test_db().await?;
        let created = create_test_entity(&db, "org-1", "product", "Latte", "PRD-001").await?;
        assert!(
            get_entity_with_enhanced_data(&db, "org-2", created.id())
                .await?
                .is_none()
        );
        let update = update_entity(&db, "org-2", created.id(), EntityUpdate::default()).await;
        assert!(matches!(update, Err(Error::EntityNotFound { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_code_maps_to_duplicate_entity() -> Result<()> {
        let db = setup_test_db().await?;
        let first = create_test_entity(&db, "org-1", "product", "Latte", "PRD-001").await?;

        let again = create_entity(
            &db,
            NewEntity::new("org-1", "product", "Other", "PRD-001").with_field("price", 3.0),
        )
        .await;
        match again {
            Err(Error::DuplicateEntity { duplicate_ids, .. }) => {
                assert_eq!(duplicate_ids, vec![first.entity.id.clone()]);
            }
            other => panic!("expected DuplicateEntity, got {other:?}"),
        }

        // Nothing from the failed attempt survives.
        let rows = DynamicData::find()
            .filter(core_dynamic_data::Column::OrganizationId.eq("org-1"))
            .all(&db)
            .await?;
        assert!(rows.is_empty());

        create_test_entity(&db, "org-2", "product", "Latte", "PRD-001").await?;
        create_test_entity(&db, "org-1", "recipe", "Latte", "PRD-001").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_create_entity_validates_input() -> Result<()> {
        let db = setup_test_db().await?;
        let no_org = create_entity(&db, NewEntity::new("", "product", "Latte", "P-1")).await;
        assert!(matches!(no_org, Err(Error::Validation { .. })));
        let no_code = create_entity(&db, NewEntity::new("org-1", "product", "Latte", " ")).await;
        assert!(matches!(no_code, Err(Error::Validation { .. })));
        let blank_field = create_entity(
            &db,
            NewEntity::new("org-1", "product", "Latte", "P-1").with_field(" ", "x"),
        )
        .await;
        assert!(matches!(blank_field, Err(Error::Validation { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_field_names_with_surrounding_whitespace_are_rejected() -> Result<()> {
        let db = setup_test_db().await?;
        let padded = create_entity(
            &db,
            NewEntity::new("org-1", "product", "Latte", "P-1")
                .with_field(" price", 4.5)
                .with_field("price", 5.0),
        )
        .await;
        assert!(matches!(padded, Err(Error::Validation { ref message }) if message.contains("' price'")));
        assert!(search_entities(&db, "org-1", "P-1", None, 0).await?.is_empty());

        let entity = create_test_entity(&db, "org-1", "product", "Mocha", "P-2").await?;
        let mut fields = BTreeMap::new();
        fields.insert("price ".to_string(), FieldValue::from(5.0));
        let resolved = apply_dynamic_data_resolution(
            &db,
            "org-1",
            entity.id(),
            &fields,
            &DuplicatePolicy::default(),
        )
        .await;
        assert!(matches!(resolved, Err(Error::Validation { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_loader_keeps_order_and_skips_unknown() -> Result<()> {
        let db = setup_test_db().await?;
        let a = create_test_entity(&db, "org-1", "product", "A", "P-A").await?;
        let b = create_entity_with_fields(
            &db,
            NewEntity::new("org-1", "product", "B", "P-B").with_field("size", "large"),
        )
        .await?;
        let foreign = create_test_entity(&db, "org-2", "product", "C", "P-C").await?;

        let ids = vec![
            b.entity.id.clone(),
            "missing".to_string(),
            foreign.entity.id.clone(),
            a.entity.id.clone(),
        ];
        let loaded = load_enhanced_entities(&db, "org-1", &ids).await?;
        let names: Vec<&str> = loaded.iter().map(|e| e.entity.entity_name.as_str()).collect();
        assert_eq!(names, vec!["B", "A"]);
        assert_eq!(loaded[0].field("size"), Some(&FieldValue::from("large")));
        assert!(loaded[1].dynamic_fields.is_empty());

        assert!(load_enhanced_entities(&db, "org-1", &[]).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_update_entity_replaces_fields_and_versions_metadata() -> Result<()> {
        let db = setup_test_db().await?;
        let created = create_entity(
            &db,
            NewEntity::new("org-1", "product", "Latte", "PRD-001")
                .with_field("price", 4.5)
                .with_field("size", "medium")
                .with_metadata(NewMetadata::new("ai_reasoning", "category", json!("coffee"))),
        )
        .await?;

        let update = EntityUpdate {
            entity_name: Some("Oat Latte".to_string()),
            dynamic_fields: Some([("price".to_string(), FieldValue::from(5.0))].into()),
            metadata: vec![NewMetadata::new("ai_reasoning", "category", json!("plant"))],
            ..EntityUpdate::default()
        };
        let updated = update_entity(&db, "org-1", created.id(), update).await?;

        assert_eq!(updated.entity.entity_name, "Oat Latte");
        assert_eq!(updated.entity.entity_code, "PRD-001");
        assert_eq!(updated.field("price"), Some(&FieldValue::Number(5.0)));
        assert!(updated.field("size").is_none());
        assert_eq!(
            updated.metadata_value("ai_reasoning", "category"),
            Some(&json!("plant"))
        );

        let history =
            get_metadata_history(&db, "org-1", created.id(), "ai_reasoning", "category").await?;
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().filter(|m| m.is_active).count(), 1);

        let audit = list_transactions_for_entity(&db, "org-1", created.id()).await?;
        assert!(audit.iter().any(|t| t.transaction_type == "entity_updated"));
        Ok(())
    }

    #[tokio::test]
    async fn test_update_entity_without_fields_keeps_them() -> Result<()> {
        let db = setup_test_db().await?;
        let created = create_entity_with_fields(
            &db,
            NewEntity::new("org-1", "product", "Latte", "PRD-001").with_field("size", "medium"),
        )
        .await?;
        let update = EntityUpdate {
            entity_code: Some("PRD-002".to_string()),
            ..EntityUpdate::default()
        };
        let updated = update_entity(&db, "org-1", created.id(), update).await?;
        assert_eq!(updated.entity.entity_code, "PRD-002");
        assert_eq!(updated.field("size"), Some(&FieldValue::from("medium")));
        Ok(())
    }

    #[tokio::test]
    async fn test_update_entity_to_taken_code_fails() -> Result<()> {
        let db = setup_test_db().await?;
        let taken = create_test_entity(&db, "org-1", "product", "A", "P-1").await?;
        let other = create_test_entity(&db, "org-1", "product", "B", "P-2").await?;
        let update = EntityUpdate {
            entity_code: Some("P-1".to_string()),
            ..EntityUpdate::default()
        };
        let result = update_entity(&db, "org-1", other.id(), update).await;
        match result {
            Err(Error::DuplicateEntity { duplicate_ids, .. }) => {
                assert_eq!(duplicate_ids, vec![taken.entity.id.clone()]);
            }
            other => panic!("expected DuplicateEntity, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_entity_deactivates_relationships() -> Result<()> {
        let db = setup_test_db().await?;
        let package = create_test_entity(&db, "org-1", "package", "Pro", "PKG-1").await?;
        let module = create_test_entity(&db, "org-1", "module", "Billing", "MOD-1").await?;
        create_relationship(
            &db,
            "org-1",
            package.id(),
            module.id(),
            "package_includes_module",
            Some(json!({"since": "2024"})),
        )
        .await?;
        assert_eq!(
            get_relationships(&db, "org-1", module.id(), None).await?.len(),
            1
        );

        delete_entity(&db, "org-1", package.id()).await?;

        let reloaded = get_entity_with_enhanced_data(&db, "org-1", package.id())
            .await?
            .unwrap();
        assert!(!reloaded.entity.is_active);
        assert!(reloaded.relationships.is_empty());
        assert!(get_relationships(&db, "org-1", module.id(), None).await?.is_empty());

        let audit = list_transactions_for_entity(&db, "org-1", package.id()).await?;
        assert!(audit.iter().any(|t| t.transaction_type == "entity_deleted"));

        // Second delete is a no-op.
        delete_entity(&db, "org-1", package.id()).await?;
        let audit_again = list_transactions_for_entity(&db, "org-1", package.id()).await?;
        assert_eq!(audit.len(), audit_again.len());
        Ok(())
    }

    #[tokio::test]
    async fn test_relationship_endpoints_must_exist_in_organization() -> Result<()> {
        let db = setup_test_db().await?;
        let a = create_test_entity(&db, "org-1", "package", "Pro", "PKG-1").await?;
        let foreign = create_test_entity(&db, "org-2", "module", "Billing", "MOD-1").await?;

        let result =
            create_relationship(&db, "org-1", a.id(), foreign.id(), "includes", None).await;
        assert!(matches!(result, Err(Error::EntityNotFound { ref id }) if id == foreign.id()));

        let blank = create_relationship(&db, "org-1", a.id(), a.id(), " ", None).await;
        assert!(matches!(blank, Err(Error::Validation { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_relationships_filter_and_deactivate() -> Result<()> {
        let db = setup_test_db().await?;
        let a = create_test_entity(&db, "org-1", "package", "Pro", "PKG-1").await?;
        let b = create_test_entity(&db, "org-1", "module", "Billing", "MOD-1").await?;
        let includes = create_relationship(&db, "org-1", a.id(), b.id(), "includes", None).await?;
        create_relationship(&db, "org-1", b.id(), a.id(), "depends_on", None).await?;

        let loaded = get_entity_with_enhanced_data(&db, "org-1", a.id()).await?.unwrap();
        assert_eq!(loaded.relationships.len(), 2);

        let only_includes = get_relationships(&db, "org-1", a.id(), Some("includes")).await?;
        assert_eq!(only_includes, vec![includes.clone()]);

        deactivate_relationship(&db, "org-1", &includes.id).await?;
        assert!(
            get_relationships(&db, "org-1", a.id(), Some("includes"))
                .await?
                .is_empty()
        );

        let wrong_org = deactivate_relationship(&db, "org-2", &includes.id).await;
        assert!(matches!(wrong_org, Err(Error::RelationshipNotFound { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_search_entities() -> Result<()> {
        let db = setup_test_db().await?;
        create_test_entity(&db, "org-1", "product", "Oat Latte", "PRD-002").await?;
        create_test_entity(&db, "org-1", "product", "Americano", "PRD-001").await?;
        create_test_entity(&db, "org-1", "recipe", "Latte Base", "RCP-001").await?;
        let gone = create_test_entity(&db, "org-1", "product", "Latte Old", "PRD-009").await?;
        delete_entity(&db, "org-1", gone.id()).await?;
        create_test_entity(&db, "org-2", "product", "Latte", "PRD-001").await?;

        let found = search_entities(&db, "org-1", "LATTE", None, 50).await?;
        let names: Vec<&str> = found.iter().map(|e| e.entity_name.as_str()).collect();
        assert_eq!(names, vec!["Latte Base", "Oat Latte"]);

        let products = search_entities(&db, "org-1", "prd-00", Some("product"), 50).await?;
        let names: Vec<&str> = products.iter().map(|e| e.entity_name.as_str()).collect();
        assert_eq!(names, vec!["Americano", "Oat Latte"]);

        let capped = search_entities(&db, "org-1", "", None, 1).await?;
        assert_eq!(capped.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_search_folds_unicode_and_treats_wildcards_literally() -> Result<()> {
        let db = setup_test_db().await?;
        create_test_entity(&db, "org-1", "product", "CAFÉ CRÈME", "PRD-001").await?;
        create_test_entity(&db, "org-1", "product", "Flat White", "PRD_002").await?;

        let found = search_entities(&db, "org-1", "café crème", None, 0).await?;
        let names: Vec<&str> = found.iter().map(|e| e.entity_name.as_str()).collect();
        assert_eq!(names, vec!["CAFÉ CRÈME"]);

        let underscore = search_entities(&db, "org-1", "prd_", None, 0).await?;
        let names: Vec<&str> = underscore.iter().map(|e| e.entity_name.as_str()).collect();
        assert_eq!(names, vec!["Flat White"]);

        assert!(search_entities(&db, "org-1", "%", None, 0).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_apply_dynamic_data_resolution() -> Result<()> {
        let db = setup_test_db().await?;
        let product = create_entity_with_fields(
            &db,
            NewEntity::new("org-1", "product", "Latte", "PRD-001")
                .with_field("price", "10")
                .with_field("size", "medium")
                .with_field("vegan", true),
        )
        .await?;

        let proposed: BTreeMap<String, FieldValue> = [
            ("price".to_string(), FieldValue::from("12")),
            ("size".to_string(), FieldValue::from("large")),
            ("vegan".to_string(), FieldValue::from(true)),
            ("origin".to_string(), FieldValue::from("Brazil")),
        ]
        .into();
        let resolution = apply_dynamic_data_resolution(
            &db,
            "org-1",
            product.id(),
            &proposed,
            &DuplicatePolicy::default(),
        )
        .await?;

        assert_eq!(resolution.versioned, vec!["price".to_string()]);
        assert_eq!(resolution.updated, vec!["size".to_string()]);
        assert_eq!(resolution.unchanged, vec!["vegan".to_string()]);
        assert_eq!(resolution.inserted, vec!["origin".to_string()]);

        let reloaded = get_entity_with_enhanced_data(&db, "org-1", product.id())
            .await?
            .unwrap();
        assert_eq!(reloaded.field("price"), Some(&FieldValue::from("12")));
        assert_eq!(reloaded.field("origin"), Some(&FieldValue::from("Brazil")));
        let archived = reloaded
            .metadata_value(FIELD_VERSION_METADATA, "price")
            .unwrap();
        assert_eq!(archived["value"], json!("10"));
        Ok(())
    }
}
