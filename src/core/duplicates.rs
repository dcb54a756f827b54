//! Duplicate prevention - advisory conflict checks that run before writes.
//!
//! Each check queries existing rows of the calling organization and returns a
//! [`DuplicateCheckResult`] carrying a disposition: `allow`, `reject`, `merge`,
//! `update` or `manual_review`. The checks never block a write themselves. Hard
//! uniqueness (entity codes, transaction numbers, dynamic field names) is enforced by
//! unique indexes created in [`crate::config::database`]; these checks are the fast
//! path that lets callers explain a collision before the database refuses it.

use crate::{
    core::metadata,
    entities::{
        CoreEntity, DynamicData, Metadata, UniversalTransaction, core_dynamic_data, core_entity,
        core_metadata, universal_transaction,
    },
    errors::{Result, ensure_organization},
    models::{FieldValue, NewEntity, NewMetadata},
};
use sea_orm::{ConnectionTrait, QuerySelect, QueryTrait, TransactionTrait, prelude::*};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, instrument, warn};

/// Fields whose changes are historically significant and get versioned instead of
/// overwritten.
pub const DEFAULT_VERSIONED_FIELDS: &[&str] = &[
    "price",
    "unit_price",
    "cost",
    "unit_cost",
    "salary",
    "rate",
    "hourly_rate",
    "tax_rate",
    "exchange_rate",
    "discount",
    "credit_limit",
];

/// Most similar names listed in a fuzzy name check hint.
const NAME_MATCH_LIMIT: usize = 25;

/// Advisory disposition of a duplicate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreventionAction {
    /// No conflict
    Allow,
    /// Field-level collision; the new value should overwrite
    Update,
    /// Ambiguous collision that needs a human
    ManualReview,
    /// Same real-world entity under a different code
    Merge,
    /// Hard collision; the caller must not proceed
    Reject,
}

impl PreventionAction {
    /// Ordering used to pick the most severe result.
    #[must_use]
    pub const fn severity(self) -> u8 {
        match self {
            Self::Allow => 0,
            Self::Update => 1,
            Self::ManualReview => 2,
            Self::Merge => 3,
            Self::Reject => 4,
        }
    }
}

/// Which kind of collision was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateType {
    /// Same `entity_code` within organization and type
    EntityCode,
    /// Same business key (email, phone, tax id, ...)
    BusinessRule,
    /// Same name, case-insensitively
    EntityName,
    /// Field already present on the entity
    DynamicField,
    /// Active metadata already present for the key
    Metadata,
    /// Same transaction number within organization and type
    TransactionNumber,
}

/// What to do with one colliding dynamic field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldAction {
    /// Values are identical, nothing to write
    KeepExisting,
    /// Archive the old value, then overwrite
    CreateVersion,
    /// Overwrite
    Update,
}

/// A dynamic field that already exists on the entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCollision {
    /// Field name
    pub field_name: String,
    /// Id of the existing row
    pub existing_id: String,
    /// Stored value
    pub existing_value: FieldValue,
    /// Proposed value
    pub new_value: FieldValue,
    /// Recommended action
    pub action: FieldAction,
}

/// Result of any duplicate check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCheckResult {
    /// Whether anything collided
    pub has_duplicates: bool,
    /// Kind of the collision that decided the disposition
    pub duplicate_type: Option<DuplicateType>,
    /// Ids of the colliding rows
    pub duplicate_ids: Vec<String>,
    /// Names of the colliding fields
    pub duplicate_fields: Vec<String>,
    /// Per-field detail for dynamic data checks
    pub field_collisions: Vec<FieldCollision>,
    /// Advisory disposition
    pub prevention_action: PreventionAction,
    /// Human readable explanation
    pub message: Option<String>,
    /// Ways to resolve the collision
    pub suggestions: Vec<String>,
}

impl DuplicateCheckResult {
    /// No collision.
    #[must_use]
    pub const fn allow() -> Self {
        Self {
            has_duplicates: false,
            duplicate_type: None,
            duplicate_ids: Vec::new(),
            duplicate_fields: Vec::new(),
            field_collisions: Vec::new(),
            prevention_action: PreventionAction::Allow,
            message: None,
            suggestions: Vec::new(),
        }
    }

    fn found(
        duplicate_type: DuplicateType,
        prevention_action: PreventionAction,
        duplicate_ids: Vec<String>,
        message: String,
    ) -> Self {
        Self {
            has_duplicates: true,
            duplicate_type: Some(duplicate_type),
            duplicate_ids,
            prevention_action,
            message: Some(message),
            ..Self::allow()
        }
    }

    #[must_use]
    fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = suggestions;
        self
    }

    /// True when the caller must not proceed.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        self.prevention_action == PreventionAction::Reject
    }
}

/// Tunables for duplicate checks, loaded from the `[duplicates]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplicatePolicy {
    /// Fields whose changes are versioned rather than overwritten
    pub versioned_fields: Vec<String>,
}

impl Default for DuplicatePolicy {
    fn default() -> Self {
        Self {
            versioned_fields: DEFAULT_VERSIONED_FIELDS
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

impl DuplicatePolicy {
    /// Whether changes to this field should be versioned.
    #[must_use]
    pub fn is_versioned(&self, field_name: &str) -> bool {
        self.versioned_fields.iter().any(|f| f == field_name)
    }
}

/// How business key values are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyNormalization {
    /// Trimmed, lowercased
    CaseInsensitive,
    /// Digits only (phone numbers)
    Digits,
}

impl KeyNormalization {
    fn apply(self, value: &str) -> String {
        match self {
            Self::CaseInsensitive => value.trim().to_lowercase(),
            Self::Digits => value.chars().filter(char::is_ascii_digit).collect(),
        }
    }
}

/// A dynamic field that identifies a real-world entity of some type.
#[derive(Debug, Clone, Copy)]
struct BusinessKey {
    field: &'static str,
    action: PreventionAction,
    normalization: KeyNormalization,
}

const fn key(
    field: &'static str,
    action: PreventionAction,
    normalization: KeyNormalization,
) -> BusinessKey {
    BusinessKey {
        field,
        action,
        normalization,
    }
}

const CUSTOMER_KEYS: &[BusinessKey] = &[
    key("email", PreventionAction::Merge, KeyNormalization::CaseInsensitive),
    key("phone", PreventionAction::Merge, KeyNormalization::Digits),
    key("tax_id", PreventionAction::Reject, KeyNormalization::CaseInsensitive),
];

const PRODUCT_KEYS: &[BusinessKey] = &[
    key("product_code", PreventionAction::Reject, KeyNormalization::CaseInsensitive),
    key("sku", PreventionAction::Reject, KeyNormalization::CaseInsensitive),
    key("barcode", PreventionAction::Reject, KeyNormalization::Digits),
];

const EMPLOYEE_KEYS: &[BusinessKey] = &[
    key("employee_id", PreventionAction::Reject, KeyNormalization::CaseInsensitive),
    key("national_id", PreventionAction::Reject, KeyNormalization::CaseInsensitive),
];

/// Business rules that apply to an entity type.
enum BusinessRules {
    Keys(&'static [BusinessKey]),
    TransactionNumber(&'static str),
    None,
}

fn business_rules(entity_type: &str) -> BusinessRules {
    match entity_type {
        "customer" | "client" => BusinessRules::Keys(CUSTOMER_KEYS),
        "product" => BusinessRules::Keys(PRODUCT_KEYS),
        "employee" => BusinessRules::Keys(EMPLOYEE_KEYS),
        "invoice" => BusinessRules::TransactionNumber("invoice"),
        _ => BusinessRules::None,
    }
}

fn all_business_keys() -> impl Iterator<Item = &'static BusinessKey> {
    CUSTOMER_KEYS
        .iter()
        .chain(PRODUCT_KEYS)
        .chain(EMPLOYEE_KEYS)
}

/// Checks a proposed entity for code, business-key and name collisions.
///
/// The three checks run concurrently. The most severe result wins; suggestions
/// from every check are merged without repeats.
#[instrument(skip(db, entity_data), fields(code = %entity_data.entity_code))]
pub async fn check_entity_duplicates<C>(
    db: &C,
    organization_id: &str,
    entity_type: &str,
    entity_data: &NewEntity,
) -> Result<DuplicateCheckResult>
where
    C: ConnectionTrait,
{
    ensure_organization(organization_id)?;

    let (code, business, name) = tokio::try_join!(
        check_entity_code(db, organization_id, entity_type, &entity_data.entity_code),
        check_business_rules(db, organization_id, entity_type, entity_data),
        check_entity_name(db, organization_id, entity_type, &entity_data.entity_name),
    )?;

    let result = most_severe(vec![code, business, name]);
    if result.has_duplicates {
        info!(
            "Entity duplicate check for {} '{}' in {}: {:?}",
            entity_type, entity_data.entity_code, organization_id, result.prevention_action
        );
    }
    Ok(result)
}

fn most_severe(results: Vec<DuplicateCheckResult>) -> DuplicateCheckResult {
    let mut suggestions: Vec<String> = Vec::new();
    for suggestion in results.iter().flat_map(|r| r.suggestions.iter()) {
        if !suggestions.contains(suggestion) {
            suggestions.push(suggestion.clone());
        }
    }

    let mut winner = DuplicateCheckResult::allow();
    for result in results {
        if result.prevention_action.severity() > winner.prevention_action.severity() {
            winner = result;
        }
    }
    winner.suggestions = suggestions;
    winner
}

async fn check_entity_code<C>(
    db: &C,
    organization_id: &str,
    entity_type: &str,
    entity_code: &str,
) -> Result<DuplicateCheckResult>
where
    C: ConnectionTrait,
{
    let entity_code = entity_code.trim();
    if entity_code.is_empty() {
        return Ok(DuplicateCheckResult::allow());
    }

    let existing = CoreEntity::find()
        .filter(core_entity::Column::OrganizationId.eq(organization_id))
        .filter(core_entity::Column::EntityType.eq(entity_type))
        .filter(core_entity::Column::EntityCode.eq(entity_code))
        .all(db)
        .await?;
    if existing.is_empty() {
        return Ok(DuplicateCheckResult::allow());
    }

    let siblings: Vec<String> = CoreEntity::find()
        .select_only()
        .column(core_entity::Column::EntityCode)
        .filter(core_entity::Column::OrganizationId.eq(organization_id))
        .filter(core_entity::Column::EntityType.eq(entity_type))
        .filter(core_entity::Column::EntityCode.starts_with(entity_code))
        .into_tuple()
        .all(db)
        .await?;

    let inactive = existing.iter().any(|e| !e.is_active);
    let mut suggestions = vec![format!(
        "Use a unique entity code such as '{}'",
        next_free_suffix(entity_code, &siblings)
    )];
    suggestions.push(if inactive {
        format!("Reactivate the deleted {entity_type} '{entity_code}' instead of creating a new one")
    } else {
        format!("Update the existing {entity_type} '{entity_code}' instead of creating a new one")
    });

    Ok(DuplicateCheckResult::found(
        DuplicateType::EntityCode,
        PreventionAction::Reject,
        existing.into_iter().map(|e| e.id).collect(),
        format!("Entity code '{entity_code}' is already used by a {entity_type} in this organization"),
    )
    .with_suggestions(suggestions))
}

async fn check_business_rules<C>(
    db: &C,
    organization_id: &str,
    entity_type: &str,
    entity_data: &NewEntity,
) -> Result<DuplicateCheckResult>
where
    C: ConnectionTrait,
{
    match business_rules(entity_type) {
        BusinessRules::Keys(keys) => {
            check_business_keys(db, organization_id, entity_type, entity_data, keys).await
        }
        BusinessRules::TransactionNumber(transaction_type) => {
            let number = entity_data
                .dynamic_fields
                .get("invoice_number")
                .map_or_else(|| entity_data.entity_code.clone(), FieldValue::to_storage);
            let mut result =
                check_transaction_duplicates(db, organization_id, transaction_type, &number)
                    .await?;
            if result.has_duplicates {
                result.duplicate_type = Some(DuplicateType::BusinessRule);
            }
            Ok(result)
        }
        BusinessRules::None => Ok(DuplicateCheckResult::allow()),
    }
}

async fn check_business_keys<C>(
    db: &C,
    organization_id: &str,
    entity_type: &str,
    entity_data: &NewEntity,
    keys: &[BusinessKey],
) -> Result<DuplicateCheckResult>
where
    C: ConnectionTrait,
{
    let mut duplicate_ids: Vec<String> = Vec::new();
    let mut duplicate_fields = Vec::new();
    let mut action = PreventionAction::Allow;

    // Each key is checked on its own; ids are unioned across keys.
    for business_key in keys {
        let Some(value) = entity_data.dynamic_fields.get(business_key.field) else {
            continue;
        };
        let wanted = business_key.normalization.apply(&value.to_storage());
        if wanted.is_empty() {
            continue;
        }

        let active_ids = CoreEntity::find()
            .select_only()
            .column(core_entity::Column::Id)
            .filter(core_entity::Column::OrganizationId.eq(organization_id))
            .filter(core_entity::Column::EntityType.eq(entity_type))
            .filter(core_entity::Column::IsActive.eq(true))
            .into_query();
        let candidates = DynamicData::find()
            .filter(core_dynamic_data::Column::OrganizationId.eq(organization_id))
            .filter(core_dynamic_data::Column::FieldName.eq(business_key.field))
            .filter(core_dynamic_data::Column::EntityId.in_subquery(active_ids))
            .all(db)
            .await?;

        let matches: Vec<String> = candidates
            .into_iter()
            .filter(|row| business_key.normalization.apply(&row.field_value) == wanted)
            .map(|row| row.entity_id)
            .collect();
        if matches.is_empty() {
            continue;
        }

        debug!(
            "Business key '{}' matched {} existing {}(s)",
            business_key.field,
            matches.len(),
            entity_type
        );
        duplicate_fields.push(business_key.field.to_string());
        if business_key.action.severity() > action.severity() {
            action = business_key.action;
        }
        for id in matches {
            if !duplicate_ids.contains(&id) {
                duplicate_ids.push(id);
            }
        }
    }

    if duplicate_ids.is_empty() {
        return Ok(DuplicateCheckResult::allow());
    }

    let fields = duplicate_fields.join(", ");
    let suggestions = if action == PreventionAction::Merge {
        vec![
            format!("Merge with the existing {entity_type} that shares {fields}"),
            "Confirm the contact details belong to a different real-world entity".to_string(),
        ]
    } else {
        vec![format!(
            "A {entity_type} with the same {fields} already exists; update it instead"
        )]
    };
    let mut result = DuplicateCheckResult::found(
        DuplicateType::BusinessRule,
        action,
        duplicate_ids,
        format!("Another {entity_type} in this organization has the same {fields}"),
    )
    .with_suggestions(suggestions);
    result.duplicate_fields = duplicate_fields;
    Ok(result)
}

async fn check_entity_name<C>(
    db: &C,
    organization_id: &str,
    entity_type: &str,
    entity_name: &str,
) -> Result<DuplicateCheckResult>
where
    C: ConnectionTrait,
{
    let needle = entity_name.trim().to_lowercase();
    if needle.is_empty() {
        return Ok(DuplicateCheckResult::allow());
    }

    // Case folding happens here rather than in SQL: SQLite only folds ASCII, and
    // a LIMIT before the exact comparison could drop the exact match.
    let names: Vec<(String, String, String)> = CoreEntity::find()
        .select_only()
        .columns([
            core_entity::Column::Id,
            core_entity::Column::EntityName,
            core_entity::Column::EntityCode,
        ])
        .filter(core_entity::Column::OrganizationId.eq(organization_id))
        .filter(core_entity::Column::EntityType.eq(entity_type))
        .filter(core_entity::Column::IsActive.eq(true))
        .into_tuple()
        .all(db)
        .await?;

    let (exact, similar): (Vec<_>, Vec<_>) = names
        .into_iter()
        .filter(|(_, name, _)| name.to_lowercase().contains(&needle))
        .partition(|(_, name, _)| name.trim().to_lowercase() == needle);

    if exact.is_empty() {
        // Partial matches are surfaced as hints only; they never escalate.
        if similar.is_empty() {
            return Ok(DuplicateCheckResult::allow());
        }
        let listed: Vec<&str> = similar
            .iter()
            .take(NAME_MATCH_LIMIT)
            .map(|(_, name, _)| name.as_str())
            .collect();
        let mut result = DuplicateCheckResult::allow();
        result.suggestions = vec![format!("Similar names already exist: {}", listed.join(", "))];
        return Ok(result);
    }

    let suggestions = exact
        .iter()
        .map(|(_, name, code)| {
            format!("Review the existing {entity_type} '{name}' ({code}) before creating another")
        })
        .collect();
    Ok(DuplicateCheckResult::found(
        DuplicateType::EntityName,
        PreventionAction::ManualReview,
        exact.into_iter().map(|(id, _, _)| id).collect(),
        format!("A {entity_type} named '{}' already exists", entity_name.trim()),
    )
    .with_suggestions(suggestions))
}

/// Checks proposed dynamic fields against the fields already stored on an entity.
///
/// Identical values keep the existing row, fields listed in the policy get a new
/// version, everything else is overwritten. Any collision yields `update`.
#[instrument(skip(db, fields, policy))]
pub async fn check_dynamic_data_duplicates<C>(
    db: &C,
    organization_id: &str,
    entity_id: &str,
    fields: &BTreeMap<String, FieldValue>,
    policy: &DuplicatePolicy,
) -> Result<DuplicateCheckResult>
where
    C: ConnectionTrait,
{
    ensure_organization(organization_id)?;
    if fields.is_empty() {
        return Ok(DuplicateCheckResult::allow());
    }

    let existing: HashMap<String, core_dynamic_data::Model> = DynamicData::find()
        .filter(core_dynamic_data::Column::OrganizationId.eq(organization_id))
        .filter(core_dynamic_data::Column::EntityId.eq(entity_id))
        .filter(core_dynamic_data::Column::FieldName.is_in(fields.keys().cloned()))
        .all(db)
        .await?
        .into_iter()
        .map(|row| (row.field_name.clone(), row))
        .collect();

    let collisions: Vec<FieldCollision> = fields
        .iter()
        .filter_map(|(name, new_value)| {
            let row = existing.get(name)?;
            let action = if row.field_value == new_value.to_storage() {
                FieldAction::KeepExisting
            } else if policy.is_versioned(name) {
                FieldAction::CreateVersion
            } else {
                FieldAction::Update
            };
            Some(FieldCollision {
                field_name: name.clone(),
                existing_id: row.id.clone(),
                existing_value: FieldValue::from_storage(&row.field_value, &row.field_type),
                new_value: new_value.clone(),
                action,
            })
        })
        .collect();

    if collisions.is_empty() {
        return Ok(DuplicateCheckResult::allow());
    }

    let mut suggestions = Vec::new();
    if collisions.iter().any(|c| c.action == FieldAction::CreateVersion) {
        suggestions.push("Archive the previous values of versioned fields before overwriting".to_string());
    }
    if collisions.iter().any(|c| c.action == FieldAction::KeepExisting) {
        suggestions.push("Skip fields whose values are unchanged".to_string());
    }

    let mut result = DuplicateCheckResult::found(
        DuplicateType::DynamicField,
        PreventionAction::Update,
        collisions.iter().map(|c| c.existing_id.clone()).collect(),
        format!("{} field(s) already exist on entity {entity_id}", collisions.len()),
    )
    .with_suggestions(suggestions);
    result.duplicate_fields = collisions.iter().map(|c| c.field_name.clone()).collect();
    result.field_collisions = collisions;
    Ok(result)
}

/// Checks for an active metadata row with the same entity, type and key.
#[instrument(skip(db, metadata), fields(metadata_type = %metadata.metadata_type, metadata_key = %metadata.metadata_key))]
pub async fn check_metadata_duplicates<C>(
    db: &C,
    organization_id: &str,
    entity_type: &str,
    entity_id: &str,
    metadata: &NewMetadata,
) -> Result<DuplicateCheckResult>
where
    C: ConnectionTrait,
{
    ensure_organization(organization_id)?;

    let active = Metadata::find()
        .filter(core_metadata::Column::OrganizationId.eq(organization_id))
        .filter(core_metadata::Column::EntityType.eq(entity_type))
        .filter(core_metadata::Column::EntityId.eq(entity_id))
        .filter(core_metadata::Column::MetadataType.eq(metadata.metadata_type.as_str()))
        .filter(core_metadata::Column::MetadataKey.eq(metadata.metadata_key.as_str()))
        .filter(core_metadata::Column::IsActive.eq(true))
        .all(db)
        .await?;
    if active.is_empty() {
        return Ok(DuplicateCheckResult::allow());
    }

    let unchanged = active
        .iter()
        .any(|row| row.metadata_value == metadata.metadata_value);
    let mut suggestions =
        vec!["Deactivate the current version and insert the new value".to_string()];
    if unchanged {
        suggestions.push("The active version already holds this value".to_string());
    }

    let mut result = DuplicateCheckResult::found(
        DuplicateType::Metadata,
        PreventionAction::Update,
        active.into_iter().map(|row| row.id).collect(),
        format!(
            "Active metadata '{}.{}' already exists for entity {entity_id}",
            metadata.metadata_type, metadata.metadata_key
        ),
    )
    .with_suggestions(suggestions);
    result.duplicate_fields = vec![metadata.metadata_key.clone()];
    Ok(result)
}

/// Writes a metadata value so that exactly one active row remains for its key.
///
/// Active rows for the key are deactivated (`is_active = false`, `effective_to = now`)
/// and the new row is inserted, inside one database transaction.
#[instrument(skip(db, metadata), fields(metadata_type = %metadata.metadata_type, metadata_key = %metadata.metadata_key))]
pub async fn prevent_duplicate_metadata<C>(
    db: &C,
    organization_id: &str,
    entity_type: &str,
    entity_id: &str,
    metadata: &NewMetadata,
) -> Result<core_metadata::Model>
where
    C: ConnectionTrait + TransactionTrait,
{
    ensure_organization(organization_id)?;
    let txn = db.begin().await?;
    let row =
        metadata::supersede_metadata(&txn, organization_id, entity_type, entity_id, metadata)
            .await?;
    txn.commit().await?;
    Ok(row)
}

/// Checks whether a transaction number is already used for the organization and type.
#[instrument(skip(db))]
pub async fn check_transaction_duplicates<C>(
    db: &C,
    organization_id: &str,
    transaction_type: &str,
    transaction_number: &str,
) -> Result<DuplicateCheckResult>
where
    C: ConnectionTrait,
{
    ensure_organization(organization_id)?;
    let transaction_number = transaction_number.trim();
    if transaction_number.is_empty() {
        return Ok(DuplicateCheckResult::allow());
    }

    let existing = UniversalTransaction::find()
        .filter(universal_transaction::Column::OrganizationId.eq(organization_id))
        .filter(universal_transaction::Column::TransactionType.eq(transaction_type))
        .filter(universal_transaction::Column::TransactionNumber.eq(transaction_number))
        .all(db)
        .await?;
    if existing.is_empty() {
        return Ok(DuplicateCheckResult::allow());
    }

    let stem = transaction_number.trim_end_matches(|c: char| c.is_ascii_digit());
    let siblings: Vec<String> = UniversalTransaction::find()
        .select_only()
        .column(universal_transaction::Column::TransactionNumber)
        .filter(universal_transaction::Column::OrganizationId.eq(organization_id))
        .filter(universal_transaction::Column::TransactionType.eq(transaction_type))
        .filter(universal_transaction::Column::TransactionNumber.starts_with(stem))
        .into_tuple()
        .all(db)
        .await?;

    let mut suggestions = Vec::new();
    if let Some(next) = next_sequence_number(transaction_number, &siblings) {
        suggestions.push(format!("Use the next sequence number '{next}'"));
    }
    suggestions.push(format!(
        "Add a suffix such as '{}'",
        next_free_suffix(transaction_number, &siblings)
    ));

    Ok(DuplicateCheckResult::found(
        DuplicateType::TransactionNumber,
        PreventionAction::Reject,
        existing.into_iter().map(|t| t.id).collect(),
        format!("Transaction number '{transaction_number}' is already used for {transaction_type}"),
    )
    .with_suggestions(suggestions))
}

/// Next number after the highest one sharing `number`'s non-digit stem, keeping the
/// zero padding. `None` when `number` has no trailing digits or the sequence is
/// exhausted.
#[must_use]
pub fn next_sequence_number(number: &str, existing: &[String]) -> Option<String> {
    let stem = number.trim_end_matches(|c: char| c.is_ascii_digit());
    let digits = &number[stem.len()..];
    if digits.is_empty() {
        return None;
    }
    let width = digits.len();
    let highest = existing
        .iter()
        .filter_map(|n| n.strip_prefix(stem))
        .filter(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
        .filter_map(|rest| rest.parse::<u64>().ok())
        .chain(digits.parse::<u64>().ok())
        .max()?;
    let next = highest.checked_add(1)?;
    Some(format!("{stem}{next:0width$}"))
}

/// First `{base}-{n}` (n from 2) not present in `existing`.
#[must_use]
pub fn next_free_suffix(base: &str, existing: &[String]) -> String {
    let taken: BTreeSet<&str> = existing.iter().map(String::as_str).collect();
    (2..)
        .map(|n| format!("{base}-{n}"))
        .find(|candidate| !taken.contains(candidate.as_str()))
        .unwrap_or_else(|| format!("{base}-{}", existing.len() + 2))
}

/// How bad a recurring duplicate is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateSeverity {
    /// Two occurrences
    Low,
    /// Three or four
    Medium,
    /// Five to nine, or any duplicated legal identifier or transaction number
    High,
    /// Ten or more
    Critical,
}

impl DuplicateSeverity {
    /// Severity for a number of rows sharing one key.
    #[must_use]
    pub const fn from_occurrences(occurrences: usize) -> Self {
        match occurrences {
            0..=2 => Self::Low,
            3..=4 => Self::Medium,
            5..=9 => Self::High,
            _ => Self::Critical,
        }
    }
}

/// Kind of recurring duplicate found by the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePatternType {
    /// Active entities of one type sharing a name
    EntityName,
    /// Entity codes differing only by case
    EntityCode,
    /// Active entities sharing a business key value
    BusinessKey,
    /// More than one active metadata row for a key
    ActiveMetadata,
    /// Transaction numbers used more than once
    TransactionNumber,
}

/// One recurring duplicate in an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicatePattern {
    /// Kind of duplicate
    pub pattern_type: DuplicatePatternType,
    /// Entity or transaction type the rows belong to
    pub entity_type: Option<String>,
    /// Shared key, e.g. `"email=ops@acme.test"`
    pub key: String,
    /// Number of rows sharing the key
    pub occurrences: usize,
    /// Ids of those rows
    pub affected_ids: Vec<String>,
    /// Severity derived from the count and kind
    pub severity: DuplicateSeverity,
}

#[derive(Default)]
struct PatternCollector {
    groups: BTreeMap<(DuplicatePatternType, Option<String>, String), Vec<String>>,
}

impl PatternCollector {
    fn add(&mut self, kind: DuplicatePatternType, scope: Option<&str>, key: String, id: String) {
        self.groups
            .entry((kind, scope.map(ToString::to_string), key))
            .or_default()
            .push(id);
    }

    fn into_patterns(self) -> Vec<DuplicatePattern> {
        let hard_keys: Vec<&str> = all_business_keys()
            .filter(|k| k.action == PreventionAction::Reject)
            .map(|k| k.field)
            .collect();

        let mut patterns: Vec<DuplicatePattern> = self
            .groups
            .into_iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|((pattern_type, entity_type, key), affected_ids)| {
                let mut severity = DuplicateSeverity::from_occurrences(affected_ids.len());
                let hard = match pattern_type {
                    DuplicatePatternType::TransactionNumber => true,
                    DuplicatePatternType::BusinessKey => hard_keys
                        .iter()
                        .any(|field| key.starts_with(&format!("{field}="))),
                    _ => false,
                };
                if hard {
                    severity = severity.max(DuplicateSeverity::High);
                }
                DuplicatePattern {
                    pattern_type,
                    entity_type,
                    key,
                    occurrences: affected_ids.len(),
                    affected_ids,
                    severity,
                }
            })
            .collect();
        patterns.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(b.occurrences.cmp(&a.occurrences))
                .then(a.key.cmp(&b.key))
        });
        patterns
    }
}

/// Scans an organization for recurring duplicates and rates their severity.
///
/// Looks at active entity names, case-variant entity codes, business key values,
/// metadata keys with more than one active row, and reused transaction numbers.
#[instrument(skip(db))]
pub async fn monitor_duplicate_patterns<C>(
    db: &C,
    organization_id: &str,
) -> Result<Vec<DuplicatePattern>>
where
    C: ConnectionTrait,
{
    ensure_organization(organization_id)?;
    let mut collector = PatternCollector::default();

    let entities = CoreEntity::find()
        .filter(core_entity::Column::OrganizationId.eq(organization_id))
        .filter(core_entity::Column::IsActive.eq(true))
        .all(db)
        .await?;
    let mut entity_types: HashMap<&str, &str> = HashMap::new();
    for entity in &entities {
        entity_types.insert(&entity.id, &entity.entity_type);
        collector.add(
            DuplicatePatternType::EntityName,
            Some(entity.entity_type.as_str()),
            entity.entity_name.trim().to_lowercase(),
            entity.id.clone(),
        );
        collector.add(
            DuplicatePatternType::EntityCode,
            Some(entity.entity_type.as_str()),
            entity.entity_code.trim().to_lowercase(),
            entity.id.clone(),
        );
    }

    let key_fields: Vec<&str> = all_business_keys().map(|k| k.field).collect();
    let key_rows = DynamicData::find()
        .filter(core_dynamic_data::Column::OrganizationId.eq(organization_id))
        .filter(core_dynamic_data::Column::FieldName.is_in(key_fields))
        .all(db)
        .await?;
    for row in key_rows {
        let Some(entity_type) = entity_types.get(row.entity_id.as_str()) else {
            continue;
        };
        let Some(business_key) = all_business_keys().find(|k| k.field == row.field_name) else {
            continue;
        };
        let value = business_key.normalization.apply(&row.field_value);
        if value.is_empty() {
            continue;
        }
        collector.add(
            DuplicatePatternType::BusinessKey,
            Some(*entity_type),
            format!("{}={value}", row.field_name),
            row.entity_id,
        );
    }

    let active_metadata = Metadata::find()
        .filter(core_metadata::Column::OrganizationId.eq(organization_id))
        .filter(core_metadata::Column::IsActive.eq(true))
        .all(db)
        .await?;
    for row in active_metadata {
        collector.add(
            DuplicatePatternType::ActiveMetadata,
            Some(row.entity_type.as_str()),
            format!("{}:{}.{}", row.entity_id, row.metadata_type, row.metadata_key),
            row.id,
        );
    }

    let transactions: Vec<(String, String, String)> = UniversalTransaction::find()
        .select_only()
        .column(universal_transaction::Column::Id)
        .column(universal_transaction::Column::TransactionType)
        .column(universal_transaction::Column::TransactionNumber)
        .filter(universal_transaction::Column::OrganizationId.eq(organization_id))
        .into_tuple()
        .all(db)
        .await?;
    for (id, transaction_type, number) in transactions {
        collector.add(
            DuplicatePatternType::TransactionNumber,
            Some(transaction_type.as_str()),
            number,
            id,
        );
    }

    let patterns = collector.into_patterns();
    if patterns.is_empty() {
        debug!("No duplicate patterns found for {}", organization_id);
    } else {
        warn!(
            "Found {} duplicate pattern(s) for {}",
            patterns.len(),
            organization_id
        );
    }
    Ok(patterns)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::entities::DynamicDataModel;
    use crate::test_utils::*;
    use sea_orm::{DatabaseBackend, MockDatabase, Set};
    use serde_json::json;

    #[tokio::test]
    async fn test_checks_require_organization() {
        let db = MockDatabase::new(DatabaseBackend::Sqlite).into_connection();
        let data = NewEntity::new("", "product", "Latte", "PRD-001");

        let result = check_entity_duplicates(&db, "", "product", &data).await;
        assert!(matches!(result, Err(crate::errors::Error::Validation { .. })));

        let result = check_transaction_duplicates(&db, " ", "invoice", "INV-1").await;
        assert!(matches!(result, Err(crate::errors::Error::Validation { .. })));

        let result = monitor_duplicate_patterns(&db, "").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_entity_code_collision_is_tenant_scoped() -> Result<()> {
        let db = setup_test_db().await?;
        let first = create_test_entity(&db, "org-1", "product", "Latte", "PRD-001").await?;

        let again = NewEntity::new("org-1", "product", "Latte", "PRD-001");
        let result = check_entity_duplicates(&db, "org-1", "product", &again).await?;
        assert_eq!(result.prevention_action, PreventionAction::Reject);
        assert_eq!(result.duplicate_type, Some(DuplicateType::EntityCode));
        assert!(result.duplicate_ids.contains(&first.entity.id));
        assert!(result.is_rejected());
        assert!(
            result
                .suggestions
                .contains(&"Use a unique entity code such as 'PRD-001-2'".to_string())
        );

        let other_org = NewEntity::new("org-2", "product", "Latte", "PRD-001");
        let result = check_entity_duplicates(&db, "org-2", "product", &other_org).await?;
        assert_eq!(result.prevention_action, PreventionAction::Allow);
        assert!(!result.has_duplicates);
        Ok(())
    }

    #[tokio::test]
    async fn test_customer_email_collision_suggests_merge() -> Result<()> {
        let db = setup_test_db().await?;
        let existing = create_entity_with_fields(
            &db,
            NewEntity::new("org-1", "customer", "Acme Ltd", "CUST-001")
                .with_field("email", "Ops@Acme.test"),
        )
        .await?;

        let incoming = NewEntity::new("org-1", "customer", "Acme Trading", "CUST-777")
            .with_field("email", " ops@acme.test ");
        let result = check_entity_duplicates(&db, "org-1", "customer", &incoming).await?;
        assert_eq!(result.prevention_action, PreventionAction::Merge);
        assert_eq!(result.duplicate_type, Some(DuplicateType::BusinessRule));
        assert_eq!(result.duplicate_ids, vec![existing.entity.id]);
        assert_eq!(result.duplicate_fields, vec!["email".to_string()]);

        // Same email in another organization is not a duplicate.
        let elsewhere = NewEntity::new("org-2", "customer", "Acme Trading", "CUST-777")
            .with_field("email", "ops@acme.test");
        let result = check_entity_duplicates(&db, "org-2", "customer", &elsewhere).await?;
        assert_eq!(result.prevention_action, PreventionAction::Allow);
        Ok(())
    }

    #[tokio::test]
    async fn test_business_keys_union_ids_and_escalate() -> Result<()> {
        let db = setup_test_db().await?;
        let by_phone = create_entity_with_fields(
            &db,
            NewEntity::new("org-1", "customer", "Bistro One", "CUST-001")
                .with_field("phone", "+1 (555) 010-2000"),
        )
        .await?;
        let by_tax = create_entity_with_fields(
            &db,
            NewEntity::new("org-1", "customer", "Bistro Two", "CUST-002")
                .with_field("tax_id", "gb123")
                .with_field("phone", "15550102000"),
        )
        .await?;

        let incoming = NewEntity::new("org-1", "customer", "Bistro Three", "CUST-003")
            .with_field("phone", "1-555-010-2000")
            .with_field("tax_id", "GB123");
        let result = check_entity_duplicates(&db, "org-1", "customer", &incoming).await?;

        assert_eq!(result.prevention_action, PreventionAction::Reject);
        assert_eq!(result.duplicate_ids.len(), 2);
        assert!(result.duplicate_ids.contains(&by_phone.entity.id));
        assert!(result.duplicate_ids.contains(&by_tax.entity.id));
        assert_eq!(
            result.duplicate_fields,
            vec!["phone".to_string(), "tax_id".to_string()]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_deleted_customers_do_not_trigger_business_rules() -> Result<()> {
        let db = setup_test_db().await?;
        let existing = create_entity_with_fields(
            &db,
            NewEntity::new("org-1", "customer", "Gone", "CUST-001").with_field("email", "a@b.test"),
        )
        .await?;
        crate::core::entity::delete_entity(&db, "org-1", existing.id()).await?;

        let incoming = NewEntity::new("org-1", "customer", "New", "CUST-002")
            .with_field("email", "a@b.test");
        let result = check_entity_duplicates(&db, "org-1", "customer", &incoming).await?;
        assert_eq!(result.prevention_action, PreventionAction::Allow);
        Ok(())
    }

    #[tokio::test]
    async fn test_exact_name_needs_manual_review() -> Result<()> {
        let db = setup_test_db().await?;
        let existing = create_test_entity(&db, "org-1", "product", "Flat White", "PRD-010").await?;

        let incoming = NewEntity::new("org-1", "product", "flat white", "PRD-011");
        let result = check_entity_duplicates(&db, "org-1", "product", &incoming).await?;
        assert_eq!(result.prevention_action, PreventionAction::ManualReview);
        assert_eq!(result.duplicate_type, Some(DuplicateType::EntityName));
        assert_eq!(result.duplicate_ids, vec![existing.entity.id]);
        Ok(())
    }

    #[tokio::test]
    async fn test_partial_name_match_is_only_a_hint() -> Result<()> {
        let db = setup_test_db().await?;
        create_test_entity(&db, "org-1", "product", "Iced Latte Large", "PRD-020").await?;

        let incoming = NewEntity::new("org-1", "product", "Latte", "PRD-021");
        let result = check_entity_duplicates(&db, "org-1", "product", &incoming).await?;
        assert_eq!(result.prevention_action, PreventionAction::Allow);
        assert!(!result.has_duplicates);
        assert_eq!(
            result.suggestions,
            vec!["Similar names already exist: Iced Latte Large".to_string()]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_exact_name_found_among_many_partial_matches() -> Result<()> {
        let db = setup_test_db().await?;
        for n in 0..30 {
            create_test_entity(
                &db,
                "org-1",
                "product",
                &format!("Latte Variant {n:02}"),
                &format!("PRD-{n:03}"),
            )
            .await?;
        }
        let latte = create_test_entity(&db, "org-1", "product", "Latte", "ZZ-001").await?;

        let incoming = NewEntity::new("org-1", "product", "latte", "ZZ-002");
        let result = check_entity_duplicates(&db, "org-1", "product", &incoming).await?;
        assert_eq!(result.prevention_action, PreventionAction::ManualReview);
        assert_eq!(result.duplicate_ids, vec![latte.entity.id]);

        let partial = NewEntity::new("org-1", "product", "Variant", "ZZ-003");
        let result = check_entity_duplicates(&db, "org-1", "product", &partial).await?;
        assert_eq!(result.prevention_action, PreventionAction::Allow);
        let hint = &result.suggestions[0];
        assert_eq!(hint.matches("Latte Variant").count(), NAME_MATCH_LIMIT);
        Ok(())
    }

    #[tokio::test]
    async fn test_name_match_folds_non_ascii_case() -> Result<()> {
        let db = setup_test_db().await?;
        let existing = create_test_entity(&db, "org-1", "product", "CAFÉ", "PRD-100").await?;

        let incoming = NewEntity::new("org-1", "product", "café", "PRD-101");
        let result = check_entity_duplicates(&db, "org-1", "product", &incoming).await?;
        assert_eq!(result.prevention_action, PreventionAction::ManualReview);
        assert_eq!(result.duplicate_ids, vec![existing.entity.id]);
        Ok(())
    }

    #[tokio::test]
    async fn test_like_wildcards_in_names_are_literal() -> Result<()> {
        let db = setup_test_db().await?;
        create_test_entity(&db, "org-1", "product", "Blend A1", "PRD-200").await?;

        let incoming = NewEntity::new("org-1", "product", "Blend_A%", "PRD-201");
        let result = check_entity_duplicates(&db, "org-1", "product", &incoming).await?;
        assert_eq!(result.prevention_action, PreventionAction::Allow);
        assert!(result.suggestions.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_most_severe_wins_and_suggestions_merge() -> Result<()> {
        let db = setup_test_db().await?;
        create_test_entity(&db, "org-1", "product", "Mocha", "PRD-030").await?;

        // Same code and same name: reject beats manual review.
        let incoming = NewEntity::new("org-1", "product", "Mocha", "PRD-030");
        let result = check_entity_duplicates(&db, "org-1", "product", &incoming).await?;
        assert_eq!(result.prevention_action, PreventionAction::Reject);
        assert_eq!(result.duplicate_type, Some(DuplicateType::EntityCode));
        assert!(
            result
                .suggestions
                .iter()
                .any(|s| s.starts_with("Review the existing product 'Mocha'"))
        );
        let unique: BTreeSet<&String> = result.suggestions.iter().collect();
        assert_eq!(unique.len(), result.suggestions.len());
        Ok(())
    }

    #[tokio::test]
    async fn test_invoice_delegates_to_transaction_numbers() -> Result<()> {
        let db = setup_test_db().await?;
        let txn = create_test_transaction(&db, "org-1", "invoice", "INV-0042", json!({})).await?;

        let incoming = NewEntity::new("org-1", "invoice", "Invoice 42", "INV-0042");
        let result = check_entity_duplicates(&db, "org-1", "invoice", &incoming).await?;
        assert_eq!(result.prevention_action, PreventionAction::Reject);
        assert_eq!(result.duplicate_type, Some(DuplicateType::BusinessRule));
        assert_eq!(result.duplicate_ids, vec![txn.id]);
        Ok(())
    }

    #[tokio::test]
    async fn test_dynamic_data_actions() -> Result<()> {
        let db = setup_test_db().await?;
        let entity = create_entity_with_fields(
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
        .into_iter()
        .collect();
        let result = check_dynamic_data_duplicates(
            &db,
            "org-1",
            entity.id(),
            &proposed,
            &DuplicatePolicy::default(),
        )
        .await?;

        assert_eq!(result.prevention_action, PreventionAction::Update);
        assert_eq!(result.duplicate_type, Some(DuplicateType::DynamicField));
        let action_of = |name: &str| {
            result
                .field_collisions
                .iter()
                .find(|c| c.field_name == name)
                .map(|c| c.action)
        };
        assert_eq!(action_of("price"), Some(FieldAction::CreateVersion));
        assert_eq!(action_of("size"), Some(FieldAction::Update));
        assert_eq!(action_of("vegan"), Some(FieldAction::KeepExisting));
        assert_eq!(action_of("origin"), None);
        assert_eq!(result.duplicate_ids.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_dynamic_data_without_collisions_is_allowed() -> Result<()> {
        let db = setup_test_db().await?;
        let entity = create_test_entity(&db, "org-1", "product", "Latte", "PRD-001").await?;
        let proposed: BTreeMap<String, FieldValue> =
            [("price".to_string(), FieldValue::from(10.0))].into_iter().collect();

        let result = check_dynamic_data_duplicates(
            &db,
            "org-1",
            entity.id(),
            &proposed,
            &DuplicatePolicy::default(),
        )
        .await?;
        assert_eq!(result.prevention_action, PreventionAction::Allow);

        let empty = check_dynamic_data_duplicates(
            &db,
            "org-1",
            entity.id(),
            &BTreeMap::new(),
            &DuplicatePolicy::default(),
        )
        .await?;
        assert!(!empty.has_duplicates);
        Ok(())
    }

    #[tokio::test]
    async fn test_metadata_versioning_keeps_one_active_row() -> Result<()> {
        let db = setup_test_db().await?;
        let entity = create_test_entity(&db, "org-1", "recipe", "Soup", "RCP-001").await?;
        let first = NewMetadata::new("cost_analysis", "food_cost", json!({"pct": 31}));

        let before = check_metadata_duplicates(&db, "org-1", "recipe", entity.id(), &first).await?;
        assert_eq!(before.prevention_action, PreventionAction::Allow);

        prevent_duplicate_metadata(&db, "org-1", "recipe", entity.id(), &first).await?;

        let second = NewMetadata::new("cost_analysis", "food_cost", json!({"pct": 28}));
        let check = check_metadata_duplicates(&db, "org-1", "recipe", entity.id(), &second).await?;
        assert_eq!(check.prevention_action, PreventionAction::Update);
        assert_eq!(check.duplicate_type, Some(DuplicateType::Metadata));

        let written = prevent_duplicate_metadata(&db, "org-1", "recipe", entity.id(), &second).await?;
        assert!(written.is_active);

        let rows = Metadata::find()
            .filter(core_metadata::Column::EntityId.eq(entity.id()))
            .filter(core_metadata::Column::MetadataKey.eq("food_cost"))
            .all(&db)
            .await?;
        assert_eq!(rows.len(), 2);
        let active: Vec<_> = rows.iter().filter(|r| r.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].metadata_value, json!({"pct": 28}));
        let stale = rows.iter().find(|r| !r.is_active).unwrap();
        assert!(stale.effective_to.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_transaction_number_collision() -> Result<()> {
        let db = setup_test_db().await?;
        let existing =
            create_test_transaction(&db, "org-1", "journal_entry", "JE-0007", json!({})).await?;
        create_test_transaction(&db, "org-1", "journal_entry", "JE-0009", json!({})).await?;

        let result = check_transaction_duplicates(&db, "org-1", "journal_entry", "JE-0007").await?;
        assert_eq!(result.prevention_action, PreventionAction::Reject);
        assert_eq!(result.duplicate_ids, vec![existing.id]);
        assert_eq!(
            result.suggestions,
            vec![
                "Use the next sequence number 'JE-0010'".to_string(),
                "Add a suffix such as 'JE-0007-2'".to_string(),
            ]
        );

        let other_type = check_transaction_duplicates(&db, "org-1", "invoice", "JE-0007").await?;
        assert_eq!(other_type.prevention_action, PreventionAction::Allow);
        let other_org =
            check_transaction_duplicates(&db, "org-2", "journal_entry", "JE-0007").await?;
        assert_eq!(other_org.prevention_action, PreventionAction::Allow);
        Ok(())
    }

    #[tokio::test]
    async fn test_exhausted_sequence_only_suggests_suffix() -> Result<()> {
        let db = setup_test_db().await?;
        let max = u64::MAX.to_string();
        create_test_transaction(&db, "org-1", "journal_entry", &max, json!({})).await?;

        let result = check_transaction_duplicates(&db, "org-1", "journal_entry", &max).await?;
        assert_eq!(result.prevention_action, PreventionAction::Reject);
        assert_eq!(result.suggestions, vec![format!("Add a suffix such as '{max}-2'")]);
        Ok(())
    }

    #[test]
    fn test_sequence_helpers() {
        let existing = vec!["INV-009".to_string(), "INV-010".to_string(), "INV-X".to_string()];
        assert_eq!(next_sequence_number("INV-009", &existing), Some("INV-011".to_string()));
        assert_eq!(next_sequence_number("INV-X", &existing), None);
        assert_eq!(next_sequence_number("7", &[]), Some("8".to_string()));
        assert_eq!(next_sequence_number(&u64::MAX.to_string(), &[]), None);
        let near_end = vec!["N-18446744073709551615".to_string()];
        assert_eq!(next_sequence_number("N-1", &near_end), None);

        let taken = vec!["A".to_string(), "A-2".to_string()];
        assert_eq!(next_free_suffix("A", &taken), "A-3");
        assert_eq!(next_free_suffix("B", &taken), "B-2");
    }

    #[test]
    fn test_severity_order_and_thresholds() {
        assert!(PreventionAction::Reject.severity() > PreventionAction::Merge.severity());
        assert!(PreventionAction::Merge.severity() > PreventionAction::ManualReview.severity());
        assert!(PreventionAction::ManualReview.severity() > PreventionAction::Update.severity());
        assert!(PreventionAction::Update.severity() > PreventionAction::Allow.severity());

        assert_eq!(DuplicateSeverity::from_occurrences(2), DuplicateSeverity::Low);
        assert_eq!(DuplicateSeverity::from_occurrences(4), DuplicateSeverity::Medium);
        assert_eq!(DuplicateSeverity::from_occurrences(9), DuplicateSeverity::High);
        assert_eq!(DuplicateSeverity::from_occurrences(10), DuplicateSeverity::Critical);
    }

    #[test]
    fn test_result_serializes_snake_case() {
        let json = serde_json::to_value(DuplicateCheckResult::found(
            DuplicateType::EntityName,
            PreventionAction::ManualReview,
            vec!["e1".to_string()],
            "dup".to_string(),
        ))
        .unwrap();
        assert_eq!(json["prevention_action"], "manual_review");
        assert_eq!(json["duplicate_type"], "entity_name");
    }

    #[tokio::test]
    async fn test_monitor_duplicate_patterns() -> Result<()> {
        let db = setup_test_db().await?;
        for code in ["CUST-1", "CUST-2", "CUST-3"] {
            create_entity_with_fields(
                &db,
                NewEntity::new("org-1", "customer", "Acme", code).with_field("email", "x@acme.test"),
            )
            .await?;
        }
        create_test_entity(&db, "org-1", "customer", "Solo", "CUST-4").await?;
        // Legacy data written before versioning existed: two active rows for one key.
        let entity = create_test_entity(&db, "org-1", "recipe", "Soup", "RCP-1").await?;
        for value in [1, 2] {
            crate::entities::core_metadata::ActiveModel {
                id: Set(uuid::Uuid::new_v4().to_string()),
                organization_id: Set("org-1".to_string()),
                entity_type: Set("recipe".to_string()),
                entity_id: Set(entity.id().to_string()),
                metadata_type: Set("cost_analysis".to_string()),
                metadata_category: Set(None),
                metadata_key: Set("food_cost".to_string()),
                metadata_value: Set(json!(value)),
                is_active: Set(true),
                effective_from: Set(chrono::Utc::now()),
                effective_to: Set(None),
            }
            .insert(&db)
            .await?;
        }
        // Noise in another tenant must not show up.
        create_test_entity(&db, "org-2", "customer", "Acme", "CUST-9").await?;

        let patterns = monitor_duplicate_patterns(&db, "org-1").await?;

        let names = patterns
            .iter()
            .find(|p| p.pattern_type == DuplicatePatternType::EntityName)
            .unwrap();
        assert_eq!(names.key, "acme");
        assert_eq!(names.occurrences, 3);
        assert_eq!(names.severity, DuplicateSeverity::Medium);
        assert_eq!(names.entity_type.as_deref(), Some("customer"));

        let emails = patterns
            .iter()
            .find(|p| p.pattern_type == DuplicatePatternType::BusinessKey)
            .unwrap();
        assert_eq!(emails.key, "email=x@acme.test");
        assert_eq!(emails.occurrences, 3);

        let metadata = patterns
            .iter()
            .find(|p| p.pattern_type == DuplicatePatternType::ActiveMetadata)
            .unwrap();
        assert_eq!(metadata.occurrences, 2);
        assert_eq!(metadata.severity, DuplicateSeverity::Low);

        assert!(patterns.iter().all(|p| p.occurrences > 1));
        assert!(
            !patterns
                .iter()
                .any(|p| p.pattern_type == DuplicatePatternType::TransactionNumber)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_stored_dynamic_rows_carry_organization() -> Result<()> {
        let db = setup_test_db().await?;
        let entity = create_entity_with_fields(
            &db,
            NewEntity::new("org-1", "customer", "Acme", "C-1").with_field("email", "a@b.test"),
        )
        .await?;
        let rows: Vec<DynamicDataModel> = DynamicData::find()
            .filter(core_dynamic_data::Column::EntityId.eq(entity.id()))
            .all(&db)
            .await?;
        assert!(rows.iter().all(|r| r.organization_id == "org-1"));
        Ok(())
    }
}
