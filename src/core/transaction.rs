//! Universal transaction logic - recording and reading business events.
//!
//! Transaction numbers are unique per organization and type. A proposed number is
//! checked first so the caller gets a descriptive error; the unique index catches
//! the race where two writers pick the same number at once. Entity lifecycle events
//! are written here as audit transactions.

use crate::{
    core::duplicates::check_transaction_duplicates,
    entities::{UniversalTransaction, core_entity, universal_transaction},
    errors::{Error, Result, ensure_organization},
};
use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, QueryOrder, Set, prelude::*};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{info, instrument};
use uuid::Uuid;

/// Status given to transactions recorded without one.
pub const DEFAULT_TRANSACTION_STATUS: &str = "posted";

/// A business event to record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTransaction {
    /// Tenant
    pub organization_id: String,
    /// Event type (e.g. `"invoice"`, `"journal_entry"`)
    pub transaction_type: String,
    /// Business number, unique within organization and type
    pub transaction_number: String,
    /// When the event happened; now when absent
    pub transaction_date: Option<DateTime<Utc>>,
    /// Status; [`DEFAULT_TRANSACTION_STATUS`] when absent
    pub transaction_status: Option<String>,
    /// Entity the event refers to
    pub reference_entity_id: Option<String>,
    /// JSON payload
    pub transaction_data: Json,
}

impl NewTransaction {
    /// Transaction with an empty payload, dated now.
    pub fn new(
        organization_id: impl Into<String>,
        transaction_type: impl Into<String>,
        transaction_number: impl Into<String>,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            transaction_type: transaction_type.into(),
            transaction_number: transaction_number.into(),
            transaction_date: None,
            transaction_status: None,
            reference_entity_id: None,
            transaction_data: Json::Object(serde_json::Map::new()),
        }
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_data(mut self, transaction_data: Json) -> Self {
        self.transaction_data = transaction_data;
        self
    }

    /// Points the transaction at an entity.
    #[must_use]
    pub fn referencing(mut self, entity_id: impl Into<String>) -> Self {
        self.reference_entity_id = Some(entity_id.into());
        self
    }
}

/// Records a transaction, refusing numbers already used for its organization and type.
#[instrument(skip(db, new_transaction), fields(number = %new_transaction.transaction_number))]
pub async fn record_transaction<C>(
    db: &C,
    new_transaction: NewTransaction,
) -> Result<universal_transaction::Model>
where
    C: ConnectionTrait,
{
    ensure_organization(&new_transaction.organization_id)?;
    if new_transaction.transaction_type.trim().is_empty() {
        return Err(Error::validation("transaction_type is required"));
    }
    let transaction_number = new_transaction.transaction_number.trim().to_string();
    if transaction_number.is_empty() {
        return Err(Error::validation("transaction_number is required"));
    }

    let duplicate_error = || Error::DuplicateTransaction {
        transaction_type: new_transaction.transaction_type.clone(),
        transaction_number: transaction_number.clone(),
    };

    let check = check_transaction_duplicates(
        db,
        &new_transaction.organization_id,
        &new_transaction.transaction_type,
        &transaction_number,
    )
    .await?;
    if check.is_rejected() {
        return Err(duplicate_error());
    }

    let model = universal_transaction::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        organization_id: Set(new_transaction.organization_id.clone()),
        transaction_type: Set(new_transaction.transaction_type.clone()),
        transaction_number: Set(transaction_number.clone()),
        transaction_date: Set(new_transaction.transaction_date.unwrap_or_else(Utc::now)),
        transaction_status: Set(new_transaction
            .transaction_status
            .clone()
            .unwrap_or_else(|| DEFAULT_TRANSACTION_STATUS.to_string())),
        reference_entity_id: Set(new_transaction.reference_entity_id.clone()),
        transaction_data: Set(new_transaction.transaction_data.clone()),
    };

    let inserted = model.insert(db).await.map_err(|e| {
        let err = Error::from(e);
        if err.is_unique_violation() {
            duplicate_error()
        } else {
            err
        }
    })?;
    info!(
        "Recorded {} {} for {}",
        inserted.transaction_type, inserted.transaction_number, inserted.organization_id
    );
    Ok(inserted)
}

/// Writes an audit transaction for an entity lifecycle event.
///
/// The number is derived from a fresh UUID so audit rows never collide.
pub(crate) async fn record_entity_event<C>(
    db: &C,
    event_type: &str,
    entity: &core_entity::Model,
    details: Json,
) -> Result<universal_transaction::Model>
where
    C: ConnectionTrait,
{
    let id = Uuid::new_v4();
    universal_transaction::ActiveModel {
        id: Set(id.to_string()),
        organization_id: Set(entity.organization_id.clone()),
        transaction_type: Set(event_type.to_string()),
        transaction_number: Set(format!("{}-{}", entity.entity_code, id.simple())),
        transaction_date: Set(Utc::now()),
        transaction_status: Set("completed".to_string()),
        reference_entity_id: Set(Some(entity.id.clone())),
        transaction_data: Set(serde_json::json!({
            "entity_type": entity.entity_type,
            "entity_code": entity.entity_code,
            "details": details,
        })),
    }
    .insert(db)
    .await
    .map_err(Into::into)
}

/// Retrieves a transaction of the organization by id.
pub async fn get_transaction<C>(
    db: &C,
    organization_id: &str,
    transaction_id: &str,
) -> Result<Option<universal_transaction::Model>>
where
    C: ConnectionTrait,
{
    ensure_organization(organization_id)?;
    UniversalTransaction::find_by_id(transaction_id)
        .filter(universal_transaction::Column::OrganizationId.eq(organization_id))
        .one(db)
        .await
        .map_err(Into::into)
}

/// Transactions that reference an entity, newest first.
pub async fn list_transactions_for_entity<C>(
    db: &C,
    organization_id: &str,
    entity_id: &str,
) -> Result<Vec<universal_transaction::Model>>
where
    C: ConnectionTrait,
{
    ensure_organization(organization_id)?;
    UniversalTransaction::find()
        .filter(universal_transaction::Column::OrganizationId.eq(organization_id))
        .filter(universal_transaction::Column::ReferenceEntityId.eq(entity_id))
        .order_by_desc(universal_transaction::Column::TransactionDate)
        .all(db)
        .await
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_record_transaction_defaults() -> Result<()> {
        let db = setup_test_db().await?;
        let recorded = record_transaction(
            &db,
            NewTransaction::new("org-1", "invoice", " INV-001 ").with_data(json!({"total": 12})),
        )
        .await?;

        assert_eq!(recorded.transaction_number, "INV-001");
        assert_eq!(recorded.transaction_status, DEFAULT_TRANSACTION_STATUS);
        assert_eq!(recorded.transaction_data, json!({"total": 12}));

        let fetched = get_transaction(&db, "org-1", &recorded.id).await?;
        assert_eq!(fetched, Some(recorded.clone()));
        assert!(get_transaction(&db, "org-2", &recorded.id).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_number_is_rejected_per_type_and_org() -> Result<()> {
        let db = setup_test_db().await?;
        record_transaction(&db, NewTransaction::new("org-1", "invoice", "INV-001")).await?;

        let again = record_transaction(&db, NewTransaction::new("org-1", "invoice", "INV-001")).await;
        assert!(matches!(
            again,
            Err(Error::DuplicateTransaction { ref transaction_number, .. }) if transaction_number == "INV-001"
        ));

        record_transaction(&db, NewTransaction::new("org-1", "credit_note", "INV-001")).await?;
        record_transaction(&db, NewTransaction::new("org-2", "invoice", "INV-001")).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_blank_fields_are_rejected() -> Result<()> {
        let db = setup_test_db().await?;
        let no_number = record_transaction(&db, NewTransaction::new("org-1", "invoice", "  ")).await;
        assert!(matches!(no_number, Err(Error::Validation { .. })));
        let no_type = record_transaction(&db, NewTransaction::new("org-1", "", "X-1")).await;
        assert!(matches!(no_type, Err(Error::Validation { .. })));
        let no_org = record_transaction(&db, NewTransaction::new("", "invoice", "X-1")).await;
        assert!(matches!(no_org, Err(Error::Validation { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_list_transactions_for_entity() -> Result<()> {
        let db = setup_test_db().await?;
        let entity = create_test_entity(&db, "org-1", "customer", "Acme", "CUST-001").await?;
        record_transaction(
            &db,
            NewTransaction::new("org-1", "invoice", "INV-100").referencing(entity.id()),
        )
        .await?;
        record_transaction(&db, NewTransaction::new("org-1", "invoice", "INV-101")).await?;

        let listed = list_transactions_for_entity(&db, "org-1", entity.id()).await?;
        let types: Vec<&str> = listed.iter().map(|t| t.transaction_type.as_str()).collect();
        // The creation audit row plus the invoice.
        assert_eq!(listed.len(), 2);
        assert!(types.contains(&"entity_created"));
        assert!(types.contains(&"invoice"));
        Ok(())
    }
}
