//! GL intelligence - derived validation data attached to a transaction.
//!
//! Nothing here has a table of its own. A record is a `transaction_gl_intelligence`
//! entity whose attributes are dynamic fields, linked from the transaction through a
//! `transaction_has_gl_intelligence` relationship (source = transaction id,
//! target = entity id).

use crate::{
    core::{
        entity::{
            create_entity, get_entity_with_enhanced_data, insert_relationship, update_entity,
            upsert_field,
        },
        transaction::get_transaction,
    },
    entities::{
        CoreEntity, Relationship, UniversalTransaction, core_entity, core_relationship,
        universal_transaction,
    },
    errors::{Error, Result, ensure_organization},
    models::{EnhancedEntity, EntityUpdate, FieldValue, NewEntity},
};
use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, QueryOrder, TransactionTrait, prelude::*};
use serde::{Deserialize, Serialize};
use serde_json::{Value as Json, json};
use std::collections::BTreeMap;
use tracing::{info, instrument};

/// Entity type of GL intelligence records.
pub const GL_INTELLIGENCE_ENTITY_TYPE: &str = "transaction_gl_intelligence";
/// Relationship from a transaction to its GL intelligence record.
pub const GL_INTELLIGENCE_RELATIONSHIP: &str = "transaction_has_gl_intelligence";

/// Debit/credit differences below this are rounding noise.
const BALANCE_TOLERANCE: f64 = 0.005;

const TRANSACTION_ID: &str = "transaction_id";
const CONFIDENCE_SCORE: &str = "confidence_score";
const VALIDATION_STATUS: &str = "validation_status";
const AUTO_FIX_SUGGESTIONS: &str = "auto_fix_suggestions";
const SUGGESTED_ACCOUNTS: &str = "suggested_accounts";
const AI_REASONING: &str = "ai_reasoning";
const LAST_VALIDATED_AT: &str = "last_validated_at";

/// Where a transaction stands after GL validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    /// Never validated
    #[default]
    Pending,
    /// Every rule passed
    Validated,
    /// At least one rule failed
    NeedsReview,
}

impl ValidationStatus {
    /// Stored form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Validated => "validated",
            Self::NeedsReview => "needs_review",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "validated" => Some(Self::Validated),
            "needs_review" => Some(Self::NeedsReview),
            _ => None,
        }
    }
}

/// A GL intelligence record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlIntelligence {
    /// Id of the backing entity
    pub entity_id: String,
    /// Transaction the record describes
    pub transaction_id: String,
    /// Share of validation rules that passed, 0.0 to 1.0
    pub confidence_score: f64,
    /// Outcome of the last validation
    pub validation_status: ValidationStatus,
    /// Fixes proposed for failed rules
    pub auto_fix_suggestions: Vec<String>,
    /// GL accounts proposed for the transaction
    pub suggested_accounts: Vec<String>,
    /// Free-form explanation
    pub ai_reasoning: Option<String>,
    /// When validation last ran
    pub last_validated_at: Option<DateTime<Utc>>,
}

impl GlIntelligence {
    fn from_entity(entity: &EnhancedEntity) -> Self {
        let text = |name: &str| entity.field(name).map(ToString::to_string);
        Self {
            entity_id: entity.id().to_string(),
            transaction_id: text(TRANSACTION_ID).unwrap_or_default(),
            confidence_score: entity
                .field(CONFIDENCE_SCORE)
                .and_then(FieldValue::as_f64)
                .unwrap_or_default(),
            validation_status: text(VALIDATION_STATUS)
                .as_deref()
                .and_then(ValidationStatus::parse)
                .unwrap_or_default(),
            auto_fix_suggestions: string_list(entity.field(AUTO_FIX_SUGGESTIONS)),
            suggested_accounts: string_list(entity.field(SUGGESTED_ACCOUNTS)),
            ai_reasoning: text(AI_REASONING),
            last_validated_at: text(LAST_VALIDATED_AT)
                .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
                .map(|t| t.with_timezone(&Utc)),
        }
    }
}

fn string_list(value: Option<&FieldValue>) -> Vec<String> {
    let json = match value {
        Some(FieldValue::Json(json)) => json.clone(),
        Some(FieldValue::Text(text)) => serde_json::from_str(text).unwrap_or(Json::Null),
        _ => Json::Null,
    };
    json.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn string_list_field(items: &[String]) -> FieldValue {
    FieldValue::Json(json!(items))
}

/// Initial values of a new record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlIntelligenceInput {
    /// Starting confidence
    pub confidence_score: f64,
    /// Starting status
    pub validation_status: ValidationStatus,
    /// Starting suggestions
    pub auto_fix_suggestions: Vec<String>,
    /// Proposed GL accounts
    pub suggested_accounts: Vec<String>,
    /// Free-form explanation
    pub ai_reasoning: Option<String>,
}

/// Changes to a record. `None` leaves the attribute untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlIntelligenceUpdate {
    /// New confidence
    pub confidence_score: Option<f64>,
    /// New status
    pub validation_status: Option<ValidationStatus>,
    /// Replacement suggestions
    pub auto_fix_suggestions: Option<Vec<String>>,
    /// Replacement GL accounts
    pub suggested_accounts: Option<Vec<String>>,
    /// New explanation
    pub ai_reasoning: Option<String>,
    /// Validation timestamp
    pub last_validated_at: Option<DateTime<Utc>>,
}

impl GlIntelligenceUpdate {
    fn into_fields(self) -> BTreeMap<String, FieldValue> {
        let mut fields = BTreeMap::new();
        if let Some(score) = self.confidence_score {
            fields.insert(CONFIDENCE_SCORE.to_string(), FieldValue::Number(score));
        }
        if let Some(status) = self.validation_status {
            fields.insert(VALIDATION_STATUS.to_string(), FieldValue::from(status.as_str()));
        }
        if let Some(suggestions) = &self.auto_fix_suggestions {
            fields.insert(AUTO_FIX_SUGGESTIONS.to_string(), string_list_field(suggestions));
        }
        if let Some(accounts) = &self.suggested_accounts {
            fields.insert(SUGGESTED_ACCOUNTS.to_string(), string_list_field(accounts));
        }
        if let Some(reasoning) = self.ai_reasoning {
            fields.insert(AI_REASONING.to_string(), FieldValue::Text(reasoning));
        }
        if let Some(at) = self.last_validated_at {
            fields.insert(LAST_VALIDATED_AT.to_string(), FieldValue::Text(at.to_rfc3339()));
        }
        fields
    }
}

async fn find_link<C>(
    db: &C,
    organization_id: &str,
    transaction_id: &str,
) -> Result<Option<core_relationship::Model>>
where
    C: ConnectionTrait,
{
    Relationship::find()
        .filter(core_relationship::Column::OrganizationId.eq(organization_id))
        .filter(core_relationship::Column::SourceEntityId.eq(transaction_id))
        .filter(core_relationship::Column::RelationshipType.eq(GL_INTELLIGENCE_RELATIONSHIP))
        .filter(core_relationship::Column::IsActive.eq(true))
        .order_by_desc(core_relationship::Column::CreatedAt)
        .one(db)
        .await
        .map_err(Into::into)
}

/// Loads the GL intelligence record of a transaction, if there is one.
pub async fn get<C>(
    db: &C,
    organization_id: &str,
    transaction_id: &str,
) -> Result<Option<GlIntelligence>>
where
    C: ConnectionTrait,
{
    ensure_organization(organization_id)?;
    let Some(link) = find_link(db, organization_id, transaction_id).await? else {
        return Ok(None);
    };
    let entity =
        get_entity_with_enhanced_data(db, organization_id, &link.target_entity_id).await?;
    Ok(entity
        .filter(|e| e.entity.is_active)
        .as_ref()
        .map(GlIntelligence::from_entity))
}

/// Creates the GL intelligence record of a transaction.
///
/// Fails with [`Error::DuplicateEntity`] when the transaction already has one.
#[instrument(skip(db, input))]
pub async fn create<C>(
    db: &C,
    organization_id: &str,
    transaction_id: &str,
    input: GlIntelligenceInput,
) -> Result<GlIntelligence>
where
    C: ConnectionTrait + TransactionTrait,
{
    ensure_organization(organization_id)?;
    let txn = db.begin().await?;

    let transaction = UniversalTransaction::find_by_id(transaction_id)
        .filter(universal_transaction::Column::OrganizationId.eq(organization_id))
        .one(&txn)
        .await?
        .ok_or_else(|| Error::TransactionNotFound {
            id: transaction_id.to_string(),
        })?;
    if let Some(link) = find_link(&txn, organization_id, transaction_id).await? {
        return Err(Error::DuplicateEntity {
            message: format!(
                "transaction {} already has GL intelligence",
                transaction.transaction_number
            ),
            duplicate_ids: vec![link.target_entity_id],
        });
    }

    let entity_name = format!("GL intelligence for {}", transaction.transaction_number);
    let entity_code = format!("GLI-{transaction_id}");
    let mut fields = BTreeMap::from([(
        TRANSACTION_ID.to_string(),
        FieldValue::from(transaction_id),
    )]);
    fields.extend(
        GlIntelligenceUpdate {
            confidence_score: Some(input.confidence_score),
            validation_status: Some(input.validation_status),
            auto_fix_suggestions: Some(input.auto_fix_suggestions),
            suggested_accounts: Some(input.suggested_accounts),
            ai_reasoning: input.ai_reasoning,
            last_validated_at: None,
        }
        .into_fields(),
    );

    // A deleted record keeps its code, so it is revived rather than recreated.
    let retired = CoreEntity::find()
        .filter(core_entity::Column::OrganizationId.eq(organization_id))
        .filter(core_entity::Column::EntityType.eq(GL_INTELLIGENCE_ENTITY_TYPE))
        .filter(core_entity::Column::EntityCode.eq(entity_code.as_str()))
        .one(&txn)
        .await?;
    let entity = match retired {
        Some(retired) => {
            update_entity(
                &txn,
                organization_id,
                &retired.id,
                EntityUpdate {
                    entity_name: Some(entity_name),
                    is_active: Some(true),
                    dynamic_fields: Some(fields),
                    ..EntityUpdate::default()
                },
            )
            .await?
        }
        None => {
            let mut new_entity = NewEntity::new(
                organization_id,
                GL_INTELLIGENCE_ENTITY_TYPE,
                entity_name,
                entity_code,
            );
            new_entity.dynamic_fields = fields;
            create_entity(&txn, new_entity).await?
        }
    };
    insert_relationship(
        &txn,
        organization_id,
        transaction_id,
        entity.id(),
        GL_INTELLIGENCE_RELATIONSHIP,
        Some(json!({
            "transaction_type": transaction.transaction_type,
            "transaction_number": transaction.transaction_number,
        })),
    )
    .await?;
    txn.commit().await?;

    info!(
        "Attached GL intelligence {} to transaction {}",
        entity.id(),
        transaction_id
    );
    Ok(GlIntelligence::from_entity(&entity))
}

/// Updates the record of a transaction, one field upsert per changed attribute,
/// inside one database transaction.
#[instrument(skip(db, update))]
pub async fn update<C>(
    db: &C,
    organization_id: &str,
    transaction_id: &str,
    update: GlIntelligenceUpdate,
) -> Result<GlIntelligence>
where
    C: ConnectionTrait + TransactionTrait,
{
    ensure_organization(organization_id)?;
    let current = get(db, organization_id, transaction_id)
        .await?
        .ok_or_else(|| Error::EntityNotFound {
            id: format!("GL intelligence for transaction {transaction_id}"),
        })?;

    let txn = db.begin().await?;
    for (name, value) in update.into_fields() {
        upsert_field(&txn, organization_id, &current.entity_id, &name, &value).await?;
    }
    txn.commit().await?;

    get(db, organization_id, transaction_id)
        .await?
        .ok_or_else(|| Error::EntityNotFound {
            id: current.entity_id,
        })
}

/// A GL validation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlRule {
    /// The transaction carries at least one GL line
    LinesPresent,
    /// Every line names a GL account
    AccountsAssigned,
    /// Total debits equal total credits
    Balanced,
    /// No line carries a negative amount
    NonNegative,
}

/// Outcome of evaluating every [`GlRule`] against a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlEvaluation {
    /// `validated` when every rule passed
    pub status: ValidationStatus,
    /// Share of rules that passed
    pub confidence: f64,
    /// Rules that failed
    pub failed_rules: Vec<GlRule>,
    /// One or more fixes per failed rule
    pub suggestions: Vec<String>,
}

fn amount(line: &Json, key: &str) -> f64 {
    match line.get(key) {
        Some(Json::Number(n)) => n.as_f64().unwrap_or_default(),
        Some(Json::String(s)) => s.trim().parse().unwrap_or_default(),
        _ => 0.0,
    }
}

/// Evaluates the GL lines in `transaction_data["lines"]`.
///
/// Each line is an object with `gl_account`, `debit` and `credit`; amounts may be
/// numbers or numeric strings and default to zero. A transaction without lines fails
/// every rule.
#[must_use]
pub fn evaluate_gl_lines(transaction_data: &Json) -> GlEvaluation {
    const RULES: [GlRule; 4] = [
        GlRule::LinesPresent,
        GlRule::AccountsAssigned,
        GlRule::Balanced,
        GlRule::NonNegative,
    ];

    let lines: &[Json] = transaction_data
        .get("lines")
        .and_then(Json::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    if lines.is_empty() {
        return GlEvaluation {
            status: ValidationStatus::NeedsReview,
            confidence: 0.0,
            failed_rules: RULES.to_vec(),
            suggestions: vec!["Add balanced debit and credit lines with GL accounts".to_string()],
        };
    }

    let mut failed_rules = Vec::new();
    let mut suggestions = Vec::new();

    let unassigned: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| {
            line.get("gl_account")
                .and_then(Json::as_str)
                .is_none_or(|account| account.trim().is_empty())
        })
        .map(|(i, _)| i + 1)
        .collect();
    if !unassigned.is_empty() {
        failed_rules.push(GlRule::AccountsAssigned);
        suggestions.extend(
            unassigned
                .iter()
                .map(|n| format!("Assign a GL account to line {n}")),
        );
    }

    let debits: f64 = lines.iter().map(|l| amount(l, "debit")).sum();
    let credits: f64 = lines.iter().map(|l| amount(l, "credit")).sum();
    let difference = (debits - credits).abs();
    if difference >= BALANCE_TOLERANCE {
        failed_rules.push(GlRule::Balanced);
        let side = if debits > credits { "credit" } else { "debit" };
        suggestions.push(format!(
            "Debits {debits:.2} and credits {credits:.2} differ by {difference:.2}; add a {side} line of {difference:.2}"
        ));
    }

    let mut negative = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        for (side, opposite) in [("debit", "credit"), ("credit", "debit")] {
            let value = amount(line, side);
            if value < 0.0 {
                negative.push(format!(
                    "Line {} has a negative {side} of {value:.2}; post {:.2} as a {opposite} instead",
                    i + 1,
                    value.abs()
                ));
            }
        }
    }
    if !negative.is_empty() {
        failed_rules.push(GlRule::NonNegative);
        suggestions.extend(negative);
    }

    #[allow(clippy::cast_precision_loss)]
    let confidence = (RULES.len() - failed_rules.len()) as f64 / RULES.len() as f64;
    GlEvaluation {
        status: if failed_rules.is_empty() {
            ValidationStatus::Validated
        } else {
            ValidationStatus::NeedsReview
        },
        confidence,
        failed_rules,
        suggestions,
    }
}

/// Validates a transaction's GL lines and stores the outcome on its record,
/// creating the record first when the transaction has none.
#[instrument(skip(db))]
pub async fn validate_and_fix<C>(
    db: &C,
    organization_id: &str,
    transaction_id: &str,
) -> Result<GlIntelligence>
where
    C: ConnectionTrait + TransactionTrait,
{
    let transaction = get_transaction(db, organization_id, transaction_id)
        .await?
        .ok_or_else(|| Error::TransactionNotFound {
            id: transaction_id.to_string(),
        })?;
    let evaluation = evaluate_gl_lines(&transaction.transaction_data);

    if get(db, organization_id, transaction_id).await?.is_none() {
        create(
            db,
            organization_id,
            transaction_id,
            GlIntelligenceInput::default(),
        )
        .await?;
    }

    let record = update(
        db,
        organization_id,
        transaction_id,
        GlIntelligenceUpdate {
            confidence_score: Some(evaluation.confidence),
            validation_status: Some(evaluation.status),
            auto_fix_suggestions: Some(evaluation.suggestions),
            last_validated_at: Some(Utc::now()),
            ..GlIntelligenceUpdate::default()
        },
    )
    .await?;
    info!(
        "Validated {} {}: {} ({:.2})",
        transaction.transaction_type,
        transaction.transaction_number,
        record.validation_status.as_str(),
        record.confidence_score
    );
    Ok(record)
}
