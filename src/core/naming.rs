//! Naming convention engine for fields of the universal tables.
//!
//! Entities created through different code paths stay structurally consistent when
//! their field names follow a small set of universal patterns: `id`, `{entity}_id`,
//! `{prefix}_code`, `{prefix}_name`, `is_{state}`, `{action}_at`, plus a fixed list of
//! semantic names such as `email` or `currency`. Everything here is pure and advisory:
//! validation returns a structured result and never fails, and nothing stops a caller
//! from writing a field that was never validated.

use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt::Write as _;
use std::str::FromStr;

/// Confidence for a name that matches a pattern exactly
pub const CONFIDENCE_EXACT: f64 = 1.0;
/// Confidence for a name that follows a pattern but not the table's convention
pub const CONFIDENCE_MISMATCH: f64 = 0.8;
/// Confidence for a name that matches nothing
pub const CONFIDENCE_REJECTED: f64 = 0.3;

/// Field names that are valid on any table.
pub const SEMANTIC_FIELDS: &[&str] = &[
    "email",
    "phone",
    "mobile",
    "currency",
    "amount",
    "quantity",
    "price",
    "cost",
    "description",
    "notes",
    "status",
    "address",
    "city",
    "country",
    "postal_code",
    "website",
    "full_name",
    "display_name",
    "legal_name",
    "tax_id",
    "unit",
    "category",
    "priority",
    "metadata",
    "tags",
    "version",
    "sort_order",
    "confidence_score",
    "validation_status",
];

/// Known table name to entity prefix mappings.
const TABLE_PREFIXES: &[(&str, &str)] = &[
    ("core_entities", "entity"),
    ("core_dynamic_data", "field"),
    ("core_metadata", "metadata"),
    ("core_relationships", "relationship"),
    ("universal_transactions", "transaction"),
    ("core_organizations", "organization"),
    ("core_clients", "client"),
    ("core_users", "user"),
];

/// Columns that belong to a specific table without matching a universal pattern.
const TABLE_CONVENTIONS: &[(&str, &[&str])] = &[
    ("core_entities", &["entity_type"]),
    ("core_dynamic_data", &["field_value", "field_type"]),
    (
        "core_metadata",
        &[
            "metadata_type",
            "metadata_category",
            "metadata_key",
            "metadata_value",
        ],
    ),
    ("core_relationships", &["relationship_type", "relationship_data"]),
    (
        "universal_transactions",
        &[
            "transaction_type",
            "transaction_number",
            "transaction_date",
            "transaction_status",
            "transaction_data",
        ],
    ),
];

/// Legacy names and their conventional replacements. `{prefix}` is the table prefix.
const LEGACY_NAMES: &[(&str, &str)] = &[
    ("first_name", "full_name"),
    ("last_name", "full_name"),
    ("fname", "full_name"),
    ("lname", "full_name"),
    ("surname", "full_name"),
    ("email_address", "email"),
    ("e_mail", "email"),
    ("mail", "email"),
    ("phone_number", "phone"),
    ("telephone", "phone"),
    ("tel", "phone"),
    ("mobile_number", "mobile"),
    ("currency_code", "currency"),
    ("curr", "currency"),
    ("created", "created_at"),
    ("creation_date", "created_at"),
    ("date_created", "created_at"),
    ("updated", "updated_at"),
    ("modified", "updated_at"),
    ("last_modified", "updated_at"),
    ("date_modified", "updated_at"),
    ("deleted", "is_deleted"),
    ("active", "is_active"),
    ("enabled", "is_active"),
    ("uuid", "id"),
    ("guid", "id"),
    ("pk", "id"),
    ("org_id", "organization_id"),
    ("tenant_id", "organization_id"),
    ("desc", "description"),
    ("qty", "quantity"),
    ("code", "{prefix}_code"),
    ("name", "{prefix}_name"),
];

/// Patterns a field name can match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingPattern {
    /// Exactly `id`
    PrimaryKey,
    /// `{entity}_id`
    ForeignKey,
    /// `{prefix}_code`
    CodeField,
    /// `{prefix}_name`
    NameField,
    /// `is_{state}`
    BooleanStatus,
    /// `{action}_at`
    Timestamp,
    /// One of [`SEMANTIC_FIELDS`]
    Semantic,
    /// Listed in the table's own convention table
    TableConvention,
}

/// What a field is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldPurpose {
    /// Primary key
    PrimaryKey,
    /// Reference to another table
    ForeignKey,
    /// Business code of the table's entity
    EntityCode,
    /// Display name of the table's entity
    EntityName,
    /// Boolean state flag (the state, e.g. `"active"`)
    Status(String),
    /// Timestamp of an action (the action, e.g. `"created"`)
    Timestamp(String),
    /// Anything else, described by a free-form slug
    Semantic(String),
}

impl FieldPurpose {
    const fn expected_pattern(&self) -> Option<NamingPattern> {
        match self {
            Self::PrimaryKey => Some(NamingPattern::PrimaryKey),
            Self::ForeignKey => Some(NamingPattern::ForeignKey),
            Self::EntityCode => Some(NamingPattern::CodeField),
            Self::EntityName => Some(NamingPattern::NameField),
            Self::Status(_) => Some(NamingPattern::BooleanStatus),
            Self::Timestamp(_) => Some(NamingPattern::Timestamp),
            Self::Semantic(_) => None,
        }
    }
}

impl FromStr for FieldPurpose {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let slug = to_snake_case(s);
        Ok(match slug.as_str() {
            "primary_key" | "id" | "pk" => Self::PrimaryKey,
            "foreign_key" | "reference" | "fk" => Self::ForeignKey,
            "entity_code" | "code" => Self::EntityCode,
            "entity_name" | "name" => Self::EntityName,
            "status" | "active" | "is_active" => Self::Status("active".to_string()),
            "deleted" | "is_deleted" => Self::Status("deleted".to_string()),
            "created" | "created_at" => Self::Timestamp("created".to_string()),
            "updated" | "updated_at" => Self::Timestamp("updated".to_string()),
            _ => Self::Semantic(slug),
        })
    }
}

/// Storage type of a field, used to pick fallback names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldDataType {
    /// Text
    #[default]
    Text,
    /// Number
    Number,
    /// Boolean
    Boolean,
    /// Timestamp
    Timestamp,
    /// JSON document
    Json,
    /// UUID
    Uuid,
}

/// Outcome of validating one field name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamingValidationResult {
    /// Whether the name follows the conventions
    pub is_valid: bool,
    /// Why the name was rejected
    pub error: Option<String>,
    /// Conventional alternative, when one exists
    pub suggestion: Option<String>,
    /// Pattern the name matched
    pub pattern: Option<NamingPattern>,
    /// Fixed score for the matched rule
    pub confidence: f64,
}

impl NamingValidationResult {
    const fn valid(pattern: NamingPattern) -> Self {
        Self {
            is_valid: true,
            error: None,
            suggestion: None,
            pattern: Some(pattern),
            confidence: CONFIDENCE_EXACT,
        }
    }

    fn mismatch(pattern: NamingPattern, error: String, suggestion: String) -> Self {
        Self {
            is_valid: false,
            error: Some(error),
            suggestion: Some(suggestion),
            pattern: Some(pattern),
            confidence: CONFIDENCE_MISMATCH,
        }
    }
}

/// One field of a batch audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldAudit {
    /// Field name as found
    pub field_name: String,
    /// Validation outcome
    pub result: NamingValidationResult,
}

/// Batch audit of a table's field names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamingReport {
    /// Table that was audited
    pub table_name: String,
    /// Per-field outcomes, in input order
    pub fields: Vec<FieldAudit>,
}

impl NamingReport {
    /// Number of fields that failed validation.
    #[must_use]
    pub fn invalid_count(&self) -> usize {
        self.fields.iter().filter(|f| !f.result.is_valid).count()
    }

    /// `(old, new)` renames for every invalid field that has a suggestion.
    #[must_use]
    pub fn suggested_mappings(&self) -> Vec<(String, String)> {
        self.fields
            .iter()
            .filter(|f| !f.result.is_valid)
            .filter_map(|f| {
                f.result
                    .suggestion
                    .as_ref()
                    .filter(|s| **s != f.field_name)
                    .map(|s| (f.field_name.clone(), s.clone()))
            })
            .collect()
    }
}

/// Entity prefix used for `{prefix}_code` and `{prefix}_name` on a table.
///
/// Known tables come from a fixed mapping; anything else loses a `core_` prefix and
/// is singularized (`clients` becomes `client`).
#[must_use]
pub fn table_prefix(table_name: &str) -> String {
    let table = to_snake_case(table_name);
    if let Some((_, prefix)) = TABLE_PREFIXES.iter().find(|(t, _)| *t == table) {
        return (*prefix).to_string();
    }
    let stripped = table.strip_prefix("core_").unwrap_or(&table);
    singularize(stripped)
}

/// Synthesizes a conventional field name for a purpose.
#[must_use]
pub fn generate_field_name(
    table_name: &str,
    purpose: &FieldPurpose,
    data_type: FieldDataType,
    references: Option<&str>,
) -> String {
    let prefix = table_prefix(table_name);
    match purpose {
        FieldPurpose::PrimaryKey => "id".to_string(),
        FieldPurpose::ForeignKey => {
            let target = references.map_or_else(|| "entity".to_string(), table_prefix);
            format!("{target}_id")
        }
        FieldPurpose::EntityCode => format!("{prefix}_code"),
        FieldPurpose::EntityName => format!("{prefix}_name"),
        FieldPurpose::Status(state) => {
            let state = to_snake_case(state);
            let state = state.strip_prefix("is_").unwrap_or(&state);
            if state.is_empty() {
                "is_active".to_string()
            } else {
                format!("is_{state}")
            }
        }
        FieldPurpose::Timestamp(action) => {
            let action = to_snake_case(action);
            let action = action.strip_suffix("_at").unwrap_or(&action);
            if action.is_empty() {
                "created_at".to_string()
            } else {
                format!("{action}_at")
            }
        }
        FieldPurpose::Semantic(slug) => {
            let slug = to_snake_case(slug);
            if slug.is_empty() {
                default_slug(data_type).to_string()
            } else {
                slug
            }
        }
    }
}

const fn default_slug(data_type: FieldDataType) -> &'static str {
    match data_type {
        FieldDataType::Text => "description",
        FieldDataType::Number => "amount",
        FieldDataType::Boolean => "is_active",
        FieldDataType::Timestamp => "created_at",
        FieldDataType::Json => "metadata",
        FieldDataType::Uuid => "id",
    }
}

/// Validates a field name against the universal patterns, in priority order.
///
/// When `purpose` is given, a name that is well-formed but matches a different
/// pattern than the purpose calls for is reported as a mismatch.
#[must_use]
pub fn validate_field_name(
    table_name: &str,
    field_name: &str,
    purpose: Option<&FieldPurpose>,
) -> NamingValidationResult {
    let result = match_pattern(table_name, field_name);

    let Some(purpose) = purpose else {
        return result;
    };
    let Some(expected) = purpose.expected_pattern() else {
        return result;
    };
    if result.is_valid && result.pattern != Some(expected) {
        let suggestion =
            generate_field_name(table_name, purpose, FieldDataType::default(), None);
        return NamingValidationResult::mismatch(
            expected,
            format!("'{field_name}' does not follow the {expected:?} pattern required for its purpose"),
            suggestion,
        );
    }
    result
}

fn match_pattern(table_name: &str, field_name: &str) -> NamingValidationResult {
    if field_name == "id" {
        return NamingValidationResult::valid(NamingPattern::PrimaryKey);
    }
    if field_name.ends_with("_id") {
        return NamingValidationResult::valid(NamingPattern::ForeignKey);
    }

    let prefix = table_prefix(table_name);
    if let Some(result) = match_prefixed(table_name, &prefix, field_name, "_code", NamingPattern::CodeField) {
        return result;
    }
    if let Some(result) = match_prefixed(table_name, &prefix, field_name, "_name", NamingPattern::NameField) {
        return result;
    }

    if field_name
        .strip_prefix("is_")
        .is_some_and(is_snake_case)
    {
        return NamingValidationResult::valid(NamingPattern::BooleanStatus);
    }
    if field_name
        .strip_suffix("_at")
        .is_some_and(is_snake_case)
    {
        return NamingValidationResult::valid(NamingPattern::Timestamp);
    }
    if SEMANTIC_FIELDS.contains(&field_name) {
        return NamingValidationResult::valid(NamingPattern::Semantic);
    }
    if table_conventions(table_name).contains(&field_name) {
        return NamingValidationResult::valid(NamingPattern::TableConvention);
    }

    let suggestion = suggest_correct_name(table_name, field_name, None);
    NamingValidationResult {
        is_valid: false,
        error: Some(format!(
            "'{field_name}' does not match any naming convention for '{table_name}'"
        )),
        suggestion: (suggestion != field_name).then_some(suggestion),
        pattern: None,
        confidence: CONFIDENCE_REJECTED,
    }
}

fn match_prefixed(
    table_name: &str,
    prefix: &str,
    field_name: &str,
    suffix: &str,
    pattern: NamingPattern,
) -> Option<NamingValidationResult> {
    let field_prefix = field_name.strip_suffix(suffix)?;
    if field_prefix == prefix {
        return Some(NamingValidationResult::valid(pattern));
    }
    // `full_name`, `postal_code` and friends are fine on any table
    if SEMANTIC_FIELDS.contains(&field_name) {
        return Some(NamingValidationResult::valid(NamingPattern::Semantic));
    }
    Some(NamingValidationResult::mismatch(
        pattern,
        format!("'{field_name}' should use the table prefix '{prefix}{suffix}'"),
        suggest_correct_name(table_name, field_name, None),
    ))
}

fn table_conventions(table_name: &str) -> &'static [&'static str] {
    TABLE_CONVENTIONS
        .iter()
        .find(|(t, _)| *t == table_name)
        .map(|(_, fields)| *fields)
        .unwrap_or(&[])
}

/// Remaps a name to its conventional form.
///
/// Names that already validate are returned as-is. Otherwise the legacy lookup table
/// is consulted, then suffix and prefix heuristics. The result is always a valid name
/// or the snake-cased input, so applying this twice gives the same answer.
#[must_use]
pub fn suggest_correct_name(
    table_name: &str,
    current_name: &str,
    purpose: Option<&FieldPurpose>,
) -> String {
    if let Some(purpose) = purpose {
        return generate_field_name(table_name, purpose, FieldDataType::default(), None);
    }

    let normalized = to_snake_case(current_name);
    if normalized.is_empty() {
        return default_slug(FieldDataType::Text).to_string();
    }
    if is_conventional(table_name, &normalized) {
        return normalized;
    }

    let prefix = table_prefix(table_name);
    if let Some((_, target)) = LEGACY_NAMES.iter().find(|(legacy, _)| *legacy == normalized) {
        return target.replace("{prefix}", &prefix);
    }

    if let Some(stem) = strip_any_suffix(&normalized, &["_date", "_time", "_timestamp", "_on"]) {
        return format!("{stem}_at");
    }
    if let Some(stem) = normalized.strip_suffix("_flag").filter(|s| !s.is_empty()) {
        return format!("is_{stem}");
    }
    if let Some(stem) = strip_any_suffix(&normalized, &["_uuid", "_fk", "_ref", "_key"]) {
        return format!("{stem}_id");
    }
    if normalized.ends_with("_code") {
        return format!("{prefix}_code");
    }
    if normalized.ends_with("_name") {
        return format!("{prefix}_name");
    }

    normalized
}

// Same decision as `match_pattern` without building suggestions, which would recurse.
fn is_conventional(table_name: &str, field_name: &str) -> bool {
    if field_name == "id" || field_name.ends_with("_id") {
        return true;
    }
    let prefix = table_prefix(table_name);
    for suffix in ["_code", "_name"] {
        if let Some(field_prefix) = field_name.strip_suffix(suffix) {
            return field_prefix == prefix || SEMANTIC_FIELDS.contains(&field_name);
        }
    }
    field_name.strip_prefix("is_").is_some_and(is_snake_case)
        || field_name.strip_suffix("_at").is_some_and(is_snake_case)
        || SEMANTIC_FIELDS.contains(&field_name)
        || table_conventions(table_name).contains(&field_name)
}

fn strip_any_suffix<'a>(name: &'a str, suffixes: &[&str]) -> Option<&'a str> {
    suffixes
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix))
        .filter(|stem| !stem.is_empty())
}

/// Validates every field of a table and collects the outcomes.
#[must_use]
pub fn validate_fields<S: AsRef<str>>(table_name: &str, field_names: &[S]) -> NamingReport {
    NamingReport {
        table_name: table_name.to_string(),
        fields: field_names
            .iter()
            .map(|name| FieldAudit {
                field_name: name.as_ref().to_string(),
                result: validate_field_name(table_name, name.as_ref(), None),
            })
            .collect(),
    }
}

/// Renders `ALTER TABLE ... RENAME COLUMN` statements for a set of renames.
///
/// Identity mappings are skipped. The script is text only; nothing is executed.
#[must_use]
pub fn generate_migration_script(table_name: &str, field_mappings: &[(String, String)]) -> String {
    let mut script = format!("-- Standardize field names for {table_name}\nBEGIN;\n");
    let mut renames = 0;
    for (old_name, new_name) in field_mappings {
        if old_name == new_name {
            continue;
        }
        let _ = writeln!(
            script,
            "ALTER TABLE {} RENAME COLUMN {} TO {};",
            quote_ident(table_name),
            quote_ident(old_name),
            quote_ident(new_name)
        );
        renames += 1;
    }
    if renames == 0 {
        script.push_str("-- No renames required\n");
    }
    script.push_str("COMMIT;\n");
    script
}

fn quote_ident(ident: &str) -> String {
    if is_snake_case(ident) {
        ident.to_string()
    } else {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}

/// True for non-empty lowercase ASCII identifiers made of letters, digits and single
/// underscores, not starting with a digit or underscore.
#[must_use]
pub fn is_snake_case(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_ascii_lowercase()
        && !name.ends_with('_')
        && !name.contains("__")
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Lowercases, splits camelCase, and joins words with single underscores.
#[must_use]
pub fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower_or_digit = false;
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if c.is_ascii_uppercase() && prev_lower_or_digit && !out.ends_with('_') {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower_or_digit = c.is_ascii_lowercase() || c.is_ascii_digit();
        } else {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            prev_lower_or_digit = false;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

fn singularize(word: &str) -> String {
    if let Some(stem) = word.strip_suffix("ies") {
        return format!("{stem}y");
    }
    for suffix in ["sses", "xes", "ches", "shes"] {
        if word.ends_with(suffix) {
            return word[..word.len() - 2].to_string();
        }
    }
    if word.ends_with('s') && !word.ends_with("ss") && word.len() > 1 {
        return word[..word.len() - 1].to_string();
    }
    word.to_string()
}
