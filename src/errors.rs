//! Unified error types for the universal schema layer.
//!
//! Naming validation and duplicate checks report problems as values, not errors.
//! Everything here is either bad input that never reached the database, a row that
//! does not exist for the calling organization, or a uniqueness guarantee enforced
//! by the storage layer itself.

use sea_orm::{DbErr, SqlErr};
use thiserror::Error;

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be read or parsed
    #[error("Configuration error: {message}")]
    Config {
        /// What went wrong
        message: String,
    },

    /// Input rejected before any query was issued
    #[error("Validation error: {message}")]
    Validation {
        /// What was wrong with the input
        message: String,
    },

    /// No entity with this id exists for the organization
    #[error("Entity not found: {id}")]
    EntityNotFound {
        /// Entity id that was looked up
        id: String,
    },

    /// No transaction with this id exists for the organization
    #[error("Transaction not found: {id}")]
    TransactionNotFound {
        /// Transaction id that was looked up
        id: String,
    },

    /// No relationship with this id exists for the organization
    #[error("Relationship not found: {id}")]
    RelationshipNotFound {
        /// Relationship id that was looked up
        id: String,
    },

    /// A write collided with an existing entity
    #[error("Duplicate entity: {message}")]
    DuplicateEntity {
        /// Human readable description of the collision
        message: String,
        /// Ids of the colliding rows, when known
        duplicate_ids: Vec<String>,
    },

    /// A transaction number is already used for this organization and type
    #[error("Duplicate transaction number '{transaction_number}' for type '{transaction_type}'")]
    DuplicateTransaction {
        /// Transaction type the number belongs to
        transaction_type: String,
        /// The colliding number
        transaction_number: String,
    },

    /// Database error reported by SeaORM
    #[error("Database error: {0}")]
    Database(#[from] DbErr),
}

impl Error {
    /// Shorthand for a [`Error::Validation`] error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Returns true when the error came from a unique index rejecting the write.
    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            Self::Database(db_err) if matches!(db_err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
        )
    }
}

/// Convenience `Result` type
pub type Result<T> = std::result::Result<T, Error>;

/// Rejects empty organization ids. Every query in the crate is scoped by tenant,
/// so a blank id is a caller bug rather than a "match nothing" filter.
pub fn ensure_organization(organization_id: &str) -> Result<()> {
    if organization_id.trim().is_empty() {
        return Err(Error::validation("organization_id is required"));
    }
    Ok(())
}
