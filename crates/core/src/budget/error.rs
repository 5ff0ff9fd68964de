//! Budget error types.

use caretrack_shared::AppError;
use caretrack_shared::types::{CategoryId, SubElementId};
use rust_decimal::Decimal;
use thiserror::Error;

use super::store::StoreError;
use super::validation::BudgetViolation;

/// Budget-related errors.
#[derive(Debug, Error)]
pub enum BudgetError {
    /// No budget exists for the patient, or the budget ID does not match.
    #[error("Budget not found for patient: {0}")]
    NotFound(String),

    /// A budget already exists for the patient.
    #[error("Budget already exists for patient: {0}")]
    AlreadyExists(String),

    /// Category not found in the budget.
    #[error("Category not found: {0}")]
    CategoryNotFound(CategoryId),

    /// Sub-element not found in the category.
    #[error("Sub-element not found: {0}")]
    SubElementNotFound(SubElementId),

    /// The budget document breaks one or more rules. Carries all of them.
    #[error("Budget validation failed: {}", join_violations(.0))]
    ValidationFailed(Vec<BudgetViolation>),

    /// Amount is negative, or not positive where a positive one is required.
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// A reallocation would drive the source allocation negative.
    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds {
        /// Budget currently allocated to the source.
        available: Decimal,
        /// Amount the caller tried to move.
        requested: Decimal,
    },

    /// Month index outside `0..12`.
    #[error("Month must be between 0 and 11, got {0}")]
    InvalidMonth(usize),

    /// Monthly usage vector does not have 12 entries.
    #[error("Monthly usage must have exactly 12 entries, got {0}")]
    InvalidLength(usize),

    /// The document changed in the store since it was loaded.
    #[error("Concurrent modification detected for patient {0}, please retry")]
    Conflict(String),

    /// The store failed.
    #[error("Store error: {0}")]
    Store(String),
}

fn join_violations(violations: &[BudgetViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl BudgetError {
    /// Returns the error code for API responses.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "BUDGET_NOT_FOUND",
            Self::AlreadyExists(_) => "BUDGET_ALREADY_EXISTS",
            Self::CategoryNotFound(_) => "CATEGORY_NOT_FOUND",
            Self::SubElementNotFound(_) => "SUB_ELEMENT_NOT_FOUND",
            Self::ValidationFailed(_) => "VALIDATION_FAILED",
            Self::InvalidAmount(_) => "INVALID_AMOUNT",
            Self::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Self::InvalidMonth(_) => "INVALID_MONTH",
            Self::InvalidLength(_) => "INVALID_LENGTH",
            Self::Conflict(_) => "CONCURRENT_MODIFICATION",
            Self::Store(_) => "STORE_ERROR",
        }
    }

    /// Whether the error names something that does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::CategoryNotFound(_) | Self::SubElementNotFound(_)
        )
    }
}

impl From<StoreError> for BudgetError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { patient_id } => Self::Conflict(patient_id),
            StoreError::Backend(msg) | StoreError::Corrupt(msg) => Self::Store(msg),
        }
    }
}

impl From<BudgetError> for AppError {
    fn from(err: BudgetError) -> Self {
        match err {
            BudgetError::NotFound(_)
            | BudgetError::CategoryNotFound(_)
            | BudgetError::SubElementNotFound(_) => Self::NotFound(err.to_string()),
            BudgetError::ValidationFailed(violations) => {
                Self::Validation(violations.iter().map(ToString::to_string).collect())
            }
            BudgetError::InvalidAmount(_)
            | BudgetError::InvalidMonth(_)
            | BudgetError::InvalidLength(_) => Self::Validation(vec![err.to_string()]),
            BudgetError::InsufficientFunds { .. } => Self::BusinessRule(err.to_string()),
            BudgetError::AlreadyExists(_) | BudgetError::Conflict(_) => {
                Self::Conflict(err.to_string())
            }
            BudgetError::Store(msg) => Self::Database(msg),
        }
    }
}
