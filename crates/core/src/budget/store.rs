//! Persistence collaborator.
//!
//! The engine sees storage as a document store keyed by patient ID. Saves are
//! whole-document replaces guarded by [`Budget::version`]: a save succeeds
//! only if the stored revision still equals the one the document was loaded
//! at, and the store bumps the revision on success.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;

use super::types::Budget;

/// Persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stored revision differs from the one being replaced.
    #[error("Stale write for patient {patient_id}")]
    Conflict {
        /// Patient whose document changed underneath the caller.
        patient_id: String,
    },

    /// A stored document could not be decoded.
    #[error("Corrupt budget document: {0}")]
    Corrupt(String),

    /// The backing store failed.
    #[error("Backend failure: {0}")]
    Backend(String),
}

/// Single-key document store for budgets.
#[async_trait]
pub trait BudgetStore: Send + Sync {
    /// Loads the budget of a patient, `None` if there is none.
    async fn load_by_patient_id(&self, patient_id: &str) -> Result<Option<Budget>, StoreError>;

    /// Inserts (`version == 0`) or replaces the budget and returns the stored
    /// document with its new revision.
    async fn save(&self, budget: Budget) -> Result<Budget, StoreError>;

    /// Removes the budget of a patient. Returns whether one existed.
    async fn delete_by_patient_id(&self, patient_id: &str) -> Result<bool, StoreError>;

    /// Whether the patient has a budget.
    async fn exists_by_patient_id(&self, patient_id: &str) -> Result<bool, StoreError>;
}

/// In-process store, used by tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryBudgetStore {
    budgets: DashMap<String, Budget>,
}

impl InMemoryBudgetStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored budgets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.budgets.len()
    }

    /// Whether the store holds no budgets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.budgets.is_empty()
    }
}

#[async_trait]
impl BudgetStore for InMemoryBudgetStore {
    async fn load_by_patient_id(&self, patient_id: &str) -> Result<Option<Budget>, StoreError> {
        Ok(self.budgets.get(patient_id).map(|b| b.value().clone()))
    }

    async fn save(&self, mut budget: Budget) -> Result<Budget, StoreError> {
        match self.budgets.entry(budget.patient_id.clone()) {
            Entry::Occupied(mut stored) => {
                if stored.get().version != budget.version {
                    return Err(StoreError::Conflict {
                        patient_id: budget.patient_id,
                    });
                }
                budget.version += 1;
                stored.insert(budget.clone());
            }
            Entry::Vacant(slot) => {
                if budget.version != 0 {
                    return Err(StoreError::Conflict {
                        patient_id: budget.patient_id,
                    });
                }
                budget.version = 1;
                slot.insert(budget.clone());
            }
        }
        Ok(budget)
    }

    async fn delete_by_patient_id(&self, patient_id: &str) -> Result<bool, StoreError> {
        Ok(self.budgets.remove(patient_id).is_some())
    }

    async fn exists_by_patient_id(&self, patient_id: &str) -> Result<bool, StoreError> {
        Ok(self.budgets.contains_key(patient_id))
    }
}
