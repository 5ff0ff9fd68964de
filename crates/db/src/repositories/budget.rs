//! Budget repository: the Postgres-backed budget store.
//!
//! Each patient's budget is one JSONB document. Replacing it is a single
//! `UPDATE ... WHERE patient_id = $1 AND version = $2`; zero affected rows
//! means another writer got there first.

use async_trait::async_trait;
use caretrack_core::budget::{Budget, BudgetStore, StoreError};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, Set, SqlErr,
};
use tracing::debug;

use crate::entities::patient_budgets;

/// Postgres implementation of [`BudgetStore`].
#[derive(Debug, Clone)]
pub struct BudgetRepository {
    db: DatabaseConnection,
}

impl BudgetRepository {
    /// Creates a new budget repository.
    #[must_use]
    pub const fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    fn decode(model: patient_budgets::Model) -> Result<Budget, StoreError> {
        let mut budget: Budget = serde_json::from_value(model.document).map_err(|e| {
            StoreError::Corrupt(format!("patient {}: {e}", model.patient_id))
        })?;
        // The row's revision is authoritative.
        budget.version = model.version;
        Ok(budget)
    }

    fn encode(budget: &Budget) -> Result<serde_json::Value, StoreError> {
        serde_json::to_value(budget).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    async fn insert(&self, mut budget: Budget) -> Result<Budget, StoreError> {
        budget.version = 1;
        let row = patient_budgets::ActiveModel {
            id: Set(budget.id.into_inner()),
            patient_id: Set(budget.patient_id.clone()),
            organization_id: Set(budget.organization_id.clone()),
            document: Set(Self::encode(&budget)?),
            version: Set(budget.version),
            created_at: Set(budget.created_at.fixed_offset()),
            updated_at: Set(budget.updated_at.fixed_offset()),
        };

        match row.insert(&self.db).await {
            Ok(_) => {
                debug!(patient_id = %budget.patient_id, "Inserted budget document");
                Ok(budget)
            }
            Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                Err(StoreError::Conflict {
                    patient_id: budget.patient_id,
                })
            }
            Err(err) => Err(backend(err)),
        }
    }

    async fn replace(&self, mut budget: Budget) -> Result<Budget, StoreError> {
        let expected = budget.version;
        budget.version = expected + 1;
        let document = Self::encode(&budget)?;

        let result = patient_budgets::Entity::update_many()
            .col_expr(patient_budgets::Column::Document, Expr::value(document))
            .col_expr(
                patient_budgets::Column::OrganizationId,
                Expr::value(budget.organization_id.clone()),
            )
            .col_expr(patient_budgets::Column::Version, Expr::value(budget.version))
            .col_expr(
                patient_budgets::Column::UpdatedAt,
                Expr::value(budget.updated_at.fixed_offset()),
            )
            .filter(patient_budgets::Column::PatientId.eq(budget.patient_id.as_str()))
            .filter(patient_budgets::Column::Version.eq(expected))
            .exec(&self.db)
            .await
            .map_err(backend)?;

        if result.rows_affected == 0 {
            debug!(patient_id = %budget.patient_id, expected, "Stale budget write");
            return Err(StoreError::Conflict {
                patient_id: budget.patient_id,
            });
        }
        debug!(
            patient_id = %budget.patient_id,
            version = budget.version,
            "Replaced budget document"
        );
        Ok(budget)
    }
}

fn backend(err: DbErr) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[async_trait]
impl BudgetStore for BudgetRepository {
    async fn load_by_patient_id(&self, patient_id: &str) -> Result<Option<Budget>, StoreError> {
        patient_budgets::Entity::find()
            .filter(patient_budgets::Column::PatientId.eq(patient_id))
            .one(&self.db)
            .await
            .map_err(backend)?
            .map(Self::decode)
            .transpose()
    }

    async fn save(&self, budget: Budget) -> Result<Budget, StoreError> {
        if budget.version == 0 {
            self.insert(budget).await
        } else {
            self.replace(budget).await
        }
    }

    async fn delete_by_patient_id(&self, patient_id: &str) -> Result<bool, StoreError> {
        let result = patient_budgets::Entity::delete_many()
            .filter(patient_budgets::Column::PatientId.eq(patient_id))
            .exec(&self.db)
            .await
            .map_err(backend)?;
        debug!(patient_id, deleted = result.rows_affected, "Deleted budget document");
        Ok(result.rows_affected > 0)
    }

    async fn exists_by_patient_id(&self, patient_id: &str) -> Result<bool, StoreError> {
        let count = patient_budgets::Entity::find()
            .filter(patient_budgets::Column::PatientId.eq(patient_id))
            .count(&self.db)
            .await
            .map_err(backend)?;
        Ok(count > 0)
    }
}
