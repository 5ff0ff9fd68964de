//! Patient budgets migration.
//!
//! Creates the patient_budgets table: one budget document per patient, with a
//! revision counter for optimistic concurrency.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db = manager.get_connection();
        db.execute_unprepared(PATIENT_BUDGETS_SQL).await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db = manager.get_connection();
        db.execute_unprepared("DROP TABLE IF EXISTS patient_budgets CASCADE;")
            .await?;
        Ok(())
    }
}

const PATIENT_BUDGETS_SQL: &str = r"
CREATE TABLE patient_budgets (
    id UUID PRIMARY KEY,
    patient_id VARCHAR(255) NOT NULL,
    organization_id VARCHAR(255) NOT NULL,
    document JSONB NOT NULL,
    version BIGINT NOT NULL DEFAULT 1,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    CONSTRAINT uq_patient_budgets_patient UNIQUE (patient_id),
    CONSTRAINT chk_version_positive CHECK (version > 0)
);

-- Organization dashboards list the budgets of their patients
CREATE INDEX idx_patient_budgets_org ON patient_budgets(organization_id, updated_at DESC);
";
