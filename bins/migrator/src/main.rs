//! Database migration runner for CareTrack.
//!
//! Usage:
//!   migrator up      - Create the patient_budgets table
//!   migrator down    - Drop it again
//!   migrator status  - Show migration status
//!   migrator fresh   - Drop everything and re-run migrations
//!
//! Reads `DATABASE_URL`, from `.env` when present.

use caretrack_db::migration::Migrator;
use sea_orm_migration::prelude::*;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // The CLI installs its own tracing subscriber.
    cli::run_cli(Migrator).await;
}
