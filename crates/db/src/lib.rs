//! Database layer with `SeaORM` entities and repositories.
//!
//! This crate provides:
//! - The `patient_budgets` entity (one JSONB document per patient)
//! - [`BudgetRepository`], the Postgres implementation of the budget store
//! - Database migrations

pub mod entities;
pub mod migration;
pub mod repositories;

pub use repositories::BudgetRepository;

use caretrack_shared::config::DatabaseConfig;
use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbErr};

/// Establishes a connection to the database.
///
/// # Errors
///
/// Returns an error if the connection cannot be established.
pub async fn connect(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    Database::connect(database_url).await
}

/// Establishes a pooled connection sized from configuration.
///
/// # Errors
///
/// Returns an error if the connection cannot be established.
pub async fn connect_with(config: &DatabaseConfig) -> Result<DatabaseConnection, DbErr> {
    let mut options = ConnectOptions::new(config.url.clone());
    options
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .sqlx_logging(false);
    Database::connect(options).await
}
