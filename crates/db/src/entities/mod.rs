//! `SeaORM` entities.

pub mod patient_budgets;
