//! Patient budget tracking.
//!
//! A budget is a three-level tree (total → category → sub-element) with
//! month-by-month usage recorded on each sub-element.
//!
//! # Modules
//!
//! - `types` - Budget documents, drafts, patches and summaries
//! - `calculator` - Derived fields, whole-budget metrics and warning messages
//! - `validation` - Structural and numeric checks returning every violation
//! - `error` - Budget operation errors
//! - `store` - Persistence collaborator and an in-memory implementation
//! - `notify` - Notification collaborator and mutation events
//! - `permission` - Permission collaborator and the role-based policy
//! - `engine` - Load → mutate → recalculate → persist orchestration

pub mod calculator;
pub mod engine;
pub mod error;
pub mod notify;
pub mod permission;
pub mod store;
pub mod types;
pub mod validation;

#[cfg(test)]
mod engine_tests;

pub use calculator::BudgetCalculator;
pub use engine::BudgetEngine;
pub use error::BudgetError;
pub use notify::{
    BudgetEvent, BudgetNotifier, BudgetOperation, ChannelNotifier, NoopNotifier, NotifyError,
    UsageAlert,
};
pub use permission::{Actor, Authorization, BudgetPermissions, RolePolicy, UserType};
pub use store::{BudgetStore, InMemoryBudgetStore, StoreError};
pub use types::{
    Budget, BudgetSummary, BudgetUpdate, Category, CategoryPatch, CategoryUsage, MONTHS_PER_YEAR,
    NewBudget, NewCategory, NewSubElement, SubElement, SubElementPatch, UsageColor, WarningLevel,
};
pub use validation::{BudgetViolation, validate_budget};
