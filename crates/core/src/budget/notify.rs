//! Notification collaborator.
//!
//! The engine reports every successful mutation and, after usage updates,
//! a [`UsageAlert`] for a sub-element at warning or critical level. Delivery
//! (email, in-app notifications) happens elsewhere; `notify` must not block,
//! and its failures never fail the mutation.

use caretrack_shared::types::{BudgetId, CategoryId, SubElementId};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use super::types::WarningLevel;

/// Mutation that produced an [`BudgetEvent::Updated`] event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetOperation {
    /// Whole tree replaced.
    FullUpdate,
    /// Total budget changed.
    AdjustTotal,
    /// Category added.
    AddCategory,
    /// Category fields changed.
    UpdateCategory,
    /// Category removed.
    RemoveCategory,
    /// Sub-element added.
    AddSubElement,
    /// Sub-element fields changed.
    UpdateSubElement,
    /// Sub-element removed.
    RemoveSubElement,
    /// Budget moved between categories.
    ReallocateCategories,
    /// Budget moved between sub-elements.
    ReallocateSubElements,
    /// Usage reversed on a sub-element.
    Refund,
    /// One month of usage recorded.
    MonthlyUsage,
    /// Whole year of usage replaced.
    MonthlyUsageBulk,
}

impl BudgetOperation {
    /// Returns the string representation of the operation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FullUpdate => "full_update",
            Self::AdjustTotal => "adjust_total",
            Self::AddCategory => "add_category",
            Self::UpdateCategory => "update_category",
            Self::RemoveCategory => "remove_category",
            Self::AddSubElement => "add_sub_element",
            Self::UpdateSubElement => "update_sub_element",
            Self::RemoveSubElement => "remove_sub_element",
            Self::ReallocateCategories => "reallocate_categories",
            Self::ReallocateSubElements => "reallocate_sub_elements",
            Self::Refund => "refund",
            Self::MonthlyUsage => "monthly_usage",
            Self::MonthlyUsageBulk => "monthly_usage_bulk",
        }
    }
}

impl std::fmt::Display for BudgetOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sub-element crossed the warning or critical threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageAlert {
    /// Patient ID.
    pub patient_id: String,
    /// Budget ID.
    pub budget_id: BudgetId,
    /// Category ID.
    pub category_id: CategoryId,
    /// Category name.
    pub category_name: String,
    /// Sub-element ID.
    pub sub_element_id: SubElementId,
    /// Sub-element name.
    pub sub_element_name: String,
    /// Warning or critical.
    pub level: WarningLevel,
    /// Sub-element budget.
    pub budget_amount: Decimal,
    /// Recorded usage.
    pub used: Decimal,
    /// Usage percentage.
    pub usage_percent: Decimal,
}

/// Event published after a successful mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BudgetEvent {
    /// Budget created.
    Created {
        /// Patient ID.
        patient_id: String,
        /// Budget ID.
        budget_id: BudgetId,
    },
    /// Budget changed.
    Updated {
        /// Patient ID.
        patient_id: String,
        /// Budget ID.
        budget_id: BudgetId,
        /// Operation applied.
        operation: BudgetOperation,
        /// Reason given by the caller, if any.
        reason: Option<String>,
    },
    /// Budget deleted.
    Deleted {
        /// Patient ID.
        patient_id: String,
    },
    /// Usage threshold crossed.
    UsageAlert(UsageAlert),
}

/// Notification errors.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The receiving side has gone away.
    #[error("Notification channel closed")]
    Closed,

    /// The notifier refused the event.
    #[error("Notification rejected: {0}")]
    Rejected(String),
}

/// Receives budget events. Must return without waiting on delivery.
pub trait BudgetNotifier: Send + Sync {
    /// Hands an event over for delivery.
    fn notify(&self, event: BudgetEvent) -> Result<(), NotifyError>;
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl BudgetNotifier for NoopNotifier {
    fn notify(&self, _event: BudgetEvent) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Forwards events to an unbounded channel drained by a delivery task.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<BudgetEvent>,
}

impl ChannelNotifier {
    /// Creates a notifier and the receiver its events arrive on.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BudgetEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl BudgetNotifier for ChannelNotifier {
    fn notify(&self, event: BudgetEvent) -> Result<(), NotifyError> {
        self.tx.send(event).map_err(|_| NotifyError::Closed)
    }
}
