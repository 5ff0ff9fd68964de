//! Structural and numeric validation of budget documents.
//!
//! Validation never stops at the first problem: [`validate_budget`] returns
//! every violation so a caller can show them all at once.

use rust_decimal::Decimal;
use thiserror::Error;

use super::calculator::{BudgetCalculator, saturating_sum};
use super::types::{Budget, Category, MONTHS_PER_YEAR, SubElement};

/// Allowed difference between the category sum and the total budget.
pub const CONSISTENCY_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// A single rule a budget document breaks.
///
/// Category and sub-element positions are zero-based indices into the
/// document, so the caller can point at the offending node directly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BudgetViolation {
    /// Patient ID is empty.
    #[error("Patient ID is required")]
    MissingPatientId,

    /// Organization ID is empty.
    #[error("Organization ID is required")]
    MissingOrganizationId,

    /// Total budget is below zero.
    #[error("Total budget cannot be negative")]
    NegativeTotalBudget,

    /// Category has no name.
    #[error("Category name at index {category} is required")]
    MissingCategoryName {
        /// Category index.
        category: usize,
    },

    /// Category budget is below zero.
    #[error("Category budget at index {category} cannot be negative")]
    NegativeCategoryBudget {
        /// Category index.
        category: usize,
    },

    /// Sub-element has no name.
    #[error("Sub-element name at category {category}, index {sub_element} is required")]
    MissingSubElementName {
        /// Category index.
        category: usize,
        /// Sub-element index within the category.
        sub_element: usize,
    },

    /// Sub-element budget is below zero.
    #[error("Sub-element budget at category {category}, index {sub_element} cannot be negative")]
    NegativeSubElementBudget {
        /// Category index.
        category: usize,
        /// Sub-element index within the category.
        sub_element: usize,
    },

    /// Monthly usage does not cover exactly one year.
    #[error(
        "Sub-element monthly usage at category {category}, index {sub_element} must have exactly 12 months, found {len}"
    )]
    MonthlyUsageLength {
        /// Category index.
        category: usize,
        /// Sub-element index within the category.
        sub_element: usize,
        /// Actual number of entries.
        len: usize,
    },

    /// A month below 12 has no entry.
    #[error(
        "Sub-element monthly usage at category {category}, index {sub_element}, month {month} is missing"
    )]
    MissingMonthlyUsage {
        /// Category index.
        category: usize,
        /// Sub-element index within the category.
        sub_element: usize,
        /// Month index.
        month: usize,
    },

    /// A monthly entry is below zero.
    #[error(
        "Sub-element monthly usage at category {category}, index {sub_element}, month {month} cannot be negative"
    )]
    NegativeMonthlyUsage {
        /// Category index.
        category: usize,
        /// Sub-element index within the category.
        sub_element: usize,
        /// Month index.
        month: usize,
    },

    /// Monthly usage adds up to more than an amount can hold.
    #[error(
        "Sub-element monthly usage at category {category}, index {sub_element} adds up to more than can be recorded"
    )]
    MonthlyUsageTooLarge {
        /// Category index.
        category: usize,
        /// Sub-element index within the category.
        sub_element: usize,
    },

    /// Category budgets do not add up to the total budget.
    #[error("Category budgets ({category_total:.2}) do not match total budget ({total_budget:.2})")]
    CategoryTotalMismatch {
        /// Sum of the category budgets.
        category_total: Decimal,
        /// Total budget.
        total_budget: Decimal,
    },
}

/// Validates a budget document, returning every violation found.
///
/// The category-sum check only applies once the budget has categories.
#[must_use]
pub fn validate_budget(budget: &Budget) -> Vec<BudgetViolation> {
    let mut violations = Vec::new();

    if budget.patient_id.trim().is_empty() {
        violations.push(BudgetViolation::MissingPatientId);
    }
    if budget.organization_id.trim().is_empty() {
        violations.push(BudgetViolation::MissingOrganizationId);
    }
    if budget.total_budget < Decimal::ZERO {
        violations.push(BudgetViolation::NegativeTotalBudget);
    }

    for (index, category) in budget.categories.iter().enumerate() {
        validate_category(category, index, &mut violations);
    }

    if !budget.categories.is_empty() {
        let category_total = saturating_sum(budget.categories.iter().map(|c| c.category_budget));
        if category_total.saturating_sub(budget.total_budget).abs() > CONSISTENCY_TOLERANCE {
            violations.push(BudgetViolation::CategoryTotalMismatch {
                category_total,
                total_budget: budget.total_budget,
            });
        }
    }

    violations
}

fn validate_category(category: &Category, index: usize, violations: &mut Vec<BudgetViolation>) {
    if category.name.trim().is_empty() {
        violations.push(BudgetViolation::MissingCategoryName { category: index });
    }
    if category.category_budget < Decimal::ZERO {
        violations.push(BudgetViolation::NegativeCategoryBudget { category: index });
    }

    for (sub_index, sub) in category.sub_elements.iter().enumerate() {
        validate_sub_element(sub, index, sub_index, violations);
    }
}

fn validate_sub_element(
    sub: &SubElement,
    category: usize,
    sub_element: usize,
    violations: &mut Vec<BudgetViolation>,
) {
    if sub.name.trim().is_empty() {
        violations.push(BudgetViolation::MissingSubElementName {
            category,
            sub_element,
        });
    }
    if sub.sub_element_budget() < Decimal::ZERO {
        violations.push(BudgetViolation::NegativeSubElementBudget {
            category,
            sub_element,
        });
    }

    let monthly = sub.monthly_usage();
    if monthly.len() != MONTHS_PER_YEAR {
        violations.push(BudgetViolation::MonthlyUsageLength {
            category,
            sub_element,
            len: monthly.len(),
        });
    }
    for (month, amount) in monthly.iter().enumerate() {
        if *amount < Decimal::ZERO {
            violations.push(BudgetViolation::NegativeMonthlyUsage {
                category,
                sub_element,
                month,
            });
        }
    }
    for month in monthly.len()..MONTHS_PER_YEAR {
        violations.push(BudgetViolation::MissingMonthlyUsage {
            category,
            sub_element,
            month,
        });
    }
    if BudgetCalculator::checked_sum_usage(monthly).is_none() {
        violations.push(BudgetViolation::MonthlyUsageTooLarge {
            category,
            sub_element,
        });
    }
}
