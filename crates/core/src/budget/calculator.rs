//! Budget calculations.
//!
//! Derived sub-element fields, the category and budget roll-ups, and warning
//! messages. Everything here is a pure function of its input.

use rust_decimal::{Decimal, RoundingStrategy};

use super::types::{
    Budget, BudgetSummary, Category, CategoryUsage, SubElement, UsageColor, WarningLevel,
};

/// Sub-element usage percentage at which the warning level starts.
const WARNING_PERCENT: Decimal = Decimal::from_parts(80, 0, 0, false, 0);

/// Whole-budget usage percentage that produces a budget-level warning.
const BUDGET_WARNING_PERCENT: Decimal = Decimal::from_parts(90, 0, 0, false, 0);

/// `WARNING_PERCENT` as a fraction (0.8).
const WARNING_RATIO: Decimal = Decimal::from_parts(8, 0, 0, false, 1);

/// Stateless calculator over budget documents.
pub struct BudgetCalculator;

impl BudgetCalculator {
    /// Sums a monthly usage vector, saturating at `Decimal::MAX`.
    #[must_use]
    pub fn sum_usage(monthly: &[Decimal]) -> Decimal {
        saturating_sum(monthly.iter().copied())
    }

    /// Sums a monthly usage vector, `None` if it exceeds `Decimal::MAX`.
    #[must_use]
    pub fn checked_sum_usage(monthly: &[Decimal]) -> Option<Decimal> {
        monthly
            .iter()
            .try_fold(Decimal::ZERO, |acc, amount| acc.checked_add(*amount))
    }

    /// Usage as a percentage of a budget, 0 when the budget is not positive.
    ///
    /// A percentage too large to represent saturates at `Decimal::MAX`.
    #[must_use]
    pub fn usage_percent(used: Decimal, budget: Decimal) -> Decimal {
        if budget <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        used.checked_div(budget)
            .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
            .unwrap_or(if used.is_sign_negative() {
                Decimal::MIN
            } else {
                Decimal::MAX
            })
    }

    /// Classifies usage against a budget.
    ///
    /// Compared as `used * 100` against `budget * 80` so the warning boundary
    /// is exact; amounts too large for that product fall back to the ratio.
    /// A budget of zero or less is always `Normal`.
    #[must_use]
    pub fn warning_level(used: Decimal, budget: Decimal) -> WarningLevel {
        if budget <= Decimal::ZERO {
            return WarningLevel::Normal;
        }
        if used >= budget {
            return WarningLevel::Critical;
        }
        let reaches_warning = match (
            used.checked_mul(Decimal::ONE_HUNDRED),
            budget.checked_mul(WARNING_PERCENT),
        ) {
            (Some(scaled), Some(threshold)) => scaled >= threshold,
            // used < budget here, so the ratio is below 1 and cannot overflow
            _ => used
                .checked_div(budget)
                .is_some_and(|ratio| ratio >= WARNING_RATIO),
        };
        if reaches_warning {
            WarningLevel::Warning
        } else {
            WarningLevel::Normal
        }
    }

    /// Re-derives `total_utilised`, `balance` and `warning_level`.
    #[must_use]
    pub fn recalculate_sub_element(mut sub: SubElement) -> SubElement {
        sub.refresh_derived();
        sub
    }

    /// Recalculates every sub-element of a category.
    #[must_use]
    pub fn recalculate_category(mut category: Category) -> Category {
        category.sub_elements = category
            .sub_elements
            .into_iter()
            .map(Self::recalculate_sub_element)
            .collect();
        category
    }

    /// Recalculates every sub-element of every category.
    #[must_use]
    pub fn recalculate_budget(mut budget: Budget) -> Budget {
        budget.categories = budget
            .categories
            .into_iter()
            .map(Self::recalculate_category)
            .collect();
        budget
    }

    /// Sum of the sub-elements' usage in one category.
    #[must_use]
    pub fn category_used(category: &Category) -> Decimal {
        saturating_sum(category.sub_elements.iter().map(SubElement::total_utilised))
    }

    /// Sum of every sub-element's usage.
    #[must_use]
    pub fn total_used(budget: &Budget) -> Decimal {
        saturating_sum(budget.categories.iter().map(Self::category_used))
    }

    /// Total budget minus total usage.
    #[must_use]
    pub fn total_balance(budget: &Budget) -> Decimal {
        budget.total_budget.saturating_sub(Self::total_used(budget))
    }

    /// Total usage as a percentage of the total budget.
    #[must_use]
    pub fn usage_percentage(budget: &Budget) -> Decimal {
        Self::usage_percent(Self::total_used(budget), budget.total_budget)
    }

    /// Whether total usage exceeds the total budget.
    #[must_use]
    pub fn is_over_budget(budget: &Budget) -> bool {
        Self::total_used(budget) > budget.total_budget
    }

    /// Human-readable warnings.
    ///
    /// A budget-level message first (at 90% and above), then one message per
    /// sub-element at 80% and above, in category and sub-element order.
    #[must_use]
    pub fn warnings(budget: &Budget) -> Vec<String> {
        let mut warnings = Vec::new();

        let usage = Self::usage_percentage(budget);
        if usage >= Decimal::ONE_HUNDRED {
            warnings.push(format!(
                "CRITICAL: Total budget exceeded by {:.2}%",
                round2(usage.saturating_sub(Decimal::ONE_HUNDRED))
            ));
        } else if usage >= BUDGET_WARNING_PERCENT {
            warnings.push(format!(
                "WARNING: Total budget usage at {:.2}%",
                round2(usage)
            ));
        }

        for category in &budget.categories {
            for sub in &category.sub_elements {
                if let Some(message) = Self::sub_element_warning(&category.name, sub) {
                    warnings.push(message);
                }
            }
        }

        warnings
    }

    fn sub_element_warning(category_name: &str, sub: &SubElement) -> Option<String> {
        let percent = sub.usage_percent();
        match Self::warning_level(sub.total_utilised(), sub.sub_element_budget()) {
            WarningLevel::Normal => None,
            WarningLevel::Warning => Some(format!(
                "WARNING: {category_name} - {} usage at {:.2}%",
                sub.name,
                round2(percent)
            )),
            WarningLevel::Critical => Some(format!(
                "CRITICAL: {category_name} - {} usage at {:.2}%, exceeded budget by {:.2}%",
                sub.name,
                round2(percent),
                round2(percent.saturating_sub(Decimal::ONE_HUNDRED))
            )),
        }
    }

    /// Display band for a percentage.
    #[must_use]
    pub fn usage_color(percent: Decimal) -> UsageColor {
        if percent >= Decimal::ONE_HUNDRED {
            UsageColor::Red
        } else if percent >= WARNING_PERCENT {
            UsageColor::Orange
        } else {
            UsageColor::Green
        }
    }

    /// Usage breakdown of one category.
    #[must_use]
    pub fn category_usage(category: &Category) -> CategoryUsage {
        let used = Self::category_used(category);
        let percent = Self::usage_percent(used, category.category_budget)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
        CategoryUsage {
            category_id: category.id,
            name: category.name.clone(),
            category_budget: category.category_budget,
            total_utilised: used,
            balance: category.category_budget.saturating_sub(used),
            usage_percentage: percent,
            usage_color: Self::usage_color(percent),
        }
    }

    /// Categories with the highest usage percentage, highest first.
    ///
    /// Ties keep budget order.
    #[must_use]
    pub fn top_categories_by_usage(budget: &Budget, limit: usize) -> Vec<CategoryUsage> {
        let mut usage: Vec<CategoryUsage> =
            budget.categories.iter().map(Self::category_usage).collect();
        usage.sort_by(|a, b| b.usage_percentage.cmp(&a.usage_percentage));
        usage.truncate(limit);
        usage
    }

    /// All whole-budget figures at once.
    #[must_use]
    pub fn summary(budget: &Budget) -> BudgetSummary {
        let total_used = Self::total_used(budget);
        BudgetSummary {
            total_budget: budget.total_budget,
            total_used,
            total_balance: budget.total_budget.saturating_sub(total_used),
            usage_percentage: Self::usage_percent(total_used, budget.total_budget),
            is_over_budget: total_used > budget.total_budget,
            warnings: Self::warnings(budget),
            categories: budget.categories.iter().map(Self::category_usage).collect(),
        }
    }
}

/// Sum that sticks at `Decimal::MAX` instead of overflowing.
pub(crate) fn saturating_sum(values: impl IntoIterator<Item = Decimal>) -> Decimal {
    values
        .into_iter()
        .fold(Decimal::ZERO, Decimal::saturating_add)
}

fn round2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}
