//! Budget data types.
//!
//! Stored documents ([`Budget`], [`Category`], [`SubElement`]), the drafts
//! callers supply to create or extend them, partial-update patches, and the
//! read-only summaries produced by the calculator.

use caretrack_shared::types::{BudgetId, CategoryId, SubElementId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::calculator::BudgetCalculator;
use super::error::BudgetError;

/// Number of entries in a monthly usage vector (index 0 = January).
pub const MONTHS_PER_YEAR: usize = 12;

/// Usage classification of a sub-element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningLevel {
    /// Below 80% of the sub-element budget, or no budget at all.
    #[default]
    Normal,
    /// At least 80% but below 100%.
    Warning,
    /// At or above 100%.
    Critical,
}

impl WarningLevel {
    /// Returns the string representation of the level.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for WarningLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A budget line item tracked month by month (e.g. "Soap").
///
/// `total_utilised`, `balance` and `warning_level` are derived. They cannot be
/// set directly: every constructor and mutator re-derives them, and
/// deserialization goes through [`SubElementDocument`] so a stored document
/// with stale derived values is corrected on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "SubElementDocument")]
pub struct SubElement {
    /// Sub-element ID.
    pub id: SubElementId,
    /// Sub-element name.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Free-text comments. Refund notes are appended here.
    pub comments: Option<String>,
    sub_element_budget: Decimal,
    monthly_usage: Vec<Decimal>,
    total_utilised: Decimal,
    balance: Decimal,
    warning_level: WarningLevel,
}

/// Raw stored shape of a sub-element; derived fields are ignored on input.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubElementDocument {
    id: SubElementId,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    comments: Option<String>,
    #[serde(default)]
    sub_element_budget: Decimal,
    #[serde(default = "empty_year")]
    monthly_usage: Vec<Decimal>,
}

impl From<SubElementDocument> for SubElement {
    fn from(doc: SubElementDocument) -> Self {
        Self::assemble(
            doc.id,
            doc.name,
            doc.description,
            doc.comments,
            doc.sub_element_budget,
            doc.monthly_usage,
        )
    }
}

fn empty_year() -> Vec<Decimal> {
    vec![Decimal::ZERO; MONTHS_PER_YEAR]
}

impl SubElement {
    /// Creates a sub-element with a fresh ID and no recorded usage.
    #[must_use]
    pub fn new(name: impl Into<String>, sub_element_budget: Decimal) -> Self {
        Self::assemble(
            SubElementId::new(),
            name.into(),
            None,
            None,
            sub_element_budget,
            empty_year(),
        )
    }

    fn assemble(
        id: SubElementId,
        name: String,
        description: Option<String>,
        comments: Option<String>,
        sub_element_budget: Decimal,
        monthly_usage: Vec<Decimal>,
    ) -> Self {
        let mut sub = Self {
            id,
            name,
            description,
            comments,
            sub_element_budget,
            monthly_usage,
            total_utilised: Decimal::ZERO,
            balance: Decimal::ZERO,
            warning_level: WarningLevel::Normal,
        };
        sub.refresh_derived();
        sub
    }

    /// Budget allocated to this sub-element.
    #[must_use]
    pub const fn sub_element_budget(&self) -> Decimal {
        self.sub_element_budget
    }

    /// Recorded usage per month, January first.
    #[must_use]
    pub fn monthly_usage(&self) -> &[Decimal] {
        &self.monthly_usage
    }

    /// Sum of the monthly usage.
    #[must_use]
    pub const fn total_utilised(&self) -> Decimal {
        self.total_utilised
    }

    /// Budget minus usage. Negative when overspent.
    #[must_use]
    pub const fn balance(&self) -> Decimal {
        self.balance
    }

    /// Current usage classification.
    #[must_use]
    pub const fn warning_level(&self) -> WarningLevel {
        self.warning_level
    }

    /// Usage as a percentage of the budget, 0 when the budget is not positive.
    #[must_use]
    pub fn usage_percent(&self) -> Decimal {
        BudgetCalculator::usage_percent(self.total_utilised, self.sub_element_budget)
    }

    /// Replaces the allocated budget.
    pub fn set_budget(&mut self, amount: Decimal) {
        self.sub_element_budget = amount;
        self.refresh_derived();
    }

    /// Records the usage of one month.
    ///
    /// A malformed short vector is padded with zeros to a full year first.
    ///
    /// # Errors
    ///
    /// Returns `BudgetError::InvalidMonth` if `month` is not in `0..12`,
    /// `BudgetError::InvalidAmount` if the year's total would overflow. The
    /// usage is unchanged on error.
    pub fn set_month(&mut self, month: usize, amount: Decimal) -> Result<(), BudgetError> {
        if month >= MONTHS_PER_YEAR {
            return Err(BudgetError::InvalidMonth(month));
        }
        let mut monthly = self.monthly_usage.clone();
        if monthly.len() < MONTHS_PER_YEAR {
            monthly.resize(MONTHS_PER_YEAR, Decimal::ZERO);
        }
        monthly[month] = amount;
        ensure_representable(&monthly)?;
        self.monthly_usage = monthly;
        self.refresh_derived();
        Ok(())
    }

    /// Replaces the whole monthly usage vector.
    ///
    /// # Errors
    ///
    /// Returns `BudgetError::InvalidLength` unless exactly 12 entries are
    /// given, `BudgetError::InvalidAmount` if their total would overflow.
    pub fn replace_monthly_usage(&mut self, monthly: Vec<Decimal>) -> Result<(), BudgetError> {
        if monthly.len() != MONTHS_PER_YEAR {
            return Err(BudgetError::InvalidLength(monthly.len()));
        }
        ensure_representable(&monthly)?;
        self.monthly_usage = monthly;
        self.refresh_derived();
        Ok(())
    }

    /// Reverses recorded usage, latest month first, never below zero.
    ///
    /// Returns the amount actually taken off, which is less than `amount`
    /// when the refund exceeds everything recorded.
    pub fn refund(&mut self, amount: Decimal) -> Decimal {
        let mut remaining = amount;
        for entry in self.monthly_usage.iter_mut().rev() {
            if remaining <= Decimal::ZERO {
                break;
            }
            if *entry <= Decimal::ZERO {
                continue;
            }
            let taken = remaining.min(*entry);
            *entry -= taken;
            remaining -= taken;
        }
        self.refresh_derived();
        amount - remaining
    }

    /// Appends a note to the comments, `; ` separated.
    pub fn append_comment(&mut self, note: &str) {
        self.comments = Some(match self.comments.take() {
            Some(existing) if !existing.is_empty() => format!("{existing}; {note}"),
            _ => note.to_string(),
        });
    }

    /// Fails if the recorded usage adds up past `Decimal::MAX`, in which case
    /// `total_utilised` only holds a saturated value.
    pub(crate) fn ensure_usage_representable(&self) -> Result<(), BudgetError> {
        ensure_representable(&self.monthly_usage)
    }

    /// Single entry point for the derived fields.
    pub(crate) fn refresh_derived(&mut self) {
        self.total_utilised = BudgetCalculator::sum_usage(&self.monthly_usage);
        self.balance = self.sub_element_budget.saturating_sub(self.total_utilised);
        self.warning_level =
            BudgetCalculator::warning_level(self.total_utilised, self.sub_element_budget);
    }
}

fn ensure_representable(monthly: &[Decimal]) -> Result<(), BudgetError> {
    if BudgetCalculator::checked_sum_usage(monthly).is_none() {
        return Err(BudgetError::InvalidAmount(
            "monthly usage total is too large".to_string(),
        ));
    }
    Ok(())
}

/// A named spending bucket (e.g. "Hygiene").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    /// Category ID.
    pub id: CategoryId,
    /// Category name.
    pub name: String,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
    /// Budget allocated to this category.
    pub category_budget: Decimal,
    /// Line items, in display order.
    #[serde(default)]
    pub sub_elements: Vec<SubElement>,
}

impl Category {
    /// Creates a category with a fresh ID and no sub-elements.
    #[must_use]
    pub fn new(name: impl Into<String>, category_budget: Decimal) -> Self {
        Self {
            id: CategoryId::new(),
            name: name.into(),
            description: None,
            category_budget,
            sub_elements: Vec::new(),
        }
    }

    /// Looks up a sub-element by ID.
    #[must_use]
    pub fn sub_element(&self, id: SubElementId) -> Option<&SubElement> {
        self.sub_elements.iter().find(|s| s.id == id)
    }

    /// Looks up a sub-element by ID for modification.
    pub fn sub_element_mut(&mut self, id: SubElementId) -> Option<&mut SubElement> {
        self.sub_elements.iter_mut().find(|s| s.id == id)
    }

    pub(crate) fn ensure_usage_representable(&self) -> Result<(), BudgetError> {
        self.sub_elements
            .iter()
            .try_for_each(SubElement::ensure_usage_representable)
    }
}

/// The full spending hierarchy of one patient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    /// Budget ID.
    pub id: BudgetId,
    /// Patient the budget belongs to. Unique store key.
    pub patient_id: String,
    /// Organization caring for the patient.
    pub organization_id: String,
    /// User who created the budget.
    #[serde(default)]
    pub created_by: String,
    /// Total budget.
    pub total_budget: Decimal,
    /// Categories, in display order.
    #[serde(default)]
    pub categories: Vec<Category>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
    /// Store revision; 0 for a document that was never saved.
    #[serde(default)]
    pub version: i64,
}

impl Budget {
    /// Looks up a category by ID.
    #[must_use]
    pub fn category(&self, id: CategoryId) -> Option<&Category> {
        self.categories.iter().find(|c| c.id == id)
    }

    /// Looks up a category by ID for modification.
    pub fn category_mut(&mut self, id: CategoryId) -> Option<&mut Category> {
        self.categories.iter_mut().find(|c| c.id == id)
    }

    /// Looks up a sub-element inside a category.
    #[must_use]
    pub fn sub_element(&self, category: CategoryId, id: SubElementId) -> Option<&SubElement> {
        self.category(category)?.sub_element(id)
    }
}

/// Input for creating a budget.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBudget {
    /// Patient ID.
    #[serde(default)]
    pub patient_id: String,
    /// Organization ID.
    #[serde(default)]
    pub organization_id: String,
    /// User creating the budget.
    #[serde(default)]
    pub created_by: String,
    /// Total budget.
    #[serde(default)]
    pub total_budget: Decimal,
    /// Initial categories.
    #[serde(default)]
    pub categories: Vec<NewCategory>,
}

impl NewBudget {
    /// Builds an unsaved budget document, generating missing IDs.
    #[must_use]
    pub fn into_budget(self) -> Budget {
        let now = Utc::now();
        Budget {
            id: BudgetId::new(),
            patient_id: self.patient_id,
            organization_id: self.organization_id,
            created_by: self.created_by,
            total_budget: self.total_budget,
            categories: self
                .categories
                .into_iter()
                .map(NewCategory::into_category)
                .collect(),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }
}

/// Input for a category, new or (in a full update) existing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCategory {
    /// Existing ID to keep, or `None` to generate one.
    #[serde(default)]
    pub id: Option<CategoryId>,
    /// Category name.
    #[serde(default)]
    pub name: String,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
    /// Category budget.
    #[serde(default)]
    pub category_budget: Decimal,
    /// Sub-elements of the category.
    #[serde(default)]
    pub sub_elements: Vec<NewSubElement>,
}

impl NewCategory {
    /// Builds the category, generating missing IDs.
    #[must_use]
    pub fn into_category(self) -> Category {
        Category {
            id: self.id.unwrap_or_default(),
            name: self.name,
            description: self.description,
            category_budget: self.category_budget,
            sub_elements: self
                .sub_elements
                .into_iter()
                .map(NewSubElement::into_sub_element)
                .collect(),
        }
    }
}

/// Input for a sub-element, new or (in a full update) existing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubElement {
    /// Existing ID to keep, or `None` to generate one.
    #[serde(default)]
    pub id: Option<SubElementId>,
    /// Sub-element name.
    #[serde(default)]
    pub name: String,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
    /// Sub-element budget.
    #[serde(default)]
    pub sub_element_budget: Decimal,
    /// Monthly usage; `None` starts from a year of zeros.
    #[serde(default)]
    pub monthly_usage: Option<Vec<Decimal>>,
    /// Optional comments.
    #[serde(default)]
    pub comments: Option<String>,
}

impl NewSubElement {
    /// Builds the sub-element with its derived fields.
    #[must_use]
    pub fn into_sub_element(self) -> SubElement {
        SubElement::assemble(
            self.id.unwrap_or_default(),
            self.name,
            self.description,
            self.comments,
            self.sub_element_budget,
            self.monthly_usage.unwrap_or_else(empty_year),
        )
    }
}

/// Input for replacing a budget tree.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetUpdate {
    /// ID of the budget being replaced; must match the stored one.
    pub id: BudgetId,
    /// Organization ID.
    pub organization_id: String,
    /// Total budget.
    pub total_budget: Decimal,
    /// Replacement categories. Nodes without an ID are new.
    #[serde(default)]
    pub categories: Vec<NewCategory>,
}

/// Partial update of a category.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryPatch {
    /// New name.
    pub name: Option<String>,
    /// New description.
    pub description: Option<Option<String>>,
    /// New category budget.
    pub category_budget: Option<Decimal>,
}

/// Partial update of a sub-element.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubElementPatch {
    /// New name.
    pub name: Option<String>,
    /// New description.
    pub description: Option<Option<String>>,
    /// New sub-element budget.
    pub sub_element_budget: Option<Decimal>,
}

/// Colour band for usage display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageColor {
    /// Below 80%.
    Green,
    /// 80% up to 100%.
    Orange,
    /// 100% and above.
    Red,
}

/// Usage of one category.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryUsage {
    /// Category ID.
    pub category_id: CategoryId,
    /// Category name.
    pub name: String,
    /// Category budget.
    pub category_budget: Decimal,
    /// Sum of the sub-elements' usage.
    pub total_utilised: Decimal,
    /// Category budget minus usage.
    pub balance: Decimal,
    /// Usage percentage rounded to a whole number.
    pub usage_percentage: Decimal,
    /// Display band.
    pub usage_color: UsageColor,
}

/// Whole-budget figures.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetSummary {
    /// Total budget.
    pub total_budget: Decimal,
    /// Sum of every sub-element's usage.
    pub total_used: Decimal,
    /// Total budget minus usage.
    pub total_balance: Decimal,
    /// Usage as a percentage of the total budget.
    pub usage_percentage: Decimal,
    /// Whether usage exceeds the total budget.
    pub is_over_budget: bool,
    /// Warning messages, budget-level first.
    pub warnings: Vec<String>,
    /// Per-category breakdown in budget order.
    pub categories: Vec<CategoryUsage>,
}
