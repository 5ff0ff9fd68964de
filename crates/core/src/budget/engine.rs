//! Budget mutation engine.
//!
//! Every mutation follows the same path: lock the patient, load the document,
//! check and apply the change to raw fields, recalculate, then persist with a
//! single whole-document save. A rejected change leaves the stored document
//! untouched.

use std::sync::Arc;

use caretrack_shared::config::BudgetConfig;
use caretrack_shared::types::{CategoryId, SubElementId};
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, instrument, warn};

use super::calculator::BudgetCalculator;
use super::error::BudgetError;
use super::notify::{BudgetEvent, BudgetNotifier, BudgetOperation, NoopNotifier, UsageAlert};
use super::store::{BudgetStore, StoreError};
use super::types::{
    Budget, BudgetSummary, BudgetUpdate, Category, CategoryPatch, CategoryUsage, MONTHS_PER_YEAR,
    NewBudget, NewCategory, NewSubElement, SubElement, SubElementPatch, WarningLevel,
};
use super::validation::{BudgetViolation, validate_budget};

/// Orchestrates budget reads and mutations over a [`BudgetStore`].
///
/// Mutations for the same patient are serialized through a per-patient async
/// mutex; the store's revision check catches writers in other processes.
pub struct BudgetEngine {
    store: Arc<dyn BudgetStore>,
    notifier: Arc<dyn BudgetNotifier>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    notifications_enabled: bool,
}

impl BudgetEngine {
    /// Creates an engine that publishes no events.
    #[must_use]
    pub fn new(store: Arc<dyn BudgetStore>) -> Self {
        Self::with_notifier(store, Arc::new(NoopNotifier))
    }

    /// Creates an engine publishing events to `notifier`.
    #[must_use]
    pub fn with_notifier(store: Arc<dyn BudgetStore>, notifier: Arc<dyn BudgetNotifier>) -> Self {
        Self {
            store,
            notifier,
            locks: DashMap::new(),
            notifications_enabled: true,
        }
    }

    /// Creates an engine honouring the `budget` configuration section.
    #[must_use]
    pub fn from_config(
        config: &BudgetConfig,
        store: Arc<dyn BudgetStore>,
        notifier: Arc<dyn BudgetNotifier>,
    ) -> Self {
        Self {
            notifications_enabled: config.notifications_enabled,
            ..Self::with_notifier(store, notifier)
        }
    }

    /// Validates a draft without touching the store.
    #[must_use]
    pub fn validate(draft: &NewBudget) -> Vec<BudgetViolation> {
        let budget = BudgetCalculator::recalculate_budget(draft.clone().into_budget());
        validate_budget(&budget)
    }

    /// Creates the budget of a patient.
    ///
    /// # Errors
    ///
    /// `ValidationFailed` with every violation if the draft is invalid,
    /// `AlreadyExists` if the patient already has a budget.
    #[instrument(skip(self, draft), fields(patient_id = %draft.patient_id))]
    pub async fn create(&self, draft: NewBudget) -> Result<Budget, BudgetError> {
        let budget = BudgetCalculator::recalculate_budget(draft.into_budget());
        let violations = validate_budget(&budget);
        if !violations.is_empty() {
            warn!(violations = violations.len(), "Budget rejected by validation");
            return Err(BudgetError::ValidationFailed(violations));
        }

        let patient_id = budget.patient_id.clone();
        let _guard = self.lock_patient(&patient_id).await;

        if self.store.exists_by_patient_id(&patient_id).await? {
            warn!("Budget already exists");
            return Err(BudgetError::AlreadyExists(patient_id));
        }
        let saved = match self.store.save(budget).await {
            Ok(saved) => saved,
            Err(StoreError::Conflict { .. }) => return Err(BudgetError::AlreadyExists(patient_id)),
            Err(err) => return Err(err.into()),
        };

        info!(
            budget_id = %saved.id,
            total_budget = %saved.total_budget,
            categories = saved.categories.len(),
            "Budget created"
        );
        self.publish(BudgetEvent::Created {
            patient_id,
            budget_id: saved.id,
        });
        Ok(saved)
    }

    /// Returns the budget of a patient.
    ///
    /// # Errors
    ///
    /// `NotFound` if the patient has no budget.
    pub async fn get(&self, patient_id: &str) -> Result<Budget, BudgetError> {
        self.store
            .load_by_patient_id(patient_id)
            .await?
            .ok_or_else(|| BudgetError::NotFound(patient_id.to_string()))
    }

    /// Replaces the whole category tree.
    ///
    /// Nodes without an ID are new. An existing sub-element whose
    /// replacement carries no monthly usage keeps its recorded usage, and its
    /// comments unless new ones are given.
    ///
    /// # Errors
    ///
    /// `NotFound` if the patient has no budget or `update.id` is not its ID,
    /// `InvalidAmount` if a sub-element's usage adds up past what can be
    /// recorded.
    #[instrument(skip(self, update), fields(budget_id = %update.id))]
    pub async fn update(&self, patient_id: &str, update: BudgetUpdate) -> Result<Budget, BudgetError> {
        self.mutate(patient_id, BudgetOperation::FullUpdate, None, |budget| {
            if budget.id != update.id {
                return Err(BudgetError::NotFound(patient_id.to_string()));
            }
            let categories: Vec<Category> = update
                .categories
                .into_iter()
                .map(|draft| merge_category(budget, draft))
                .collect();
            for category in &categories {
                category.ensure_usage_representable()?;
            }
            budget.organization_id = update.organization_id;
            budget.total_budget = update.total_budget;
            budget.categories = categories;
            Ok(())
        })
        .await
    }

    /// Deletes the budget of a patient.
    ///
    /// # Errors
    ///
    /// `NotFound` if the patient has no budget.
    #[instrument(skip(self))]
    pub async fn delete(&self, patient_id: &str) -> Result<(), BudgetError> {
        let _guard = self.lock_patient(patient_id).await;
        if !self.store.delete_by_patient_id(patient_id).await? {
            return Err(BudgetError::NotFound(patient_id.to_string()));
        }
        info!("Budget deleted");
        self.publish(BudgetEvent::Deleted {
            patient_id: patient_id.to_string(),
        });
        Ok(())
    }

    /// Totals, warnings and per-category usage of a patient's budget.
    ///
    /// # Errors
    ///
    /// `NotFound` if the patient has no budget.
    pub async fn summary(&self, patient_id: &str) -> Result<BudgetSummary, BudgetError> {
        Ok(BudgetCalculator::summary(&self.get(patient_id).await?))
    }

    /// Warning messages for a patient's budget.
    ///
    /// # Errors
    ///
    /// `NotFound` if the patient has no budget.
    pub async fn warnings(&self, patient_id: &str) -> Result<Vec<String>, BudgetError> {
        Ok(BudgetCalculator::warnings(&self.get(patient_id).await?))
    }

    /// The `limit` categories with the highest usage.
    ///
    /// # Errors
    ///
    /// `NotFound` if the patient has no budget.
    pub async fn top_categories(
        &self,
        patient_id: &str,
        limit: usize,
    ) -> Result<Vec<CategoryUsage>, BudgetError> {
        let budget = self.get(patient_id).await?;
        Ok(BudgetCalculator::top_categories_by_usage(&budget, limit))
    }

    /// Sets the total budget. Categories are not rebalanced, so the budget
    /// may no longer pass validation afterwards.
    ///
    /// # Errors
    ///
    /// `InvalidAmount` if `new_total` is negative, `NotFound` if the patient
    /// has no budget.
    #[instrument(skip(self))]
    pub async fn adjust_total_budget(
        &self,
        patient_id: &str,
        new_total: Decimal,
        reason: Option<&str>,
    ) -> Result<Budget, BudgetError> {
        if new_total < Decimal::ZERO {
            return Err(BudgetError::InvalidAmount(format!(
                "total budget cannot be negative: {new_total}"
            )));
        }
        self.mutate(patient_id, BudgetOperation::AdjustTotal, reason, |budget| {
            budget.total_budget = new_total;
            Ok(())
        })
        .await
    }

    /// Appends a category.
    ///
    /// # Errors
    ///
    /// `NotFound` if the patient has no budget, `InvalidAmount` if a
    /// sub-element's usage adds up past what can be recorded.
    #[instrument(skip(self, draft), fields(name = %draft.name))]
    pub async fn add_category(
        &self,
        patient_id: &str,
        draft: NewCategory,
    ) -> Result<Budget, BudgetError> {
        self.mutate(patient_id, BudgetOperation::AddCategory, None, |budget| {
            let category = draft.into_category();
            category.ensure_usage_representable()?;
            budget.categories.push(category);
            Ok(())
        })
        .await
    }

    /// Changes the name, description or budget of a category.
    ///
    /// # Errors
    ///
    /// `InvalidAmount` for a negative budget, `CategoryNotFound` if the
    /// category is absent.
    #[instrument(skip(self, patch))]
    pub async fn update_category(
        &self,
        patient_id: &str,
        category_id: CategoryId,
        patch: CategoryPatch,
    ) -> Result<Budget, BudgetError> {
        if let Some(amount) = patch.category_budget {
            ensure_not_negative(amount)?;
        }
        self.mutate(patient_id, BudgetOperation::UpdateCategory, None, |budget| {
            let category = find_category(budget, category_id)?;
            if let Some(name) = patch.name {
                category.name = name;
            }
            if let Some(description) = patch.description {
                category.description = description;
            }
            if let Some(amount) = patch.category_budget {
                category.category_budget = amount;
            }
            Ok(())
        })
        .await
    }

    /// Removes a category and its sub-elements.
    ///
    /// # Errors
    ///
    /// `CategoryNotFound` if the category is absent.
    #[instrument(skip(self))]
    pub async fn remove_category(
        &self,
        patient_id: &str,
        category_id: CategoryId,
    ) -> Result<Budget, BudgetError> {
        self.mutate(patient_id, BudgetOperation::RemoveCategory, None, |budget| {
            let before = budget.categories.len();
            budget.categories.retain(|c| c.id != category_id);
            if budget.categories.len() == before {
                return Err(BudgetError::CategoryNotFound(category_id));
            }
            Ok(())
        })
        .await
    }

    /// Appends a sub-element to a category.
    ///
    /// # Errors
    ///
    /// `CategoryNotFound` if the category is absent, `InvalidAmount` if the
    /// usage adds up past what can be recorded.
    #[instrument(skip(self, draft), fields(name = %draft.name))]
    pub async fn add_sub_element(
        &self,
        patient_id: &str,
        category_id: CategoryId,
        draft: NewSubElement,
    ) -> Result<Budget, BudgetError> {
        self.mutate(patient_id, BudgetOperation::AddSubElement, None, |budget| {
            let sub = draft.into_sub_element();
            sub.ensure_usage_representable()?;
            find_category(budget, category_id)?.sub_elements.push(sub);
            Ok(())
        })
        .await
    }

    /// Changes the name, description or budget of a sub-element.
    ///
    /// # Errors
    ///
    /// `InvalidAmount` for a negative budget, `CategoryNotFound` or
    /// `SubElementNotFound` if the target is absent.
    #[instrument(skip(self, patch))]
    pub async fn update_sub_element(
        &self,
        patient_id: &str,
        category_id: CategoryId,
        sub_element_id: SubElementId,
        patch: SubElementPatch,
    ) -> Result<Budget, BudgetError> {
        if let Some(amount) = patch.sub_element_budget {
            ensure_not_negative(amount)?;
        }
        self.mutate(patient_id, BudgetOperation::UpdateSubElement, None, |budget| {
            let sub = find_sub_element(budget, category_id, sub_element_id)?;
            if let Some(name) = patch.name {
                sub.name = name;
            }
            if let Some(description) = patch.description {
                sub.description = description;
            }
            if let Some(amount) = patch.sub_element_budget {
                sub.set_budget(amount);
            }
            Ok(())
        })
        .await
    }

    /// Removes a sub-element.
    ///
    /// # Errors
    ///
    /// `CategoryNotFound` or `SubElementNotFound` if the target is absent.
    #[instrument(skip(self))]
    pub async fn remove_sub_element(
        &self,
        patient_id: &str,
        category_id: CategoryId,
        sub_element_id: SubElementId,
    ) -> Result<Budget, BudgetError> {
        self.mutate(patient_id, BudgetOperation::RemoveSubElement, None, |budget| {
            let category = find_category(budget, category_id)?;
            let before = category.sub_elements.len();
            category.sub_elements.retain(|s| s.id != sub_element_id);
            if category.sub_elements.len() == before {
                return Err(BudgetError::SubElementNotFound(sub_element_id));
            }
            Ok(())
        })
        .await
    }

    /// Moves `amount` of category budget from one category to another.
    ///
    /// The sum of category budgets is unchanged.
    ///
    /// # Errors
    ///
    /// `InvalidAmount` unless `amount > 0`, `CategoryNotFound` if either
    /// category is absent, `InsufficientFunds` if the source has less than
    /// `amount`.
    #[instrument(skip(self))]
    pub async fn reallocate_between_categories(
        &self,
        patient_id: &str,
        from: CategoryId,
        to: CategoryId,
        amount: Decimal,
        reason: Option<&str>,
    ) -> Result<Budget, BudgetError> {
        ensure_positive(amount)?;
        self.mutate(
            patient_id,
            BudgetOperation::ReallocateCategories,
            reason,
            |budget| {
                let available = find_category(budget, from)?.category_budget;
                find_category(budget, to)?;
                if available < amount {
                    return Err(BudgetError::InsufficientFunds {
                        available,
                        requested: amount,
                    });
                }
                let target = find_category(budget, to)?;
                target.category_budget = increase(target.category_budget, amount)?;
                find_category(budget, from)?.category_budget -= amount;
                Ok(())
            },
        )
        .await
    }

    /// Moves `amount` of sub-element budget between two sub-elements of the
    /// same category.
    ///
    /// # Errors
    ///
    /// `InvalidAmount` unless `amount > 0`, `CategoryNotFound` or
    /// `SubElementNotFound` if a target is absent, `InsufficientFunds` if the
    /// source has less than `amount`.
    #[instrument(skip(self))]
    pub async fn reallocate_between_sub_elements(
        &self,
        patient_id: &str,
        category_id: CategoryId,
        from: SubElementId,
        to: SubElementId,
        amount: Decimal,
        reason: Option<&str>,
    ) -> Result<Budget, BudgetError> {
        ensure_positive(amount)?;
        self.mutate(
            patient_id,
            BudgetOperation::ReallocateSubElements,
            reason,
            |budget| {
                let available = find_sub_element(budget, category_id, from)?.sub_element_budget();
                find_sub_element(budget, category_id, to)?;
                if available < amount {
                    return Err(BudgetError::InsufficientFunds {
                        available,
                        requested: amount,
                    });
                }
                let target = find_sub_element(budget, category_id, to)?;
                let increased = increase(target.sub_element_budget(), amount)?;
                target.set_budget(increased);
                let source = find_sub_element(budget, category_id, from)?;
                let reduced = source.sub_element_budget() - amount;
                source.set_budget(reduced);
                Ok(())
            },
        )
        .await
    }

    /// Reverses `amount` of recorded usage on a sub-element and notes the
    /// refund in its comments. The sub-element budget is unchanged.
    ///
    /// # Errors
    ///
    /// `InvalidAmount` unless `amount > 0`, `CategoryNotFound` or
    /// `SubElementNotFound` if the target is absent.
    #[instrument(skip(self))]
    pub async fn refund_sub_element(
        &self,
        patient_id: &str,
        category_id: CategoryId,
        sub_element_id: SubElementId,
        amount: Decimal,
        reason: Option<&str>,
    ) -> Result<Budget, BudgetError> {
        ensure_positive(amount)?;
        self.mutate(patient_id, BudgetOperation::Refund, reason, |budget| {
            let sub = find_sub_element(budget, category_id, sub_element_id)?;
            let refunded = sub.refund(amount);
            if refunded < amount {
                warn!(%refunded, requested = %amount, "Refund exceeds recorded usage");
            }
            let note = match reason.filter(|r| !r.is_empty()) {
                Some(reason) => format!("Refund: {amount} ({reason})"),
                None => format!("Refund: {amount}"),
            };
            sub.append_comment(&note);
            Ok(())
        })
        .await
    }

    /// Records the usage of one month (0 = January).
    ///
    /// Publishes a [`UsageAlert`] when the sub-element ends up at warning or
    /// critical level.
    ///
    /// # Errors
    ///
    /// `InvalidMonth` unless `month < 12`, `InvalidAmount` for a negative
    /// amount, `CategoryNotFound` or `SubElementNotFound` if the target is
    /// absent.
    #[instrument(skip(self))]
    pub async fn update_monthly_usage(
        &self,
        patient_id: &str,
        category_id: CategoryId,
        sub_element_id: SubElementId,
        month: usize,
        amount: Decimal,
    ) -> Result<Budget, BudgetError> {
        if month >= MONTHS_PER_YEAR {
            return Err(BudgetError::InvalidMonth(month));
        }
        ensure_not_negative(amount)?;
        let saved = self
            .mutate(patient_id, BudgetOperation::MonthlyUsage, None, |budget| {
                find_sub_element(budget, category_id, sub_element_id)?.set_month(month, amount)
            })
            .await?;
        self.alert_on_usage(&saved, category_id, sub_element_id);
        Ok(saved)
    }

    /// Replaces a whole year of usage.
    ///
    /// Publishes a [`UsageAlert`] when the sub-element ends up at warning or
    /// critical level.
    ///
    /// # Errors
    ///
    /// `InvalidLength` unless exactly 12 amounts are given, `InvalidAmount`
    /// if any is negative, `CategoryNotFound` or `SubElementNotFound` if the
    /// target is absent.
    #[instrument(skip(self, amounts))]
    pub async fn update_monthly_usage_bulk(
        &self,
        patient_id: &str,
        category_id: CategoryId,
        sub_element_id: SubElementId,
        amounts: Vec<Decimal>,
    ) -> Result<Budget, BudgetError> {
        if amounts.len() != MONTHS_PER_YEAR {
            return Err(BudgetError::InvalidLength(amounts.len()));
        }
        for amount in &amounts {
            ensure_not_negative(*amount)?;
        }
        let saved = self
            .mutate(patient_id, BudgetOperation::MonthlyUsageBulk, None, |budget| {
                find_sub_element(budget, category_id, sub_element_id)?
                    .replace_monthly_usage(amounts)
            })
            .await?;
        self.alert_on_usage(&saved, category_id, sub_element_id);
        Ok(saved)
    }

    async fn mutate<F>(
        &self,
        patient_id: &str,
        operation: BudgetOperation,
        reason: Option<&str>,
        apply: F,
    ) -> Result<Budget, BudgetError>
    where
        F: FnOnce(&mut Budget) -> Result<(), BudgetError> + Send,
    {
        let _guard = self.lock_patient(patient_id).await;
        let mut budget = self.get(patient_id).await?;

        if let Err(err) = apply(&mut budget) {
            warn!(patient_id, %operation, error = %err, "Budget change rejected");
            return Err(err);
        }
        budget.updated_at = Utc::now();
        let saved = self
            .store
            .save(BudgetCalculator::recalculate_budget(budget))
            .await?;

        info!(
            patient_id,
            budget_id = %saved.id,
            %operation,
            version = saved.version,
            "Budget updated"
        );
        self.publish(BudgetEvent::Updated {
            patient_id: patient_id.to_string(),
            budget_id: saved.id,
            operation,
            reason: reason.map(ToString::to_string),
        });
        Ok(saved)
    }

    async fn lock_patient(&self, patient_id: &str) -> PatientGuard<'_> {
        let lock = Arc::clone(&self.locks.entry(patient_id.to_string()).or_default());
        PatientGuard {
            locks: &self.locks,
            patient_id: patient_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Number of patients with a lock entry.
    #[cfg(test)]
    pub(crate) fn tracked_locks(&self) -> usize {
        self.locks.len()
    }

    fn alert_on_usage(&self, budget: &Budget, category_id: CategoryId, sub_element_id: SubElementId) {
        let Some(category) = budget.category(category_id) else {
            return;
        };
        let Some(sub) = category.sub_element(sub_element_id) else {
            return;
        };
        let level = sub.warning_level();
        if level == WarningLevel::Normal {
            return;
        }
        self.publish(BudgetEvent::UsageAlert(UsageAlert {
            patient_id: budget.patient_id.clone(),
            budget_id: budget.id,
            category_id,
            category_name: category.name.clone(),
            sub_element_id,
            sub_element_name: sub.name.clone(),
            level,
            budget_amount: sub.sub_element_budget(),
            used: sub.total_utilised(),
            usage_percent: sub.usage_percent(),
        }));
    }

    fn publish(&self, event: BudgetEvent) {
        if !self.notifications_enabled {
            return;
        }
        if let Err(err) = self.notifier.notify(event) {
            warn!(error = %err, "Failed to publish budget event");
        }
    }
}

/// Holds a patient's mutation lock; the map entry goes away with the last
/// holder so the map only tracks patients in use.
struct PatientGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    patient_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PatientGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold a clone, so a count of one means only the map is left.
        self.locks
            .remove_if(&self.patient_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn ensure_positive(amount: Decimal) -> Result<(), BudgetError> {
    if amount <= Decimal::ZERO {
        return Err(BudgetError::InvalidAmount(format!(
            "amount must be positive: {amount}"
        )));
    }
    Ok(())
}

fn ensure_not_negative(amount: Decimal) -> Result<(), BudgetError> {
    if amount < Decimal::ZERO {
        return Err(BudgetError::InvalidAmount(format!(
            "amount cannot be negative: {amount}"
        )));
    }
    Ok(())
}

fn increase(current: Decimal, amount: Decimal) -> Result<Decimal, BudgetError> {
    current.checked_add(amount).ok_or_else(|| {
        BudgetError::InvalidAmount(format!("{current} + {amount} is too large"))
    })
}

fn find_category(budget: &mut Budget, id: CategoryId) -> Result<&mut Category, BudgetError> {
    budget
        .category_mut(id)
        .ok_or(BudgetError::CategoryNotFound(id))
}

fn find_sub_element(
    budget: &mut Budget,
    category_id: CategoryId,
    id: SubElementId,
) -> Result<&mut SubElement, BudgetError> {
    find_category(budget, category_id)?
        .sub_element_mut(id)
        .ok_or(BudgetError::SubElementNotFound(id))
}

/// Builds a replacement category, carrying recorded usage over for existing
/// sub-elements whose replacement does not supply any.
fn merge_category(existing: &Budget, draft: NewCategory) -> Category {
    let NewCategory {
        id,
        name,
        description,
        category_budget,
        sub_elements,
    } = draft;

    let sub_elements = sub_elements
        .into_iter()
        .map(|mut sub| {
            let previous = sub.id.and_then(|sub_id| {
                existing
                    .categories
                    .iter()
                    .find_map(|c| c.sub_element(sub_id))
            });
            if let Some(previous) = previous {
                if sub.monthly_usage.is_none() {
                    sub.monthly_usage = Some(previous.monthly_usage().to_vec());
                    if sub.comments.is_none() {
                        sub.comments.clone_from(&previous.comments);
                    }
                }
            }
            sub
        })
        .collect();

    NewCategory {
        id,
        name,
        description,
        category_budget,
        sub_elements,
    }
    .into_category()
}
