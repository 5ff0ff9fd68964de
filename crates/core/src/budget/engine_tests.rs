//! Engine tests against the in-memory store.

use std::sync::Arc;

use async_trait::async_trait;
use caretrack_shared::config::BudgetConfig;
use caretrack_shared::types::{CategoryId, SubElementId};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc::UnboundedReceiver;

use super::*;

const PATIENT: &str = "patient-1";

fn hygiene_draft() -> NewBudget {
    NewBudget {
        patient_id: PATIENT.into(),
        organization_id: "org-1".into(),
        created_by: "manager-1".into(),
        total_budget: dec!(1000),
        categories: vec![NewCategory {
            name: "Hygiene".into(),
            category_budget: dec!(1000),
            sub_elements: vec![NewSubElement {
                name: "Soap".into(),
                sub_element_budget: dec!(200),
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

fn two_category_draft() -> NewBudget {
    NewBudget {
        total_budget: dec!(1000),
        categories: vec![
            NewCategory {
                name: "Hygiene".into(),
                category_budget: dec!(400),
                sub_elements: vec![
                    NewSubElement {
                        name: "Soap".into(),
                        sub_element_budget: dec!(150),
                        ..Default::default()
                    },
                    NewSubElement {
                        name: "Shampoo".into(),
                        sub_element_budget: dec!(250),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            },
            NewCategory {
                name: "Food".into(),
                category_budget: dec!(600),
                ..Default::default()
            },
        ],
        ..hygiene_draft()
    }
}

fn engine() -> (BudgetEngine, Arc<InMemoryBudgetStore>) {
    let store = Arc::new(InMemoryBudgetStore::new());
    (BudgetEngine::new(store.clone()), store)
}

fn engine_with_channel() -> (BudgetEngine, UnboundedReceiver<BudgetEvent>) {
    let (notifier, rx) = ChannelNotifier::channel();
    let engine =
        BudgetEngine::with_notifier(Arc::new(InMemoryBudgetStore::new()), Arc::new(notifier));
    (engine, rx)
}

fn ids(budget: &Budget) -> (CategoryId, SubElementId) {
    let category = &budget.categories[0];
    (category.id, category.sub_elements[0].id)
}

fn drain(rx: &mut UnboundedReceiver<BudgetEvent>) -> Vec<BudgetEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_usage_update_reaches_warning() {
    let (engine, _) = engine();
    let budget = engine.create(hygiene_draft()).await.unwrap();
    let (category_id, sub_id) = ids(&budget);

    let updated = engine
        .update_monthly_usage(PATIENT, category_id, sub_id, 0, dec!(180))
        .await
        .unwrap();

    let soap = updated.sub_element(category_id, sub_id).unwrap();
    assert_eq!(soap.total_utilised(), dec!(180));
    assert_eq!(soap.balance(), dec!(20));
    assert_eq!(soap.warning_level(), WarningLevel::Warning);
    assert_eq!(
        engine.warnings(PATIENT).await.unwrap(),
        vec!["WARNING: Hygiene - Soap usage at 90.00%".to_string()]
    );
}

#[tokio::test]
async fn test_adjust_total_leaves_categories_inconsistent() {
    let (engine, _) = engine();
    engine.create(hygiene_draft()).await.unwrap();

    let adjusted = engine
        .adjust_total_budget(PATIENT, dec!(500), Some("mid-year review"))
        .await
        .unwrap();

    assert_eq!(adjusted.total_budget, dec!(500));
    assert_eq!(adjusted.categories[0].category_budget, dec!(1000));
    assert_eq!(
        validate_budget(&adjusted),
        vec![BudgetViolation::CategoryTotalMismatch {
            category_total: dec!(1000),
            total_budget: dec!(500),
        }]
    );
}

#[tokio::test]
async fn test_adjust_total_rejects_negative_amount() {
    let (engine, _) = engine();
    engine.create(hygiene_draft()).await.unwrap();

    let err = engine
        .adjust_total_budget(PATIENT, dec!(-1), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetError::InvalidAmount(_)));
}

#[tokio::test]
async fn test_adjust_total_on_missing_budget() {
    let (engine, store) = engine();
    let err = engine
        .adjust_total_budget(PATIENT, dec!(100), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetError::NotFound(_)));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_create_rejects_invalid_draft_with_every_violation() {
    let (engine, store) = engine();
    let draft = NewBudget {
        patient_id: String::new(),
        organization_id: String::new(),
        total_budget: dec!(-10),
        ..Default::default()
    };

    let err = engine.create(draft).await.unwrap_err();
    match err {
        BudgetError::ValidationFailed(violations) => assert_eq!(
            violations,
            vec![
                BudgetViolation::MissingPatientId,
                BudgetViolation::MissingOrganizationId,
                BudgetViolation::NegativeTotalBudget,
            ]
        ),
        other => panic!("unexpected error: {other}"),
    }
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_create_twice_fails() {
    let (engine, _) = engine();
    engine.create(hygiene_draft()).await.unwrap();
    let err = engine.create(hygiene_draft()).await.unwrap_err();
    assert!(matches!(err, BudgetError::AlreadyExists(p) if p == PATIENT));
}

#[tokio::test]
async fn test_create_assigns_ids_and_first_revision() {
    let (engine, _) = engine();
    let created = engine.create(hygiene_draft()).await.unwrap();
    assert_eq!(created.version, 1);
    assert_eq!(created.categories[0].sub_elements[0].monthly_usage().len(), 12);
    assert_eq!(engine.get(PATIENT).await.unwrap(), created);
}

#[tokio::test]
async fn test_get_and_delete_missing_budget() {
    let (engine, _) = engine();
    assert!(engine.get(PATIENT).await.unwrap_err().is_not_found());
    assert!(matches!(
        engine.delete(PATIENT).await.unwrap_err(),
        BudgetError::NotFound(_)
    ));
}

#[tokio::test]
async fn test_delete() {
    let (engine, store) = engine();
    engine.create(hygiene_draft()).await.unwrap();
    engine.delete(PATIENT).await.unwrap();
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_category_reallocation_conserves_amount() {
    let (engine, _) = engine();
    let budget = engine.create(two_category_draft()).await.unwrap();
    let (hygiene, food) = (budget.categories[0].id, budget.categories[1].id);

    let updated = engine
        .reallocate_between_categories(PATIENT, food, hygiene, dec!(100), Some("more supplies"))
        .await
        .unwrap();

    assert_eq!(updated.category(hygiene).unwrap().category_budget, dec!(500));
    assert_eq!(updated.category(food).unwrap().category_budget, dec!(500));
    assert!(validate_budget(&updated).is_empty());
}

#[tokio::test]
async fn test_category_reallocation_rejects_overdraw() {
    let (engine, _) = engine();
    let budget = engine.create(two_category_draft()).await.unwrap();
    let (hygiene, food) = (budget.categories[0].id, budget.categories[1].id);

    let err = engine
        .reallocate_between_categories(PATIENT, hygiene, food, dec!(400.01), None)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        BudgetError::InsufficientFunds { available, requested }
            if available == dec!(400) && requested == dec!(400.01)
    ));
    assert_eq!(engine.get(PATIENT).await.unwrap(), budget);
}

#[tokio::test]
async fn test_category_reallocation_errors() {
    let (engine, _) = engine();
    let budget = engine.create(two_category_draft()).await.unwrap();
    let hygiene = budget.categories[0].id;
    let missing = CategoryId::new();

    let err = engine
        .reallocate_between_categories(PATIENT, hygiene, missing, dec!(1), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetError::CategoryNotFound(id) if id == missing));

    let err = engine
        .reallocate_between_categories(PATIENT, hygiene, hygiene, Decimal::ZERO, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetError::InvalidAmount(_)));
}

#[tokio::test]
async fn test_sub_element_reallocation() {
    let (engine, _) = engine();
    let budget = engine.create(two_category_draft()).await.unwrap();
    let hygiene = &budget.categories[0];
    let (soap, shampoo) = (hygiene.sub_elements[0].id, hygiene.sub_elements[1].id);

    let updated = engine
        .reallocate_between_sub_elements(PATIENT, hygiene.id, shampoo, soap, dec!(50), None)
        .await
        .unwrap();
    let category = updated.category(hygiene.id).unwrap();
    assert_eq!(category.sub_element(soap).unwrap().sub_element_budget(), dec!(200));
    assert_eq!(category.sub_element(shampoo).unwrap().sub_element_budget(), dec!(200));

    let err = engine
        .reallocate_between_sub_elements(PATIENT, hygiene.id, soap, shampoo, dec!(201), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetError::InsufficientFunds { .. }));
    let stored = engine.get(PATIENT).await.unwrap();
    let category = stored.category(hygiene.id).unwrap();
    assert_eq!(category.sub_element(soap).unwrap().sub_element_budget(), dec!(200));
    assert_eq!(category.sub_element(shampoo).unwrap().sub_element_budget(), dec!(200));
    assert_eq!(stored.version, updated.version);

    let missing = SubElementId::new();
    let err = engine
        .reallocate_between_sub_elements(PATIENT, hygiene.id, missing, soap, dec!(1), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetError::SubElementNotFound(id) if id == missing));
}

#[tokio::test]
async fn test_bulk_usage_round_trip() {
    let (engine, _) = engine();
    let budget = engine.create(hygiene_draft()).await.unwrap();
    let (category_id, sub_id) = ids(&budget);
    let mut amounts = vec![Decimal::ZERO; MONTHS_PER_YEAR];
    amounts[0] = dec!(10);

    engine
        .update_monthly_usage_bulk(PATIENT, category_id, sub_id, amounts)
        .await
        .unwrap();

    let stored = engine.get(PATIENT).await.unwrap();
    let soap = stored.sub_element(category_id, sub_id).unwrap();
    assert_eq!(soap.monthly_usage()[0], dec!(10));
    assert_eq!(soap.total_utilised(), dec!(10));
}

#[tokio::test]
async fn test_bulk_usage_rejects_bad_input() {
    let (engine, _) = engine();
    let budget = engine.create(hygiene_draft()).await.unwrap();
    let (category_id, sub_id) = ids(&budget);

    let err = engine
        .update_monthly_usage_bulk(PATIENT, category_id, sub_id, vec![dec!(1); 11])
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetError::InvalidLength(11)));

    let mut amounts = vec![Decimal::ZERO; MONTHS_PER_YEAR];
    amounts[4] = dec!(-1);
    let err = engine
        .update_monthly_usage_bulk(PATIENT, category_id, sub_id, amounts)
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetError::InvalidAmount(_)));
}

#[tokio::test]
async fn test_monthly_usage_errors() {
    let (engine, _) = engine();
    let budget = engine.create(hygiene_draft()).await.unwrap();
    let (category_id, sub_id) = ids(&budget);

    let err = engine
        .update_monthly_usage(PATIENT, category_id, sub_id, 12, dec!(1))
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetError::InvalidMonth(12)));

    let err = engine
        .update_monthly_usage(PATIENT, category_id, sub_id, 0, dec!(-1))
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetError::InvalidAmount(_)));

    let err = engine
        .update_monthly_usage(PATIENT, CategoryId::new(), sub_id, 0, dec!(1))
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetError::CategoryNotFound(_)));

    let err = engine
        .update_monthly_usage(PATIENT, category_id, SubElementId::new(), 0, dec!(1))
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetError::SubElementNotFound(_)));

    assert_eq!(engine.get(PATIENT).await.unwrap(), budget);
}

#[tokio::test]
async fn test_refund_reduces_usage_and_notes_comment() {
    let (engine, _) = engine();
    let budget = engine.create(hygiene_draft()).await.unwrap();
    let (category_id, sub_id) = ids(&budget);
    engine
        .update_monthly_usage(PATIENT, category_id, sub_id, 0, dec!(100))
        .await
        .unwrap();
    engine
        .update_monthly_usage(PATIENT, category_id, sub_id, 3, dec!(30))
        .await
        .unwrap();

    let updated = engine
        .refund_sub_element(PATIENT, category_id, sub_id, dec!(50), Some("returned item"))
        .await
        .unwrap();

    let soap = updated.sub_element(category_id, sub_id).unwrap();
    assert_eq!(soap.monthly_usage()[3], Decimal::ZERO);
    assert_eq!(soap.monthly_usage()[0], dec!(80));
    assert_eq!(soap.total_utilised(), dec!(80));
    assert_eq!(soap.sub_element_budget(), dec!(200));
    assert_eq!(soap.comments.as_deref(), Some("Refund: 50 (returned item)"));
}

#[tokio::test]
async fn test_refund_larger_than_usage_stops_at_zero() {
    let (engine, _) = engine();
    let budget = engine.create(hygiene_draft()).await.unwrap();
    let (category_id, sub_id) = ids(&budget);
    engine
        .update_monthly_usage(PATIENT, category_id, sub_id, 6, dec!(20))
        .await
        .unwrap();

    let updated = engine
        .refund_sub_element(PATIENT, category_id, sub_id, dec!(75), None)
        .await
        .unwrap();
    let soap = updated.sub_element(category_id, sub_id).unwrap();
    assert_eq!(soap.total_utilised(), Decimal::ZERO);
    assert_eq!(soap.balance(), dec!(200));
    assert_eq!(soap.comments.as_deref(), Some("Refund: 75"));

    let err = engine
        .refund_sub_element(PATIENT, category_id, sub_id, dec!(-5), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetError::InvalidAmount(_)));
}

#[tokio::test]
async fn test_category_and_sub_element_management() {
    let (engine, _) = engine();
    let budget = engine.create(hygiene_draft()).await.unwrap();
    let (hygiene, soap) = ids(&budget);

    let budget = engine
        .add_category(
            PATIENT,
            NewCategory {
                name: "Transport".into(),
                category_budget: dec!(300),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let transport = budget.categories[1].id;
    assert!(budget.categories[1].sub_elements.is_empty());

    let budget = engine
        .add_sub_element(
            PATIENT,
            transport,
            NewSubElement {
                name: "Taxi".into(),
                sub_element_budget: dec!(120),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let taxi = budget.categories[1].sub_elements[0].id;

    let budget = engine
        .update_category(
            PATIENT,
            transport,
            CategoryPatch {
                name: Some("Travel".into()),
                description: Some(Some("Appointments".into())),
                category_budget: Some(dec!(250)),
            },
        )
        .await
        .unwrap();
    let travel = budget.category(transport).unwrap();
    assert_eq!(travel.name, "Travel");
    assert_eq!(travel.description.as_deref(), Some("Appointments"));
    assert_eq!(travel.category_budget, dec!(250));

    let budget = engine
        .update_sub_element(
            PATIENT,
            hygiene,
            soap,
            SubElementPatch {
                sub_element_budget: Some(dec!(100)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        budget.sub_element(hygiene, soap).unwrap().sub_element_budget(),
        dec!(100)
    );

    let budget = engine
        .remove_sub_element(PATIENT, transport, taxi)
        .await
        .unwrap();
    assert!(budget.category(transport).unwrap().sub_elements.is_empty());

    let budget = engine.remove_category(PATIENT, transport).await.unwrap();
    assert_eq!(budget.categories.len(), 1);

    let err = engine
        .remove_category(PATIENT, transport)
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetError::CategoryNotFound(_)));

    let err = engine
        .add_sub_element(PATIENT, transport, NewSubElement::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetError::CategoryNotFound(_)));

    let err = engine
        .update_category(
            PATIENT,
            hygiene,
            CategoryPatch {
                category_budget: Some(dec!(-1)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetError::InvalidAmount(_)));
}

#[tokio::test]
async fn test_full_update_replaces_tree_and_keeps_usage() {
    let (engine, _) = engine();
    let budget = engine.create(hygiene_draft()).await.unwrap();
    let (hygiene, soap) = ids(&budget);
    engine
        .update_monthly_usage(PATIENT, hygiene, soap, 1, dec!(40))
        .await
        .unwrap();

    let update = BudgetUpdate {
        id: budget.id,
        organization_id: "org-1".into(),
        total_budget: dec!(1200),
        categories: vec![
            NewCategory {
                id: Some(hygiene),
                name: "Hygiene".into(),
                category_budget: dec!(1000),
                sub_elements: vec![NewSubElement {
                    id: Some(soap),
                    name: "Soap".into(),
                    sub_element_budget: dec!(250),
                    ..Default::default()
                }],
                ..Default::default()
            },
            NewCategory {
                name: "Clothing".into(),
                category_budget: dec!(200),
                ..Default::default()
            },
        ],
    };
    let updated = engine.update(PATIENT, update).await.unwrap();

    assert_eq!(updated.total_budget, dec!(1200));
    assert_eq!(updated.categories.len(), 2);
    let kept = updated.sub_element(hygiene, soap).unwrap();
    assert_eq!(kept.sub_element_budget(), dec!(250));
    assert_eq!(kept.total_utilised(), dec!(40));
    assert_eq!(kept.balance(), dec!(210));
}

#[tokio::test]
async fn test_full_update_with_wrong_id_is_not_found() {
    let (engine, _) = engine();
    let budget = engine.create(hygiene_draft()).await.unwrap();

    let update = BudgetUpdate {
        id: caretrack_shared::types::BudgetId::new(),
        organization_id: "org-1".into(),
        total_budget: dec!(1),
        categories: Vec::new(),
    };
    let err = engine.update(PATIENT, update).await.unwrap_err();
    assert!(matches!(err, BudgetError::NotFound(_)));
    assert_eq!(engine.get(PATIENT).await.unwrap(), budget);
}

#[tokio::test]
async fn test_summary() {
    let (engine, _) = engine();
    let budget = engine.create(two_category_draft()).await.unwrap();
    let hygiene = &budget.categories[0];
    engine
        .update_monthly_usage(PATIENT, hygiene.id, hygiene.sub_elements[0].id, 2, dec!(150))
        .await
        .unwrap();

    let summary = engine.summary(PATIENT).await.unwrap();
    assert_eq!(summary.total_used, dec!(150));
    assert_eq!(summary.total_balance, dec!(850));
    assert_eq!(summary.usage_percentage, dec!(15));
    assert!(!summary.is_over_budget);
    assert_eq!(
        summary.warnings,
        vec!["CRITICAL: Hygiene - Soap usage at 100.00%, exceeded budget by 0.00%".to_string()]
    );

    let top = engine.top_categories(PATIENT, 1).await.unwrap();
    assert_eq!(top[0].name, "Hygiene");
    assert_eq!(top[0].usage_percentage, dec!(38));
    assert_eq!(top[0].usage_color, UsageColor::Green);
}

#[test]
fn test_validate_draft_without_store() {
    assert!(BudgetEngine::validate(&hygiene_draft()).is_empty());

    let draft = NewBudget {
        total_budget: dec!(900),
        ..hygiene_draft()
    };
    assert_eq!(BudgetEngine::validate(&draft).len(), 1);
}

#[tokio::test]
async fn test_events_are_published() {
    let (engine, mut rx) = engine_with_channel();
    let budget = engine.create(hygiene_draft()).await.unwrap();
    let (category_id, sub_id) = ids(&budget);

    engine
        .update_monthly_usage(PATIENT, category_id, sub_id, 0, dec!(100))
        .await
        .unwrap();
    engine
        .update_monthly_usage(PATIENT, category_id, sub_id, 1, dec!(70))
        .await
        .unwrap();
    engine.delete(PATIENT).await.unwrap();

    let events = drain(&mut rx);
    assert_eq!(events.len(), 5);
    assert!(matches!(events[0], BudgetEvent::Created { .. }));
    assert!(matches!(
        events[1],
        BudgetEvent::Updated {
            operation: BudgetOperation::MonthlyUsage,
            ..
        }
    ));
    assert!(matches!(events[2], BudgetEvent::Updated { .. }));
    match &events[3] {
        BudgetEvent::UsageAlert(alert) => {
            assert_eq!(alert.category_name, "Hygiene");
            assert_eq!(alert.sub_element_name, "Soap");
            assert_eq!(alert.level, WarningLevel::Warning);
            assert_eq!(alert.usage_percent, dec!(85));
        }
        other => panic!("expected usage alert, got {other:?}"),
    }
    assert!(matches!(events[4], BudgetEvent::Deleted { .. }));
}

#[tokio::test]
async fn test_rejected_mutation_publishes_nothing() {
    let (engine, mut rx) = engine_with_channel();
    let budget = engine.create(hygiene_draft()).await.unwrap();
    drain(&mut rx);

    let (category_id, _) = ids(&budget);
    engine
        .remove_sub_element(PATIENT, category_id, SubElementId::new())
        .await
        .unwrap_err();
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_disabled_notifications() {
    let (notifier, mut rx) = ChannelNotifier::channel();
    let config = BudgetConfig {
        notifications_enabled: false,
    };
    let engine = BudgetEngine::from_config(
        &config,
        Arc::new(InMemoryBudgetStore::new()),
        Arc::new(notifier),
    );

    engine.create(hygiene_draft()).await.unwrap();
    assert!(drain(&mut rx).is_empty());
}

struct RejectingNotifier;

impl BudgetNotifier for RejectingNotifier {
    fn notify(&self, _event: BudgetEvent) -> Result<(), NotifyError> {
        Err(NotifyError::Rejected("mail server down".into()))
    }
}

#[tokio::test]
async fn test_notifier_failure_does_not_fail_mutation() {
    let engine = BudgetEngine::with_notifier(
        Arc::new(InMemoryBudgetStore::new()),
        Arc::new(RejectingNotifier),
    );
    let budget = engine.create(hygiene_draft()).await.unwrap();
    let (category_id, sub_id) = ids(&budget);

    let updated = engine
        .update_monthly_usage(PATIENT, category_id, sub_id, 0, dec!(190))
        .await
        .unwrap();
    assert_eq!(
        updated.sub_element(category_id, sub_id).unwrap().total_utilised(),
        dec!(190)
    );
}

/// Accepts inserts but treats every replace as stale.
#[derive(Default)]
struct StaleStore {
    inner: InMemoryBudgetStore,
}

#[async_trait]
impl BudgetStore for StaleStore {
    async fn load_by_patient_id(&self, patient_id: &str) -> Result<Option<Budget>, StoreError> {
        self.inner.load_by_patient_id(patient_id).await
    }

    async fn save(&self, budget: Budget) -> Result<Budget, StoreError> {
        if budget.version == 0 {
            return self.inner.save(budget).await;
        }
        Err(StoreError::Conflict {
            patient_id: budget.patient_id,
        })
    }

    async fn delete_by_patient_id(&self, patient_id: &str) -> Result<bool, StoreError> {
        self.inner.delete_by_patient_id(patient_id).await
    }

    async fn exists_by_patient_id(&self, patient_id: &str) -> Result<bool, StoreError> {
        self.inner.exists_by_patient_id(patient_id).await
    }
}

#[tokio::test]
async fn test_stale_write_surfaces_conflict() {
    let engine = BudgetEngine::new(Arc::new(StaleStore::default()));
    let budget = engine.create(hygiene_draft()).await.unwrap();

    let err = engine
        .adjust_total_budget(PATIENT, dec!(10), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetError::Conflict(_)));
    assert_eq!(engine.get(PATIENT).await.unwrap(), budget);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reallocations_are_serialized() {
    let store = Arc::new(InMemoryBudgetStore::new());
    let engine = Arc::new(BudgetEngine::new(store));
    let budget = engine.create(two_category_draft()).await.unwrap();
    let (hygiene, food) = (budget.categories[0].id, budget.categories[1].id);

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .reallocate_between_categories(PATIENT, food, hygiene, dec!(5), None)
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let stored = engine.get(PATIENT).await.unwrap();
    assert_eq!(stored.category(hygiene).unwrap().category_budget, dec!(500));
    assert_eq!(stored.category(food).unwrap().category_budget, dec!(500));
    assert_eq!(stored.version, 21);
    assert_eq!(engine.tracked_locks(), 0);
}

fn huge(digits: u32) -> Decimal {
    Decimal::from_i128_with_scale(10_i128.pow(digits), 0)
}

#[tokio::test]
async fn test_huge_usage_on_tiny_budget_is_critical() {
    let (engine, mut rx) = engine_with_channel();
    let mut draft = hygiene_draft();
    draft.total_budget = dec!(0.0001);
    draft.categories[0].category_budget = dec!(0.0001);
    draft.categories[0].sub_elements[0].sub_element_budget = dec!(0.0001);
    let budget = engine.create(draft).await.unwrap();
    let (category_id, sub_id) = ids(&budget);

    let updated = engine
        .update_monthly_usage(PATIENT, category_id, sub_id, 0, huge(25))
        .await
        .unwrap();
    let sub = updated.sub_element(category_id, sub_id).unwrap();
    assert_eq!(sub.total_utilised(), huge(25));
    assert_eq!(sub.warning_level(), WarningLevel::Critical);

    let warnings = engine.warnings(PATIENT).await.unwrap();
    assert_eq!(warnings.len(), 2);
    assert!(warnings[0].starts_with("CRITICAL: Total budget exceeded by"));

    let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
    assert_eq!(events.len(), 3);
    assert!(matches!(
        &events[2],
        BudgetEvent::UsageAlert(alert)
            if alert.level == WarningLevel::Critical && alert.usage_percent == Decimal::MAX
    ));
}

#[tokio::test]
async fn test_usage_total_overflow_is_rejected_before_save() {
    let (engine, _) = engine();
    let budget = engine.create(hygiene_draft()).await.unwrap();
    let (category_id, sub_id) = ids(&budget);

    let err = engine
        .update_monthly_usage_bulk(PATIENT, category_id, sub_id, vec![Decimal::MAX; 12])
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetError::InvalidAmount(_)));
    assert_eq!(engine.get(PATIENT).await.unwrap().version, budget.version);

    let maxed = engine
        .update_monthly_usage(PATIENT, category_id, sub_id, 0, Decimal::MAX)
        .await
        .unwrap();
    let err = engine
        .update_monthly_usage(PATIENT, category_id, sub_id, 1, dec!(1))
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetError::InvalidAmount(_)));

    let stored = engine.get(PATIENT).await.unwrap();
    assert_eq!(stored.version, maxed.version);
    let sub = stored.sub_element(category_id, sub_id).unwrap();
    assert_eq!(sub.monthly_usage()[1], Decimal::ZERO);
    assert_eq!(sub.total_utilised(), Decimal::MAX);
}

fn overflowing_soap() -> NewSubElement {
    NewSubElement {
        name: "Soap".into(),
        sub_element_budget: dec!(200),
        monthly_usage: Some(vec![Decimal::MAX; 12]),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_create_rejects_overflowing_usage() {
    let (engine, store) = engine();
    let mut draft = hygiene_draft();
    draft.categories[0].sub_elements = vec![overflowing_soap()];

    let err = engine.create(draft).await.unwrap_err();
    let BudgetError::ValidationFailed(violations) = err else {
        panic!("expected validation failure, got {err:?}");
    };
    assert_eq!(
        violations,
        vec![BudgetViolation::MonthlyUsageTooLarge {
            category: 0,
            sub_element: 0
        }]
    );
    assert!(!store.exists_by_patient_id(PATIENT).await.unwrap());
}

#[tokio::test]
async fn test_update_and_add_reject_overflowing_usage() {
    let (engine, _) = engine();
    let budget = engine.create(hygiene_draft()).await.unwrap();
    let (category_id, _) = ids(&budget);

    let update = BudgetUpdate {
        id: budget.id,
        organization_id: "org-1".into(),
        total_budget: dec!(1000),
        categories: vec![NewCategory {
            id: Some(category_id),
            name: "Hygiene".into(),
            category_budget: dec!(1000),
            sub_elements: vec![overflowing_soap()],
            ..Default::default()
        }],
    };
    let err = engine.update(PATIENT, update).await.unwrap_err();
    assert!(matches!(err, BudgetError::InvalidAmount(_)));

    let err = engine
        .add_sub_element(PATIENT, category_id, overflowing_soap())
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetError::InvalidAmount(_)));

    let err = engine
        .add_category(
            PATIENT,
            NewCategory {
                name: "Food".into(),
                sub_elements: vec![overflowing_soap()],
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetError::InvalidAmount(_)));

    assert_eq!(engine.get(PATIENT).await.unwrap(), budget);
}

#[tokio::test]
async fn test_reallocation_into_full_category_is_rejected() {
    let (engine, _) = engine();
    let budget = engine.create(hygiene_draft()).await.unwrap();
    let hygiene = budget.categories[0].id;
    let with_food = engine
        .add_category(
            PATIENT,
            NewCategory {
                name: "Food".into(),
                category_budget: dec!(10),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let food = with_food.categories[1].id;
    engine
        .update_category(
            PATIENT,
            hygiene,
            CategoryPatch {
                category_budget: Some(Decimal::MAX),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = engine
        .reallocate_between_categories(PATIENT, food, hygiene, dec!(5), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetError::InvalidAmount(_)));

    let stored = engine.get(PATIENT).await.unwrap();
    assert_eq!(stored.category(food).unwrap().category_budget, dec!(10));
    assert_eq!(stored.category(hygiene).unwrap().category_budget, Decimal::MAX);
}

#[tokio::test]
async fn test_patient_locks_are_released() {
    let (engine, _) = engine();

    let err = engine
        .adjust_total_budget("nobody", dec!(10), None)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(engine.delete("nobody").await.is_err());
    assert_eq!(engine.tracked_locks(), 0);

    engine.create(hygiene_draft()).await.unwrap();
    engine
        .adjust_total_budget(PATIENT, dec!(1000), None)
        .await
        .unwrap();
    engine.delete(PATIENT).await.unwrap();
    assert_eq!(engine.tracked_locks(), 0);
}
