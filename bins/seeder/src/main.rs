//! Demo data seeder for CareTrack development and testing.
//!
//! Creates a budget for a demo patient through the budget engine, records a
//! few months of usage and logs the resulting warnings. Running it again is
//! a no-op while the demo budget exists.
//!
//! Usage: cargo run --bin seeder

use std::sync::Arc;

use anyhow::Context;
use caretrack_core::budget::{
    BudgetEngine, BudgetEvent, ChannelNotifier, NewBudget, NewCategory, NewSubElement,
};
use caretrack_db::BudgetRepository;
use caretrack_shared::AppConfig;
use caretrack_shared::config::LoggingConfig;
use rust_decimal::Decimal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Patient the demo budget belongs to.
const DEMO_PATIENT_ID: &str = "demo-patient-0001";
/// Organization caring for the demo patient.
const DEMO_ORGANIZATION_ID: &str = "demo-org-0001";
/// Manager recorded as the budget's creator.
const DEMO_MANAGER_ID: &str = "demo-manager-0001";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("Failed to load configuration")?;
    init_tracing(&config.logging);

    let db = caretrack_db::connect_with(&config.database)
        .await
        .context("Failed to connect to database")?;
    info!("Connected to database");

    let (notifier, mut events) = ChannelNotifier::channel();
    let listener = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    });

    let engine = BudgetEngine::from_config(
        &config.budget,
        Arc::new(BudgetRepository::new(db)),
        Arc::new(notifier),
    );
    seed_demo_budget(&engine).await?;

    drop(engine);
    listener.await.context("Event listener failed")?;
    info!("Seeding complete");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn log_event(event: &BudgetEvent) {
    match event {
        BudgetEvent::UsageAlert(alert) => warn!(
            category = %alert.category_name,
            sub_element = %alert.sub_element_name,
            level = %alert.level,
            usage_percent = %alert.usage_percent.round_dp(2),
            "Usage alert"
        ),
        other => info!(?other, "Budget event"),
    }
}

fn sub_element(name: &str, budget: i64) -> NewSubElement {
    NewSubElement {
        name: name.to_string(),
        sub_element_budget: Decimal::new(budget, 0),
        ..Default::default()
    }
}

fn demo_draft() -> NewBudget {
    NewBudget {
        patient_id: DEMO_PATIENT_ID.to_string(),
        organization_id: DEMO_ORGANIZATION_ID.to_string(),
        created_by: DEMO_MANAGER_ID.to_string(),
        total_budget: Decimal::new(5000, 0),
        categories: vec![
            NewCategory {
                name: "Hygiene".to_string(),
                description: Some("Personal care supplies".to_string()),
                category_budget: Decimal::new(1200, 0),
                sub_elements: vec![
                    sub_element("Soap", 200),
                    sub_element("Shampoo", 300),
                    sub_element("Toothpaste", 700),
                ],
                ..Default::default()
            },
            NewCategory {
                name: "Food".to_string(),
                category_budget: Decimal::new(2800, 0),
                sub_elements: vec![sub_element("Groceries", 2400), sub_element("Snacks", 400)],
                ..Default::default()
            },
            NewCategory {
                name: "Transport".to_string(),
                category_budget: Decimal::new(1000, 0),
                sub_elements: vec![sub_element("Taxi", 1000)],
                ..Default::default()
            },
        ],
    }
}

async fn seed_demo_budget(engine: &BudgetEngine) -> anyhow::Result<()> {
    match engine.get(DEMO_PATIENT_ID).await {
        Ok(existing) => {
            info!(budget_id = %existing.id, "Demo budget already present, skipping");
            return Ok(());
        }
        Err(err) if err.is_not_found() => {}
        Err(err) => return Err(err).context("Failed to look up demo budget"),
    }

    let budget = engine
        .create(demo_draft())
        .await
        .context("Failed to create demo budget")?;

    let hygiene = &budget.categories[0];
    let soap = hygiene.sub_elements[0].id;
    engine
        .update_monthly_usage(DEMO_PATIENT_ID, hygiene.id, soap, 0, Decimal::new(180, 0))
        .await?;

    let food = &budget.categories[1];
    let groceries = food.sub_elements[0].id;
    let monthly = vec![Decimal::new(21050, 2); 12];
    engine
        .update_monthly_usage_bulk(DEMO_PATIENT_ID, food.id, groceries, monthly)
        .await?;

    for warning in engine.warnings(DEMO_PATIENT_ID).await? {
        warn!(%warning, "Demo budget warning");
    }
    Ok(())
}
