use std::time::Duration;

use chrono::{Datelike, Timelike, Utc};
use sqlx::Row;
use tokio::time::sleep;

use crate::state::AppState;

/// Spawn the background scheduler that runs periodic jobs.
///
/// The monthly billing run executes in its own `tokio::spawn` so a failure
/// never crashes the scheduler loop.
pub async fn run_background_scheduler(state: AppState) {
    if !state.config.auto_billing_enabled {
        tracing::info!("Auto billing disabled, scheduler not running");
        return;
    }
    if state.db_pool.is_none() {
        tracing::warn!("Scheduler: no database pool configured, exiting");
        return;
    }

    tracing::info!("Background scheduler started");

    let billing_tz = state.config.billing_tz();
    let run_hour = state.config.auto_billing_hour_utc;
    let mut last_monthly_run: Option<(i32, u32)> = None;

    loop {
        sleep(Duration::from_secs(60)).await;

        let now_utc = Utc::now();
        let local_today = now_utc.with_timezone(&billing_tz).date_naive();

        // Monthly billing: day 1 in the billing timezone, once, at or after
        // the configured UTC hour.
        if local_today.day() != 1 || now_utc.hour() < run_hour {
            continue;
        }
        let month_key = (local_today.year(), local_today.month());
        if last_monthly_run == Some(month_key) {
            continue;
        }
        last_monthly_run = Some(month_key);

        tracing::info!("Scheduler: running monthly billing for {local_today}");
        let st = state.clone();
        tokio::spawn(async move {
            run_monthly_billing_all_buildings(&st).await;
        });
    }
}

/// Run the previous-month batch generator for every active building.
async fn run_monthly_billing_all_buildings(state: &AppState) {
    let Some(pool) = state.db_pool.as_ref() else {
        return;
    };

    let building_ids = sqlx::query(
        "SELECT id::text AS id FROM buildings WHERE is_active = true LIMIT 1000",
    )
    .fetch_all(pool)
    .await
    .unwrap_or_default()
    .into_iter()
    .filter_map(|row| row.try_get::<String, _>("id").ok())
    .collect::<Vec<_>>();

    let mut created_total = 0u32;
    for building_id in &building_ids {
        match crate::services::billing::batch::generate_monthly_bills_for_building(
            state,
            building_id,
            None,
        )
        .await
        {
            Ok(summary) => {
                created_total += summary.bills_created;
            }
            Err(error) => {
                tracing::warn!(building_id, %error, "Scheduler: building billing run failed");
            }
        }
    }

    if !building_ids.is_empty() {
        tracing::info!(
            buildings = building_ids.len(),
            created = created_total,
            "Scheduler: monthly billing completed"
        );
    }
}
