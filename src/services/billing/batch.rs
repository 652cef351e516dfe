use serde_json::Value;
use sqlx::Row;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::tenancy::db_pool;

use super::generator::{generate_bill, BillOutcome, ACTIVE_RENTAL_STATUSES};
use super::period::BillingPeriod;

/// Outcome of one building-wide billing run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BatchSummary {
    pub message: String,
    pub billing_period: String,
    pub bills_created: u32,
    pub bills_existed: u32,
    pub errors: u32,
}

/// Generate monthly bills for every occupied room instance of a building.
///
/// Idempotent and additive-only: rerunning for the same period creates
/// nothing new and reports the existing bills in `bills_existed`. One
/// instance failing is logged and counted; only the up-front eligibility
/// query failing (infrastructure) aborts the run.
pub async fn generate_monthly_bills_for_building(
    state: &AppState,
    building_id: &str,
    period_override: Option<&str>,
) -> AppResult<BatchSummary> {
    let pool = db_pool(state)?;

    let period = match period_override.map(str::trim).filter(|value| !value.is_empty()) {
        Some(label) => BillingPeriod::parse(label).ok_or_else(|| {
            AppError::BadRequest(format!(
                "Invalid billing period '{label}', expected YYYY-MM."
            ))
        })?,
        None => BillingPeriod::previous_month_in(state.config.billing_tz()),
    };

    // One pass: active instances of the building joined to rentals in the
    // active set whose contract touches the period. Instances with no
    // qualifying rental drop out here.
    let rows = sqlx::query(
        "SELECT row_to_json(r) AS row
         FROM rentals r
         JOIN room_instances ri ON ri.id = r.room_instance_id
         JOIN rooms rm ON rm.id = ri.room_id
         WHERE rm.building_id = $1::uuid
           AND ri.is_active = true
           AND r.status = ANY($2)
           AND r.contract_start_date <= $3
           AND (r.contract_end_date IS NULL OR r.contract_end_date >= $4)
         ORDER BY rm.name ASC, ri.name ASC",
    )
    .bind(building_id)
    .bind(
        ACTIVE_RENTAL_STATUSES
            .iter()
            .map(|status| (*status).to_string())
            .collect::<Vec<_>>(),
    )
    .bind(period.end())
    .bind(period.start())
    .fetch_all(pool)
    .await
    .map_err(|error| {
        tracing::error!(db_error = %error, building_id, "Failed to fetch billable rentals");
        AppError::Dependency("Database operation failed.".to_string())
    })?;

    let rentals = rows
        .into_iter()
        .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
        .collect::<Vec<_>>();

    let mut bills_created = 0u32;
    let mut bills_existed = 0u32;
    let mut errors = 0u32;

    for rental in &rentals {
        let rental_id = rental
            .as_object()
            .and_then(|obj| obj.get("id"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match generate_bill(state, rental, &period, true).await {
            Ok(BillOutcome::Created(_)) => bills_created += 1,
            Ok(BillOutcome::AlreadyExisted) => bills_existed += 1,
            Ok(BillOutcome::NotEligible) => {}
            Err(error) => {
                warn!(rental_id, %error, "Bill generation failed for rental");
                errors += 1;
            }
        }
    }

    let summary = BatchSummary {
        message: summary_message(&period, bills_created, bills_existed),
        billing_period: period.label(),
        bills_created,
        bills_existed,
        errors,
    };

    info!(
        building_id,
        billing_period = %summary.billing_period,
        created = summary.bills_created,
        existed = summary.bills_existed,
        errors = summary.errors,
        "Building billing run completed"
    );

    Ok(summary)
}

fn summary_message(period: &BillingPeriod, created: u32, existed: u32) -> String {
    format!(
        "Generated {created} bill(s) for {} ({existed} already existed).",
        period.label()
    )
}

#[cfg(test)]
mod tests {
    use super::super::period::BillingPeriod;
    use super::summary_message;

    #[test]
    fn summarizes_created_and_existing_counts() {
        let period = BillingPeriod::parse("2024-03").expect("valid period");
        assert_eq!(
            summary_message(&period, 4, 2),
            "Generated 4 bill(s) for 2024-03 (2 already existed)."
        );
        assert_eq!(
            summary_message(&period, 0, 0),
            "Generated 0 bill(s) for 2024-03 (0 already existed)."
        );
    }
}
