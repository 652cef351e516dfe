use chrono::NaiveDate;
use serde_json::Value;
use sqlx::{PgPool, Row};

use crate::error::{AppError, AppResult};
use crate::services::notifications::{self, BillReadyNotification};
use crate::state::AppState;
use crate::tenancy::db_pool;

use super::cost_items::{calculate_bill_items, LineItem};
use super::meter_readings::load_merged_costs;
use super::money::{normalize_amount, round2};
use super::period::BillingPeriod;
use super::proration::{contract_overlaps_period, prorate, Proration};
use super::status::{after_meter_update, initial_status, BillStatus};

/// Rental statuses that keep a room instance billable.
pub const ACTIVE_RENTAL_STATUSES: &[&str] = &["active", "pending_renewal"];

#[derive(Debug, Clone)]
pub enum BillOutcome {
    Created(Value),
    /// A bill for (rental, period) already exists: the batch path counts
    /// this, the manual path turns it into a Conflict.
    AlreadyExisted,
    /// Rental is not active or its contract does not touch the period.
    NotEligible,
}

/// Eligibility filter shared by the batch and manual paths. Runs before any
/// proration so the day math never sees a disjoint window.
pub fn rental_is_billable(rental: &Value, period: &BillingPeriod) -> bool {
    let status = value_str(rental, "status");
    if !ACTIVE_RENTAL_STATUSES.contains(&status.as_str()) {
        return false;
    }
    let Some(contract_start) = value_date(rental, "contract_start_date") else {
        return false;
    };
    let contract_end = value_date(rental, "contract_end_date");
    contract_overlaps_period(contract_start, contract_end, period.start(), period.end())
}

/// Occupants currently holding the room instance. Both the batch and the
/// manual path use this, so per-person costs always price real occupancy.
pub async fn occupancy_count(pool: &PgPool, room_instance_id: &str) -> AppResult<i64> {
    let row = sqlx::query(
        "SELECT COUNT(*)::bigint AS total
         FROM rentals
         WHERE room_instance_id = $1::uuid
           AND status = ANY($2)",
    )
    .bind(room_instance_id)
    .bind(
        ACTIVE_RENTAL_STATUSES
            .iter()
            .map(|status| (*status).to_string())
            .collect::<Vec<_>>(),
    )
    .fetch_one(pool)
    .await
    .map_err(map_db_error)?;

    Ok(row.try_get::<i64, _>("total").unwrap_or(0).max(1))
}

/// Generate one bill for one rental and period.
///
/// Additive-only: an existing (rental, billing_period) bill is reported as
/// `AlreadyExisted`, never recreated or overwritten. The database unique
/// constraint backs the in-flight check; a unique violation from a racing
/// run is folded into the same outcome.
pub async fn generate_bill(
    state: &AppState,
    rental: &Value,
    period: &BillingPeriod,
    is_auto_generated: bool,
) -> AppResult<BillOutcome> {
    let pool = db_pool(state)?;

    let rental_id = value_str(rental, "id");
    let room_instance_id = value_str(rental, "room_instance_id");
    if rental_id.is_empty() || room_instance_id.is_empty() {
        return Err(AppError::UnprocessableEntity(
            "Rental record is missing its identifiers.".to_string(),
        ));
    }

    if !rental_is_billable(rental, period) {
        return Ok(BillOutcome::NotEligible);
    }
    let Some(contract_start) = value_date(rental, "contract_start_date") else {
        return Ok(BillOutcome::NotEligible);
    };
    let contract_end = value_date(rental, "contract_end_date");

    if bill_exists(pool, &rental_id, &period.label()).await? {
        return Ok(BillOutcome::AlreadyExisted);
    }

    let (room_id, room_name, building_id) = resolve_room(pool, &room_instance_id).await?;
    let occupancy = occupancy_count(pool, &room_instance_id).await?;
    let costs = load_merged_costs(pool, &room_id, &room_instance_id).await?;
    let base_rent = resolve_base_rent(pool, &room_id, rental).await?;

    let proration = prorate(period.start(), period.end(), contract_start, contract_end);
    let computation = calculate_bill_items(
        &costs,
        occupancy,
        &proration,
        base_rent,
        &state.config.default_currency,
    );

    let status = initial_status(is_auto_generated, computation.requires_meter_data);
    let subtotal = round2(computation.subtotal);
    let due_date = period.due_date(state.config.billing_due_day);

    let inserted = insert_bill_with_items(
        pool,
        &BillInsert {
            rental_id: &rental_id,
            room_instance_id: &room_instance_id,
            building_id: &building_id,
            period,
            proration: &proration,
            occupancy,
            subtotal,
            status,
            due_date,
            is_auto_generated,
            requires_meter_data: computation.requires_meter_data,
        },
        &computation.items,
    )
    .await;

    let bill = match inserted {
        Ok(bill) => bill,
        Err(AppError::Conflict(_)) => return Ok(BillOutcome::AlreadyExisted),
        Err(error) => return Err(error),
    };

    if status == BillStatus::Pending {
        notify_ready(state, &bill, rental, &room_name).await;
    }

    Ok(BillOutcome::Created(bill))
}

/// Recompute an existing bill from current cost configuration and readings:
/// delete all items, rerun the calculators, persist the new items and totals,
/// and re-derive status, all in one transaction so a concurrent reader
/// never sees a half-recomputed bill.
pub async fn recalculate_bill(state: &AppState, bill: &Value) -> AppResult<Value> {
    let pool = db_pool(state)?;
    assert_mutable(bill)?;

    let bill_id = value_str(bill, "id");
    let rental_id = value_str(bill, "rental_id");
    let room_instance_id = value_str(bill, "room_instance_id");

    let rental = fetch_row(pool, "rentals", &rental_id).await?;
    let (room_id, room_name, _) = resolve_room(pool, &room_instance_id).await?;

    let (Some(period_start), Some(period_end)) = (
        value_date(bill, "period_start"),
        value_date(bill, "period_end"),
    ) else {
        return Err(AppError::Internal(
            "Bill record is missing its period window.".to_string(),
        ));
    };
    let contract_start = value_date(&rental, "contract_start_date")
        .or_else(|| value_date(bill, "rental_start_date"))
        .unwrap_or(period_start);
    let contract_end = value_date(&rental, "contract_end_date");

    let occupancy = bill
        .as_object()
        .and_then(|obj| obj.get("occupancy_count"))
        .and_then(Value::as_i64)
        .unwrap_or(1)
        .max(1);

    let costs = load_merged_costs(pool, &room_id, &room_instance_id).await?;
    let base_rent = resolve_base_rent(pool, &room_id, &rental).await?;

    let proration = prorate(period_start, period_end, contract_start, contract_end);
    let computation = calculate_bill_items(
        &costs,
        occupancy,
        &proration,
        base_rent,
        &state.config.default_currency,
    );

    let current_status = BillStatus::parse(&value_str(bill, "status")).unwrap_or(BillStatus::Pending);
    let transition = after_meter_update(current_status, computation.requires_meter_data);

    let subtotal = round2(computation.subtotal);
    let discount = normalize_amount(field(bill, "discount_amount"));
    let tax = normalize_amount(field(bill, "tax_amount"));
    let paid = normalize_amount(field(bill, "paid_amount"));
    let total = round2(subtotal - discount + tax);
    let remaining = round2(total - paid);

    let mut tx = pool.begin().await.map_err(map_db_error)?;

    sqlx::query("DELETE FROM bill_items WHERE bill_id = $1::uuid")
        .bind(&bill_id)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?;

    insert_items(&mut tx, &bill_id, &computation.items).await?;

    let updated = sqlx::query(
        "UPDATE bills
         SET subtotal = $2,
             total_amount = $3,
             remaining_amount = $4,
             requires_meter_data = $5,
             status = $6,
             rental_start_date = $7,
             rental_end_date = $8,
             updated_at = now()
         WHERE id = $1::uuid
         RETURNING row_to_json(bills.*) AS row",
    )
    .bind(&bill_id)
    .bind(subtotal)
    .bind(total)
    .bind(remaining)
    .bind(computation.requires_meter_data)
    .bind(transition.next.as_str())
    .bind(proration.effective_start)
    .bind(proration.effective_end)
    .fetch_one(&mut *tx)
    .await
    .map_err(map_db_error)?;

    tx.commit().await.map_err(map_db_error)?;

    let updated = updated
        .try_get::<Option<Value>, _>("row")
        .ok()
        .flatten()
        .ok_or_else(|| AppError::Internal("Could not update bill record.".to_string()))?;

    if transition.became_ready {
        notify_ready(state, &updated, &rental, &room_name).await;
    }

    Ok(updated)
}

/// Payment-completion entry point (external collaborator). Idempotent: a bill
/// that is already paid comes back unchanged.
pub async fn complete_payment(state: &AppState, bill: &Value) -> AppResult<Value> {
    let pool = db_pool(state)?;

    if value_str(bill, "status") == BillStatus::Paid.as_str() {
        return Ok(bill.clone());
    }

    let bill_id = value_str(bill, "id");
    let row = sqlx::query(
        "UPDATE bills
         SET status = 'paid',
             paid_amount = total_amount,
             remaining_amount = 0,
             paid_date = now(),
             updated_at = now()
         WHERE id = $1::uuid
         RETURNING row_to_json(bills.*) AS row",
    )
    .bind(&bill_id)
    .fetch_one(pool)
    .await
    .map_err(map_db_error)?;

    row.try_get::<Option<Value>, _>("row")
        .ok()
        .flatten()
        .ok_or_else(|| AppError::Internal("Could not mark bill paid.".to_string()))
}

/// Paid bills and their items are immutable; every mutating path checks this
/// before touching the database.
pub fn assert_mutable(bill: &Value) -> AppResult<()> {
    if value_str(bill, "status") == BillStatus::Paid.as_str() {
        return Err(AppError::Conflict(
            "Bill is paid and can no longer be modified.".to_string(),
        ));
    }
    Ok(())
}

/// Remove an unpaid bill and its items in one transaction. Paid bills are
/// rejected before any write.
pub async fn delete_bill(state: &AppState, bill: &Value) -> AppResult<()> {
    let pool = db_pool(state)?;
    assert_mutable(bill)?;

    let bill_id = value_str(bill, "id");
    let mut tx = pool.begin().await.map_err(map_db_error)?;

    sqlx::query("DELETE FROM bill_items WHERE bill_id = $1::uuid")
        .bind(&bill_id)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?;
    sqlx::query("DELETE FROM bills WHERE id = $1::uuid")
        .bind(&bill_id)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?;

    tx.commit().await.map_err(map_db_error)
}

/// The open (draft or pending) bill a fresh meter reading should flow into.
pub async fn find_open_bill(pool: &PgPool, room_instance_id: &str) -> AppResult<Option<Value>> {
    let row = sqlx::query(
        "SELECT row_to_json(t) AS row
         FROM bills t
         WHERE room_instance_id = $1::uuid
           AND status IN ('draft', 'pending')
         ORDER BY billing_period DESC
         LIMIT 1",
    )
    .bind(room_instance_id)
    .fetch_optional(pool)
    .await
    .map_err(map_db_error)?;

    Ok(row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten()))
}

async fn bill_exists(pool: &PgPool, rental_id: &str, billing_period: &str) -> AppResult<bool> {
    let row = sqlx::query(
        "SELECT 1 AS present FROM bills
         WHERE rental_id = $1::uuid AND billing_period = $2
         LIMIT 1",
    )
    .bind(rental_id)
    .bind(billing_period)
    .fetch_optional(pool)
    .await
    .map_err(map_db_error)?;
    Ok(row.is_some())
}

async fn resolve_room(
    pool: &PgPool,
    room_instance_id: &str,
) -> AppResult<(String, String, String)> {
    let row = sqlx::query(
        "SELECT rm.id::text AS room_id,
                rm.name AS room_name,
                ri.name AS instance_name,
                rm.building_id::text AS building_id
         FROM room_instances ri
         JOIN rooms rm ON rm.id = ri.room_id
         WHERE ri.id = $1::uuid
         LIMIT 1",
    )
    .bind(room_instance_id)
    .fetch_optional(pool)
    .await
    .map_err(map_db_error)?
    .ok_or_else(|| AppError::NotFound("Room instance not found.".to_string()))?;

    let room_id = row.try_get::<String, _>("room_id").unwrap_or_default();
    let building_id = row.try_get::<String, _>("building_id").unwrap_or_default();
    let room_name = row.try_get::<String, _>("room_name").unwrap_or_default();
    let instance_name = row
        .try_get::<Option<String>, _>("instance_name")
        .ok()
        .flatten()
        .unwrap_or_default();

    let display_name = if instance_name.is_empty() || instance_name == room_name {
        room_name
    } else {
        format!("{room_name} / {instance_name}")
    };

    Ok((room_id, display_name, building_id))
}

/// Base rent comes from the room's pricing row; a rental-level monthly rent
/// stands in when no pricing is configured.
async fn resolve_base_rent(
    pool: &PgPool,
    room_id: &str,
    rental: &Value,
) -> AppResult<Option<f64>> {
    let row = sqlx::query(
        "SELECT base_price_monthly::float8 AS base_price_monthly
         FROM room_pricing
         WHERE room_id = $1::uuid
         LIMIT 1",
    )
    .bind(room_id)
    .fetch_optional(pool)
    .await
    .map_err(map_db_error)?;

    if let Some(row) = row {
        if let Ok(Some(base)) = row.try_get::<Option<f64>, _>("base_price_monthly") {
            return Ok(Some(base));
        }
    }

    let fallback = normalize_amount(field(rental, "monthly_rent"));
    Ok((fallback > 0.0).then_some(fallback))
}

struct BillInsert<'a> {
    rental_id: &'a str,
    room_instance_id: &'a str,
    building_id: &'a str,
    period: &'a BillingPeriod,
    proration: &'a Proration,
    occupancy: i64,
    subtotal: f64,
    status: BillStatus,
    due_date: NaiveDate,
    is_auto_generated: bool,
    requires_meter_data: bool,
}

async fn insert_bill_with_items(
    pool: &PgPool,
    bill: &BillInsert<'_>,
    items: &[LineItem],
) -> AppResult<Value> {
    let mut tx = pool.begin().await.map_err(map_db_error)?;

    let row = sqlx::query(
        "INSERT INTO bills
            (rental_id, room_instance_id, building_id, billing_period, billing_month,
             billing_year, period_start, period_end, rental_start_date, rental_end_date,
             occupancy_count, subtotal, discount_amount, tax_amount, total_amount,
             paid_amount, remaining_amount, status, due_date, is_auto_generated,
             requires_meter_data)
         VALUES ($1::uuid, $2::uuid, $3::uuid, $4, $5, $6, $7, $8, $9, $10,
                 $11, $12, 0, 0, $12, 0, $12, $13, $14, $15, $16)
         RETURNING row_to_json(bills.*) AS row",
    )
    .bind(bill.rental_id)
    .bind(bill.room_instance_id)
    .bind(bill.building_id)
    .bind(bill.period.label())
    .bind(bill.period.month as i32)
    .bind(bill.period.year)
    .bind(bill.period.start())
    .bind(bill.period.end())
    .bind(bill.proration.effective_start)
    .bind(bill.proration.effective_end)
    .bind(bill.occupancy)
    .bind(bill.subtotal)
    .bind(bill.status.as_str())
    .bind(bill.due_date)
    .bind(bill.is_auto_generated)
    .bind(bill.requires_meter_data)
    .fetch_one(&mut *tx)
    .await
    .map_err(map_db_error)?;

    let created = row
        .try_get::<Option<Value>, _>("row")
        .ok()
        .flatten()
        .ok_or_else(|| AppError::Internal("Could not create bill record.".to_string()))?;

    let bill_id = value_str(&created, "id");
    insert_items(&mut tx, &bill_id, items).await?;

    tx.commit().await.map_err(map_db_error)?;
    Ok(created)
}

async fn insert_items(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    bill_id: &str,
    items: &[LineItem],
) -> AppResult<()> {
    for item in items {
        sqlx::query(
            "INSERT INTO bill_items
                (bill_id, item_type, item_name, description, quantity, unit_price, amount, currency)
             VALUES ($1::uuid, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(bill_id)
        .bind(&item.item_type)
        .bind(&item.item_name)
        .bind(&item.description)
        .bind(item.quantity)
        .bind(item.unit_price)
        .bind(item.amount)
        .bind(&item.currency)
        .execute(&mut **tx)
        .await
        .map_err(map_db_error)?;
    }
    Ok(())
}

/// Fire the "bill ready" notification. Best-effort: a delivery problem is
/// logged and must never roll back or fail the bill write.
async fn notify_ready(state: &AppState, bill: &Value, rental: &Value, room_name: &str) {
    let input = BillReadyNotification {
        bill_id: value_str(bill, "id"),
        tenant_user_id: value_str(rental, "tenant_user_id"),
        landlord_user_id: value_str(rental, "landlord_user_id"),
        room_name: room_name.to_string(),
        month: field(bill, "billing_month").as_i64().unwrap_or(0),
        year: field(bill, "billing_year").as_i64().unwrap_or(0),
        amount: normalize_amount(field(bill, "total_amount")),
        currency: state.config.default_currency.clone(),
        due_date: value_str(bill, "due_date"),
    };

    if let Err(error) = notifications::notify_bill_ready(state, input).await {
        tracing::warn!(
            bill_id = %value_str(bill, "id"),
            %error,
            "Bill ready notification failed"
        );
    }
}

async fn fetch_row(pool: &PgPool, table: &str, row_id: &str) -> AppResult<Value> {
    crate::repository::table_service::get_row(pool, table, row_id, "id").await
}

fn field<'a>(row: &'a Value, key: &str) -> &'a Value {
    row.as_object().and_then(|obj| obj.get(key)).unwrap_or(&Value::Null)
}

fn value_str(row: &Value, key: &str) -> String {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_default()
}

fn value_date(row: &Value, key: &str) -> Option<NaiveDate> {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .and_then(|text| {
            let trimmed = text.trim();
            NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .ok()
                .or_else(|| {
                    chrono::DateTime::parse_from_rfc3339(trimmed)
                        .ok()
                        .map(|parsed| parsed.date_naive())
                })
        })
}

fn map_db_error(error: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(ref db_error) = error {
        if db_error.code().as_deref() == Some("23505") {
            return AppError::Conflict(
                "Duplicate value violates a unique constraint.".to_string(),
            );
        }
    }
    tracing::error!(db_error = %error, "Billing query failed");
    AppError::Dependency("Database operation failed.".to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::period::BillingPeriod;
    use super::{assert_mutable, rental_is_billable};

    fn period() -> BillingPeriod {
        BillingPeriod::parse("2024-03").expect("valid period")
    }

    #[test]
    fn billable_requires_active_status_and_overlap() {
        let rental = json!({
            "status": "active",
            "contract_start_date": "2024-03-16",
            "contract_end_date": null,
        });
        assert!(rental_is_billable(&rental, &period()));

        let ended = json!({
            "status": "ended",
            "contract_start_date": "2024-03-16",
        });
        assert!(!rental_is_billable(&ended, &period()));

        let disjoint = json!({
            "status": "active",
            "contract_start_date": "2024-04-01",
        });
        assert!(!rental_is_billable(&disjoint, &period()));

        let expired = json!({
            "status": "active",
            "contract_start_date": "2023-01-01",
            "contract_end_date": "2024-02-29",
        });
        assert!(!rental_is_billable(&expired, &period()));
    }

    #[test]
    fn pending_renewal_counts_as_active() {
        let rental = json!({
            "status": "pending_renewal",
            "contract_start_date": "2024-01-01",
        });
        assert!(rental_is_billable(&rental, &period()));
    }

    #[test]
    fn missing_contract_start_is_not_billable() {
        let rental = json!({ "status": "active" });
        assert!(!rental_is_billable(&rental, &period()));
    }

    #[test]
    fn paid_bills_are_immutable() {
        let paid = json!({ "status": "paid" });
        assert!(assert_mutable(&paid).is_err());

        let pending = json!({ "status": "pending" });
        assert!(assert_mutable(&pending).is_ok());
    }
}
