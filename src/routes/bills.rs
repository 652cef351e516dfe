use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{count_rows, get_row, list_rows, update_row},
    schemas::{
        clamp_limit_in_range, validate_input, BillPath, BillsQuery, BuildingBillsPath,
        CreateBillInput, GenerateBuildingBillsInput, RentalBillsPath, SubmitMeterDataInput,
        UpdateBillInput,
    },
    services::audit::write_audit_log,
    services::billing::{
        batch::generate_monthly_bills_for_building,
        generator::{self, BillOutcome},
        meter_readings::upsert_reading,
        money::{normalize_amount, round2},
        period::BillingPeriod,
    },
    state::AppState,
    tenancy::{assert_bill_owner, assert_building_owner, db_pool},
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/buildings/{building_id}/bills/generate",
            axum::routing::post(generate_building_bills),
        )
        .route("/rentals/{rental_id}/bills", axum::routing::post(create_bill))
        .route("/bills", axum::routing::get(list_bills))
        .route(
            "/bills/{bill_id}",
            axum::routing::get(get_bill)
                .patch(update_bill)
                .delete(delete_bill),
        )
        .route(
            "/bills/{bill_id}/meter-data",
            axum::routing::post(submit_meter_data),
        )
        .route(
            "/bills/{bill_id}/payments/complete",
            axum::routing::post(complete_bill_payment),
        )
}

/// Batch-generate bills for every occupied room instance of a building.
async fn generate_building_bills(
    State(state): State<AppState>,
    Path(path): Path<BuildingBillsPath>,
    headers: HeaderMap,
    payload: Option<Json<GenerateBuildingBillsInput>>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_building_owner(&state, &user_id, &path.building_id).await?;

    let input = payload.map(|Json(input)| input).unwrap_or_default();
    validate_input(&input)?;

    let summary =
        generate_monthly_bills_for_building(&state, &path.building_id, input.period.as_deref())
            .await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "generate_bills",
        "buildings",
        Some(&path.building_id),
        serde_json::to_value(&summary).ok(),
    )
    .await;

    Ok(Json(json!(summary)))
}

/// Manual single-bill creation. Unlike the batch path, a duplicate period
/// here is the caller's mistake and surfaces as a conflict.
async fn create_bill(
    State(state): State<AppState>,
    Path(path): Path<RentalBillsPath>,
    headers: HeaderMap,
    Json(input): Json<CreateBillInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    validate_input(&input)?;

    let rental = get_row(pool, "rentals", &path.rental_id, "id").await?;
    let building_id = value_str(&rental, "building_id");
    assert_building_owner(&state, &user_id, &building_id).await?;

    let period = BillingPeriod::parse(&input.billing_period).ok_or_else(|| {
        AppError::BadRequest(format!(
            "Invalid billing period '{}', expected YYYY-MM.",
            input.billing_period
        ))
    })?;

    let bill = match generator::generate_bill(&state, &rental, &period, false).await? {
        BillOutcome::Created(bill) => bill,
        BillOutcome::AlreadyExisted => {
            return Err(AppError::Conflict(format!(
                "A bill already exists for this rental and period {}.",
                period.label()
            )));
        }
        BillOutcome::NotEligible => {
            return Err(AppError::UnprocessableEntity(
                "Rental is not active during the requested period.".to_string(),
            ));
        }
    };

    let bill = apply_adjustments(
        pool,
        &bill,
        input.notes.as_deref(),
        None,
        input.discount_amount,
        input.tax_amount,
    )
    .await?;

    let bill_id = value_str(&bill, "id");
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "create",
        "bills",
        Some(&bill_id),
        Some(bill.clone()),
    )
    .await;

    Ok((axum::http::StatusCode::CREATED, Json(bill)))
}

async fn list_bills(
    State(state): State<AppState>,
    Query(query): Query<BillsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let building_id = non_empty_opt(query.building_id.as_deref()).ok_or_else(|| {
        AppError::BadRequest("building_id query parameter is required.".to_string())
    })?;
    assert_building_owner(&state, &user_id, &building_id).await?;

    let mut filters = Map::new();
    filters.insert("building_id".to_string(), Value::String(building_id));
    if let Some(rental_id) = non_empty_opt(query.rental_id.as_deref()) {
        filters.insert("rental_id".to_string(), Value::String(rental_id));
    }
    if let Some(room_instance_id) = non_empty_opt(query.room_instance_id.as_deref()) {
        filters.insert(
            "room_instance_id".to_string(),
            Value::String(room_instance_id),
        );
    }
    if let Some(billing_period) = non_empty_opt(query.billing_period.as_deref()) {
        filters.insert("billing_period".to_string(), Value::String(billing_period));
    }
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        filters.insert("status".to_string(), Value::String(status));
    }

    let (rows, total) = tokio::try_join!(
        list_rows(
            pool,
            "bills",
            Some(&filters),
            clamp_limit_in_range(query.limit, 1, 500),
            query.offset.unwrap_or(0),
            "billing_period",
            false,
        ),
        count_rows(pool, "bills", Some(&filters)),
    )?;

    Ok(Json(json!({ "data": rows, "total": total })))
}

async fn get_bill(
    State(state): State<AppState>,
    Path(path): Path<BillPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let mut bill = get_row(pool, "bills", &path.bill_id, "id").await?;
    assert_bill_owner(&state, &user_id, &bill).await?;

    let mut filters = Map::new();
    filters.insert("bill_id".to_string(), Value::String(path.bill_id.clone()));
    let items = list_rows(pool, "bill_items", Some(&filters), 200, 0, "created_at", true).await?;

    if let Some(obj) = bill.as_object_mut() {
        obj.insert("items".to_string(), Value::Array(items));
    }
    Ok(Json(bill))
}

/// Edit notes, due date, or the externally supplied discount/tax scalars.
/// Totals are re-derived from the stored subtotal; paid bills are immutable.
async fn update_bill(
    State(state): State<AppState>,
    Path(path): Path<BillPath>,
    headers: HeaderMap,
    Json(input): Json<UpdateBillInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    validate_input(&input)?;

    let bill = get_row(pool, "bills", &path.bill_id, "id").await?;
    assert_bill_owner(&state, &user_id, &bill).await?;
    generator::assert_mutable(&bill)?;

    if input.is_empty() {
        return Err(AppError::BadRequest("No fields to update.".to_string()));
    }

    if let Some(due_date) = input.due_date.as_deref() {
        if chrono::NaiveDate::parse_from_str(due_date.trim(), "%Y-%m-%d").is_err() {
            return Err(AppError::BadRequest(format!(
                "Invalid due date '{due_date}', expected YYYY-MM-DD."
            )));
        }
    }

    let updated = apply_adjustments(
        pool,
        &bill,
        input.notes.as_deref(),
        input.due_date.as_deref(),
        input.discount_amount,
        input.tax_amount,
    )
    .await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "update",
        "bills",
        Some(&path.bill_id),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(updated))
}

/// Submit meter readings for the bill's room instance, then recompute the
/// bill. Completing the last missing reading flips draft → pending.
async fn submit_meter_data(
    State(state): State<AppState>,
    Path(path): Path<BillPath>,
    headers: HeaderMap,
    Json(input): Json<SubmitMeterDataInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    validate_input(&input)?;

    let bill = get_row(pool, "bills", &path.bill_id, "id").await?;
    assert_bill_owner(&state, &user_id, &bill).await?;
    generator::assert_mutable(&bill)?;

    let room_instance_id = value_str(&bill, "room_instance_id");
    for entry in &input.readings {
        upsert_reading(
            pool,
            &room_instance_id,
            &entry.room_cost_id,
            entry.meter_reading,
            entry.last_meter_reading,
        )
        .await?;
    }

    let updated = generator::recalculate_bill(&state, &bill).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "meter_data",
        "bills",
        Some(&path.bill_id),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(updated))
}

/// Payment-completion entry point for the payments collaborator.
async fn complete_bill_payment(
    State(state): State<AppState>,
    Path(path): Path<BillPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let bill = get_row(pool, "bills", &path.bill_id, "id").await?;
    assert_bill_owner(&state, &user_id, &bill).await?;

    let updated = generator::complete_payment(&state, &bill).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "payment_complete",
        "bills",
        Some(&path.bill_id),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(updated))
}

async fn delete_bill(
    State(state): State<AppState>,
    Path(path): Path<BillPath>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let bill = get_row(pool, "bills", &path.bill_id, "id").await?;
    assert_bill_owner(&state, &user_id, &bill).await?;

    generator::delete_bill(&state, &bill).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "delete",
        "bills",
        Some(&path.bill_id),
        Some(bill),
    )
    .await;

    Ok(axum::http::StatusCode::NO_CONTENT)
}

/// Patch notes/due-date/discount/tax on a bill and re-derive
/// `total_amount = subtotal - discount + tax` and the remaining balance.
async fn apply_adjustments(
    pool: &sqlx::PgPool,
    bill: &Value,
    notes: Option<&str>,
    due_date: Option<&str>,
    discount_amount: Option<f64>,
    tax_amount: Option<f64>,
) -> AppResult<Value> {
    if notes.is_none() && due_date.is_none() && discount_amount.is_none() && tax_amount.is_none() {
        return Ok(bill.clone());
    }

    let subtotal = normalize_amount(field(bill, "subtotal"));
    let paid = normalize_amount(field(bill, "paid_amount"));
    let discount = discount_amount.unwrap_or_else(|| normalize_amount(field(bill, "discount_amount")));
    let tax = tax_amount.unwrap_or_else(|| normalize_amount(field(bill, "tax_amount")));
    let total = round2(subtotal - discount + tax);

    let mut patch = Map::new();
    if let Some(notes) = notes {
        patch.insert("notes".to_string(), Value::String(notes.trim().to_string()));
    }
    if let Some(due_date) = due_date {
        patch.insert(
            "due_date".to_string(),
            Value::String(due_date.trim().to_string()),
        );
    }
    patch.insert("discount_amount".to_string(), number(discount));
    patch.insert("tax_amount".to_string(), number(tax));
    patch.insert("total_amount".to_string(), number(total));
    patch.insert("remaining_amount".to_string(), number(round2(total - paid)));

    let bill_id = value_str(bill, "id");
    update_row(pool, "bills", &bill_id, &patch, "id").await
}

fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or_else(|| Value::Number(serde_json::Number::from(0)))
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

fn non_empty_opt(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
}
