use serde_json::{json, Map, Value};
use sqlx::Row;

use crate::error::{AppError, AppResult};
use crate::services::billing::money::format_amount;
use crate::state::AppState;
use crate::tenancy::db_pool;

/// Payload of the "bill ready" event fired when a bill first reaches
/// `pending`, either at creation or on the draft to pending transition.
#[derive(Debug, Clone)]
pub struct BillReadyNotification {
    pub bill_id: String,
    pub tenant_user_id: String,
    pub landlord_user_id: String,
    pub room_name: String,
    pub month: i64,
    pub year: i64,
    pub amount: f64,
    pub currency: String,
    pub due_date: String,
}

/// Emit the bill-ready event, fan it out, and queue the outbound message.
///
/// Exactly-once: the event row carries a dedupe key per bill, so a repeated
/// transition (or a racing double submit) finds the existing event and stops.
/// Callers treat any error as non-fatal; delivery never blocks billing.
pub async fn notify_bill_ready(state: &AppState, input: BillReadyNotification) -> AppResult<()> {
    let pool = db_pool(state)?;

    if input.bill_id.is_empty() || input.tenant_user_id.is_empty() {
        return Ok(());
    }

    let dedupe_key = format!("bill_ready:{}", input.bill_id);
    if event_exists(pool, &dedupe_key).await? {
        return Ok(());
    }

    let landlord_name = lookup_user_name(pool, &input.landlord_user_id).await;
    let amount_display = format_amount(input.amount, &input.currency);
    let title = format!("Invoice ready for {}", input.room_name);
    let body = format!(
        "Your {:02}/{} invoice for {} is ready: {amount_display}, due {}.",
        input.month, input.year, input.room_name, input.due_date
    );

    let payload = json!({
        "bill_id": input.bill_id,
        "tenant_user_id": input.tenant_user_id,
        "month": input.month,
        "year": input.year,
        "room_name": input.room_name,
        "amount": input.amount,
        "currency": input.currency,
        "due_date": input.due_date,
        "landlord_name": landlord_name,
    });

    let event_id = match insert_event(pool, &dedupe_key, &title, &body, &input, &payload).await {
        Ok(event_id) => event_id,
        // Another writer got there first; the notification already exists.
        Err(AppError::Conflict(_)) => return Ok(()),
        Err(error) => return Err(error),
    };

    for recipient in [&input.tenant_user_id, &input.landlord_user_id] {
        if recipient.is_empty() {
            continue;
        }
        let _ = sqlx::query(
            "INSERT INTO user_notifications (event_id, recipient_user_id)
             VALUES ($1::uuid, $2::uuid)
             ON CONFLICT (event_id, recipient_user_id) DO NOTHING",
        )
        .bind(&event_id)
        .bind(recipient)
        .execute(pool)
        .await
        .map_err(map_sqlx_error)?;
    }

    queue_message(pool, &input.tenant_user_id, &body, &input.bill_id).await;
    push_webhook(state, &payload).await;

    Ok(())
}

async fn event_exists(pool: &sqlx::PgPool, dedupe_key: &str) -> AppResult<bool> {
    let row = sqlx::query(
        "SELECT 1 AS present FROM notification_events WHERE dedupe_key = $1 LIMIT 1",
    )
    .bind(dedupe_key)
    .fetch_optional(pool)
    .await
    .map_err(map_sqlx_error)?;
    Ok(row.is_some())
}

async fn insert_event(
    pool: &sqlx::PgPool,
    dedupe_key: &str,
    title: &str,
    body: &str,
    input: &BillReadyNotification,
    payload: &Value,
) -> AppResult<String> {
    let row = sqlx::query(
        "INSERT INTO notification_events
            (event_type, category, severity, title, body, source_table, source_id,
             dedupe_key, payload, occurred_at)
         VALUES ('bill_ready', 'billing', 'info', $1, $2, 'bills', $3::uuid, $4, $5, now())
         RETURNING id::text AS id",
    )
    .bind(title)
    .bind(body)
    .bind(&input.bill_id)
    .bind(dedupe_key)
    .bind(payload)
    .fetch_one(pool)
    .await
    .map_err(|error| {
        if let sqlx::Error::Database(ref db_error) = error {
            if db_error.code().as_deref() == Some("23505") {
                return AppError::Conflict(
                    "Duplicate notification event rejected by dedupe key.".to_string(),
                );
            }
        }
        map_sqlx_error(error)
    })?;

    Ok(row.try_get::<String, _>("id").unwrap_or_default())
}

/// Queue the outbound message for the delivery worker. Best-effort.
async fn queue_message(pool: &sqlx::PgPool, recipient_user_id: &str, body: &str, bill_id: &str) {
    let mut record = Map::new();
    record.insert(
        "recipient_user_id".to_string(),
        Value::String(recipient_user_id.to_string()),
    );
    record.insert("channel".to_string(), Value::String("app".to_string()));
    record.insert("status".to_string(), Value::String("queued".to_string()));

    let mut payload = Map::new();
    payload.insert("body".to_string(), Value::String(body.to_string()));
    payload.insert("bill_id".to_string(), Value::String(bill_id.to_string()));
    record.insert("payload".to_string(), Value::Object(payload));

    if let Err(error) =
        crate::repository::table_service::create_row(pool, "message_logs", &record).await
    {
        tracing::warn!(bill_id, %error, "Failed to queue bill notification message");
    }
}

/// Forward the event to the configured delivery webhook, when set. The
/// delivery mechanism is an external collaborator; failures are logged only.
async fn push_webhook(state: &AppState, payload: &Value) {
    let Some(url) = state.config.notify_webhook_url.as_deref() else {
        return;
    };

    let result = state
        .http_client
        .post(url)
        .json(&json!({ "event_type": "bill_ready", "data": payload }))
        .send()
        .await;

    match result {
        Ok(response) if response.status().is_success() => {}
        Ok(response) => {
            tracing::warn!(status = %response.status(), "Notify webhook returned non-success");
        }
        Err(error) => {
            tracing::warn!(%error, "Notify webhook request failed");
        }
    }
}

async fn lookup_user_name(pool: &sqlx::PgPool, user_id: &str) -> String {
    if user_id.is_empty() {
        return String::new();
    }
    sqlx::query("SELECT full_name FROM app_users WHERE id = $1::uuid LIMIT 1")
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .ok()
        .flatten()
        .and_then(|row| row.try_get::<Option<String>, _>("full_name").ok().flatten())
        .unwrap_or_default()
}

fn map_sqlx_error(error: sqlx::Error) -> AppError {
    tracing::error!(db_error = %error, "Notification query failed");
    AppError::Dependency("Database operation failed.".to_string())
}
