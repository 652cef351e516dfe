use serde_json::{Map, Value};
use sqlx::PgPool;

/// Record a mutation in the audit trail. Best-effort: auditing must never
/// fail the request that triggered it.
pub async fn write_audit_log(
    pool: Option<&PgPool>,
    actor_user_id: Option<&str>,
    action: &str,
    entity_table: &str,
    entity_id: Option<&str>,
    payload: Option<Value>,
) {
    let Some(pool) = pool else {
        return;
    };

    let mut record = Map::new();
    record.insert("action".to_string(), Value::String(action.to_string()));
    record.insert(
        "entity_table".to_string(),
        Value::String(entity_table.to_string()),
    );
    if let Some(actor) = actor_user_id.map(str::trim).filter(|value| !value.is_empty()) {
        record.insert(
            "actor_user_id".to_string(),
            Value::String(actor.to_string()),
        );
    }
    if let Some(entity) = entity_id.map(str::trim).filter(|value| !value.is_empty()) {
        record.insert("entity_id".to_string(), Value::String(entity.to_string()));
    }
    if let Some(payload) = payload {
        record.insert("payload".to_string(), payload);
    }

    if let Err(error) =
        crate::repository::table_service::create_row(pool, "audit_logs", &record).await
    {
        tracing::warn!(action, entity_table, %error, "Failed to write audit log");
    }
}
