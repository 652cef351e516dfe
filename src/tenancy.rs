use serde_json::Value;
use sqlx::{PgPool, Row};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

pub fn db_pool(state: &AppState) -> AppResult<&PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}

/// Assert that `user_id` is the landlord who owns `building_id`.
///
/// Verdicts are cached briefly (moka); ownership changes are rare and the
/// check runs on every billing request.
pub async fn assert_building_owner(
    state: &AppState,
    user_id: &str,
    building_id: &str,
) -> AppResult<()> {
    let key = (user_id.to_string(), building_id.to_string());
    if let Some(owned) = state.ownership_cache.get(&key).await {
        if owned {
            return Ok(());
        }
        return Err(not_owner());
    }

    let pool = db_pool(state)?;
    let row = sqlx::query(
        "SELECT owner_user_id::text AS owner_user_id
         FROM buildings
         WHERE id = $1::uuid
         LIMIT 1",
    )
    .bind(building_id)
    .fetch_optional(pool)
    .await
    .map_err(map_db_error)?;

    let Some(row) = row else {
        return Err(AppError::NotFound("Building not found.".to_string()));
    };
    let owner_id = row
        .try_get::<String, _>("owner_user_id")
        .unwrap_or_default();

    let owned = !owner_id.is_empty() && owner_id == user_id;
    state.ownership_cache.insert(key, owned).await;

    if owned {
        Ok(())
    } else {
        Err(not_owner())
    }
}

/// Assert ownership of the building a room instance belongs to.
pub async fn assert_room_instance_owner(
    state: &AppState,
    user_id: &str,
    room_instance_id: &str,
) -> AppResult<String> {
    let pool = db_pool(state)?;
    let row = sqlx::query(
        "SELECT b.id::text AS building_id
         FROM room_instances ri
         JOIN rooms r ON r.id = ri.room_id
         JOIN buildings b ON b.id = r.building_id
         WHERE ri.id = $1::uuid
         LIMIT 1",
    )
    .bind(room_instance_id)
    .fetch_optional(pool)
    .await
    .map_err(map_db_error)?;

    let Some(row) = row else {
        return Err(AppError::NotFound("Room instance not found.".to_string()));
    };
    let building_id = row.try_get::<String, _>("building_id").unwrap_or_default();

    assert_building_owner(state, user_id, &building_id).await?;
    Ok(building_id)
}

/// Assert ownership of the building a bill row belongs to. The bill row is
/// expected to carry `building_id` (set at generation time).
pub async fn assert_bill_owner(state: &AppState, user_id: &str, bill: &Value) -> AppResult<()> {
    let building_id = bill
        .as_object()
        .and_then(|obj| obj.get("building_id"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .ok_or_else(|| AppError::Internal("Bill record is missing its building.".to_string()))?;

    assert_building_owner(state, user_id, &building_id).await
}

fn not_owner() -> AppError {
    AppError::Forbidden("Forbidden: you do not manage this building.".to_string())
}

fn map_db_error(error: sqlx::Error) -> AppError {
    tracing::error!(db_error = %error, "Ownership lookup failed");
    AppError::Dependency("Database operation failed.".to_string())
}
