use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Value};

use crate::{
    auth::require_user_id,
    error::AppResult,
    schemas::{validate_input, RoomInstancePath, SubmitMeterDataInput},
    services::billing::{
        generator,
        meter_readings::{pending_readings, room_id_for_instance, upsert_reading},
    },
    state::AppState,
    tenancy::{assert_room_instance_owner, db_pool},
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/room-instances/{room_instance_id}/meter-readings",
            axum::routing::put(put_readings),
        )
        .route(
            "/room-instances/{room_instance_id}/meter-readings/pending",
            axum::routing::get(get_pending_readings),
        )
}

/// Record readings directly against a room instance. Any open bill for the
/// instance is recomputed with the new readings.
async fn put_readings(
    State(state): State<AppState>,
    Path(path): Path<RoomInstancePath>,
    headers: HeaderMap,
    Json(input): Json<SubmitMeterDataInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_room_instance_owner(&state, &user_id, &path.room_instance_id).await?;
    let pool = db_pool(&state)?;
    validate_input(&input)?;

    let mut readings = Vec::with_capacity(input.readings.len());
    for entry in &input.readings {
        let stored = upsert_reading(
            pool,
            &path.room_instance_id,
            &entry.room_cost_id,
            entry.meter_reading,
            entry.last_meter_reading,
        )
        .await?;
        readings.push(stored);
    }

    let bill = match generator::find_open_bill(pool, &path.room_instance_id).await? {
        Some(open_bill) => Some(generator::recalculate_bill(&state, &open_bill).await?),
        None => None,
    };

    Ok(Json(json!({ "readings": readings, "bill": bill })))
}

/// The "readings to input" view for data-entry screens.
async fn get_pending_readings(
    State(state): State<AppState>,
    Path(path): Path<RoomInstancePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_room_instance_owner(&state, &user_id, &path.room_instance_id).await?;
    let pool = db_pool(&state)?;

    let room_id = room_id_for_instance(pool, &path.room_instance_id).await?;
    let readings = pending_readings(pool, &room_id, &path.room_instance_id).await?;

    Ok(Json(json!({ "data": readings })))
}
