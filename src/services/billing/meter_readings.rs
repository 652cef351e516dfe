use std::collections::HashMap;

use serde_json::{json, Value};
use sqlx::{PgPool, Row};

use crate::error::{AppError, AppResult};

use super::cost_items::{CostDefinition, CostKind};
use super::money::{normalize_amount, optional_amount};

/// Instance-level readings that shadow the room-cost defaults. The room_cost
/// row's own readings only apply to single-instance rooms or uninitialized
/// state; once an override exists it is the source of truth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterOverride {
    pub meter_reading: Option<f64>,
    pub last_meter_reading: Option<f64>,
}

/// Create-or-update the reading pair for (room_instance, room_cost). No
/// history is kept (a new report overwrites the prior one) and the
/// composite unique key makes retries safe. A missing previous reading keeps
/// whatever was stored before.
pub async fn upsert_reading(
    pool: &PgPool,
    room_instance_id: &str,
    room_cost_id: &str,
    meter_reading: f64,
    last_meter_reading: Option<f64>,
) -> AppResult<Value> {
    let row = sqlx::query(
        "INSERT INTO room_instance_meter_readings
            (room_instance_id, room_cost_id, meter_reading, last_meter_reading, recorded_at)
         VALUES ($1::uuid, $2::uuid, $3, $4, now())
         ON CONFLICT (room_instance_id, room_cost_id) DO UPDATE
         SET meter_reading = EXCLUDED.meter_reading,
             last_meter_reading = COALESCE(EXCLUDED.last_meter_reading, room_instance_meter_readings.last_meter_reading),
             recorded_at = now()
         RETURNING row_to_json(room_instance_meter_readings.*) AS row",
    )
    .bind(room_instance_id)
    .bind(room_cost_id)
    .bind(meter_reading)
    .bind(last_meter_reading)
    .fetch_one(pool)
    .await
    .map_err(map_db_error)?;

    row.try_get::<Option<Value>, _>("row")
        .ok()
        .flatten()
        .ok_or_else(|| AppError::Internal("Could not record meter reading.".to_string()))
}

pub async fn overrides_for_instance(
    pool: &PgPool,
    room_instance_id: &str,
) -> AppResult<HashMap<String, MeterOverride>> {
    let rows = sqlx::query(
        "SELECT room_cost_id::text AS room_cost_id,
                meter_reading::float8 AS meter_reading,
                last_meter_reading::float8 AS last_meter_reading
         FROM room_instance_meter_readings
         WHERE room_instance_id = $1::uuid",
    )
    .bind(room_instance_id)
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;

    let mut overrides = HashMap::with_capacity(rows.len());
    for row in rows {
        let room_cost_id = row.try_get::<String, _>("room_cost_id").unwrap_or_default();
        if room_cost_id.is_empty() {
            continue;
        }
        overrides.insert(
            room_cost_id,
            MeterOverride {
                meter_reading: row.try_get::<Option<f64>, _>("meter_reading").ok().flatten(),
                last_meter_reading: row
                    .try_get::<Option<f64>, _>("last_meter_reading")
                    .ok()
                    .flatten(),
            },
        );
    }
    Ok(overrides)
}

/// The one merge implementation. Every calculation path (generation,
/// meter-update recalculation, the pending-readings view) must resolve a
/// room's costs through here so override-vs-default precedence can never
/// diverge between call sites.
pub fn merge_costs(
    cost_rows: &[Value],
    overrides: &HashMap<String, MeterOverride>,
) -> Vec<CostDefinition> {
    let mut merged = Vec::with_capacity(cost_rows.len());

    for row in cost_rows {
        let room_cost_id = value_str(row, "id");
        if room_cost_id.is_empty() {
            continue;
        }

        let kind = match value_str(row, "cost_type").as_str() {
            "fixed" => CostKind::Fixed {
                amount: normalize_amount(field(row, "fixed_amount")),
            },
            "per_person" => CostKind::PerPerson {
                amount_per_person: normalize_amount(field(row, "per_person_amount")),
            },
            "metered" => {
                let (meter_reading, last_meter_reading) = match overrides.get(&room_cost_id) {
                    Some(override_row) => (
                        override_row.meter_reading,
                        override_row.last_meter_reading,
                    ),
                    None => (
                        optional_amount(row.get("meter_reading")),
                        optional_amount(row.get("last_meter_reading")),
                    ),
                };
                CostKind::Metered {
                    unit_price: normalize_amount(field(row, "unit_price")),
                    unit: value_str(row, "unit"),
                    meter_reading,
                    last_meter_reading,
                }
            }
            other => {
                tracing::warn!(room_cost_id, cost_type = other, "Unknown cost type skipped");
                continue;
            }
        };

        merged.push(CostDefinition {
            room_cost_id,
            name: value_str(row, "name"),
            currency: value_str(row, "currency"),
            kind,
        });
    }

    merged
}

pub async fn room_id_for_instance(pool: &PgPool, room_instance_id: &str) -> AppResult<String> {
    let row = sqlx::query("SELECT room_id::text AS room_id FROM room_instances WHERE id = $1::uuid LIMIT 1")
        .bind(room_instance_id)
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| AppError::NotFound("Room instance not found.".to_string()))?;

    Ok(row.try_get::<String, _>("room_id").unwrap_or_default())
}

/// Fetch a room's active costs and apply the instance's overrides.
pub async fn load_merged_costs(
    pool: &PgPool,
    room_id: &str,
    room_instance_id: &str,
) -> AppResult<Vec<CostDefinition>> {
    let rows = sqlx::query(
        "SELECT row_to_json(t) AS row
         FROM room_costs t
         WHERE room_id = $1::uuid AND is_active = true
         ORDER BY created_at ASC",
    )
    .bind(room_id)
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;

    let cost_rows = rows
        .into_iter()
        .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
        .collect::<Vec<_>>();

    let overrides = overrides_for_instance(pool, room_instance_id).await?;
    Ok(merge_costs(&cost_rows, &overrides))
}

/// The "readings to input" view: every metered cost of the instance's room
/// with its merged reading state, flagged complete when both readings exist.
pub async fn pending_readings(
    pool: &PgPool,
    room_id: &str,
    room_instance_id: &str,
) -> AppResult<Vec<Value>> {
    let costs = load_merged_costs(pool, room_id, room_instance_id).await?;

    let readings = costs
        .into_iter()
        .filter_map(|cost| match cost.kind {
            CostKind::Metered {
                unit_price,
                unit,
                meter_reading,
                last_meter_reading,
            } => Some(json!({
                "room_cost_id": cost.room_cost_id,
                "name": cost.name,
                "unit": unit,
                "unit_price": unit_price,
                "currency": cost.currency,
                "meter_reading": meter_reading,
                "last_meter_reading": last_meter_reading,
                "complete": meter_reading.is_some() && last_meter_reading.is_some(),
            })),
            _ => None,
        })
        .collect();

    Ok(readings)
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

fn map_db_error(error: sqlx::Error) -> AppError {
    tracing::error!(db_error = %error, "Meter reading query failed");
    AppError::Dependency("Database operation failed.".to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::super::cost_items::CostKind;
    use super::{merge_costs, MeterOverride};

    fn metered_row(id: &str) -> serde_json::Value {
        json!({
            "id": id,
            "cost_type": "metered",
            "name": "Electricity",
            "unit": "kWh",
            "unit_price": 3500,
            "currency": "VND",
            "meter_reading": 145,
            "last_meter_reading": 120,
        })
    }

    #[test]
    fn override_replaces_room_cost_readings() {
        let rows = vec![metered_row("c1")];
        let mut overrides = HashMap::new();
        overrides.insert(
            "c1".to_string(),
            MeterOverride {
                meter_reading: Some(300.0),
                last_meter_reading: Some(280.0),
            },
        );

        let merged = merge_costs(&rows, &overrides);
        assert_eq!(merged.len(), 1);
        match &merged[0].kind {
            CostKind::Metered {
                meter_reading,
                last_meter_reading,
                ..
            } => {
                assert_eq!(*meter_reading, Some(300.0));
                assert_eq!(*last_meter_reading, Some(280.0));
            }
            other => panic!("expected metered cost, got {other:?}"),
        }
    }

    #[test]
    fn override_applies_wholesale_even_when_partial() {
        // An override with only a current reading must not inherit the room
        // cost's stored previous reading: its fields replace, not fill in.
        let rows = vec![metered_row("c1")];
        let mut overrides = HashMap::new();
        overrides.insert(
            "c1".to_string(),
            MeterOverride {
                meter_reading: Some(300.0),
                last_meter_reading: None,
            },
        );

        let merged = merge_costs(&rows, &overrides);
        match &merged[0].kind {
            CostKind::Metered {
                meter_reading,
                last_meter_reading,
                ..
            } => {
                assert_eq!(*meter_reading, Some(300.0));
                assert_eq!(*last_meter_reading, None);
            }
            other => panic!("expected metered cost, got {other:?}"),
        }
    }

    #[test]
    fn falls_back_to_room_cost_readings_without_override() {
        let rows = vec![metered_row("c1")];
        let merged = merge_costs(&rows, &HashMap::new());
        match &merged[0].kind {
            CostKind::Metered {
                meter_reading,
                last_meter_reading,
                ..
            } => {
                assert_eq!(*meter_reading, Some(145.0));
                assert_eq!(*last_meter_reading, Some(120.0));
            }
            other => panic!("expected metered cost, got {other:?}"),
        }
    }

    #[test]
    fn maps_cost_types_and_skips_unknown_ones() {
        let rows = vec![
            json!({"id": "f1", "cost_type": "fixed", "name": "Internet", "fixed_amount": "150000", "currency": "VND"}),
            json!({"id": "p1", "cost_type": "per_person", "name": "Trash", "per_person_amount": 20000, "currency": "VND"}),
            json!({"id": "x1", "cost_type": "one_off", "name": "???", "currency": "VND"}),
        ];

        let merged = merge_costs(&rows, &HashMap::new());
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].kind, CostKind::Fixed { amount: 150_000.0 });
        assert_eq!(
            merged[1].kind,
            CostKind::PerPerson {
                amount_per_person: 20_000.0
            }
        );
    }

    #[test]
    fn null_readings_stay_missing_rather_than_zero() {
        let rows = vec![json!({
            "id": "c1",
            "cost_type": "metered",
            "name": "Water",
            "unit": "m3",
            "unit_price": 10000,
            "currency": "VND",
            "meter_reading": null,
            "last_meter_reading": 40,
        })];

        let merged = merge_costs(&rows, &HashMap::new());
        match &merged[0].kind {
            CostKind::Metered {
                meter_reading,
                last_meter_reading,
                ..
            } => {
                assert_eq!(*meter_reading, None);
                assert_eq!(*last_meter_reading, Some(40.0));
            }
            other => panic!("expected metered cost, got {other:?}"),
        }
    }
}
