use serde::Deserialize;
use validator::Validate;

use crate::error::AppError;

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::UnprocessableEntity(format!("Validation failed: {errors}")))
}

pub fn clamp_limit_in_range(limit: Option<i64>, min: i64, max: i64) -> i64 {
    limit.unwrap_or(max).clamp(min, max)
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuildingBillsPath {
    pub building_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RentalBillsPath {
    pub rental_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillPath {
    pub bill_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomInstancePath {
    pub room_instance_id: String,
}

/// Body of the batch-generation call. Without a period the run targets the
/// previous calendar month.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct GenerateBuildingBillsInput {
    #[validate(length(max = 7))]
    pub period: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateBillInput {
    /// "YYYY-MM"
    #[validate(length(min = 6, max = 7))]
    pub billing_period: String,
    pub notes: Option<String>,
    #[validate(range(min = 0.0))]
    pub discount_amount: Option<f64>,
    #[validate(range(min = 0.0))]
    pub tax_amount: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdateBillInput {
    pub notes: Option<String>,
    /// "YYYY-MM-DD"
    pub due_date: Option<String>,
    #[validate(range(min = 0.0))]
    pub discount_amount: Option<f64>,
    #[validate(range(min = 0.0))]
    pub tax_amount: Option<f64>,
}

impl UpdateBillInput {
    pub fn is_empty(&self) -> bool {
        self.notes.is_none()
            && self.due_date.is_none()
            && self.discount_amount.is_none()
            && self.tax_amount.is_none()
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct MeterReadingEntry {
    pub room_cost_id: String,
    #[validate(range(min = 0.0))]
    pub meter_reading: f64,
    #[validate(range(min = 0.0))]
    pub last_meter_reading: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SubmitMeterDataInput {
    #[validate(length(min = 1))]
    #[validate(nested)]
    pub readings: Vec<MeterReadingEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillsQuery {
    pub building_id: Option<String>,
    pub rental_id: Option<String>,
    pub room_instance_id: Option<String>,
    pub billing_period: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::{clamp_limit_in_range, validate_input, SubmitMeterDataInput};

    #[test]
    fn clamps_list_limits() {
        assert_eq!(clamp_limit_in_range(None, 1, 100), 100);
        assert_eq!(clamp_limit_in_range(Some(0), 1, 100), 1);
        assert_eq!(clamp_limit_in_range(Some(5000), 1, 100), 100);
        assert_eq!(clamp_limit_in_range(Some(25), 1, 100), 25);
    }

    #[test]
    fn rejects_empty_meter_submissions() {
        let input: SubmitMeterDataInput =
            serde_json::from_value(serde_json::json!({ "readings": [] })).expect("deserializes");
        assert!(validate_input(&input).is_err());

        let input: SubmitMeterDataInput = serde_json::from_value(serde_json::json!({
            "readings": [{ "room_cost_id": "c1", "meter_reading": 145.0 }]
        }))
        .expect("deserializes");
        assert!(validate_input(&input).is_ok());
    }
}
