pub mod batch;
pub mod cost_items;
pub mod generator;
pub mod meter_readings;
pub mod money;
pub mod period;
pub mod proration;
pub mod status;
