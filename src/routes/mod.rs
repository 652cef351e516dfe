use axum::routing::get;
use axum::Router;

use crate::state::AppState;

pub mod bills;
pub mod health;
pub mod meter_readings;

pub fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .merge(bills::router())
        .merge(meter_readings::router())
}
