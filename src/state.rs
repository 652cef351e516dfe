use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use sqlx::PgPool;

use crate::config::AppConfig;
use crate::db;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db_pool: Option<PgPool>,
    pub http_client: reqwest::Client,
    /// (user_id, building_id) → ownership verdict, to keep per-request
    /// tenancy checks off the database hot path.
    pub ownership_cache: Cache<(String, String), bool>,
}

impl AppState {
    pub fn build(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let db_pool = db::build_pool(&config);
        if db_pool.is_none() {
            tracing::warn!("DATABASE_URL is not set — billing endpoints will refuse requests");
        }

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;

        let ownership_cache = Cache::builder()
            .time_to_live(Duration::from_secs(config.ownership_cache_ttl_seconds.max(1)))
            .max_capacity(config.ownership_cache_max_entries)
            .build();

        Ok(Self {
            config: Arc::new(config),
            db_pool,
            http_client,
            ownership_cache,
        })
    }
}
