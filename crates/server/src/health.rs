use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use crewflow_db::DbPool;
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    worker_enabled: bool,
    sweep_enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub queue_worker: &'static str,
    pub reminder_sweep: &'static str,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool, worker_enabled: bool, sweep_enabled: bool) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(HealthState { db_pool, worker_enabled, sweep_enabled })
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let ready = database.status == "ready";
    let loop_status = |enabled: bool| if enabled { "enabled" } else { "disabled" };

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "crewflow-server runtime initialized".to_string(),
        },
        database,
        queue_worker: loop_status(state.worker_enabled),
        reminder_sweep: loop_status(state.sweep_enabled),
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM _sqlx_migrations").fetch_one(pool).await
    {
        Ok(applied) => HealthCheck {
            status: "ready",
            detail: format!("database reachable; {applied} migration(s) applied"),
        },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}
