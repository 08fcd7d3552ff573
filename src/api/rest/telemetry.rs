use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::Json;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::unit::{GeoPoint, TelemetrySample};
use crate::state::AppState;
use crate::telemetry::ingest;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/telemetry", post(ingest_sample))
}

#[derive(Deserialize)]
pub struct TelemetryRequest {
    pub unit_id: Uuid,
    pub lat: f64,
    pub lng: f64,
    /// Defaults to server receipt time for devices without a clock source.
    pub timestamp: Option<DateTime<Utc>>,
}

async fn ingest_sample(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TelemetryRequest>,
) -> Result<Json<TelemetrySample>, AppError> {
    if !payload.lat.is_finite() || !payload.lng.is_finite() {
        return Err(AppError::Validation("coordinates must be finite".to_string()));
    }

    let sample = ingest(
        &state,
        payload.unit_id,
        GeoPoint {
            lat: payload.lat,
            lng: payload.lng,
        },
        payload.timestamp.unwrap_or_else(Utc::now),
    )?;
    Ok(Json(sample))
}
