use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::assignment::{check_availability, Availability};
use crate::error::AppError;
use crate::models::unit::{DeliveryUnit, GeoPoint, UnitKind, UnitStatus};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/units", post(create_unit).get(list_units))
        .route("/availability", get(availability))
}

#[derive(Deserialize)]
pub struct CreateUnitRequest {
    pub name: String,
    pub kind: UnitKind,
    pub location: GeoPoint,
}

#[derive(Deserialize)]
pub struct AvailabilityParams {
    pub lat: f64,
    pub lng: f64,
    pub radius_km: Option<f64>,
    pub kind: Option<UnitKind>,
}

async fn create_unit(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateUnitRequest>,
) -> Result<Json<DeliveryUnit>, AppError> {
    if payload.name.trim().is_empty() {
        return Err(AppError::Validation("name cannot be empty".to_string()));
    }

    let unit = DeliveryUnit {
        id: Uuid::new_v4(),
        name: payload.name,
        kind: payload.kind,
        location: payload.location,
        status: UnitStatus::Idle,
        updated_at: Utc::now(),
    };

    state.units.insert(unit.id, unit.clone());
    Ok(Json(unit))
}

async fn list_units(State(state): State<Arc<AppState>>) -> Json<Vec<DeliveryUnit>> {
    let units = state
        .units
        .iter()
        .map(|entry| entry.value().clone())
        .collect();
    Json(units)
}

async fn availability(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AvailabilityParams>,
) -> Json<Availability> {
    let radius_km = params.radius_km.unwrap_or(state.config.default_radius_km);
    let location = GeoPoint {
        lat: params.lat,
        lng: params.lng,
    };
    Json(check_availability(&state, location, radius_km, params.kind))
}
