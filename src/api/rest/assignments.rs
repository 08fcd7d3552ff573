use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::assignment::{release, reserve, UnitSelector};
use crate::error::AppError;
use crate::models::assignment::Assignment;
use crate::models::unit::UnitKind;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/assignments", get(list_assignments))
        .route("/assignments/reserve", post(reserve_unit))
        .route("/assignments/release", post(release_unit))
}

#[derive(Deserialize)]
pub struct ReserveRequest {
    pub sub_order_id: Uuid,
    pub kind: Option<UnitKind>,
    pub radius_km: Option<f64>,
}

#[derive(Deserialize)]
pub struct ReleaseRequest {
    pub assignment_id: Uuid,
}

async fn reserve_unit(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ReserveRequest>,
) -> Result<Json<Assignment>, AppError> {
    let selector = UnitSelector {
        kind: payload.kind,
        radius_km: payload.radius_km.unwrap_or(state.config.default_radius_km),
    };
    let assignment = reserve(&state, payload.sub_order_id, selector)?;
    Ok(Json(assignment))
}

async fn release_unit(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ReleaseRequest>,
) -> Result<Json<Assignment>, AppError> {
    let assignment = release(&state, payload.assignment_id)?;
    Ok(Json(assignment))
}

async fn list_assignments(State(state): State<Arc<AppState>>) -> Json<Vec<Assignment>> {
    let assignments = state
        .assignments
        .iter()
        .map(|entry| entry.value().clone())
        .collect();

    Json(assignments)
}
