use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::lifecycle;
use crate::models::suborder::{ActorRole, DeliveryType, SubOrder, SubOrderStatus};
use crate::models::unit::GeoPoint;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/suborders", post(create_suborder))
        .route("/suborders/:id", get(get_suborder))
        .route("/suborders/status", patch(update_status))
}

/// The "ready for pickup" input from the checkout side: registers a sub-order
/// with the delivery core.
#[derive(Deserialize)]
pub struct CreateSubOrderRequest {
    pub order_id: Uuid,
    pub shop_id: Uuid,
    pub delivery_type: DeliveryType,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub sub_order_id: Uuid,
    pub status: SubOrderStatus,
    #[serde(default = "default_actor")]
    pub actor: ActorRole,
}

fn default_actor() -> ActorRole {
    ActorRole::System
}

async fn create_suborder(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateSubOrderRequest>,
) -> Result<Json<SubOrder>, AppError> {
    let now = Utc::now();
    let sub_order = SubOrder {
        id: Uuid::new_v4(),
        order_id: payload.order_id,
        shop_id: payload.shop_id,
        delivery_type: payload.delivery_type,
        status: SubOrderStatus::Unassigned,
        version: 0,
        pickup: payload.pickup,
        dropoff: payload.dropoff,
        assigned_unit: None,
        created_at: now,
        updated_at: now,
    };

    state.sub_orders.insert(sub_order.id, sub_order.clone());
    Ok(Json(sub_order))
}

async fn get_suborder(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SubOrder>, AppError> {
    let sub_order = state
        .sub_orders
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("sub-order {id} not found")))?;

    Ok(Json(sub_order.value().clone()))
}

async fn update_status(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<SubOrder>, AppError> {
    let sub_order = lifecycle::transition(
        &state,
        payload.sub_order_id,
        payload.status,
        payload.actor,
    )?;
    Ok(Json(sub_order))
}
