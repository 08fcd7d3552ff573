use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::token::ProofToken;
use crate::proof::{issue, verify, VerifyOutcome};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/proof/issue", post(issue_token))
        .route("/proof/verify", post(verify_token))
}

#[derive(Deserialize)]
pub struct IssueRequest {
    pub sub_order_id: Uuid,
}

#[derive(Deserialize)]
pub struct VerifyRequest {
    pub token_value: String,
    pub sub_order_id: Uuid,
}

async fn issue_token(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<IssueRequest>,
) -> Result<Json<ProofToken>, AppError> {
    let token = issue(&state, payload.sub_order_id)?;
    Ok(Json(token))
}

async fn verify_token(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<VerifyRequest>,
) -> Result<Json<VerifyOutcome>, AppError> {
    if payload.token_value.trim().is_empty() {
        return Err(AppError::Validation("token_value cannot be empty".to_string()));
    }
    let outcome = verify(&state, &payload.token_value, payload.sub_order_id)?;
    Ok(Json(outcome))
}
