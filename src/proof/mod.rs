//! Proof-of-delivery token protocol.
//!
//! A token is minted when a sub-order turns nearby, lives for a bounded TTL,
//! and is consumable exactly once. Verification consumes the token under its
//! exclusive map entry and moves the sub-order to delivered; the assignment
//! release rides on that transition.

use chrono::Duration as ChronoDuration;
use rand::RngCore;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::suborder::{ActorRole, SubOrderStatus};
use crate::models::token::ProofToken;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct VerifyOutcome {
    pub accepted: bool,
}

/// Mints (or re-serves) the proof token for a nearby sub-order. While an
/// unconsumed, unexpired token exists it is returned as-is; a fresh issue
/// after expiry invalidates the old value.
pub fn issue(state: &AppState, sub_order_id: Uuid) -> Result<ProofToken, AppError> {
    let sub_order = state
        .sub_orders
        .get(&sub_order_id)
        .ok_or_else(|| AppError::NotFound(format!("sub-order {sub_order_id} not found")))?
        .clone();

    if sub_order.status != SubOrderStatus::Nearby {
        return Err(AppError::InvalidTransition {
            from: sub_order.status,
            to: SubOrderStatus::Nearby,
        });
    }

    let now = state.now();

    if let Some(existing_value) = state.token_by_suborder.get(&sub_order_id) {
        if let Some(existing) = state.tokens.get(existing_value.value()) {
            if existing.is_valid(now) {
                return Ok(existing.clone());
            }
        }
    }

    // Expired or consumed: drop the stale value before minting.
    if let Some((_, old_value)) = state.token_by_suborder.remove(&sub_order_id) {
        state.tokens.remove(&old_value);
    }

    let token = ProofToken {
        value: fresh_value(),
        sub_order_id,
        issued_at: now,
        expires_at: now + ChronoDuration::seconds(state.config.token_ttl_secs as i64),
        consumed: false,
    };
    state.tokens.insert(token.value.clone(), token.clone());
    state
        .token_by_suborder
        .insert(sub_order_id, token.value.clone());

    info!(
        sub_order_id = %sub_order_id,
        expires_at = %token.expires_at,
        "proof token issued"
    );

    Ok(token)
}

/// Accepts iff the token exists, matches the sub-order, is unconsumed, and
/// unexpired. Acceptance consumes the token and delivers the sub-order in the
/// same logical operation; every other outcome is terminal `TokenInvalid`.
pub fn verify(
    state: &AppState,
    token_value: &str,
    sub_order_id: Uuid,
) -> Result<VerifyOutcome, AppError> {
    let now = state.now();

    let consumed = {
        let mut entry = state.tokens.get_mut(token_value).ok_or_else(|| {
            record_verification(state, "unknown");
            AppError::TokenInvalid("unknown token".to_string())
        })?;

        if entry.sub_order_id != sub_order_id {
            record_verification(state, "mismatch");
            return Err(AppError::TokenInvalid(
                "token does not match sub-order".to_string(),
            ));
        }
        if entry.consumed {
            record_verification(state, "consumed");
            return Err(AppError::TokenInvalid("token already consumed".to_string()));
        }
        if entry.is_expired(now) {
            record_verification(state, "expired");
            return Err(AppError::TokenInvalid("token expired".to_string()));
        }

        entry.consumed = true;
        entry.clone()
    };

    match crate::lifecycle::transition(
        state,
        sub_order_id,
        SubOrderStatus::Delivered,
        ActorRole::System,
    ) {
        Ok(_) => {}
        Err(err) => {
            warn!(
                sub_order_id = %sub_order_id,
                error = %err,
                "token consumed but delivery transition failed"
            );
            return Err(err);
        }
    }

    record_verification(state, "accepted");
    info!(
        sub_order_id = %sub_order_id,
        issued_at = %consumed.issued_at,
        "proof of delivery accepted"
    );

    Ok(VerifyOutcome { accepted: true })
}

/// Drops expired tokens so the maps don't accumulate dead values.
pub fn sweep_expired(state: &AppState) {
    let now = state.now();
    let expired: Vec<(String, Uuid)> = state
        .tokens
        .iter()
        .filter(|entry| entry.value().is_expired(now))
        .map(|entry| (entry.key().clone(), entry.value().sub_order_id))
        .collect();

    for (value, sub_order_id) in expired {
        state.tokens.remove(&value);
        state
            .token_by_suborder
            .remove_if(&sub_order_id, |_, current| *current == value);
    }
}

fn record_verification(state: &AppState, outcome: &str) {
    state
        .metrics
        .proof_verifications_total
        .with_label_values(&[outcome])
        .inc();
}

/// 128 bits of entropy, hex-encoded; opaque to clients.
fn fresh_value() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};
    use uuid::Uuid;

    use super::{issue, sweep_expired, verify};
    use crate::config::Config;
    use crate::error::AppError;
    use crate::models::suborder::{DeliveryType, SubOrder, SubOrderStatus};
    use crate::models::unit::GeoPoint;
    use crate::state::AppState;

    fn nearby_suborder(state: &AppState) -> Uuid {
        let id = Uuid::new_v4();
        state.sub_orders.insert(
            id,
            SubOrder {
                id,
                order_id: Uuid::new_v4(),
                shop_id: Uuid::new_v4(),
                delivery_type: DeliveryType::Drone,
                status: SubOrderStatus::Nearby,
                version: 4,
                pickup: GeoPoint { lat: 52.52, lng: 13.405 },
                dropoff: GeoPoint { lat: 52.53, lng: 13.41 },
                assigned_unit: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        );
        id
    }

    #[test]
    fn issue_is_idempotent_while_token_is_valid() {
        let state = AppState::new(Config::default());
        let id = nearby_suborder(&state);

        let first = issue(&state, id).unwrap();
        let second = issue(&state, id).unwrap();
        assert_eq!(first.value, second.value);
        assert_eq!(state.tokens.len(), 1);
    }

    #[test]
    fn issue_refuses_suborders_that_are_not_nearby() {
        let state = AppState::new(Config::default());
        let id = nearby_suborder(&state);
        state.sub_orders.get_mut(&id).unwrap().status = SubOrderStatus::EnRoute;

        let err = issue(&state, id).unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
    }

    #[test]
    fn verify_consumes_exactly_once() {
        let state = AppState::new(Config::default());
        let id = nearby_suborder(&state);
        let token = issue(&state, id).unwrap();

        let outcome = verify(&state, &token.value, id).unwrap();
        assert!(outcome.accepted);
        assert_eq!(
            state.sub_orders.get(&id).unwrap().status,
            SubOrderStatus::Delivered
        );

        let err = verify(&state, &token.value, id).unwrap_err();
        assert!(matches!(err, AppError::TokenInvalid(_)));
    }

    #[test]
    fn verify_rejects_mismatched_suborder() {
        let state = AppState::new(Config::default());
        let id = nearby_suborder(&state);
        let other = nearby_suborder(&state);
        let token = issue(&state, id).unwrap();

        let err = verify(&state, &token.value, other).unwrap_err();
        assert!(matches!(err, AppError::TokenInvalid(_)));
        // The token survives a mismatched attempt.
        assert!(!state.tokens.get(&token.value).unwrap().consumed);
    }

    #[test]
    fn expired_token_is_rejected_and_reissue_mints_a_new_value() {
        let state = AppState::new(Config::default());
        let id = nearby_suborder(&state);
        let token = issue(&state, id).unwrap();

        state.tokens.get_mut(&token.value).unwrap().expires_at =
            Utc::now() - ChronoDuration::seconds(1);

        let err = verify(&state, &token.value, id).unwrap_err();
        assert!(matches!(err, AppError::TokenInvalid(_)));

        let fresh = issue(&state, id).unwrap();
        assert_ne!(fresh.value, token.value);
        assert!(!state.tokens.contains_key(&token.value));
    }

    #[test]
    fn sweep_drops_expired_tokens() {
        let state = AppState::new(Config::default());
        let id = nearby_suborder(&state);
        let token = issue(&state, id).unwrap();
        state.tokens.get_mut(&token.value).unwrap().expires_at =
            Utc::now() - ChronoDuration::seconds(1);

        sweep_expired(&state);
        assert!(state.tokens.is_empty());
        assert!(!state.token_by_suborder.contains_key(&id));
    }
}
