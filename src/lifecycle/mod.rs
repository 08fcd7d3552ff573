//! Sub-order state machine.
//!
//! `unassigned -> assigned -> picked_up -> en_route -> nearby -> delivered`,
//! with `cancelled` reachable from any non-terminal state. All writes go
//! through [`transition`], which mutates the sub-order under its exclusive
//! map entry so two racing requests resolve deterministically: the loser
//! observes the already-applied status and gets `Conflict`.

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::suborder::{ActorRole, DeliveryType, SubOrder, SubOrderStatus};
use crate::notify::StatusEvent;
use crate::state::{AppState, FailedRelease};

pub fn transition(
    state: &AppState,
    sub_order_id: Uuid,
    target: SubOrderStatus,
    actor: ActorRole,
) -> Result<SubOrder, AppError> {
    let (snapshot, from) = {
        let mut entry = state
            .sub_orders
            .get_mut(&sub_order_id)
            .ok_or_else(|| AppError::NotFound(format!("sub-order {sub_order_id} not found")))?;

        let from = entry.status;

        if from == target {
            // A concurrent request already applied this transition.
            return Err(AppError::Conflict(format!(
                "sub-order {sub_order_id} is already {target:?}"
            )));
        }

        if !is_legal(&entry, target, actor) {
            return Err(AppError::InvalidTransition { from, to: target });
        }

        entry.status = target;
        entry.version += 1;
        entry.updated_at = state.now();
        (entry.clone(), from)
    };

    state
        .metrics
        .status_transitions_total
        .with_label_values(&[status_label(target)])
        .inc();

    state.dispatcher.status_changed(StatusEvent {
        sub_order_id,
        from,
        to: target,
        actor,
        at: snapshot.updated_at,
    });

    match target {
        SubOrderStatus::Nearby => {
            if let Err(err) = crate::proof::issue(state, sub_order_id) {
                warn!(sub_order_id = %sub_order_id, error = %err, "proof issue failed");
            }
        }
        SubOrderStatus::Delivered => release_active(state, sub_order_id),
        SubOrderStatus::Cancelled => cancel_side_effects(state, sub_order_id),
        _ => {}
    }

    info!(
        sub_order_id = %sub_order_id,
        from = ?from,
        to = ?target,
        version = snapshot.version,
        "sub-order transitioned"
    );

    Ok(snapshot)
}

/// Walks the sub-order toward `desired` one legal step at a time. Used by the
/// telemetry tracker so automatic transitions never skip states.
pub fn advance_toward(
    state: &AppState,
    sub_order_id: Uuid,
    desired: SubOrderStatus,
) -> Result<SubOrder, AppError> {
    loop {
        let snapshot = state
            .sub_orders
            .get(&sub_order_id)
            .ok_or_else(|| AppError::NotFound(format!("sub-order {sub_order_id} not found")))?
            .clone();
        let current = snapshot.status;

        // Already at or past the desired state, or no longer advancing at all.
        if path_index(current).is_none_or(|index| Some(index) >= path_index(desired)) {
            return Ok(snapshot);
        }

        let next = current
            .successor()
            .ok_or(AppError::InvalidTransition {
                from: current,
                to: desired,
            })?;

        let snapshot = match transition(state, sub_order_id, next, ActorRole::System) {
            Ok(snapshot) => snapshot,
            // Someone else advanced it in the meantime; re-read and continue.
            Err(AppError::Conflict(_)) => continue,
            Err(err) => return Err(err),
        };

        if snapshot.status == desired {
            return Ok(snapshot);
        }
    }
}

/// Position on the happy path; terminal and cancelled states have none.
fn path_index(status: SubOrderStatus) -> Option<u8> {
    match status {
        SubOrderStatus::Unassigned => Some(0),
        SubOrderStatus::Assigned => Some(1),
        SubOrderStatus::PickedUp => Some(2),
        SubOrderStatus::EnRoute => Some(3),
        SubOrderStatus::Nearby => Some(4),
        SubOrderStatus::Delivered | SubOrderStatus::Cancelled => None,
    }
}

fn is_legal(sub_order: &SubOrder, target: SubOrderStatus, actor: ActorRole) -> bool {
    let from = sub_order.status;

    if target == SubOrderStatus::Cancelled {
        return !from.is_terminal();
    }

    // Administrative shortcut: a non-drone sub-order may be marked delivered
    // directly, without passing through proof verification.
    if target == SubOrderStatus::Delivered
        && actor == ActorRole::Admin
        && sub_order.delivery_type != DeliveryType::Drone
        && !from.is_terminal()
    {
        return true;
    }

    from.successor() == Some(target)
}

fn release_active(state: &AppState, sub_order_id: Uuid) {
    let Some((_, assignment_id)) = state.active_assignment.remove(&sub_order_id) else {
        return;
    };

    if let Err(err) = crate::engine::assignment::release(state, assignment_id) {
        warn!(
            assignment_id = %assignment_id,
            error = %err,
            "release failed; queued for cleanup sweep"
        );
        state.failed_releases.insert(
            assignment_id,
            FailedRelease {
                assignment_id,
                attempts: 0,
            },
        );
    }
}

/// Cancellation releases the unit, forgets any parked reservation, and
/// invalidates any outstanding proof token as one logical operation.
fn cancel_side_effects(state: &AppState, sub_order_id: Uuid) {
    state.pending_reservations.remove(&sub_order_id);
    release_active(state, sub_order_id);

    if let Some((_, value)) = state.token_by_suborder.remove(&sub_order_id) {
        state.tokens.remove(&value);
        info!(sub_order_id = %sub_order_id, "proof token invalidated by cancellation");
    }
}

fn status_label(status: SubOrderStatus) -> &'static str {
    match status {
        SubOrderStatus::Unassigned => "unassigned",
        SubOrderStatus::Assigned => "assigned",
        SubOrderStatus::PickedUp => "picked_up",
        SubOrderStatus::EnRoute => "en_route",
        SubOrderStatus::Nearby => "nearby",
        SubOrderStatus::Delivered => "delivered",
        SubOrderStatus::Cancelled => "cancelled",
    }
}
