//! Drone/rider assignment service.
//!
//! `reserve` flips a unit idle -> reserved under the unit's exclusive map
//! entry, so concurrent reservations racing for the same pool produce exactly
//! one winner per unit. Duplicate reserves for one sub-order are fenced by the
//! `active_assignment` index entry. Busy pools park a `PendingReservation`
//! that the retry loop re-attempts when a release wakes it (or on the poll
//! interval as fallback).

use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::geo::haversine_km;
use crate::models::assignment::Assignment;
use crate::models::suborder::{ActorRole, SubOrderStatus};
use crate::models::unit::{GeoPoint, UnitKind, UnitStatus};
use crate::state::{AppState, PendingReservation};

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct Availability {
    pub available: bool,
    pub count: usize,
}

/// Which units a reservation is willing to take.
#[derive(Debug, Clone, Copy)]
pub struct UnitSelector {
    pub kind: Option<UnitKind>,
    pub radius_km: f64,
}

/// Read-only count of idle units around a pickup point; reserves nothing.
pub fn check_availability(
    state: &AppState,
    location: GeoPoint,
    radius_km: f64,
    kind: Option<UnitKind>,
) -> Availability {
    let count = state
        .units
        .iter()
        .filter(|entry| {
            let unit = entry.value();
            unit.status == UnitStatus::Idle
                && kind.is_none_or(|k| unit.kind == k)
                && haversine_km(&unit.location, &location) <= radius_km
        })
        .count();

    Availability {
        available: count > 0,
        count,
    }
}

pub fn reserve(
    state: &AppState,
    sub_order_id: Uuid,
    selector: UnitSelector,
) -> Result<Assignment, AppError> {
    let sub_order = state
        .sub_orders
        .get(&sub_order_id)
        .ok_or_else(|| AppError::NotFound(format!("sub-order {sub_order_id} not found")))?
        .clone();

    if sub_order.status.is_terminal() {
        return Err(AppError::Validation(format!(
            "sub-order {sub_order_id} is {:?}",
            sub_order.status
        )));
    }

    // Claim the per-sub-order slot first; exactly one concurrent reserve for
    // this sub-order gets past here.
    let assignment_id = Uuid::new_v4();
    match state.active_assignment.entry(sub_order_id) {
        Entry::Occupied(_) => return Err(AppError::AlreadyAssigned(sub_order_id)),
        Entry::Vacant(slot) => {
            slot.insert(assignment_id);
        }
    }

    let attempts = state
        .pending_reservations
        .get(&sub_order_id)
        .map(|pending| pending.attempts)
        .unwrap_or(0)
        + 1;

    let unit_id = match claim_nearest_idle(state, sub_order.pickup, selector) {
        Some(unit_id) => unit_id,
        None => {
            state.active_assignment.remove(&sub_order_id);
            state.pending_reservations.insert(
                sub_order_id,
                PendingReservation {
                    sub_order_id,
                    kind: selector.kind,
                    radius_km: selector.radius_km,
                    attempts,
                    requested_at: Utc::now(),
                },
            );
            state.metrics.pending_reservations.set(state.pending_reservations.len() as i64);
            state
                .metrics
                .reservations_total
                .with_label_values(&["busy"])
                .inc();
            return Err(AppError::Busy);
        }
    };

    let assignment = Assignment {
        id: assignment_id,
        sub_order_id,
        unit_id,
        reserved_at: Utc::now(),
        released_at: None,
        attempts,
    };
    state.assignments.insert(assignment.id, assignment.clone());
    state.pending_reservations.remove(&sub_order_id);
    state.metrics.pending_reservations.set(state.pending_reservations.len() as i64);

    if let Some(mut entry) = state.sub_orders.get_mut(&sub_order_id) {
        entry.assigned_unit = Some(unit_id);
    }

    match crate::lifecycle::transition(state, sub_order_id, SubOrderStatus::Assigned, ActorRole::System) {
        Ok(_) => {}
        // Already assigned by an earlier lifecycle step; the reservation stands.
        Err(AppError::Conflict(_)) => {}
        Err(err) => {
            warn!(sub_order_id = %sub_order_id, error = %err, "rolling back reservation");
            rollback(state, &assignment);
            return Err(err);
        }
    }

    state
        .metrics
        .reservations_total
        .with_label_values(&["reserved"])
        .inc();
    info!(
        sub_order_id = %sub_order_id,
        unit_id = %unit_id,
        attempts,
        "delivery unit reserved"
    );

    Ok(assignment)
}

/// Idempotent: releasing an already-released assignment is a no-op.
pub fn release(state: &AppState, assignment_id: Uuid) -> Result<Assignment, AppError> {
    let (snapshot, was_active) = {
        let mut entry = state
            .assignments
            .get_mut(&assignment_id)
            .ok_or_else(|| AppError::NotFound(format!("assignment {assignment_id} not found")))?;

        if entry.released_at.is_some() {
            (entry.clone(), false)
        } else {
            entry.released_at = Some(Utc::now());
            (entry.clone(), true)
        }
    };

    if !was_active {
        return Ok(snapshot);
    }

    if let Some(mut unit) = state.units.get_mut(&snapshot.unit_id) {
        if unit.status == UnitStatus::Reserved {
            unit.status = UnitStatus::Idle;
            unit.updated_at = Utc::now();
        }
    }

    // Remove the index entry only if it still points at this assignment; the
    // sub-order may already hold a newer reservation.
    state
        .active_assignment
        .remove_if(&snapshot.sub_order_id, |_, current| *current == assignment_id);

    state
        .metrics
        .reservations_total
        .with_label_values(&["released"])
        .inc();
    info!(
        assignment_id = %assignment_id,
        unit_id = %snapshot.unit_id,
        "delivery unit released"
    );

    // Wake the retry loop: the pool just grew.
    state.availability_changed.notify_waiters();

    Ok(snapshot)
}

/// Candidates are ordered nearest-first; the flip to reserved happens under
/// the unit's entry lock, re-checking idleness, so a unit can be claimed once.
fn claim_nearest_idle(state: &AppState, pickup: GeoPoint, selector: UnitSelector) -> Option<Uuid> {
    let mut candidates: Vec<(f64, Uuid)> = state
        .units
        .iter()
        .filter_map(|entry| {
            let unit = entry.value();
            let eligible = unit.status == UnitStatus::Idle
                && selector.kind.is_none_or(|k| unit.kind == k);
            if !eligible {
                return None;
            }
            let distance = haversine_km(&unit.location, &pickup);
            (distance <= selector.radius_km).then_some((distance, unit.id))
        })
        .collect();
    candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

    for (_, unit_id) in candidates {
        if let Some(mut unit) = state.units.get_mut(&unit_id) {
            if unit.status == UnitStatus::Idle {
                unit.status = UnitStatus::Reserved;
                unit.updated_at = Utc::now();
                return Some(unit_id);
            }
        }
    }

    None
}

fn rollback(state: &AppState, assignment: &Assignment) {
    if let Some(mut unit) = state.units.get_mut(&assignment.unit_id) {
        if unit.status == UnitStatus::Reserved {
            unit.status = UnitStatus::Idle;
        }
    }
    state
        .active_assignment
        .remove_if(&assignment.sub_order_id, |_, current| *current == assignment.id);
    state.assignments.remove(&assignment.id);
}

/// Selector used when re-attempting a parked reservation.
fn selector_for(pending: &PendingReservation) -> UnitSelector {
    UnitSelector {
        kind: pending.kind,
        radius_km: pending.radius_km,
    }
}

/// Background loop: re-attempts parked reservations whenever a unit returns
/// to the pool, with the poll interval as fallback transport.
pub async fn run_reservation_retry(state: Arc<AppState>) {
    info!("reservation retry loop started");
    let poll = Duration::from_secs(state.config.availability_poll_secs);

    loop {
        tokio::select! {
            _ = state.availability_changed.notified() => {}
            _ = sleep(poll) => {}
        }

        let pending: Vec<PendingReservation> = state
            .pending_reservations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for reservation in pending {
            match reserve(&state, reservation.sub_order_id, selector_for(&reservation)) {
                Ok(assignment) => info!(
                    sub_order_id = %reservation.sub_order_id,
                    unit_id = %assignment.unit_id,
                    attempts = assignment.attempts,
                    "parked reservation fulfilled"
                ),
                Err(AppError::Busy) => {}
                Err(AppError::AlreadyAssigned(_)) => {
                    state.pending_reservations.remove(&reservation.sub_order_id);
                }
                Err(err) => {
                    warn!(
                        sub_order_id = %reservation.sub_order_id,
                        error = %err,
                        "dropping unfulfillable reservation"
                    );
                    state.pending_reservations.remove(&reservation.sub_order_id);
                }
            }
        }
        state.metrics.pending_reservations.set(state.pending_reservations.len() as i64);
    }
}

/// Housekeeping: retry releases that failed during cancellation and drop
/// expired proof tokens.
pub async fn run_housekeeping(state: Arc<AppState>) {
    info!("housekeeping sweep started");
    let interval = Duration::from_secs(state.config.availability_poll_secs);

    loop {
        sleep(interval).await;

        let owed: Vec<Uuid> = state
            .failed_releases
            .iter()
            .map(|entry| entry.value().assignment_id)
            .collect();
        for assignment_id in owed {
            match release(&state, assignment_id) {
                Ok(_) => {
                    state.failed_releases.remove(&assignment_id);
                }
                Err(err) => {
                    warn!(assignment_id = %assignment_id, error = %err, "release retry failed");
                    if let Some(mut entry) = state.failed_releases.get_mut(&assignment_id) {
                        entry.attempts += 1;
                    }
                }
            }
        }

        crate::proof::sweep_expired(&state);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::{check_availability, release, reserve, UnitSelector};
    use crate::config::Config;
    use crate::error::AppError;
    use crate::models::suborder::{DeliveryType, SubOrder, SubOrderStatus};
    use crate::models::unit::{DeliveryUnit, GeoPoint, UnitKind, UnitStatus};
    use crate::state::AppState;

    fn base_point() -> GeoPoint {
        GeoPoint { lat: 52.52, lng: 13.405 }
    }

    fn add_drone(state: &AppState) -> Uuid {
        let id = Uuid::new_v4();
        state.units.insert(
            id,
            DeliveryUnit {
                id,
                name: "drone".to_string(),
                kind: UnitKind::Drone,
                location: base_point(),
                status: UnitStatus::Idle,
                updated_at: Utc::now(),
            },
        );
        id
    }

    fn add_suborder(state: &AppState) -> Uuid {
        let id = Uuid::new_v4();
        state.sub_orders.insert(
            id,
            SubOrder {
                id,
                order_id: Uuid::new_v4(),
                shop_id: Uuid::new_v4(),
                delivery_type: DeliveryType::Drone,
                status: SubOrderStatus::Unassigned,
                version: 0,
                pickup: base_point(),
                dropoff: GeoPoint { lat: 52.53, lng: 13.41 },
                assigned_unit: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        );
        id
    }

    fn selector() -> UnitSelector {
        UnitSelector {
            kind: Some(UnitKind::Drone),
            radius_km: 10.0,
        }
    }

    #[test]
    fn reserve_assigns_nearest_idle_unit() {
        let state = AppState::new(Config::default());
        let unit_id = add_drone(&state);
        let sub_order_id = add_suborder(&state);

        let assignment = reserve(&state, sub_order_id, selector()).unwrap();
        assert_eq!(assignment.unit_id, unit_id);
        assert!(assignment.is_active());

        let sub_order = state.sub_orders.get(&sub_order_id).unwrap().value().clone();
        assert_eq!(sub_order.status, SubOrderStatus::Assigned);
        assert_eq!(sub_order.assigned_unit, Some(unit_id));

        let unit = state.units.get(&unit_id).unwrap().value().clone();
        assert_eq!(unit.status, UnitStatus::Reserved);
    }

    #[test]
    fn duplicate_reserve_for_same_suborder_is_rejected() {
        let state = AppState::new(Config::default());
        add_drone(&state);
        add_drone(&state);
        let sub_order_id = add_suborder(&state);

        reserve(&state, sub_order_id, selector()).unwrap();
        let err = reserve(&state, sub_order_id, selector()).unwrap_err();
        assert!(matches!(err, AppError::AlreadyAssigned(_)));
        assert_eq!(state.assignments.len(), 1);
    }

    #[test]
    fn empty_pool_returns_busy_and_parks_the_reservation() {
        let state = AppState::new(Config::default());
        let sub_order_id = add_suborder(&state);

        let err = reserve(&state, sub_order_id, selector()).unwrap_err();
        assert!(matches!(err, AppError::Busy));
        assert!(state.pending_reservations.contains_key(&sub_order_id));

        // A second explicit retry is a fresh attempt, still busy.
        let err = reserve(&state, sub_order_id, selector()).unwrap_err();
        assert!(matches!(err, AppError::Busy));
        assert_eq!(
            state.pending_reservations.get(&sub_order_id).unwrap().attempts,
            2
        );
    }

    #[tokio::test]
    async fn concurrent_reserves_for_pool_of_one_have_one_winner() {
        let state = std::sync::Arc::new(AppState::new(Config::default()));
        add_drone(&state);
        let first = add_suborder(&state);
        let second = add_suborder(&state);

        let state_a = state.clone();
        let state_b = state.clone();
        let a = tokio::task::spawn_blocking(move || reserve(&state_a, first, selector()));
        let b = tokio::task::spawn_blocking(move || reserve(&state_b, second, selector()));
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        let wins = [&a, &b].iter().filter(|r| r.is_ok()).count();
        let busy = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(AppError::Busy)))
            .count();
        assert_eq!(wins, 1);
        assert_eq!(busy, 1);
    }

    #[test]
    fn release_is_idempotent_and_returns_unit_to_pool() {
        let state = AppState::new(Config::default());
        let unit_id = add_drone(&state);
        let sub_order_id = add_suborder(&state);

        let assignment = reserve(&state, sub_order_id, selector()).unwrap();
        let first = release(&state, assignment.id).unwrap();
        assert!(first.released_at.is_some());

        let second = release(&state, assignment.id).unwrap();
        assert_eq!(first.released_at, second.released_at);

        let unit = state.units.get(&unit_id).unwrap().value().clone();
        assert_eq!(unit.status, UnitStatus::Idle);
    }

    #[test]
    fn availability_counts_idle_units_in_radius_without_reserving() {
        let state = AppState::new(Config::default());
        add_drone(&state);
        let far = Uuid::new_v4();
        state.units.insert(
            far,
            DeliveryUnit {
                id: far,
                name: "far-drone".to_string(),
                kind: UnitKind::Drone,
                location: GeoPoint { lat: 48.85, lng: 2.35 },
                status: UnitStatus::Idle,
                updated_at: Utc::now(),
            },
        );

        let availability =
            check_availability(&state, base_point(), 10.0, Some(UnitKind::Drone));
        assert!(availability.available);
        assert_eq!(availability.count, 1);

        // Nothing got reserved by looking.
        assert!(state
            .units
            .iter()
            .all(|entry| entry.value().status == UnitStatus::Idle));
    }
}
