//! Telemetry ingest and proximity transitions.
//!
//! Each sample updates the unit's latest-known position and, for the unit's
//! active sub-order, derives the distance to drop-off. Crossing the en-route
//! or nearby thresholds advances the sub-order one legal step at a time.
//! Samples older than the staleness window flag the feed and suppress
//! automatic transitions until a fresh one arrives; delivery is never
//! auto-confirmed off a stale read.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::geo::haversine_km;
use crate::models::suborder::{SubOrder, SubOrderStatus};
use crate::models::unit::{GeoPoint, TelemetrySample};
use crate::state::{AppState, TelemetryFeed};

pub fn ingest(state: &AppState, unit_id: Uuid, location: GeoPoint, timestamp: chrono::DateTime<Utc>) -> Result<TelemetrySample, AppError> {
    if !state.units.contains_key(&unit_id) {
        return Err(AppError::NotFound(format!("unit {unit_id} not found")));
    }

    let now = state.now();
    let stale_after = ChronoDuration::seconds(state.config.telemetry_stale_secs as i64);
    let is_fresh = now - timestamp < stale_after;

    let active = active_sub_order(state, unit_id);
    let distance_to_dropoff_km = active
        .as_ref()
        .map(|sub_order| haversine_km(&location, &sub_order.dropoff));

    let sample = TelemetrySample {
        unit_id,
        lat: location.lat,
        lng: location.lng,
        timestamp,
        distance_to_dropoff_km,
    };
    state.telemetry.insert(
        unit_id,
        TelemetryFeed {
            last: sample.clone(),
            stale: !is_fresh,
        },
    );

    if let Some(mut unit) = state.units.get_mut(&unit_id) {
        unit.location = location;
        unit.updated_at = now;
    }

    state
        .metrics
        .telemetry_samples_total
        .with_label_values(&[if is_fresh { "fresh" } else { "stale" }])
        .inc();

    if !is_fresh {
        warn!(unit_id = %unit_id, ts = %timestamp, "stale telemetry sample; transitions suppressed");
        return Ok(sample);
    }

    if let Some(sub_order) = active {
        apply_proximity(state, &sub_order, &location, distance_to_dropoff_km);
    }

    Ok(sample)
}

fn apply_proximity(
    state: &AppState,
    sub_order: &SubOrder,
    location: &GeoPoint,
    distance_to_dropoff_km: Option<f64>,
) {
    let nearby = distance_to_dropoff_km
        .is_some_and(|distance| distance <= state.config.nearby_threshold_km);
    let away_from_pickup =
        haversine_km(location, &sub_order.pickup) > state.config.en_route_threshold_km;

    let desired = if nearby {
        Some(SubOrderStatus::Nearby)
    } else if away_from_pickup {
        Some(SubOrderStatus::EnRoute)
    } else {
        None
    };

    let Some(desired) = desired else {
        debug!(sub_order_id = %sub_order.id, "unit still at pickup");
        return;
    };

    match crate::lifecycle::advance_toward(state, sub_order.id, desired) {
        Ok(updated) if updated.status == desired => info!(
            sub_order_id = %sub_order.id,
            status = ?updated.status,
            distance_km = ?distance_to_dropoff_km,
            "proximity transition applied"
        ),
        Ok(_) => {}
        Err(err) => warn!(
            sub_order_id = %sub_order.id,
            error = %err,
            "proximity transition failed"
        ),
    }
}

/// The sub-order this unit is actively delivering, via its live assignment.
fn active_sub_order(state: &AppState, unit_id: Uuid) -> Option<SubOrder> {
    let sub_order_id = state.assignments.iter().find_map(|entry| {
        let assignment = entry.value();
        (assignment.unit_id == unit_id && assignment.is_active())
            .then_some(assignment.sub_order_id)
    })?;
    state
        .sub_orders
        .get(&sub_order_id)
        .map(|entry| entry.value().clone())
        .filter(|sub_order| !sub_order.status.is_terminal())
}

/// Periodic sweep flagging feeds with no recent sample as stale.
pub async fn run_staleness_sweep(state: Arc<AppState>) {
    info!("telemetry staleness sweep started");
    let interval = Duration::from_secs(state.config.telemetry_sweep_secs);
    let stale_after = ChronoDuration::seconds(state.config.telemetry_stale_secs as i64);

    loop {
        sleep(interval).await;

        let now = Utc::now();
        for mut entry in state.telemetry.iter_mut() {
            let feed = entry.value_mut();
            if !feed.stale && now - feed.last.timestamp >= stale_after {
                warn!(unit_id = %feed.last.unit_id, "telemetry feed went stale");
                feed.stale = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};
    use uuid::Uuid;

    use super::ingest;
    use crate::config::Config;
    use crate::engine::assignment::{reserve, UnitSelector};
    use crate::models::suborder::{DeliveryType, SubOrder, SubOrderStatus};
    use crate::models::unit::{DeliveryUnit, GeoPoint, UnitKind, UnitStatus};
    use crate::state::AppState;

    fn pickup() -> GeoPoint {
        GeoPoint { lat: 52.5200, lng: 13.4050 }
    }

    fn dropoff() -> GeoPoint {
        GeoPoint { lat: 52.5600, lng: 13.4450 }
    }

    fn setup() -> (AppState, Uuid, Uuid) {
        let state = AppState::new(Config::default());

        let unit_id = Uuid::new_v4();
        state.units.insert(
            unit_id,
            DeliveryUnit {
                id: unit_id,
                name: "falcon-1".to_string(),
                kind: UnitKind::Drone,
                location: pickup(),
                status: UnitStatus::Idle,
                updated_at: Utc::now(),
            },
        );

        let sub_order_id = Uuid::new_v4();
        state.sub_orders.insert(
            sub_order_id,
            SubOrder {
                id: sub_order_id,
                order_id: Uuid::new_v4(),
                shop_id: Uuid::new_v4(),
                delivery_type: DeliveryType::Drone,
                status: SubOrderStatus::Unassigned,
                version: 0,
                pickup: pickup(),
                dropoff: dropoff(),
                assigned_unit: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        );

        reserve(
            &state,
            sub_order_id,
            UnitSelector {
                kind: Some(UnitKind::Drone),
                radius_km: 10.0,
            },
        )
        .unwrap();

        (state, unit_id, sub_order_id)
    }

    #[test]
    fn moving_away_from_pickup_flips_en_route() {
        let (state, unit_id, sub_order_id) = setup();

        // Roughly a kilometer out from pickup.
        let sample = ingest(
            &state,
            unit_id,
            GeoPoint { lat: 52.5290, lng: 13.4050 },
            Utc::now(),
        )
        .unwrap();
        assert!(sample.distance_to_dropoff_km.unwrap() > state.config.nearby_threshold_km);

        let status = state.sub_orders.get(&sub_order_id).unwrap().status;
        assert_eq!(status, SubOrderStatus::EnRoute);
    }

    #[test]
    fn entering_dropoff_threshold_flips_nearby_and_issues_token() {
        let (state, unit_id, sub_order_id) = setup();

        let sample = ingest(
            &state,
            unit_id,
            GeoPoint { lat: 52.5601, lng: 13.4450 },
            Utc::now(),
        )
        .unwrap();
        assert!(sample.distance_to_dropoff_km.unwrap() <= state.config.nearby_threshold_km);

        let status = state.sub_orders.get(&sub_order_id).unwrap().status;
        assert_eq!(status, SubOrderStatus::Nearby);
        assert!(state.token_by_suborder.contains_key(&sub_order_id));
    }

    #[test]
    fn stale_sample_suppresses_transitions() {
        let (state, unit_id, sub_order_id) = setup();

        ingest(
            &state,
            unit_id,
            GeoPoint { lat: 52.5601, lng: 13.4450 },
            Utc::now() - ChronoDuration::seconds(600),
        )
        .unwrap();

        let status = state.sub_orders.get(&sub_order_id).unwrap().status;
        assert_eq!(status, SubOrderStatus::Assigned);
        assert!(state.telemetry.get(&unit_id).unwrap().stale);

        // A fresh sample clears the flag and resumes transitions.
        ingest(
            &state,
            unit_id,
            GeoPoint { lat: 52.5601, lng: 13.4450 },
            Utc::now(),
        )
        .unwrap();
        assert!(!state.telemetry.get(&unit_id).unwrap().stale);
        let status = state.sub_orders.get(&sub_order_id).unwrap().status;
        assert_eq!(status, SubOrderStatus::Nearby);
    }

    #[test]
    fn unknown_unit_is_rejected() {
        let state = AppState::new(Config::default());
        let err = ingest(&state, Uuid::new_v4(), pickup(), Utc::now()).unwrap_err();
        assert!(matches!(err, crate::error::AppError::NotFound(_)));
    }
}
