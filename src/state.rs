use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::Config;
use crate::models::assignment::Assignment;
use crate::models::suborder::SubOrder;
use crate::models::token::ProofToken;
use crate::models::unit::{DeliveryUnit, TelemetrySample, UnitKind};
use crate::notify::Dispatcher;
use crate::observability::metrics::Metrics;

/// A reservation that found no idle unit and is parked for the retry loop.
#[derive(Debug, Clone)]
pub struct PendingReservation {
    pub sub_order_id: Uuid,
    pub kind: Option<UnitKind>,
    pub radius_km: f64,
    pub attempts: u32,
    pub requested_at: DateTime<Utc>,
}

/// An assignment release that failed during cancellation and is owed a retry
/// by the housekeeping sweep.
#[derive(Debug, Clone)]
pub struct FailedRelease {
    pub assignment_id: Uuid,
    pub attempts: u32,
}

/// Latest telemetry per unit plus the staleness flag that gates automatic
/// transitions.
#[derive(Debug, Clone)]
pub struct TelemetryFeed {
    pub last: TelemetrySample,
    pub stale: bool,
}

pub struct AppState {
    pub config: Config,
    pub sub_orders: DashMap<Uuid, SubOrder>,
    pub units: DashMap<Uuid, DeliveryUnit>,
    pub assignments: DashMap<Uuid, Assignment>,
    /// sub_order_id -> assignment_id, present only while the assignment is
    /// active. The entry is the linearization point for "one active
    /// assignment per sub-order".
    pub active_assignment: DashMap<Uuid, Uuid>,
    pub pending_reservations: DashMap<Uuid, PendingReservation>,
    pub failed_releases: DashMap<Uuid, FailedRelease>,
    /// token value -> token
    pub tokens: DashMap<String, ProofToken>,
    /// sub_order_id -> current token value
    pub token_by_suborder: DashMap<Uuid, String>,
    pub telemetry: DashMap<Uuid, TelemetryFeed>,
    pub dispatcher: Dispatcher,
    /// Woken whenever a unit returns to the idle pool.
    pub availability_changed: Notify,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let dispatcher = Dispatcher::new(config.event_buffer_size);

        Self {
            config,
            sub_orders: DashMap::new(),
            units: DashMap::new(),
            assignments: DashMap::new(),
            active_assignment: DashMap::new(),
            pending_reservations: DashMap::new(),
            failed_releases: DashMap::new(),
            tokens: DashMap::new(),
            token_by_suborder: DashMap::new(),
            telemetry: DashMap::new(),
            dispatcher,
            availability_changed: Notify::new(),
            metrics: Metrics::new(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
