use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Drone,
    Rider,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Idle,
    Reserved,
    Offline,
}

/// A delivery unit in the fleet: a drone or a human rider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryUnit {
    pub id: Uuid,
    pub name: String,
    pub kind: UnitKind,
    pub location: GeoPoint,
    pub status: UnitStatus,
    pub updated_at: DateTime<Utc>,
}

/// Latest location snapshot for a unit, with the distance to the active
/// sub-order's drop-off derived at ingest time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub unit_id: Uuid,
    pub lat: f64,
    pub lng: f64,
    pub timestamp: DateTime<Utc>,
    pub distance_to_dropoff_km: Option<f64>,
}
