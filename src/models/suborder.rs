use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::unit::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryType {
    Regular,
    Drone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubOrderStatus {
    Unassigned,
    Assigned,
    PickedUp,
    EnRoute,
    Nearby,
    Delivered,
    Cancelled,
}

impl SubOrderStatus {
    /// The single legal successor on the delivery path, if any.
    pub fn successor(self) -> Option<SubOrderStatus> {
        match self {
            SubOrderStatus::Unassigned => Some(SubOrderStatus::Assigned),
            SubOrderStatus::Assigned => Some(SubOrderStatus::PickedUp),
            SubOrderStatus::PickedUp => Some(SubOrderStatus::EnRoute),
            SubOrderStatus::EnRoute => Some(SubOrderStatus::Nearby),
            SubOrderStatus::Nearby => Some(SubOrderStatus::Delivered),
            SubOrderStatus::Delivered | SubOrderStatus::Cancelled => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SubOrderStatus::Delivered | SubOrderStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Customer,
    Shop,
    Admin,
    System,
}

/// The portion of a customer order fulfilled by a single shop. Carries its own
/// delivery lifecycle; mutated only through the lifecycle module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubOrder {
    pub id: Uuid,
    pub order_id: Uuid,
    pub shop_id: Uuid,
    pub delivery_type: DeliveryType,
    pub status: SubOrderStatus,
    /// Bumped on every accepted transition; conditional writes key on it.
    pub version: u64,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub assigned_unit: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
