use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A reservation binding one delivery unit to one sub-order. At most one
/// active (released_at = None) assignment may exist per unit and per sub-order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Uuid,
    pub sub_order_id: Uuid,
    pub unit_id: Uuid,
    pub reserved_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    /// Reserve attempts it took to obtain this unit, counting the busy ones.
    pub attempts: u32,
}

impl Assignment {
    pub fn is_active(&self) -> bool {
        self.released_at.is_none()
    }
}
