use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Single-use, time-limited proof-of-delivery code. `consumed` moves
/// false -> true exactly once; a consumed or expired token never verifies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofToken {
    pub value: String,
    pub sub_order_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
}

impl ProofToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        !self.consumed && !self.is_expired(now)
    }
}
