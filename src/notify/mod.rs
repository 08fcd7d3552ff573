use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::models::suborder::{ActorRole, SubOrderStatus};

/// Emitted on every accepted sub-order transition and fanned out to WebSocket
/// subscribers (shop, customer, admin dashboards).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub sub_order_id: Uuid,
    pub from: SubOrderStatus,
    pub to: SubOrderStatus,
    pub actor: ActorRole,
    pub at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Dispatcher {
    tx: broadcast::Sender<StatusEvent>,
}

impl Dispatcher {
    pub fn new(buffer: usize) -> Self {
        let (tx, _unused_rx) = broadcast::channel(buffer);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    /// Send failures just mean nobody is listening right now.
    pub fn status_changed(&self, event: StatusEvent) {
        debug!(
            sub_order_id = %event.sub_order_id,
            from = ?event.from,
            to = ?event.to,
            actor = ?event.actor,
            "status changed"
        );
        let _ = self.tx.send(event);
    }
}
