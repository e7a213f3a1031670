use tracing::trace;
use uuid::Uuid;

use courier_types::events::ServerEvent;

use crate::registry::{ConnectionRegistry, GroupId};

/// Fans events out to the connections joined to a group. Delivery goes
/// through each connection's unbounded channel, so events from one logical
/// thread of execution reach every member in the order they were sent.
#[derive(Clone)]
pub struct RoomRouter {
    registry: ConnectionRegistry,
}

impl RoomRouter {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Deliver an event to every current member of a group, the originator
    /// included when it has joined. A closed channel just means the
    /// connection is mid-teardown; the registry cleanup will catch it.
    pub async fn broadcast(&self, group: GroupId, event: ServerEvent) {
        let members = self.registry.members(group).await;
        for (conn_id, tx) in members {
            if tx.send(event.clone()).is_err() {
                trace!("dropping event for closing connection {}", conn_id);
            }
        }
    }

    /// Deliver directly to one connection (history answers, error events,
    /// the not-yet-joined-sender compensation on send).
    pub async fn unicast(&self, conn_id: Uuid, event: ServerEvent) {
        if let Some(tx) = self.registry.sender_of(conn_id).await {
            let _ = tx.send(event);
        }
    }
}
