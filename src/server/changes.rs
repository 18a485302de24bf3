use serde::{Serialize, Deserialize};
use tokio::sync::broadcast;

/// Collections a change event can refer to. Mirrors the tables that carry
/// user-visible state; auth/session tables never publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    Users,
    Connections,
    Conversations,
    Messages,
    Groups,
    Invitations,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub collection: Collection,
    pub document_id: String,
}

/// In-process stand-in for the document store's snapshot push: every mutating
/// service call publishes the touched (collection, id); subscribers reload
/// from the database wholesale rather than applying the event incrementally.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1000);
        Self { tx }
    }

    pub fn publish(&self, collection: Collection, document_id: &str) {
        let event = ChangeEvent { collection, document_id: document_id.to_string() };
        // No receivers is fine; the feed is lossy by contract
        if self.tx.send(event).is_err() {
            log::debug!("[FEED] No subscribers for {:?} change", collection);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}
