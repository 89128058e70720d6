//! Typed notifications raised by the store and the refresh pipeline.

use tokio::sync::broadcast;

use crate::model::FolderId;

/// Capacity of the broadcast ring. Slow subscribers see `Lagged` and resync.
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    FolderAdded(FolderId),
    FolderUpdated(FolderId),
    WillDeleteFolder(FolderId),
    DidDeleteFolder(FolderId),
    /// Articles in the folder were added, changed, moved or removed.
    ArticlesChanged(FolderId),
    ActivityLogUpdated(FolderId),
    /// The folder needs a username and password before it can be refreshed.
    CredentialsRequired(FolderId),
}

/// Cloneable sender side of the store's event channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StoreEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: StoreEvent) {
        tracing::trace!(?event, "store event");
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(StoreEvent::FolderAdded(3));
        bus.emit(StoreEvent::ArticlesChanged(3));
        assert_eq!(rx.recv().await.unwrap(), StoreEvent::FolderAdded(3));
        assert_eq!(rx.recv().await.unwrap(), StoreEvent::ArticlesChanged(3));
    }

    #[test]
    fn test_emit_without_subscribers() {
        EventBus::new().emit(StoreEvent::DidDeleteFolder(1));
    }
}
