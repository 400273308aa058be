use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::LedgerEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for committed booking events, one channel per item.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<LedgerEvent>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to events for an item. Creates the channel if needed.
    pub fn subscribe(&self, item_id: &str) -> broadcast::Receiver<LedgerEvent> {
        let sender = self
            .channels
            .entry(item_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, item_id: &str, event: &LedgerEvent) {
        if let Some(sender) = self.channels.get(item_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop channels whose last subscriber has gone away.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
