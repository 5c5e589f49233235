use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::Event;
use crate::paths::{event_changes, Change};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for LISTEN/NOTIFY per channel (`slots_{floor}`, `user_{uid}`).
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Change>>,
    seq: AtomicU64,
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
            seq: AtomicU64::new(1),
        }
    }

    /// Subscribe to a channel. Creates the channel if needed.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Change> {
        let sender = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a change. No-op if nobody is listening.
    pub fn send(&self, channel: &str, mut change: Change) {
        change.seq = self.seq.fetch_add(1, Ordering::Relaxed);
        if let Some(sender) = self.channels.get(channel) {
            let _ = sender.send(change);
        }
    }

    /// Fan an applied event out to every channel it touches.
    pub fn publish(&self, event: &Event) {
        for (channel, change) in event_changes(event) {
            self.send(&channel, change);
        }
    }

    /// Drop channels whose receivers have all gone away.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
