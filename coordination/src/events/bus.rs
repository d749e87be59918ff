//! Broadcast bus for [`RaceEvent`]s.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::types::RaceEvent;

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Subscriber lagged; {0} events skipped")]
    Lagged(u64),

    #[error("Channel closed")]
    ChannelClosed,
}

pub type EventBusResult<T> = Result<T, EventBusError>;

pub type SharedEventBus = Arc<EventBus>;

pub struct EventBus {
    sender: broadcast::Sender<RaceEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Broadcast to current subscribers. Having none is not an error.
    pub fn publish(&self, event: RaceEvent) {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(count) => debug!(event_type, receivers = count, "Event published"),
            Err(_) => debug!(event_type, "Event published (no receivers)"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RaceEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver {
            receiver: self.subscribe(),
            filter,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Selective subscription by race and/or event type.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub race_id: Option<Uuid>,
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn race(mut self, race_id: Uuid) -> Self {
        self.race_id = Some(race_id);
        self
    }

    pub fn types(mut self, event_types: Vec<&str>) -> Self {
        self.event_types = Some(event_types.into_iter().map(String::from).collect());
        self
    }

    pub fn matches(&self, event: &RaceEvent) -> bool {
        if let Some(wanted) = self.race_id {
            if event.race_id() != Some(wanted) {
                return false;
            }
        }
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }
        true
    }
}

pub struct FilteredReceiver {
    receiver: broadcast::Receiver<RaceEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    /// Next matching event.
    pub async fn recv(&mut self) -> EventBusResult<RaceEvent> {
        loop {
            let event = self.receiver.recv().await.map_err(|e| match e {
                broadcast::error::RecvError::Lagged(n) => EventBusError::Lagged(n),
                broadcast::error::RecvError::Closed => EventBusError::ChannelClosed,
            })?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}
