//! Event publishers

use field_model::FieldEvent;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::trace;

use crate::traits::EventPublisher;

/// Fans events out to every subscriber of a broadcast channel.
/// Events published while nobody listens are dropped.
pub struct BroadcastPublisher {
    tx: broadcast::Sender<FieldEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FieldEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: FieldEvent) {
        if self.tx.send(event).is_err() {
            trace!("No subscribers, event dropped");
        }
    }
}

/// Keeps every published event, for assertions
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<FieldEvent>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FieldEvent> {
        self.events.lock().clone()
    }

    pub fn of_type(&self, event_type: &str) -> Vec<FieldEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: FieldEvent) {
        self.events.lock().push(event);
    }
}
