use std::sync::Arc;

use tracing::warn;

use crate::event::ExtractedEvent;
use crate::export::health::HealthMetrics;
use crate::source::Message;

/// Bounded, reusable buffer of decoded events and the messages they came from.
pub struct Batch<M> {
    max_size: usize,
    messages: Vec<M>,
    events: Vec<ExtractedEvent>,
    health: Option<Arc<HealthMetrics>>,
}

impl<M: Message> Batch<M> {
    pub fn new(max_size: usize, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            max_size,
            messages: Vec::with_capacity(max_size),
            events: Vec::with_capacity(max_size),
            health,
        }
    }

    /// Decodes and buffers a message. Returns false if the payload could not
    /// be decoded, in which case the message is dropped.
    ///
    /// Callers flush a full batch before adding to it.
    pub fn add(&mut self, message: M) -> bool {
        debug_assert!(!self.is_full(), "add called on a full batch");

        match ExtractedEvent::decode(message.payload()) {
            Ok(event) => {
                self.events.push(event);
                self.messages.push(message);
                true
            }
            Err(e) => {
                warn!(offset = message.offset(), error = %e, "dropping undecodable message");
                if let Some(health) = &self.health {
                    health.messages_dropped.inc();
                }
                false
            }
        }
    }

    pub fn is_full(&self) -> bool {
        self.events.len() >= self.max_size
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn size(&self) -> usize {
        self.events.len()
    }

    /// Buffered events in arrival order.
    pub fn events(&self) -> &[ExtractedEvent] {
        &self.events
    }

    /// Marks every buffered message but the last, commits the last, then
    /// clears the batch.
    pub fn commit(&mut self) {
        if let Some((last, rest)) = self.messages.split_last() {
            for message in rest {
                message.mark();
            }
            last.commit();
        }

        self.clear();
    }

    /// Empties the batch, keeping its allocation.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.events.clear();
    }
}
