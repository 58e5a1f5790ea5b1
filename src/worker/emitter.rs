//! Lifecycle event publication.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;

use crate::broker::Broker;
use crate::clock::LamportClock;
use crate::event::{EventType, TaskEvent};
use crate::model::TaskMessage;
use crate::telemetry::metrics;

/// Stamps events with this process's Lamport clock and publishes them to
/// the event queue.
///
/// Publication is best effort: the event stream reports on tasks, it does
/// not drive them, so a failed publish is logged and the task carries on.
pub struct EventEmitter<B> {
    broker: Arc<B>,
    queue: String,
    hostname: String,
    clock: LamportClock,
}

impl<B: Broker> EventEmitter<B> {
    pub fn new(broker: Arc<B>, queue: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            broker,
            queue: queue.into(),
            hostname: hostname.into(),
            clock: LamportClock::new(),
        }
    }

    /// Merge the clock carried by an incoming message.
    pub fn observe(&self, clock: u64) {
        self.clock.observe(clock);
    }

    /// Advance the clock without emitting, e.g. to stamp an outgoing message.
    pub fn tick(&self) -> u64 {
        self.clock.tick()
    }

    /// A fresh event about `msg`, stamped with the next clock value.
    pub fn event(&self, kind: EventType, msg: &TaskMessage) -> TaskEvent {
        self.event_at(kind, msg, self.clock.tick())
    }

    /// Like [`event`](Self::event), with a clock value already ticked.
    pub fn event_at(&self, kind: EventType, msg: &TaskMessage, clock: u64) -> TaskEvent {
        TaskEvent::new(kind, msg.id.clone(), clock)
            .name(msg.name.clone())
            .worker(self.hostname.clone())
    }

    pub async fn emit(&self, event: TaskEvent) {
        let body = match event.encode() {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(task_id = %event.task_id, "cannot encode {} event: {e}", event.kind);
                return;
            }
        };
        match self.broker.send(&self.queue, &body, Duration::ZERO).await {
            Ok(_) => {
                metrics::events_emitted().add(1, &[KeyValue::new("type", event.kind.as_str())]);
                tracing::debug!(
                    task_id = %event.task_id,
                    clock = event.logical_clock,
                    "emitted {} event",
                    event.kind
                );
            }
            Err(e) => {
                tracing::warn!(
                    task_id = %event.task_id,
                    "failed to publish {} event: {e}",
                    event.kind
                );
            }
        }
    }
}
