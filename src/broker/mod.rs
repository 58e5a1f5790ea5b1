//! Message broker boundary.
//!
//! Task dispatch and the event stream both ride on named queues with pgmq
//! semantics: a received message is leased for a visibility window, and
//! only an explicit ack or reject settles it. A lease that lapses without
//! either makes the message visible again, which is how a crashed worker's
//! task gets redelivered.

pub mod memory;
pub mod pgmq;

pub use memory::InMemoryBroker;
pub use pgmq::PgmqBroker;

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Result;

/// A leased message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: i64,
    /// How many times this message has been leased, this one included.
    pub read_count: i32,
    pub enqueued_at: DateTime<Utc>,
    pub body: serde_json::Value,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.read_count > 1
    }
}

/// Queue transport shared by workers, producers and the monitor.
pub trait Broker: Send + Sync + 'static {
    /// Create `queue` if it does not exist.
    fn ensure_queue(&self, queue: &str) -> impl Future<Output = Result<()>> + Send;

    /// Enqueue a message, visible after `delay`. Returns its id.
    fn send(
        &self,
        queue: &str,
        body: &serde_json::Value,
        delay: Duration,
    ) -> impl Future<Output = Result<i64>> + Send;

    /// Lease the next visible message for `visibility`, waiting up to `wait`
    /// for one to show up. `None` means the wait elapsed quietly.
    fn receive(
        &self,
        queue: &str,
        visibility: Duration,
        wait: Duration,
    ) -> impl Future<Output = Result<Option<Delivery>>> + Send;

    /// Settle a message as done. It is never delivered again.
    fn ack(&self, queue: &str, id: i64) -> impl Future<Output = Result<()>> + Send;

    /// Settle a message as refused. With `requeue` it becomes visible again
    /// at once; without it is dead-lettered.
    fn reject(
        &self,
        queue: &str,
        id: i64,
        requeue: bool,
    ) -> impl Future<Output = Result<()>> + Send;
}
