//! Task submission and two-stage chains.
//!
//! A chain is message passing: the upstream message carries the follow-up
//! signature as its `link`, and the worker that completes the upstream
//! enqueues the follow-up with the result merged in. Nobody waits on the
//! follow-up.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::emitter::EventEmitter;
use crate::broker::Broker;
use crate::clock;
use crate::error::Result;
use crate::event::EventType;
use crate::model::{Signature, TaskId, TaskMessage};

/// Publishes task messages and their `sent` events.
pub struct Dispatcher<B> {
    broker: Arc<B>,
    queue: String,
    emitter: Arc<EventEmitter<B>>,
}

impl<B> Clone for Dispatcher<B> {
    fn clone(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            queue: self.queue.clone(),
            emitter: Arc::clone(&self.emitter),
        }
    }
}

impl<B: Broker> Dispatcher<B> {
    pub fn new(broker: Arc<B>, queue: impl Into<String>, emitter: Arc<EventEmitter<B>>) -> Self {
        Self {
            broker,
            queue: queue.into(),
            emitter,
        }
    }

    /// A stand-alone producer with its own event clock.
    pub fn producer(
        broker: Arc<B>,
        task_queue: impl Into<String>,
        event_queue: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        let emitter = Arc::new(EventEmitter::new(
            Arc::clone(&broker),
            event_queue,
            hostname,
        ));
        Self::new(broker, task_queue, emitter)
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Submit a single task.
    pub async fn send(&self, sig: Signature) -> Result<TaskId> {
        self.dispatch(sig, None, None).await
    }

    /// Submit `first`; once it succeeds, `then` runs with its result.
    pub async fn chain(&self, first: Signature, then: Signature) -> Result<TaskId> {
        self.dispatch(first, Some(then), None).await
    }

    /// Enqueue the follow-up of a finished upstream task.
    pub(crate) async fn send_follow_up(
        &self,
        sig: Signature,
        upstream: &TaskMessage,
    ) -> Result<TaskId> {
        self.dispatch(sig, None, Some(upstream)).await
    }

    /// Put an existing message back on the queue, visible after `delay`.
    pub(crate) async fn resend(&self, msg: &TaskMessage, delay: Duration) -> Result<()> {
        let body = serde_json::to_value(msg)?;
        self.broker.send(&self.queue, &body, delay).await?;
        Ok(())
    }

    async fn dispatch(
        &self,
        sig: Signature,
        link: Option<Signature>,
        upstream: Option<&TaskMessage>,
    ) -> Result<TaskId> {
        let Signature {
            name,
            args,
            kwargs,
            countdown,
            expires_in,
        } = sig;

        let id = TaskId::new();
        let now = clock::now();
        let tick = self.emitter.tick();

        let root_id = match upstream {
            Some(up) => up.root_id.clone().unwrap_or_else(|| up.id.clone()),
            None => id.clone(),
        };

        let msg = TaskMessage {
            id: id.clone(),
            name,
            args,
            kwargs,
            retries: 0,
            eta: countdown.map(|d| now + d.as_secs_f64()),
            expires: expires_in.map(|d| now + d.as_secs_f64()),
            clock: tick,
            root_id: Some(root_id),
            parent_id: upstream.map(|up| up.id.clone()),
            link: link.map(Box::new),
        };

        let body = serde_json::to_value(&msg)?;
        self.broker
            .send(&self.queue, &body, countdown.unwrap_or_default())
            .await?;

        let sent = self
            .emitter
            .event_at(EventType::Sent, &msg, tick)
            .describing(&msg)
            .routing(None, self.queue.clone());
        self.emitter.emit(sent).await;

        info!(task_id = %id, task = %msg.name, "task dispatched");
        Ok(id)
    }
}
