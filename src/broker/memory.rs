//! Process-local broker with pgmq-style leases.
//!
//! Used by tests and by embedders that run producer, worker and monitor in
//! one process.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Notify;

use super::{Broker, Delivery};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Stored {
    id: i64,
    read_count: i32,
    enqueued_at: DateTime<Utc>,
    visible_at: Instant,
    body: Value,
}

#[derive(Debug, Default)]
struct MemoryQueue {
    next_id: i64,
    live: BTreeMap<i64, Stored>,
    /// Acknowledged messages are dropped; only their number is kept.
    acked: usize,
    dead: Vec<Stored>,
}

impl MemoryQueue {
    /// Lease the oldest visible message, or report when the next one
    /// becomes visible.
    fn lease(&mut self, now: Instant, visibility: Duration) -> (Option<Delivery>, Option<Instant>) {
        if let Some(msg) = self.live.values_mut().find(|m| m.visible_at <= now) {
            msg.visible_at = now + visibility;
            msg.read_count += 1;
            let delivery = Delivery {
                id: msg.id,
                read_count: msg.read_count,
                enqueued_at: msg.enqueued_at,
                body: msg.body.clone(),
            };
            return (Some(delivery), None);
        }
        (None, self.live.values().map(|m| m.visible_at).min())
    }

    fn take(&mut self, queue: &str, id: i64) -> Result<Stored> {
        self.live
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("message {id} in queue {queue}")))
    }
}

/// In-memory [`Broker`].
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, MemoryQueue>>,
    notify: Notify,
    closed: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the "connection": every later operation fails with
    /// [`Error::ConnectionLost`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Messages not yet settled, leased or not.
    pub fn unsettled(&self, queue: &str) -> usize {
        self.inspect(queue, |q| q.live.len())
    }

    /// How many messages have been acknowledged.
    pub fn acknowledged(&self, queue: &str) -> usize {
        self.inspect(queue, |q| q.acked)
    }

    /// Bodies of messages rejected without requeue, oldest first.
    pub fn dead_lettered(&self, queue: &str) -> Vec<Value> {
        self.inspect(queue, |q| q.dead.iter().map(|m| m.body.clone()).collect())
    }

    fn inspect<T: Default>(&self, queue: &str, f: impl FnOnce(&MemoryQueue) -> T) -> T {
        self.queues
            .lock()
            .ok()
            .and_then(|queues| queues.get(queue).map(f))
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, MemoryQueue>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionLost("in-memory broker closed".to_string()));
        }
        self.queues
            .lock()
            .map_err(|_| Error::Other("in-memory broker lock poisoned".to_string()))
    }

    fn with_queue<T>(&self, queue: &str, f: impl FnOnce(&mut MemoryQueue) -> T) -> Result<T> {
        let mut queues = self.lock()?;
        Ok(f(queues.entry(queue.to_string()).or_default()))
    }
}

impl Broker for InMemoryBroker {
    async fn ensure_queue(&self, queue: &str) -> Result<()> {
        self.with_queue(queue, |_| ())
    }

    async fn send(&self, queue: &str, body: &Value, delay: Duration) -> Result<i64> {
        let id = self.with_queue(queue, |q| {
            q.next_id += 1;
            q.live.insert(
                q.next_id,
                Stored {
                    id: q.next_id,
                    read_count: 0,
                    enqueued_at: Utc::now(),
                    visible_at: Instant::now() + delay,
                    body: body.clone(),
                },
            );
            q.next_id
        })?;
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn receive(
        &self,
        queue: &str,
        visibility: Duration,
        wait: Duration,
    ) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            // Register interest before looking, so a send in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let (delivery, next_visible) = self.with_queue(queue, |q| q.lease(now, visibility))?;
            if delivery.is_some() {
                return Ok(delivery);
            }
            if now >= deadline {
                return Ok(None);
            }

            let wake_at = next_visible.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake_at)) => {}
            }
        }
    }

    async fn ack(&self, queue: &str, id: i64) -> Result<()> {
        self.with_queue(queue, |q| {
            q.take(queue, id)?;
            q.acked += 1;
            Ok::<(), Error>(())
        })?
    }

    async fn reject(&self, queue: &str, id: i64, requeue: bool) -> Result<()> {
        self.with_queue(queue, |q| {
            if requeue {
                let msg = q
                    .live
                    .get_mut(&id)
                    .ok_or_else(|| Error::NotFound(format!("message {id} in queue {queue}")))?;
                msg.visible_at = Instant::now();
            } else {
                let msg = q.take(queue, id)?;
                q.dead.push(msg);
            }
            Ok::<(), Error>(())
        })??;
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn unacked_lease_is_redelivered_after_visibility_lapses() {
        let broker = InMemoryBroker::new();
        broker.send("q", &json!({"n": 1}), Duration::ZERO).await.unwrap();

        let first = broker
            .receive("q", Duration::from_millis(20), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.read_count, 1);

        // Leased: invisible for now.
        let none = broker
            .receive("q", Duration::from_millis(20), Duration::ZERO)
            .await
            .unwrap();
        assert!(none.is_none());

        let again = broker
            .receive("q", Duration::from_secs(30), Duration::from_millis(500))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, first.id);
        assert!(again.is_redelivery());
    }

    #[tokio::test]
    async fn delayed_message_waits_for_its_delay() {
        let broker = InMemoryBroker::new();
        broker
            .send("q", &json!(1), Duration::from_millis(50))
            .await
            .unwrap();

        let early = broker
            .receive("q", Duration::from_secs(1), Duration::ZERO)
            .await
            .unwrap();
        assert!(early.is_none());

        let later = broker
            .receive("q", Duration::from_secs(1), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(later.is_some());
    }

    #[tokio::test]
    async fn reject_without_requeue_dead_letters() {
        let broker = InMemoryBroker::new();
        broker.send("q", &json!("x"), Duration::ZERO).await.unwrap();
        let d = broker
            .receive("q", Duration::from_secs(30), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        broker.reject("q", d.id, false).await.unwrap();

        assert_eq!(broker.unsettled("q"), 0);
        assert_eq!(broker.dead_lettered("q"), vec![json!("x")]);
    }

    #[tokio::test]
    async fn reject_with_requeue_makes_message_visible_again() {
        let broker = InMemoryBroker::new();
        broker.send("q", &json!("x"), Duration::ZERO).await.unwrap();
        let d = broker
            .receive("q", Duration::from_secs(30), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        broker.reject("q", d.id, true).await.unwrap();

        let again = broker
            .receive("q", Duration::from_secs(30), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, d.id);
        assert_eq!(again.read_count, 2);
        assert!(broker.dead_lettered("q").is_empty());
    }

    #[tokio::test]
    async fn acknowledged_messages_are_not_retained() {
        let broker = InMemoryBroker::new();
        for n in 0..1000 {
            broker.send("q", &json!(n), Duration::ZERO).await.unwrap();
            let d = broker
                .receive("q", Duration::from_secs(30), Duration::ZERO)
                .await
                .unwrap()
                .unwrap();
            broker.ack("q", d.id).await.unwrap();
        }

        assert_eq!(broker.unsettled("q"), 0);
        assert_eq!(broker.acknowledged("q"), 1000);
        let retained = broker.inspect("q", |q| q.live.len() + q.dead.len());
        assert_eq!(retained, 0);
    }

    #[tokio::test]
    async fn ack_of_unknown_message_is_not_found() {
        let broker = InMemoryBroker::new();
        let err = broker.ack("q", 42).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn closed_broker_fails_every_operation() {
        let broker = InMemoryBroker::new();
        broker.close();
        let err = broker
            .receive("q", Duration::from_secs(1), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionLost(_)));
        assert!(err.is_fatal());
    }
}
