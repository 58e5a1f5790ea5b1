//! Event stream consumer: decode → reconcile → notify.
//!
//! A single cooperative pull loop. The reconciler and the sink run inline
//! for each delivery, so the task store has exactly one writer and needs no
//! locking.

pub mod reconciler;
pub mod sink;

pub use reconciler::{Anomaly, ApplyKind, Applied, Reconciler, TaskStore};
pub use sink::{ConsoleSink, NotificationSink};

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::config::Config;
use crate::error::Result;
use crate::event::TaskEvent;
use crate::model::TaskId;
use crate::telemetry::metrics;

/// Configuration for the event consumer.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub event_queue: String,
    /// Longest wait for one event before the loop reports a quiet period.
    pub timeout: Duration,
    /// Lease on an event while it is being processed.
    pub visibility_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            event_queue: "task_events".to_string(),
            timeout: Duration::from_secs(10),
            visibility_timeout: Duration::from_secs(30),
        }
    }
}

impl MonitorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            event_queue: config.event_queue.clone(),
            timeout: config.event_timeout,
            ..Self::default()
        }
    }
}

/// Counters kept by the consumer loop.
#[derive(Debug, Default, Clone)]
pub struct MonitorStats {
    pub processed: u64,
    pub malformed: u64,
    pub anomalies: Vec<(TaskId, Anomaly)>,
}

/// The event stream consumer.
pub struct Monitor<B, S> {
    broker: Arc<B>,
    reconciler: Reconciler,
    sink: S,
    config: MonitorConfig,
    stats: MonitorStats,
}

impl<B: Broker, S: NotificationSink> Monitor<B, S> {
    pub fn new(broker: Arc<B>, sink: S, config: MonitorConfig) -> Self {
        Self {
            broker,
            reconciler: Reconciler::new(),
            sink,
            config,
            stats: MonitorStats::default(),
        }
    }

    /// Replace the reconciler, e.g. one that knows retry limits.
    pub fn with_reconciler(mut self, reconciler: Reconciler) -> Self {
        self.reconciler = reconciler;
        self
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn store(&self) -> &TaskStore {
        self.reconciler.store()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }

    /// Consume events until the broker fails. Never returns `Ok`.
    pub async fn listen(&mut self) -> Result<()> {
        info!(queue = %self.config.event_queue, "monitor started, listening for task events");
        loop {
            if !self.poll().await? {
                debug!(
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "no task events within timeout"
                );
            }
        }
    }

    /// Consume events until the first quiet period. Returns how many were
    /// taken off the queue.
    pub async fn drain(&mut self) -> Result<usize> {
        let mut taken = 0;
        while self.poll().await? {
            taken += 1;
        }
        Ok(taken)
    }

    /// Take at most one event off the queue and process it.
    ///
    /// `Ok(false)` means nothing arrived within the timeout. Malformed events
    /// are dropped and still count as taken; only broker errors are returned.
    pub async fn poll(&mut self) -> Result<bool> {
        let queue = self.config.event_queue.clone();
        let Some(delivery) = self
            .broker
            .receive(&queue, self.config.visibility_timeout, self.config.timeout)
            .await?
        else {
            return Ok(false);
        };

        if let Err(e) = self.handle(&delivery.body) {
            if e.is_fatal() {
                return Err(e);
            }
            self.stats.malformed += 1;
            metrics::events_malformed().add(1, &[]);
            warn!(delivery = delivery.id, "dropping malformed task event: {e}");
        }

        self.broker.ack(&queue, delivery.id).await?;
        Ok(true)
    }

    /// Decode one raw event, reconcile it, and notify the sink.
    pub fn handle(&mut self, raw: &serde_json::Value) -> Result<()> {
        let event = TaskEvent::decode(raw)?;
        self.dispatch(&event, raw);
        Ok(())
    }

    /// Reconcile an already decoded event and notify the sink with the
    /// payload it was decoded from.
    pub fn dispatch(&mut self, event: &TaskEvent, raw: &serde_json::Value) {
        metrics::events_received().add(1, &[KeyValue::new("type", event.kind.as_str())]);
        let applied = self.reconciler.apply(event);

        for anomaly in &applied.anomalies {
            warn!(
                task_id = %event.task_id,
                clock = event.logical_clock,
                "task anomaly: {anomaly}"
            );
            metrics::reconcile_anomalies().add(1, &[KeyValue::new("kind", anomaly.label())]);
            self.stats
                .anomalies
                .push((event.task_id.clone(), anomaly.clone()));
        }
        if applied.kind == ApplyKind::Duplicate {
            debug!(task_id = %event.task_id, clock = event.logical_clock, "duplicate event");
        }

        self.stats.processed += 1;
        self.sink.on_status_change(applied.record, event, raw);
    }
}
