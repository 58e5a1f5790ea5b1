//! Worker: pulls task messages, runs their bodies, reports every transition.
//!
//! Acknowledgement is late by default. A message is settled only once the
//! attempt's outcome is known, so a worker that dies mid-task leaves the
//! message leased, and the broker hands it out again when the lease lapses.
//! The same rule lets a rejection reach the broker as a real reject.

pub mod dispatch;
pub mod emitter;
pub mod handler;
pub mod policy;

pub use dispatch::Dispatcher;
pub use emitter::EventEmitter;
pub use handler::{HandlerRegistry, TaskCall, TaskError, TaskHandler};
pub use policy::{PolicyRegistry, TaskPolicy};

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use serde_json::Value;
use tokio::sync::{Notify, Semaphore};
use tracing::{Instrument, Span, error, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, Delivery};
use crate::clock;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::EventType;
use crate::model::TaskMessage;
use crate::telemetry::metrics;
use crate::telemetry::task::{record_state_transition, start_task_span};

/// Configuration for a worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub task_queue: String,
    pub event_queue: String,
    /// Reported as `workerId` on every event this worker emits.
    pub hostname: String,
    /// Lease length for a received task message.
    pub visibility_timeout: Duration,
    /// How long one receive waits before checking for shutdown again.
    pub poll_interval: Duration,
    /// Attempts running at once.
    pub concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            task_queue: "tasks".to_string(),
            event_queue: "task_events".to_string(),
            hostname: format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]),
            visibility_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            concurrency: 4,
        }
    }
}

impl WorkerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            task_queue: config.task_queue.clone(),
            event_queue: config.event_queue.clone(),
            ..Self::default()
        }
    }
}

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settle {
    Ack,
    Reject { requeue: bool },
}

/// The execution pipeline.
pub struct Worker<B> {
    broker: Arc<B>,
    handlers: Arc<HandlerRegistry>,
    policies: Arc<PolicyRegistry>,
    emitter: Arc<EventEmitter<B>>,
    dispatcher: Dispatcher<B>,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
}

impl<B> Clone for Worker<B> {
    fn clone(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            handlers: Arc::clone(&self.handlers),
            policies: Arc::clone(&self.policies),
            emitter: Arc::clone(&self.emitter),
            dispatcher: self.dispatcher.clone(),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl<B: Broker> Worker<B> {
    pub fn new(
        broker: Arc<B>,
        handlers: HandlerRegistry,
        policies: PolicyRegistry,
        config: WorkerConfig,
    ) -> Self {
        let emitter = Arc::new(EventEmitter::new(
            Arc::clone(&broker),
            config.event_queue.clone(),
            config.hostname.clone(),
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&broker),
            config.task_queue.clone(),
            Arc::clone(&emitter),
        );
        Self {
            broker,
            handlers: Arc::new(handlers),
            policies: Arc::new(policies),
            emitter,
            dispatcher,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// A dispatcher that shares this worker's queue and event clock.
    pub fn dispatcher(&self) -> Dispatcher<B> {
        self.dispatcher.clone()
    }

    /// Signal the worker loop to stop taking new messages.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run the worker loop until shutdown or a broker failure.
    ///
    /// Attempts still running at shutdown are not awaited; their messages
    /// stay unacknowledged and are redelivered.
    pub async fn run(&self) -> Result<()> {
        let slots = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        info!(
            hostname = %self.config.hostname,
            queue = %self.config.task_queue,
            concurrency = self.config.concurrency,
            "worker started, listening for tasks"
        );

        loop {
            let permit = tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("worker shutting down");
                    return Ok(());
                }
                permit = Arc::clone(&slots).acquire_owned() => {
                    permit.map_err(|e| Error::Other(format!("worker slots closed: {e}")))?
                }
            };

            let delivery = tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("worker shutting down");
                    return Ok(());
                }
                delivery = self.receive() => delivery?,
            };
            let Some(delivery) = delivery else {
                continue;
            };

            let worker = self.clone();
            tokio::spawn(async move {
                if let Err(e) = worker.execute(delivery).await {
                    error!("task execution error: {e}");
                }
                drop(permit);
            });
        }
    }

    /// Receive one message and run it to completion.
    ///
    /// Returns `false` if nothing arrived within the poll interval.
    pub async fn process_next(&self) -> Result<bool> {
        match self.receive().await? {
            Some(delivery) => {
                self.execute(delivery).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn receive(&self) -> Result<Option<Delivery>> {
        self.broker
            .receive(
                &self.config.task_queue,
                self.config.visibility_timeout,
                self.config.poll_interval,
            )
            .await
    }

    async fn execute(&self, delivery: Delivery) -> Result<()> {
        let queue = self.config.task_queue.as_str();
        let msg: TaskMessage = match serde_json::from_value(delivery.body.clone()) {
            Ok(msg) => msg,
            Err(e) => {
                error!(delivery = delivery.id, "dead-lettering malformed task message: {e}");
                return self.broker.reject(queue, delivery.id, false).await;
            }
        };

        self.emitter.observe(msg.clock);
        let policy = self.policies.policy_for(&msg.name).clone();
        let span = start_task_span(&msg.name, &msg.id);

        async {
            if delivery.is_redelivery() {
                warn!(read_count = delivery.read_count, "task message redelivered");
            }
            if !policy.acks_late {
                self.broker.ack(queue, delivery.id).await?;
            }

            let settle = self.attempt(&msg, &policy, &span).await?;

            if policy.acks_late {
                match settle {
                    Settle::Ack => self.broker.ack(queue, delivery.id).await?,
                    Settle::Reject { requeue } => {
                        self.broker.reject(queue, delivery.id, requeue).await?
                    }
                }
            }
            Ok(())
        }
        .instrument(span.clone())
        .await
    }

    /// Run one attempt and emit its events. Returns how to settle the message.
    async fn attempt(&self, msg: &TaskMessage, policy: &TaskPolicy, span: &Span) -> Result<Settle> {
        if msg.is_expired(clock::now()) {
            warn!("task expired before it could run, revoking");
            self.emitter
                .emit(self.emitter.event(EventType::Revoked, msg))
                .await;
            record_outcome(msg, "revoked");
            return Ok(Settle::Ack);
        }

        self.emitter
            .emit(self.emitter.event(EventType::Received, msg).describing(msg))
            .await;
        record_state_transition(span, "pending", "received");

        let Some(handler) = self.handlers.get(&msg.name) else {
            error!(task = %msg.name, "no handler registered for task, rejecting");
            let event = self
                .emitter
                .event(EventType::Rejected, msg)
                .exception(format!("unregistered task: {}", msg.name))
                .requeue(false);
            self.emitter.emit(event).await;
            record_state_transition(span, "received", "rejected");
            record_outcome(msg, "rejected");
            return Ok(Settle::Reject { requeue: false });
        };

        self.emitter
            .emit(self.emitter.event(EventType::Started, msg))
            .await;
        record_state_transition(span, "received", "started");

        let started = Instant::now();
        let outcome = match tokio::spawn(handler.call(TaskCall::from(msg))).await {
            Ok(outcome) => outcome,
            Err(e) => Err(TaskError::new("panic", e.to_string())),
        };
        let runtime = started.elapsed();
        metrics::task_duration_ms().record(
            runtime.as_secs_f64() * 1000.0,
            &[KeyValue::new("task", msg.name.clone())],
        );

        match outcome {
            Ok(result) => self.succeed(msg, result, runtime, span).await,
            Err(TaskError::Reject { reason, requeue }) => {
                Ok(self.reject(msg, policy, &reason, requeue, span).await)
            }
            Err(err) if policy.is_retryable(&err) && msg.retries < policy.max_retries => {
                self.retry(msg, policy, &err, span).await
            }
            Err(err) => Ok(self.fail(msg, &err, span).await),
        }
    }

    async fn succeed(
        &self,
        msg: &TaskMessage,
        result: Value,
        runtime: Duration,
        span: &Span,
    ) -> Result<Settle> {
        info!(runtime_ms = runtime.as_millis() as u64, "task succeeded");
        let event = self
            .emitter
            .event(EventType::Succeeded, msg)
            .result(result.clone())
            .runtime(runtime.as_secs_f64());
        self.emitter.emit(event).await;
        record_state_transition(span, "started", "succeeded");
        record_outcome(msg, "succeeded");

        if let Some(link) = &msg.link {
            let follow_up = link.as_ref().clone().with_upstream_result(result);
            let child_id = self.dispatcher.send_follow_up(follow_up, msg).await?;
            info!(child_id = %child_id, "follow-up task enqueued");
        }
        Ok(Settle::Ack)
    }

    async fn retry(
        &self,
        msg: &TaskMessage,
        policy: &TaskPolicy,
        err: &TaskError,
        span: &Span,
    ) -> Result<Settle> {
        let delay = policy.retry_delay(msg.retries);
        warn!(
            attempt = msg.retries + 1,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            "retryable failure: {err}"
        );

        let failed = self
            .emitter
            .event(EventType::Failed, msg)
            .exception(err.to_string())
            .retries(msg.retries);
        self.emitter.emit(failed).await;
        record_state_transition(span, "started", "failed");

        let tick = self.emitter.tick();
        let next = msg.next_attempt(tick);
        self.dispatcher.resend(&next, delay).await?;

        let retried = self
            .emitter
            .event_at(EventType::Retried, msg, tick)
            .exception(err.to_string())
            .retries(next.retries);
        self.emitter.emit(retried).await;
        record_state_transition(span, "failed", "retried");
        metrics::task_retries().add(1, &[KeyValue::new("task", msg.name.clone())]);

        Ok(Settle::Ack)
    }

    async fn fail(&self, msg: &TaskMessage, err: &TaskError, span: &Span) -> Settle {
        error!(retries = msg.retries, "task failed: {err}");
        let event = self
            .emitter
            .event(EventType::Failed, msg)
            .exception(err.to_string())
            .retries(msg.retries);
        self.emitter.emit(event).await;
        record_state_transition(span, "started", "failed");
        record_outcome(msg, "failed");
        Settle::Ack
    }

    async fn reject(
        &self,
        msg: &TaskMessage,
        policy: &TaskPolicy,
        reason: &str,
        requeue: bool,
        span: &Span,
    ) -> Settle {
        if !policy.acks_late {
            // Already acknowledged on receipt: the broker never sees the reject.
            warn!("rejection after early acknowledgement, recording a failure: {reason}");
            let event = self
                .emitter
                .event(EventType::Failed, msg)
                .exception(format!("rejected: {reason}"))
                .retries(msg.retries);
            self.emitter.emit(event).await;
            record_state_transition(span, "started", "failed");
            record_outcome(msg, "failed");
            return Settle::Ack;
        }

        warn!(requeue, "task rejected: {reason}");
        let event = self
            .emitter
            .event(EventType::Rejected, msg)
            .exception(reason)
            .requeue(requeue);
        self.emitter.emit(event).await;
        record_state_transition(span, "started", "rejected");
        record_outcome(msg, "rejected");
        Settle::Reject { requeue }
    }
}

fn record_outcome(msg: &TaskMessage, outcome: &'static str) {
    metrics::task_outcomes().add(
        1,
        &[
            KeyValue::new("task", msg.name.clone()),
            KeyValue::new("outcome", outcome),
        ],
    );
}
