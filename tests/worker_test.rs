//! Integration tests for the execution pipeline, driven through the
//! in-memory broker and checked through the event stream.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use taskmon::broker::{Broker, InMemoryBroker};
use taskmon::event::{EventType, TaskEvent};
use taskmon::model::{Signature, TaskId, TaskRecord, TaskState};
use taskmon::monitor::{Monitor, MonitorConfig, NotificationSink};
use taskmon::worker::{
    HandlerRegistry, PolicyRegistry, TaskCall, TaskError, TaskPolicy, Worker, WorkerConfig,
};

const TASKS: &str = "tasks";
const EVENTS: &str = "task_events";

/// Keeps every event the monitor reports, in arrival order.
#[derive(Default)]
struct Recorder {
    events: Vec<(TaskId, EventType)>,
}

impl NotificationSink for Recorder {
    fn on_status_change(&mut self, _record: &TaskRecord, event: &TaskEvent, _raw: &Value) {
        self.events.push((event.task_id.clone(), event.kind));
    }
}

type TestMonitor = Monitor<InMemoryBroker, Recorder>;

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        task_queue: TASKS.to_string(),
        event_queue: EVENTS.to_string(),
        hostname: "worker-test".to_string(),
        visibility_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(200),
        concurrency: 2,
    }
}

fn fast_retries(max: u32) -> TaskPolicy {
    TaskPolicy::default()
        .max_retries(max)
        .retry_on("timeout")
        .backoff(Duration::from_millis(1), Duration::from_millis(5))
}

fn test_worker(
    broker: &Arc<InMemoryBroker>,
    handlers: HandlerRegistry,
    policies: PolicyRegistry,
) -> Worker<InMemoryBroker> {
    Worker::new(Arc::clone(broker), handlers, policies, worker_config())
}

/// Run deliveries until the task queue stays quiet for one poll interval.
async fn run_until_idle(worker: &Worker<InMemoryBroker>) -> usize {
    let mut processed = 0;
    while worker.process_next().await.expect("process task") {
        processed += 1;
    }
    processed
}

/// Reconcile everything published so far.
async fn observe(broker: &Arc<InMemoryBroker>) -> TestMonitor {
    let config = MonitorConfig {
        event_queue: EVENTS.to_string(),
        timeout: Duration::from_millis(50),
        visibility_timeout: Duration::from_secs(5),
    };
    let mut monitor = Monitor::new(Arc::clone(broker), Recorder::default(), config);
    monitor.drain().await.expect("drain events");
    monitor
}

fn kinds(monitor: &TestMonitor, id: &TaskId) -> Vec<EventType> {
    monitor
        .sink()
        .events
        .iter()
        .filter(|(task, _)| task == id)
        .map(|(_, kind)| *kind)
        .collect()
}

fn task<'a>(monitor: &'a TestMonitor, id: &TaskId) -> &'a TaskRecord {
    monitor.store().get(id).expect("task record")
}

fn sum_args(call: &TaskCall) -> i64 {
    call.args.iter().filter_map(Value::as_i64).sum()
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_task_emits_full_lifecycle() {
    let broker = Arc::new(InMemoryBroker::new());
    let handlers = HandlerRegistry::new()
        .register("tasks.add", |call: TaskCall| async move { Ok::<_, TaskError>(json!(sum_args(&call))) });
    let worker = test_worker(&broker, handlers, PolicyRegistry::new());

    let id = worker
        .dispatcher()
        .send(Signature::new("tasks.add").arg(2).arg(2))
        .await
        .unwrap();
    assert_eq!(run_until_idle(&worker).await, 1);

    let monitor = observe(&broker).await;
    assert_eq!(
        kinds(&monitor, &id),
        [
            EventType::Sent,
            EventType::Received,
            EventType::Started,
            EventType::Succeeded
        ]
    );
    assert!(monitor.stats().anomalies.is_empty());

    let record = task(&monitor, &id);
    assert_eq!(record.state, TaskState::Succeeded);
    assert_eq!(record.result, Some(json!(4)));
    assert_eq!(record.args, Some(json!([2, 2])));
    assert_eq!(record.worker_id.as_deref(), Some("worker-test"));
    assert_eq!(record.routing_key.as_deref(), Some(TASKS));
    assert_eq!(record.root_id.as_ref(), Some(&id));
    assert!(record.runtime.is_some());
    assert_eq!(record.retry_count, 0);

    assert_eq!(broker.acknowledged(TASKS), 1);
    assert_eq!(broker.unsettled(TASKS), 0);
}

#[tokio::test]
async fn retryable_failure_retries_up_to_the_limit() {
    let broker = Arc::new(InMemoryBroker::new());
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&attempts);
    let handlers = HandlerRegistry::new().register("tasks.flaky", move |call: TaskCall| {
        seen.lock().unwrap().push(call.retries);
        async move { Err::<Value, _>(TaskError::new("timeout", "upstream did not answer")) }
    });
    let policies = PolicyRegistry::new().with_policy("tasks.flaky", fast_retries(3));
    let worker = test_worker(&broker, handlers, policies);

    let id = worker
        .dispatcher()
        .send(Signature::new("tasks.flaky"))
        .await
        .unwrap();
    assert_eq!(run_until_idle(&worker).await, 4);
    assert_eq!(*attempts.lock().unwrap(), vec![0, 1, 2, 3]);

    let monitor = observe(&broker).await;
    let events = kinds(&monitor, &id);
    let retried = events.iter().filter(|k| **k == EventType::Retried).count();
    let failed = events.iter().filter(|k| **k == EventType::Failed).count();
    assert_eq!(retried, 3);
    assert_eq!(failed, 4);
    assert_eq!(events.last(), Some(&EventType::Failed));
    assert!(monitor.stats().anomalies.is_empty());

    let record = task(&monitor, &id);
    assert_eq!(record.state, TaskState::Failed);
    assert_eq!(record.retry_count, 3);
    assert_eq!(
        record.exception.as_deref(),
        Some("timeout: upstream did not answer")
    );
    assert!(record.is_finished(Some(3)));
    assert_eq!(broker.unsettled(TASKS), 0);
}

#[tokio::test]
async fn non_retryable_failure_fails_immediately() {
    let broker = Arc::new(InMemoryBroker::new());
    let handlers = HandlerRegistry::new().register("tasks.parse", |_call: TaskCall| async {
        Err::<Value, _>(TaskError::new("ValueError", "not a number"))
    });
    let policies = PolicyRegistry::new().with_policy("tasks.parse", fast_retries(3));
    let worker = test_worker(&broker, handlers, policies);

    let id = worker
        .dispatcher()
        .send(Signature::new("tasks.parse").arg("x"))
        .await
        .unwrap();
    assert_eq!(run_until_idle(&worker).await, 1);

    let monitor = observe(&broker).await;
    assert_eq!(
        kinds(&monitor, &id),
        [
            EventType::Sent,
            EventType::Received,
            EventType::Started,
            EventType::Failed
        ]
    );
    let record = task(&monitor, &id);
    assert_eq!(record.state, TaskState::Failed);
    assert_eq!(record.retry_count, 0);
    assert_eq!(record.exception.as_deref(), Some("ValueError: not a number"));
}

#[tokio::test]
async fn panicking_handler_is_a_fatal_failure() {
    let broker = Arc::new(InMemoryBroker::new());
    let handlers = HandlerRegistry::new().register("tasks.boom", |_call: TaskCall| async {
        if true {
            panic!("handler blew up");
        }
        Ok::<_, TaskError>(Value::Null)
    });
    let worker = test_worker(&broker, handlers, PolicyRegistry::new());

    let id = worker
        .dispatcher()
        .send(Signature::new("tasks.boom"))
        .await
        .unwrap();
    run_until_idle(&worker).await;

    let monitor = observe(&broker).await;
    let record = task(&monitor, &id);
    assert_eq!(record.state, TaskState::Failed);
    assert!(record.exception.as_deref().unwrap().starts_with("panic: "));
    assert_eq!(broker.acknowledged(TASKS), 1);
}

// ---------------------------------------------------------------------------
// Rejection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rejected_task_is_dead_lettered_and_not_redelivered() {
    let broker = Arc::new(InMemoryBroker::new());
    let calls = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&calls);
    let handlers = HandlerRegistry::new().register("tasks.fetch", move |_call: TaskCall| {
        *counter.lock().unwrap() += 1;
        async { Err::<Value, _>(TaskError::reject("host unreachable")) }
    });
    let worker = test_worker(&broker, handlers, PolicyRegistry::new());

    let id = worker
        .dispatcher()
        .send(Signature::new("tasks.fetch").arg("http://10.0.0.1"))
        .await
        .unwrap();
    assert_eq!(run_until_idle(&worker).await, 1);
    assert_eq!(*calls.lock().unwrap(), 1);

    assert_eq!(broker.dead_lettered(TASKS).len(), 1);
    assert_eq!(broker.acknowledged(TASKS), 0);
    assert_eq!(broker.unsettled(TASKS), 0);

    let monitor = observe(&broker).await;
    let events = kinds(&monitor, &id);
    assert_eq!(events.last(), Some(&EventType::Rejected));
    let rejected_at = events
        .iter()
        .position(|k| *k == EventType::Rejected)
        .unwrap();
    assert!(!events[rejected_at..].contains(&EventType::Received));
    assert!(monitor.stats().anomalies.is_empty());

    let record = task(&monitor, &id);
    assert_eq!(record.state, TaskState::Rejected);
    assert_eq!(record.requeue, Some(false));
    assert_eq!(record.exception.as_deref(), Some("host unreachable"));
}

#[tokio::test]
async fn requeued_rejection_runs_again() {
    let broker = Arc::new(InMemoryBroker::new());
    let calls = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&calls);
    let handlers = HandlerRegistry::new().register("tasks.lease", move |_call: TaskCall| {
        let first = {
            let mut n = counter.lock().unwrap();
            *n += 1;
            *n == 1
        };
        async move {
            if first {
                Err(TaskError::Reject {
                    reason: "lock held".to_string(),
                    requeue: true,
                })
            } else {
                Ok(json!("leased"))
            }
        }
    });
    let worker = test_worker(&broker, handlers, PolicyRegistry::new());

    let id = worker
        .dispatcher()
        .send(Signature::new("tasks.lease"))
        .await
        .unwrap();
    assert_eq!(run_until_idle(&worker).await, 2);

    let monitor = observe(&broker).await;
    assert!(monitor.stats().anomalies.is_empty());
    let record = task(&monitor, &id);
    assert_eq!(record.state, TaskState::Succeeded);
    assert_eq!(record.requeue, None);
    assert!(broker.dead_lettered(TASKS).is_empty());
}

#[tokio::test]
async fn rejection_under_early_ack_is_recorded_as_failure() {
    let broker = Arc::new(InMemoryBroker::new());
    let handlers = HandlerRegistry::new().register("tasks.fetch", |_call: TaskCall| async {
        Err::<Value, _>(TaskError::reject("host unreachable"))
    });
    let policies =
        PolicyRegistry::new().with_policy("tasks.fetch", TaskPolicy::default().acks_late(false));
    let worker = test_worker(&broker, handlers, policies);

    let id = worker
        .dispatcher()
        .send(Signature::new("tasks.fetch"))
        .await
        .unwrap();
    run_until_idle(&worker).await;

    assert_eq!(broker.acknowledged(TASKS), 1);
    assert!(broker.dead_lettered(TASKS).is_empty());

    let monitor = observe(&broker).await;
    assert!(!kinds(&monitor, &id).contains(&EventType::Rejected));
    let record = task(&monitor, &id);
    assert_eq!(record.state, TaskState::Failed);
    assert_eq!(
        record.exception.as_deref(),
        Some("rejected: host unreachable")
    );
}

#[tokio::test]
async fn unregistered_task_is_rejected() {
    let broker = Arc::new(InMemoryBroker::new());
    let worker = test_worker(&broker, HandlerRegistry::new(), PolicyRegistry::new());

    let id = worker
        .dispatcher()
        .send(Signature::new("tasks.missing"))
        .await
        .unwrap();
    run_until_idle(&worker).await;

    assert_eq!(broker.dead_lettered(TASKS).len(), 1);
    let monitor = observe(&broker).await;
    assert_eq!(
        kinds(&monitor, &id),
        [EventType::Sent, EventType::Received, EventType::Rejected]
    );
    assert_eq!(
        task(&monitor, &id).exception.as_deref(),
        Some("unregistered task: tasks.missing")
    );
}

#[tokio::test]
async fn malformed_task_message_is_dead_lettered() {
    let broker = Arc::new(InMemoryBroker::new());
    let worker = test_worker(&broker, HandlerRegistry::new(), PolicyRegistry::new());
    broker
        .send(TASKS, &json!({"garbage": true}), Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(run_until_idle(&worker).await, 1);
    assert_eq!(broker.dead_lettered(TASKS), vec![json!({"garbage": true})]);
}

// ---------------------------------------------------------------------------
// Expiry, delays, redelivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn expired_task_is_revoked_without_running() {
    let broker = Arc::new(InMemoryBroker::new());
    let calls = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&calls);
    let handlers = HandlerRegistry::new().register("tasks.report", move |_call: TaskCall| {
        *counter.lock().unwrap() += 1;
        async { Ok::<_, TaskError>(Value::Null) }
    });
    let worker = test_worker(&broker, handlers, PolicyRegistry::new());

    let id = worker
        .dispatcher()
        .send(Signature::new("tasks.report").expires_in(Duration::from_millis(1)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    run_until_idle(&worker).await;

    assert_eq!(*calls.lock().unwrap(), 0);
    let monitor = observe(&broker).await;
    assert_eq!(kinds(&monitor, &id), [EventType::Sent, EventType::Revoked]);
    let record = task(&monitor, &id);
    assert_eq!(record.state, TaskState::Revoked);
    assert!(record.expires.is_some());
    assert_eq!(broker.acknowledged(TASKS), 1);
}

#[tokio::test]
async fn countdown_delays_the_task() {
    let broker = Arc::new(InMemoryBroker::new());
    let handlers =
        HandlerRegistry::new().register("tasks.later", |_call: TaskCall| async { Ok::<_, TaskError>(json!(1)) });
    let worker = test_worker(&broker, handlers, PolicyRegistry::new());

    let id = worker
        .dispatcher()
        .send(Signature::new("tasks.later").countdown(Duration::from_millis(100)))
        .await
        .unwrap();

    assert_eq!(run_until_idle(&worker).await, 1);
    let monitor = observe(&broker).await;
    let record = task(&monitor, &id);
    assert_eq!(record.state, TaskState::Succeeded);
    assert!(record.eta.is_some());
}

#[tokio::test]
async fn crashed_attempt_is_redelivered() {
    let broker = Arc::new(InMemoryBroker::new());
    let handlers =
        HandlerRegistry::new().register("tasks.add", |call: TaskCall| async move {
            Ok::<_, TaskError>(json!(sum_args(&call)))
        });
    let worker = test_worker(&broker, handlers, PolicyRegistry::new());

    let id = worker
        .dispatcher()
        .send(Signature::new("tasks.add").arg(1).arg(1))
        .await
        .unwrap();

    // A worker leases the message and dies without settling it.
    let lost = broker
        .receive(TASKS, Duration::from_millis(50), Duration::from_millis(100))
        .await
        .unwrap()
        .expect("message leased");
    assert!(!lost.is_redelivery());

    assert_eq!(run_until_idle(&worker).await, 1);
    assert_eq!(broker.acknowledged(TASKS), 1);
    assert_eq!(broker.unsettled(TASKS), 0);

    let monitor = observe(&broker).await;
    assert_eq!(task(&monitor, &id).result, Some(json!(2)));
}

// ---------------------------------------------------------------------------
// Chains
// ---------------------------------------------------------------------------

#[tokio::test]
async fn chain_passes_the_result_downstream() {
    let broker = Arc::new(InMemoryBroker::new());
    let inputs = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&inputs);
    let handlers = HandlerRegistry::new()
        .register("tasks.add", |call: TaskCall| async move {
            Ok::<_, TaskError>(json!(sum_args(&call)))
        })
        .register("tasks.scale", move |call: TaskCall| {
            seen.lock().unwrap().push(call.args.clone());
            async move {
                let factor = call.kwargs.get("factor").and_then(Value::as_i64).unwrap_or(1);
                Ok::<_, TaskError>(json!(sum_args(&call) * factor))
            }
        });
    let worker = test_worker(&broker, handlers, PolicyRegistry::new());

    let first = worker
        .dispatcher()
        .chain(
            Signature::new("tasks.add").arg(2).arg(3),
            Signature::new("tasks.scale").kwarg("factor", 10),
        )
        .await
        .unwrap();
    assert_eq!(run_until_idle(&worker).await, 2);
    assert_eq!(*inputs.lock().unwrap(), vec![vec![json!(5)]]);

    let monitor = observe(&broker).await;
    let upstream = task(&monitor, &first);
    assert_eq!(upstream.children.len(), 1);
    let child_id = upstream.children.iter().next().unwrap().clone();

    let child = task(&monitor, &child_id);
    assert_eq!(child.state, TaskState::Succeeded);
    assert_eq!(child.result, Some(json!(50)));
    assert_eq!(child.args, Some(json!([5])));
    assert_eq!(child.parent_id.as_ref(), Some(&first));
    assert_eq!(child.root_id.as_ref(), Some(&first));
    assert!(monitor.stats().anomalies.is_empty());
}

#[tokio::test]
async fn chain_stops_when_upstream_fails() {
    let broker = Arc::new(InMemoryBroker::new());
    let calls = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&calls);
    let handlers = HandlerRegistry::new()
        .register("tasks.add", |_call: TaskCall| async {
            Err::<Value, _>(TaskError::new("TypeError", "cannot add"))
        })
        .register("tasks.scale", move |_call: TaskCall| {
            *counter.lock().unwrap() += 1;
            async { Ok::<_, TaskError>(Value::Null) }
        });
    let worker = test_worker(&broker, handlers, PolicyRegistry::new());

    let first = worker
        .dispatcher()
        .chain(Signature::new("tasks.add"), Signature::new("tasks.scale"))
        .await
        .unwrap();
    assert_eq!(run_until_idle(&worker).await, 1);
    assert_eq!(*calls.lock().unwrap(), 0);

    let monitor = observe(&broker).await;
    assert_eq!(task(&monitor, &first).state, TaskState::Failed);
    assert!(task(&monitor, &first).children.is_empty());
    assert_eq!(monitor.store().len(), 1);
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_processes_tasks_until_shutdown() {
    let broker = Arc::new(InMemoryBroker::new());
    let handlers = HandlerRegistry::new().register("tasks.add", |call: TaskCall| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok::<_, TaskError>(json!(sum_args(&call)))
    });
    let worker = test_worker(&broker, handlers, PolicyRegistry::new());

    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(
            worker
                .dispatcher()
                .send(Signature::new("tasks.add").arg(n).arg(n))
                .await
                .unwrap(),
        );
    }

    let running = worker.clone();
    let handle = tokio::spawn(async move { running.run().await });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while broker.acknowledged(TASKS) < ids.len() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "tasks did not finish in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    worker.shutdown();
    handle.await.unwrap().unwrap();

    let monitor = observe(&broker).await;
    for (n, id) in ids.iter().enumerate() {
        let record = task(&monitor, id);
        assert_eq!(record.state, TaskState::Succeeded);
        assert_eq!(record.result, Some(json!(2 * n as i64)));
    }
}

#[tokio::test]
async fn producer_and_worker_clocks_order_events() {
    let broker = Arc::new(InMemoryBroker::new());
    let handlers =
        HandlerRegistry::new().register("tasks.add", |_call: TaskCall| async { Ok::<_, TaskError>(json!(0)) });
    let worker = test_worker(&broker, handlers, PolicyRegistry::new());

    // A separate producer process with its own clock, far ahead.
    let producer = taskmon::worker::Dispatcher::producer(
        Arc::clone(&broker),
        TASKS,
        EVENTS,
        "producer",
    );
    for _ in 0..10 {
        producer.send(Signature::new("tasks.add")).await.unwrap();
    }
    let id = producer.send(Signature::new("tasks.add")).await.unwrap();
    run_until_idle(&worker).await;

    let monitor = observe(&broker).await;
    let record = task(&monitor, &id);
    assert_eq!(record.state, TaskState::Succeeded);
    assert!(record.logical_clock > 11);
    assert!(monitor.stats().anomalies.is_empty());
}
