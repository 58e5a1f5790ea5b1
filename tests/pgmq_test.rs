//! PgmqBroker against a real Postgres with the pgmq extension.
//!
//! Requires a database: `BROKER_URL=postgres://... cargo test -- --ignored`

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use taskmon::broker::{Broker, PgmqBroker};
use taskmon::event::{EventType, TaskEvent};
use taskmon::model::TaskId;
use taskmon::monitor::{ConsoleSink, Monitor, MonitorConfig};

async fn connect() -> PgmqBroker {
    dotenvy::dotenv().ok();
    let url = std::env::var("BROKER_URL").expect("BROKER_URL must be set");
    PgmqBroker::connect(&url).await.expect("connect")
}

fn queue_name(prefix: &str) -> String {
    format!("{prefix}_{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

#[tokio::test]
#[ignore] // requires postgres with pgmq
async fn send_receive_ack() {
    let broker = connect().await;
    broker.health_check().await.expect("health check");
    let queue = queue_name("t_ack");
    broker.ensure_queue(&queue).await.unwrap();

    let id = broker
        .send(&queue, &json!({"hello": "world"}), Duration::ZERO)
        .await
        .unwrap();
    let delivery = broker
        .receive(&queue, Duration::from_secs(30), Duration::from_secs(1))
        .await
        .unwrap()
        .expect("message");
    assert_eq!(delivery.id, id);
    assert_eq!(delivery.read_count, 1);
    assert_eq!(delivery.body, json!({"hello": "world"}));

    broker.ack(&queue, id).await.unwrap();
    let none = broker
        .receive(&queue, Duration::from_secs(30), Duration::from_secs(1))
        .await
        .unwrap();
    assert!(none.is_none());
}

#[tokio::test]
#[ignore] // requires postgres with pgmq
async fn requeue_makes_message_visible_again() {
    let broker = connect().await;
    let queue = queue_name("t_requeue");
    broker.ensure_queue(&queue).await.unwrap();

    broker
        .send(&queue, &json!(1), Duration::ZERO)
        .await
        .unwrap();
    let first = broker
        .receive(&queue, Duration::from_secs(30), Duration::from_secs(1))
        .await
        .unwrap()
        .expect("message");
    broker.reject(&queue, first.id, true).await.unwrap();

    let again = broker
        .receive(&queue, Duration::from_secs(30), Duration::from_secs(2))
        .await
        .unwrap()
        .expect("requeued message");
    assert_eq!(again.id, first.id);
    assert!(again.is_redelivery());

    broker.reject(&queue, again.id, false).await.unwrap();
    let none = broker
        .receive(&queue, Duration::from_secs(30), Duration::from_secs(1))
        .await
        .unwrap();
    assert!(none.is_none());
}

#[tokio::test]
#[ignore] // requires postgres with pgmq
async fn monitor_consumes_from_pgmq() {
    let broker = Arc::new(connect().await);
    let queue = queue_name("t_events");
    broker.ensure_queue(&queue).await.unwrap();

    for (kind, clock) in [(EventType::Sent, 1), (EventType::Received, 2)] {
        let body = TaskEvent::new(kind, "pg1", clock)
            .name("tasks.add")
            .encode()
            .unwrap();
        broker.send(&queue, &body, Duration::ZERO).await.unwrap();
    }

    let config = MonitorConfig {
        event_queue: queue,
        timeout: Duration::from_secs(1),
        ..MonitorConfig::default()
    };
    let mut monitor = Monitor::new(broker, ConsoleSink::new(Vec::new(), false), config);
    assert_eq!(monitor.drain().await.unwrap(), 2);
    assert!(monitor.store().get(&TaskId::from("pg1")).is_some());
}
