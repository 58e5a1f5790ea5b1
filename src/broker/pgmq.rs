//! pgmq-backed broker via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read_with_poll,
//! pgmq.delete, pgmq.archive, pgmq.set_vt. Acknowledged messages are
//! deleted; rejected ones are archived so they stay around for inspection.

use std::time::Duration;

use opentelemetry::KeyValue;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use super::{Broker, Delivery};
use crate::error::Result;
use crate::telemetry::metrics;

/// Broker handle. Owns the connection pool for both task and event queues.
pub struct PgmqBroker {
    pool: PgPool,
}

/// pgmq takes whole seconds; round up so a short delay is never dropped.
fn whole_seconds(d: Duration) -> i32 {
    i32::try_from(d.as_millis().div_ceil(1000)).unwrap_or(i32::MAX)
}

fn count(queue: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

impl PgmqBroker {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

impl Broker for PgmqBroker {
    async fn ensure_queue(&self, queue: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue)
            .execute(&self.pool)
            .await?;
        count(queue, "create");
        Ok(())
    }

    async fn send(&self, queue: &str, body: &serde_json::Value, delay: Duration) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(queue)
            .bind(body)
            .bind(whole_seconds(delay))
            .fetch_one(&self.pool)
            .await?;
        count(queue, "send");
        Ok(row.0)
    }

    async fn receive(
        &self,
        queue: &str,
        visibility: Duration,
        wait: Duration,
    ) -> Result<Option<Delivery>> {
        let row = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >(
            "SELECT msg_id, read_ct, enqueued_at, message FROM pgmq.read_with_poll($1, $2, 1, $3, 100)",
        )
        .bind(queue)
        .bind(whole_seconds(visibility).max(1))
        .bind(whole_seconds(wait))
        .fetch_optional(&self.pool)
        .await?;

        let delivery = row.map(|(id, read_count, enqueued_at, body)| Delivery {
            id,
            read_count,
            enqueued_at,
            body,
        });
        count(
            queue,
            if delivery.is_some() { "read" } else { "read_empty" },
        );
        Ok(delivery)
    }

    async fn ack(&self, queue: &str, id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.delete($1, $2)")
            .bind(queue)
            .bind(id)
            .execute(&self.pool)
            .await?;
        count(queue, "delete");
        Ok(())
    }

    async fn reject(&self, queue: &str, id: i64, requeue: bool) -> Result<()> {
        if requeue {
            sqlx::query("SELECT msg_id FROM pgmq.set_vt($1, $2, 0)")
                .bind(queue)
                .bind(id)
                .execute(&self.pool)
                .await?;
            count(queue, "requeue");
        } else {
            sqlx::query("SELECT pgmq.archive($1, $2)")
                .bind(queue)
                .bind(id)
                .execute(&self.pool)
                .await?;
            count(queue, "archive");
        }
        Ok(())
    }
}
