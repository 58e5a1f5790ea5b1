//! Lifecycle events: the only thing the worker side and the monitor share.
//!
//! Workers emit one event per task transition onto the event queue. The
//! monitor decodes them back into [`TaskEvent`] and reconciles them into
//! task records. Decoding also accepts the Celery field names so events from
//! Celery-shaped producers can be replayed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::model::{TaskId, TaskMessage};

/// Which transition an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    #[serde(alias = "task-sent")]
    Sent,
    #[serde(alias = "task-received")]
    Received,
    #[serde(alias = "task-started")]
    Started,
    #[serde(alias = "task-succeeded")]
    Succeeded,
    #[serde(alias = "task-failed")]
    Failed,
    #[serde(alias = "task-rejected")]
    Rejected,
    #[serde(alias = "task-retried")]
    Retried,
    #[serde(alias = "task-revoked")]
    Revoked,
}

impl EventType {
    pub const ALL: [EventType; 8] = [
        EventType::Sent,
        EventType::Received,
        EventType::Started,
        EventType::Succeeded,
        EventType::Failed,
        EventType::Rejected,
        EventType::Retried,
        EventType::Revoked,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Sent => "sent",
            EventType::Received => "received",
            EventType::Started => "started",
            EventType::Succeeded => "succeeded",
            EventType::Failed => "failed",
            EventType::Rejected => "rejected",
            EventType::Retried => "retried",
            EventType::Revoked => "revoked",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical lifecycle event, independent of wire encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    #[serde(rename = "type")]
    pub kind: EventType,
    #[serde(alias = "uuid")]
    pub task_id: TaskId,
    #[serde(default, alias = "name", skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    pub timestamp: f64,
    #[serde(alias = "clock")]
    pub logical_clock: u64,
    #[serde(default, alias = "hostname", skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kwargs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<f64>,
    /// Retries already performed, as known to the emitter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Set on rejections: whether the broker may redeliver the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeue: Option<bool>,
    #[serde(default, alias = "routing_key", skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,
    #[serde(default, alias = "root_id", skip_serializing_if = "Option::is_none")]
    pub root_id: Option<TaskId>,
    #[serde(default, alias = "parent_id", skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<TaskId>,
}

impl TaskEvent {
    /// A bare event stamped with the current wall-clock time.
    pub fn new(kind: EventType, task_id: impl Into<TaskId>, logical_clock: u64) -> Self {
        Self {
            kind,
            task_id: task_id.into(),
            task_name: None,
            timestamp: crate::clock::now(),
            logical_clock,
            worker_id: None,
            args: None,
            kwargs: None,
            eta: None,
            expires: None,
            result: None,
            exception: None,
            traceback: None,
            runtime: None,
            retries: None,
            requeue: None,
            routing_key: None,
            exchange: None,
            root_id: None,
            parent_id: None,
        }
    }

    /// Decode a raw broker payload.
    pub fn decode(raw: &Value) -> Result<Self> {
        Ok(Self::deserialize(raw)?)
    }

    pub fn encode(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Copy the submission metadata of a task message into this event.
    pub fn describing(mut self, msg: &TaskMessage) -> Self {
        self.task_name = Some(msg.name.clone());
        self.args = Some(Value::from(msg.args.clone()));
        self.kwargs = Some(Value::Object(msg.kwargs.clone()));
        self.eta = msg.eta;
        self.expires = msg.expires;
        self.retries = Some(msg.retries);
        self.root_id = msg.root_id.clone();
        self.parent_id = msg.parent_id.clone();
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.task_name = Some(name.into());
        self
    }

    pub fn at(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn args(mut self, args: Value) -> Self {
        self.args = Some(args);
        self
    }

    pub fn kwargs(mut self, kwargs: Value) -> Self {
        self.kwargs = Some(kwargs);
        self
    }

    pub fn result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }

    pub fn traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    pub fn runtime(mut self, seconds: f64) -> Self {
        self.runtime = Some(seconds);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn requeue(mut self, requeue: bool) -> Self {
        self.requeue = Some(requeue);
        self
    }

    pub fn routing(mut self, exchange: Option<String>, routing_key: impl Into<String>) -> Self {
        self.exchange = exchange;
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn parent(mut self, parent_id: impl Into<TaskId>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn root(mut self, root_id: impl Into<TaskId>) -> Self {
        self.root_id = Some(root_id.into());
        self
    }
}
