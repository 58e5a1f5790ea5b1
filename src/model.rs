//! Core data model.
//!
//! A task is a unit of work dispatched through the broker. Workers see it as
//! a [`TaskMessage`]; the monitor sees it as a [`TaskRecord`] rebuilt from
//! lifecycle events.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use uuid::Uuid;

use crate::event::EventType;

// ---------------------------------------------------------------------------
// Task Id
// ---------------------------------------------------------------------------

/// Opaque task identifier, assigned at submission and stable for the task's
/// whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a task as reconstructed by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Submitted, not yet picked up by a worker.
    #[default]
    Pending,
    /// Delivered to a worker.
    Received,
    /// Task body running.
    Started,
    /// Done successfully. Terminal.
    Succeeded,
    /// Task body raised. Terminal once the retry budget is spent.
    Failed,
    /// Refused by the worker, not redelivered. Terminal.
    Rejected,
    /// Failed attempt scheduled to run again.
    Retried,
    /// Cancelled. Terminal.
    Revoked,
}

impl TaskState {
    /// Terminal regardless of retry budget.
    ///
    /// `Failed` is left out: whether it is final depends on the retry policy
    /// of the task type, see [`TaskRecord::is_finished`].
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Rejected | TaskState::Revoked
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Pending => "PENDING",
            TaskState::Received => "RECEIVED",
            TaskState::Started => "STARTED",
            TaskState::Succeeded => "SUCCEEDED",
            TaskState::Failed => "FAILED",
            TaskState::Rejected => "REJECTED",
            TaskState::Retried => "RETRIED",
            TaskState::Revoked => "REVOKED",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Task Record
// ---------------------------------------------------------------------------

/// Per-task status record owned by the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: Option<String>,
    pub state: TaskState,

    pub sent_at: Option<f64>,
    pub received_at: Option<f64>,
    pub started_at: Option<f64>,
    pub succeeded_at: Option<f64>,
    pub failed_at: Option<f64>,
    pub rejected_at: Option<f64>,
    pub retried_at: Option<f64>,
    pub revoked_at: Option<f64>,
    /// Wall-clock time of the newest applied event.
    pub timestamp: Option<f64>,

    pub args: Option<Value>,
    pub kwargs: Option<Value>,
    pub eta: Option<f64>,
    pub expires: Option<f64>,

    pub retry_count: u32,
    pub worker_id: Option<String>,

    pub result: Option<Value>,
    pub exception: Option<String>,
    pub traceback: Option<String>,
    /// Seconds spent in the task body, reported on success.
    pub runtime: Option<f64>,
    /// Requeue flag of the last rejection, if the outcome is a rejection.
    pub requeue: Option<bool>,

    pub routing_key: Option<String>,
    pub exchange: Option<String>,

    pub logical_clock: u64,

    pub root_id: Option<TaskId>,
    pub parent_id: Option<TaskId>,
    pub children: BTreeSet<TaskId>,

    #[serde(skip)]
    pub(crate) clocks: FieldClocks,
}

impl TaskRecord {
    /// Blank record in `PENDING`, as created by the first event that
    /// references `id`.
    pub fn new(id: TaskId) -> Self {
        Self {
            id,
            name: None,
            state: TaskState::Pending,
            sent_at: None,
            received_at: None,
            started_at: None,
            succeeded_at: None,
            failed_at: None,
            rejected_at: None,
            retried_at: None,
            revoked_at: None,
            timestamp: None,
            args: None,
            kwargs: None,
            eta: None,
            expires: None,
            retry_count: 0,
            worker_id: None,
            result: None,
            exception: None,
            traceback: None,
            runtime: None,
            requeue: None,
            routing_key: None,
            exchange: None,
            logical_clock: 0,
            root_id: None,
            parent_id: None,
            children: BTreeSet::new(),
            clocks: FieldClocks::default(),
        }
    }

    /// Name for display; records created only as a chain parent have none yet.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unknown>")
    }

    /// Whether no further lifecycle events are expected.
    ///
    /// `max_retries` is the task type's retry budget; `None` treats every
    /// failure as final.
    pub fn is_finished(&self, max_retries: Option<u32>) -> bool {
        match self.state {
            TaskState::Failed => max_retries.is_none_or(|max| self.retry_count >= max),
            state => state.is_terminal(),
        }
    }

    /// The timestamp slot that records events of `kind`.
    pub(crate) fn stamp_mut(&mut self, kind: EventType) -> &mut Option<f64> {
        match kind {
            EventType::Sent => &mut self.sent_at,
            EventType::Received => &mut self.received_at,
            EventType::Started => &mut self.started_at,
            EventType::Succeeded => &mut self.succeeded_at,
            EventType::Failed => &mut self.failed_at,
            EventType::Rejected => &mut self.rejected_at,
            EventType::Retried => &mut self.retried_at,
            EventType::Revoked => &mut self.revoked_at,
        }
    }
}

/// Logical-clock bookkeeping behind a [`TaskRecord`].
///
/// Every field group is a register tagged with the clock of the event that
/// last wrote it, so the merged record does not depend on arrival order.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct FieldClocks {
    registers: BTreeMap<&'static str, u64>,
    pub(crate) seen: BTreeSet<(EventType, u64)>,
    pub(crate) retried: BTreeSet<u64>,
    pub(crate) reported_retries: u32,
    /// Retry-limit anomaly already reported for this record.
    pub(crate) limit_flagged: bool,
}

impl FieldClocks {
    /// Would an event at `clock` win a newest-wins register?
    pub(crate) fn is_newer(&self, register: &'static str, clock: u64) -> bool {
        self.registers.get(register).is_none_or(|&held| clock > held)
    }

    /// Claim a newest-wins register for `clock`. Returns whether it won.
    pub(crate) fn claim_latest(&mut self, register: &'static str, clock: u64) -> bool {
        let won = self.is_newer(register, clock);
        if won {
            self.registers.insert(register, clock);
        }
        won
    }

    /// Claim an earliest-wins register for `clock`. Returns whether it won.
    pub(crate) fn claim_earliest(&mut self, register: &'static str, clock: u64) -> bool {
        let won = self.registers.get(register).is_none_or(|&held| clock < held);
        if won {
            self.registers.insert(register, clock);
        }
        won
    }
}

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// A task invocation that has not been dispatched yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    /// Delay before the task becomes visible to workers.
    #[serde(default)]
    pub countdown: Option<Duration>,
    /// Lifetime after dispatch; an expired task is revoked instead of run.
    #[serde(default)]
    pub expires_in: Option<Duration>,
}

impl Signature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            countdown: None,
            expires_in: None,
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn countdown(mut self, delay: Duration) -> Self {
        self.countdown = Some(delay);
        self
    }

    pub fn expires_in(mut self, lifetime: Duration) -> Self {
        self.expires_in = Some(lifetime);
        self
    }

    /// Merge an upstream result into this signature's input.
    ///
    /// The result becomes the first positional argument.
    pub fn with_upstream_result(mut self, result: Value) -> Self {
        self.args.insert(0, result);
        self
    }
}

// ---------------------------------------------------------------------------
// Task Message
// ---------------------------------------------------------------------------

/// The broker payload for one task attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: TaskId,
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    /// Attempts already retried. Authoritative across workers.
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub eta: Option<f64>,
    #[serde(default)]
    pub expires: Option<f64>,
    /// Lamport clock of the publisher when this message was sent.
    #[serde(default)]
    pub clock: u64,
    #[serde(default)]
    pub root_id: Option<TaskId>,
    #[serde(default)]
    pub parent_id: Option<TaskId>,
    /// Follow-up invoked with this task's result once it succeeds.
    #[serde(default)]
    pub link: Option<Box<Signature>>,
}

impl TaskMessage {
    pub fn is_expired(&self, now: f64) -> bool {
        self.expires.is_some_and(|expires| now >= expires)
    }

    /// The message for the next attempt after a retryable failure.
    pub fn next_attempt(&self, clock: u64) -> Self {
        Self {
            retries: self.retries + 1,
            clock,
            ..self.clone()
        }
    }
}
