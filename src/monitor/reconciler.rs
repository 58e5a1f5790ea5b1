//! State reconciler: folds lifecycle events into per-task records.
//!
//! Events may arrive duplicated or out of order. Each record field is merged
//! by logical clock rather than arrival order, so any delivery order of the
//! same event set produces the same record, and replaying an event is a
//! no-op.
//!
//! The reconciler observes; it does not enforce. An event that violates the
//! transition table is still applied and reported as an [`Anomaly`].

use std::collections::HashMap;

use crate::event::{EventType, TaskEvent};
use crate::model::{FieldClocks, TaskId, TaskRecord, TaskState};

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// In-memory table of task records. Grows for the life of the process.
#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: HashMap<TaskId, TaskRecord>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskRecord> {
        self.tasks.get(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tasks.values()
    }

    pub fn by_state(&self, state: TaskState) -> Vec<&TaskRecord> {
        self.tasks.values().filter(|t| t.state == state).collect()
    }

    /// Look up a record, creating a blank one on first reference.
    fn entry(&mut self, id: &TaskId) -> (&mut TaskRecord, bool) {
        let created = !self.tasks.contains_key(id);
        let record = self
            .tasks
            .entry(id.clone())
            .or_insert_with(|| TaskRecord::new(id.clone()));
        (record, created)
    }
}

// ---------------------------------------------------------------------------
// Transition table
// ---------------------------------------------------------------------------

/// How one event type moves a record.
struct Transition {
    kind: EventType,
    /// State the record takes when this event is the newest seen.
    state: TaskState,
    /// Expected state before the event.
    accepts: fn(TaskState) -> bool,
    /// Event-specific field updates.
    apply: fn(&mut TaskRecord, &TaskEvent),
}

static TRANSITIONS: [Transition; 8] = [
    Transition {
        kind: EventType::Sent,
        state: TaskState::Pending,
        accepts: is_pending,
        apply: on_sent,
    },
    Transition {
        kind: EventType::Received,
        state: TaskState::Received,
        accepts: is_live,
        apply: on_received,
    },
    Transition {
        kind: EventType::Started,
        state: TaskState::Started,
        accepts: is_received_or_retried,
        apply: on_started,
    },
    Transition {
        kind: EventType::Succeeded,
        state: TaskState::Succeeded,
        accepts: is_started,
        apply: on_outcome,
    },
    Transition {
        kind: EventType::Failed,
        state: TaskState::Failed,
        accepts: is_started,
        apply: on_outcome,
    },
    Transition {
        kind: EventType::Rejected,
        state: TaskState::Rejected,
        accepts: is_received_or_started,
        apply: on_outcome,
    },
    Transition {
        kind: EventType::Retried,
        state: TaskState::Retried,
        accepts: is_failed,
        apply: on_retried,
    },
    Transition {
        kind: EventType::Revoked,
        state: TaskState::Revoked,
        accepts: is_live,
        apply: on_revoked,
    },
];

fn transition_for(kind: EventType) -> &'static Transition {
    TRANSITIONS
        .iter()
        .find(|t| t.kind == kind)
        .unwrap_or_else(|| unreachable!("transition table covers every event type"))
}

fn is_pending(state: TaskState) -> bool {
    state == TaskState::Pending
}

fn is_live(state: TaskState) -> bool {
    !state.is_terminal()
}

fn is_received_or_retried(state: TaskState) -> bool {
    matches!(state, TaskState::Received | TaskState::Retried)
}

fn is_started(state: TaskState) -> bool {
    state == TaskState::Started
}

fn is_received_or_started(state: TaskState) -> bool {
    matches!(state, TaskState::Received | TaskState::Started)
}

fn is_failed(state: TaskState) -> bool {
    state == TaskState::Failed
}

// ---------------------------------------------------------------------------
// Per-event field updates
// ---------------------------------------------------------------------------

fn on_sent(record: &mut TaskRecord, event: &TaskEvent) {
    merge_submission(record, event);
}

fn on_received(record: &mut TaskRecord, event: &TaskEvent) {
    merge_submission(record, event);
    merge_worker(record, event);
}

fn on_started(record: &mut TaskRecord, event: &TaskEvent) {
    merge_worker(record, event);
}

fn on_outcome(record: &mut TaskRecord, event: &TaskEvent) {
    merge_worker(record, event);
    merge_outcome(record, event);
}

fn on_retried(record: &mut TaskRecord, event: &TaskEvent) {
    record.clocks.retried.insert(event.logical_clock);
    merge_worker(record, event);
    merge_outcome(record, event);
}

fn on_revoked(_record: &mut TaskRecord, _event: &TaskEvent) {}

/// First write wins, by logical clock.
fn merge_earliest<T: Clone>(
    slot: &mut Option<T>,
    value: &Option<T>,
    register: &'static str,
    record_clocks: &mut FieldClocks,
    clock: u64,
) {
    if value.is_some() && record_clocks.claim_earliest(register, clock) {
        slot.clone_from(value);
    }
}

fn merge_submission(record: &mut TaskRecord, event: &TaskEvent) {
    let clock = event.logical_clock;
    let c = &mut record.clocks;
    merge_earliest(&mut record.name, &event.task_name, "name", c, clock);
    merge_earliest(&mut record.args, &event.args, "args", c, clock);
    merge_earliest(&mut record.kwargs, &event.kwargs, "kwargs", c, clock);
    merge_earliest(&mut record.eta, &event.eta, "eta", c, clock);
    merge_earliest(&mut record.expires, &event.expires, "expires", c, clock);
    merge_earliest(&mut record.routing_key, &event.routing_key, "routing_key", c, clock);
    merge_earliest(&mut record.exchange, &event.exchange, "exchange", c, clock);
    merge_earliest(&mut record.root_id, &event.root_id, "root_id", c, clock);
    merge_earliest(&mut record.parent_id, &event.parent_id, "parent_id", c, clock);
}

fn merge_worker(record: &mut TaskRecord, event: &TaskEvent) {
    if event.worker_id.is_some() && record.clocks.claim_latest("worker", event.logical_clock) {
        record.worker_id.clone_from(&event.worker_id);
    }
}

/// Outcome fields move together so a success never carries a stale
/// exception and a failure never carries a stale result.
fn merge_outcome(record: &mut TaskRecord, event: &TaskEvent) {
    if !record.clocks.claim_latest("outcome", event.logical_clock) {
        return;
    }
    record.result.clone_from(&event.result);
    record.exception.clone_from(&event.exception);
    record.traceback.clone_from(&event.traceback);
    record.runtime = event.runtime;
    record.requeue = match event.kind {
        EventType::Rejected => Some(event.requeue.unwrap_or(false)),
        _ => None,
    };
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// What applying an event did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyKind {
    /// The event created the record.
    Created,
    /// The event updated an existing record.
    Updated,
    /// Exact replay of an event already applied; nothing changed.
    Duplicate,
}

/// A transition the task semantics do not allow. Reported, never raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    UnexpectedTransition { from: TaskState, event: EventType },
    RetryLimitExceeded { retries: u32, max: u32 },
    /// A task rejected without requeue was delivered again.
    RedeliveredAfterReject,
}

impl std::fmt::Display for Anomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Anomaly::UnexpectedTransition { from, event } => {
                write!(f, "unexpected {event} event in state {from}")
            }
            Anomaly::RetryLimitExceeded { retries, max } => {
                write!(f, "retry count {retries} exceeds configured maximum {max}")
            }
            Anomaly::RedeliveredAfterReject => {
                write!(f, "received again after rejection without requeue")
            }
        }
    }
}

impl Anomaly {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Anomaly::UnexpectedTransition { .. } => "unexpected_transition",
            Anomaly::RetryLimitExceeded { .. } => "retry_limit_exceeded",
            Anomaly::RedeliveredAfterReject => "redelivered_after_reject",
        }
    }
}

/// Result of [`Reconciler::apply`].
#[derive(Debug)]
pub struct Applied<'a> {
    pub record: &'a TaskRecord,
    pub kind: ApplyKind,
    pub anomalies: Vec<Anomaly>,
}

/// Retry budgets known to the monitor.
#[derive(Debug, Default)]
struct RetryLimits {
    by_name: HashMap<String, u32>,
    default: Option<u32>,
}

impl RetryLimits {
    /// Budget of a task type. Unknown until the record has a name.
    fn for_name(&self, name: Option<&str>) -> Option<u32> {
        let name = name?;
        self.by_name.get(name).copied().or(self.default)
    }
}

/// Applies lifecycle events to the [`TaskStore`].
#[derive(Debug, Default)]
pub struct Reconciler {
    store: TaskStore,
    retry_limits: RetryLimits,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Known retry budgets per task name, used only to flag anomalies.
    pub fn with_retry_limits(mut self, limits: HashMap<String, u32>) -> Self {
        self.retry_limits.by_name = limits;
        self
    }

    /// Budget for task names without a limit of their own.
    pub fn with_default_retry_limit(mut self, max: u32) -> Self {
        self.retry_limits.default = Some(max);
        self
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskRecord> {
        self.store.get(id)
    }

    /// Apply one event and return the updated record.
    pub fn apply(&mut self, event: &TaskEvent) -> Applied<'_> {
        let clock = event.logical_clock;

        if let Some(parent_id) = event.parent_id.as_ref().filter(|p| **p != event.task_id) {
            let (parent, _) = self.store.entry(parent_id);
            parent.children.insert(event.task_id.clone());
        }

        let (record, created) = self.store.entry(&event.task_id);

        if !record.clocks.seen.insert((event.kind, clock)) {
            return Applied {
                record,
                kind: ApplyKind::Duplicate,
                anomalies: Vec::new(),
            };
        }

        let transition = transition_for(event.kind);
        let previous = record.state;
        let newest = record.clocks.is_newer("state", clock);

        // A failure with no budget left is as final as a success.
        let limit = self.retry_limits.for_name(record.name.as_deref());
        let after_final_failure = previous == TaskState::Failed
            && limit.is_some()
            && record.is_finished(limit)
            && matches!(event.kind, EventType::Received | EventType::Revoked);

        let mut anomalies = Vec::new();
        if newest {
            if previous == TaskState::Rejected && event.kind == EventType::Received {
                // A requeued rejection is expected to come back.
                if record.requeue != Some(true) {
                    anomalies.push(Anomaly::RedeliveredAfterReject);
                }
            } else if after_final_failure || !(transition.accepts)(previous) {
                anomalies.push(Anomaly::UnexpectedTransition {
                    from: previous,
                    event: event.kind,
                });
            }
        }

        (transition.apply)(record, event);

        if record.clocks.claim_latest(event.kind.as_str(), clock) {
            *record.stamp_mut(event.kind) = Some(event.timestamp);
        }
        if record.clocks.claim_latest("state", clock) {
            record.state = transition.state;
            record.timestamp = Some(event.timestamp);
        }

        if let Some(reported) = event.retries {
            record.clocks.reported_retries = record.clocks.reported_retries.max(reported);
        }
        let counted = u32::try_from(record.clocks.retried.len()).unwrap_or(u32::MAX);
        record.retry_count = counted.max(record.clocks.reported_retries);

        // Name and count may arrive on different events, in any order.
        if !record.clocks.limit_flagged {
            let limit = self.retry_limits.for_name(record.name.as_deref());
            if let Some(max) = limit.filter(|&max| record.retry_count > max) {
                record.clocks.limit_flagged = true;
                anomalies.push(Anomaly::RetryLimitExceeded {
                    retries: record.retry_count,
                    max,
                });
            }
        }

        record.logical_clock = record.logical_clock.max(clock);

        Applied {
            record,
            kind: if created {
                ApplyKind::Created
            } else {
                ApplyKind::Updated
            },
            anomalies,
        }
    }
}
