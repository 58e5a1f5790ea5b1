//! Task bodies and how they report failure.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::{TaskId, TaskMessage};

/// Why a task body did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The body raised. Whether it is retried depends on whether the task
    /// type's policy lists `kind` as retryable.
    #[error("{kind}: {message}")]
    Failed { kind: String, message: String },

    /// The body refuses the task outright. Never retried; redelivered only
    /// if `requeue` is set.
    #[error("rejected: {reason}")]
    Reject { reason: String, requeue: bool },
}

impl TaskError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        TaskError::Failed {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Hard rejection without requeue.
    pub fn reject(reason: impl Into<String>) -> Self {
        TaskError::Reject {
            reason: reason.into(),
            requeue: false,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            TaskError::Failed { kind, .. } => kind,
            TaskError::Reject { .. } => "reject",
        }
    }
}

/// Input handed to a task body for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCall {
    pub id: TaskId,
    pub name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    /// Retries before this attempt.
    pub retries: u32,
}

impl From<&TaskMessage> for TaskCall {
    fn from(msg: &TaskMessage) -> Self {
        Self {
            id: msg.id.clone(),
            name: msg.name.clone(),
            args: msg.args.clone(),
            kwargs: msg.kwargs.clone(),
            retries: msg.retries,
        }
    }
}

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<Value, TaskError>> + Send>>;

/// A task body. Any `Fn(TaskCall) -> impl Future` closure qualifies.
pub trait TaskHandler: Send + Sync + 'static {
    fn call(&self, call: TaskCall) -> TaskFuture;
}

impl<F, Fut> TaskHandler for F
where
    F: Fn(TaskCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    fn call(&self, call: TaskCall) -> TaskFuture {
        Box::pin(self(call))
    }
}

/// Task bodies indexed by task name.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, handler: impl TaskHandler) -> Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}
