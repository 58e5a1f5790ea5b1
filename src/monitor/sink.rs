//! Notification sink: the human-readable trail of status changes.

use std::io::Write;

use serde_json::Value;

use crate::clock;
use crate::event::TaskEvent;
use crate::model::TaskRecord;

/// Receives every reconciled event together with the updated record.
///
/// Sinks observe only; they get a shared view of the record. `raw` is the
/// event as it arrived on the queue, fields the decoder ignores included.
pub trait NotificationSink {
    fn on_status_change(&mut self, record: &TaskRecord, event: &TaskEvent, raw: &Value);
}

/// One-line summary of a status change:
/// `[timestamp] EVENT_TYPE taskName (STATE=state, ID=id)`.
pub fn status_line(record: &TaskRecord, event: &TaskEvent) -> String {
    format!(
        "[{}] {} {} (STATE={}, ID={})",
        clock::display(record.timestamp.or(Some(event.timestamp))),
        event.kind.as_str().to_uppercase(),
        record.display_name(),
        record.state,
        record.id
    )
}

/// Full field dump of a record, one field per line.
pub fn record_details(record: &TaskRecord) -> Vec<String> {
    fn opt<T: std::fmt::Display>(value: &Option<T>) -> String {
        value
            .as_ref()
            .map_or_else(|| "None".to_string(), |v| v.to_string())
    }

    let mut lines = vec![
        "TASK DETAILS:".to_string(),
        format!("ID: {}", record.id),
        format!("Name: {}", record.display_name()),
        format!("State: {}", record.state),
        format!("Sent: {}", clock::display(record.sent_at)),
        format!("Received: {}", clock::display(record.received_at)),
        format!("Started: {}", clock::display(record.started_at)),
        format!("Rejected: {}", clock::display(record.rejected_at)),
        format!("Succeeded: {}", clock::display(record.succeeded_at)),
        format!("Failed: {}", clock::display(record.failed_at)),
        format!("Retried: {}", clock::display(record.retried_at)),
        format!("Revoked: {}", clock::display(record.revoked_at)),
        format!("args (arguments): {}", opt(&record.args)),
        format!("kwargs (keyword arguments): {}", opt(&record.kwargs)),
        format!("ETA (Estimated Time of Arrival): {}", clock::display(record.eta)),
        format!("Expires: {}", clock::display(record.expires)),
        format!("Retries: {}", record.retry_count),
        format!("Worker: {}", opt(&record.worker_id)),
        format!("Result: {}", opt(&record.result)),
        format!("Exception: {}", opt(&record.exception)),
        format!("Timestamp: {}", clock::display(record.timestamp)),
        format!("Runtime: {}", opt(&record.runtime)),
        format!("Traceback: {}", opt(&record.traceback)),
        format!("Exchange: {}", opt(&record.exchange)),
        format!("Routing Key: {}", opt(&record.routing_key)),
        format!("Clock: {}", record.logical_clock),
        format!("Root ID: {}", opt(&record.root_id)),
        format!("Parent ID: {}", opt(&record.parent_id)),
        "Children:".to_string(),
    ];
    lines.extend(record.children.iter().map(|child| format!("\t{child}")));
    lines
}

/// Writes status lines to any `Write`, stdout in the monitor binary.
pub struct ConsoleSink<W: Write> {
    out: W,
    verbose: bool,
}

impl ConsoleSink<std::io::Stdout> {
    pub fn stdout(verbose: bool) -> Self {
        Self::new(std::io::stdout(), verbose)
    }
}

impl<W: Write> ConsoleSink<W> {
    pub fn new(out: W, verbose: bool) -> Self {
        Self { out, verbose }
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_change(
        &mut self,
        record: &TaskRecord,
        event: &TaskEvent,
        raw: &Value,
    ) -> std::io::Result<()> {
        writeln!(self.out, "{}", status_line(record, event))?;
        if self.verbose {
            writeln!(self.out, "EVENT DETAILS: {raw}")?;
            for line in record_details(record) {
                writeln!(self.out, "{line}")?;
            }
        }
        self.out.flush()
    }
}

impl<W: Write> NotificationSink for ConsoleSink<W> {
    fn on_status_change(&mut self, record: &TaskRecord, event: &TaskEvent, raw: &Value) {
        if let Err(e) = self.write_change(record, event, raw) {
            tracing::warn!(task_id = %record.id, "failed to write status change: {e}");
        }
    }
}
