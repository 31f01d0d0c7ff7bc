//! Durable queue of time reports waiting to be written to the source
//! time-tracking database.

use chrono::NaiveDate;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::notion::Workspace;
use crate::storage::repository::{self, NewOutboxEntry};
use crate::storage::Database;
use crate::sync::payload;
use crate::sync::rate_limit::retry_api;

/// Entries handled per flush.
const FLUSH_BATCH: u32 = 100;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlushReport {
    pub sent: usize,
    pub failed: usize,
}

/// Check and queue a time report. Returns the outbox row ID.
pub async fn enqueue(db: &Database, entry: NewOutboxEntry) -> Result<i64> {
    if entry.task_id.trim().is_empty() {
        return Err(Error::InvalidIdentifier("taskID is empty".into()));
    }
    if entry.employee_id.trim().is_empty() {
        return Err(Error::InvalidIdentifier("employeeID is empty".into()));
    }
    if entry.duration_secs <= 0 {
        return Err(Error::Other(format!(
            "duration must be positive, got {}",
            entry.duration_secs
        )));
    }
    let id = db
        .writer()
        .call(move |conn| repository::enqueue_outbox(conn, &entry))
        .await?;
    log::debug!("queued time report {id}");
    Ok(id)
}

/// Write every queued report as a time entry dated `work_date`.
///
/// A report leaves the queue only after its write succeeded; failures stay
/// queued with their attempt count and last error.
pub async fn flush(
    db: &Database,
    workspace: &dyn Workspace,
    times_db: &str,
    work_date: NaiveDate,
) -> Result<FlushReport> {
    if times_db.is_empty() {
        return Err(Error::Config("times_db is not configured".into()));
    }
    let entries = db
        .reader()
        .call(|conn| repository::list_outbox(conn, FLUSH_BATCH))
        .await?;
    let date = work_date.format("%Y-%m-%d").to_string();
    let mut report = FlushReport::default();

    for entry in entries {
        let props = payload::outbox_time_properties(&entry, &date);
        match retry_api!(workspace.create_page(times_db, &props, None, None)) {
            Ok(page_id) => {
                db.writer()
                    .call(move |conn| repository::delete_outbox(conn, entry.id))
                    .await?;
                log::info!("outbox {}: written as {page_id}", entry.id);
                report.sent += 1;
            }
            Err(e) => {
                let message = e.to_string();
                log::warn!("outbox {}: {message}", entry.id);
                db.writer()
                    .call(move |conn| repository::record_outbox_failure(conn, entry.id, &message))
                    .await?;
                report.failed += 1;
            }
        }
    }
    Ok(report)
}
