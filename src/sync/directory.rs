//! Local copy of the workspace directory (employees, projects, tasks and
//! time entries) served by the read API.

use std::fmt;

use rusqlite::Connection;

use crate::date_util::format_filter_timestamp;
use crate::error::{Error, Result};
use crate::mapper::{self, DirectoryProject, Employee, Task, TimeEntry};
use crate::notion::{Filter, Page, QueryRequest, Sort, TimestampKind};
use crate::storage::repository::{self, ReviewCategory};
use crate::sync::api_helpers::query_all;
use crate::sync::syncer::SyncContext;
use crate::sync::{CheckpointTracker, SyncOptions, SyncProgress, SyncReport};
use crate::validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryKind {
    Employees,
    Projects,
    Tasks,
    TimeEntries,
}

impl DirectoryKind {
    pub const ALL: [DirectoryKind; 4] = [
        DirectoryKind::Employees,
        DirectoryKind::Projects,
        DirectoryKind::Tasks,
        DirectoryKind::TimeEntries,
    ];

    /// Key in `sync_state`.
    pub fn as_str(&self) -> &'static str {
        match self {
            DirectoryKind::Employees => "employees",
            DirectoryKind::Projects => "projects",
            DirectoryKind::Tasks => "tasks",
            DirectoryKind::TimeEntries => "time_entries",
        }
    }

    fn database<'a>(&self, options: &'a SyncOptions) -> &'a str {
        match self {
            DirectoryKind::Employees => &options.employees_db,
            DirectoryKind::Projects => &options.projects_db,
            DirectoryKind::Tasks => &options.tasks_db,
            DirectoryKind::TimeEntries => &options.times_db,
        }
    }

    fn map(&self, page: &Page) -> Result<Record> {
        Ok(match self {
            DirectoryKind::Employees => Record::Employee(mapper::map_employee(page)?),
            DirectoryKind::Projects => Record::Project(mapper::map_directory_project(page)?),
            DirectoryKind::Tasks => Record::Task(mapper::map_task(page)?),
            DirectoryKind::TimeEntries => Record::Time(mapper::map_time_entry(page)?),
        })
    }
}

impl fmt::Display for DirectoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Record {
    Employee(Employee),
    Project(DirectoryProject),
    Task(Task),
    Time(TimeEntry),
}

impl Record {
    fn last_edited(&self) -> i64 {
        match self {
            Record::Employee(e) => e.last_edited_time.timestamp(),
            Record::Project(p) => p.last_edited_time.timestamp(),
            Record::Task(t) => t.last_edited_time.timestamp(),
            Record::Time(t) => t.last_edited_time.timestamp(),
        }
    }

    fn write(&self, conn: &Connection) -> rusqlite::Result<()> {
        match self {
            Record::Employee(e) => repository::upsert_employee(conn, e),
            Record::Project(p) => repository::upsert_directory_project(conn, p),
            Record::Task(t) => {
                repository::upsert_task(conn, t)?;
                let advisory = validate::task_advisory(t);
                validate::apply_review(conn, &t.id, ReviewCategory::Advisory, advisory.as_ref())
            }
            Record::Time(t) => {
                repository::upsert_time_entry(conn, t)?;
                let advisory = validate::time_advisory(t);
                validate::apply_review(conn, &t.id, ReviewCategory::Advisory, advisory.as_ref())
            }
        }
    }
}

/// Refresh every configured directory kind. Unconfigured kinds are skipped.
pub async fn refresh(
    ctx: SyncContext<'_>,
    options: &SyncOptions,
    progress: &dyn SyncProgress,
) -> Vec<SyncReport> {
    let mut reports = Vec::new();
    for kind in DirectoryKind::ALL {
        if kind.database(options).is_empty() {
            log::debug!("directory {kind}: no source database configured, skipping");
            continue;
        }
        let report = match refresh_kind(ctx, kind, options, progress).await {
            Ok(report) => report,
            Err(e) => {
                log::error!("Directory refresh of {kind} failed: {e}");
                SyncReport::failed(format!("directory:{kind}"), 0, e.to_string())
            }
        };
        progress.on_scope_complete(&report);
        reports.push(report);
    }
    reports
}

/// Pull rows of one kind edited since its checkpoint and store them together
/// with the new checkpoint.
pub async fn refresh_kind(
    ctx: SyncContext<'_>,
    kind: DirectoryKind,
    options: &SyncOptions,
    progress: &dyn SyncProgress,
) -> Result<SyncReport> {
    let scope = format!("directory:{kind}");
    let database_id = kind.database(options);
    if database_id.is_empty() {
        return Err(Error::Config(format!("no source database for {kind}")));
    }
    let lease = ctx.scopes.try_acquire(&scope).await?;
    let result = refresh_kind_locked(ctx, kind, database_id, options, progress).await;
    lease.release().await;
    result
}

async fn refresh_kind_locked(
    ctx: SyncContext<'_>,
    kind: DirectoryKind,
    database_id: &str,
    options: &SyncOptions,
    progress: &dyn SyncProgress,
) -> Result<SyncReport> {
    let scope = format!("directory:{kind}");
    progress.on_scope_start(&scope);

    let start = ctx
        .db
        .reader()
        .call(move |conn| repository::get_sync_state(conn, kind.as_str()))
        .await?;
    let job_id = ctx
        .db
        .writer()
        .call({
            let scope = scope.clone();
            move |conn| repository::insert_sync_job(conn, &scope, Some(start))
        })
        .await?;

    let request = QueryRequest::new()
        .filter(Filter::on_or_after(
            TimestampKind::LastEditedTime,
            format_filter_timestamp(start, options.timestamp_style),
        ))
        .sort(Sort::ascending(TimestampKind::LastEditedTime))
        .page_size(100);
    let pages = match query_all(ctx.workspace, database_id, &request).await {
        Ok(pages) => pages,
        Err(e) => {
            let message = e.to_string();
            ctx.db
                .writer()
                .call({
                    let message = message.clone();
                    move |conn| {
                        repository::update_sync_job(
                            conn,
                            job_id,
                            "failed",
                            0,
                            0,
                            Some(start),
                            Some(&message),
                        )
                    }
                })
                .await?;
            return Err(Error::Sync { scope, message });
        }
    };
    progress.on_records_fetched(&scope, pages.len());

    // Mapping failures keep their place in page order for the checkpoint.
    let outcomes: Vec<(String, std::result::Result<Record, String>)> = pages
        .iter()
        .map(|page| (page.id.clone(), kind.map(page).map_err(|e| e.to_string())))
        .collect();

    let (report, failures) = ctx
        .db
        .writer()
        .call({
            let scope = scope.clone();
            let mut tracker = CheckpointTracker::new(start, options.policy);
            move |conn| {
                let mut tx = conn.transaction()?;
                let mut synced: u64 = 0;
                let mut failures: Vec<(String, String)> = Vec::new();
                for (record_id, outcome) in outcomes {
                    // A row the store rejects is rolled back alone.
                    let stored = match outcome {
                        Ok(record) => {
                            let sp = tx.savepoint()?;
                            match record.write(&sp) {
                                Ok(()) => {
                                    sp.commit()?;
                                    Ok(record.last_edited())
                                }
                                Err(e) => Err(e.to_string()),
                            }
                        }
                        Err(message) => Err(message),
                    };
                    match stored {
                        Ok(edited) => {
                            synced += 1;
                            tracker.succeed(edited);
                        }
                        Err(message) => {
                            tracker.fail();
                            repository::insert_sync_error(
                                &tx,
                                None,
                                kind.as_str(),
                                &record_id,
                                &message,
                            )?;
                            failures.push((record_id, message));
                        }
                    }
                }

                let failed = failures.len() as u64;
                let after = tracker.value();
                let report = SyncReport::from_counts(scope, synced, failed, start, after);
                repository::advance_sync_state(&tx, kind.as_str(), after)?;
                repository::update_sync_job(
                    &tx,
                    job_id,
                    report.status.as_job_status(),
                    synced,
                    failed,
                    Some(after),
                    report.error.as_deref(),
                )?;
                tx.commit()?;
                Ok::<_, rusqlite::Error>((report, failures))
            }
        })
        .await?;

    for (record_id, message) in &failures {
        log::warn!("{scope}: record {record_id} failed: {message}");
        progress.on_record_failed(&scope, record_id, message);
    }
    let (synced, failed) = (report.items_synced, report.items_failed);
    log::info!(
        "{scope}: {synced} stored, {failed} failed, checkpoint {start} -> {}",
        report.checkpoint_after
    );
    Ok(report)
}
