use std::fmt;
use std::str::FromStr;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::date_util::date_key_from_iso;
use crate::mapper::{DirectoryProject, Employee, EntityKind, Task, TimeEntry};

// ── Config ─────────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))",
        params![key, value],
    )?;
    Ok(())
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Projects ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectRecord {
    pub project_id: String,
    pub name: String,
    pub internal_id: String,
    pub tasks_db_id: String,
    pub time_db_id: String,
    pub workers_db_id: Option<String>,
    pub tasks_last_synced: i64,
    pub time_last_synced: i64,
    pub added_at: String,
}

impl ProjectRecord {
    pub fn checkpoint(&self, kind: EntityKind) -> i64 {
        match kind {
            EntityKind::Task => self.tasks_last_synced,
            EntityKind::TimeEntry => self.time_last_synced,
        }
    }

    /// Lease / job scope for one entity kind of this project.
    pub fn scope(&self, kind: EntityKind) -> String {
        format!("project:{}:{}", self.project_id, kind.scope_suffix())
    }
}

fn project_from_row(row: &Row<'_>) -> Result<ProjectRecord, rusqlite::Error> {
    Ok(ProjectRecord {
        project_id: row.get(0)?,
        name: row.get(1)?,
        internal_id: row.get(2)?,
        tasks_db_id: row.get(3)?,
        time_db_id: row.get(4)?,
        workers_db_id: row.get(5)?,
        tasks_last_synced: row.get(6)?,
        time_last_synced: row.get(7)?,
        added_at: row.get(8)?,
    })
}

const PROJECT_COLUMNS: &str = "project_id, name, internal_id, tasks_db_id, time_db_id,
    workers_db_id, tasks_last_synced, time_last_synced, added_at";

/// Register or re-register a mirror scope. Re-registering keeps the
/// existing checkpoints unless the new ones are later.
pub fn upsert_project(conn: &Connection, p: &ProjectRecord) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO projects (
            project_id, name, internal_id, tasks_db_id, time_db_id, workers_db_id,
            tasks_last_synced, time_last_synced, added_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, datetime('now'))
        ON CONFLICT(project_id) DO UPDATE SET
            name=excluded.name, internal_id=excluded.internal_id,
            tasks_db_id=excluded.tasks_db_id, time_db_id=excluded.time_db_id,
            workers_db_id=excluded.workers_db_id,
            tasks_last_synced=MAX(projects.tasks_last_synced, excluded.tasks_last_synced),
            time_last_synced=MAX(projects.time_last_synced, excluded.time_last_synced)",
        params![
            p.project_id,
            p.name,
            p.internal_id,
            p.tasks_db_id,
            p.time_db_id,
            p.workers_db_id,
            p.tasks_last_synced,
            p.time_last_synced,
        ],
    )?;
    Ok(())
}

pub fn remove_project(conn: &Connection, project_id: &str) -> Result<bool, rusqlite::Error> {
    let count = conn.execute(
        "DELETE FROM projects WHERE project_id = ?1",
        params![project_id],
    )?;
    Ok(count > 0)
}

pub fn list_projects(conn: &Connection) -> Result<Vec<ProjectRecord>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROJECT_COLUMNS} FROM projects ORDER BY added_at, project_id"
    ))?;
    let rows = stmt.query_map([], project_from_row)?;
    rows.collect()
}

pub fn get_project(
    conn: &Connection,
    project_id: &str,
) -> Result<Option<ProjectRecord>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE project_id = ?1"),
        params![project_id],
        project_from_row,
    )
    .optional()
}

/// Move a project checkpoint forward. Never moves it backwards.
pub fn advance_project_checkpoint(
    conn: &Connection,
    project_id: &str,
    kind: EntityKind,
    checkpoint: i64,
) -> Result<(), rusqlite::Error> {
    let sql = match kind {
        EntityKind::Task => {
            "UPDATE projects SET tasks_last_synced = MAX(tasks_last_synced, ?2) WHERE project_id = ?1"
        }
        EntityKind::TimeEntry => {
            "UPDATE projects SET time_last_synced = MAX(time_last_synced, ?2) WHERE project_id = ?1"
        }
    };
    conn.execute(sql, params![project_id, checkpoint])?;
    Ok(())
}

// ── ID map ─────────────────────────────────────────────────────────

pub fn get_client_id(
    conn: &Connection,
    internal_id: &str,
) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT client_id FROM id_map WHERE internal_id = ?1",
        params![internal_id],
        |row| row.get(0),
    )
    .optional()
}

pub fn get_internal_id(
    conn: &Connection,
    client_id: &str,
) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT internal_id FROM id_map WHERE client_id = ?1",
        params![client_id],
        |row| row.get(0),
    )
    .optional()
}

/// Insert a mapping if `internal_id` has none. Returns false when a mapping
/// already existed (the table is left untouched).
pub fn insert_mapping(
    conn: &Connection,
    internal_id: &str,
    client_id: &str,
) -> Result<bool, rusqlite::Error> {
    let count = conn.execute(
        "INSERT OR IGNORE INTO id_map (internal_id, client_id, created_at)
         VALUES (?1, ?2, datetime('now'))",
        params![internal_id, client_id],
    )?;
    Ok(count > 0)
}

pub fn count_mappings(conn: &Connection) -> Result<i64, rusqlite::Error> {
    conn.query_row("SELECT COUNT(*) FROM id_map", [], |row| row.get(0))
}

// ── Review rows ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewCategory {
    Validation,
    Advisory,
}

impl ReviewCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewCategory::Validation => "validation",
            ReviewCategory::Advisory => "advisory",
        }
    }
}

impl fmt::Display for ReviewCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validation" => Ok(ReviewCategory::Validation),
            "advisory" => Ok(ReviewCategory::Advisory),
            other => Err(format!("unknown review category '{other}'")),
        }
    }
}

/// A record flagged for operator follow-up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewRow {
    pub internal_id: String,
    pub category: ReviewCategory,
    pub entity_type: String,
    pub client_id: Option<String>,
    pub project_id: Option<String>,
    pub title: String,
    pub errors: String,
    pub employee_id: Option<String>,
    pub employee_name: Option<String>,
    pub updated_at: String,
    pub notified_at: Option<String>,
}

/// Insert or refresh a review row keyed by `(internal_id, category)`.
///
/// `notified_at` survives when the error text is unchanged and is cleared
/// when it changes, so edited problems are reported again.
pub fn upsert_review_row(conn: &Connection, r: &ReviewRow) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO review_rows (
            internal_id, category, entity_type, client_id, project_id, title,
            errors, employee_id, employee_name, updated_at, notified_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, datetime('now'), NULL)
        ON CONFLICT(internal_id, category) DO UPDATE SET
            entity_type=excluded.entity_type,
            client_id=COALESCE(excluded.client_id, review_rows.client_id),
            project_id=COALESCE(excluded.project_id, review_rows.project_id),
            title=excluded.title,
            employee_id=excluded.employee_id,
            employee_name=COALESCE(excluded.employee_name, review_rows.employee_name),
            notified_at=CASE WHEN review_rows.errors = excluded.errors
                             THEN review_rows.notified_at ELSE NULL END,
            errors=excluded.errors,
            updated_at=excluded.updated_at",
        params![
            r.internal_id,
            r.category.as_str(),
            r.entity_type,
            r.client_id,
            r.project_id,
            r.title,
            r.errors,
            r.employee_id,
            r.employee_name,
        ],
    )?;
    Ok(())
}

pub fn clear_review_row(
    conn: &Connection,
    internal_id: &str,
    category: ReviewCategory,
) -> Result<bool, rusqlite::Error> {
    let count = conn.execute(
        "DELETE FROM review_rows WHERE internal_id = ?1 AND category = ?2",
        params![internal_id, category.as_str()],
    )?;
    Ok(count > 0)
}

fn review_from_row(row: &Row<'_>) -> Result<ReviewRow, rusqlite::Error> {
    let category: String = row.get(1)?;
    Ok(ReviewRow {
        internal_id: row.get(0)?,
        category: category.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?,
        entity_type: row.get(2)?,
        client_id: row.get(3)?,
        project_id: row.get(4)?,
        title: row.get(5)?,
        errors: row.get(6)?,
        employee_id: row.get(7)?,
        employee_name: row.get(8)?,
        updated_at: row.get(9)?,
        notified_at: row.get(10)?,
    })
}

pub fn list_review_rows(
    conn: &Connection,
    pending_only: bool,
) -> Result<Vec<ReviewRow>, rusqlite::Error> {
    let filter = if pending_only {
        "WHERE notified_at IS NULL"
    } else {
        ""
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT internal_id, category, entity_type, client_id, project_id, title,
                errors, employee_id, employee_name, updated_at, notified_at
         FROM review_rows {filter}
         ORDER BY employee_id, category, updated_at, internal_id"
    ))?;
    let rows = stmt.query_map([], review_from_row)?;
    rows.collect()
}

pub fn mark_review_notified(
    conn: &Connection,
    keys: &[(String, ReviewCategory)],
) -> Result<(), rusqlite::Error> {
    let mut stmt = conn.prepare(
        "UPDATE review_rows SET notified_at = datetime('now')
         WHERE internal_id = ?1 AND category = ?2",
    )?;
    for (id, category) in keys {
        stmt.execute(params![id, category.as_str()])?;
    }
    Ok(())
}

// ── Sync errors & jobs ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct SyncErrorRow {
    pub id: i64,
    pub project_id: Option<String>,
    pub entity_type: String,
    pub record_id: String,
    pub message: String,
    pub occurred_at: String,
}

pub fn insert_sync_error(
    conn: &Connection,
    project_id: Option<&str>,
    entity_type: &str,
    record_id: &str,
    message: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_errors (project_id, entity_type, record_id, message, occurred_at)
         VALUES (?1, ?2, ?3, ?4, datetime('now'))",
        params![project_id, entity_type, record_id, message],
    )?;
    Ok(())
}

pub fn list_sync_errors(
    conn: &Connection,
    limit: u32,
) -> Result<Vec<SyncErrorRow>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, project_id, entity_type, record_id, message, occurred_at
         FROM sync_errors ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], |row| {
        Ok(SyncErrorRow {
            id: row.get(0)?,
            project_id: row.get(1)?,
            entity_type: row.get(2)?,
            record_id: row.get(3)?,
            message: row.get(4)?,
            occurred_at: row.get(5)?,
        })
    })?;
    rows.collect()
}

pub fn insert_sync_job(
    conn: &Connection,
    scope: &str,
    checkpoint_before: Option<i64>,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_jobs (scope, status, started_at, checkpoint_before)
         VALUES (?1, 'running', datetime('now'), ?2)",
        params![scope, checkpoint_before],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update_sync_job(
    conn: &Connection,
    job_id: i64,
    status: &str,
    synced_items: u64,
    failed_items: u64,
    checkpoint_after: Option<i64>,
    error_message: Option<&str>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE sync_jobs SET
            status = ?2, completed_at = datetime('now'),
            synced_items = ?3, failed_items = ?4,
            checkpoint_after = ?5, error_message = ?6
         WHERE id = ?1",
        params![
            job_id,
            status,
            synced_items as i64,
            failed_items as i64,
            checkpoint_after,
            error_message,
        ],
    )?;
    Ok(())
}

// ── Sync leases ────────────────────────────────────────────────────

/// Take `scope` for `holder` unless another holder has an unexpired row.
/// Returns whether the lease was granted.
pub fn try_acquire_lease(
    conn: &Connection,
    scope: &str,
    holder: &str,
    now: i64,
    ttl_secs: i64,
) -> Result<bool, rusqlite::Error> {
    let changed = conn.execute(
        "INSERT INTO sync_leases (scope, holder, acquired_at, expires_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(scope) DO UPDATE SET
            holder = excluded.holder,
            acquired_at = excluded.acquired_at,
            expires_at = excluded.expires_at
         WHERE sync_leases.expires_at <= excluded.acquired_at",
        params![scope, holder, now, now + ttl_secs],
    )?;
    Ok(changed == 1)
}

/// Push the expiry of a held lease forward. False if `holder` lost it.
pub fn renew_lease(
    conn: &Connection,
    scope: &str,
    holder: &str,
    now: i64,
    ttl_secs: i64,
) -> Result<bool, rusqlite::Error> {
    let changed = conn.execute(
        "UPDATE sync_leases SET expires_at = ?3 WHERE scope = ?1 AND holder = ?2",
        params![scope, holder, now + ttl_secs],
    )?;
    Ok(changed == 1)
}

pub fn release_lease(conn: &Connection, scope: &str, holder: &str) -> Result<bool, rusqlite::Error> {
    let changed = conn.execute(
        "DELETE FROM sync_leases WHERE scope = ?1 AND holder = ?2",
        params![scope, holder],
    )?;
    Ok(changed == 1)
}

// ── Directory checkpoints ──────────────────────────────────────────

pub fn get_sync_state(conn: &Connection, kind: &str) -> Result<i64, rusqlite::Error> {
    conn.query_row(
        "SELECT last_synced FROM sync_state WHERE kind = ?1",
        params![kind],
        |row| row.get(0),
    )
    .optional()
    .map(|v| v.unwrap_or(0))
}

pub fn advance_sync_state(
    conn: &Connection,
    kind: &str,
    checkpoint: i64,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_state (kind, last_synced, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(kind) DO UPDATE SET
            last_synced = MAX(sync_state.last_synced, excluded.last_synced),
            updated_at = excluded.updated_at",
        params![kind, checkpoint],
    )?;
    Ok(())
}

// ── Outbox ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEntry {
    pub task_id: String,
    pub employee_id: String,
    pub duration_secs: i64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub task_id: String,
    pub employee_id: String,
    pub duration_secs: i64,
    pub description: String,
    pub created_at: String,
    pub attempts: i64,
    pub last_error: Option<String>,
}

pub fn enqueue_outbox(conn: &Connection, e: &NewOutboxEntry) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO time_outbox (task_id, employee_id, duration_secs, description, created_at)
         VALUES (?1, ?2, ?3, ?4, datetime('now'))",
        params![e.task_id, e.employee_id, e.duration_secs, e.description],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn list_outbox(conn: &Connection, limit: u32) -> Result<Vec<OutboxEntry>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, task_id, employee_id, duration_secs, description, created_at,
                attempts, last_error
         FROM time_outbox ORDER BY id LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], |row| {
        Ok(OutboxEntry {
            id: row.get(0)?,
            task_id: row.get(1)?,
            employee_id: row.get(2)?,
            duration_secs: row.get(3)?,
            description: row.get(4)?,
            created_at: row.get(5)?,
            attempts: row.get(6)?,
            last_error: row.get(7)?,
        })
    })?;
    rows.collect()
}

pub fn delete_outbox(conn: &Connection, id: i64) -> Result<bool, rusqlite::Error> {
    let count = conn.execute("DELETE FROM time_outbox WHERE id = ?1", params![id])?;
    Ok(count > 0)
}

pub fn record_outbox_failure(
    conn: &Connection,
    id: i64,
    error: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE time_outbox SET attempts = attempts + 1, last_error = ?2 WHERE id = ?1",
        params![id, error],
    )?;
    Ok(())
}

// ── Employees ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmployeeRow {
    /// User ID when known, else the page ID.
    pub id: String,
    pub page_id: String,
    pub name: String,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
    pub direction: String,
}

pub fn upsert_employee(conn: &Connection, e: &Employee) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO employees (
            page_id, user_id, name, email, avatar_url, hourly_rate, direction,
            last_edited_time, cached_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, datetime('now'))
        ON CONFLICT(page_id) DO UPDATE SET
            user_id=excluded.user_id, name=excluded.name, email=excluded.email,
            avatar_url=excluded.avatar_url, hourly_rate=excluded.hourly_rate,
            direction=excluded.direction, last_edited_time=excluded.last_edited_time,
            cached_at=excluded.cached_at",
        params![
            e.page_id,
            e.user_id,
            e.name,
            e.email,
            e.avatar_url,
            e.hourly_rate,
            e.direction,
            e.last_edited_time.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn list_employees(conn: &Connection) -> Result<Vec<EmployeeRow>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT COALESCE(user_id, page_id), page_id, name, email, avatar_url, direction
         FROM employees ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(EmployeeRow {
            id: row.get(0)?,
            page_id: row.get(1)?,
            name: row.get(2)?,
            email: row.get(3)?,
            avatar_url: row.get(4)?,
            direction: row.get(5)?,
        })
    })?;
    rows.collect()
}

/// Display name of the employee linked to a workspace user.
pub fn employee_name(conn: &Connection, user_id: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT name FROM employees WHERE user_id = ?1 OR page_id = ?1 LIMIT 1",
        params![user_id],
        |row| row.get(0),
    )
    .optional()
}

// ── Directory projects ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectoryProjectRow {
    pub id: String,
    pub name: String,
    pub status: String,
    pub icon: Option<String>,
}

pub fn upsert_directory_project(
    conn: &Connection,
    p: &DirectoryProject,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO directory_projects (project_id, name, status, icon, last_edited_time, cached_at)
         VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'))
         ON CONFLICT(project_id) DO UPDATE SET
            name=excluded.name, status=excluded.status, icon=excluded.icon,
            last_edited_time=excluded.last_edited_time, cached_at=excluded.cached_at",
        params![
            p.id,
            p.name,
            p.status,
            p.icon,
            p.last_edited_time.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn list_directory_projects(
    conn: &Connection,
) -> Result<Vec<DirectoryProjectRow>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT project_id, name, status, icon FROM directory_projects ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(DirectoryProjectRow {
            id: row.get(0)?,
            name: row.get(1)?,
            status: row.get(2)?,
            icon: row.get(3)?,
        })
    })?;
    rows.collect()
}

// ── Tasks ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRow {
    pub id: String,
    pub title: String,
    pub status: String,
    pub priority: String,
    pub estimate: f64,
    pub deadline_start: Option<String>,
    pub deadline_end: Option<String>,
    pub parent_id: Option<String>,
    pub product_id: Option<String>,
}

pub fn upsert_task(conn: &Connection, task: &Task) -> Result<(), rusqlite::Error> {
    let (deadline_start, deadline_end) = match &task.deadline {
        Some(d) => (Some(d.start.as_str()), d.end.as_deref()),
        None => (None, None),
    };
    conn.execute(
        "INSERT INTO tasks (
            task_id, title, status, priority, estimate, deadline_start, deadline_end,
            parent_id, product_id, created_time, last_edited_time, cached_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, datetime('now'))
        ON CONFLICT(task_id) DO UPDATE SET
            title=excluded.title, status=excluded.status, priority=excluded.priority,
            estimate=excluded.estimate, deadline_start=excluded.deadline_start,
            deadline_end=excluded.deadline_end, parent_id=excluded.parent_id,
            product_id=excluded.product_id, created_time=excluded.created_time,
            last_edited_time=excluded.last_edited_time, cached_at=excluded.cached_at",
        params![
            task.id,
            task.title,
            task.status,
            task.priority,
            task.estimate,
            deadline_start,
            deadline_end,
            task.effective_parent(),
            task.product_id,
            task.created_time.to_rfc3339(),
            task.last_edited_time.to_rfc3339(),
        ],
    )?;

    // Replace bridge rows wholesale
    conn.execute(
        "DELETE FROM bridge_task_assignees WHERE task_id = ?1",
        params![task.id],
    )?;
    conn.execute(
        "DELETE FROM bridge_task_tags WHERE task_id = ?1",
        params![task.id],
    )?;
    for person in &task.assignees {
        conn.execute(
            "INSERT OR IGNORE INTO bridge_task_assignees (task_id, user_id) VALUES (?1, ?2)",
            params![task.id, person.id],
        )?;
    }
    for tag in &task.tags {
        conn.execute(
            "INSERT OR IGNORE INTO bridge_task_tags (task_id, tag_name) VALUES (?1, ?2)",
            params![task.id, tag],
        )?;
    }
    Ok(())
}

/// Tasks of one employee in one product whose status is in `statuses`
/// (any status when `statuses` is empty).
pub fn list_open_tasks(
    conn: &Connection,
    user_id: &str,
    product_id: &str,
    statuses: &[String],
) -> Result<Vec<TaskRow>, rusqlite::Error> {
    let status_clause = if statuses.is_empty() {
        String::new()
    } else {
        let placeholders: Vec<String> = (0..statuses.len()).map(|i| format!("?{}", i + 3)).collect();
        format!(" AND t.status IN ({})", placeholders.join(", "))
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT t.task_id, t.title, t.status, t.priority, t.estimate,
                t.deadline_start, t.deadline_end, t.parent_id, t.product_id
         FROM tasks t
         JOIN bridge_task_assignees a ON a.task_id = t.task_id
         WHERE a.user_id = ?1 AND t.product_id = ?2{status_clause}
         ORDER BY t.created_time, t.task_id"
    ))?;
    let values: Vec<&str> = [user_id, product_id]
        .into_iter()
        .chain(statuses.iter().map(String::as_str))
        .collect();
    let rows = stmt.query_map(params_from_iter(values), |row| {
        Ok(TaskRow {
            id: row.get(0)?,
            title: row.get(1)?,
            status: row.get(2)?,
            priority: row.get(3)?,
            estimate: row.get(4)?,
            deadline_start: row.get(5)?,
            deadline_end: row.get(6)?,
            parent_id: row.get(7)?,
            product_id: row.get(8)?,
        })
    })?;
    rows.collect()
}

// ── Time entries ───────────────────────────────────────────────────

pub fn upsert_time_entry(conn: &Connection, e: &TimeEntry) -> Result<(), rusqlite::Error> {
    let employee_id = e.assignees.first().map(|p| p.id.as_str());
    let project_id = e.project_ids.first().map(String::as_str);
    let work_date = e.work_date.as_ref().map(|d| date_key_from_iso(&d.start));
    conn.execute(
        "INSERT INTO time_entries (
            entry_id, task_id, employee_id, project_id, description, total_hours,
            payable_hours, work_date, task_name, project_name, is_paid,
            week_number, month_number, day_number, direction,
            created_time, last_edited_time, cached_at
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
            datetime('now')
        )
        ON CONFLICT(entry_id) DO UPDATE SET
            task_id=excluded.task_id, employee_id=excluded.employee_id,
            project_id=excluded.project_id, description=excluded.description,
            total_hours=excluded.total_hours, payable_hours=excluded.payable_hours,
            work_date=excluded.work_date, task_name=excluded.task_name,
            project_name=excluded.project_name, is_paid=excluded.is_paid,
            week_number=excluded.week_number, month_number=excluded.month_number,
            day_number=excluded.day_number, direction=excluded.direction,
            created_time=excluded.created_time, last_edited_time=excluded.last_edited_time,
            cached_at=excluded.cached_at",
        params![
            e.id,
            e.task_id,
            employee_id,
            project_id,
            e.description,
            e.total_hours,
            e.payable_hours,
            work_date,
            e.task_name,
            e.project_name,
            e.paid as i32,
            e.week.map(|n| n as i64),
            e.month.map(|n| n as i64),
            e.day.map(|n| n as i64),
            e.direction,
            e.created_time.to_rfc3339(),
            e.last_edited_time.to_rfc3339(),
        ],
    )?;
    Ok(())
}

// ── Status ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusCounts {
    pub projects: i64,
    pub mappings: i64,
    pub validation_rows: i64,
    pub advisory_rows: i64,
    pub pending_review: i64,
    pub sync_errors: i64,
    pub outbox: i64,
    pub employees: i64,
    pub tasks: i64,
    pub time_entries: i64,
}

pub fn status_counts(conn: &Connection) -> Result<StatusCounts, rusqlite::Error> {
    let count = |sql: &str| -> Result<i64, rusqlite::Error> {
        conn.query_row(sql, [], |row| row.get(0))
    };
    Ok(StatusCounts {
        projects: count("SELECT COUNT(*) FROM projects")?,
        mappings: count_mappings(conn)?,
        validation_rows: count("SELECT COUNT(*) FROM review_rows WHERE category = 'validation'")?,
        advisory_rows: count("SELECT COUNT(*) FROM review_rows WHERE category = 'advisory'")?,
        pending_review: count("SELECT COUNT(*) FROM review_rows WHERE notified_at IS NULL")?,
        sync_errors: count("SELECT COUNT(*) FROM sync_errors")?,
        outbox: count("SELECT COUNT(*) FROM time_outbox")?,
        employees: count("SELECT COUNT(*) FROM employees")?,
        tasks: count("SELECT COUNT(*) FROM tasks")?,
        time_entries: count("SELECT COUNT(*) FROM time_entries")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::{DateRange, Person};
    use crate::storage::Database;
    use chrono::{TimeZone, Utc};

    fn project(id: &str) -> ProjectRecord {
        ProjectRecord {
            project_id: id.to_string(),
            name: format!("Project {id}"),
            internal_id: format!("prod-{id}"),
            tasks_db_id: "tasks-db".into(),
            time_db_id: "time-db".into(),
            workers_db_id: Some("workers-db".into()),
            tasks_last_synced: 100,
            time_last_synced: 0,
            added_at: String::new(),
        }
    }

    fn review(id: &str, errors: &str) -> ReviewRow {
        ReviewRow {
            internal_id: id.to_string(),
            category: ReviewCategory::Validation,
            entity_type: "task".into(),
            client_id: Some("c1".into()),
            project_id: None,
            title: "Build API".into(),
            errors: errors.to_string(),
            employee_id: Some("u1".into()),
            employee_name: None,
            updated_at: String::new(),
            notified_at: None,
        }
    }

    fn task(id: &str, product: &str, status: &str, assignee: &str) -> Task {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 5, 10, 0, 0).unwrap();
        Task {
            id: id.to_string(),
            created_time: t0,
            last_edited_time: t0,
            title: format!("Task {id}"),
            status: status.to_string(),
            priority: String::new(),
            assignees: vec![Person {
                id: assignee.to_string(),
                name: String::new(),
                email: None,
                avatar_url: None,
            }],
            estimate: 1.0,
            deadline: Some(DateRange {
                start: "2024-05-10".into(),
                end: None,
            }),
            parent_id: None,
            product_id: Some(product.to_string()),
            tags: vec!["iOS".into()],
            subtask_ids: vec![],
        }
    }

    #[tokio::test]
    async fn test_config_round_trip() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                set_config(conn, "tasks_db", "12345")?;
                let val = get_config(conn, "tasks_db")?;
                assert_eq!(val, Some("12345".to_string()));

                let missing = get_config(conn, "nonexistent")?;
                assert_eq!(missing, None);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_project_crud() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                upsert_project(conn, &project("a"))?;
                upsert_project(conn, &project("b"))?;
                assert_eq!(list_projects(conn)?.len(), 2);

                assert!(remove_project(conn, "b")?);
                assert!(!remove_project(conn, "b")?);

                let p = get_project(conn, "a")?.unwrap();
                assert_eq!(p.internal_id, "prod-a");
                assert_eq!(p.scope(EntityKind::Task), "project:a:tasks");
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_checkpoint_never_moves_backwards() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                upsert_project(conn, &project("a"))?;
                advance_project_checkpoint(conn, "a", EntityKind::Task, 500)?;
                advance_project_checkpoint(conn, "a", EntityKind::Task, 200)?;
                advance_project_checkpoint(conn, "a", EntityKind::TimeEntry, 50)?;

                let p = get_project(conn, "a")?.unwrap();
                assert_eq!(p.tasks_last_synced, 500);
                assert_eq!(p.time_last_synced, 50);

                // Re-registering with an older checkpoint keeps the newer one
                upsert_project(conn, &project("a"))?;
                assert_eq!(get_project(conn, "a")?.unwrap().tasks_last_synced, 500);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_mapping_insert_if_absent() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                assert!(insert_mapping(conn, "src-1", "dst-1")?);
                assert!(!insert_mapping(conn, "src-1", "dst-2")?);

                assert_eq!(get_client_id(conn, "src-1")?, Some("dst-1".to_string()));
                assert_eq!(get_internal_id(conn, "dst-1")?, Some("src-1".to_string()));
                assert_eq!(get_internal_id(conn, "dst-2")?, None);
                assert_eq!(count_mappings(conn)?, 1);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_review_row_upsert_and_notified_reset() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                upsert_review_row(conn, &review("t1", "task worker is empty"))?;
                upsert_review_row(conn, &review("t1", "task worker is empty"))?;
                assert_eq!(list_review_rows(conn, false)?.len(), 1);

                mark_review_notified(conn, &[("t1".into(), ReviewCategory::Validation)])?;
                assert!(list_review_rows(conn, true)?.is_empty());

                // Same text keeps the notification mark
                upsert_review_row(conn, &review("t1", "task worker is empty"))?;
                assert!(list_review_rows(conn, true)?.is_empty());

                // Changed text clears it
                upsert_review_row(conn, &review("t1", "task deadline is empty"))?;
                let pending = list_review_rows(conn, true)?;
                assert_eq!(pending.len(), 1);
                assert_eq!(pending[0].errors, "task deadline is empty");

                assert!(clear_review_row(conn, "t1", ReviewCategory::Validation)?);
                assert!(list_review_rows(conn, false)?.is_empty());
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sync_job_round_trip() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let job_id = insert_sync_job(conn, "project:a:tasks", Some(100))?;
                assert!(job_id > 0);

                update_sync_job(conn, job_id, "completed", 42, 0, Some(200), None)?;

                let (status, after): (String, i64) = conn.query_row(
                    "SELECT status, checkpoint_after FROM sync_jobs WHERE id = ?1",
                    params![job_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                assert_eq!(status, "completed");
                assert_eq!(after, 200);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sync_state_defaults_and_advances() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                assert_eq!(get_sync_state(conn, "employees")?, 0);
                advance_sync_state(conn, "employees", 300)?;
                advance_sync_state(conn, "employees", 100)?;
                assert_eq!(get_sync_state(conn, "employees")?, 300);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_lease_exclusive_until_expiry() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                assert!(try_acquire_lease(conn, "actualize", "a", 1000, 60)?);
                assert!(!try_acquire_lease(conn, "actualize", "b", 1030, 60)?);
                // Holder a renews; b still locked out past the original expiry
                assert!(renew_lease(conn, "actualize", "a", 1050, 60)?);
                assert!(!try_acquire_lease(conn, "actualize", "b", 1070, 60)?);
                // Expired rows are taken over, and the old holder cannot renew
                assert!(try_acquire_lease(conn, "actualize", "b", 1110, 60)?);
                assert!(!renew_lease(conn, "actualize", "a", 1111, 60)?);
                assert!(!release_lease(conn, "actualize", "a")?);
                assert!(release_lease(conn, "actualize", "b")?);
                assert!(try_acquire_lease(conn, "actualize", "a", 1112, 60)?);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_outbox_lifecycle() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let id = enqueue_outbox(
                    conn,
                    &NewOutboxEntry {
                        task_id: "t1".into(),
                        employee_id: "u1".into(),
                        duration_secs: 5400,
                        description: "Review".into(),
                    },
                )?;
                record_outbox_failure(conn, id, "HTTP 502")?;

                let entries = list_outbox(conn, 10)?;
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].attempts, 1);
                assert_eq!(entries[0].last_error.as_deref(), Some("HTTP 502"));

                assert!(delete_outbox(conn, id)?);
                assert!(list_outbox(conn, 10)?.is_empty());
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_open_tasks_filters() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                upsert_task(conn, &task("t1", "p1", "В работе", "u1"))?;
                upsert_task(conn, &task("t2", "p1", "Готово", "u1"))?;
                upsert_task(conn, &task("t3", "p2", "В работе", "u1"))?;
                upsert_task(conn, &task("t4", "p1", "В работе", "u2"))?;
                // Re-upsert replaces bridge rows rather than duplicating
                upsert_task(conn, &task("t1", "p1", "В работе", "u1"))?;

                let open = vec!["В работе".to_string(), "На паузе".to_string()];
                let rows = list_open_tasks(conn, "u1", "p1", &open)?;
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].id, "t1");

                let all = list_open_tasks(conn, "u1", "p1", &[])?;
                assert_eq!(all.len(), 2);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_employee_lookup() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                upsert_employee(
                    conn,
                    &Employee {
                        page_id: "emp-1".into(),
                        user_id: Some("u1".into()),
                        name: "Anna".into(),
                        email: None,
                        avatar_url: None,
                        hourly_rate: None,
                        direction: "Mobile".into(),
                        last_edited_time: Utc.with_ymd_and_hms(2024, 5, 5, 0, 0, 0).unwrap(),
                    },
                )?;
                assert_eq!(employee_name(conn, "u1")?, Some("Anna".to_string()));
                assert_eq!(employee_name(conn, "nobody")?, None);

                let rows = list_employees(conn)?;
                assert_eq!(rows[0].id, "u1");
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_status_counts() {
        let db = Database::open_memory().await.unwrap();

        let counts = db
            .writer()
            .call(|conn| {
                upsert_project(conn, &project("a"))?;
                insert_mapping(conn, "prod-a", "a")?;
                upsert_review_row(conn, &review("t1", "task title is empty"))?;
                status_counts(conn)
            })
            .await
            .unwrap();
        assert_eq!(counts.projects, 1);
        assert_eq!(counts.mappings, 1);
        assert_eq!(counts.validation_rows, 1);
        assert_eq!(counts.pending_review, 1);
        assert_eq!(counts.outbox, 0);
    }
}
