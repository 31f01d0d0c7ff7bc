pub mod api;
pub mod config;
pub mod date_util;
pub mod error;
pub mod mapper;
pub mod mindmap;
pub mod notify;
pub mod notion;
pub mod outbox;
pub mod registry;
pub mod scheduler;
pub mod storage;
pub mod sync;
pub mod url;
pub mod validate;

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::task::JoinHandle;

pub use config::{Secrets, Settings};
pub use error::{Error, Result};
pub use mindmap::{ImportReport, Outline};
pub use notify::{Notifier, SweepReport, TelegramNotifier};
pub use notion::Workspace;
pub use outbox::FlushReport;
pub use registry::IdRegistry;
pub use storage::Database;
pub use sync::dashboard::DiscoveredProject;
pub use sync::{
    CheckpointPolicy, NoopProgress, SyncOptions, SyncProgress, SyncReport, SyncStatus,
};
pub use url::{parse_notion_url, NotionUrlInfo};

// Re-export repository types needed by the binary crate, but not the module itself
pub use storage::repository::{
    NewOutboxEntry, ProjectRecord, ReviewRow, StatusCounts, SyncErrorRow,
};

use storage::repository;
use sync::syncer::{self, SyncContext};
use sync::{dashboard, directory, ScopeLocks};

/// Scope held for the whole of an `actualize` run.
const ACTUALIZE_SCOPE: &str = "actualize";

/// A project to register as a mirror scope. IDs may be dashed, undashed or
/// page URLs.
#[derive(Debug, Clone, Default)]
pub struct ProjectSpec {
    pub name: String,
    /// Mirror project page.
    pub client_id: String,
    /// Source product page.
    pub internal_id: String,
    pub tasks_db: String,
    pub time_db: String,
    pub workers_db: Option<String>,
    pub tasks_since: Option<i64>,
    pub time_since: Option<i64>,
}

/// Outcome of `project_discover`.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub registered: Vec<ProjectRecord>,
    /// Project name and the reason it was not registered.
    pub failed: Vec<(String, String)>,
}

/// Main entry point: the local store plus the workspace it mirrors.
pub struct NotionSync {
    db: Database,
    workspace: Arc<dyn Workspace>,
    registry: IdRegistry,
    scopes: ScopeLocks,
}

impl NotionSync {
    pub fn new(db: Database, workspace: Arc<dyn Workspace>) -> Self {
        Self {
            registry: IdRegistry::new(db.clone()),
            scopes: ScopeLocks::new(db.clone()),
            db,
            workspace,
        }
    }

    /// Access the database (for direct queries in the CLI and API).
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn registry(&self) -> &IdRegistry {
        &self.registry
    }

    pub fn is_actualizing(&self) -> bool {
        self.scopes.is_held(ACTUALIZE_SCOPE)
    }

    fn context(&self) -> SyncContext<'_> {
        SyncContext {
            db: &self.db,
            workspace: self.workspace.as_ref(),
            registry: &self.registry,
            scopes: &self.scopes,
        }
    }

    // ── Sync commands ──────────────────────────────────────────────

    /// Refresh the directory, then mirror every registered project (or only
    /// `options.project`). Rejected with `AlreadySyncing` while another run
    /// is in flight.
    pub async fn actualize(
        &self,
        options: &SyncOptions,
        progress: &dyn SyncProgress,
    ) -> Result<Vec<SyncReport>> {
        let lease = self.scopes.try_acquire(ACTUALIZE_SCOPE).await?;
        let result = self.actualize_locked(options, progress).await;
        lease.release().await;
        result
    }

    /// Start `actualize` in the background. The rejection for a run already
    /// in flight is returned here, before anything is spawned.
    pub async fn spawn_actualize(
        self: &Arc<Self>,
        options: SyncOptions,
    ) -> Result<JoinHandle<Result<Vec<SyncReport>>>> {
        let lease = self.scopes.try_acquire(ACTUALIZE_SCOPE).await?;
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let result = this.actualize_locked(&options, &NoopProgress).await;
            lease.release().await;
            if let Err(ref e) = result {
                log::error!("background sync failed: {e}");
            }
            result
        }))
    }

    async fn actualize_locked(
        &self,
        options: &SyncOptions,
        progress: &dyn SyncProgress,
    ) -> Result<Vec<SyncReport>> {
        let ctx = self.context();
        let mut reports = Vec::new();

        let projects = match options.project {
            Some(ref id) => {
                let id = url::resolve_id(id)?;
                let project = self
                    .db
                    .reader()
                    .call({
                        let id = id.clone();
                        move |conn| repository::get_project(conn, &id)
                    })
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("project {id} is not registered")))?;
                vec![project]
            }
            None => {
                reports.extend(directory::refresh(ctx, options, progress).await);
                self.db
                    .reader()
                    .call(|conn| repository::list_projects(conn))
                    .await?
            }
        };

        let parallel = options.max_parallel_projects.max(1);
        let per_project: Vec<Vec<SyncReport>> =
            stream::iter(projects.into_iter().map(|p| p.project_id))
                .map(|id| async move { syncer::sync_project(ctx, &id, options, progress).await })
                .buffer_unordered(parallel)
                .collect()
                .await;
        reports.extend(per_project.into_iter().flatten());

        let failed = reports
            .iter()
            .filter(|r| r.status != SyncStatus::Success)
            .count();
        log::info!("actualize: {} passes, {failed} not clean", reports.len());
        Ok(reports)
    }

    // ── Project commands ───────────────────────────────────────────

    pub async fn project_add(&self, spec: ProjectSpec) -> Result<ProjectRecord> {
        let record = ProjectRecord {
            project_id: url::resolve_id(&spec.client_id)?,
            name: spec.name,
            internal_id: url::resolve_id(&spec.internal_id)?,
            tasks_db_id: url::resolve_id(&spec.tasks_db)?,
            time_db_id: url::resolve_id(&spec.time_db)?,
            workers_db_id: spec
                .workers_db
                .as_deref()
                .map(url::resolve_id)
                .transpose()?,
            tasks_last_synced: spec.tasks_since.unwrap_or(0),
            time_last_synced: spec.time_since.unwrap_or(0),
            added_at: String::new(),
        };

        match self
            .registry
            .set(&record.internal_id, &record.project_id)
            .await
        {
            Ok(()) => {}
            Err(Error::AlreadyMapped { ref client_id, .. }) if *client_id == record.project_id => {}
            Err(e) => return Err(e),
        }

        self.db
            .writer()
            .call({
                let record = record.clone();
                move |conn| repository::upsert_project(conn, &record)
            })
            .await?;
        log::info!("registered project {} ({})", record.name, record.project_id);

        let id = record.project_id.clone();
        self.db
            .reader()
            .call(move |conn| repository::get_project(conn, &id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("project {}", record.project_id)))
    }

    /// Register every project listed on the mirror dashboard. Projects
    /// already registered keep their checkpoints.
    pub async fn project_discover(&self, dashboard: &str) -> Result<DiscoveryReport> {
        let dashboard_id = url::resolve_id(dashboard)?;
        let found = dashboard::discover(self.workspace.as_ref(), &dashboard_id).await?;

        let mut report = DiscoveryReport::default();
        for project in found {
            match self.project_add(project.to_spec()).await {
                Ok(record) => report.registered.push(record),
                Err(e) => {
                    log::warn!("cannot register discovered project {}: {e}", project.name);
                    report.failed.push((project.name, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    pub async fn project_remove(&self, identifier: &str) -> Result<bool> {
        let id = url::resolve_id(identifier)?;
        Ok(self
            .db
            .writer()
            .call(move |conn| repository::remove_project(conn, &id))
            .await?)
    }

    pub async fn project_list(&self) -> Result<Vec<ProjectRecord>> {
        Ok(self
            .db
            .reader()
            .call(|conn| repository::list_projects(conn))
            .await?)
    }

    // ── Outbox & notifications ─────────────────────────────────────

    pub async fn enqueue_time(&self, entry: NewOutboxEntry) -> Result<i64> {
        outbox::enqueue(&self.db, entry).await
    }

    /// Flush queued time reports, dated today (local time).
    pub async fn outbox_flush(&self, times_db: &str) -> Result<FlushReport> {
        let today = chrono::Local::now().date_naive();
        outbox::flush(&self.db, self.workspace.as_ref(), times_db, today).await
    }

    /// Create source tasks from a markdown outline in the configured tasks
    /// database, linked to the matching product when there is one.
    pub async fn mindmap_import(&self, markdown: &str) -> Result<ImportReport> {
        let settings = self.settings().await?;
        if settings.tasks_db.is_empty() {
            return Err(Error::Config("tasks_db is not configured".into()));
        }
        let outline = Outline::parse(markdown);
        if outline.tasks.is_empty() {
            return Err(Error::Mapping("outline has no tasks".into()));
        }
        mindmap::import(
            self.workspace.as_ref(),
            &settings.tasks_db,
            &settings.projects_db,
            &outline,
        )
        .await
    }

    pub async fn notify(&self, notifier: &dyn Notifier, chat_ids: &[String]) -> Result<SweepReport> {
        notify::sweep(&self.db, notifier, chat_ids).await
    }

    // ── Status ─────────────────────────────────────────────────────

    pub async fn status(&self) -> Result<StatusCounts> {
        Ok(self
            .db
            .reader()
            .call(|conn| repository::status_counts(conn))
            .await?)
    }

    pub async fn recent_errors(&self, limit: u32) -> Result<Vec<SyncErrorRow>> {
        Ok(self
            .db
            .reader()
            .call(move |conn| repository::list_sync_errors(conn, limit))
            .await?)
    }

    // ── Config commands ────────────────────────────────────────────

    pub async fn settings(&self) -> Result<Settings> {
        Settings::load(&self.db).await
    }

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        Ok(self
            .db
            .reader()
            .call(move |conn| repository::get_config(conn, &key))
            .await?)
    }

    /// Validate and store a setting; returns the stored form.
    pub async fn config_set(&self, key: &str, value: &str) -> Result<String> {
        let value = config::normalize_entry(key, value)?;
        self.db
            .writer()
            .call({
                let key = key.to_string();
                let value = value.clone();
                move |conn| repository::set_config(conn, &key, &value)
            })
            .await?;
        Ok(value)
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        Ok(self
            .db
            .reader()
            .call(|conn| repository::list_config(conn))
            .await?)
    }
}
