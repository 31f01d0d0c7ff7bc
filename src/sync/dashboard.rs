//! Project discovery from the mirror dashboard.
//!
//! Each child page of the dashboard holds one client's databases, found by
//! title. Rows of its projects database become mirror projects.

use crate::error::Result;
use crate::mapper::{self, schema::dashboard};
use crate::notion::{Page, QueryRequest, Workspace};
use crate::sync::api_helpers::{list_all_children, query_all};
use crate::ProjectSpec;

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredProject {
    pub name: String,
    /// Row in the dashboard's projects database; the mirror project page.
    pub client_id: String,
    /// Source product page.
    pub internal_id: String,
    pub tasks_db: String,
    pub time_db: String,
    pub workers_db: Option<String>,
}

impl DiscoveredProject {
    pub fn to_spec(&self) -> ProjectSpec {
        ProjectSpec {
            name: self.name.clone(),
            client_id: self.client_id.clone(),
            internal_id: self.internal_id.clone(),
            tasks_db: self.tasks_db.clone(),
            time_db: self.time_db.clone(),
            workers_db: self.workers_db.clone(),
            tasks_since: None,
            time_since: None,
        }
    }
}

#[derive(Default)]
struct DashboardDatabases {
    projects: Option<String>,
    tasks: Option<String>,
    times: Option<String>,
    workers: Option<String>,
}

/// Walk the dashboard and list every project it describes.
///
/// A page that cannot be read, or lacks a projects, tasks or time database,
/// is skipped with a warning.
pub async fn discover(
    workspace: &dyn Workspace,
    dashboard_id: &str,
) -> Result<Vec<DiscoveredProject>> {
    let blocks = list_all_children(workspace, dashboard_id).await?;
    let mut found = Vec::new();
    for block in blocks.iter().filter(|b| b.is_child_page()) {
        match discover_page(workspace, &block.id).await {
            Ok(projects) => found.extend(projects),
            Err(e) => log::warn!("dashboard page {} skipped: {e}", block.id),
        }
    }
    log::info!("dashboard {dashboard_id}: {} projects found", found.len());
    Ok(found)
}

async fn discover_page(workspace: &dyn Workspace, page_id: &str) -> Result<Vec<DiscoveredProject>> {
    let mut dbs = DashboardDatabases::default();
    for block in list_all_children(workspace, page_id).await? {
        let slot = match block.database_title() {
            Some(dashboard::PROJECTS_DB) => &mut dbs.projects,
            Some(dashboard::TASKS_DB) => &mut dbs.tasks,
            Some(dashboard::TIMES_DB) => &mut dbs.times,
            Some(dashboard::WORKERS_DB) => &mut dbs.workers,
            _ => continue,
        };
        *slot = Some(block.id);
    }

    let (Some(projects_db), Some(tasks_db), Some(time_db)) = (dbs.projects, dbs.tasks, dbs.times)
    else {
        log::warn!("dashboard page {page_id}: missing projects, tasks or time database");
        return Ok(Vec::new());
    };

    let rows = query_all(workspace, &projects_db, &QueryRequest::new()).await?;
    Ok(rows
        .iter()
        .filter_map(|row| {
            let project = project_from_row(row, &tasks_db, &time_db, dbs.workers.as_deref());
            if project.is_none() {
                log::debug!("project row {} has no name or product, skipped", row.id);
            }
            project
        })
        .collect())
}

fn project_from_row(
    row: &Page,
    tasks_db: &str,
    time_db: &str,
    workers_db: Option<&str>,
) -> Option<DiscoveredProject> {
    let name = mapper::title(&row.properties, dashboard::PROJECT_NAME);
    let internal_id = mapper::first_relation(&row.properties, dashboard::INTERNAL)?;
    if name.is_empty() {
        return None;
    }
    Some(DiscoveredProject {
        name,
        client_id: row.id.clone(),
        internal_id,
        tasks_db: tasks_db.to_string(),
        time_db: time_db.to_string(),
        workers_db: workers_db.map(str::to_string),
    })
}
