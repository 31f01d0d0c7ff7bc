//! Task outlines written as markdown and imported into the source tasks
//! database.
//!
//! `# ` names the product, `## ` starts a task, `### ` a subtask of the
//! current task, and `- ` adds a checklist line to the innermost open one.
//! A heading may be a markdown link; its URL becomes a bookmark on the page.
//! Anything else is ignored.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::error::Result;
use crate::mapper::schema;
use crate::notion::{Filter, QueryRequest, Workspace};
use crate::sync::payload;
use crate::sync::rate_limit::retry_api;

static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(.*?)\]\((.*?)\)").unwrap());

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutlineTask {
    pub title: String,
    pub link: Option<String>,
    pub checklist: Vec<String>,
    pub subtasks: Vec<OutlineTask>,
}

impl OutlineTask {
    fn from_heading(text: &str) -> Self {
        let (title, link) = match LINK_RE.captures(text) {
            Some(caps) => (caps[1].to_string(), Some(caps[2].to_string())),
            None => (text.to_string(), None),
        };
        Self {
            title,
            link: link.filter(|l| !l.is_empty()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outline {
    /// Product name, matched against the projects database.
    pub product: String,
    pub tasks: Vec<OutlineTask>,
}

impl Outline {
    pub fn parse(text: &str) -> Self {
        let mut outline = Outline::default();
        // Checklist lines go to the latest subtask until the next task heading
        let mut in_subtask = false;

        for line in text.lines().map(str::trim) {
            if let Some(name) = line.strip_prefix("# ") {
                outline.product = name.to_string();
            } else if let Some(heading) = line.strip_prefix("## ") {
                outline.tasks.push(OutlineTask::from_heading(heading));
                in_subtask = false;
            } else if let Some(heading) = line.strip_prefix("### ") {
                if let Some(task) = outline.tasks.last_mut() {
                    task.subtasks.push(OutlineTask::from_heading(heading));
                    in_subtask = true;
                }
            } else if let Some(item) = line.strip_prefix("- ") {
                let Some(task) = outline.tasks.last_mut() else {
                    continue;
                };
                if in_subtask {
                    if let Some(subtask) = task.subtasks.last_mut() {
                        subtask.checklist.push(item.to_string());
                        continue;
                    }
                }
                task.checklist.push(item.to_string());
            }
        }
        outline
    }

    pub fn task_count(&self) -> usize {
        self.tasks.iter().map(|t| 1 + t.subtasks.len()).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportReport {
    /// Product page the top-level tasks were linked to, if one matched.
    pub product_id: Option<String>,
    /// Created task pages, parents before their subtasks.
    pub created: Vec<String>,
}

/// Create the outline's tasks in `tasks_db`. Top-level tasks link to the
/// first product in `projects_db` whose name contains the outline's product
/// name; subtasks link to their parent task.
///
/// Stops at the first failed create; pages created before it stay.
pub async fn import(
    workspace: &dyn Workspace,
    tasks_db: &str,
    projects_db: &str,
    outline: &Outline,
) -> Result<ImportReport> {
    let mut report = ImportReport {
        product_id: find_product(workspace, projects_db, &outline.product).await?,
        created: Vec::with_capacity(outline.task_count()),
    };
    if report.product_id.is_none() {
        log::warn!("no product matches '{}', tasks are created unlinked", outline.product);
    }

    for task in &outline.tasks {
        let parent =
            create_task(workspace, tasks_db, task, report.product_id.as_deref(), None).await?;
        report.created.push(parent.clone());
        for subtask in &task.subtasks {
            let id = create_task(workspace, tasks_db, subtask, None, Some(&parent)).await?;
            report.created.push(id);
        }
    }
    log::info!(
        "outline '{}': {} task pages created",
        outline.product,
        report.created.len()
    );
    Ok(report)
}

async fn find_product(
    workspace: &dyn Workspace,
    projects_db: &str,
    name: &str,
) -> Result<Option<String>> {
    if name.is_empty() || projects_db.is_empty() {
        return Ok(None);
    }
    let request = QueryRequest::new()
        .filter(Filter::rich_text_contains(schema::project::NAME, name))
        .page_size(1);
    let page = retry_api!(workspace.query(projects_db, &request))?;
    Ok(page.results.into_iter().next().map(|p| p.id))
}

async fn create_task(
    workspace: &dyn Workspace,
    tasks_db: &str,
    task: &OutlineTask,
    product_id: Option<&str>,
    parent_id: Option<&str>,
) -> Result<String> {
    let props = payload::outline_task_properties(&task.title, product_id, parent_id);
    let children = payload::outline_task_children(task.link.as_deref(), &task.checklist);
    retry_api!(workspace.create_page(tasks_db, &props, Some(&children), None))
}
