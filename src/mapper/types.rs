use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// The two record kinds mirrored per project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Task,
    TimeEntry,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Task => "task",
            EntityKind::TimeEntry => "time_entry",
        }
    }

    /// Short scope suffix used in lease keys and job scopes.
    pub fn scope_suffix(&self) -> &'static str {
        match self {
            EntityKind::Task => "tasks",
            EntityKind::TimeEntry => "times",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Person {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: String,
    pub end: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: String,
    pub created_time: DateTime<Utc>,
    pub last_edited_time: DateTime<Utc>,
    pub title: String,
    pub status: String,
    pub priority: String,
    pub assignees: Vec<Person>,
    pub estimate: f64,
    pub deadline: Option<DateRange>,
    pub parent_id: Option<String>,
    pub product_id: Option<String>,
    pub tags: Vec<String>,
    pub subtask_ids: Vec<String>,
}

impl Task {
    pub fn assignee_ids(&self) -> Vec<String> {
        self.assignees.iter().map(|p| p.id.clone()).collect()
    }

    /// Parent reference, ignoring a page that names itself as parent.
    pub fn effective_parent(&self) -> Option<&str> {
        self.parent_id.as_deref().filter(|p| *p != self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeEntry {
    pub id: String,
    pub created_time: DateTime<Utc>,
    pub last_edited_time: DateTime<Utc>,
    pub total_hours: f64,
    pub work_date: Option<DateRange>,
    pub description: String,
    pub assignees: Vec<Person>,
    pub task_id: Option<String>,
    pub project_ids: Vec<String>,
    pub task_name: String,
    pub project_name: String,
    pub paid: bool,
    pub week: Option<f64>,
    pub month: Option<f64>,
    pub day: Option<f64>,
    pub direction: String,
    pub payable_hours: f64,
}

impl TimeEntry {
    pub fn assignee_ids(&self) -> Vec<String> {
        self.assignees.iter().map(|p| p.id.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Employee {
    /// Page ID of the employee row.
    pub page_id: String,
    /// Workspace user ID from the people property; the ID clients use.
    pub user_id: Option<String>,
    pub name: String,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
    pub hourly_rate: Option<f64>,
    pub direction: String,
    pub last_edited_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectoryProject {
    pub id: String,
    pub name: String,
    pub status: String,
    pub icon: Option<String>,
    pub last_edited_time: DateTime<Utc>,
}
