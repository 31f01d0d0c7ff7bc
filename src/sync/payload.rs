//! Mirror write payloads, one builder per entity.

use serde_json::{json, Value};

use crate::mapper::schema::{mirror, task, time};
use crate::mapper::{Task, TimeEntry};
use crate::notion::{Icon, Properties, PropertyValue};
use crate::storage::repository::OutboxEntry;

const TAG_ICONS: &[(&str, &str)] = &[
    ("iOS", "https://i.postimg.cc/kGZPbxtx/ios.png"),
    ("Flutter", "https://i.postimg.cc/0QVs8gkX/flutter.png"),
    ("Android", "https://i.postimg.cc/0NqxndXn/android.png"),
    ("Иерархическая задача", "https://i.postimg.cc/yYgHzrwn/queen.png"),
    ("Дизайн", "https://i.postimg.cc/hjDnW4B7/design.png"),
    ("Backend", "https://i.postimg.cc/6QLKm2DX/backend.png"),
    ("Web", "https://i.postimg.cc/t4FGsnRx/web.png"),
    ("Менеджмент", "https://i.postimg.cc/FFn48Qn7/management.png"),
    ("Sprint", "https://i.postimg.cc/Qx2rNJDD/Vector.png"),
    ("Meeting", "https://i.postimg.cc/brdjr6dy/Group-5272.png"),
];

const HIERARCHY_TAG: &str = "Иерархическая задача";

/// Resolved mirror IDs a task payload points at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskRefs {
    pub project_client_id: String,
    pub parent_client_id: Option<String>,
    pub worker_id: Option<String>,
}

pub fn task_properties(task: &Task, refs: &TaskRefs) -> Properties {
    let mut props = Properties::new();
    props
        .set(mirror::NAME, PropertyValue::Title(task.title.clone()))
        .set(mirror::ESTIMATE, PropertyValue::Number(task.estimate))
        .set(
            mirror::PROJECT,
            PropertyValue::Relation(vec![refs.project_client_id.clone()]),
        )
        .set(
            mirror::PARENT,
            PropertyValue::Relation(refs.parent_client_id.iter().cloned().collect()),
        );
    // Empty option names are rejected by the API
    if !task.status.is_empty() {
        props.set(mirror::STATUS, PropertyValue::Status(task.status.clone()));
    }
    if !task.priority.is_empty() {
        props.set(mirror::PRIORITY, PropertyValue::Select(task.priority.clone()));
    }
    if let Some(ref d) = task.deadline {
        props.set(
            mirror::DEADLINE,
            PropertyValue::Date {
                start: d.start.clone(),
                end: d.end.clone(),
            },
        );
    }
    if let Some(ref worker) = refs.worker_id {
        props.set(mirror::ASSIGNEE, PropertyValue::Relation(vec![worker.clone()]));
    }
    props
}

/// Icon for a new mirror task: first tag, or the hierarchy icon for an
/// untagged task with subtasks.
pub fn task_icon(task: &Task) -> Option<Icon> {
    let key = match task.tags.first() {
        Some(tag) => tag.as_str(),
        None if !task.subtask_ids.is_empty() => HIERARCHY_TAG,
        None => return None,
    };
    TAG_ICONS
        .iter()
        .find(|(tag, _)| *tag == key)
        .map(|(_, url)| Icon::External(url.to_string()))
}

pub fn time_properties(entry: &TimeEntry, task_client_id: Option<&str>) -> Properties {
    let mut props = Properties::new()
        .with(mirror::TOTAL_HOURS, PropertyValue::Number(entry.total_hours))
        .with(mirror::NAME, PropertyValue::Title(entry.description.clone()));
    if let Some(task) = task_client_id {
        props.set(mirror::TASK, PropertyValue::Relation(vec![task.to_string()]));
    }
    props
}

/// Source time-entry row for a queued report, dated `work_date`.
pub fn outbox_time_properties(entry: &OutboxEntry, work_date: &str) -> Properties {
    Properties::new()
        .with(
            time::TOTAL_HOURS,
            PropertyValue::Number(entry.duration_secs as f64 / 3600.0),
        )
        .with(
            time::TASK,
            PropertyValue::Relation(vec![entry.task_id.clone()]),
        )
        .with(
            time::DESCRIPTION,
            PropertyValue::Title(entry.description.clone()),
        )
        .with(
            time::WORK_DATE,
            PropertyValue::Date {
                start: work_date.to_string(),
                end: None,
            },
        )
        .with(
            time::ASSIGNEE,
            PropertyValue::People(vec![entry.employee_id.clone()]),
        )
}

/// Source-task payload for an item of an imported outline. Estimates start
/// at zero.
pub fn outline_task_properties(
    title: &str,
    product_id: Option<&str>,
    parent_id: Option<&str>,
) -> Properties {
    let mut props = Properties::new();
    props
        .set(task::TITLE, PropertyValue::Title(title.to_string()))
        .set(task::ESTIMATE, PropertyValue::Number(0.0));
    if let Some(product) = product_id {
        props.set(task::PRODUCT, PropertyValue::Relation(vec![product.to_string()]));
    }
    if let Some(parent) = parent_id {
        props.set(task::PARENT, PropertyValue::Relation(vec![parent.to_string()]));
    }
    props
}

/// Page body for an outline item: a bookmark for its link, then one
/// unchecked to-do per checklist line.
pub fn outline_task_children(link: Option<&str>, checklist: &[String]) -> Vec<Value> {
    let bookmark = link.map(|url| json!({"type": "bookmark", "bookmark": {"url": url}}));
    bookmark
        .into_iter()
        .chain(checklist.iter().map(|item| {
            json!({
                "type": "to_do",
                "to_do": {
                    "rich_text": [{"type": "text", "text": {"content": item}}],
                    "checked": false
                }
            })
        }))
        .collect()
}
