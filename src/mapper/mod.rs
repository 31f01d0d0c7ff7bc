pub mod schema;
pub mod types;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::date_util::parse_timestamp;
use crate::error::{Error, Result};
use crate::notion::Page;

pub use types::{DateRange, DirectoryProject, Employee, EntityKind, Person, Task, TimeEntry};

type Props = Map<String, Value>;

// ── Property accessors ─────────────────────────────────────────────
//
// Every accessor degrades to an empty value when the property is missing or
// has an unexpected shape.

fn field<'a>(props: &'a Props, name: &str, kind: &str) -> Option<&'a Value> {
    props.get(name).and_then(|p| p.get(kind)).filter(|v| !v.is_null())
}

/// Concatenate rich-text runs in order.
pub fn plain_text(runs: &Value) -> String {
    runs.as_array()
        .map(|runs| {
            runs.iter()
                .filter_map(|r| {
                    r.get("plain_text")
                        .and_then(Value::as_str)
                        .or_else(|| r.pointer("/text/content").and_then(Value::as_str))
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn title(props: &Props, name: &str) -> String {
    field(props, name, "title").map(plain_text).unwrap_or_default()
}

pub fn rich_text(props: &Props, name: &str) -> String {
    field(props, name, "rich_text").map(plain_text).unwrap_or_default()
}

pub fn number(props: &Props, name: &str) -> Option<f64> {
    field(props, name, "number").and_then(Value::as_f64)
}

pub fn checkbox(props: &Props, name: &str) -> bool {
    field(props, name, "checkbox")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

pub fn select(props: &Props, name: &str) -> String {
    field(props, name, "select")
        .and_then(|s| s.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

pub fn status(props: &Props, name: &str) -> String {
    field(props, name, "status")
        .and_then(|s| s.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

pub fn multi_select(props: &Props, name: &str) -> Vec<String> {
    field(props, name, "multi_select")
        .and_then(Value::as_array)
        .map(|opts| {
            opts.iter()
                .filter_map(|o| o.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn ids(items: &Value) -> Vec<String> {
    items
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.get("id").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub fn relation_ids(props: &Props, name: &str) -> Vec<String> {
    field(props, name, "relation").map(ids).unwrap_or_default()
}

pub fn first_relation(props: &Props, name: &str) -> Option<String> {
    relation_ids(props, name).into_iter().next()
}

pub fn people(props: &Props, name: &str) -> Vec<Person> {
    field(props, name, "people")
        .and_then(Value::as_array)
        .map(|people| {
            people
                .iter()
                .filter_map(|p| {
                    let id = p.get("id").and_then(Value::as_str)?;
                    Some(Person {
                        id: id.to_string(),
                        name: p
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        email: p
                            .pointer("/person/email")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        avatar_url: p
                            .get("avatar_url")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn date_range(props: &Props, name: &str) -> Option<DateRange> {
    let date = field(props, name, "date")?;
    let start = date.get("start").and_then(Value::as_str)?;
    Some(DateRange {
        start: start.to_string(),
        end: date.get("end").and_then(Value::as_str).map(str::to_string),
    })
}

pub fn formula_string(props: &Props, name: &str) -> String {
    field(props, name, "formula")
        .and_then(|f| f.get("string"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

pub fn formula_number(props: &Props, name: &str) -> Option<f64> {
    field(props, name, "formula")
        .and_then(|f| f.get("number"))
        .and_then(Value::as_f64)
}

/// IDs from a rollup of relations, flattened in order.
pub fn rollup_relation_ids(props: &Props, name: &str) -> Vec<String> {
    field(props, name, "rollup")
        .and_then(|r| r.get("array"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.get("relation"))
                .flat_map(ids)
                .collect()
        })
        .unwrap_or_default()
}

/// Emoji or image URL of a page icon.
pub fn icon(page: &Page) -> Option<String> {
    let icon = page.icon.as_ref()?;
    match icon.get("type").and_then(Value::as_str)? {
        "emoji" => icon.get("emoji").and_then(Value::as_str).map(str::to_string),
        "external" => icon
            .pointer("/external/url")
            .and_then(Value::as_str)
            .map(str::to_string),
        "file" => icon
            .pointer("/file/url")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn timestamp(page: &Page, value: &str, which: &str) -> Result<DateTime<Utc>> {
    parse_timestamp(value).ok_or_else(|| {
        Error::Mapping(format!(
            "page {} has unparseable {which} '{value}'",
            page.id
        ))
    })
}

fn require_id(page: &Page) -> Result<()> {
    if page.id.trim().is_empty() {
        return Err(Error::Mapping("page without id".into()));
    }
    Ok(())
}

// ── Entity mappers ─────────────────────────────────────────────────

pub fn map_task(page: &Page) -> Result<Task> {
    use schema::task as p;
    require_id(page)?;
    let props = &page.properties;
    Ok(Task {
        id: page.id.clone(),
        created_time: timestamp(page, &page.created_time, "created_time")?,
        last_edited_time: timestamp(page, &page.last_edited_time, "last_edited_time")?,
        title: title(props, p::TITLE),
        status: status(props, p::STATUS),
        priority: select(props, p::PRIORITY),
        assignees: people(props, p::ASSIGNEE),
        estimate: number(props, p::ESTIMATE).unwrap_or(0.0),
        deadline: date_range(props, p::DEADLINE),
        parent_id: first_relation(props, p::PARENT),
        product_id: first_relation(props, p::PRODUCT),
        tags: multi_select(props, p::TAGS),
        subtask_ids: relation_ids(props, p::SUBTASKS),
    })
}

pub fn map_time_entry(page: &Page) -> Result<TimeEntry> {
    use schema::time as p;
    require_id(page)?;
    let props = &page.properties;
    Ok(TimeEntry {
        id: page.id.clone(),
        created_time: timestamp(page, &page.created_time, "created_time")?,
        last_edited_time: timestamp(page, &page.last_edited_time, "last_edited_time")?,
        total_hours: number(props, p::TOTAL_HOURS).unwrap_or(0.0),
        work_date: date_range(props, p::WORK_DATE),
        description: title(props, p::DESCRIPTION),
        assignees: people(props, p::ASSIGNEE),
        task_id: first_relation(props, p::TASK),
        project_ids: rollup_relation_ids(props, p::PROJECT),
        task_name: formula_string(props, p::TASK_NAME),
        project_name: formula_string(props, p::PROJECT_NAME),
        paid: checkbox(props, p::PAID),
        week: formula_number(props, p::WEEK),
        month: formula_number(props, p::MONTH),
        day: formula_number(props, p::DAY),
        direction: select(props, p::DIRECTION),
        payable_hours: formula_number(props, p::PAYABLE_HOURS).unwrap_or(0.0),
    })
}

pub fn map_employee(page: &Page) -> Result<Employee> {
    use schema::employee as p;
    require_id(page)?;
    let props = &page.properties;
    let person = people(props, p::PERSON).into_iter().next();
    let mut name = title(props, p::NAME);
    if name.is_empty() {
        name = person.as_ref().map(|p| p.name.clone()).unwrap_or_default();
    }
    Ok(Employee {
        page_id: page.id.clone(),
        user_id: person.as_ref().map(|p| p.id.clone()),
        name,
        email: person.as_ref().and_then(|p| p.email.clone()),
        avatar_url: person.and_then(|p| p.avatar_url),
        hourly_rate: number(props, p::HOURLY_RATE),
        direction: select(props, p::DIRECTION),
        last_edited_time: timestamp(page, &page.last_edited_time, "last_edited_time")?,
    })
}

pub fn map_directory_project(page: &Page) -> Result<DirectoryProject> {
    use schema::project as p;
    require_id(page)?;
    let props = &page.properties;
    Ok(DirectoryProject {
        id: page.id.clone(),
        name: title(props, p::NAME),
        status: status(props, p::STATUS),
        icon: icon(page),
        last_edited_time: timestamp(page, &page.last_edited_time, "last_edited_time")?,
    })
}
