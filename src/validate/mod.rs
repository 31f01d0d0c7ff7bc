use std::sync::LazyLock;

use regex::Regex;
use rusqlite::Connection;

use crate::mapper::{EntityKind, Person, Task, TimeEntry};
use crate::storage::repository::{self, ReviewCategory, ReviewRow};

pub const TASK_TITLE_EMPTY: &str = "task title is empty";
pub const TASK_WORKER_EMPTY: &str = "task worker is empty";
pub const TASK_PRODUCT_EMPTY: &str = "task product is empty";
pub const TASK_DEADLINE_EMPTY: &str = "task deadline is empty";
pub const TIME_DESCRIPTION_EMPTY: &str = "description is empty";
pub const TIME_TASK_EMPTY: &str = "task is empty";
pub const TIME_HOURS_EMPTY: &str = "total hours is empty";

/// Words that suggest unfinished or rework items.
pub const DENYLIST: &[&str] = &[
    "фикс",
    "пофиксить",
    "фиксить",
    "правка",
    "править",
    "поправить",
    "исправить",
    "правки",
    "исправление",
    "баг",
    "безуспешно",
    "разобраться",
];

static DENY_RE: LazyLock<Regex> = LazyLock::new(|| {
    let mut words: Vec<&str> = DENYLIST.to_vec();
    // Longest first so "пофиксить" wins over "фикс"
    words.sort_by_key(|w| std::cmp::Reverse(w.chars().count()));
    let alternation: Vec<String> = words.iter().map(|w| regex::escape(w)).collect();
    Regex::new(&format!("(?i)(?:{})", alternation.join("|"))).unwrap()
});

pub fn validate_task(task: &Task) -> Vec<&'static str> {
    let mut errors = Vec::new();
    if task.title.trim().is_empty() {
        errors.push(TASK_TITLE_EMPTY);
    }
    if task.assignees.is_empty() {
        errors.push(TASK_WORKER_EMPTY);
    }
    if task.product_id.is_none() {
        errors.push(TASK_PRODUCT_EMPTY);
    }
    if task.deadline.is_none() {
        errors.push(TASK_DEADLINE_EMPTY);
    }
    errors
}

pub fn validate_time_entry(entry: &TimeEntry) -> Vec<&'static str> {
    let mut errors = Vec::new();
    if entry.description.trim().is_empty() {
        errors.push(TIME_DESCRIPTION_EMPTY);
    }
    if entry.task_id.is_none() {
        errors.push(TIME_TASK_EMPTY);
    }
    if entry.total_hours == 0.0 {
        errors.push(TIME_HOURS_EMPTY);
    }
    errors
}

/// Distinct denylist matches in `text`, lowercased, in order of appearance.
pub fn flagged_terms(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for m in DENY_RE.find_iter(text) {
        let term = m.as_str().to_lowercase();
        if !found.contains(&term) {
            found.push(term);
        }
    }
    found
}

/// Wrap every denylist match in `<b><i>…</i></b>`, keeping original case.
pub fn highlight(text: &str) -> String {
    DENY_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            format!("<b><i>{}</i></b>", &caps[0])
        })
        .into_owned()
}

fn review_row(
    internal_id: &str,
    category: ReviewCategory,
    kind: EntityKind,
    title: &str,
    errors: String,
    assignees: &[Person],
) -> ReviewRow {
    let assignee = assignees.first();
    ReviewRow {
        internal_id: internal_id.to_string(),
        category,
        entity_type: kind.as_str().to_string(),
        client_id: None,
        project_id: None,
        title: title.to_string(),
        errors,
        employee_id: assignee.map(|p| p.id.clone()),
        employee_name: assignee.map(|p| p.name.clone()).filter(|n| !n.is_empty()),
        updated_at: String::new(),
        notified_at: None,
    }
}

/// Validation row for a task, or `None` if it passes every rule.
pub fn task_review(task: &Task) -> Option<ReviewRow> {
    let errors = validate_task(task);
    (!errors.is_empty()).then(|| {
        review_row(
            &task.id,
            ReviewCategory::Validation,
            EntityKind::Task,
            &task.title,
            errors.join(", "),
            &task.assignees,
        )
    })
}

pub fn time_review(entry: &TimeEntry) -> Option<ReviewRow> {
    let errors = validate_time_entry(entry);
    (!errors.is_empty()).then(|| {
        review_row(
            &entry.id,
            ReviewCategory::Validation,
            EntityKind::TimeEntry,
            &entry.description,
            errors.join(", "),
            &entry.assignees,
        )
    })
}

pub fn task_advisory(task: &Task) -> Option<ReviewRow> {
    advisory(&task.id, EntityKind::Task, &task.title, &task.assignees)
}

pub fn time_advisory(entry: &TimeEntry) -> Option<ReviewRow> {
    advisory(
        &entry.id,
        EntityKind::TimeEntry,
        &entry.description,
        &entry.assignees,
    )
}

fn advisory(id: &str, kind: EntityKind, text: &str, assignees: &[Person]) -> Option<ReviewRow> {
    let terms = flagged_terms(text);
    (!terms.is_empty()).then(|| {
        review_row(
            id,
            ReviewCategory::Advisory,
            kind,
            text,
            format!("contains: {}", terms.join(", ")),
            assignees,
        )
    })
}

/// Store `row` for `internal_id`, or retract a previous row when it is `None`.
pub fn apply_review(
    conn: &Connection,
    internal_id: &str,
    category: ReviewCategory,
    row: Option<&ReviewRow>,
) -> Result<(), rusqlite::Error> {
    match row {
        Some(row) => repository::upsert_review_row(conn, row),
        None => repository::clear_review_row(conn, internal_id, category).map(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::DateRange;
    use crate::storage::Database;
    use chrono::{TimeZone, Utc};

    fn person() -> Person {
        Person {
            id: "u1".into(),
            name: "Anna".into(),
            email: None,
            avatar_url: None,
        }
    }

    fn entry(hours: f64, description: &str, task: Option<&str>) -> TimeEntry {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 5, 10, 0, 0).unwrap();
        TimeEntry {
            id: "time-1".into(),
            created_time: t0,
            last_edited_time: t0,
            total_hours: hours,
            work_date: None,
            description: description.into(),
            assignees: vec![person()],
            task_id: task.map(str::to_string),
            project_ids: vec![],
            task_name: String::new(),
            project_name: String::new(),
            paid: false,
            week: None,
            month: None,
            day: None,
            direction: String::new(),
            payable_hours: 0.0,
        }
    }

    fn task() -> Task {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 5, 10, 0, 0).unwrap();
        Task {
            id: "t1".into(),
            created_time: t0,
            last_edited_time: t0,
            title: "Build API".into(),
            status: String::new(),
            priority: String::new(),
            assignees: vec![person()],
            estimate: 0.0,
            deadline: Some(DateRange {
                start: "2024-05-10".into(),
                end: None,
            }),
            parent_id: None,
            product_id: Some("prod".into()),
            tags: vec![],
            subtask_ids: vec![],
        }
    }

    #[test]
    fn test_zero_hours_only_rule() {
        let row = time_review(&entry(0.0, "Code review", Some("t1"))).unwrap();
        assert_eq!(row.errors, TIME_HOURS_EMPTY);
        assert_eq!(row.employee_id.as_deref(), Some("u1"));
        assert_eq!(row.employee_name.as_deref(), Some("Anna"));
    }

    #[test]
    fn test_time_entry_all_rules() {
        let errors = validate_time_entry(&entry(0.0, "  ", None));
        assert_eq!(
            errors,
            vec![TIME_DESCRIPTION_EMPTY, TIME_TASK_EMPTY, TIME_HOURS_EMPTY]
        );
        assert!(time_review(&entry(2.0, "Review", Some("t1"))).is_none());
    }

    #[test]
    fn test_task_rules_joined() {
        assert!(task_review(&task()).is_none());

        let mut t = task();
        t.title = String::new();
        t.assignees.clear();
        t.deadline = None;
        let row = task_review(&t).unwrap();
        assert_eq!(
            row.errors,
            "task title is empty, task worker is empty, task deadline is empty"
        );
        assert_eq!(row.category, ReviewCategory::Validation);
        assert_eq!(row.employee_id, None);
    }

    #[test]
    fn test_flagged_terms_case_insensitive() {
        assert_eq!(
            flagged_terms("Пофиксить БАГ в логине, потом баг ещё раз"),
            vec!["пофиксить", "баг"]
        );
        assert!(flagged_terms("Сделать экран входа").is_empty());
    }

    #[test]
    fn test_highlight_keeps_case() {
        assert_eq!(
            highlight("Правки по Багу"),
            "<b><i>Правки</i></b> по <b><i>Баг</i></b>у"
        );
        assert_eq!(highlight("clean"), "clean");
    }

    #[test]
    fn test_advisory_row() {
        let row = time_advisory(&entry(1.0, "Разобраться с фиксом", Some("t1"))).unwrap();
        assert_eq!(row.category, ReviewCategory::Advisory);
        assert_eq!(row.errors, "contains: разобраться, фикс");
        assert!(task_advisory(&task()).is_none());
    }

    #[tokio::test]
    async fn test_apply_review_retracts_fixed_record() {
        let db = Database::open_memory().await.unwrap();
        let bad = time_review(&entry(0.0, "Review", Some("t1")));

        db.writer()
            .call(move |conn| {
                apply_review(conn, "time-1", ReviewCategory::Validation, bad.as_ref())?;
                // Running validation twice leaves one row with the same content
                apply_review(conn, "time-1", ReviewCategory::Validation, bad.as_ref())?;
                let rows = repository::list_review_rows(conn, false)?;
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].errors, TIME_HOURS_EMPTY);

                apply_review(conn, "time-1", ReviewCategory::Validation, None)?;
                assert!(repository::list_review_rows(conn, false)?.is_empty());
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }
}
