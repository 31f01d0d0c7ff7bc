//! Daily review digest sent to chat.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::storage::repository::{self, ReviewCategory, ReviewRow};
use crate::storage::Database;
use crate::url::page_url;
use crate::validate;

pub const TELEGRAM_API_URL: &str = "https://api.telegram.org";
const UNASSIGNED: &str = "Без исполнителя";

/// Delivery channel for rendered HTML messages.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, chat_id: &str, html: &str) -> Result<()>;
}

/// Telegram Bot API `sendMessage` with HTML parse mode.
pub struct TelegramNotifier {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl TelegramNotifier {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Self::with_base_url(token, TELEGRAM_API_URL)
    }

    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Notify(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, chat_id: &str, html: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.token);
        let body = json!({
            "chat_id": chat_id,
            "text": html,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Notify(e.to_string()))?;
        let status = resp.status();
        let payload: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() || payload.get("ok") != Some(&Value::Bool(true)) {
            let description = payload
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("no description");
            return Err(Error::Notify(format!(
                "sendMessage to {chat_id} failed ({status}): {description}"
            )));
        }
        log::debug!("sent {} bytes to chat {chat_id}", html.len());
        Ok(())
    }
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// One employee's digest: a bold header and a numbered list of linked titles
/// with their problems.
pub fn render_message(employee: &str, rows: &[ReviewRow]) -> String {
    let mut out = format!("<b>{}</b>\n", escape_html(employee));
    for (i, row) in rows.iter().enumerate() {
        let title = if row.title.trim().is_empty() {
            "(без названия)".to_string()
        } else {
            escape_html(&row.title)
        };
        let title = match row.category {
            ReviewCategory::Advisory => validate::highlight(&title),
            ReviewCategory::Validation => title,
        };
        let target = row.client_id.as_deref().unwrap_or(&row.internal_id);
        out.push_str(&format!(
            "{}. <a href=\"{}\">{}</a>: {}\n",
            i + 1,
            page_url(target),
            title,
            escape_html(&row.errors)
        ));
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub groups_sent: usize,
    pub groups_failed: usize,
    pub rows_notified: usize,
}

/// Send every pending review row, grouped by employee, to each chat.
/// A group is marked notified only if every chat accepted it.
pub async fn sweep(
    db: &Database,
    notifier: &dyn Notifier,
    chat_ids: &[String],
) -> Result<SweepReport> {
    if chat_ids.is_empty() {
        return Err(Error::Config("notify_chat_ids is not configured".into()));
    }
    let (rows, names) = db
        .reader()
        .call(|conn| {
            let rows = repository::list_review_rows(conn, true)?;
            let mut names: BTreeMap<String, String> = BTreeMap::new();
            for row in &rows {
                if let (Some(id), None) = (&row.employee_id, &row.employee_name) {
                    if !names.contains_key(id) {
                        if let Some(name) = repository::employee_name(conn, id)? {
                            names.insert(id.clone(), name);
                        }
                    }
                }
            }
            Ok::<_, rusqlite::Error>((rows, names))
        })
        .await?;

    let mut groups: BTreeMap<String, Vec<ReviewRow>> = BTreeMap::new();
    for row in rows {
        let key = row.employee_id.clone().unwrap_or_default();
        groups.entry(key).or_default().push(row);
    }

    let mut report = SweepReport::default();
    for (employee_id, rows) in groups {
        let name = rows
            .iter()
            .find_map(|r| r.employee_name.clone())
            .or_else(|| names.get(&employee_id).cloned())
            .unwrap_or_else(|| {
                if employee_id.is_empty() {
                    UNASSIGNED.to_string()
                } else {
                    employee_id.clone()
                }
            });
        let message = render_message(&name, &rows);

        let mut delivered = true;
        for chat_id in chat_ids {
            if let Err(e) = notifier.send(chat_id, &message).await {
                log::warn!("review digest for {name} not delivered: {e}");
                delivered = false;
            }
        }
        if !delivered {
            report.groups_failed += 1;
            continue;
        }

        let keys: Vec<(String, ReviewCategory)> = rows
            .iter()
            .map(|r| (r.internal_id.clone(), r.category))
            .collect();
        report.rows_notified += keys.len();
        db.writer()
            .call(move |conn| repository::mark_review_notified(conn, &keys))
            .await?;
        report.groups_sent += 1;
    }
    log::info!(
        "review digest: {} groups sent, {} failed",
        report.groups_sent,
        report.groups_failed
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::Employee;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, String)>>,
        fail_for: Option<String>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, chat_id: &str, html: &str) -> Result<()> {
            if let Some(ref needle) = self.fail_for {
                if html.contains(needle.as_str()) {
                    return Err(Error::Notify("chat unavailable".into()));
                }
            }
            self.sent
                .lock()
                .unwrap()
                .push((chat_id.to_string(), html.to_string()));
            Ok(())
        }
    }

    fn row(id: &str, category: ReviewCategory, title: &str, employee: Option<&str>) -> ReviewRow {
        ReviewRow {
            internal_id: id.into(),
            category,
            entity_type: "task".into(),
            client_id: None,
            project_id: None,
            title: title.into(),
            errors: "task deadline is empty".into(),
            employee_id: employee.map(str::to_string),
            employee_name: None,
            updated_at: String::new(),
            notified_at: None,
        }
    }

    #[test]
    fn test_render_escapes_and_highlights() {
        let mut advisory = row(
            "a1",
            ReviewCategory::Advisory,
            "Фикс <b>кнопки</b>",
            Some("u1"),
        );
        advisory.errors = "contains: фикс".into();
        let mut validation = row(
            "1429989f-e8ac-4eff-bc8f-57f56486db54",
            ReviewCategory::Validation,
            "A & B",
            Some("u1"),
        );
        validation.client_id = Some("2429989f-e8ac-4eff-bc8f-57f56486db54".into());

        let html = render_message("Anna <PM>", &[advisory, validation]);
        assert!(html.starts_with("<b>Anna &lt;PM&gt;</b>\n"));
        assert!(html.contains(
            "1. <a href=\"https://www.notion.so/a1\"><b><i>Фикс</i></b> &lt;b&gt;кнопки&lt;/b&gt;</a>: contains: фикс"
        ));
        assert!(html.contains(
            "2. <a href=\"https://www.notion.so/2429989fe8ac4effbc8f57f56486db54\">A &amp; B</a>"
        ));
    }

    #[tokio::test]
    async fn test_sweep_groups_and_marks() {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| {
                repository::upsert_employee(
                    conn,
                    &Employee {
                        page_id: "e1".into(),
                        user_id: Some("u1".into()),
                        name: "Anna".into(),
                        email: None,
                        avatar_url: None,
                        hourly_rate: None,
                        direction: String::new(),
                        last_edited_time: Utc::now(),
                    },
                )?;
                repository::upsert_review_row(conn, &row("t1", ReviewCategory::Validation, "One", Some("u1")))?;
                repository::upsert_review_row(conn, &row("t2", ReviewCategory::Validation, "Two", Some("u1")))?;
                repository::upsert_review_row(conn, &row("t3", ReviewCategory::Validation, "Three", Some("u2")))?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();

        let notifier = RecordingNotifier::default();
        let chats = vec!["100".to_string(), "200".to_string()];
        let report = sweep(&db, &notifier, &chats).await.unwrap();
        assert_eq!(report.groups_sent, 2);
        assert_eq!(report.rows_notified, 3);

        let sent = notifier.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 4);
        // u1 resolved through the employees table
        assert!(sent[0].1.starts_with("<b>Anna</b>"));
        assert!(sent[0].1.contains("1. ") && sent[0].1.contains("2. "));
        assert!(sent[2].1.starts_with("<b>u2</b>"));

        // Nothing pending on the next sweep
        let report = sweep(&db, &notifier, &chats).await.unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn test_failed_group_stays_pending() {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| {
                repository::upsert_review_row(conn, &row("t1", ReviewCategory::Validation, "Broken", Some("u1")))?;
                repository::upsert_review_row(conn, &row("t2", ReviewCategory::Validation, "Fine", Some("u2")))?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();

        let notifier = RecordingNotifier {
            fail_for: Some("Broken".into()),
            ..Default::default()
        };
        let report = sweep(&db, &notifier, &["100".to_string()]).await.unwrap();
        assert_eq!(report.groups_sent, 1);
        assert_eq!(report.groups_failed, 1);

        let pending = db
            .reader()
            .call(|conn| repository::list_review_rows(conn, true))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].internal_id, "t1");
    }

    #[tokio::test]
    async fn test_sweep_requires_chats() {
        let db = Database::open_memory().await.unwrap();
        let notifier = RecordingNotifier::default();
        assert!(matches!(sweep(&db, &notifier, &[]).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_telegram_send() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/botTOKEN/sendMessage")
            .match_body(mockito::Matcher::PartialJson(json!({
                "chat_id": "100",
                "parse_mode": "HTML",
                "text": "<b>hi</b>"
            })))
            .with_status(200)
            .with_body(r#"{"ok":true,"result":{}}"#)
            .create_async()
            .await;

        let notifier = TelegramNotifier::with_base_url("TOKEN", server.url()).unwrap();
        notifier.send("100", "<b>hi</b>").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_telegram_error_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/botTOKEN/sendMessage")
            .with_status(400)
            .with_body(r#"{"ok":false,"description":"Bad Request: chat not found"}"#)
            .create_async()
            .await;

        let notifier = TelegramNotifier::with_base_url("TOKEN", server.url()).unwrap();
        let err = notifier.send("100", "x").await.unwrap_err();
        assert!(err.to_string().contains("chat not found"));
    }
}
