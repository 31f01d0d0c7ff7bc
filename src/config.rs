//! Deployment settings from `app_config`, secrets from the environment.

use std::time::Duration;

use chrono::NaiveTime;

use crate::date_util::TimestampStyle;
use crate::error::{Error, Result};
use crate::notion::client::DEFAULT_BASE_URL;
use crate::storage::repository;
use crate::storage::Database;
use crate::sync::{CheckpointPolicy, SyncOptions};

pub const TASKS_DB: &str = "tasks_db";
pub const TIMES_DB: &str = "times_db";
pub const EMPLOYEES_DB: &str = "employees_db";
pub const PROJECTS_DB: &str = "projects_db";
pub const TIMESTAMP_STYLE: &str = "timestamp_style";
pub const NOTIFY_CHAT_IDS: &str = "notify_chat_ids";
pub const NOTIFY_AT: &str = "notify_at";
pub const SYNC_INTERVAL_SECS: &str = "sync_interval_secs";
pub const OUTBOX_INTERVAL_SECS: &str = "outbox_interval_secs";
pub const MAX_PARALLEL_PROJECTS: &str = "max_parallel_projects";
pub const OPEN_TASK_STATUSES: &str = "open_task_statuses";

pub const KNOWN_KEYS: &[&str] = &[
    TASKS_DB,
    TIMES_DB,
    EMPLOYEES_DB,
    PROJECTS_DB,
    TIMESTAMP_STYLE,
    NOTIFY_CHAT_IDS,
    NOTIFY_AT,
    SYNC_INTERVAL_SECS,
    OUTBOX_INTERVAL_SECS,
    MAX_PARALLEL_PROJECTS,
    OPEN_TASK_STATUSES,
];

pub const DEFAULT_OPEN_STATUSES: &[&str] = &["Не начата", "В работе", "На проверке", "Пауза"];

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub tasks_db: String,
    pub times_db: String,
    pub employees_db: String,
    pub projects_db: String,
    pub timestamp_style: TimestampStyle,
    pub notify_chat_ids: Vec<String>,
    /// Local time of the daily review digest.
    pub notify_at: NaiveTime,
    pub sync_interval: Duration,
    pub outbox_interval: Duration,
    pub max_parallel_projects: usize,
    pub open_task_statuses: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tasks_db: String::new(),
            times_db: String::new(),
            employees_db: String::new(),
            projects_db: String::new(),
            timestamp_style: TimestampStyle::default(),
            notify_chat_ids: Vec::new(),
            notify_at: NaiveTime::from_hms_opt(20, 0, 0).unwrap_or_default(),
            sync_interval: Duration::from_secs(60),
            outbox_interval: Duration::from_secs(60),
            max_parallel_projects: 4,
            open_task_statuses: DEFAULT_OPEN_STATUSES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_secs(key: &str, value: &str) -> Result<Duration> {
    match value.trim().parse::<u64>() {
        Ok(0) | Err(_) => Err(Error::Config(format!(
            "{key} must be a positive number of seconds, got '{value}'"
        ))),
        Ok(n) => Ok(Duration::from_secs(n)),
    }
}

/// Validate a `config set` value and return the form to store.
pub fn normalize_entry(key: &str, value: &str) -> Result<String> {
    let value = value.trim();
    match key {
        TASKS_DB | TIMES_DB | EMPLOYEES_DB | PROJECTS_DB => crate::url::resolve_id(value),
        TIMESTAMP_STYLE => Ok(value.parse::<TimestampStyle>()?.as_str().to_string()),
        NOTIFY_CHAT_IDS | OPEN_TASK_STATUSES => Ok(split_list(value).join(",")),
        NOTIFY_AT => NaiveTime::parse_from_str(value, "%H:%M")
            .map(|t| t.format("%H:%M").to_string())
            .map_err(|_| Error::Config(format!("{key} must be HH:MM, got '{value}'"))),
        SYNC_INTERVAL_SECS | OUTBOX_INTERVAL_SECS => {
            parse_secs(key, value).map(|d| d.as_secs().to_string())
        }
        MAX_PARALLEL_PROJECTS => match value.parse::<usize>() {
            Ok(n) if n > 0 => Ok(n.to_string()),
            _ => Err(Error::Config(format!(
                "{key} must be a positive integer, got '{value}'"
            ))),
        },
        other => Err(Error::Config(format!(
            "unknown config key '{other}' (known: {})",
            KNOWN_KEYS.join(", ")
        ))),
    }
}

impl Settings {
    pub async fn load(db: &Database) -> Result<Self> {
        let pairs = db.reader().call(|conn| repository::list_config(conn)).await?;
        Self::from_pairs(&pairs)
    }

    /// Build from stored key/value pairs. Unknown keys are ignored.
    pub fn from_pairs(pairs: &[(String, String)]) -> Result<Self> {
        let mut s = Self::default();
        for (key, value) in pairs {
            match key.as_str() {
                TASKS_DB => s.tasks_db = value.clone(),
                TIMES_DB => s.times_db = value.clone(),
                EMPLOYEES_DB => s.employees_db = value.clone(),
                PROJECTS_DB => s.projects_db = value.clone(),
                TIMESTAMP_STYLE => s.timestamp_style = value.parse()?,
                NOTIFY_CHAT_IDS => s.notify_chat_ids = split_list(value),
                NOTIFY_AT => {
                    s.notify_at = NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|_| {
                        Error::Config(format!("{NOTIFY_AT} must be HH:MM, got '{value}'"))
                    })?
                }
                SYNC_INTERVAL_SECS => s.sync_interval = parse_secs(key, value)?,
                OUTBOX_INTERVAL_SECS => s.outbox_interval = parse_secs(key, value)?,
                MAX_PARALLEL_PROJECTS => {
                    s.max_parallel_projects = normalize_entry(key, value)?
                        .parse()
                        .map_err(|_| Error::Config(format!("bad {key}: '{value}'")))?
                }
                OPEN_TASK_STATUSES => s.open_task_statuses = split_list(value),
                _ => log::debug!("ignoring unknown config key {key}"),
            }
        }
        Ok(s)
    }

    /// Options for a sync pass under these settings.
    pub fn sync_options(&self, policy: CheckpointPolicy, project: Option<String>) -> SyncOptions {
        SyncOptions {
            policy,
            project,
            timestamp_style: self.timestamp_style,
            max_parallel_projects: self.max_parallel_projects,
            tasks_db: self.tasks_db.clone(),
            times_db: self.times_db.clone(),
            employees_db: self.employees_db.clone(),
            projects_db: self.projects_db.clone(),
        }
    }
}

/// Credentials and endpoints taken from the environment.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    pub notion_token: Option<String>,
    pub notion_api_url: String,
    pub telegram_bot_token: Option<String>,
    pub api_token: Option<String>,
}

impl Secrets {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            notion_token: var("NOTION_TOKEN"),
            notion_api_url: var("NOTION_API_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            telegram_bot_token: var("TELEGRAM_BOT_TOKEN"),
            api_token: var("NOTIONSYNC_API_TOKEN"),
        }
    }

    pub fn require_notion_token(&self) -> Result<&str> {
        self.notion_token
            .as_deref()
            .ok_or_else(|| Error::Config("NOTION_TOKEN is not set".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let s = Settings::from_pairs(&[]).unwrap();
        assert_eq!(s.notify_at, NaiveTime::from_hms_opt(20, 0, 0).unwrap());
        assert_eq!(s.sync_interval, Duration::from_secs(60));
        assert_eq!(s.max_parallel_projects, 4);
        assert_eq!(s.timestamp_style, TimestampStyle::Offset);
        assert!(s.open_task_statuses.contains(&"В работе".to_string()));
    }

    #[test]
    fn test_from_pairs() {
        let s = Settings::from_pairs(&pairs(&[
            (TIMES_DB, "db-times"),
            (TIMESTAMP_STYLE, "zulu"),
            (NOTIFY_CHAT_IDS, "100, 200,,"),
            (NOTIFY_AT, "09:30"),
            (SYNC_INTERVAL_SECS, "300"),
            ("something_else", "x"),
        ]))
        .unwrap();
        assert_eq!(s.times_db, "db-times");
        assert_eq!(s.timestamp_style, TimestampStyle::Zulu);
        assert_eq!(s.notify_chat_ids, vec!["100", "200"]);
        assert_eq!(s.notify_at, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        assert_eq!(s.sync_interval, Duration::from_secs(300));

        let opts = s.sync_options(CheckpointPolicy::Skip, None);
        assert_eq!(opts.times_db, "db-times");
        assert_eq!(opts.policy, CheckpointPolicy::Skip);
    }

    #[test]
    fn test_bad_values_rejected() {
        assert!(Settings::from_pairs(&pairs(&[(SYNC_INTERVAL_SECS, "0")])).is_err());
        assert!(Settings::from_pairs(&pairs(&[(NOTIFY_AT, "8pm")])).is_err());
        assert!(Settings::from_pairs(&pairs(&[(TIMESTAMP_STYLE, "local")])).is_err());
    }

    #[test]
    fn test_normalize_entry() {
        assert_eq!(
            normalize_entry(TASKS_DB, "1429989FE8AC4EFFBC8F57F56486DB54").unwrap(),
            "1429989f-e8ac-4eff-bc8f-57f56486db54"
        );
        assert_eq!(normalize_entry(NOTIFY_AT, " 07:05 ").unwrap(), "07:05");
        assert_eq!(normalize_entry(NOTIFY_CHAT_IDS, " 1 , 2 ").unwrap(), "1,2");
        assert!(normalize_entry(MAX_PARALLEL_PROJECTS, "0").is_err());
        assert!(normalize_entry("workspace_gid", "x").is_err());
    }

    #[tokio::test]
    async fn test_load_from_database() {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| repository::set_config(conn, MAX_PARALLEL_PROJECTS, "2"))
            .await
            .unwrap();
        let s = Settings::load(&db).await.unwrap();
        assert_eq!(s.max_parallel_projects, 2);
    }
}
