//! Periodic background work: actualize, outbox flush and the daily digest.
//!
//! Each loop re-reads `Settings` on every tick so `config set` takes effect
//! without a restart.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime, NaiveTime};
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::notify::Notifier;
use crate::sync::{CheckpointPolicy, NoopProgress};
use crate::NotionSync;

const RETRY_AFTER_ERROR: Duration = Duration::from_secs(60);

/// Time from `now` until the next occurrence of `at` (strictly in the future).
pub fn until_next_daily(now: NaiveDateTime, at: NaiveTime) -> Duration {
    let today = now.date().and_time(at);
    let next = if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    };
    (next - now).to_std().unwrap_or(RETRY_AFTER_ERROR)
}

/// Start all loops. They run until the returned handles are aborted.
pub fn spawn_all(
    sync: Arc<NotionSync>,
    notifier: Option<Arc<dyn Notifier>>,
) -> Vec<JoinHandle<()>> {
    let mut handles = vec![
        tokio::spawn(actualize_loop(Arc::clone(&sync))),
        tokio::spawn(outbox_loop(Arc::clone(&sync))),
    ];
    match notifier {
        Some(notifier) => handles.push(tokio::spawn(notify_loop(sync, notifier))),
        None => log::warn!("no notifier configured, daily review digest disabled"),
    }
    handles
}

async fn actualize_loop(sync: Arc<NotionSync>) {
    loop {
        let wait = match sync.settings().await {
            Ok(settings) => {
                let options = settings.sync_options(CheckpointPolicy::default(), None);
                match sync.actualize(&options, &NoopProgress).await {
                    Ok(reports) => log::debug!("scheduled actualize: {} passes", reports.len()),
                    Err(Error::AlreadySyncing(_)) => {
                        log::debug!("scheduled actualize skipped, a run is in flight")
                    }
                    Err(e) => log::error!("scheduled actualize failed: {e}"),
                }
                settings.sync_interval
            }
            Err(e) => {
                log::error!("cannot load settings: {e}");
                RETRY_AFTER_ERROR
            }
        };
        tokio::time::sleep(wait).await;
    }
}

async fn outbox_loop(sync: Arc<NotionSync>) {
    loop {
        let wait = match sync.settings().await {
            Ok(settings) => {
                if settings.times_db.is_empty() {
                    log::debug!("outbox: times_db not configured");
                } else {
                    match sync.outbox_flush(&settings.times_db).await {
                        Ok(r) if r.sent + r.failed > 0 => {
                            log::info!("outbox: {} sent, {} still queued", r.sent, r.failed)
                        }
                        Ok(_) => {}
                        Err(e) => log::error!("outbox flush failed: {e}"),
                    }
                }
                settings.outbox_interval
            }
            Err(e) => {
                log::error!("cannot load settings: {e}");
                RETRY_AFTER_ERROR
            }
        };
        tokio::time::sleep(wait).await;
    }
}

async fn notify_loop(sync: Arc<NotionSync>, notifier: Arc<dyn Notifier>) {
    loop {
        let settings = match sync.settings().await {
            Ok(s) => s,
            Err(e) => {
                log::error!("cannot load settings: {e}");
                tokio::time::sleep(RETRY_AFTER_ERROR).await;
                continue;
            }
        };
        let wait = until_next_daily(Local::now().naive_local(), settings.notify_at);
        log::debug!("next review digest in {}s", wait.as_secs());
        tokio::time::sleep(wait).await;

        // Chat list as of send time
        let chat_ids = match sync.settings().await {
            Ok(s) => s.notify_chat_ids,
            Err(_) => settings.notify_chat_ids,
        };
        if let Err(e) = sync.notify(notifier.as_ref(), &chat_ids).await {
            log::error!("review digest failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 5)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_later_today() {
        let wait = until_next_daily(at(18, 30), NaiveTime::from_hms_opt(20, 0, 0).unwrap());
        assert_eq!(wait, Duration::from_secs(90 * 60));
    }

    #[test]
    fn test_already_passed_rolls_to_tomorrow() {
        let wait = until_next_daily(at(21, 0), NaiveTime::from_hms_opt(20, 0, 0).unwrap());
        assert_eq!(wait, Duration::from_secs(23 * 3600));
    }

    #[test]
    fn test_exactly_now_is_tomorrow() {
        let wait = until_next_daily(at(20, 0), NaiveTime::from_hms_opt(20, 0, 0).unwrap());
        assert_eq!(wait, Duration::from_secs(24 * 3600));
    }
}
