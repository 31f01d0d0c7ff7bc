use std::time::Duration;

pub const MAX_RETRIES: u32 = 3;
const BACKOFF_SECONDS: &[u64] = &[60, 120, 240];

/// Seconds to wait before retry `attempt`, preferring the server's
/// `Retry-After` value.
pub fn wait_seconds(retry_after: Option<u64>, attempt: u32) -> u64 {
    retry_after.unwrap_or_else(|| {
        BACKOFF_SECONDS
            .get(attempt as usize)
            .copied()
            .unwrap_or(240)
    })
}

/// Sleep before retry `attempt`.
pub async fn backoff_sleep(retry_after: Option<u64>, attempt: u32) {
    let wait = wait_seconds(retry_after, attempt);
    log::warn!(
        "Rate limited (429). Waiting {wait}s before retry {}/{}",
        attempt + 1,
        MAX_RETRIES
    );
    tokio::time::sleep(Duration::from_secs(wait)).await;
}

/// Retry an API call expression on 429 responses.
///
/// Usage: `retry_api!(workspace.get_page(id))`
///
/// The expression is re-evaluated on each retry attempt. Other errors are
/// returned immediately as `Error::Api`.
macro_rules! retry_api {
    ($expr:expr) => {{
        let mut _attempt: u32 = 0;
        loop {
            match $expr.await {
                Ok(val) => break Ok::<_, crate::error::Error>(val),
                Err(crate::notion::Error::RateLimited { retry_after, .. })
                    if _attempt < $crate::sync::rate_limit::MAX_RETRIES =>
                {
                    $crate::sync::rate_limit::backoff_sleep(retry_after, _attempt).await;
                    _attempt += 1;
                }
                Err(e) => break Err(crate::error::Error::Api(e)),
            }
        }
    }};
}

pub(crate) use retry_api;
