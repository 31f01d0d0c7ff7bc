use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::storage::{repository, Database};

/// How long a lease outlives its last heartbeat.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

static NEXT_HOLDER: AtomicU64 = AtomicU64::new(0);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn ttl_secs(ttl: Duration) -> i64 {
    ttl.as_secs().max(1) as i64
}

/// Per-scope leases stored in the `sync_leases` table.
///
/// Every process (and every `ScopeLocks`) sharing the database competes for
/// the same rows, so a scope is held by at most one pass at a time. A second
/// pass for a held scope is rejected, not queued. Held leases are renewed in
/// the background; a holder that dies stops renewing and its row can be taken
/// over once it expires.
#[derive(Clone)]
pub struct ScopeLocks {
    db: Database,
    holder: String,
    ttl: Duration,
    held: Arc<Mutex<HashSet<String>>>,
}

impl ScopeLocks {
    pub fn new(db: Database) -> Self {
        Self::with_ttl(db, DEFAULT_TTL)
    }

    pub fn with_ttl(db: Database, ttl: Duration) -> Self {
        let holder = format!(
            "{}-{}-{}",
            std::process::id(),
            Utc::now().timestamp_micros(),
            NEXT_HOLDER.fetch_add(1, Ordering::Relaxed)
        );
        Self {
            db,
            holder,
            ttl,
            held: Arc::default(),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub async fn try_acquire(&self, scope: &str) -> Result<Lease> {
        if !lock(&self.held).insert(scope.to_string()) {
            return Err(Error::AlreadySyncing(scope.to_string()));
        }
        // Built before the insert so a cancelled acquire still cleans up.
        let mut lease = Lease {
            scope: scope.to_string(),
            holder: self.holder.clone(),
            db: self.db.clone(),
            held: Arc::clone(&self.held),
            heartbeat: None,
            released: false,
        };

        let granted = self
            .db
            .writer()
            .call({
                let scope = scope.to_string();
                let holder = self.holder.clone();
                let ttl = ttl_secs(self.ttl);
                move |conn| {
                    repository::try_acquire_lease(conn, &scope, &holder, Utc::now().timestamp(), ttl)
                }
            })
            .await?;
        if !granted {
            lease.released = true;
            lock(&self.held).remove(scope);
            return Err(Error::AlreadySyncing(scope.to_string()));
        }

        log::debug!("acquired lease {scope} as {}", self.holder);
        lease.heartbeat = Some(self.spawn_heartbeat(scope));
        Ok(lease)
    }

    /// Like `try_acquire`, but keeps polling until `timeout` passes.
    pub async fn acquire_wait(&self, scope: &str, timeout: Duration) -> Result<Lease> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.try_acquire(scope).await {
                Err(Error::AlreadySyncing(_)) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                other => return other,
            }
        }
    }

    /// Whether this instance holds `scope`. Holders elsewhere are not seen.
    pub fn is_held(&self, scope: &str) -> bool {
        lock(&self.held).contains(scope)
    }

    fn spawn_heartbeat(&self, scope: &str) -> JoinHandle<()> {
        let db = self.db.clone();
        let scope = scope.to_string();
        let holder = self.holder.clone();
        let ttl = self.ttl;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(ttl / 3).await;
                let renewed = db
                    .writer()
                    .call({
                        let scope = scope.clone();
                        let holder = holder.clone();
                        move |conn| {
                            repository::renew_lease(
                                conn,
                                &scope,
                                &holder,
                                Utc::now().timestamp(),
                                ttl_secs(ttl),
                            )
                        }
                    })
                    .await;
                match renewed {
                    Ok(true) => {}
                    Ok(false) => {
                        log::warn!("lease {scope} expired and was taken over");
                        break;
                    }
                    Err(e) => log::warn!("cannot renew lease {scope}: {e}"),
                }
            }
        })
    }
}

/// A held scope. Give it back with `release`; dropping it (a cancelled or
/// panicking pass) frees the local slot and deletes the row in the
/// background.
pub struct Lease {
    scope: String,
    holder: String,
    db: Database,
    held: Arc<Mutex<HashSet<String>>>,
    heartbeat: Option<JoinHandle<()>>,
    released: bool,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("scope", &self.scope)
            .field("holder", &self.holder)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Lease {
    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub async fn release(mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        let result = self
            .db
            .writer()
            .call({
                let scope = self.scope.clone();
                let holder = self.holder.clone();
                move |conn| repository::release_lease(conn, &scope, &holder)
            })
            .await;
        match result {
            Ok(true) => log::debug!("released lease {}", self.scope()),
            Ok(false) => log::warn!("lease {} was no longer ours at release", self.scope()),
            Err(e) => log::warn!("cannot release lease {}, it will expire: {e}", self.scope()),
        }
        self.released = true;
        lock(&self.held).remove(&self.scope);
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        if self.released {
            return;
        }
        lock(&self.held).remove(&self.scope);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let db = self.db.clone();
                let scope = self.scope.clone();
                let holder = self.holder.clone();
                handle.spawn(async move {
                    let _ = db
                        .writer()
                        .call(move |conn| repository::release_lease(conn, &scope, &holder))
                        .await;
                });
            }
            Err(_) => log::warn!("lease {} dropped outside a runtime, left to expire", self.scope),
        }
    }
}
