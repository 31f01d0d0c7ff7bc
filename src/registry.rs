use crate::error::{Error, Result};
use crate::storage::repository;
use crate::storage::Database;

/// Bidirectional source-page <-> mirror-page mapping.
///
/// A source page is mirrored at most once: `set` refuses to overwrite an
/// existing mapping, which is how concurrent creators detect they lost.
#[derive(Clone)]
pub struct IdRegistry {
    db: Database,
}

impl IdRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get_client_id(&self, internal_id: &str) -> Result<Option<String>> {
        let internal_id = internal_id.to_string();
        Ok(self
            .db
            .reader()
            .call(move |conn| repository::get_client_id(conn, &internal_id))
            .await?)
    }

    pub async fn get_internal_id(&self, client_id: &str) -> Result<Option<String>> {
        let client_id = client_id.to_string();
        Ok(self
            .db
            .reader()
            .call(move |conn| repository::get_internal_id(conn, &client_id))
            .await?)
    }

    /// Like `get_client_id`, but a missing mapping is `Error::NotFound`.
    pub async fn client_id(&self, internal_id: &str) -> Result<String> {
        self.get_client_id(internal_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no mirror for {internal_id}")))
    }

    /// Record a new mapping. Fails with `AlreadyMapped` if `internal_id`
    /// already has one.
    pub async fn set(&self, internal_id: &str, client_id: &str) -> Result<()> {
        let (inserted, existing) = self
            .db
            .writer()
            .call({
                let internal_id = internal_id.to_string();
                let client_id = client_id.to_string();
                move |conn| {
                    let inserted = repository::insert_mapping(conn, &internal_id, &client_id)?;
                    let existing = if inserted {
                        None
                    } else {
                        repository::get_client_id(conn, &internal_id)?
                    };
                    Ok::<_, rusqlite::Error>((inserted, existing))
                }
            })
            .await?;

        if inserted {
            return Ok(());
        }
        match existing {
            Some(existing) => Err(Error::AlreadyMapped {
                internal_id: internal_id.to_string(),
                client_id: existing,
            }),
            // internal_id is free, so the client_id is taken by another record
            None => Err(Error::Mapping(format!(
                "mirror page {client_id} is already mapped to another record"
            ))),
        }
    }
}
