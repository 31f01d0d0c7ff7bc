pub mod client;
pub mod filter;
pub mod types;

use async_trait::async_trait;
use serde_json::Value;

pub use client::Client;
pub use filter::{Filter, QueryRequest, Sort, TimestampKind};
pub use types::{Block, BlockPage, ChildTitle, Icon, Page, Properties, PropertyValue, QueryPage};

/// Errors from the workspace API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("rate limited (429): {body}")]
    RateLimited {
        retry_after: Option<u64>,
        body: String,
    },

    #[error("cannot decode response: {0}")]
    Decode(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Status { status: 404, .. })
    }
}

pub type ApiResult<T> = std::result::Result<T, Error>;

/// The calls the sync engine makes against the workspace.
#[async_trait]
pub trait Workspace: Send + Sync {
    /// One page of `POST /databases/{id}/query`.
    async fn query(&self, database_id: &str, request: &QueryRequest) -> ApiResult<QueryPage>;

    async fn get_page(&self, page_id: &str) -> ApiResult<Page>;

    /// One page of `GET /blocks/{id}/children`.
    async fn list_children(&self, block_id: &str, cursor: Option<&str>) -> ApiResult<BlockPage>;

    /// Create a page in a database and return its ID.
    async fn create_page(
        &self,
        database_id: &str,
        properties: &Properties,
        children: Option<&[Value]>,
        icon: Option<&Icon>,
    ) -> ApiResult<String>;

    async fn update_page(&self, page_id: &str, properties: &Properties) -> ApiResult<()>;
}
