use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::{json, Value};

use super::filter::QueryRequest;
use super::types::{BlockPage, Icon, Page, Properties, QueryPage};
use super::{ApiResult, Error, Workspace};

pub const DEFAULT_BASE_URL: &str = "https://api.notion.com/v1";
pub const NOTION_VERSION: &str = "2022-06-28";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the workspace API.
///
/// Every call is a single request: non-2xx responses become errors carrying
/// the body, and nothing is retried here.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl Client {
    pub fn new(token: impl Into<String>) -> ApiResult<Self> {
        Self::with_base_url(token, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
            .header("Notion-Version", NOTION_VERSION)
    }

    async fn send(&self, req: RequestBuilder) -> ApiResult<Value> {
        let response = req.send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(Error::RateLimited { retry_after, body });
        }

        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::Status {
                status: status.as_u16(),
                body,
            });
        }
        log::debug!("{status} ({} bytes)", body.len());
        serde_json::from_str(&body).map_err(|e| Error::Decode(e.to_string()))
    }

    fn decode<T: serde::de::DeserializeOwned>(value: Value) -> ApiResult<T> {
        serde_json::from_value(value).map_err(|e| Error::Decode(e.to_string()))
    }
}

#[async_trait]
impl Workspace for Client {
    async fn query(&self, database_id: &str, request: &QueryRequest) -> ApiResult<QueryPage> {
        log::debug!("query database {database_id}");
        let req = self
            .request(reqwest::Method::POST, &format!("/databases/{database_id}/query"))
            .json(&request.to_json());
        Self::decode(self.send(req).await?)
    }

    async fn get_page(&self, page_id: &str) -> ApiResult<Page> {
        log::debug!("get page {page_id}");
        let req = self.request(reqwest::Method::GET, &format!("/pages/{page_id}"));
        Self::decode(self.send(req).await?)
    }

    async fn list_children(&self, block_id: &str, cursor: Option<&str>) -> ApiResult<BlockPage> {
        log::debug!("list children of {block_id}");
        let mut req = self
            .request(reqwest::Method::GET, &format!("/blocks/{block_id}/children"))
            .query(&[("page_size", "100")]);
        if let Some(cursor) = cursor {
            req = req.query(&[("start_cursor", cursor)]);
        }
        Self::decode(self.send(req).await?)
    }

    async fn create_page(
        &self,
        database_id: &str,
        properties: &Properties,
        children: Option<&[Value]>,
        icon: Option<&Icon>,
    ) -> ApiResult<String> {
        let mut body = json!({
            "parent": { "type": "database_id", "database_id": database_id },
            "properties": properties.to_json(),
        });
        if let Some(children) = children {
            body["children"] = Value::Array(children.to_vec());
        }
        if let Some(icon) = icon {
            body["icon"] = icon.to_json();
        }
        log::debug!("create page in {database_id}");
        let req = self.request(reqwest::Method::POST, "/pages").json(&body);
        let created = self.send(req).await?;
        created
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Decode("create response has no page id".into()))
    }

    async fn update_page(&self, page_id: &str, properties: &Properties) -> ApiResult<()> {
        log::debug!("update page {page_id}");
        let req = self
            .request(reqwest::Method::PATCH, &format!("/pages/{page_id}"))
            .json(&json!({ "properties": properties.to_json() }));
        self.send(req).await?;
        Ok(())
    }
}
