//! HTTP transport and store backed by a Parley gateway.

use async_trait::async_trait;
use futures::StreamExt;
use parley_core::error::StoreError;
use parley_core::message::Message;
use parley_core::store::{ConversationStore, ensure_persistable};
use parley_core::stream::ChatRequest;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::driver::{ByteStream, ChatTransport};
use crate::error::ClientError;

/// Header carrying the organization scope on thread routes.
pub const ORG_HEADER: &str = "X-Org-Id";

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_default()
}

/// Opens `POST /v1/chat/stream` and hands back the raw body.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn open(&self, request: &ChatRequest) -> Result<ByteStream, ClientError> {
        let url = format!("{}/v1/chat/stream", self.base_url);
        debug!(%url, thread_id = %request.thread_id, "Opening chat stream");

        let response = self
            .client
            .post(&url)
            .header("Accept", "text/event-stream")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(ClientError::from));
        Ok(Box::pin(bytes))
    }
}

/// [`ConversationStore`] over the gateway's thread routes.
#[derive(Clone)]
pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct AppendResponse {
    id: String,
}

impl HttpStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// `{base}/v1/threads/{thread_id}/messages[/{tail}]`, with the thread id
    /// percent-encoded as a single path segment.
    fn messages_url(&self, thread_id: &str, tail: Option<&str>) -> Result<reqwest::Url, StoreError> {
        let invalid = || StoreError::QueryFailed(format!("invalid gateway URL: {}", self.base_url));
        let mut url = reqwest::Url::parse(&self.base_url).map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|_| invalid())?
            .pop_if_empty()
            .extend(["v1", "threads", thread_id, "messages"])
            .extend(tail);
        Ok(url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status.as_u16() {
            422 => StoreError::Rejected(body),
            502..=504 => StoreError::Unreachable(body),
            code => StoreError::QueryFailed(format!("HTTP {code}: {body}")),
        })
    }
}

fn transport_error(err: reqwest::Error) -> StoreError {
    StoreError::Unreachable(err.to_string())
}

fn malformed(err: reqwest::Error) -> StoreError {
    StoreError::QueryFailed(format!("unexpected response body: {err}"))
}

#[async_trait]
impl ConversationStore for HttpStore {
    fn name(&self) -> &str {
        "http"
    }

    async fn append(&self, thread_id: &str, org_id: &str, message: &Message) -> Result<String, StoreError> {
        ensure_persistable(message)?;
        let response = self
            .client
            .post(self.messages_url(thread_id, None)?)
            .header(ORG_HEADER, org_id)
            .json(message)
            .send()
            .await
            .map_err(transport_error)?;
        let body: AppendResponse = Self::check(response).await?.json().await.map_err(malformed)?;
        Ok(body.id)
    }

    async fn last_message(&self, thread_id: &str, org_id: &str) -> Result<Option<Message>, StoreError> {
        let response = self
            .client
            .get(self.messages_url(thread_id, Some("last"))?)
            .header(ORG_HEADER, org_id)
            .send()
            .await
            .map_err(transport_error)?;
        Self::check(response).await?.json().await.map_err(malformed)
    }

    async fn history(&self, thread_id: &str, org_id: &str) -> Result<Vec<Message>, StoreError> {
        let response = self
            .client
            .get(self.messages_url(thread_id, None)?)
            .header(ORG_HEADER, org_id)
            .send()
            .await
            .map_err(transport_error)?;
        Self::check(response).await?.json().await.map_err(malformed)
    }
}
