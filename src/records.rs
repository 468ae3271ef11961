// Record collaborator: conversations, message pages, user search and uploads over REST.

use async_trait::async_trait;
use log::debug;
use reqwest::multipart::{Form, Part};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::error::RecordError;
use crate::models::{Attachment, Conversation, Message, UserRef};
use crate::stream::draft::LocalFile;

#[async_trait]
pub trait RecordApi: Send + Sync {
    /// `GET /conversations`
    async fn list_conversations(&self) -> Result<Vec<Conversation>, RecordError>;

    /// `GET /messages/{conversationId}?page&limit`; page 1 is the newest,
    /// messages within a page are oldest first.
    async fn fetch_messages(
        &self,
        conversation_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Message>, RecordError>;

    /// `POST /conversations {receiverId}`, create-or-fetch.
    async fn create_conversation(&self, receiver_id: &str) -> Result<Conversation, RecordError>;

    /// `GET /users/search?query=`
    async fn search_users(&self, query: &str) -> Result<Vec<UserRef>, RecordError>;

    /// `POST /upload` (multipart)
    async fn upload(&self, file: &LocalFile) -> Result<Attachment, RecordError>;

    /// `PUT /conversations/{id}/read`
    async fn mark_read(&self, conversation_id: &str) -> Result<(), RecordError>;
}

// Some deployments wrap bodies as `{"data": ...}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum Body<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Body<T> {
    fn into_inner(self) -> T {
        match self {
            Body::Wrapped { data } => data,
            Body::Bare(value) => value,
        }
    }
}

pub struct HttpRecordClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpRecordClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, RecordError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, RecordError> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();
        if !status.is_success() {
            debug!("Record request failed with {}", status);
            return Err(RecordError::Status(status.as_u16()));
        }
        Ok(response)
    }

    async fn fetch_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RecordError> {
        let body = self.send(request).await?.bytes().await?;
        let parsed: Body<T> = serde_json::from_slice(&body)?;
        Ok(parsed.into_inner())
    }
}

#[async_trait]
impl RecordApi for HttpRecordClient {
    async fn list_conversations(&self) -> Result<Vec<Conversation>, RecordError> {
        self.fetch_json(self.http.get(self.url("conversations"))).await
    }

    async fn fetch_messages(
        &self,
        conversation_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Message>, RecordError> {
        let request = self
            .http
            .get(self.url(&format!("messages/{}", conversation_id)))
            .query(&[("page", page), ("limit", limit)]);
        self.fetch_json(request).await
    }

    async fn create_conversation(&self, receiver_id: &str) -> Result<Conversation, RecordError> {
        let request = self
            .http
            .post(self.url("conversations"))
            .json(&json!({ "receiverId": receiver_id }));
        self.fetch_json(request).await
    }

    async fn search_users(&self, query: &str) -> Result<Vec<UserRef>, RecordError> {
        let request = self
            .http
            .get(self.url("users/search"))
            .query(&[("query", query)]);
        self.fetch_json(request).await
    }

    async fn upload(&self, file: &LocalFile) -> Result<Attachment, RecordError> {
        let bytes = tokio::fs::read(&file.path).await?;
        let part = Part::bytes(bytes).file_name(file.file_name.clone());
        let form = Form::new().part("file", part);
        self.fetch_json(self.http.post(self.url("upload")).multipart(form)).await
    }

    async fn mark_read(&self, conversation_id: &str) -> Result<(), RecordError> {
        let request = self
            .http
            .put(self.url(&format!("conversations/{}/read", conversation_id)));
        self.send(request).await.map(|_| ())
    }
}
