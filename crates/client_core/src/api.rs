use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{Message, Thread, ThreadId},
    error::ApiError,
    protocol::{ReplyRequest, ReplyResponse, SendMessageRequest, SendMessageResponse},
};
use tracing::debug;

use crate::{
    auth::CredentialProvider,
    config::Settings,
    error::{ClientError, Result},
};

/// Durable side of messaging: every write lands here before it is announced.
#[async_trait]
pub trait MessagingApi: Send + Sync {
    async fn fetch_threads(&self) -> Result<Vec<Thread>>;
    async fn fetch_messages(&self, thread_id: &ThreadId) -> Result<Vec<Message>>;
    async fn send_message(&self, request: &SendMessageRequest) -> Result<SendMessageResponse>;
    async fn send_reply(&self, thread_id: &ThreadId, content: &str) -> Result<ReplyResponse>;
    async fn mark_thread_read(&self, thread_id: &ThreadId) -> Result<Thread>;
    async fn delete_thread(&self, thread_id: &ThreadId) -> Result<()>;
}

pub struct HttpMessagingApi {
    http: Client,
    settings: Settings,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpMessagingApi {
    pub fn new(settings: Settings, credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        let http = Client::builder()
            .timeout(settings.request_timeout())
            .build()?;
        Ok(Self {
            http,
            settings,
            credentials,
        })
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let token = self
            .credentials
            .bearer_token()
            .await?
            .ok_or(ClientError::Unauthenticated)?;
        Ok(request.bearer_auth(token))
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self.authorized(request).await?.send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }
}

/// Maps a non-2xx response to `ClientError::Api`, keeping the server's message when
/// the body carries one.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => api_error.message,
        Err(_) if body.trim().is_empty() => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string(),
        Err(_) => body,
    };
    Err(ClientError::Api {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl MessagingApi for HttpMessagingApi {
    async fn fetch_threads(&self) -> Result<Vec<Thread>> {
        let threads: Vec<Thread> = self
            .send_json(self.http.get(self.settings.api_url("/api/messages/threads")))
            .await?;
        debug!(count = threads.len(), "api: fetched threads");
        Ok(threads)
    }

    async fn fetch_messages(&self, thread_id: &ThreadId) -> Result<Vec<Message>> {
        let url = self.settings.thread_url(thread_id, None)?;
        let messages: Vec<Message> = self.send_json(self.http.get(url)).await?;
        debug!(
            thread_id = thread_id.as_str(),
            count = messages.len(),
            "api: fetched messages"
        );
        Ok(messages)
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<SendMessageResponse> {
        self.send_json(
            self.http
                .post(self.settings.api_url("/api/messages"))
                .json(request),
        )
        .await
    }

    async fn send_reply(&self, thread_id: &ThreadId, content: &str) -> Result<ReplyResponse> {
        let url = self.settings.thread_url(thread_id, Some("reply"))?;
        self.send_json(self.http.post(url).json(&ReplyRequest {
            content: content.to_string(),
        }))
        .await
    }

    async fn mark_thread_read(&self, thread_id: &ThreadId) -> Result<Thread> {
        let url = self.settings.thread_url(thread_id, Some("read"))?;
        self.send_json(self.http.put(url)).await
    }

    async fn delete_thread(&self, thread_id: &ThreadId) -> Result<()> {
        let url = self.settings.thread_url(thread_id, None)?;
        let response = self.authorized(self.http.delete(url)).await?.send().await?;
        check_status(response).await?;
        Ok(())
    }
}
