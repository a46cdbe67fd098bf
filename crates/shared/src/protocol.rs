use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{
    Attachment, ListingId, Message, MessageCategory, MessageId, Thread, ThreadId, UserId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Message,
    Typing,
    Read,
    Connection,
    Error,
    #[serde(other)]
    Unknown,
}

/// Unit exchanged over the push channel: `{ type, data, timestamp, threadId?, userId? }`.
///
/// `data` stays untyped on the wire; the router validates it against the schema
/// for `kind` before anything touches the session model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default)]
    pub data: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
    /// The user the envelope is addressed to, in both directions; the acting
    /// user travels in `data`. Presence names the connecting user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, data: &impl Serialize) -> serde_json::Result<Self> {
        Ok(Self {
            kind,
            data: serde_json::to_value(data)?,
            timestamp: Utc::now(),
            thread_id: None,
            user_id: None,
        })
    }

    pub fn with_thread(mut self, thread_id: ThreadId) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Presence announcement sent right after the channel opens.
    pub fn presence(user_id: &UserId) -> serde_json::Result<Self> {
        Ok(Self::new(
            EnvelopeKind::Connection,
            &ConnectionPayload {
                status: "connected".to_string(),
                user_id: Some(user_id.clone()),
            },
        )?
        .with_user(user_id.clone()))
    }

    /// Announces `message` to its receiver.
    pub fn message(message: &Message) -> serde_json::Result<Self> {
        Ok(Self::new(EnvelopeKind::Message, message)?
            .with_thread(message.thread_id.clone())
            .with_user(message.receiver_id.clone()))
    }

    pub fn typing(
        thread_id: &ThreadId,
        recipient: &UserId,
        payload: &TypingPayload,
    ) -> serde_json::Result<Self> {
        Ok(Self::new(EnvelopeKind::Typing, payload)?
            .with_thread(thread_id.clone())
            .with_user(recipient.clone()))
    }

    pub fn read(
        thread_id: &ThreadId,
        recipient: &UserId,
        payload: &ReadPayload,
    ) -> serde_json::Result<Self> {
        Ok(Self::new(EnvelopeKind::Read, payload)?
            .with_thread(thread_id.clone())
            .with_user(recipient.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub is_typing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPayload {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Body of `POST /api/messages`; opens a thread with `receiver_id` unless one exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewThreadValues {
    pub receiver_id: UserId,
    pub subject: String,
    pub content: String,
    #[serde(rename = "type", default)]
    pub category: MessageCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_id: Option<ListingId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(flatten)]
    pub values: NewThreadValues,
    pub receiver_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub thread: Thread,
    pub message: Message,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyRequest {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyResponse {
    pub message: Message,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<Thread>,
}
