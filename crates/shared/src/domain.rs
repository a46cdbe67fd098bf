use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ThreadId);
id_newtype!(MessageId);
id_newtype!(ListingId);

/// Lifecycle of the single push connection owned by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageCategory {
    #[default]
    General,
    Inquiry,
    Adoption,
    Support,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(alias = "_id")]
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub sender_id: UserId,
    #[serde(default)]
    pub sender_name: String,
    pub receiver_id: UserId,
    #[serde(default)]
    pub receiver_name: String,
    pub content: String,
    #[serde(default)]
    pub subject: String,
    #[serde(rename = "type", default)]
    pub category: MessageCategory,
    #[serde(alias = "createdAt")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

/// Denormalized copy of a thread's most recent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    #[serde(default, alias = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub content: String,
    pub sender_id: UserId,
    pub timestamp: DateTime<Utc>,
}

impl From<&Message> for LastMessage {
    fn from(message: &Message) -> Self {
        Self {
            id: Some(message.id.clone()),
            content: message.content.clone(),
            sender_id: message.sender_id.clone(),
            timestamp: message.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    #[serde(alias = "_id")]
    pub id: ThreadId,
    pub participants: Vec<UserId>,
    #[serde(default)]
    pub participant_names: BTreeMap<UserId, String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_id: Option<ListingId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub message_count: u32,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub unread_count: BTreeMap<UserId, u32>,
}

impl Thread {
    /// Builds a summary for a thread first seen through one of its messages.
    pub fn from_first_message(message: &Message) -> Self {
        let mut participant_names = BTreeMap::new();
        participant_names.insert(message.sender_id.clone(), message.sender_name.clone());
        participant_names.insert(message.receiver_id.clone(), message.receiver_name.clone());
        Self {
            id: message.thread_id.clone(),
            participants: vec![message.sender_id.clone(), message.receiver_id.clone()],
            participant_names,
            subject: message.subject.clone(),
            listing_id: None,
            last_message: None,
            message_count: 0,
            updated_at: message.timestamp,
            unread_count: BTreeMap::new(),
        }
    }

    pub fn unread_for(&self, user_id: &UserId) -> u32 {
        self.unread_count.get(user_id).copied().unwrap_or(0)
    }

    /// First participant that is not `user_id`.
    pub fn counterpart(&self, user_id: &UserId) -> Option<&UserId> {
        self.participants.iter().find(|participant| *participant != user_id)
    }

    pub fn display_name(&self, user_id: &UserId) -> Option<&str> {
        self.participant_names.get(user_id).map(String::as_str)
    }

    pub fn is_last_message(&self, message_id: &MessageId) -> bool {
        self.last_message
            .as_ref()
            .and_then(|last| last.id.as_ref())
            .is_some_and(|id| id == message_id)
    }
}
