use serde::de::DeserializeOwned;
use shared::{
    domain::{Message, MessageId, ThreadId, UserId},
    protocol::{
        ConnectionPayload, Envelope, EnvelopeKind, ErrorPayload, ReadPayload, TypingPayload,
    },
};
use tracing::{debug, warn};

use crate::{
    error::{ClientError, Result},
    model::ModelEvent,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingNotice {
    pub thread_id: ThreadId,
    pub user_id: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReceipt {
    pub thread_id: ThreadId,
    pub message_id: Option<MessageId>,
    pub reader_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub message: String,
    pub code: Option<String>,
}

/// An inbound envelope whose payload passed its per-kind schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Message(Message),
    Typing(TypingNotice),
    Read(ReadReceipt),
    Connection(ConnectionPayload),
    Error(RemoteError),
}

/// What the caller should do with one routed envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Apply(ModelEvent),
    Surface(RemoteError),
    Ignore,
}

fn payload<T: DeserializeOwned>(envelope: &Envelope) -> Result<T> {
    serde_json::from_value(envelope.data.clone()).map_err(|err| {
        ClientError::InvalidEnvelope(format!("{:?} payload: {err}", envelope.kind))
    })
}

fn require_thread(envelope: &Envelope, fallback: Option<ThreadId>) -> Result<ThreadId> {
    envelope
        .thread_id
        .clone()
        .or(fallback)
        .ok_or_else(|| ClientError::InvalidEnvelope(format!("{:?} without threadId", envelope.kind)))
}

/// Validates `envelope` against the schema for its kind. `Ok(None)` means the kind
/// is unknown and the envelope should be dropped.
pub fn classify(envelope: &Envelope) -> Result<Option<InboundEvent>> {
    let event = match envelope.kind {
        EnvelopeKind::Message => {
            let message: Message = payload(envelope)?;
            if let Some(thread_id) = &envelope.thread_id {
                if *thread_id != message.thread_id {
                    return Err(ClientError::InvalidEnvelope(format!(
                        "message {} claims thread {} but envelope targets {}",
                        message.id, message.thread_id, thread_id
                    )));
                }
            }
            InboundEvent::Message(message)
        }
        EnvelopeKind::Typing => {
            // The envelope's userId names the addressee; the typist is in the payload.
            let typing: TypingPayload = payload(envelope)?;
            let user_id = typing
                .user_id
                .ok_or_else(|| ClientError::InvalidEnvelope("typing without userId".into()))?;
            InboundEvent::Typing(TypingNotice {
                thread_id: require_thread(envelope, None)?,
                user_id,
                is_typing: typing.is_typing,
            })
        }
        EnvelopeKind::Read => {
            let read: ReadPayload = payload(envelope)?;
            InboundEvent::Read(ReadReceipt {
                thread_id: require_thread(envelope, read.thread_id)?,
                message_id: read.message_id,
                reader_id: read.reader_id,
            })
        }
        EnvelopeKind::Connection => InboundEvent::Connection(payload(envelope)?),
        EnvelopeKind::Error => {
            let error: ErrorPayload = payload(envelope)?;
            InboundEvent::Error(RemoteError {
                message: error.message,
                code: error.code,
            })
        }
        EnvelopeKind::Unknown => return Ok(None),
    };
    Ok(Some(event))
}

/// Routes one envelope to exactly one handler. Invalid or unknown envelopes are
/// logged and ignored; they never reach the session model.
pub fn route(envelope: &Envelope) -> Dispatch {
    match classify(envelope) {
        Ok(Some(InboundEvent::Message(message))) => {
            Dispatch::Apply(ModelEvent::MessageReceived(message))
        }
        Ok(Some(InboundEvent::Typing(notice))) => Dispatch::Apply(ModelEvent::TypingChanged {
            thread_id: notice.thread_id,
            user_id: notice.user_id,
            is_typing: notice.is_typing,
        }),
        Ok(Some(InboundEvent::Read(receipt))) => Dispatch::Apply(ModelEvent::ReadReceipt {
            thread_id: receipt.thread_id,
            message_id: receipt.message_id,
            reader_id: receipt.reader_id,
        }),
        Ok(Some(InboundEvent::Connection(connection))) => {
            debug!(status = connection.status.as_str(), "router: connection acknowledged");
            Dispatch::Ignore
        }
        Ok(Some(InboundEvent::Error(remote))) => {
            warn!(code = ?remote.code, "router: server reported error: {}", remote.message);
            Dispatch::Surface(remote)
        }
        Ok(None) => {
            warn!(timestamp = %envelope.timestamp, "router: dropping envelope of unknown kind");
            Dispatch::Ignore
        }
        Err(err) => {
            warn!("router: dropping invalid envelope: {err}");
            Dispatch::Ignore
        }
    }
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
