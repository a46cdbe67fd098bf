use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Weak,
};

use async_trait::async_trait;
use shared::{
    domain::{Message, ThreadId, UserId},
    protocol::{Envelope, NewThreadValues, ReadPayload, SendMessageRequest, TypingPayload},
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod api;
pub mod auth;
pub mod channel;
pub mod config;
pub mod error;
pub mod model;
pub mod router;

pub use api::{HttpMessagingApi, MessagingApi};
pub use auth::{CredentialProvider, Identity, MissingCredentials, StaticCredentials};
pub use channel::{ChannelManager, ChannelStatus, ReconnectPolicy};
pub use config::{load_settings, load_settings_from, Settings};
pub use error::{ClientError, Result};
pub use model::{reduce, ModelEvent, SessionModel};

use router::Dispatch;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    ThreadsUpdated {
        total_unread: u32,
    },
    SelectionChanged(Option<ThreadId>),
    MessagesLoaded {
        thread_id: ThreadId,
        count: usize,
    },
    MessageAppended(Message),
    ReadStateChanged {
        thread_id: ThreadId,
        unread: u32,
        total_unread: u32,
    },
    TypingChanged {
        thread_id: ThreadId,
        users: Vec<UserId>,
    },
    ThreadRemoved(ThreadId),
    ConnectionChanged(ChannelStatus),
    Error(String),
}

/// Operations a front end drives; every write is durable before it is announced.
#[async_trait]
pub trait ClientHandle: Send + Sync {
    async fn open(&self) -> Result<()>;
    async fn close(&self);
    async fn refresh_threads(&self) -> Result<()>;
    async fn select_thread(&self, thread_id: &ThreadId) -> Result<()>;
    async fn send_message(&self, values: NewThreadValues, recipient_name: &str)
        -> Result<Message>;
    async fn send_reply(&self, content: &str) -> Result<Message>;
    async fn mark_thread_as_read(&self, thread_id: &ThreadId) -> Result<()>;
    async fn delete_thread(&self, thread_id: &ThreadId) -> Result<()>;
    async fn send_typing(&self, is_typing: bool) -> Result<()>;
    async fn snapshot(&self) -> SessionModel;
    fn connection_status(&self) -> ChannelStatus;
    fn is_sending(&self) -> bool;
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
}

pub struct MessagingClient {
    this: Weak<Self>,
    identity: Identity,
    api: Arc<dyn MessagingApi>,
    channel: Arc<ChannelManager>,
    model: Mutex<SessionModel>,
    send_queue: Mutex<()>,
    sends_in_flight: AtomicUsize,
    events: broadcast::Sender<ClientEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Counts a send from the moment it queues until it resolves or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What an applied `ModelEvent` touched, resolved into a `ClientEvent` once the
/// reducer has run.
enum Touched {
    Threads,
    Selection,
    Loaded(ThreadId),
    Appended(Message),
    Read(ThreadId),
    Typing(ThreadId),
    Removed(ThreadId),
}

impl Touched {
    fn of(event: &ModelEvent, model: &SessionModel) -> Self {
        match event {
            ModelEvent::ThreadsLoaded(_) | ModelEvent::Reset => Self::Threads,
            ModelEvent::ThreadSelected(_)
            | ModelEvent::SelectionCleared
            | ModelEvent::SelectionRestored { .. } => Self::Selection,
            ModelEvent::MessagesLoaded { thread_id, .. } => Self::Loaded(thread_id.clone()),
            ModelEvent::MessageSent { message, .. } | ModelEvent::MessageReceived(message) => {
                if model.knows_message(message) {
                    Self::Threads
                } else {
                    Self::Appended(message.clone())
                }
            }
            ModelEvent::ReadReceipt { thread_id, .. }
            | ModelEvent::ThreadMarkedRead { thread_id, .. } => Self::Read(thread_id.clone()),
            ModelEvent::TypingChanged { thread_id, .. } => Self::Typing(thread_id.clone()),
            ModelEvent::ThreadDeleted(thread_id) => Self::Removed(thread_id.clone()),
        }
    }

    fn resolve(self, model: &SessionModel) -> Option<ClientEvent> {
        let event = match self {
            Self::Threads => ClientEvent::ThreadsUpdated {
                total_unread: model.total_unread(),
            },
            Self::Selection => ClientEvent::SelectionChanged(model.selected_thread().cloned()),
            Self::Loaded(thread_id) => {
                if model.selected_thread() != Some(&thread_id) {
                    return None;
                }
                ClientEvent::MessagesLoaded {
                    thread_id,
                    count: model.messages().len(),
                }
            }
            Self::Appended(message) => ClientEvent::MessageAppended(message),
            Self::Read(thread_id) => ClientEvent::ReadStateChanged {
                unread: model.unread_for_self(&thread_id),
                total_unread: model.total_unread(),
                thread_id,
            },
            Self::Typing(thread_id) => ClientEvent::TypingChanged {
                users: model.typing_in(&thread_id),
                thread_id,
            },
            Self::Removed(thread_id) => ClientEvent::ThreadRemoved(thread_id),
        };
        Some(event)
    }
}

impl MessagingClient {
    pub fn new(
        settings: Settings,
        api: Arc<dyn MessagingApi>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Arc<Self>> {
        let identity = credentials
            .identity()
            .ok_or(ClientError::Unauthenticated)?;
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        let channel = ChannelManager::new(settings, credentials);
        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            model: Mutex::new(SessionModel::new(identity.user_id.clone())),
            identity,
            api,
            channel,
            send_queue: Mutex::new(()),
            sends_in_flight: AtomicUsize::new(0),
            events,
            pump: Mutex::new(None),
        }))
    }

    /// Client backed by the HTTP messaging API described by `settings`.
    pub fn from_settings(
        settings: Settings,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Arc<Self>> {
        let api = Arc::new(HttpMessagingApi::new(
            settings.clone(),
            Arc::clone(&credentials),
        )?);
        Self::new(settings, api, credentials)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn channel(&self) -> &Arc<ChannelManager> {
        &self.channel
    }

    async fn apply(&self, event: ModelEvent) {
        let notice = {
            let mut model = self.model.lock().await;
            let touched = Touched::of(&event, &model);
            model.apply(event);
            touched.resolve(&model)
        };
        if let Some(notice) = notice {
            let _ = self.events.send(notice);
        }
    }

    async fn handle_envelope(&self, envelope: &Envelope) {
        match router::route(envelope) {
            Dispatch::Apply(event) => self.apply(event).await,
            Dispatch::Surface(remote) => {
                let _ = self.events.send(ClientEvent::Error(remote.message));
            }
            Dispatch::Ignore => {}
        }
    }

    /// Best effort: skipped while the channel is down, never fails the caller.
    async fn announce(&self, envelope: serde_json::Result<Envelope>) {
        let envelope = match envelope {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("facade: could not encode announcement: {err}");
                return;
            }
        };
        if !self.channel.is_connected() {
            debug!(kind = ?envelope.kind, "facade: channel down, announcement skipped");
            return;
        }
        if let Err(err) = self.channel.send(&envelope).await {
            warn!(kind = ?envelope.kind, "facade: announcement failed: {err}");
            let _ = self.events.send(ClientEvent::Error(err.to_string()));
        }
    }

    /// Undoes a selection whose history never arrived, unless a later selection
    /// already replaced it.
    async fn restore_selection(
        &self,
        attempted: &ThreadId,
        previous: Option<ThreadId>,
        visible: Vec<Message>,
    ) {
        let notice = {
            let mut model = self.model.lock().await;
            if model.selected_thread() != Some(attempted) {
                return;
            }
            let event = ModelEvent::SelectionRestored {
                thread_id: previous,
                messages: visible,
            };
            let touched = Touched::of(&event, &model);
            model.apply(event);
            touched.resolve(&model)
        };
        warn!(
            thread_id = attempted.as_str(),
            "facade: history fetch failed, selection restored"
        );
        if let Some(notice) = notice {
            let _ = self.events.send(notice);
        }
    }

    async fn counterpart_in(&self, thread_id: &ThreadId) -> Option<UserId> {
        let model = self.model.lock().await;
        model
            .thread(thread_id)
            .and_then(|thread| thread.counterpart(&self.identity.user_id))
            .cloned()
    }

    async fn start_pump(&self) {
        let mut pump = self.pump.lock().await;
        if pump.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let envelopes = self.channel.subscribe();
        let status = self.channel.watch_status();
        *pump = Some(tokio::spawn(run_pump(self.this.clone(), envelopes, status)));
    }

    async fn stop_pump(&self) {
        if let Some(handle) = self.pump.lock().await.take() {
            handle.abort();
        }
    }
}

/// Consumes inbound envelopes in arrival order and forwards channel status changes.
async fn run_pump(
    client: Weak<MessagingClient>,
    mut envelopes: broadcast::Receiver<Envelope>,
    mut status: watch::Receiver<ChannelStatus>,
) {
    let mut last_error = status.borrow().last_error.clone();
    let mut opened_before = false;
    loop {
        tokio::select! {
            received = envelopes.recv() => {
                let Some(client) = client.upgrade() else {
                    return;
                };
                match received {
                    Ok(envelope) => client.handle_envelope(&envelope).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "facade: inbound pump lagged, refreshing threads");
                        let _ = client.events.send(ClientEvent::Error(format!(
                            "missed {skipped} inbound events"
                        )));
                        if let Err(err) = client.refresh_threads().await {
                            warn!("facade: refresh after lag failed: {err}");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    return;
                }
                let Some(client) = client.upgrade() else {
                    return;
                };
                let current = status.borrow_and_update().clone();
                if current.last_error != last_error {
                    if let Some(message) = &current.last_error {
                        let _ = client.events.send(ClientEvent::Error(message.clone()));
                    }
                    last_error = current.last_error.clone();
                }

                let reopened = current.is_connected() && opened_before;
                if current.is_connected() {
                    opened_before = true;
                }
                let _ = client.events.send(ClientEvent::ConnectionChanged(current));

                if reopened {
                    debug!("facade: channel reopened, catching up on threads");
                    if let Err(err) = client.refresh_threads().await {
                        warn!("facade: refresh after reconnect failed: {err}");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ClientHandle for MessagingClient {
    async fn open(&self) -> Result<()> {
        self.start_pump().await;
        if let Err(err) = self.channel.connect().await {
            self.stop_pump().await;
            return Err(err);
        }
        info!(
            user_id = self.identity.user_id.as_str(),
            "facade: session opened"
        );
        self.refresh_threads().await
    }

    async fn close(&self) {
        self.channel.disconnect().await;
        self.stop_pump().await;
        self.apply(ModelEvent::Reset).await;
        let _ = self
            .events
            .send(ClientEvent::ConnectionChanged(self.channel.status()));
        info!(
            user_id = self.identity.user_id.as_str(),
            "facade: session closed"
        );
    }

    async fn refresh_threads(&self) -> Result<()> {
        let threads = self.api.fetch_threads().await?;
        self.apply(ModelEvent::ThreadsLoaded(threads)).await;
        Ok(())
    }

    async fn select_thread(&self, thread_id: &ThreadId) -> Result<()> {
        let (previous, visible) = {
            let model = self.model.lock().await;
            if model.thread(thread_id).is_none() {
                return Err(ClientError::ThreadNotFound(thread_id.clone()));
            }
            (model.selected_thread().cloned(), model.messages().to_vec())
        };
        self.apply(ModelEvent::ThreadSelected(thread_id.clone()))
            .await;

        let messages = match self.api.fetch_messages(thread_id).await {
            Ok(messages) => messages,
            Err(err) => {
                self.restore_selection(thread_id, previous, visible).await;
                return Err(err);
            }
        };
        self.apply(ModelEvent::MessagesLoaded {
            thread_id: thread_id.clone(),
            messages,
        })
        .await;

        let unread = {
            let model = self.model.lock().await;
            if model.selected_thread() == Some(thread_id) {
                model.unread_for_self(thread_id)
            } else {
                0
            }
        };
        if unread > 0 {
            debug!(
                thread_id = thread_id.as_str(),
                unread, "facade: selected thread has unread messages"
            );
            self.mark_thread_as_read(thread_id).await?;
        }
        Ok(())
    }

    async fn send_message(
        &self,
        values: NewThreadValues,
        recipient_name: &str,
    ) -> Result<Message> {
        let _in_flight = InFlight::enter(&self.sends_in_flight);
        let _turn = self.send_queue.lock().await;

        let request = SendMessageRequest {
            values,
            receiver_name: recipient_name.to_string(),
        };
        let response = self.api.send_message(&request).await?;
        let message = response.message.clone();
        info!(
            thread_id = message.thread_id.as_str(),
            message_id = message.id.as_str(),
            "facade: message sent"
        );
        self.apply(ModelEvent::MessageSent {
            message: response.message,
            thread: Some(response.thread),
        })
        .await;
        self.announce(Envelope::message(&message)).await;
        Ok(message)
    }

    async fn send_reply(&self, content: &str) -> Result<Message> {
        let _in_flight = InFlight::enter(&self.sends_in_flight);
        let _turn = self.send_queue.lock().await;

        let thread_id = self
            .model
            .lock()
            .await
            .selected_thread()
            .cloned()
            .ok_or(ClientError::NoThreadSelected)?;
        let response = self.api.send_reply(&thread_id, content).await?;
        let message = response.message.clone();
        info!(
            thread_id = thread_id.as_str(),
            message_id = message.id.as_str(),
            "facade: reply sent"
        );
        self.apply(ModelEvent::MessageSent {
            message: response.message,
            thread: response.thread,
        })
        .await;
        self.announce(Envelope::message(&message)).await;
        Ok(message)
    }

    async fn mark_thread_as_read(&self, thread_id: &ThreadId) -> Result<()> {
        let thread = self.api.mark_thread_read(thread_id).await?;
        let counterpart = thread.counterpart(&self.identity.user_id).cloned();
        self.apply(ModelEvent::ThreadMarkedRead {
            thread_id: thread_id.clone(),
            thread: Some(thread),
        })
        .await;

        if let Some(recipient) = counterpart {
            let receipt = ReadPayload {
                thread_id: Some(thread_id.clone()),
                message_id: None,
                reader_id: Some(self.identity.user_id.clone()),
            };
            self.announce(Envelope::read(thread_id, &recipient, &receipt))
                .await;
        }
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &ThreadId) -> Result<()> {
        self.api.delete_thread(thread_id).await?;
        info!(thread_id = thread_id.as_str(), "facade: thread deleted");
        self.apply(ModelEvent::ThreadDeleted(thread_id.clone()))
            .await;
        Ok(())
    }

    async fn send_typing(&self, is_typing: bool) -> Result<()> {
        let thread_id = self
            .model
            .lock()
            .await
            .selected_thread()
            .cloned()
            .ok_or(ClientError::NoThreadSelected)?;
        let recipient = self
            .counterpart_in(&thread_id)
            .await
            .ok_or_else(|| ClientError::ThreadNotFound(thread_id.clone()))?;
        let payload = TypingPayload {
            is_typing,
            user_id: Some(self.identity.user_id.clone()),
            user_name: Some(self.identity.display_name.clone()),
        };
        self.announce(Envelope::typing(&thread_id, &recipient, &payload))
            .await;
        Ok(())
    }

    async fn snapshot(&self) -> SessionModel {
        self.model.lock().await.clone()
    }

    fn connection_status(&self) -> ChannelStatus {
        self.channel.status()
    }

    fn is_sending(&self) -> bool {
        self.sends_in_flight.load(Ordering::SeqCst) > 0
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

impl Drop for MessagingClient {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
        self.channel.abort();
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
