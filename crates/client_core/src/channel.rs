//! Push channel ownership: one WebSocket per signed-in user, reconnected with
//! exponential backoff after abnormal closure.
//!
//! A supervisor task owns the socket. It runs one session at a time, asks the
//! [`ConnectionTracker`] what to do when the session ends, and sleeps out the
//! backoff delay itself, so cancelling the supervisor also cancels any pending
//! retry. Every mutation goes through `ChannelInner` under one lock and bumps a
//! generation counter on connect/disconnect; a supervisor whose generation is
//! stale exits without touching state.

use std::{
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use shared::{domain::ConnectionState, protocol::Envelope};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};
use tracing::{debug, error, info, warn};

use crate::{
    auth::CredentialProvider,
    config::Settings,
    error::{ClientError, Result},
};

pub const NORMAL_CLOSURE: u16 = 1000;
pub const ABNORMAL_CLOSURE: u16 = 1006;
const NO_STATUS_RECEIVED: u16 = 1005;
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// `base × 2^attempt`, saturating instead of overflowing.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2_u32.saturating_pow(attempt))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseDecision {
    Deliberate,
    Retry { attempt: u32, delay: Duration },
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelStatus {
    pub state: ConnectionState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_retry_in: Option<Duration>,
}

impl ChannelStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn is_connecting(&self) -> bool {
        self.state == ConnectionState::Connecting
    }

    /// True while a retry timer is pending or a retry attempt is in flight.
    pub fn is_reconnecting(&self) -> bool {
        self.next_retry_in.is_some() || (self.is_connecting() && self.attempts > 0)
    }
}

/// Connection bookkeeping without any I/O; the supervisor drives it.
#[derive(Debug)]
pub struct ConnectionTracker {
    policy: ReconnectPolicy,
    status: ChannelStatus,
    deliberate: bool,
}

impl ConnectionTracker {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            status: ChannelStatus::default(),
            deliberate: false,
        }
    }

    pub fn status(&self) -> &ChannelStatus {
        &self.status
    }

    pub fn begin_connect(&mut self) {
        self.deliberate = false;
        self.status.state = ConnectionState::Connecting;
        self.status.next_retry_in = None;
    }

    pub fn opened(&mut self) {
        self.status.state = ConnectionState::Open;
        self.status.attempts = 0;
        self.status.last_error = None;
        self.status.next_retry_in = None;
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.status.last_error = Some(message.into());
    }

    /// Marks the next close as user-initiated so it never schedules a retry.
    pub fn request_close(&mut self) {
        self.deliberate = true;
    }

    pub fn closed(&mut self, code: u16) -> CloseDecision {
        self.status.state = ConnectionState::Closed;
        self.status.next_retry_in = None;

        if self.deliberate || code == NORMAL_CLOSURE {
            return CloseDecision::Deliberate;
        }

        if self.status.attempts >= self.policy.max_attempts {
            self.status.last_error = Some(
                ClientError::ReconnectExhausted {
                    attempts: self.policy.max_attempts,
                }
                .to_string(),
            );
            return CloseDecision::Exhausted;
        }

        let delay = self.policy.delay_for(self.status.attempts);
        self.status.attempts += 1;
        self.status.next_retry_in = Some(delay);
        CloseDecision::Retry {
            attempt: self.status.attempts,
            delay,
        }
    }

    /// A deliberate close ends the session, so the next session starts with a
    /// fresh retry counter.
    pub fn finish_disconnect(&mut self) {
        self.deliberate = true;
        self.status.state = ConnectionState::Closed;
        self.status.attempts = 0;
        self.status.next_retry_in = None;
    }

    pub fn reset_attempts(&mut self) {
        self.status.attempts = 0;
        self.status.last_error = None;
    }
}

enum OutboundFrame {
    Text(String),
    Close,
}

struct ChannelInner {
    tracker: ConnectionTracker,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<OutboundFrame>>,
    last_envelope: Option<Envelope>,
}

pub struct ChannelManager {
    settings: Settings,
    credentials: Arc<dyn CredentialProvider>,
    inner: Mutex<ChannelInner>,
    /// Held outside `inner` so [`ChannelManager::abort`] can reach it without awaiting.
    supervisor: StdMutex<Option<JoinHandle<()>>>,
    status_tx: watch::Sender<ChannelStatus>,
    envelopes: broadcast::Sender<Envelope>,
}

impl ChannelManager {
    pub fn new(settings: Settings, credentials: Arc<dyn CredentialProvider>) -> Arc<Self> {
        let (status_tx, _) = watch::channel(ChannelStatus::default());
        let (envelopes, _) = broadcast::channel(settings.event_buffer.max(1));
        Arc::new(Self {
            inner: Mutex::new(ChannelInner {
                tracker: ConnectionTracker::new(settings.reconnect_policy()),
                generation: 0,
                outbound: None,
                last_envelope: None,
            }),
            supervisor: StdMutex::new(None),
            settings,
            credentials,
            status_tx,
            envelopes,
        })
    }

    pub fn status(&self) -> ChannelStatus {
        self.status_tx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status_tx.subscribe()
    }

    /// Inbound envelopes in arrival order; malformed frames never reach subscribers.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.envelopes.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    pub fn is_connecting(&self) -> bool {
        self.status().is_connecting()
    }

    pub fn last_error(&self) -> Option<String> {
        self.status().last_error
    }

    pub async fn last_envelope(&self) -> Option<Envelope> {
        self.inner.lock().await.last_envelope.clone()
    }

    fn take_supervisor(&self) -> Option<JoinHandle<()>> {
        self.supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn supervisor_alive(&self) -> bool {
        self.supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn publish(&self, inner: &ChannelInner) {
        self.status_tx.send_replace(inner.tracker.status().clone());
    }

    async fn record_error(&self, message: String) {
        let mut inner = self.inner.lock().await;
        inner.tracker.record_error(message);
        self.publish(&inner);
    }

    /// Starts the supervisor. Fails closed, without any network attempt, when the
    /// auth collaborator has no identity or no credential.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let authenticated = self.credentials.identity().is_some()
            && self.credentials.bearer_token().await?.is_some();
        if !authenticated {
            warn!("channel: connect refused, no identity or credential");
            self.record_error(ClientError::Unauthenticated.to_string())
                .await;
            return Err(ClientError::Unauthenticated);
        }

        let mut inner = self.inner.lock().await;
        let state = inner.tracker.status().state;
        if self.supervisor_alive()
            && matches!(state, ConnectionState::Open | ConnectionState::Connecting)
        {
            debug!(?state, "channel: connect ignored, already active");
            return Ok(());
        }

        if let Some(previous) = self.take_supervisor() {
            previous.abort();
        }
        inner.outbound = None;
        inner.generation += 1;
        inner.tracker.reset_attempts();
        inner.tracker.begin_connect();
        self.publish(&inner);

        let generation = inner.generation;
        let handle = tokio::spawn(Arc::clone(self).supervise(generation));
        *self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Deliberate close with code 1000; cancels any pending retry.
    pub async fn disconnect(&self) {
        let (handle, graceful) = {
            let mut inner = self.inner.lock().await;
            inner.generation += 1;
            inner.tracker.request_close();
            let graceful = inner
                .outbound
                .take()
                .is_some_and(|tx| tx.send(OutboundFrame::Close).is_ok());
            (self.take_supervisor(), graceful)
        };

        if let Some(mut handle) = handle {
            if graceful {
                if tokio::time::timeout(CLOSE_GRACE, &mut handle).await.is_err() {
                    warn!("channel: close handshake timed out");
                    handle.abort();
                }
            } else {
                handle.abort();
            }
        }

        let mut inner = self.inner.lock().await;
        inner.tracker.finish_disconnect();
        self.publish(&inner);
        info!("channel: disconnected");
    }

    /// Stops the supervisor without a close handshake, dropping the socket and
    /// any pending retry. Usable from `Drop`, where `disconnect` cannot be awaited.
    pub fn abort(&self) {
        if let Some(handle) = self.take_supervisor() {
            handle.abort();
        }
        match self.inner.try_lock() {
            Ok(mut inner) => {
                inner.generation += 1;
                inner.outbound = None;
                inner.tracker.finish_disconnect();
                self.publish(&inner);
            }
            // The supervisor is already gone; only the published status lags.
            Err(_) => debug!("channel: status busy during abort"),
        }
        debug!("channel: supervisor aborted");
    }

    /// Resets the attempt counter and connects again; the way out of an exhausted state.
    pub async fn reconnect(self: &Arc<Self>) -> Result<()> {
        self.disconnect().await;
        self.connect().await
    }

    /// Fire-and-forget: never buffers while the channel is down.
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        let text = serde_json::to_string(envelope)?;
        let mut inner = self.inner.lock().await;
        let delivered = inner.tracker.status().is_connected()
            && inner
                .outbound
                .as_ref()
                .is_some_and(|tx| tx.send(OutboundFrame::Text(text)).is_ok());
        if delivered {
            return Ok(());
        }

        inner
            .tracker
            .record_error(format!("cannot send {:?} envelope: channel is not open", envelope.kind));
        self.publish(&inner);
        Err(ClientError::NotConnected)
    }

    async fn supervise(self: Arc<Self>, generation: u64) {
        loop {
            let code = match self.run_session(generation).await {
                Ok(code) => code,
                Err(ClientError::Unauthenticated) => {
                    let mut inner = self.inner.lock().await;
                    if inner.generation != generation {
                        return;
                    }
                    inner.outbound = None;
                    inner.tracker.finish_disconnect();
                    inner.tracker.record_error(ClientError::Unauthenticated.to_string());
                    self.publish(&inner);
                    warn!("channel: credential missing on reconnect; giving up");
                    return;
                }
                Err(err) => {
                    self.record_error(err.to_string()).await;
                    ABNORMAL_CLOSURE
                }
            };

            let decision = {
                let mut inner = self.inner.lock().await;
                if inner.generation != generation {
                    return;
                }
                inner.outbound = None;
                let decision = inner.tracker.closed(code);
                self.publish(&inner);
                decision
            };

            match decision {
                CloseDecision::Deliberate => {
                    info!(code, "channel: closed");
                    return;
                }
                CloseDecision::Exhausted => {
                    error!(code, "channel: reconnection attempts exhausted");
                    return;
                }
                CloseDecision::Retry { attempt, delay } => {
                    warn!(
                        code,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "channel: connection lost; reconnect scheduled"
                    );
                    tokio::time::sleep(delay).await;
                    let mut inner = self.inner.lock().await;
                    if inner.generation != generation {
                        return;
                    }
                    inner.tracker.begin_connect();
                    self.publish(&inner);
                }
            }
        }
    }

    /// Runs one socket until it closes; returns the close code that ended it.
    async fn run_session(&self, generation: u64) -> Result<u16> {
        let identity = self
            .credentials
            .identity()
            .ok_or(ClientError::Unauthenticated)?;
        let token = self
            .credentials
            .bearer_token()
            .await?
            .ok_or(ClientError::Unauthenticated)?;
        let url = self.settings.websocket_url(&token, &identity.user_id)?;

        debug!(user_id = identity.user_id.as_str(), "channel: opening websocket");
        let (ws_stream, _) = match connect_async(url.as_str()).await {
            Ok(connected) => connected,
            Err(err) => {
                self.record_error(
                    ClientError::Transport(format!("failed to open channel: {err}")).to_string(),
                )
                .await;
                return Ok(ABNORMAL_CLOSURE);
            }
        };
        let (mut writer, mut reader) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel();

        {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                return Ok(NORMAL_CLOSURE);
            }
            inner.outbound = Some(tx);
            inner.tracker.opened();
            self.publish(&inner);
        }
        info!(user_id = identity.user_id.as_str(), "channel: open");

        let presence = serde_json::to_string(&Envelope::presence(&identity.user_id)?)?;
        if let Err(err) = writer.send(Message::Text(presence)).await {
            self.record_error(
                ClientError::Transport(format!("presence announcement failed: {err}")).to_string(),
            )
            .await;
            return Ok(ABNORMAL_CLOSURE);
        }

        loop {
            tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.accept_frame(&text).await,
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame
                            .map(|frame| u16::from(frame.code))
                            .unwrap_or(NO_STATUS_RECEIVED);
                        debug!(code, "channel: close frame received");
                        return Ok(code);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        self.record_error(
                            ClientError::Transport(format!("channel receive failed: {err}")).to_string(),
                        )
                        .await;
                        return Ok(ABNORMAL_CLOSURE);
                    }
                    None => return Ok(ABNORMAL_CLOSURE),
                },
                outbound = rx.recv() => match outbound {
                    Some(OutboundFrame::Text(text)) => {
                        if let Err(err) = writer.send(Message::Text(text)).await {
                            self.record_error(
                                ClientError::Transport(format!("channel send failed: {err}")).to_string(),
                            )
                            .await;
                            return Ok(ABNORMAL_CLOSURE);
                        }
                    }
                    Some(OutboundFrame::Close) | None => {
                        let close = Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "client disconnect".into(),
                        }));
                        if let Err(err) = writer.send(close).await {
                            debug!("channel: close frame not delivered: {err}");
                        }
                        return Ok(NORMAL_CLOSURE);
                    }
                },
            }
        }
    }

    async fn accept_frame(&self, text: &str) {
        match serde_json::from_str::<Envelope>(text) {
            Ok(envelope) => {
                self.inner.lock().await.last_envelope = Some(envelope.clone());
                let _ = self.envelopes.send(envelope);
            }
            Err(err) => {
                warn!("channel: dropping malformed frame: {err}");
                self.record_error(format!("malformed frame: {err}")).await;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
