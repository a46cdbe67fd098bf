use super::*;

use std::{
    collections::HashMap,
    sync::atomic::AtomicBool,
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use shared::{
    domain::{LastMessage, MessageCategory, MessageId, Thread},
    protocol::{EnvelopeKind, ReplyRequest, ReplyResponse, SendMessageResponse},
};
use tokio::{net::TcpListener, sync::mpsc};

fn at(offset_secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_714_557_600 + offset_secs, 0)
        .single()
        .expect("timestamp")
}

fn user(id: &str) -> UserId {
    UserId::from(id)
}

fn message(id: &str, thread: &str, from: &str, to: &str, offset_secs: i64) -> Message {
    Message {
        id: MessageId::from(id),
        thread_id: ThreadId::from(thread),
        sender_id: user(from),
        sender_name: from.to_uppercase(),
        receiver_id: user(to),
        receiver_name: to.to_uppercase(),
        content: format!("content of {id}"),
        subject: "Corgi puppy".to_string(),
        category: MessageCategory::Inquiry,
        timestamp: at(offset_secs),
        read: false,
        attachments: Vec::new(),
    }
}

fn thread_with(first: &Message, unread: &[(&str, u32)]) -> Thread {
    let mut thread = Thread::from_first_message(first);
    thread.message_count = 1;
    thread.last_message = Some(LastMessage::from(first));
    thread.unread_count = unread
        .iter()
        .map(|(participant, count)| (user(participant), *count))
        .collect();
    thread
}

fn fast_settings(api_base_url: impl Into<String>) -> Settings {
    Settings {
        reconnect_base_delay_ms: 10,
        ..Settings::default().with_api_base_url(api_base_url)
    }
}

fn alice() -> Arc<dyn CredentialProvider> {
    Arc::new(StaticCredentials::new("alice", "Alice", "alice-token"))
}

#[derive(Default)]
struct FakeStore {
    threads: Vec<Thread>,
    messages: HashMap<ThreadId, Vec<Message>>,
    next_id: i64,
}

struct TestMessagingApi {
    self_id: UserId,
    store: Mutex<FakeStore>,
    fail_writes: AtomicBool,
    fail_history: AtomicBool,
    write_delay: Duration,
    calls: Mutex<Vec<&'static str>>,
    active_writes: AtomicUsize,
    max_active_writes: AtomicUsize,
}

impl TestMessagingApi {
    fn new(self_id: &str) -> Self {
        Self {
            self_id: user(self_id),
            store: Mutex::new(FakeStore::default()),
            fail_writes: AtomicBool::new(false),
            fail_history: AtomicBool::new(false),
            write_delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            active_writes: AtomicUsize::new(0),
            max_active_writes: AtomicUsize::new(0),
        }
    }

    fn with_thread(mut self, thread: Thread, messages: Vec<Message>) -> Self {
        let store = self.store.get_mut();
        store.messages.insert(thread.id.clone(), messages);
        store.threads.push(thread);
        self
    }

    fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    async fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().await.clone()
    }

    async fn begin_write(&self, call: &'static str) -> Result<()> {
        self.calls.lock().await.push(call);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ClientError::Api {
                status: 503,
                message: "storage offline".to_string(),
            });
        }
        let active = self.active_writes.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_writes.fetch_max(active, Ordering::SeqCst);
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        self.active_writes.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

fn not_found(thread_id: &ThreadId) -> ClientError {
    ClientError::Api {
        status: 404,
        message: format!("thread {thread_id} not found"),
    }
}

#[async_trait]
impl MessagingApi for TestMessagingApi {
    async fn fetch_threads(&self) -> Result<Vec<Thread>> {
        self.calls.lock().await.push("fetch_threads");
        Ok(self.store.lock().await.threads.clone())
    }

    async fn fetch_messages(&self, thread_id: &ThreadId) -> Result<Vec<Message>> {
        self.calls.lock().await.push("fetch_messages");
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(not_found(thread_id));
        }
        Ok(self
            .store
            .lock()
            .await
            .messages
            .get(thread_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<SendMessageResponse> {
        self.begin_write("send_message").await?;
        let mut store = self.store.lock().await;
        store.next_id += 1;
        let n = store.next_id;
        let message = Message {
            id: MessageId::new(format!("m-new-{n}")),
            thread_id: ThreadId::new(format!("t-new-{n}")),
            sender_id: self.self_id.clone(),
            sender_name: self.self_id.as_str().to_uppercase(),
            receiver_id: request.values.receiver_id.clone(),
            receiver_name: request.receiver_name.clone(),
            content: request.values.content.clone(),
            subject: request.values.subject.clone(),
            category: request.values.category.clone(),
            timestamp: at(100 + n),
            read: false,
            attachments: request.values.attachments.clone(),
        };
        let thread = thread_with(
            &message,
            &[(request.values.receiver_id.as_str(), 1), (self.self_id.as_str(), 0)],
        );
        store.threads.push(thread.clone());
        store
            .messages
            .insert(thread.id.clone(), vec![message.clone()]);
        Ok(SendMessageResponse { thread, message })
    }

    async fn send_reply(&self, thread_id: &ThreadId, content: &str) -> Result<ReplyResponse> {
        self.begin_write("send_reply").await?;
        let mut store = self.store.lock().await;
        store.next_id += 1;
        let n = store.next_id;
        let self_id = self.self_id.clone();
        let thread = store
            .threads
            .iter_mut()
            .find(|thread| &thread.id == thread_id)
            .ok_or_else(|| not_found(thread_id))?;
        let receiver = thread
            .counterpart(&self_id)
            .cloned()
            .ok_or_else(|| not_found(thread_id))?;
        let message = Message {
            content: content.to_string(),
            ..message(
                &format!("m-reply-{n}"),
                thread_id.as_str(),
                self_id.as_str(),
                receiver.as_str(),
                100 + n,
            )
        };
        thread.message_count += 1;
        thread.last_message = Some(LastMessage::from(&message));
        thread.updated_at = message.timestamp;
        *thread.unread_count.entry(receiver).or_insert(0) += 1;
        let thread = thread.clone();
        store
            .messages
            .entry(thread_id.clone())
            .or_default()
            .push(message.clone());
        Ok(ReplyResponse {
            message,
            thread: Some(thread),
        })
    }

    async fn mark_thread_read(&self, thread_id: &ThreadId) -> Result<Thread> {
        self.begin_write("mark_thread_read").await?;
        let mut store = self.store.lock().await;
        let self_id = self.self_id.clone();
        if let Some(messages) = store.messages.get_mut(thread_id) {
            for message in messages
                .iter_mut()
                .filter(|message| message.receiver_id == self_id)
            {
                message.read = true;
            }
        }
        let thread = store
            .threads
            .iter_mut()
            .find(|thread| &thread.id == thread_id)
            .ok_or_else(|| not_found(thread_id))?;
        thread.unread_count.insert(self_id, 0);
        Ok(thread.clone())
    }

    async fn delete_thread(&self, thread_id: &ThreadId) -> Result<()> {
        self.begin_write("delete_thread").await?;
        let mut store = self.store.lock().await;
        store.threads.retain(|thread| &thread.id != thread_id);
        store.messages.remove(thread_id);
        Ok(())
    }
}

fn client_with(api: Arc<TestMessagingApi>) -> Arc<MessagingClient> {
    MessagingClient::new(Settings::default(), api, alice()).expect("client")
}

fn bob_thread() -> (Thread, Message) {
    let first = message("m-1", "t-1", "bob", "alice", 1);
    (thread_with(&first, &[("alice", 1), ("bob", 0)]), first)
}

async fn next_matching(
    events: &mut broadcast::Receiver<ClientEvent>,
    mut predicate: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("event timeout")
}

#[tokio::test]
async fn client_requires_signed_in_identity() {
    let api = Arc::new(TestMessagingApi::new("alice"));
    let result = MessagingClient::new(Settings::default(), api, Arc::new(MissingCredentials));
    assert!(matches!(result, Err(ClientError::Unauthenticated)));
}

#[tokio::test]
async fn open_without_credential_fails_before_any_request() {
    let api = Arc::new(TestMessagingApi::new("alice"));
    let blank = Arc::new(StaticCredentials::new("alice", "Alice", ""));
    let client = MessagingClient::new(Settings::default(), api.clone(), blank).expect("client");

    let err = client.open().await.expect_err("must refuse");
    assert!(matches!(err, ClientError::Unauthenticated));
    assert!(api.calls().await.is_empty());
    assert!(!client.connection_status().is_connected());
}

#[tokio::test]
async fn new_thread_is_written_then_applied_while_disconnected() {
    let api = Arc::new(TestMessagingApi::new("alice"));
    let client = client_with(api.clone());
    let mut events = client.subscribe_events();

    let sent = client
        .send_message(
            NewThreadValues {
                receiver_id: user("bob"),
                subject: "Corgi puppy".to_string(),
                content: "Hello".to_string(),
                category: MessageCategory::Inquiry,
                listing_id: None,
                attachments: Vec::new(),
            },
            "Bob",
        )
        .await
        .expect("send");

    assert!(!client.connection_status().is_connected());
    assert!(!client.is_sending());
    let snapshot = client.snapshot().await;
    let thread = snapshot.thread(&sent.thread_id).expect("thread");
    assert_eq!(thread.message_count, 1);
    assert_eq!(thread.unread_for(&user("bob")), 1);
    assert_eq!(thread.unread_for(&user("alice")), 0);
    assert_eq!(snapshot.total_unread(), 0);

    let event = next_matching(&mut events, |event| {
        matches!(event, ClientEvent::MessageAppended(_))
    })
    .await;
    let ClientEvent::MessageAppended(appended) = event else {
        unreachable!();
    };
    assert_eq!(appended.content, "Hello");
}

#[tokio::test]
async fn reply_without_selection_is_rejected() {
    let api = Arc::new(TestMessagingApi::new("alice"));
    let client = client_with(api.clone());

    let err = client.send_reply("anyone?").await.expect_err("no selection");
    assert!(matches!(err, ClientError::NoThreadSelected));
    assert!(api.calls().await.is_empty());
    assert!(!client.is_sending());

    let err = client.send_typing(true).await.expect_err("no selection");
    assert!(matches!(err, ClientError::NoThreadSelected));
}

#[tokio::test]
async fn selecting_unread_thread_marks_it_read() {
    let (thread, first) = bob_thread();
    let api = Arc::new(TestMessagingApi::new("alice").with_thread(thread, vec![first]));
    let client = client_with(api.clone());
    client.refresh_threads().await.expect("refresh");
    assert_eq!(client.snapshot().await.total_unread(), 1);

    client
        .select_thread(&ThreadId::from("t-1"))
        .await
        .expect("select");

    assert_eq!(
        api.calls().await,
        vec!["fetch_threads", "fetch_messages", "mark_thread_read"]
    );
    let snapshot = client.snapshot().await;
    assert_eq!(snapshot.selected_thread(), Some(&ThreadId::from("t-1")));
    assert_eq!(snapshot.total_unread(), 0);
    assert_eq!(snapshot.messages().len(), 1);
    assert!(snapshot.messages()[0].read);

    // Already read: selecting again only fetches history.
    client
        .select_thread(&ThreadId::from("t-1"))
        .await
        .expect("reselect");
    assert_eq!(api.calls().await.last(), Some(&"fetch_messages"));
}

#[tokio::test]
async fn selecting_unknown_thread_is_rejected() {
    let client = client_with(Arc::new(TestMessagingApi::new("alice")));
    let err = client
        .select_thread(&ThreadId::from("t-missing"))
        .await
        .expect_err("unknown thread");
    assert!(matches!(err, ClientError::ThreadNotFound(id) if id.as_str() == "t-missing"));
}

#[tokio::test]
async fn reply_while_disconnected_still_lands_in_model() {
    let (thread, first) = bob_thread();
    let api = Arc::new(TestMessagingApi::new("alice").with_thread(thread, vec![first]));
    let client = client_with(api);
    client.refresh_threads().await.expect("refresh");
    client
        .select_thread(&ThreadId::from("t-1"))
        .await
        .expect("select");

    let reply = client.send_reply("Still available?").await.expect("reply");

    let snapshot = client.snapshot().await;
    let contents: Vec<&str> = snapshot
        .messages()
        .iter()
        .map(|message| message.content.as_str())
        .collect();
    assert_eq!(contents, vec!["content of m-1", "Still available?"]);
    let thread = snapshot.thread(&ThreadId::from("t-1")).expect("thread");
    assert_eq!(thread.message_count, 2);
    assert!(thread.is_last_message(&reply.id));
    assert_eq!(thread.unread_for(&user("bob")), 1);
}

#[tokio::test]
async fn failed_write_leaves_model_unchanged() {
    let (thread, first) = bob_thread();
    let api = Arc::new(TestMessagingApi::new("alice").with_thread(thread, vec![first]));
    let client = client_with(api.clone());
    client.refresh_threads().await.expect("refresh");
    client
        .select_thread(&ThreadId::from("t-1"))
        .await
        .expect("select");
    let before = client.snapshot().await;

    api.fail_writes.store(true, Ordering::SeqCst);
    let reply_err = client.send_reply("lost").await.expect_err("reply fails");
    assert!(reply_err.is_api_failure());
    let delete_err = client
        .delete_thread(&ThreadId::from("t-1"))
        .await
        .expect_err("delete fails");
    assert!(matches!(delete_err, ClientError::Api { status: 503, .. }));

    assert_eq!(client.snapshot().await, before);
    assert!(!client.is_sending());
}

#[tokio::test]
async fn failed_history_fetch_keeps_previous_selection() {
    let (thread, first) = bob_thread();
    let other_first = message("m-9", "t-2", "carol", "alice", 2);
    let other = thread_with(&other_first, &[("alice", 0), ("carol", 0)]);
    let api = Arc::new(
        TestMessagingApi::new("alice")
            .with_thread(thread, vec![first])
            .with_thread(other, vec![other_first]),
    );
    let client = client_with(api.clone());

    client.refresh_threads().await.expect("refresh");
    api.fail_history.store(true, Ordering::SeqCst);
    let err = client
        .select_thread(&ThreadId::from("t-1"))
        .await
        .expect_err("history fails");
    assert!(matches!(err, ClientError::Api { status: 404, .. }));
    let snapshot = client.snapshot().await;
    assert!(snapshot.selected_thread().is_none());
    assert_eq!(snapshot.total_unread(), 1);

    api.fail_history.store(false, Ordering::SeqCst);
    client
        .select_thread(&ThreadId::from("t-2"))
        .await
        .expect("select");
    let before = client.snapshot().await;

    api.fail_history.store(true, Ordering::SeqCst);
    client
        .select_thread(&ThreadId::from("t-1"))
        .await
        .expect_err("history fails");
    let after = client.snapshot().await;
    assert_eq!(after, before);
    assert_eq!(after.selected_thread(), Some(&ThreadId::from("t-2")));
    assert_eq!(after.messages().len(), 1);
    assert!(!api.calls().await.contains(&"mark_thread_read"));
}

#[tokio::test]
async fn dropping_client_stops_channel_retries() {
    let unreachable = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = unreachable.local_addr().expect("addr");
    drop(unreachable);

    let settings = Settings {
        reconnect_base_delay_ms: 50,
        ..Settings::default().with_api_base_url(format!("http://{addr}"))
    };
    let client = MessagingClient::new(settings, Arc::new(TestMessagingApi::new("alice")), alice())
        .expect("client");
    client.open().await.expect("open");
    let channel = Arc::clone(client.channel());
    let mut status = channel.watch_status();
    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|status| status.attempts >= 1),
    )
    .await
    .expect("retry timeout")
    .expect("status channel closed");

    drop(client);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let status = channel.status();
    assert_eq!(status.state, shared::domain::ConnectionState::Closed);
    assert!(status.next_retry_in.is_none());
    assert_eq!(Arc::strong_count(&channel), 1);
}

#[tokio::test]
async fn deleting_selected_thread_clears_selection() {
    let (thread, first) = bob_thread();
    let api = Arc::new(TestMessagingApi::new("alice").with_thread(thread, vec![first]));
    let client = client_with(api);
    let mut events = client.subscribe_events();
    client.refresh_threads().await.expect("refresh");
    client
        .select_thread(&ThreadId::from("t-1"))
        .await
        .expect("select");

    client
        .delete_thread(&ThreadId::from("t-1"))
        .await
        .expect("delete");

    let snapshot = client.snapshot().await;
    assert!(snapshot.threads().is_empty());
    assert!(snapshot.selected_thread().is_none());
    assert!(snapshot.messages().is_empty());
    next_matching(&mut events, |event| {
        matches!(event, ClientEvent::ThreadRemoved(id) if id.as_str() == "t-1")
    })
    .await;
}

#[tokio::test]
async fn concurrent_replies_are_serialized_in_order() {
    let (thread, first) = bob_thread();
    let api = Arc::new(
        TestMessagingApi::new("alice")
            .with_thread(thread, vec![first])
            .with_write_delay(Duration::from_millis(20)),
    );
    let client = client_with(api.clone());
    client.refresh_threads().await.expect("refresh");
    client
        .select_thread(&ThreadId::from("t-1"))
        .await
        .expect("select");

    let background = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.send_reply("one").await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(client.is_sending());

    let (two, three) = tokio::join!(client.send_reply("two"), client.send_reply("three"));
    two.expect("two");
    three.expect("three");
    background.await.expect("join").expect("one");

    assert_eq!(api.max_active_writes.load(Ordering::SeqCst), 1);
    assert!(!client.is_sending());
    let snapshot = client.snapshot().await;
    let contents: Vec<&str> = snapshot
        .messages()
        .iter()
        .skip(1)
        .map(|message| message.content.as_str())
        .collect();
    assert_eq!(contents, vec!["one", "two", "three"]);
}

#[derive(Clone)]
struct BackendState {
    thread: Thread,
    seen: mpsc::UnboundedSender<String>,
    pushes: broadcast::Sender<String>,
}

struct TestBackend {
    url: String,
    seen: mpsc::UnboundedReceiver<String>,
    pushes: broadcast::Sender<String>,
}

impl TestBackend {
    async fn next_envelope(&mut self) -> Envelope {
        let text = tokio::time::timeout(Duration::from_secs(5), self.seen.recv())
            .await
            .expect("frame timeout")
            .expect("frame channel closed");
        serde_json::from_str(&text).expect("envelope")
    }
}

fn is_authorized(headers: &HeaderMap) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        == Some("Bearer alice-token")
}

async fn list_threads(State(state): State<BackendState>, headers: HeaderMap) -> Response {
    if !is_authorized(&headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "code": "unauthorized", "message": "bad token" })),
        )
            .into_response();
    }
    Json(vec![state.thread]).into_response()
}

async fn list_messages(Path(_thread_id): Path<String>) -> Json<Vec<Message>> {
    Json(Vec::new())
}

async fn mark_read(
    State(state): State<BackendState>,
    Path(thread_id): Path<String>,
) -> Response {
    if thread_id != state.thread.id.as_str() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "thread not found" })),
        )
            .into_response();
    }
    Json(state.thread).into_response()
}

async fn reply(
    Path(thread_id): Path<String>,
    Json(body): Json<ReplyRequest>,
) -> Json<ReplyResponse> {
    let message = Message {
        content: body.content,
        ..message("m-reply", &thread_id, "alice", "bob", 500)
    };
    Json(ReplyResponse {
        message,
        thread: None,
    })
}

async fn push_socket(ws: WebSocketUpgrade, State(state): State<BackendState>) -> Response {
    ws.on_upgrade(move |socket| serve_push_socket(socket, state))
}

async fn serve_push_socket(mut socket: WebSocket, state: BackendState) {
    let mut pushes = state.pushes.subscribe();
    loop {
        tokio::select! {
            frame = socket.recv() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let _ = state.seen.send(text);
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
            push = pushes.recv() => match push {
                Ok(text) => {
                    if socket.send(WsMessage::Text(text)).await.is_err() {
                        return;
                    }
                }
                Err(_) => return,
            },
        }
    }
}

async fn spawn_backend(thread: Thread) -> TestBackend {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (seen_tx, seen) = mpsc::unbounded_channel();
    let (pushes, _) = broadcast::channel(16);
    let state = BackendState {
        thread,
        seen: seen_tx,
        pushes: pushes.clone(),
    };
    let app = Router::new()
        .route("/api/messages/threads", get(list_threads))
        .route("/api/messages/threads/:thread_id", get(list_messages))
        .route("/api/messages/threads/:thread_id/read", put(mark_read))
        .route("/api/messages/threads/:thread_id/reply", post(reply))
        .route("/api/ws", get(push_socket))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    TestBackend {
        url: format!("http://{addr}"),
        seen,
        pushes,
    }
}

fn alice_thread() -> Thread {
    let first = message("m-1", "t-1", "alice", "bob", 1);
    thread_with(&first, &[("bob", 1), ("alice", 0)])
}

#[tokio::test]
async fn http_api_sends_bearer_and_maps_error_bodies() {
    let backend = spawn_backend(alice_thread()).await;
    let settings = Settings::default().with_api_base_url(backend.url.clone());

    let api = HttpMessagingApi::new(settings.clone(), alice()).expect("api");
    let threads = api.fetch_threads().await.expect("threads");
    assert_eq!(threads, vec![alice_thread()]);

    let err = api
        .mark_thread_read(&ThreadId::from("t-404"))
        .await
        .expect_err("missing thread");
    assert!(
        matches!(&err, ClientError::Api { status: 404, message } if message == "thread not found"),
        "unexpected error: {err}"
    );

    let wrong = Arc::new(StaticCredentials::new("alice", "Alice", "stolen"));
    let api = HttpMessagingApi::new(settings.clone(), wrong).expect("api");
    let err = api.fetch_threads().await.expect_err("unauthorized");
    assert!(matches!(&err, ClientError::Api { status: 401, message } if message == "bad token"));

    let api = HttpMessagingApi::new(settings, Arc::new(MissingCredentials)).expect("api");
    assert!(matches!(
        api.fetch_threads().await,
        Err(ClientError::Unauthenticated)
    ));
}

#[tokio::test]
async fn open_session_merges_pushes_and_announces_writes() {
    let mut backend = spawn_backend(alice_thread()).await;
    let client =
        MessagingClient::from_settings(fast_settings(backend.url.clone()), alice()).expect("client");
    let mut events = client.subscribe_events();

    client.open().await.expect("open");
    assert_eq!(client.snapshot().await.threads().len(), 1);

    let presence = backend.next_envelope().await;
    assert_eq!(presence.kind, EnvelopeKind::Connection);
    assert_eq!(presence.user_id, Some(user("alice")));
    next_matching(&mut events, |event| {
        matches!(event, ClientEvent::ConnectionChanged(status) if status.is_connected())
    })
    .await;

    let inbound = message("m-2", "t-1", "bob", "alice", 50);
    let push = Envelope::message(&inbound).expect("envelope");
    let _ = backend
        .pushes
        .send(serde_json::to_string(&push).expect("json"));
    next_matching(&mut events, |event| {
        matches!(event, ClientEvent::MessageAppended(message) if message.id.as_str() == "m-2")
    })
    .await;

    // Redelivery of the same message is a no-op.
    let _ = backend
        .pushes
        .send(serde_json::to_string(&push).expect("json"));
    let typing = json!({
        "type": "typing",
        "threadId": "t-1",
        "userId": "alice",
        "data": { "isTyping": true, "userId": "bob", "userName": "Bob" }
    });
    let _ = backend.pushes.send(typing.to_string());
    next_matching(&mut events, |event| {
        matches!(event, ClientEvent::TypingChanged { users, .. } if users == &vec![user("bob")])
    })
    .await;

    let snapshot = client.snapshot().await;
    let thread = snapshot.thread(&ThreadId::from("t-1")).expect("thread");
    assert_eq!(thread.message_count, 2);
    assert_eq!(thread.unread_for(&user("alice")), 1);

    client
        .select_thread(&ThreadId::from("t-1"))
        .await
        .expect("select");
    let receipt = backend.next_envelope().await;
    assert_eq!(receipt.kind, EnvelopeKind::Read);
    assert_eq!(receipt.user_id, Some(user("bob")));
    assert_eq!(receipt.data["readerId"], "alice");
    assert_eq!(client.snapshot().await.total_unread(), 0);

    client.send_typing(true).await.expect("typing");
    let typing = backend.next_envelope().await;
    assert_eq!(typing.kind, EnvelopeKind::Typing);
    assert_eq!(typing.data["userName"], "Alice");

    let reply = client.send_reply("Yes, still here").await.expect("reply");
    let announced = backend.next_envelope().await;
    assert_eq!(announced.kind, EnvelopeKind::Message);
    assert_eq!(announced.thread_id, Some(ThreadId::from("t-1")));
    assert_eq!(announced.user_id, Some(user("bob")));
    assert_eq!(announced.data["content"], "Yes, still here");
    assert!(client
        .snapshot()
        .await
        .messages()
        .iter()
        .any(|message| message.id == reply.id));

    client.close().await;
    assert_eq!(
        client.connection_status().state,
        shared::domain::ConnectionState::Closed
    );
    assert!(client.snapshot().await.threads().is_empty());
}
