//! Session model and the single reducer that every input flows through: REST
//! snapshots, push envelopes and the results of the caller's own writes.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use shared::domain::{LastMessage, Message, MessageId, Thread, ThreadId, UserId};
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    ThreadsLoaded(Vec<Thread>),
    ThreadSelected(ThreadId),
    SelectionCleared,
    /// Puts back a selection and visible list captured before a selection whose
    /// history fetch failed.
    SelectionRestored {
        thread_id: Option<ThreadId>,
        messages: Vec<Message>,
    },
    MessagesLoaded {
        thread_id: ThreadId,
        messages: Vec<Message>,
    },
    /// Result of the caller's own durable write; `thread` is the server's copy when
    /// the endpoint returned one.
    MessageSent {
        message: Message,
        thread: Option<Thread>,
    },
    MessageReceived(Message),
    /// `reader_id` other than the local user means the counterpart read our
    /// messages; anything else acknowledges messages addressed to us.
    ReadReceipt {
        thread_id: ThreadId,
        message_id: Option<MessageId>,
        reader_id: Option<UserId>,
    },
    ThreadMarkedRead {
        thread_id: ThreadId,
        thread: Option<Thread>,
    },
    ThreadDeleted(ThreadId),
    TypingChanged {
        thread_id: ThreadId,
        user_id: UserId,
        is_typing: bool,
    },
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionModel {
    self_id: UserId,
    threads: Vec<Thread>,
    selected_thread: Option<ThreadId>,
    messages: Vec<Message>,
    typing: BTreeMap<ThreadId, BTreeSet<UserId>>,
    /// Per thread, so deleting or dropping a thread releases its ids.
    acknowledged: HashMap<ThreadId, HashSet<MessageId>>,
    seen: HashMap<ThreadId, HashSet<MessageId>>,
    total_unread: u32,
}

/// Pure form of [`SessionModel::apply`].
pub fn reduce(mut model: SessionModel, event: ModelEvent) -> SessionModel {
    model.apply(event);
    model
}

impl SessionModel {
    pub fn new(self_id: UserId) -> Self {
        Self {
            self_id,
            threads: Vec::new(),
            selected_thread: None,
            messages: Vec::new(),
            typing: BTreeMap::new(),
            acknowledged: HashMap::new(),
            seen: HashMap::new(),
            total_unread: 0,
        }
    }

    pub fn self_id(&self) -> &UserId {
        &self.self_id
    }

    /// Threads ordered by `updated_at`, newest first.
    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    pub fn thread(&self, thread_id: &ThreadId) -> Option<&Thread> {
        self.threads.iter().find(|thread| &thread.id == thread_id)
    }

    pub fn selected_thread(&self) -> Option<&ThreadId> {
        self.selected_thread.as_ref()
    }

    /// Messages of the selected thread ordered by server timestamp.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn total_unread(&self) -> u32 {
        self.total_unread
    }

    pub fn unread_for_self(&self, thread_id: &ThreadId) -> u32 {
        self.thread(thread_id)
            .map(|thread| thread.unread_for(&self.self_id))
            .unwrap_or(0)
    }

    pub fn typing_in(&self, thread_id: &ThreadId) -> Vec<UserId> {
        self.typing
            .get(thread_id)
            .map(|users| users.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn apply(&mut self, event: ModelEvent) {
        match event {
            ModelEvent::ThreadsLoaded(threads) => self.load_threads(threads),
            ModelEvent::ThreadSelected(thread_id) => {
                if self.selected_thread.as_ref() != Some(&thread_id) {
                    self.messages.clear();
                }
                self.selected_thread = Some(thread_id);
            }
            ModelEvent::SelectionCleared => {
                self.selected_thread = None;
                self.messages.clear();
            }
            ModelEvent::SelectionRestored {
                thread_id,
                messages,
            } => {
                self.selected_thread = thread_id;
                self.messages = messages;
            }
            ModelEvent::MessagesLoaded { thread_id, messages } => {
                self.load_messages(thread_id, messages)
            }
            ModelEvent::MessageSent { message, thread } => self.merge_message(message, thread),
            ModelEvent::MessageReceived(message) => self.merge_message(message, None),
            ModelEvent::ReadReceipt {
                thread_id,
                message_id,
                reader_id,
            } => match reader_id {
                Some(reader) if reader != self.self_id => {
                    self.mark_read_by_counterpart(&thread_id, message_id.as_ref())
                }
                _ => self.apply_read_receipt(&thread_id, message_id),
            },
            ModelEvent::ThreadMarkedRead { thread_id, thread } => {
                self.apply_marked_read(&thread_id, thread)
            }
            ModelEvent::ThreadDeleted(thread_id) => {
                self.threads.retain(|thread| thread.id != thread_id);
                self.typing.remove(&thread_id);
                self.seen.remove(&thread_id);
                self.acknowledged.remove(&thread_id);
                if self.selected_thread.as_ref() == Some(&thread_id) {
                    self.selected_thread = None;
                    self.messages.clear();
                }
            }
            ModelEvent::TypingChanged {
                thread_id,
                user_id,
                is_typing,
            } => self.set_typing(thread_id, user_id, is_typing),
            ModelEvent::Reset => {
                let self_id = self.self_id.clone();
                *self = Self::new(self_id);
            }
        }
        self.recompute_total_unread();
    }

    fn load_threads(&mut self, threads: Vec<Thread>) {
        self.threads = threads;
        self.sort_threads();
        let known: HashSet<&ThreadId> = self.threads.iter().map(|thread| &thread.id).collect();
        self.typing.retain(|thread_id, _| known.contains(thread_id));
        self.seen.retain(|thread_id, _| known.contains(thread_id));
        self.acknowledged
            .retain(|thread_id, _| known.contains(thread_id));
    }

    /// Fetched history replaces the visible list, keeping anything the channel
    /// delivered while the fetch was in flight. Results for a thread that is no
    /// longer selected are stale and dropped.
    fn load_messages(&mut self, thread_id: ThreadId, messages: Vec<Message>) {
        if self.selected_thread.as_ref() != Some(&thread_id) {
            debug!(
                thread_id = thread_id.as_str(),
                "reconciler: discarding messages for unselected thread"
            );
            return;
        }

        let mut merged: Vec<Message> = messages
            .into_iter()
            .filter(|message| message.thread_id == thread_id)
            .collect();
        for pending in self.messages.drain(..) {
            if !merged.iter().any(|message| message.id == pending.id) {
                merged.push(pending);
            }
        }
        merged.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        merged.dedup_by(|a, b| a.id == b.id);
        self.seen
            .entry(thread_id)
            .or_default()
            .extend(merged.iter().map(|message| message.id.clone()));
        self.messages = merged;
    }

    /// True when `message` was already merged, by id.
    pub fn knows_message(&self, message: &Message) -> bool {
        if self
            .seen
            .get(&message.thread_id)
            .is_some_and(|ids| ids.contains(&message.id))
        {
            return true;
        }
        let visible = self.selected_thread.as_ref() == Some(&message.thread_id)
            && self.messages.iter().any(|existing| existing.id == message.id);
        visible
            || self
                .thread(&message.thread_id)
                .is_some_and(|thread| thread.is_last_message(&message.id))
    }

    fn merge_message(&mut self, message: Message, canonical: Option<Thread>) {
        let duplicate = self.knows_message(&message);

        if let Some(canonical) = canonical {
            self.upsert_canonical(canonical);
        } else if !duplicate {
            self.bump_thread(&message);
        }

        if duplicate {
            trace!(
                message_id = message.id.as_str(),
                "reconciler: message already known"
            );
            return;
        }
        self.seen
            .entry(message.thread_id.clone())
            .or_default()
            .insert(message.id.clone());

        if let Some(users) = self.typing.get_mut(&message.thread_id) {
            users.remove(&message.sender_id);
        }

        if self.selected_thread.as_ref() == Some(&message.thread_id) {
            let position = self.messages.partition_point(|existing| {
                (existing.timestamp, &existing.id) <= (message.timestamp, &message.id)
            });
            self.messages.insert(position, message);
        }
    }

    fn bump_thread(&mut self, message: &Message) {
        let self_id = self.self_id.clone();
        let index = match self
            .threads
            .iter()
            .position(|thread| thread.id == message.thread_id)
        {
            Some(index) => index,
            None => {
                debug!(
                    thread_id = message.thread_id.as_str(),
                    "reconciler: synthesizing thread from first message"
                );
                self.threads.push(Thread::from_first_message(message));
                self.threads.len() - 1
            }
        };

        let thread = &mut self.threads[index];
        thread.last_message = Some(LastMessage::from(message));
        thread.message_count = thread.message_count.saturating_add(1);
        if message.timestamp > thread.updated_at {
            thread.updated_at = message.timestamp;
        }
        if message.receiver_id == self_id && message.sender_id != self_id {
            let unread = thread.unread_count.entry(self_id).or_insert(0);
            *unread = unread.saturating_add(1);
        }
        self.sort_threads();
    }

    /// Server copies win unless they are older than what the model already holds.
    fn upsert_canonical(&mut self, canonical: Thread) {
        match self
            .threads
            .iter_mut()
            .find(|thread| thread.id == canonical.id)
        {
            Some(existing) if existing.updated_at > canonical.updated_at => {
                debug!(
                    thread_id = canonical.id.as_str(),
                    "reconciler: ignoring stale thread copy"
                );
            }
            Some(existing) => *existing = canonical,
            None => self.threads.push(canonical),
        }
        self.sort_threads();
    }

    fn apply_read_receipt(&mut self, thread_id: &ThreadId, message_id: Option<MessageId>) {
        let Some(message_id) = message_id else {
            self.clear_unread(thread_id);
            return;
        };

        if !self
            .acknowledged
            .entry(thread_id.clone())
            .or_default()
            .insert(message_id.clone())
        {
            trace!(
                message_id = message_id.as_str(),
                "reconciler: duplicate read receipt"
            );
            return;
        }

        if let Some(message) = self
            .messages
            .iter_mut()
            .find(|message| message.id == message_id)
        {
            if message.read {
                return;
            }
            message.read = true;
        }

        let self_id = self.self_id.clone();
        if let Some(thread) = self.threads.iter_mut().find(|thread| &thread.id == thread_id) {
            if let Some(unread) = thread.unread_count.get_mut(&self_id) {
                *unread = unread.saturating_sub(1);
            }
        }
    }

    fn mark_read_by_counterpart(&mut self, thread_id: &ThreadId, message_id: Option<&MessageId>) {
        if self.selected_thread.as_ref() != Some(thread_id) {
            return;
        }
        let self_id = self.self_id.clone();
        for message in self.messages.iter_mut().filter(|message| {
            message.sender_id == self_id && message_id.map_or(true, |id| *id == message.id)
        }) {
            message.read = true;
        }
    }

    fn apply_marked_read(&mut self, thread_id: &ThreadId, canonical: Option<Thread>) {
        if let Some(canonical) = canonical {
            self.upsert_canonical(canonical);
        }
        self.clear_unread(thread_id);
    }

    fn clear_unread(&mut self, thread_id: &ThreadId) {
        let self_id = self.self_id.clone();
        if let Some(thread) = self.threads.iter_mut().find(|thread| &thread.id == thread_id) {
            if let Some(unread) = thread.unread_count.get_mut(&self_id) {
                *unread = 0;
            }
        }
        if self.selected_thread.as_ref() == Some(thread_id) {
            let acknowledged = self.acknowledged.entry(thread_id.clone()).or_default();
            for message in self
                .messages
                .iter_mut()
                .filter(|message| message.receiver_id == self_id)
            {
                message.read = true;
                acknowledged.insert(message.id.clone());
            }
        }
    }

    fn set_typing(&mut self, thread_id: ThreadId, user_id: UserId, is_typing: bool) {
        if user_id == self.self_id {
            return;
        }
        if is_typing {
            self.typing.entry(thread_id).or_default().insert(user_id);
        } else if let Some(users) = self.typing.get_mut(&thread_id) {
            users.remove(&user_id);
            if users.is_empty() {
                self.typing.remove(&thread_id);
            }
        }
    }

    fn sort_threads(&mut self) {
        self.threads
            .sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
    }

    fn recompute_total_unread(&mut self) {
        let self_id = &self.self_id;
        self.total_unread = self
            .threads
            .iter()
            .map(|thread| thread.unread_for(self_id))
            .fold(0_u32, u32::saturating_add);
    }
}

#[cfg(test)]
#[path = "tests/model_tests.rs"]
mod tests;
