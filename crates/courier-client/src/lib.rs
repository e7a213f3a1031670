//! Client-side reconciliation of the message list for the chat on screen.
//!
//! Three sources feed one ordered list: the bulk history load, live server
//! events, and locally created speculative entries that have not been
//! confirmed yet. Merging is a pure state transition over
//! (current view, incoming event), independent of any transport, so the
//! whole layer is unit-testable.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use courier_types::events::ServerEvent;
use courier_types::models::Message;

/// Reserved prefix of locally generated speculative ids. A server id is a
/// UUID and can never collide with this shape.
pub const LOCAL_ID_PREFIX: &str = "tmp-";

/// True when an id may be used in an outbound mutation request. Speculative
/// ids are unknown to the server; mutations against them must be suppressed
/// until the confirmed snapshot replaces the entry.
pub fn can_mutate(id: &str) -> bool {
    !id.starts_with(LOCAL_ID_PREFIX)
}

/// A message the local user just sent, rendered before the server confirms.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub local_id: String,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// One row of the rendered message list.
#[derive(Debug, Clone)]
pub enum Entry {
    Pending(PendingMessage),
    Confirmed(Message),
}

impl Entry {
    pub fn id(&self) -> String {
        match self {
            Entry::Pending(p) => p.local_id.clone(),
            Entry::Confirmed(m) => m.id.to_string(),
        }
    }

    pub fn sender_id(&self) -> Uuid {
        match self {
            Entry::Pending(p) => p.sender_id,
            Entry::Confirmed(m) => m.sender.id,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Entry::Pending(p) => &p.text,
            Entry::Confirmed(m) => &m.text,
        }
    }

    fn confirmed_id(&self) -> Option<Uuid> {
        match self {
            Entry::Pending(_) => None,
            Entry::Confirmed(m) => Some(m.id),
        }
    }
}

/// Reconciliation state for the chat currently displayed.
///
/// `active_chat_id` is the chat on screen; `requested_chat_id` is the chat
/// whose data was most recently asked for but not yet answered. Both are
/// tracked because opening a chat is asynchronous (join the group, then load
/// history) and events interleave with the UI transition.
pub struct ChatView {
    local_user: Uuid,
    active_chat_id: Option<Uuid>,
    requested_chat_id: Option<Uuid>,
    entries: Vec<Entry>,
    pinned: Vec<Uuid>,
    next_local_seq: u64,
}

impl ChatView {
    pub fn new(local_user: Uuid) -> Self {
        Self {
            local_user,
            active_chat_id: None,
            requested_chat_id: None,
            entries: Vec::new(),
            pinned: Vec::new(),
            next_local_seq: 1,
        }
    }

    pub fn active_chat_id(&self) -> Option<Uuid> {
        self.active_chat_id
    }

    pub fn requested_chat_id(&self) -> Option<Uuid> {
        self.requested_chat_id
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn pinned(&self) -> &[Uuid] {
        &self.pinned
    }

    /// Switch the view to a chat. The list is cleared immediately; events
    /// for the previous chat no longer pass the scope guard.
    pub fn open_chat(&mut self, chat_id: Uuid) {
        self.active_chat_id = Some(chat_id);
        self.requested_chat_id = Some(chat_id);
        self.entries.clear();
        self.pinned.clear();
    }

    /// Append a speculative entry for a message the local user just sent.
    /// Returns its local id, or None when no chat is open.
    pub fn push_pending(&mut self, text: impl Into<String>, now: DateTime<Utc>) -> Option<String> {
        let chat_id = self.active_chat_id?;
        let local_id = format!("{}{}", LOCAL_ID_PREFIX, self.next_local_seq);
        self.next_local_seq += 1;

        self.entries.push(Entry::Pending(PendingMessage {
            local_id: local_id.clone(),
            chat_id,
            sender_id: self.local_user,
            text: text.into(),
            created_at: now,
        }));
        Some(local_id)
    }

    /// Merge one inbound event. Returns false when the event was discarded
    /// by the chat-scope guard or is not message-list traffic.
    pub fn apply(&mut self, event: &ServerEvent) -> bool {
        if let Some(chat_id) = event.chat_id() {
            if !self.accepts(chat_id) {
                return false;
            }
            // First accepted answer for the requested chat completes the
            // open-chat transition.
            self.requested_chat_id = None;
        }

        match event {
            ServerEvent::HistoryLoaded { messages, .. } => {
                self.entries = messages.iter().cloned().map(Entry::Confirmed).collect();
                true
            }
            ServerEvent::MessageCreated { message } => {
                self.merge_created(message.clone());
                true
            }
            ServerEvent::MessageUpdated { message } => {
                self.merge_updated(message.clone());
                true
            }
            ServerEvent::ReadReceiptsUpdated { messages, .. } => {
                for message in messages {
                    self.merge_updated(message.clone());
                }
                true
            }
            ServerEvent::PinnedSetChanged { pinned, .. } => {
                self.pinned = pinned.clone();
                true
            }
            // Chat-list and connection-level traffic is not ours.
            ServerEvent::Ready { .. }
            | ServerEvent::ChatCreated { .. }
            | ServerEvent::ChatTouched { .. }
            | ServerEvent::Error { .. } => false,
        }
    }

    fn accepts(&self, chat_id: Uuid) -> bool {
        self.active_chat_id == Some(chat_id) || self.requested_chat_id == Some(chat_id)
    }

    fn merge_created(&mut self, message: Message) {
        // Duplicate delivery is legitimate (the sender may get a direct copy
        // plus the group copy); id wins.
        if self.entries.iter().any(|e| e.confirmed_id() == Some(message.id)) {
            return;
        }

        // A pending entry from the same sender is this message's speculative
        // twin; confirm it in place so the list position is stable.
        let pending = self.entries.iter().position(
            |e| matches!(e, Entry::Pending(p) if p.sender_id == message.sender.id),
        );

        match pending {
            Some(index) => self.entries[index] = Entry::Confirmed(message),
            None => self.entries.push(Entry::Confirmed(message)),
        }
    }

    fn merge_updated(&mut self, message: Message) {
        match self
            .entries
            .iter()
            .position(|e| e.confirmed_id() == Some(message.id))
        {
            Some(index) => self.entries[index] = Entry::Confirmed(message),
            // The update raced ahead of its create; keep it rather than
            // losing the mutation.
            None => self.entries.push(Entry::Confirmed(message)),
        }
    }
}
