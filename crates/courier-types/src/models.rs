use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Text a message carries once it has been soft-deleted. The row keeps its
/// id and timestamps; only the content is replaced.
pub const DELETED_TEXT: &str = "This message was deleted";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub online: bool,
    pub last_active_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Minimal user projection embedded in message snapshots and chat summaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub username: String,
}

/// A two-party chat. Participants are kept in canonical (low, high) id order
/// so the same unordered pair always resolves to the same row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSummary {
    pub id: Uuid,
    pub participants: Vec<UserSummary>,
    /// Ids of currently pinned messages, all belonging to this chat.
    pub pinned: Vec<Uuid>,
    pub updated_at: DateTime<Utc>,
}

impl ChatSummary {
    pub fn participant_ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.participants.iter().map(|p| p.id)
    }

    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.participants.iter().any(|p| p.id == user_id)
    }
}

/// One emoji reaction. A user holds at most one reaction per message;
/// reacting again replaces the previous entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub user_id: Uuid,
}

/// Append-only record of a previous message text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditRecord {
    pub prior_text: String,
    pub edited_at: DateTime<Utc>,
}

/// One entry per distinct reader. The sender never appears in their own list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub user_id: Uuid,
    pub read_at: DateTime<Utc>,
}

/// Projection of the message a reply points at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplySummary {
    pub id: Uuid,
    pub sender_username: String,
}

/// Canonical message snapshot as broadcast to chat groups. Every mutation
/// re-emits the full snapshot; clients replace by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender: UserSummary,
    pub text: String,
    pub reply_to: Option<ReplySummary>,
    pub reactions: Vec<Reaction>,
    pub deleted: bool,
    pub edited: bool,
    pub edit_history: Vec<EditRecord>,
    pub pinned: bool,
    pub pinned_by: Option<Uuid>,
    pub pinned_at: Option<DateTime<Utc>>,
    pub read_by: Vec<ReadReceipt>,
    pub created_at: DateTime<Utc>,
}

/// Payload handed to the notification sink (and carried on ChatTouched) for
/// recipients who are offline or looking at another chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub chat_id: Uuid,
    pub message_id: Uuid,
    pub sender: UserSummary,
    pub preview: String,
}
