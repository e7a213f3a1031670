use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ChatSummary, Message, NotificationPayload};

/// Events sent from the server to connected clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    /// Connection is bound to a user identity and may issue commands.
    Ready { user_id: Uuid },

    /// Answer to a LoadHistory command. Unicast only.
    HistoryLoaded {
        chat_id: Uuid,
        messages: Vec<Message>,
    },

    /// A new message was persisted. Broadcast to the chat group; also
    /// unicast to the sender when their connection had not yet joined.
    MessageCreated { message: Message },

    /// A message changed in place (edit, delete, react, pin, read receipt).
    MessageUpdated { message: Message },

    /// The chat's pinned-message set changed. Carries the full current set.
    PinnedSetChanged { chat_id: Uuid, pinned: Vec<Uuid> },

    /// Aggregated result of marking a whole chat read.
    ReadReceiptsUpdated {
        chat_id: Uuid,
        messages: Vec<Message>,
    },

    /// A chat now exists between two users. Sent to both personal groups.
    ChatCreated { chat: ChatSummary },

    /// A chat received a new message. Sent to every participant's personal
    /// group so chat lists stay live without a reload.
    ChatTouched {
        chat: ChatSummary,
        notification: NotificationPayload,
    },

    /// Something went wrong handling a command. Unicast only, never broadcast.
    Error { message: String },
}

impl ServerEvent {
    /// Returns the chat this event is scoped to, if any. Events returning
    /// `None` are personal-group or connection-level traffic and bypass the
    /// client's chat-scope guard.
    pub fn chat_id(&self) -> Option<Uuid> {
        match self {
            Self::HistoryLoaded { chat_id, .. } => Some(*chat_id),
            Self::MessageCreated { message } => Some(message.chat_id),
            Self::MessageUpdated { message } => Some(message.chat_id),
            Self::PinnedSetChanged { chat_id, .. } => Some(*chat_id),
            Self::ReadReceiptsUpdated { chat_id, .. } => Some(*chat_id),
            Self::Ready { .. }
            | Self::ChatCreated { .. }
            | Self::ChatTouched { .. }
            | Self::Error { .. } => None,
        }
    }
}

/// Commands sent from a client to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientCommand {
    /// Bind this connection to a user (identity established by a prior
    /// authentication step), join the personal group, and join the groups
    /// of every chat the user participates in. Flips the user online.
    JoinUser { user_id: Uuid },

    /// Join one chat's broadcast group. Idempotent.
    JoinChat { chat_id: Uuid },

    /// Find or create the chat between two users.
    StartChat { user_id: Uuid, other_user_id: Uuid },

    /// Request the full ordered message history of a chat.
    LoadHistory { chat_id: Uuid },

    SendMessage {
        chat_id: Uuid,
        sender_id: Uuid,
        text: String,
        #[serde(default)]
        reply_to: Option<Uuid>,
    },

    EditMessage {
        message_id: Uuid,
        user_id: Uuid,
        new_text: String,
    },

    DeleteMessage { message_id: Uuid, user_id: Uuid },

    ReactMessage {
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
    },

    /// Toggle the pinned flag of a message within its chat.
    PinMessage {
        message_id: Uuid,
        user_id: Uuid,
        chat_id: Uuid,
    },

    /// Record a read receipt on every message of the chat for this user.
    MarkChatRead { chat_id: Uuid, user_id: Uuid },
}
