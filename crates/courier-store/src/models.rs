/// Database row types — these map directly to SQLite rows.
/// Distinct from courier-types snapshots to keep the store layer independent.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub online: bool,
    pub last_active_at: Option<String>,
    pub last_seen_at: Option<String>,
    pub created_at: String,
}

pub struct ChatRow {
    pub id: String,
    pub participant_low: String,
    pub participant_high: String,
    pub created_at: String,
    pub updated_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub sender_username: String,
    pub text: String,
    pub reply_to: Option<String>,
    pub deleted: bool,
    pub edited: bool,
    pub pinned: bool,
    pub pinned_by: Option<String>,
    pub pinned_at: Option<String>,
    pub created_at: String,
}

pub struct ReactionRow {
    pub id: String,
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
    pub created_at: String,
}

pub struct EditRow {
    pub id: String,
    pub message_id: String,
    pub prior_text: String,
    pub edited_at: String,
}

pub struct ReceiptRow {
    pub id: String,
    pub message_id: String,
    pub user_id: String,
    pub read_at: String,
}
