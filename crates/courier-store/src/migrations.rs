use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id              TEXT PRIMARY KEY,
            username        TEXT NOT NULL UNIQUE,
            online          INTEGER NOT NULL DEFAULT 0,
            last_active_at  TEXT,
            last_seen_at    TEXT,
            created_at      TEXT NOT NULL
        );

        -- Two-party chats. Participants are stored in canonical (low, high)
        -- order so the same unordered pair always maps to one row.
        CREATE TABLE IF NOT EXISTS chats (
            id                TEXT PRIMARY KEY,
            participant_low   TEXT NOT NULL REFERENCES users(id),
            participant_high  TEXT NOT NULL REFERENCES users(id),
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL,
            UNIQUE(participant_low, participant_high)
        );

        CREATE TABLE IF NOT EXISTS messages (
            id          TEXT PRIMARY KEY,
            chat_id     TEXT NOT NULL REFERENCES chats(id),
            sender_id   TEXT NOT NULL REFERENCES users(id),
            text        TEXT NOT NULL,
            reply_to    TEXT REFERENCES messages(id),
            deleted     INTEGER NOT NULL DEFAULT 0,
            edited      INTEGER NOT NULL DEFAULT 0,
            pinned      INTEGER NOT NULL DEFAULT 0,
            pinned_by   TEXT REFERENCES users(id),
            pinned_at   TEXT,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_chat
            ON messages(chat_id, created_at);

        -- At most one reaction per (message, user); reacting again replaces.
        CREATE TABLE IF NOT EXISTS reactions (
            id          TEXT PRIMARY KEY,
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            emoji       TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            UNIQUE(message_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_reactions_message
            ON reactions(message_id);

        CREATE TABLE IF NOT EXISTS message_edits (
            id          TEXT PRIMARY KEY,
            message_id  TEXT NOT NULL REFERENCES messages(id),
            prior_text  TEXT NOT NULL,
            edited_at   TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_edits_message
            ON message_edits(message_id);

        CREATE TABLE IF NOT EXISTS read_receipts (
            id          TEXT PRIMARY KEY,
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            read_at     TEXT NOT NULL,
            UNIQUE(message_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_receipts_message
            ON read_receipts(message_id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
