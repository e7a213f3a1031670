use crate::Database;
use crate::models::{ChatRow, EditRow, MessageRow, ReactionRow, ReceiptRow, UserRow};
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};

const MESSAGE_COLUMNS: &str = "m.id, m.chat_id, m.sender_id, u.username, m.text, m.reply_to, \
     m.deleted, m.edited, m.pinned, m.pinned_by, m.pinned_at, m.created_at";

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str, now: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, created_at) VALUES (?1, ?2, ?3)",
                (id, username, now),
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_id(conn, id))
    }

    pub fn get_username(&self, id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let name = conn
                .query_row("SELECT username FROM users WHERE id = ?1", [id], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(name)
        })
    }

    /// Mark a user online and stamp activity. Called when their first live
    /// connection joins.
    pub fn set_online(&self, id: &str, now: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET online = 1, last_active_at = ?2, last_seen_at = ?2 WHERE id = ?1",
                (id, now),
            )?;
            Ok(())
        })
    }

    /// Mark a user offline and stamp last_seen. Called when their last live
    /// connection drops.
    pub fn set_offline(&self, id: &str, now: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET online = 0, last_seen_at = ?2 WHERE id = ?1",
                (id, now),
            )?;
            Ok(())
        })
    }

    // -- Chats --

    /// Find the chat for an unordered user pair, creating it if absent.
    /// Participants are canonicalized to (low, high) order before lookup, so
    /// both argument orders resolve to the same row. Returns (row, created).
    pub fn find_or_create_chat(
        &self,
        candidate_id: &str,
        user_a: &str,
        user_b: &str,
        now: &str,
    ) -> Result<(ChatRow, bool)> {
        let (low, high) = if user_a <= user_b {
            (user_a, user_b)
        } else {
            (user_b, user_a)
        };

        self.with_conn(|conn| {
            if let Some(existing) = query_chat_by_pair(conn, low, high)? {
                return Ok((existing, false));
            }

            conn.execute(
                "INSERT INTO chats (id, participant_low, participant_high, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                (candidate_id, low, high, now),
            )?;

            let row = query_chat_by_pair(conn, low, high)?
                .ok_or_else(|| anyhow::anyhow!("chat vanished after insert"))?;
            Ok((row, true))
        })
    }

    pub fn get_chat(&self, id: &str) -> Result<Option<ChatRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, participant_low, participant_high, created_at, updated_at \
                     FROM chats WHERE id = ?1",
                    [id],
                    map_chat_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    pub fn chats_for_user(&self, user_id: &str) -> Result<Vec<ChatRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, participant_low, participant_high, created_at, updated_at \
                 FROM chats WHERE participant_low = ?1 OR participant_high = ?1 \
                 ORDER BY updated_at DESC",
            )?;
            let rows = stmt
                .query_map([user_id], map_chat_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn touch_chat(&self, id: &str, now: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE chats SET updated_at = ?2 WHERE id = ?1", (id, now))?;
            Ok(())
        })
    }

    // -- Messages --

    pub fn insert_message(
        &self,
        id: &str,
        chat_id: &str,
        sender_id: &str,
        text: &str,
        reply_to: Option<&str>,
        now: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, chat_id, sender_id, text, reply_to, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![id, chat_id, sender_id, text, reply_to, now],
            )?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| query_message_by_id(conn, id))
    }

    /// Full history of a chat in creation order. Insertion order breaks ties
    /// between equal timestamps.
    pub fn messages_for_chat(&self, chat_id: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m \
                 JOIN users u ON u.id = m.sender_id \
                 WHERE m.chat_id = ?1 ORDER BY m.created_at, m.rowid",
            ))?;
            let rows = stmt
                .query_map([chat_id], map_message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Soft delete: keep the row, swap the text for the sentinel and drop all
    /// reactions. Re-running on an already-deleted message is harmless.
    pub fn mark_deleted(&self, id: &str, sentinel: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE messages SET deleted = 1, text = ?2 WHERE id = ?1",
                (id, sentinel),
            )?;
            conn.execute("DELETE FROM reactions WHERE message_id = ?1", [id])?;
            Ok(())
        })
    }

    /// Apply an edit: archive the prior text, then swap in the new one.
    pub fn apply_edit(
        &self,
        edit_id: &str,
        message_id: &str,
        prior_text: &str,
        new_text: &str,
        now: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO message_edits (id, message_id, prior_text, edited_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                (edit_id, message_id, prior_text, now),
            )?;
            conn.execute(
                "UPDATE messages SET text = ?2, edited = 1 WHERE id = ?1",
                (message_id, new_text),
            )?;
            Ok(())
        })
    }

    pub fn set_pinned(
        &self,
        id: &str,
        pinned: bool,
        pinned_by: Option<&str>,
        pinned_at: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE messages SET pinned = ?2, pinned_by = ?3, pinned_at = ?4 WHERE id = ?1",
                rusqlite::params![id, pinned, pinned_by, pinned_at],
            )?;
            Ok(())
        })
    }

    /// Ids of currently pinned messages in a chat, oldest pin first. Derived
    /// from the messages table, so the set is always a subset of the chat's
    /// own message ids.
    pub fn pinned_ids(&self, chat_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM messages WHERE chat_id = ?1 AND pinned = 1 \
                 ORDER BY pinned_at, rowid",
            )?;
            let rows = stmt
                .query_map([chat_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Reactions --

    /// Set a user's reaction on a message, replacing any previous reaction by
    /// the same user. A user holds at most one reaction per message.
    pub fn replace_reaction(
        &self,
        id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
        now: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2",
                (message_id, user_id),
            )?;
            conn.execute(
                "INSERT INTO reactions (id, message_id, user_id, emoji, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                (id, message_id, user_id, emoji, now),
            )?;
            Ok(())
        })
    }

    /// Batch-fetch reactions for a set of message IDs, in append order.
    pub fn reactions_for_messages(&self, message_ids: &[String]) -> Result<Vec<ReactionRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT id, message_id, user_id, emoji, created_at FROM reactions \
                 WHERE message_id IN ({}) ORDER BY rowid",
                in_placeholders(message_ids.len())
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(params.as_slice(), |row| {
                    Ok(ReactionRow {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        user_id: row.get(2)?,
                        emoji: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Edit history --

    pub fn edits_for_messages(&self, message_ids: &[String]) -> Result<Vec<EditRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT id, message_id, prior_text, edited_at FROM message_edits \
                 WHERE message_id IN ({}) ORDER BY rowid",
                in_placeholders(message_ids.len())
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(params.as_slice(), |row| {
                    Ok(EditRow {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        prior_text: row.get(2)?,
                        edited_at: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Read receipts --

    /// Record that a user has read a message. Idempotent; returns true only
    /// when a new receipt was actually inserted.
    pub fn insert_receipt(
        &self,
        id: &str,
        message_id: &str,
        user_id: &str,
        now: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO read_receipts (id, message_id, user_id, read_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                (id, message_id, user_id, now),
            )?;
            Ok(changed > 0)
        })
    }

    pub fn receipts_for_messages(&self, message_ids: &[String]) -> Result<Vec<ReceiptRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT id, message_id, user_id, read_at FROM read_receipts \
                 WHERE message_id IN ({}) ORDER BY rowid",
                in_placeholders(message_ids.len())
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(params.as_slice(), |row| {
                    Ok(ReceiptRow {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        user_id: row.get(2)?,
                        read_at: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }
}

fn in_placeholders(count: usize) -> String {
    (1..=count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn query_user_by_id(conn: &Connection, id: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, username, online, last_active_at, last_seen_at, created_at \
         FROM users WHERE id = ?1",
    )?;

    let row = stmt
        .query_row([id], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                online: row.get(2)?,
                last_active_at: row.get(3)?,
                last_seen_at: row.get(4)?,
                created_at: row.get(5)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_chat_by_pair(conn: &Connection, low: &str, high: &str) -> Result<Option<ChatRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, participant_low, participant_high, created_at, updated_at \
         FROM chats WHERE participant_low = ?1 AND participant_high = ?2",
    )?;

    let row = stmt.query_row([low, high], map_chat_row).optional()?;
    Ok(row)
}

fn query_message_by_id(conn: &Connection, id: &str) -> Result<Option<MessageRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages m \
         JOIN users u ON u.id = m.sender_id WHERE m.id = ?1",
    ))?;

    let row = stmt.query_row([id], map_message_row).optional()?;
    Ok(row)
}

fn map_chat_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatRow> {
    Ok(ChatRow {
        id: row.get(0)?,
        participant_low: row.get(1)?,
        participant_high: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_username: row.get(3)?,
        text: row.get(4)?,
        reply_to: row.get(5)?,
        deleted: row.get(6)?,
        edited: row.get(7)?,
        pinned: row.get(8)?,
        pinned_by: row.get(9)?,
        pinned_at: row.get(10)?,
        created_at: row.get(11)?,
    })
}
