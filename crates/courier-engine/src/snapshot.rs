//! Assembly of canonical wire snapshots from store rows. Runs on blocking
//! threads alongside the queries that feed it.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use courier_store::Database;
use courier_store::models::{ChatRow, MessageRow};
use courier_types::models::{
    ChatSummary, EditRecord, Message, Reaction, ReadReceipt, ReplySummary, UserSummary,
};

pub(crate) fn parse_id(value: &str, context: &str) -> Uuid {
    value.parse().unwrap_or_else(|e| {
        warn!("Corrupt id '{}' on {}: {}", value, context, e);
        Uuid::default()
    })
}

pub(crate) fn parse_ts(value: &str, context: &str) -> DateTime<Utc> {
    value.parse::<DateTime<Utc>>().unwrap_or_else(|e| {
        warn!("Corrupt timestamp '{}' on {}: {}", value, context, e);
        DateTime::default()
    })
}

fn user_summary(db: &Database, id: &str) -> Result<UserSummary> {
    let row = db
        .get_user(id)?
        .with_context(|| format!("user {} missing", id))?;
    Ok(UserSummary {
        id: parse_id(&row.id, "user"),
        username: row.username,
    })
}

pub(crate) fn chat_summary(db: &Database, row: &ChatRow) -> Result<ChatSummary> {
    let participants = vec![
        user_summary(db, &row.participant_low)?,
        user_summary(db, &row.participant_high)?,
    ];

    let pinned = db
        .pinned_ids(&row.id)?
        .iter()
        .map(|id| parse_id(id, "pinned message"))
        .collect();

    Ok(ChatSummary {
        id: parse_id(&row.id, "chat"),
        participants,
        pinned,
        updated_at: parse_ts(&row.updated_at, "chat"),
    })
}

pub(crate) fn message_snapshot(db: &Database, id: &str) -> Result<Option<Message>> {
    let Some(row) = db.get_message(id)? else {
        return Ok(None);
    };
    let mut snapshots = message_snapshots(db, vec![row])?;
    Ok(snapshots.pop())
}

/// Expand message rows into full snapshots: reactions, edit history, read
/// receipts batched per id, sender and reply target as minimal projections.
pub(crate) fn message_snapshots(db: &Database, rows: Vec<MessageRow>) -> Result<Vec<Message>> {
    let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();

    let mut reactions: HashMap<String, Vec<Reaction>> = HashMap::new();
    for r in db.reactions_for_messages(&ids)? {
        reactions.entry(r.message_id.clone()).or_default().push(Reaction {
            emoji: r.emoji,
            user_id: parse_id(&r.user_id, "reaction"),
        });
    }

    let mut edits: HashMap<String, Vec<EditRecord>> = HashMap::new();
    for e in db.edits_for_messages(&ids)? {
        edits.entry(e.message_id.clone()).or_default().push(EditRecord {
            prior_text: e.prior_text,
            edited_at: parse_ts(&e.edited_at, "edit"),
        });
    }

    let mut receipts: HashMap<String, Vec<ReadReceipt>> = HashMap::new();
    for r in db.receipts_for_messages(&ids)? {
        receipts.entry(r.message_id.clone()).or_default().push(ReadReceipt {
            user_id: parse_id(&r.user_id, "read receipt"),
            read_at: parse_ts(&r.read_at, "read receipt"),
        });
    }

    // Reply targets, each expanded once however often it is referenced.
    let mut replies: HashMap<String, ReplySummary> = HashMap::new();
    for row in &rows {
        let Some(target_id) = &row.reply_to else {
            continue;
        };
        if replies.contains_key(target_id) {
            continue;
        }
        match db.get_message(target_id)? {
            Some(target) => {
                replies.insert(
                    target_id.clone(),
                    ReplySummary {
                        id: parse_id(&target.id, "reply target"),
                        sender_username: target.sender_username,
                    },
                );
            }
            None => warn!("message {} replies to missing message {}", row.id, target_id),
        }
    }

    let messages = rows
        .into_iter()
        .map(|row| Message {
            id: parse_id(&row.id, "message"),
            chat_id: parse_id(&row.chat_id, "message"),
            sender: UserSummary {
                id: parse_id(&row.sender_id, "message sender"),
                username: row.sender_username.clone(),
            },
            text: row.text,
            reply_to: row
                .reply_to
                .as_ref()
                .and_then(|target| replies.get(target).cloned()),
            reactions: reactions.remove(&row.id).unwrap_or_default(),
            deleted: row.deleted,
            edited: row.edited,
            edit_history: edits.remove(&row.id).unwrap_or_default(),
            pinned: row.pinned,
            pinned_by: row.pinned_by.as_deref().map(|id| parse_id(id, "pinned_by")),
            pinned_at: row.pinned_at.as_deref().map(|ts| parse_ts(ts, "pinned_at")),
            read_by: receipts.remove(&row.id).unwrap_or_default(),
            created_at: parse_ts(&row.created_at, "message"),
        })
        .collect();

    Ok(messages)
}
