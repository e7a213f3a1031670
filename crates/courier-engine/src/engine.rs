use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use courier_gateway::{ConnectionRegistry, GroupId, RoomRouter};
use courier_store::Database;
use courier_types::events::ServerEvent;
use courier_types::models::{DELETED_TEXT, Message, NotificationPayload};

use crate::error::EngineError;
use crate::notify::NotificationSink;
use crate::snapshot;

/// Validates and applies message mutations, persisting first and
/// broadcasting the resulting canonical snapshot after. One instance is
/// shared by every connection.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    db: Arc<Database>,
    registry: ConnectionRegistry,
    router: RoomRouter,
    notifier: Arc<dyn NotificationSink>,
}

fn require_id(id: Uuid) -> Result<(), EngineError> {
    if id.is_nil() {
        Err(EngineError::MalformedId)
    } else {
        Ok(())
    }
}

impl Engine {
    pub fn new(
        db: Arc<Database>,
        registry: ConnectionRegistry,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let router = RoomRouter::new(registry.clone());
        Self {
            inner: Arc::new(EngineInner {
                db,
                registry,
                router,
                notifier,
            }),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn router(&self) -> &RoomRouter {
        &self.inner.router
    }

    /// Run a store call on a blocking thread. No registry lock is ever held
    /// across this await, so broadcasts in other chats keep flowing.
    async fn blocking<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.inner.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| EngineError::Store(anyhow::anyhow!("blocking task failed: {e}")))?
            .map_err(EngineError::Store)
    }

    /// Bind a connection to its user, join the personal group and the group
    /// of every chat the user participates in, and flip the user online when
    /// this is their first live connection.
    pub async fn join_user(&self, conn_id: Uuid, user_id: Uuid) -> Result<(), EngineError> {
        require_id(user_id)?;

        let uid = user_id.to_string();
        let user = self
            .blocking(move |db| db.get_user(&uid))
            .await?
            .ok_or(EngineError::NotFound("user"))?;

        let first = self.inner.registry.bind_user(conn_id, user_id).await;
        self.inner
            .registry
            .join(conn_id, GroupId::User(user_id))
            .await;

        // Messages for any of the user's chats should reach this connection
        // without an explicit open.
        let uid = user_id.to_string();
        let chats = self.blocking(move |db| db.chats_for_user(&uid)).await?;
        for chat in &chats {
            let chat_id = snapshot::parse_id(&chat.id, "chat");
            self.inner
                .registry
                .join(conn_id, GroupId::Chat(chat_id))
                .await;
        }

        if first {
            let uid = user_id.to_string();
            let now = Utc::now().to_rfc3339();
            self.blocking(move |db| db.set_online(&uid, &now)).await?;
            info!("{} ({}) online", user.username, user_id);
        }

        self.inner
            .router
            .unicast(conn_id, ServerEvent::Ready { user_id })
            .await;
        Ok(())
    }

    pub async fn join_chat(&self, conn_id: Uuid, chat_id: Uuid) -> Result<(), EngineError> {
        require_id(chat_id)?;

        let cid = chat_id.to_string();
        self.blocking(move |db| db.get_chat(&cid))
            .await?
            .ok_or(EngineError::NotFound("chat"))?;

        self.inner
            .registry
            .join(conn_id, GroupId::Chat(chat_id))
            .await;
        Ok(())
    }

    /// Find or create the chat between two distinct users. At most one chat
    /// exists per unordered pair; a repeat request returns the existing one.
    pub async fn start_chat(
        &self,
        conn_id: Uuid,
        user_id: Uuid,
        other_user_id: Uuid,
    ) -> Result<(), EngineError> {
        require_id(user_id)?;
        require_id(other_user_id)?;
        if user_id == other_user_id {
            return Err(EngineError::InvalidState("cannot start a chat with yourself"));
        }

        for id in [user_id, other_user_id] {
            let uid = id.to_string();
            self.blocking(move |db| db.get_user(&uid))
                .await?
                .ok_or(EngineError::NotFound("user"))?;
        }

        let candidate = Uuid::new_v4().to_string();
        let (a, b) = (user_id.to_string(), other_user_id.to_string());
        let now = Utc::now().to_rfc3339();
        let (row, created) = self
            .blocking(move |db| db.find_or_create_chat(&candidate, &a, &b, &now))
            .await?;

        let chat = self
            .blocking(move |db| snapshot::chat_summary(db, &row))
            .await?;

        self.inner
            .registry
            .join(conn_id, GroupId::Chat(chat.id))
            .await;

        let event = ServerEvent::ChatCreated { chat };
        if created {
            info!("chat between {} and {} created", user_id, other_user_id);
            for participant in [user_id, other_user_id] {
                self.inner
                    .router
                    .broadcast(GroupId::User(participant), event.clone())
                    .await;
            }
            // The caller may not have joined their personal group yet.
            if !self
                .inner
                .registry
                .is_member(GroupId::User(user_id), conn_id)
                .await
            {
                self.inner.router.unicast(conn_id, event).await;
            }
        } else {
            self.inner.router.unicast(conn_id, event).await;
        }
        Ok(())
    }

    /// Answer a history request with the chat's full ordered message list.
    pub async fn load_history(&self, conn_id: Uuid, chat_id: Uuid) -> Result<(), EngineError> {
        require_id(chat_id)?;

        let cid = chat_id.to_string();
        self.blocking(move |db| db.get_chat(&cid))
            .await?
            .ok_or(EngineError::NotFound("chat"))?;

        let cid = chat_id.to_string();
        let messages = self
            .blocking(move |db| {
                let rows = db.messages_for_chat(&cid)?;
                snapshot::message_snapshots(db, rows)
            })
            .await?;

        self.inner
            .router
            .unicast(conn_id, ServerEvent::HistoryLoaded { chat_id, messages })
            .await;
        Ok(())
    }

    pub async fn send_message(
        &self,
        conn_id: Uuid,
        chat_id: Uuid,
        sender_id: Uuid,
        text: String,
        reply_to: Option<Uuid>,
    ) -> Result<(), EngineError> {
        require_id(chat_id)?;
        require_id(sender_id)?;
        if let Some(target) = reply_to {
            require_id(target)?;
        }

        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(EngineError::InvalidState("message text is empty"));
        }

        let cid = chat_id.to_string();
        let chat = self
            .blocking(move |db| db.get_chat(&cid))
            .await?
            .ok_or(EngineError::NotFound("chat"))?;

        let sid = sender_id.to_string();
        if chat.participant_low != sid && chat.participant_high != sid {
            return Err(EngineError::Unauthorized("send to this chat"));
        }

        if let Some(target) = reply_to {
            let tid = target.to_string();
            let target_row = self
                .blocking(move |db| db.get_message(&tid))
                .await?
                .ok_or(EngineError::NotFound("reply target"))?;
            if target_row.chat_id != chat.id {
                return Err(EngineError::InvalidState("reply target is in another chat"));
            }
        }

        let message_id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        {
            let mid = message_id.to_string();
            let cid = chat_id.to_string();
            let sid = sid.clone();
            let text = text.clone();
            let reply = reply_to.map(|r| r.to_string());
            let now = now.clone();
            self.blocking(move |db| {
                db.insert_message(&mid, &cid, &sid, &text, reply.as_deref(), &now)?;
                db.touch_chat(&cid, &now)
            })
            .await?;
        }

        let mid = message_id.to_string();
        let message = self
            .blocking(move |db| snapshot::message_snapshot(db, &mid))
            .await?
            .ok_or(EngineError::NotFound("message"))?;

        let group = GroupId::Chat(chat_id);
        self.inner
            .router
            .broadcast(
                group,
                ServerEvent::MessageCreated {
                    message: message.clone(),
                },
            )
            .await;

        // The sender's connection may still be mid "open chat" and not yet a
        // group member. Deliver their own message directly in that case;
        // clients de-duplicate by id.
        if !self.inner.registry.is_member(group, conn_id).await {
            self.inner
                .router
                .unicast(
                    conn_id,
                    ServerEvent::MessageCreated {
                        message: message.clone(),
                    },
                )
                .await;
        }

        let cid = chat_id.to_string();
        let chat_summary = self
            .blocking(move |db| {
                let row = db
                    .get_chat(&cid)?
                    .ok_or_else(|| anyhow::anyhow!("chat {} vanished", cid))?;
                snapshot::chat_summary(db, &row)
            })
            .await?;

        let notification = NotificationPayload {
            chat_id,
            message_id,
            sender: message.sender.clone(),
            preview: message.text.clone(),
        };

        // Keep every participant's chat list live, and hand the tuple to the
        // notification sink for the recipient side.
        let participants: Vec<Uuid> = chat_summary.participant_ids().collect();
        for participant in participants {
            self.inner
                .router
                .broadcast(
                    GroupId::User(participant),
                    ServerEvent::ChatTouched {
                        chat: chat_summary.clone(),
                        notification: notification.clone(),
                    },
                )
                .await;

            if participant != sender_id {
                self.inner
                    .notifier
                    .notify(&message, &message.sender, &chat_summary);
            }
        }

        Ok(())
    }

    pub async fn edit_message(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        new_text: String,
    ) -> Result<(), EngineError> {
        require_id(message_id)?;
        require_id(user_id)?;

        let new_text = new_text.trim().to_string();
        if new_text.is_empty() {
            return Err(EngineError::InvalidState("message text is empty"));
        }

        let mid = message_id.to_string();
        let row = self
            .blocking(move |db| db.get_message(&mid))
            .await?
            .ok_or(EngineError::NotFound("message"))?;

        if row.sender_id != user_id.to_string() {
            return Err(EngineError::Unauthorized("edit this message"));
        }
        if row.deleted {
            return Err(EngineError::InvalidState("message is deleted"));
        }

        let edit_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let mid = message_id.to_string();
        let prior = row.text;
        self.blocking(move |db| db.apply_edit(&edit_id, &mid, &prior, &new_text, &now))
            .await?;

        self.broadcast_updated(message_id).await?;
        Ok(())
    }

    /// Soft delete. Idempotent: deleting an already-deleted message is a
    /// successful no-op with no re-broadcast.
    pub async fn delete_message(&self, message_id: Uuid, user_id: Uuid) -> Result<(), EngineError> {
        require_id(message_id)?;
        require_id(user_id)?;

        let mid = message_id.to_string();
        let row = self
            .blocking(move |db| db.get_message(&mid))
            .await?
            .ok_or(EngineError::NotFound("message"))?;

        if row.sender_id != user_id.to_string() {
            return Err(EngineError::Unauthorized("delete this message"));
        }
        if row.deleted {
            return Ok(());
        }

        let mid = message_id.to_string();
        self.blocking(move |db| db.mark_deleted(&mid, DELETED_TEXT))
            .await?;

        self.broadcast_updated(message_id).await?;
        Ok(())
    }

    /// Set the user's reaction, replacing any reaction they already hold on
    /// this message.
    pub async fn react_message(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
    ) -> Result<(), EngineError> {
        require_id(message_id)?;
        require_id(user_id)?;

        let emoji = emoji.trim().to_string();
        if emoji.is_empty() {
            return Err(EngineError::InvalidState("emoji is empty"));
        }

        let mid = message_id.to_string();
        let row = self
            .blocking(move |db| db.get_message(&mid))
            .await?
            .ok_or(EngineError::NotFound("message"))?;

        if row.deleted {
            return Err(EngineError::InvalidState("message is deleted"));
        }

        self.require_participant(&row.chat_id, user_id, "react in this chat")
            .await?;

        let reaction_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let (mid, uid) = (message_id.to_string(), user_id.to_string());
        self.blocking(move |db| db.replace_reaction(&reaction_id, &mid, &uid, &emoji, &now))
            .await?;

        self.broadcast_updated(message_id).await?;
        Ok(())
    }

    /// Toggle the pinned flag. Deleted messages may still be pinned and
    /// unpinned; deletion only freezes content.
    pub async fn pin_message(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        chat_id: Uuid,
    ) -> Result<(), EngineError> {
        require_id(message_id)?;
        require_id(user_id)?;
        require_id(chat_id)?;

        let mid = message_id.to_string();
        let row = self
            .blocking(move |db| db.get_message(&mid))
            .await?
            .ok_or(EngineError::NotFound("message"))?;

        let cid = chat_id.to_string();
        self.blocking(move |db| db.get_chat(&cid))
            .await?
            .ok_or(EngineError::NotFound("chat"))?;

        if row.chat_id != chat_id.to_string() {
            return Err(EngineError::InvalidState("message belongs to another chat"));
        }

        self.require_participant(&row.chat_id, user_id, "pin in this chat")
            .await?;

        let pinning = !row.pinned;
        let mid = message_id.to_string();
        let uid = user_id.to_string();
        let now = Utc::now().to_rfc3339();
        self.blocking(move |db| {
            if pinning {
                db.set_pinned(&mid, true, Some(&uid), Some(&now))
            } else {
                db.set_pinned(&mid, false, None, None)
            }
        })
        .await?;

        // Message snapshot first, then the pinned-set delta, so clients
        // already hold the updated message when the panel refreshes.
        self.broadcast_updated(message_id).await?;

        let cid = chat_id.to_string();
        let pinned = self
            .blocking(move |db| db.pinned_ids(&cid))
            .await?
            .iter()
            .map(|id| snapshot::parse_id(id, "pinned message"))
            .collect();

        self.inner
            .router
            .broadcast(
                GroupId::Chat(chat_id),
                ServerEvent::PinnedSetChanged { chat_id, pinned },
            )
            .await;
        Ok(())
    }

    /// Record one read receipt. Idempotent, and never for the sender's own
    /// message. Returns whether a receipt was actually added.
    pub async fn mark_message_read(
        &self,
        message_id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, EngineError> {
        require_id(message_id)?;
        require_id(user_id)?;

        let mid = message_id.to_string();
        let row = self
            .blocking(move |db| db.get_message(&mid))
            .await?
            .ok_or(EngineError::NotFound("message"))?;

        if row.sender_id == user_id.to_string() {
            return Ok(false);
        }

        let receipt_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let (mid, uid) = (message_id.to_string(), user_id.to_string());
        let added = self
            .blocking(move |db| db.insert_receipt(&receipt_id, &mid, &uid, &now))
            .await?;

        if added {
            self.broadcast_updated(message_id).await?;
        }
        Ok(added)
    }

    /// Sweep every message of a chat with the read-receipt rule, then push
    /// one aggregated refresh of the whole list. A failing row is logged and
    /// skipped, never aborting the sweep.
    pub async fn mark_chat_read(&self, chat_id: Uuid, user_id: Uuid) -> Result<(), EngineError> {
        require_id(chat_id)?;
        require_id(user_id)?;

        let cid = chat_id.to_string();
        let chat = self
            .blocking(move |db| db.get_chat(&cid))
            .await?
            .ok_or(EngineError::NotFound("chat"))?;

        let uid = user_id.to_string();
        if chat.participant_low != uid && chat.participant_high != uid {
            return Err(EngineError::Unauthorized("mark this chat read"));
        }

        let cid = chat_id.to_string();
        let now = Utc::now().to_rfc3339();
        let messages = self
            .blocking(move |db| {
                for row in &db.messages_for_chat(&cid)? {
                    if row.sender_id == uid {
                        continue;
                    }
                    let receipt_id = Uuid::new_v4().to_string();
                    if let Err(e) = db.insert_receipt(&receipt_id, &row.id, &uid, &now) {
                        warn!("read receipt for message {} failed: {}", row.id, e);
                    }
                }
                let rows = db.messages_for_chat(&cid)?;
                snapshot::message_snapshots(db, rows)
            })
            .await?;

        self.inner
            .router
            .broadcast(
                GroupId::Chat(chat_id),
                ServerEvent::ReadReceiptsUpdated { chat_id, messages },
            )
            .await;
        Ok(())
    }

    /// Disconnect cleanup: drop all memberships, and when this was the
    /// user's last live connection, persist the offline flip. Store failures
    /// are logged; the teardown itself never fails.
    pub async fn disconnect(&self, conn_id: Uuid) {
        let Some(departure) = self.inner.registry.leave_all(conn_id).await else {
            return;
        };
        if !departure.last_for_user {
            return;
        }

        let uid = departure.user_id.to_string();
        let now = Utc::now().to_rfc3339();
        match self.blocking(move |db| db.set_offline(&uid, &now)).await {
            Ok(()) => info!("user {} offline", departure.user_id),
            Err(e) => warn!("offline update for {} failed: {}", departure.user_id, e),
        }
    }

    async fn require_participant(
        &self,
        chat_id: &str,
        user_id: Uuid,
        action: &'static str,
    ) -> Result<(), EngineError> {
        let cid = chat_id.to_string();
        let chat = self
            .blocking(move |db| db.get_chat(&cid))
            .await?
            .ok_or(EngineError::NotFound("chat"))?;

        let uid = user_id.to_string();
        if chat.participant_low != uid && chat.participant_high != uid {
            return Err(EngineError::Unauthorized(action));
        }
        Ok(())
    }

    /// Reload the canonical snapshot and broadcast it to the chat group.
    async fn broadcast_updated(&self, message_id: Uuid) -> Result<Message, EngineError> {
        let mid = message_id.to_string();
        let message = self
            .blocking(move |db| snapshot::message_snapshot(db, &mid))
            .await?
            .ok_or(EngineError::NotFound("message"))?;

        let group = GroupId::Chat(message.chat_id);
        self.inner
            .router
            .broadcast(
                group,
                ServerEvent::MessageUpdated {
                    message: message.clone(),
                },
            )
            .await;
        Ok(message)
    }
}
