//! Integration tests: the mutation engine against an in-memory store, with
//! channel-backed connections standing in for live sockets. Events are
//! emitted synchronously inside each awaited operation, so `try_recv` after
//! an op observes exactly what a connected client would have received.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use courier_engine::{Engine, EngineError, LogNotifier, NotificationSink};
use courier_gateway::ConnectionRegistry;
use courier_store::Database;
use courier_types::events::ServerEvent;
use courier_types::models::{ChatSummary, DELETED_TEXT, Message, UserSummary};

struct TestBed {
    engine: Engine,
    db: Arc<Database>,
}

impl TestBed {
    fn new() -> Self {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let registry = ConnectionRegistry::new();
        let engine = Engine::new(db.clone(), registry, Arc::new(LogNotifier));
        Self { engine, db }
    }

    fn user(&self, username: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.db
            .create_user(&id.to_string(), username, &Utc::now().to_rfc3339())
            .unwrap();
        id
    }

    async fn connect(&self) -> (Uuid, UnboundedReceiver<ServerEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.engine.registry().register(conn_id, tx).await;
        (conn_id, rx)
    }

    /// Create the chat between two users through the engine itself.
    async fn chat(&self, a: Uuid, b: Uuid) -> Uuid {
        let (conn, mut rx) = self.connect().await;
        self.engine.start_chat(conn, a, b).await.unwrap();
        match next(&mut rx) {
            ServerEvent::ChatCreated { chat } => chat.id,
            other => panic!("expected ChatCreated, got {:?}", other),
        }
    }
}

fn next(rx: &mut UnboundedReceiver<ServerEvent>) -> ServerEvent {
    rx.try_recv().expect("expected an event")
}

fn drain(rx: &mut UnboundedReceiver<ServerEvent>) {
    while rx.try_recv().is_ok() {}
}

fn created_message(event: ServerEvent) -> Message {
    match event {
        ServerEvent::MessageCreated { message } => message,
        other => panic!("expected MessageCreated, got {:?}", other),
    }
}

fn updated_message(event: ServerEvent) -> Message {
    match event {
        ServerEvent::MessageUpdated { message } => message,
        other => panic!("expected MessageUpdated, got {:?}", other),
    }
}

#[tokio::test]
async fn chat_initiation_is_idempotent_across_argument_order() {
    let bed = TestBed::new();
    let (alice, bob) = (bed.user("alice"), bed.user("bob"));

    let first = bed.chat(alice, bob).await;

    // Repeat in the opposite order: same chat comes back, none is created.
    let (conn, mut rx) = bed.connect().await;
    bed.engine.start_chat(conn, bob, alice).await.unwrap();
    match next(&mut rx) {
        ServerEvent::ChatCreated { chat } => assert_eq!(chat.id, first),
        other => panic!("expected ChatCreated, got {:?}", other),
    }
}

#[tokio::test]
async fn starting_a_chat_with_yourself_is_rejected() {
    let bed = TestBed::new();
    let alice = bed.user("alice");
    let (conn, _rx) = bed.connect().await;

    let err = bed.engine.start_chat(conn, alice, alice).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));
}

#[tokio::test]
async fn send_reaches_joined_participant() {
    let bed = TestBed::new();
    let (alice, bob) = (bed.user("alice"), bed.user("bob"));
    let chat = bed.chat(alice, bob).await;

    let (conn_b, mut rx_b) = bed.connect().await;
    bed.engine.join_user(conn_b, bob).await.unwrap();
    drain(&mut rx_b);

    let (conn_a, mut rx_a) = bed.connect().await;
    bed.engine.join_user(conn_a, alice).await.unwrap();
    drain(&mut rx_a);

    bed.engine
        .send_message(conn_a, chat, alice, "hi".into(), None)
        .await
        .unwrap();

    let message = created_message(next(&mut rx_b));
    assert_eq!(message.text, "hi");
    assert_eq!(message.sender.id, alice);
    assert_eq!(message.sender.username, "alice");
    assert!(!message.deleted);
    assert!(!message.edited);

    // The chat list refresh follows on the personal group.
    match next(&mut rx_b) {
        ServerEvent::ChatTouched { chat: touched, notification } => {
            assert_eq!(touched.id, chat);
            assert_eq!(notification.preview, "hi");
            assert_eq!(notification.sender.id, alice);
        }
        other => panic!("expected ChatTouched, got {:?}", other),
    }
}

#[tokio::test]
async fn sender_outside_the_group_still_sees_own_message_once() {
    let bed = TestBed::new();
    let (alice, bob) = (bed.user("alice"), bed.user("bob"));
    let chat = bed.chat(alice, bob).await;

    // A connection that never joined anything sends straight away (the
    // open-chat / send race).
    let (conn, mut rx) = bed.connect().await;
    bed.engine
        .send_message(conn, chat, alice, "early".into(), None)
        .await
        .unwrap();

    let message = created_message(next(&mut rx));
    assert_eq!(message.text, "early");

    // Exactly once: no second copy queued.
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn empty_text_and_foreign_sender_are_rejected() {
    let bed = TestBed::new();
    let (alice, bob) = (bed.user("alice"), bed.user("bob"));
    let mallory = bed.user("mallory");
    let chat = bed.chat(alice, bob).await;
    let (conn, _rx) = bed.connect().await;

    let err = bed
        .engine
        .send_message(conn, chat, alice, "   ".into(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    let err = bed
        .engine
        .send_message(conn, chat, mallory, "hi".into(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized(_)));
}

#[tokio::test]
async fn reply_must_target_the_same_chat() {
    let bed = TestBed::new();
    let (alice, bob) = (bed.user("alice"), bed.user("bob"));
    let carol = bed.user("carol");
    let chat_ab = bed.chat(alice, bob).await;
    let chat_ac = bed.chat(alice, carol).await;

    let (conn, mut rx) = bed.connect().await;
    bed.engine
        .send_message(conn, chat_ab, alice, "root".into(), None)
        .await
        .unwrap();
    let root = created_message(next(&mut rx));

    let err = bed
        .engine
        .send_message(conn, chat_ac, alice, "wrong".into(), Some(root.id))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    bed.engine
        .send_message(conn, chat_ab, alice, "right".into(), Some(root.id))
        .await
        .unwrap();
    let reply = created_message(next(&mut rx));
    let target = reply.reply_to.expect("reply projection present");
    assert_eq!(target.id, root.id);
    assert_eq!(target.sender_username, "alice");
}

#[tokio::test]
async fn delete_is_soft_terminal_and_observed_once() {
    let bed = TestBed::new();
    let (alice, bob) = (bed.user("alice"), bed.user("bob"));
    let chat = bed.chat(alice, bob).await;

    let (conn_b, mut rx_b) = bed.connect().await;
    bed.engine.join_user(conn_b, bob).await.unwrap();
    drain(&mut rx_b);

    let (conn_a, mut rx_a) = bed.connect().await;
    bed.engine
        .send_message(conn_a, chat, alice, "oops".into(), None)
        .await
        .unwrap();
    let message = created_message(next(&mut rx_a));
    drain(&mut rx_b);

    // React first so the delete provably clears it.
    bed.engine
        .react_message(message.id, bob, "👍".into())
        .await
        .unwrap();
    drain(&mut rx_b);

    bed.engine.delete_message(message.id, alice).await.unwrap();

    let deleted = updated_message(next(&mut rx_b));
    assert!(deleted.deleted);
    assert_eq!(deleted.text, DELETED_TEXT);
    assert!(deleted.reactions.is_empty());
    // Exactly one update for the delete.
    assert!(rx_b.try_recv().is_err());

    // Deleting again is a silent no-op.
    bed.engine.delete_message(message.id, alice).await.unwrap();
    assert!(rx_b.try_recv().is_err());

    // Content mutation is over; chat-level metadata is not.
    let err = bed
        .engine
        .edit_message(message.id, alice, "rewrite".into())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    let err = bed
        .engine
        .react_message(message.id, bob, "❤️".into())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    bed.engine
        .pin_message(message.id, bob, chat)
        .await
        .expect("pinning a deleted message stays allowed");
}

#[tokio::test]
async fn only_the_sender_may_edit_or_delete() {
    let bed = TestBed::new();
    let (alice, bob) = (bed.user("alice"), bed.user("bob"));
    let chat = bed.chat(alice, bob).await;

    let (conn, mut rx) = bed.connect().await;
    bed.engine
        .send_message(conn, chat, alice, "mine".into(), None)
        .await
        .unwrap();
    let message = created_message(next(&mut rx));

    let err = bed
        .engine
        .edit_message(message.id, bob, "theirs".into())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized(_)));

    let err = bed.engine.delete_message(message.id, bob).await.unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized(_)));
}

#[tokio::test]
async fn edit_appends_history_and_flags() {
    let bed = TestBed::new();
    let (alice, bob) = (bed.user("alice"), bed.user("bob"));
    let chat = bed.chat(alice, bob).await;

    let (conn_b, mut rx_b) = bed.connect().await;
    bed.engine.join_user(conn_b, bob).await.unwrap();
    drain(&mut rx_b);

    let (conn_a, mut rx_a) = bed.connect().await;
    bed.engine
        .send_message(conn_a, chat, alice, "helo".into(), None)
        .await
        .unwrap();
    let message = created_message(next(&mut rx_a));
    drain(&mut rx_b);

    bed.engine
        .edit_message(message.id, alice, "hello".into())
        .await
        .unwrap();

    let edited = updated_message(next(&mut rx_b));
    assert!(edited.edited);
    assert_eq!(edited.text, "hello");
    assert_eq!(edited.edit_history.len(), 1);
    assert_eq!(edited.edit_history[0].prior_text, "helo");

    bed.engine
        .edit_message(message.id, alice, "hello again".into())
        .await
        .unwrap();
    let edited = updated_message(next(&mut rx_b));
    assert_eq!(edited.edit_history.len(), 2);
    assert_eq!(edited.edit_history[1].prior_text, "hello");
}

#[tokio::test]
async fn reacting_twice_replaces_the_previous_reaction() {
    let bed = TestBed::new();
    let (alice, bob) = (bed.user("alice"), bed.user("bob"));
    let chat = bed.chat(alice, bob).await;

    let (conn_b, mut rx_b) = bed.connect().await;
    bed.engine.join_user(conn_b, bob).await.unwrap();
    drain(&mut rx_b);

    let (conn_a, mut rx_a) = bed.connect().await;
    bed.engine
        .send_message(conn_a, chat, bob, "react to me".into(), None)
        .await
        .unwrap();
    let message = created_message(next(&mut rx_a));
    drain(&mut rx_b);

    bed.engine
        .react_message(message.id, alice, "👍".into())
        .await
        .unwrap();
    drain(&mut rx_b);
    bed.engine
        .react_message(message.id, alice, "❤️".into())
        .await
        .unwrap();

    let updated = updated_message(next(&mut rx_b));
    assert_eq!(updated.reactions.len(), 1);
    assert_eq!(updated.reactions[0].emoji, "❤️");
    assert_eq!(updated.reactions[0].user_id, alice);
}

#[tokio::test]
async fn reactions_from_both_users_coexist() {
    let bed = TestBed::new();
    let (alice, bob) = (bed.user("alice"), bed.user("bob"));
    let chat = bed.chat(alice, bob).await;

    let (conn, mut rx) = bed.connect().await;
    bed.engine
        .send_message(conn, chat, alice, "both".into(), None)
        .await
        .unwrap();
    let message = created_message(next(&mut rx));

    bed.engine
        .react_message(message.id, alice, "👍".into())
        .await
        .unwrap();
    bed.engine
        .react_message(message.id, bob, "😂".into())
        .await
        .unwrap();

    let (conn2, mut rx2) = bed.connect().await;
    bed.engine.load_history(conn2, chat).await.unwrap();
    match next(&mut rx2) {
        ServerEvent::HistoryLoaded { messages, .. } => {
            assert_eq!(messages[0].reactions.len(), 2);
        }
        other => panic!("expected HistoryLoaded, got {:?}", other),
    }
}

#[tokio::test]
async fn pin_toggles_and_publishes_the_full_set_in_order() {
    let bed = TestBed::new();
    let (alice, bob) = (bed.user("alice"), bed.user("bob"));
    let chat = bed.chat(alice, bob).await;

    let (conn_b, mut rx_b) = bed.connect().await;
    bed.engine.join_user(conn_b, bob).await.unwrap();
    drain(&mut rx_b);

    let (conn_a, mut rx_a) = bed.connect().await;
    bed.engine
        .send_message(conn_a, chat, alice, "important".into(), None)
        .await
        .unwrap();
    let message = created_message(next(&mut rx_a));
    drain(&mut rx_b);

    bed.engine.pin_message(message.id, bob, chat).await.unwrap();

    // Snapshot first, pinned set second.
    let pinned_msg = updated_message(next(&mut rx_b));
    assert!(pinned_msg.pinned);
    assert_eq!(pinned_msg.pinned_by, Some(bob));
    assert!(pinned_msg.pinned_at.is_some());
    match next(&mut rx_b) {
        ServerEvent::PinnedSetChanged { chat_id, pinned } => {
            assert_eq!(chat_id, chat);
            assert_eq!(pinned, vec![message.id]);
        }
        other => panic!("expected PinnedSetChanged, got {:?}", other),
    }

    // Toggle back off.
    bed.engine.pin_message(message.id, bob, chat).await.unwrap();
    let unpinned = updated_message(next(&mut rx_b));
    assert!(!unpinned.pinned);
    assert_eq!(unpinned.pinned_by, None);
    match next(&mut rx_b) {
        ServerEvent::PinnedSetChanged { pinned, .. } => assert!(pinned.is_empty()),
        other => panic!("expected PinnedSetChanged, got {:?}", other),
    }
}

#[tokio::test]
async fn pin_rejects_a_message_from_another_chat() {
    let bed = TestBed::new();
    let (alice, bob) = (bed.user("alice"), bed.user("bob"));
    let carol = bed.user("carol");
    let chat_ab = bed.chat(alice, bob).await;
    let chat_ac = bed.chat(alice, carol).await;

    let (conn, mut rx) = bed.connect().await;
    bed.engine
        .send_message(conn, chat_ab, alice, "here".into(), None)
        .await
        .unwrap();
    let message = created_message(next(&mut rx));

    let err = bed
        .engine
        .pin_message(message.id, alice, chat_ac)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));
}

#[tokio::test]
async fn react_then_pin_arrives_in_submission_order() {
    let bed = TestBed::new();
    let (alice, bob) = (bed.user("alice"), bed.user("bob"));
    let chat = bed.chat(alice, bob).await;

    let (conn_b, mut rx_b) = bed.connect().await;
    bed.engine.join_user(conn_b, bob).await.unwrap();
    drain(&mut rx_b);

    let (conn_a, mut rx_a) = bed.connect().await;
    bed.engine
        .send_message(conn_a, chat, alice, "ordered".into(), None)
        .await
        .unwrap();
    let message = created_message(next(&mut rx_a));
    drain(&mut rx_b);

    // One logical thread of execution: react, then pin.
    bed.engine
        .react_message(message.id, alice, "👍".into())
        .await
        .unwrap();
    bed.engine
        .pin_message(message.id, alice, chat)
        .await
        .unwrap();

    let first = updated_message(next(&mut rx_b));
    assert_eq!(first.reactions.len(), 1);
    assert!(!first.pinned);

    let second = updated_message(next(&mut rx_b));
    assert!(second.pinned);
}

#[tokio::test]
async fn mark_chat_read_batches_and_skips_own_messages() {
    let bed = TestBed::new();
    let (alice, bob) = (bed.user("alice"), bed.user("bob"));
    let chat = bed.chat(alice, bob).await;

    let (conn_b, mut rx_b) = bed.connect().await;
    bed.engine.join_user(conn_b, bob).await.unwrap();
    drain(&mut rx_b);

    let (conn_a, mut rx_a) = bed.connect().await;
    bed.engine
        .send_message(conn_a, chat, alice, "one".into(), None)
        .await
        .unwrap();
    bed.engine
        .send_message(conn_a, chat, alice, "two".into(), None)
        .await
        .unwrap();
    bed.engine
        .send_message(conn_a, chat, bob, "mine".into(), None)
        .await
        .unwrap();
    drain(&mut rx_a);
    drain(&mut rx_b);

    bed.engine.mark_chat_read(chat, bob).await.unwrap();

    match next(&mut rx_b) {
        ServerEvent::ReadReceiptsUpdated { chat_id, messages } => {
            assert_eq!(chat_id, chat);
            assert_eq!(messages.len(), 3);
            // Alice's messages carry bob's receipt; bob's own does not.
            assert_eq!(messages[0].read_by.len(), 1);
            assert_eq!(messages[0].read_by[0].user_id, bob);
            assert_eq!(messages[1].read_by.len(), 1);
            assert!(messages[2].read_by.is_empty());
        }
        other => panic!("expected ReadReceiptsUpdated, got {:?}", other),
    }

    // Marking again adds nothing.
    bed.engine.mark_chat_read(chat, bob).await.unwrap();
    match next(&mut rx_b) {
        ServerEvent::ReadReceiptsUpdated { messages, .. } => {
            assert_eq!(messages[0].read_by.len(), 1);
        }
        other => panic!("expected ReadReceiptsUpdated, got {:?}", other),
    }
}

#[tokio::test]
async fn single_message_read_is_idempotent_and_never_self() {
    let bed = TestBed::new();
    let (alice, bob) = (bed.user("alice"), bed.user("bob"));
    let chat = bed.chat(alice, bob).await;

    let (conn, mut rx) = bed.connect().await;
    bed.engine
        .send_message(conn, chat, alice, "read me".into(), None)
        .await
        .unwrap();
    let message = created_message(next(&mut rx));

    assert!(bed.engine.mark_message_read(message.id, bob).await.unwrap());
    assert!(!bed.engine.mark_message_read(message.id, bob).await.unwrap());
    assert!(!bed.engine.mark_message_read(message.id, alice).await.unwrap());
}

#[tokio::test]
async fn history_is_ordered_and_fully_expanded() {
    let bed = TestBed::new();
    let (alice, bob) = (bed.user("alice"), bed.user("bob"));
    let chat = bed.chat(alice, bob).await;

    let (conn, mut rx) = bed.connect().await;
    for text in ["first", "second", "third"] {
        bed.engine
            .send_message(conn, chat, alice, text.into(), None)
            .await
            .unwrap();
    }
    drain(&mut rx);

    let (conn2, mut rx2) = bed.connect().await;
    bed.engine.load_history(conn2, chat).await.unwrap();
    match next(&mut rx2) {
        ServerEvent::HistoryLoaded { chat_id, messages } => {
            assert_eq!(chat_id, chat);
            let texts: Vec<&str> = messages.iter().map(|m| m.text.as_str()).collect();
            assert_eq!(texts, vec!["first", "second", "third"]);
            assert!(messages.iter().all(|m| m.sender.username == "alice"));
        }
        other => panic!("expected HistoryLoaded, got {:?}", other),
    }
}

#[tokio::test]
async fn operations_on_missing_or_malformed_ids_fail_cleanly() {
    let bed = TestBed::new();
    let alice = bed.user("alice");
    let (conn, _rx) = bed.connect().await;

    let err = bed.engine.join_user(conn, Uuid::nil()).await.unwrap_err();
    assert!(matches!(err, EngineError::MalformedId));

    let err = bed.engine.join_user(conn, Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    let err = bed
        .engine
        .react_message(Uuid::new_v4(), alice, "👍".into())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    let err = bed
        .engine
        .load_history(conn, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn join_chat_subscribes_a_connection_to_the_group() {
    let bed = TestBed::new();
    let (alice, bob) = (bed.user("alice"), bed.user("bob"));
    let chat = bed.chat(alice, bob).await;

    let (conn, mut rx) = bed.connect().await;
    bed.engine.join_chat(conn, chat).await.unwrap();
    // Joining twice changes nothing.
    bed.engine.join_chat(conn, chat).await.unwrap();

    let err = bed.engine.join_chat(conn, Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    let (sender_conn, _rx_sender) = bed.connect().await;
    bed.engine
        .send_message(sender_conn, chat, alice, "hello room".into(), None)
        .await
        .unwrap();

    let message = created_message(next(&mut rx));
    assert_eq!(message.text, "hello room");
    // Only one copy despite the double join.
    assert!(rx.try_recv().is_err());
}

#[derive(Default)]
struct RecordingSink(std::sync::Mutex<Vec<(Uuid, Uuid, Uuid)>>);

impl NotificationSink for RecordingSink {
    fn notify(&self, message: &Message, sender: &UserSummary, chat: &ChatSummary) {
        self.0
            .lock()
            .unwrap()
            .push((message.id, sender.id, chat.id));
    }
}

#[tokio::test]
async fn notification_sink_receives_the_recipient_tuple_at_send_time() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let sink = Arc::new(RecordingSink::default());
    let engine = Engine::new(db.clone(), ConnectionRegistry::new(), sink.clone());

    let now = Utc::now().to_rfc3339();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    db.create_user(&alice.to_string(), "alice", &now).unwrap();
    db.create_user(&bob.to_string(), "bob", &now).unwrap();

    let conn = Uuid::new_v4();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    engine.registry().register(conn, tx).await;
    engine.start_chat(conn, alice, bob).await.unwrap();
    let chat = match next(&mut rx) {
        ServerEvent::ChatCreated { chat } => chat.id,
        other => panic!("expected ChatCreated, got {:?}", other),
    };

    engine
        .send_message(conn, chat, alice, "ping".into(), None)
        .await
        .unwrap();

    // One tuple, aimed at the one non-sending participant.
    let seen = sink.0.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let (_, sender_id, chat_id) = seen[0];
    assert_eq!(sender_id, alice);
    assert_eq!(chat_id, chat);
}

#[tokio::test]
async fn disconnect_clears_membership_and_stops_delivery() {
    let bed = TestBed::new();
    let (alice, bob) = (bed.user("alice"), bed.user("bob"));
    let chat = bed.chat(alice, bob).await;

    let (conn_b, mut rx_b) = bed.connect().await;
    bed.engine.join_user(conn_b, bob).await.unwrap();
    drain(&mut rx_b);

    bed.engine.disconnect(conn_b).await;

    let (conn_a, _rx_a) = bed.connect().await;
    bed.engine
        .send_message(conn_a, chat, alice, "into the void".into(), None)
        .await
        .unwrap();

    assert!(rx_b.try_recv().is_err());

    let user = bed.db.get_user(&bob.to_string()).unwrap().unwrap();
    assert!(!user.online);
    assert!(user.last_seen_at.is_some());
}
