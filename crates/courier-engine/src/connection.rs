use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use courier_types::events::{ClientCommand, ServerEvent};

use crate::engine::Engine;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a single WebSocket connection: register its delivery channel,
/// pump events out and commands in, and tear all memberships down on exit.
pub async fn handle_connection(socket: WebSocket, engine: Engine) {
    let conn_id = Uuid::new_v4();
    let (tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
    engine.registry().register(conn_id, tx).await;

    info!("connection {} established", conn_id);

    let (mut sender, mut receiver) = socket.split();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward engine events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = event_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let recv_engine = engine.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                WsMessage::Text(text) => {
                    match serde_json::from_str::<ClientCommand>(&text) {
                        Ok(cmd) => handle_command(&recv_engine, conn_id, cmd).await,
                        Err(e) => {
                            warn!(
                                "connection {} bad command: {} -- raw: {}",
                                conn_id,
                                e,
                                &text[..text.len().min(200)]
                            );
                            recv_engine
                                .router()
                                .unicast(
                                    conn_id,
                                    ServerEvent::Error {
                                        message: "malformed command".into(),
                                    },
                                )
                                .await;
                        }
                    }
                }
                WsMessage::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    engine.disconnect(conn_id).await;
    info!("connection {} closed", conn_id);
}

/// Single dispatch point for the command surface. A failed command reaches
/// only the originating connection, as a unicast error event.
async fn handle_command(engine: &Engine, conn_id: Uuid, cmd: ClientCommand) {
    let result = match cmd {
        ClientCommand::JoinUser { user_id } => engine.join_user(conn_id, user_id).await,

        ClientCommand::JoinChat { chat_id } => engine.join_chat(conn_id, chat_id).await,

        ClientCommand::StartChat {
            user_id,
            other_user_id,
        } => engine.start_chat(conn_id, user_id, other_user_id).await,

        ClientCommand::LoadHistory { chat_id } => engine.load_history(conn_id, chat_id).await,

        ClientCommand::SendMessage {
            chat_id,
            sender_id,
            text,
            reply_to,
        } => {
            engine
                .send_message(conn_id, chat_id, sender_id, text, reply_to)
                .await
        }

        ClientCommand::EditMessage {
            message_id,
            user_id,
            new_text,
        } => engine.edit_message(message_id, user_id, new_text).await,

        ClientCommand::DeleteMessage {
            message_id,
            user_id,
        } => engine.delete_message(message_id, user_id).await,

        ClientCommand::ReactMessage {
            message_id,
            user_id,
            emoji,
        } => engine.react_message(message_id, user_id, emoji).await,

        ClientCommand::PinMessage {
            message_id,
            user_id,
            chat_id,
        } => engine.pin_message(message_id, user_id, chat_id).await,

        ClientCommand::MarkChatRead { chat_id, user_id } => {
            engine.mark_chat_read(chat_id, user_id).await
        }
    };

    if let Err(e) = result {
        warn!("connection {} command failed: {}", conn_id, e);
        engine
            .router()
            .unicast(
                conn_id,
                ServerEvent::Error {
                    message: e.to_string(),
                },
            )
            .await;
    }
}
