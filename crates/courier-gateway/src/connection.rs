use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use courier_db::Store;
use courier_db::models::MessageRow;
use courier_types::events::{ClientCommand, MessageIdInput, ServerEvent};
use courier_types::models::{
    ChatMessage, ChatReaction, ChatUser, MessageKind, MessageStatus, ReactionEntry, is_reaction_emoji,
};

use crate::broker::BrokerBridge;
use crate::dispatcher::Target;
use crate::error::{ProtocolError, SessionError, TransportError};
use crate::registry::{ConnectionHandle, Payload};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

const EMPTY_HISTORY: &str = r#"{"type":"history","messages":[]}"#;

/// What every session needs from the process around it.
#[derive(Clone)]
pub struct SessionContext {
    pub store: Arc<dyn Store>,
    pub bridge: Arc<BrokerBridge>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Active = 1,
    Closed = 2,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::Active,
            _ => Self::Closed,
        }
    }
}

/// One connected user, independent of the socket carrying it.
pub struct Session {
    user: String,
    handle: ConnectionHandle,
    ctx: SessionContext,
    state: AtomicU8,
}

impl Session {
    /// Register `user` (evicting any earlier connection of theirs) and bind
    /// their routing key. The receiver yields everything addressed to this
    /// connection.
    pub async fn connect(
        ctx: SessionContext,
        user: impl Into<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Payload>) {
        let user = user.into();
        let (handle, rx) = ConnectionHandle::channel();

        if let Some(previous) = ctx.bridge.dispatcher().registry().register(&user, handle.clone()) {
            warn!("{} connected again, evicting connection {}", user, previous.conn_id());
            previous.evict();
        }
        ctx.bridge.bind_user(&user, handle.conn_id()).await;

        let session = Arc::new(Self {
            user,
            handle,
            ctx,
            state: AtomicU8::new(SessionState::Connecting as u8),
        });
        (session, rx)
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Load this user's history and move to `Active`. A store failure yields
    /// an empty history rather than refusing the connection.
    pub async fn history(&self) -> Payload {
        let store = self.ctx.store.clone();
        let viewer = self.user.clone();
        let rows = match tokio::task::spawn_blocking(move || store.list_messages_for_viewer(&viewer)).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                error!("Failed to load history for {}: {}", self.user, e);
                Vec::new()
            }
            Err(e) => {
                error!("History task for {} failed: {}", self.user, e);
                Vec::new()
            }
        };

        let _ = self.state.compare_exchange(
            SessionState::Connecting as u8,
            SessionState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        let event = ServerEvent::History {
            messages: rows.into_iter().map(chat_message).collect(),
        };
        encode(&event).unwrap_or_else(|e| {
            error!("Failed to encode history for {}: {}", self.user, e);
            Payload::from(EMPTY_HISTORY)
        })
    }

    /// Handle one inbound text frame.
    pub async fn handle_text(&self, text: &str) -> Result<(), SessionError> {
        let command: ClientCommand = serde_json::from_str(text).map_err(ProtocolError::from)?;

        match command {
            ClientCommand::Chat {
                sender,
                recipient,
                message,
            } => self.post(sender, recipient, message).await,
            ClientCommand::Reaction {
                message_id,
                emoji,
                user,
            } => self.react(message_id, emoji, user).await,
        }
    }

    async fn post(
        &self,
        sender: Option<String>,
        recipient: Option<String>,
        body: String,
    ) -> Result<(), SessionError> {
        if body.trim().is_empty() {
            return Err(ProtocolError::EmptyBody.into());
        }

        let sender = non_blank(sender).unwrap_or_else(|| self.user.clone());
        let recipient = non_blank(recipient);

        let store = self.ctx.store.clone();
        let (from, to) = (sender.clone(), recipient.clone());
        let row = tokio::task::spawn_blocking(move || store.insert_message(&from, to.as_deref(), &body)).await??;

        let message = chat_message(row);
        let id = message.id;
        let event = ServerEvent::Chat { id, message };
        let payload = encode(&event)?;

        let delivered = self
            .ctx
            .bridge
            .publish(&payload, Target::from_recipient(recipient.as_deref()))
            .await;

        // A direct message is shown to the sender as well
        if let Some(recipient) = recipient.as_deref() {
            if recipient != self.user && self.handle.send(payload.clone()) {
                debug!("Echoed direct message to sender {}", self.user);
            }
        }

        info!(
            "{} posted message {}{} ({} local deliveries)",
            sender,
            id,
            recipient.map(|r| format!(" to {r}")).unwrap_or_default(),
            delivered
        );
        Ok(())
    }

    async fn react(
        &self,
        raw_id: MessageIdInput,
        emoji: String,
        user: Option<String>,
    ) -> Result<(), SessionError> {
        let Some(message_id) = raw_id.coerce() else {
            let raw = match raw_id {
                MessageIdInput::Text(text) => text,
                MessageIdInput::Number(id) => id.to_string(),
            };
            return Err(ProtocolError::BadMessageId(raw).into());
        };

        if !is_reaction_emoji(&emoji) {
            return Err(ProtocolError::UnknownEmoji(emoji).into());
        }

        let user = non_blank(user).unwrap_or_else(|| self.user.clone());

        let store = self.ctx.store.clone();
        let reactor = user.clone();
        let (outcome, reactions) = tokio::task::spawn_blocking(move || {
            let outcome = store.toggle_reaction(message_id, &emoji, &reactor)?;
            let reactions = store.list_reactions(message_id)?;
            Ok::<_, courier_db::StoreError>((outcome, reactions))
        })
        .await??;

        debug!("{} reaction on message {}: {:?}", user, message_id, outcome);

        let event = ServerEvent::Reaction {
            message_id,
            reactions: reactions
                .into_iter()
                .map(|r| ReactionEntry {
                    emoji: r.emoji,
                    user: r.user,
                })
                .collect(),
        };
        let payload = encode(&event)?;
        self.ctx.bridge.publish(&payload, Target::Everyone).await;
        Ok(())
    }

    /// Unregister and, unless a newer connection took over, unbind. Safe to
    /// call more than once.
    pub async fn close(&self) {
        let previous = self.state.swap(SessionState::Closed as u8, Ordering::AcqRel);
        if SessionState::from_u8(previous) == SessionState::Closed {
            return;
        }

        let conn_id = self.handle.conn_id();
        self.ctx.bridge.dispatcher().registry().unregister(&self.user, conn_id);
        self.ctx.bridge.unbind_user(&self.user, conn_id).await;
    }
}

/// Drive one WebSocket connection from handshake to close.
pub async fn handle_connection(socket: WebSocket, ctx: SessionContext, username: String) {
    let (mut sender, mut receiver) = socket.split();
    let (session, mut outbound) = Session::connect(ctx, username).await;
    let user = session.user().to_string();

    info!("{} connected ({})", user, session.handle().conn_id());

    // History goes out before anything queued for this connection
    let history = session.history().await;
    if let Err(e) = send_text(&mut sender, &history).await {
        warn!("{}: {}", user, e);
        session.close().await;
        return;
    }

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    let handle = session.handle().clone();
    let user_send = user.clone();
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                _ = handle.evicted() => {
                    info!("{} replaced by a newer connection, closing", user_send);
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
                payload = outbound.recv() => {
                    let Some(payload) = payload else { break };
                    if let Err(e) = send_text(&mut sender, &payload).await {
                        debug!("{}: {}", user_send, e);
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout for {} (missed {} pongs), dropping connection", user_send, missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_session = session.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            let result = match msg {
                Message::Text(text) => recv_session.handle_text(&text).await,
                Message::Binary(data) => match std::str::from_utf8(&data) {
                    Ok(text) => recv_session.handle_text(text).await,
                    Err(e) => Err(ProtocolError::from(e).into()),
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                    Ok(())
                }
                Message::Close(_) => break,
                Message::Ping(_) => Ok(()),
            };

            if let Err(e) = result {
                report(recv_session.user(), &e);
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    session.close().await;
    info!("{} disconnected", user);
}

async fn send_text(
    sender: &mut SplitSink<WebSocket, Message>,
    payload: &Payload,
) -> Result<(), TransportError> {
    sender
        .send(Message::Text(payload.as_ref().into()))
        .await
        .map_err(|e| TransportError(e.to_string()))
}

/// A failed command costs only that command; the connection stays open.
fn report(user: &str, err: &SessionError) {
    match err {
        SessionError::Protocol(e) => warn!("Ignoring command from {}: {}", user, e),
        SessionError::Store(e) => error!("Store failure handling command from {}: {}", user, e),
        other => error!("Command from {} failed: {}", user, other),
    }
}

fn encode(event: &ServerEvent) -> Result<Payload, SessionError> {
    serde_json::to_string(event)
        .map(Payload::from)
        .map_err(SessionError::Encode)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn chat_message(row: MessageRow) -> ChatMessage {
    ChatMessage {
        id: row.id,
        from: ChatUser::new(row.sender),
        recipient: row.receiver.map(ChatUser::new),
        date: row.timestamp,
        message: row.message,
        status: MessageStatus::Delivered,
        kind: MessageKind::Text,
        reactions: row
            .reactions
            .into_iter()
            .map(|r| ChatReaction {
                emoji: r.emoji,
                from: ChatUser::new(r.user),
            })
            .collect(),
    }
}
