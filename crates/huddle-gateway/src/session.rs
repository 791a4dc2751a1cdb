use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use huddle_types::events::{ClientFrame, ServerEvent};
use huddle_types::models::Principal;

use crate::hub::{ConnId, Hub, Payload};

/// Keepalive probe interval when nothing else is being written.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(54);

/// Replies queued by the inbound loop (only `pong` today).
const REPLY_QUEUE_CAPACITY: usize = 16;

/// Close code for a credential that could not be resolved.
const CLOSE_UNAUTHORIZED: u16 = 4001;

/// Resolves the credential a client presents when it connects.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, credential: &str) -> anyhow::Result<Principal>;
}

/// Answers "may this user read this topic?".
pub trait TopicAccess: Send + Sync {
    fn can_read_topic(&self, user_id: Uuid, topic_id: Uuid) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub heartbeat_interval: Duration,
    /// Consecutive probes without any inbound traffic before giving up.
    pub max_missed_heartbeats: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_missed_heartbeats: 2,
        }
    }
}

/// Everything a session needs from the rest of the server.
#[derive(Clone)]
pub struct SessionContext {
    pub hub: Hub,
    pub authenticator: Arc<dyn Authenticator>,
    pub access: Arc<dyn TopicAccess>,
    pub config: SessionConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authorized,
    Subscribed,
    Closing,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Missing or invalid credential
    Unauthorized,
    /// Authenticated, but not allowed to read the topic
    Forbidden,
    /// The access oracle itself failed
    AccessCheckFailed,
    /// Evicted by the hub for not draining its queue
    SlowConsumer,
    /// No inbound traffic across the allowed number of probes
    KeepaliveTimeout,
    ClientClosed,
    TransportError,
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            Self::Unauthorized => CLOSE_UNAUTHORIZED,
            Self::Forbidden | Self::SlowConsumer => close_code::POLICY,
            Self::AccessCheckFailed => close_code::ERROR,
            Self::KeepaliveTimeout => close_code::AWAY,
            Self::ClientClosed => close_code::NORMAL,
            Self::TransportError => close_code::ABNORMAL,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::AccessCheckFailed => "access check failed",
            Self::SlowConsumer => "slow consumer",
            Self::KeepaliveTimeout => "keepalive timeout",
            Self::ClientClosed => "client closed",
            Self::TransportError => "transport error",
        }
    }

    /// The frame to send the client, if the transport is still usable.
    fn close_frame(&self) -> Option<Message> {
        match self {
            Self::ClientClosed | Self::TransportError => None,
            _ => Some(Message::Close(Some(CloseFrame {
                code: self.code(),
                reason: Utf8Bytes::from_static(self.reason()),
            }))),
        }
    }
}

/// Lifecycle bookkeeping for one connection.
struct Session {
    topic_id: Uuid,
    state: SessionState,
}

impl Session {
    fn transition(&mut self, next: SessionState) {
        debug!("Session on topic {}: {:?} -> {:?}", self.topic_id, self.state, next);
        self.state = next;
    }

    /// Refuse the connection before it ever subscribes.
    async fn reject<S>(&mut self, sink: &mut S, reason: CloseReason) -> CloseReason
    where
        S: Sink<Message> + Unpin,
    {
        if let Some(frame) = reason.close_frame() {
            let _ = sink.send(frame).await;
        }
        let _ = sink.close().await;
        self.transition(SessionState::Closed);
        reason
    }
}

/// Drive a live subscription over an upgraded WebSocket.
pub async fn handle_socket(
    socket: WebSocket,
    ctx: SessionContext,
    topic_id: Uuid,
    credential: Option<String>,
) -> CloseReason {
    let (sender, receiver) = socket.split();
    run_session(sender, receiver, ctx, topic_id, credential).await
}

/// Run one connection through `Connecting → Authorized → Subscribed →
/// Closing → Closed`.
///
/// Only the outbound loop writes to `sink` once subscribed. The inbound loop
/// and the hub both reach the client through queues that loop drains.
pub async fn run_session<S, R, E>(
    mut sink: S,
    stream: R,
    ctx: SessionContext,
    topic_id: Uuid,
    credential: Option<String>,
) -> CloseReason
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let mut session = Session {
        topic_id,
        state: SessionState::Connecting,
    };

    // Step 1: resolve the principal
    let principal = match credential.as_deref().map(|c| ctx.authenticator.authenticate(c)) {
        Some(Ok(principal)) => principal,
        Some(Err(e)) => {
            warn!("Live subscription to topic {} rejected: {}", topic_id, e);
            return session.reject(&mut sink, CloseReason::Unauthorized).await;
        }
        None => {
            warn!("Live subscription to topic {} presented no credential", topic_id);
            return session.reject(&mut sink, CloseReason::Unauthorized).await;
        }
    };
    session.transition(SessionState::Authorized);

    // Step 2: topic policy, checked off the async runtime
    let access = ctx.access.clone();
    let user_id = principal.user_id;
    let decision = tokio::task::spawn_blocking(move || access.can_read_topic(user_id, topic_id))
        .await
        .map_err(anyhow::Error::from)
        .and_then(|result| result);

    match decision {
        Ok(true) => {}
        Ok(false) => {
            info!("{} ({}) denied access to topic {}", principal.name, user_id, topic_id);
            return session.reject(&mut sink, CloseReason::Forbidden).await;
        }
        Err(e) => {
            warn!("Access check for {} on topic {} failed: {}", user_id, topic_id, e);
            return session.reject(&mut sink, CloseReason::AccessCheckFailed).await;
        }
    }

    // Step 3: subscribe and run both loops
    let subscription = ctx.hub.register(topic_id, user_id);
    let conn_id = subscription.conn_id;
    session.transition(SessionState::Subscribed);
    info!("{} ({}) subscribed to topic {} as {}", principal.name, user_id, topic_id, conn_id);

    let (reply_tx, reply_rx) = mpsc::channel(REPLY_QUEUE_CAPACITY);
    let alive = Arc::new(AtomicBool::new(true));

    let mut send_task = tokio::spawn(outbound_loop(
        sink,
        subscription.receiver,
        reply_rx,
        alive.clone(),
        ctx.config,
    ));
    let mut recv_task = tokio::spawn(inbound_loop(
        stream,
        ctx.hub.clone(),
        principal.clone(),
        topic_id,
        conn_id,
        reply_tx,
        alive,
    ));

    // Wait for either loop to finish
    let reason = tokio::select! {
        result = &mut send_task => {
            recv_task.abort();
            result.unwrap_or(CloseReason::TransportError)
        }
        result = &mut recv_task => {
            send_task.abort();
            result.unwrap_or(CloseReason::TransportError)
        }
    };

    // Step 4: tear down. Safe even if the hub already evicted us.
    session.transition(SessionState::Closing);
    ctx.hub.deregister(topic_id, conn_id);
    session.transition(SessionState::Closed);

    info!(
        "{} ({}) left topic {}: {}",
        principal.name,
        user_id,
        topic_id,
        reason.reason()
    );
    reason
}

/// Sole writer to the transport once subscribed.
async fn outbound_loop<S>(
    mut sink: S,
    mut deliveries: mpsc::Receiver<Payload>,
    mut replies: mpsc::Receiver<Payload>,
    alive: Arc<AtomicBool>,
    config: SessionConfig,
) -> CloseReason
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;
    let mut missed_heartbeats: u8 = 0;

    let reason = loop {
        tokio::select! {
            delivery = deliveries.recv() => {
                let Some(payload) = delivery else {
                    // The hub dropped our queue while we were still running
                    warn!("Delivery queue closed by hub, disconnecting slow consumer");
                    break CloseReason::SlowConsumer;
                };
                if let Err(e) = sink.send(Message::Text(payload)).await {
                    debug!("Write failed: {}", e);
                    return CloseReason::TransportError;
                }
                heartbeat.reset();
            }
            Some(reply) = replies.recv() => {
                if let Err(e) = sink.send(Message::Text(reply)).await {
                    debug!("Write failed: {}", e);
                    return CloseReason::TransportError;
                }
                heartbeat.reset();
            }
            _ = heartbeat.tick() => {
                if alive.swap(false, Ordering::AcqRel) {
                    missed_heartbeats = 0;
                } else {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= config.max_missed_heartbeats {
                        warn!("Heartbeat timeout (missed {} probes), dropping connection", missed_heartbeats);
                        break CloseReason::KeepaliveTimeout;
                    }
                }
                if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                    debug!("Keepalive probe failed: {}", e);
                    return CloseReason::TransportError;
                }
            }
        }
    };

    if let Some(frame) = reason.close_frame() {
        let _ = sink.send(frame).await;
    }
    let _ = sink.close().await;
    reason
}

/// Decodes client control frames. Never writes to the transport.
async fn inbound_loop<R, E>(
    mut stream: R,
    hub: Hub,
    principal: Principal,
    topic_id: Uuid,
    conn_id: ConnId,
    replies: mpsc::Sender<Payload>,
    alive: Arc<AtomicBool>,
) -> CloseReason
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let pong = match serde_json::to_string(&ServerEvent::Pong) {
        Ok(json) => Payload::from(json),
        Err(e) => {
            warn!("Failed to serialize pong: {}", e);
            return CloseReason::TransportError;
        }
    };

    while let Some(frame) = stream.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                debug!("{} ({}) read failed: {}", principal.name, principal.user_id, e);
                return CloseReason::TransportError;
            }
        };

        // Any inbound traffic counts as proof of life
        alive.store(true, Ordering::Release);

        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                Ok(ClientFrame::Typing { is_typing }) => {
                    hub.broadcast_except(
                        topic_id,
                        &ServerEvent::Typing {
                            user_id: principal.user_id,
                            name: principal.name.clone(),
                            is_typing,
                        },
                        conn_id,
                    );
                }
                Ok(ClientFrame::Ping) => {
                    if replies.try_send(pong.clone()).is_err() {
                        debug!("{} ({}) pong dropped, reply queue full", principal.name, principal.user_id);
                    }
                }
                Err(e) => {
                    let preview: String = text.as_str().chars().take(200).collect();
                    warn!(
                        "{} ({}) bad frame: {} -- raw: {}",
                        principal.name, principal.user_id, e, preview
                    );
                }
            },
            Message::Close(_) => return CloseReason::ClientClosed,
            _ => {}
        }
    }

    CloseReason::ClientClosed
}
