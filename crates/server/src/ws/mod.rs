// Live stream feed over WebSocket (scrolllive-feed.v1).
//
// One socket per viewer per stream. The server pushes session updates and chat
// as they happen; the client sends heartbeats to keep its presence lease and
// may post chat. Closing the socket does not change presence: a participant
// goes offline when their lease lapses or they leave explicitly.

use std::{collections::HashSet, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension, Path, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use scrolllive_common::{
    protocol::ws::{WsMessage, CURRENT_PROTOCOL_VERSION},
    types::SessionUpdate,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    auth::middleware::AuthenticatedUser,
    error::{
        current_request_id, request_id_from_headers_or_generate, with_request_id_scope, ErrorCode,
        ServiceError,
    },
    feed::{gap_elapsed, SessionSequencer, StreamEvent},
    hub::StreamHub,
    metrics,
    validation::{check_ws_frame_size, parse_stream_id, MAX_WS_FRAME_BYTES},
};

const PING_INTERVAL: Duration = Duration::from_secs(15);
/// Silence allowed before the socket is considered dead.
const IDLE_TIMEOUT: Duration = Duration::from_secs(45);

pub async fn stream_feed(
    State(hub): State<StreamHub>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(stream_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let stream_id = match parse_stream_id(&stream_id) {
        Ok(stream_id) => stream_id,
        Err(error) => return error.into_response(),
    };
    if let Err(error) = hub.get_stream(stream_id).await {
        return error.into_response();
    }

    let request_id =
        current_request_id().unwrap_or_else(|| request_id_from_headers_or_generate(&headers));
    ws.max_frame_size(MAX_WS_FRAME_BYTES).on_upgrade(move |socket| async move {
        with_request_id_scope(request_id, handle_socket(hub, user, stream_id, socket)).await;
    })
}

async fn handle_socket(
    hub: StreamHub,
    user: AuthenticatedUser,
    stream_id: Uuid,
    mut socket: WebSocket,
) {
    metrics::adjust_ws_connections(1);
    info!(stream_id = %stream_id, user_id = %user.user_id, "feed socket connected");

    // Subscribe before reading snapshots so nothing written in between is lost.
    let (mut events, _disposer) = hub.feed().subscribe(stream_id).into_parts();

    let snapshot = match initial_frames(&hub, stream_id).await {
        Ok(snapshot) => snapshot,
        Err(error) => {
            let _ = send_ws_message(&mut socket, &error_frame(&error)).await;
            let _ = socket.send(Message::Close(None)).await;
            metrics::adjust_ws_connections(-1);
            return;
        }
    };
    let mut sequencer = SessionSequencer::new(snapshot.version);
    let delivered_chat = snapshot.chat_ids;

    let mut send_failed = false;
    for frame in snapshot.frames {
        if send_ws_message(&mut socket, &frame).await.is_err() {
            send_failed = true;
            break;
        }
    }

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.reset();
    let mut last_heard = Instant::now();

    while !send_failed {
        tokio::select! {
            _ = ping_interval.tick() => {
                if last_heard.elapsed() > IDLE_TIMEOUT {
                    warn!(
                        stream_id = %stream_id,
                        user_id = %user.user_id,
                        "feed socket idle, disconnecting"
                    );
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            maybe_event = events.recv() => {
                let Some(event) = maybe_event else {
                    break;
                };
                let outbound: Vec<WsMessage> = match event {
                    StreamEvent::Session(update) => sequencer
                        .push(update, Instant::now())
                        .into_iter()
                        .map(WsMessage::from)
                        .collect(),
                    StreamEvent::Chat(message) => {
                        if delivered_chat.contains(&message.id) {
                            continue;
                        }
                        vec![WsMessage::ChatMessage { message }]
                    }
                };
                if send_all(&mut socket, &outbound).await.is_err() {
                    break;
                }
            }
            _ = gap_elapsed(sequencer.gap_deadline()) => {
                let outbound: Vec<WsMessage> = sequencer
                    .flush_gap(Instant::now())
                    .into_iter()
                    .map(WsMessage::from)
                    .collect();
                if send_all(&mut socket, &outbound).await.is_err() {
                    break;
                }
            }
            maybe_message = socket.recv() => {
                let Some(Ok(message)) = maybe_message else {
                    break;
                };
                last_heard = Instant::now();

                let reply = match message {
                    Message::Text(raw) => {
                        handle_text_frame(&hub, &user, stream_id, raw.as_str()).await
                    }
                    Message::Binary(_) => {
                        metrics::record_ws_frame("binary", true);
                        Some(invalid_frame("binary frames are not supported"))
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => None,
                };
                if let Some(reply) = reply {
                    if send_ws_message(&mut socket, &reply).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    metrics::adjust_ws_connections(-1);
    info!(stream_id = %stream_id, user_id = %user.user_id, "feed socket disconnected");
}

struct Snapshot {
    frames: Vec<WsMessage>,
    version: Option<i64>,
    chat_ids: HashSet<Uuid>,
}

async fn initial_frames(hub: &StreamHub, stream_id: Uuid) -> Result<Snapshot, ServiceError> {
    let session = hub.store.get_stream(stream_id).await?;
    let messages = hub.chat_history(stream_id).await?;

    let version = session.as_ref().map(|session| session.version);
    let chat_ids = messages.iter().map(|message| message.id).collect();
    let frames = vec![
        WsMessage::HelloAck {
            protocol_version: CURRENT_PROTOCOL_VERSION.to_string(),
            stream_id,
            server_time: Utc::now().to_rfc3339(),
            lease_ttl_secs: hub.settings().lease_ttl.as_secs(),
        },
        WsMessage::from(SessionUpdate::from_session(session)),
        WsMessage::ChatHistory { messages },
    ];

    Ok(Snapshot { frames, version, chat_ids })
}

/// Returns the direct reply to a client frame, if any. Chat posted here
/// reaches every socket, this one included, through the feed.
async fn handle_text_frame(
    hub: &StreamHub,
    user: &AuthenticatedUser,
    stream_id: Uuid,
    raw: &str,
) -> Option<WsMessage> {
    if let Err(message) = check_ws_frame_size(raw) {
        metrics::record_ws_frame("oversized", true);
        return Some(WsMessage::Error {
            code: ErrorCode::PayloadTooLarge.as_str().to_string(),
            message,
            retryable: false,
        });
    }

    let inbound = match serde_json::from_str::<WsMessage>(raw) {
        Ok(message) => message,
        Err(_) => {
            metrics::record_ws_frame("invalid", true);
            return Some(invalid_frame("invalid websocket frame payload"));
        }
    };

    match inbound {
        WsMessage::Heartbeat => {
            let result = hub.heartbeat(stream_id, &user.user_id).await;
            metrics::record_ws_frame("heartbeat", result.is_err());
            Some(match result {
                Ok(lease_expires_at) => WsMessage::HeartbeatAck { lease_expires_at },
                Err(error) => error_frame(&error),
            })
        }
        WsMessage::SendChat { message } => {
            let result = hub.send_chat(stream_id, user, &message).await;
            metrics::record_ws_frame("send_chat", result.is_err());
            match result {
                Ok(stored) => {
                    debug!(stream_id = %stream_id, message_id = %stored.id, "chat posted over feed socket");
                    None
                }
                Err(error) => Some(error_frame(&error)),
            }
        }
        _ => {
            metrics::record_ws_frame("unsupported", true);
            Some(invalid_frame("message type is not accepted from clients"))
        }
    }
}

fn error_frame(error: &ServiceError) -> WsMessage {
    error.log();
    let code = error.code();
    WsMessage::Error {
        code: code.as_str().to_string(),
        message: error.public_message(),
        retryable: code.retryable(),
    }
}

fn invalid_frame(message: &str) -> WsMessage {
    WsMessage::Error {
        code: ErrorCode::InvalidArgument.as_str().to_string(),
        message: message.to_string(),
        retryable: false,
    }
}

async fn send_all(socket: &mut WebSocket, messages: &[WsMessage]) -> Result<(), ()> {
    for message in messages {
        send_ws_message(socket, message).await?;
    }
    Ok(())
}

async fn send_ws_message(socket: &mut WebSocket, message: &WsMessage) -> Result<(), ()> {
    let encoded = serde_json::to_string(message).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}
