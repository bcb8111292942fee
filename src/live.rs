//! Live feed WebSocket handler.
//!
//! JSON text frames. The client's first frame must authenticate:
//!
//! - Client sends: `{"type":"auth","token":"…","since":41}` (`since` optional)
//! - Server sends: a `snapshot` (or the events missed since `since`),
//!   then every event the session is allowed to see, tagged by `type`.
//!
//! A socket that does not authenticate within `auth_timeout_secs` gets a
//! `logged_out` frame and is closed.

use crate::auth::{self, Session, SharedState};
use crate::models::{List, Recipe, StagingItem, Task};
use crate::scope;
use crate::world::{Event, TaskQuery, World};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Auth {
        token: String,
        #[serde(default)]
        since: Option<u64>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame<'a> {
    Snapshot {
        revision: u64,
        tasks: Vec<Task>,
        lists: Vec<List>,
        recipes: Vec<Recipe>,
        staging: Vec<StagingItem>,
    },
    LoggedOut {
        reason: &'a str,
    },
}

impl ServerFrame<'_> {
    fn snapshot(world: &World, session: &Session) -> Self {
        ServerFrame::Snapshot {
            revision: world.revision,
            tasks: world.query_tasks(session.user_id, &TaskQuery::default()),
            lists: world.lists_for(session.user_id),
            recipes: world.recipes_for(session.user_id),
            staging: world.staging_items_for(session.user_id),
        }
    }
}

// ── WS upgrade handler ────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

// ── Socket lifecycle ───────────────────────────────────────────

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (ws_tx, ws_rx) = socket.split();
    serve_feed(ws_tx, ws_rx, state).await;
}

/// Drive one live feed over any message sink and stream.
async fn serve_feed<S, R>(mut ws_tx: S, mut ws_rx: R, state: SharedState)
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Send,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin + Send + 'static,
{
    // Step 1: Wait (bounded) for the auth frame.
    let timeout = Duration::from_secs(state.settings.auth_timeout_secs);
    let first = tokio::time::timeout(timeout, ws_rx.next()).await;
    let (session, since) = match first {
        Ok(Some(Ok(Message::Text(text)))) => match authenticate(&state, &text) {
            Ok(found) => found,
            Err(reason) => {
                log_out(&mut ws_tx, reason).await;
                return;
            }
        },
        Ok(_) => return, // closed before authenticating
        Err(_) => {
            debug!("live socket did not authenticate in time");
            log_out(&mut ws_tx, "auth timeout").await;
            return;
        }
    };
    info!(user_id = %session.user_id, "live feed connected");

    // Step 2: Subscribe to broadcast BEFORE reading the world.
    // This ensures we don't miss events between catch-up and subscription.
    let mut broadcast_rx = state.store.subscribe();

    // Step 3: Catch up from `since` when the log still covers it, else snapshot.
    let catch_up = state.store.read(|world| catch_up_frames(world, &session, since));
    for frame in catch_up {
        if ws_tx.send(Message::Text(frame)).await.is_err() {
            return; // client already gone
        }
    }

    // Step 4: Spawn broadcast forwarder (sends visible events to this client).
    let mut send_task = tokio::spawn({
        let state = state.clone();
        let session = session.clone();
        async move {
            loop {
                let frames = match broadcast_rx.recv().await {
                    Ok(event) => state.store.read(|w| event_frames(w, &session, &event)),
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, user_id = %session.user_id, "live feed lagged, resending snapshot");
                        state.store.read(|w| snapshot_frame(w, &session)).into_iter().collect()
                    }
                    Err(RecvError::Closed) => break,
                };
                for frame in frames {
                    if ws_tx.send(Message::Text(frame)).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    // Step 5: Drain the client side. Commands go through the REST API.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    // Wait for either side to finish.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    info!(user_id = %session.user_id, "live feed disconnected");
}

fn authenticate(state: &SharedState, text: &str) -> Result<(Session, Option<u64>), &'static str> {
    let ClientFrame::Auth { token, since } = serde_json::from_str(text).map_err(|_| "expected auth frame")?;
    let session = auth::session_from_token(state, &token).map_err(|_| "invalid token")?;
    Ok((session, since))
}

async fn log_out<S>(ws_tx: &mut S, reason: &str)
where
    S: Sink<Message> + Unpin,
{
    if let Ok(frame) = serde_json::to_string(&ServerFrame::LoggedOut { reason }) {
        let _ = ws_tx.send(Message::Text(frame)).await;
    }
    let _ = ws_tx.close().await;
}

fn snapshot_frame(world: &World, session: &Session) -> Option<String> {
    serde_json::to_string(&ServerFrame::snapshot(world, session)).ok()
}

/// List edits, joins and deletions change which tasks a member can see.
fn changes_membership(event: &Event) -> bool {
    matches!(event, Event::ListUpdated { .. } | Event::ListDeleted { .. })
}

/// What one broadcast event becomes on this session's socket. List changes
/// are followed by a fresh snapshot.
fn event_frames(world: &World, session: &Session, event: &Event) -> Vec<String> {
    if !scope::can_see_event(world, session.user_id, event) {
        return Vec::new();
    }
    let mut frames: Vec<String> = serde_json::to_string(event).into_iter().collect();
    if changes_membership(event) {
        frames.extend(snapshot_frame(world, session));
    }
    frames
}

/// Frames that bring a (re)connecting client up to date. Replay is only
/// used when no missed event changed list membership.
fn catch_up_frames(world: &World, session: &Session, since: Option<u64>) -> Vec<String> {
    if let Some(events) = since.and_then(|rev| world.events_since(rev)) {
        let visible: Vec<&Event> = events
            .iter()
            .map(|(_, event)| event)
            .filter(|event| scope::can_see_event(world, session.user_id, event))
            .collect();
        if !visible.iter().any(|event| changes_membership(event)) {
            return visible
                .into_iter()
                .filter_map(|event| serde_json::to_string(event).ok())
                .collect();
        }
    }
    snapshot_frame(world, session).into_iter().collect()
}
