//! The duplex client channel: one websocket per attached session.
//!
//! Attach flow: validate the query parameters, look up or create the
//! session, point its event sink at this connection, index the mixer if
//! this process has not yet done so for the session, then pump events out
//! and frames in until the client goes away. Inbound frames with unknown
//! shapes are ignored so future client kinds stay compatible.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use mixchat::ChatContent;

use crate::config::Config;
use crate::events::{ClientEvent, InboundFrame};
use crate::sessions::{Session, SessionManager};

/// Close codes for rejected attaches.
const CLOSE_NO_SESSION: u16 = 4000;
const CLOSE_NO_PROJECT: u16 = 4001;

/// Inbound message that asks the agent to discuss the recent knob moves.
const PARAM_CHANGES_COMMAND: &str = "get-param-changes";

pub struct App {
    pub config: Config,
    pub sessions: SessionManager,
}

pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/ws", get(ws_handler))
        .with_state(app)
}

async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "soundcheck",
        "version": env!("CARGO_PKG_VERSION"),
        "links": { "ws": "/ws" },
    }))
}

#[derive(Debug, Deserialize)]
struct AttachParams {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    project: Option<String>,
}

async fn ws_handler(
    State(app): State<Arc<App>>,
    Query(params): Query<AttachParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, app, params))
}

async fn handle_session(mut socket: WebSocket, app: Arc<App>, params: AttachParams) {
    let Some(session_id) = params.session_id.filter(|s| !s.is_empty()) else {
        reject(&mut socket, CLOSE_NO_SESSION, "session_id is required").await;
        return;
    };
    let Some(project) = params.project.filter(|p| !p.is_empty()) else {
        reject(&mut socket, CLOSE_NO_PROJECT, "no project selected").await;
        return;
    };

    let session = app.sessions.get_or_create(&session_id, &project).await;
    info!(session_id = %session.id, project = %session.project, "client attached");

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ClientEvent>();
    session.attach(events_tx);

    let (mut sender, mut receiver) = socket.split();
    let pump = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "unserializable event");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // First attach in this process indexes the mixer; a reconnect gets the
    // completed status immediately.
    if session.mirror.is_indexed() {
        session.send_event(ClientEvent::indexing_done());
    } else {
        session.run_indexing().await;
    }

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) => handle_inbound(&session, &text),
            Message::Close(_) => break,
            _ => {}
        }
    }

    info!(session_id = %session.id, "client detached");
    session.detach();
    pump.await.ok();
}

fn handle_inbound(session: &Arc<Session>, text: &str) {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            // Client errors are logged, never answered.
            warn!(session_id = %session.id, error = %e, "malformed inbound frame");
            return;
        }
    };

    if let Some(decisions) = frame.approvals {
        if !session.resolve_approvals(decisions) {
            warn!(session_id = %session.id, "approvals did not match a pending request");
        }
        return;
    }

    match frame.message {
        Some(message) if message == PARAM_CHANGES_COMMAND => {
            let changes = session.recent_changes_json();
            session.spawn_turn(ChatContent::Text(changes));
        }
        Some(message) => session.spawn_turn(ChatContent::Text(message)),
        None => debug!(session_id = %session.id, "ignoring frame with no known field"),
    }
}

async fn reject(socket: &mut WebSocket, code: u16, reason: &'static str) {
    warn!(code, reason, "rejecting attach");
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}
