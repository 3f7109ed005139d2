//! WebSocket handler — one connection per client per document.
//!
//! DESIGN
//! ======
//! On upgrade the connection enters a `select!` loop:
//! - Incoming client events → parse + dispatch
//! - Messages queued by the document → forward to the socket verbatim
//! - Authentication deadline → close if the client never authenticated
//!
//! The handler holds no document content. Content events are translated
//! into `Operation`s and forwarded to the document task with the client's
//! identity; the document decides who hears about them.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → unauthenticated; only `authentication` and `echo` are read
//! 2. `authentication` → identity assigned, document joined, outbound
//!    queue attached (the document writes `initialize` into it first)
//! 3. Content events → forwarded to the document
//! 4. Close, socket error, or queue dropped by the document → disconnect

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use rand::Rng;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::message::{Authentication, BrickId, ClientInfo, ClientMessage, ErrorCode, ServerMessage};
use crate::services::document::{DocumentError, DocumentHandle, DocumentKey, Operation};
use crate::services::manager::ManagerError;
use crate::state::AppState;

const CONNECT_ATTEMPTS: usize = 5;
const CONNECT_RETRY_BASE_MS: u64 = 20;

/// Presence colors handed out at authentication.
const PALETTE: [&str; 10] = [
    "#e91e63", "#9c27b0", "#3f51b5", "#2196f3", "#009688", "#4caf50", "#ff9800", "#ff5722", "#795548", "#607d8b",
];

// =============================================================================
// CLIENT
// =============================================================================

/// Connection state for one websocket.
pub(crate) struct Client {
    key: DocumentKey,
    /// Set once authentication has joined the document.
    identity: Option<ClientInfo>,
    /// Brick of the stroke opened by the last `beginPath`.
    current_brick: Option<BrickId>,
    document: Option<DocumentHandle>,
    outbound: Option<mpsc::Receiver<ServerMessage>>,
}

impl Client {
    pub(crate) fn new(key: DocumentKey) -> Self {
        Self { key, identity: None, current_brick: None, document: None, outbound: None }
    }

    fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    fn unique_id(&self) -> Option<Uuid> {
        self.identity.as_ref().map(|i| i.user_unique_id)
    }
}

#[derive(Debug, thiserror::Error)]
enum JoinError {
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Document(#[from] DocumentError),
}

impl ErrorCode for JoinError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Manager(e) => e.error_code(),
            Self::Document(e) => e.error_code(),
        }
    }
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Path((project_id, document_id)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    let key = DocumentKey::new(project_id, document_id);
    ws.on_upgrade(move |socket| run_ws(socket, state, key))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, key: DocumentKey) {
    let mut client = Client::new(key);
    let auth_deadline = tokio::time::sleep(state.config.auth_timeout);
    tokio::pin!(auth_deadline);

    info!(document = %client.key, "ws: connection opened");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies = process_inbound_text(&state, &mut client, text.as_str()).await;
                        if send_all(&mut socket, &replies).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            outbound = recv_outbound(&mut client.outbound) => {
                let Some(message) = outbound else {
                    info!(document = %client.key, user_unique_id = ?client.unique_id(), "ws: document dropped client queue; closing");
                    break;
                };
                if send_message(&mut socket, &message).await.is_err() {
                    break;
                }
            }
            () = &mut auth_deadline, if !client.is_authenticated() => {
                info!(document = %client.key, "ws: authentication timed out; closing");
                break;
            }
        }
    }

    handle_disconnect(&mut client).await;
    info!(document = %client.key, user_unique_id = ?client.unique_id(), "ws: connection closed");
}

/// Next message from the document, or never while no queue is attached.
async fn recv_outbound(outbound: &mut Option<mpsc::Receiver<ServerMessage>>) -> Option<ServerMessage> {
    match outbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// DISPATCH
// =============================================================================

#[derive(Deserialize)]
struct EventName {
    event: String,
}

/// Parse and process one inbound text message and return messages for the
/// sender only.
pub(crate) async fn process_inbound_text(state: &AppState, client: &mut Client, text: &str) -> Vec<ServerMessage> {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            let event = serde_json::from_str::<EventName>(text)
                .map(|n| n.event)
                .unwrap_or_default();
            if client.is_authenticated() || event == "authentication" {
                warn!(document = %client.key, %event, error = %e, "ws: invalid inbound message");
            } else {
                debug!(document = %client.key, %event, error = %e, "ws: invalid message before authentication");
            }
            return Vec::new();
        }
    };

    match message {
        ClientMessage::Authentication(auth) => {
            handle_authentication(state, client, auth).await;
            Vec::new()
        }
        ClientMessage::Echo(echo) => vec![ServerMessage::Echo(echo)],
        other if !client.is_authenticated() => {
            debug!(document = %client.key, event = other.event(), "ws: ignoring event before authentication");
            Vec::new()
        }
        other => {
            forward_operation(client, other).await;
            Vec::new()
        }
    }
}

pub(crate) async fn handle_authentication(state: &AppState, client: &mut Client, auth: Authentication) {
    if let Some(identity) = &client.identity {
        warn!(document = %client.key, user_unique_id = %identity.user_unique_id, "ws: already authenticated; ignoring");
        return;
    }

    let info = ClientInfo { user_unique_id: Uuid::new_v4(), id: auth.user_id, name: auth.name, color: pick_color() };
    let (tx, rx) = mpsc::channel(state.config.client_queue_capacity);

    match join_document(state, &client.key, &info, &tx).await {
        Ok(document) => {
            info!(document = %client.key, user_unique_id = %info.user_unique_id, user_id = %info.id, "ws: client authenticated");
            client.identity = Some(info);
            client.document = Some(document);
            client.outbound = Some(rx);
        }
        Err(e) => {
            warn!(
                document = %client.key,
                user_id = %info.id,
                code = e.error_code(),
                error = %e,
                "ws: could not join document; client stays unauthenticated"
            );
        }
    }
}

/// Register with the document, retrying while it is closing or restarting.
async fn join_document(
    state: &AppState,
    key: &DocumentKey,
    info: &ClientInfo,
    tx: &mpsc::Sender<ServerMessage>,
) -> Result<DocumentHandle, JoinError> {
    let mut attempt = 1;
    loop {
        let document = state.documents.get_document(key).await?;
        match document.connect(info.clone(), tx.clone()).await {
            Ok(()) => return Ok(document),
            Err(e) if e.retryable() && attempt < CONNECT_ATTEMPTS => {
                debug!(document = %key, attempt, code = e.error_code(), "ws: document not accepting clients; retrying");
                tokio::time::sleep(Duration::from_millis(CONNECT_RETRY_BASE_MS * attempt as u64)).await;
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn forward_operation(client: &mut Client, message: ClientMessage) {
    let event = message.event();
    let Some(op) = to_operation(&mut client.current_brick, message) else {
        warn!(document = %client.key, user_unique_id = ?client.unique_id(), event, "ws: no open stroke for event; dropping");
        return;
    };
    let (Some(identity), Some(document)) = (&client.identity, &client.document) else {
        return;
    };

    if let Err(e) = document.apply(identity.author(), op).await {
        warn!(document = %client.key, user_unique_id = %identity.user_unique_id, event, error = %e, "ws: document unavailable");
    }
}

/// Translate a content event. `addPathPoint` and `endPath` address the
/// brick of the stroke opened by the last `beginPath`.
fn to_operation(current_brick: &mut Option<BrickId>, message: ClientMessage) -> Option<Operation> {
    let op = match message {
        ClientMessage::InsertBrick(m) => Operation::InsertBrick(m),
        ClientMessage::RemoveBrick(m) => Operation::RemoveBrick(m),
        ClientMessage::MoveBrick(m) => Operation::MoveBrick(m),
        ClientMessage::BeginPath(m) => {
            *current_brick = Some(m.brick_id);
            Operation::BeginPath(m)
        }
        ClientMessage::AddPathPoint(m) => Operation::AddPathPoints { brick_id: (*current_brick)?, points: m.points },
        ClientMessage::EndPath(m) => Operation::EndPath { brick_id: current_brick.take()?, spline: m.spline, id: m.id },
        ClientMessage::EraseSplines(m) => Operation::EraseSplines(m),
        ClientMessage::TextInsert(m) => Operation::TextInsert(m),
        ClientMessage::Pointer(m) => Operation::Pointer(m),
        ClientMessage::MagicPen(m) => Operation::MagicPen(m),
        ClientMessage::Authentication(_) | ClientMessage::Echo(_) => return None,
    };
    Some(op)
}

/// Leave the document. Safe to call more than once.
pub(crate) async fn handle_disconnect(client: &mut Client) {
    client.current_brick = None;
    client.outbound = None;
    let Some(document) = client.document.take() else {
        return;
    };
    if let Some(user_unique_id) = client.unique_id() {
        document.disconnect(user_unique_id).await;
    }
}

fn pick_color() -> String {
    let index = rand::rng().random_range(0..PALETTE.len());
    PALETTE[index].to_owned()
}

// =============================================================================
// OUTBOUND
// =============================================================================

async fn send_all(socket: &mut WebSocket, messages: &[ServerMessage]) -> Result<(), ()> {
    for message in messages {
        send_message(socket, message).await?;
    }
    Ok(())
}

async fn send_message(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), ()> {
    let json = match serde_json::to_string(message) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, event = message.event(), "ws: failed to serialize message");
            return Err(());
        }
    };
    debug!(event = message.event(), "ws: send message");
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
