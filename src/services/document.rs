//! Document service — authoritative live state of one document.
//!
//! DESIGN
//! ======
//! A `Document` owns the brick layout, the bricks and the connected
//! clients' outbound queues. Its mutating methods are synchronous: they
//! validate, mutate, and return an `Outcome` describing who should hear
//! about it. They never send anything themselves.
//!
//! Each live document runs as one tokio task that owns the `Document` and
//! drains a bounded command queue, so operations apply strictly one at a
//! time in arrival order. `DocumentHandle` is the cloneable sender side.
//! The task applies an operation, then fans the resulting message out to
//! every recipient queue before taking the next command.
//!
//! LIFECYCLE
//! =========
//! 1. Connect → snapshot + roster queued to the newcomer, then it is
//!    registered and peers get `clientConnect`
//! 2. Operations → apply → broadcast
//! 3. Disconnect → open strokes discarded, peers get `clientDisconnect`
//! 4. Seal → `Closing`, snapshot handed to the manager for saving
//! 5. Shutdown → task exits, remaining client queues are dropped
//!
//! ERROR HANDLING
//! ==============
//! Every operation error is logged and the operation dropped. Nothing is
//! mutated before validation passes, so a failed operation leaves no trace.
//! A recipient whose queue stays full past the broadcast timeout is
//! disconnected rather than allowed to stall the document.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::message::{
    Author, BeginPath, BrickId, ClientInfo, DocumentSnapshot, EraseSplines, ErrorCode, InsertBrick, InsertedBrick,
    MagicPen, MagicPenStroke, MoveBrick, MovedBrick, PathBegun, PathEnded, PathPointsAdded, Point, Pointer,
    PointerMoved, RemoveBrick, RemovedBrick, Roster, ServerMessage, SplinesErased, TextInsert, TextInserted,
};
use crate::services::brick::{Brick, BrickError};
use crate::services::presence::PresenceRegistry;

const DEFAULT_DOCUMENT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_BROADCAST_TIMEOUT_MS: u64 = 2000;

// =============================================================================
// TYPES
// =============================================================================

/// Identifies one document across the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentKey {
    pub project_id: String,
    pub document_id: String,
}

impl DocumentKey {
    pub fn new(project_id: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self { project_id: project_id.into(), document_id: document_id.into() }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_id, self.document_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("brick id invalid: {0}")]
    BrickIdInvalid(BrickId),
    #[error("height index {index} out of range ({rows} rows)")]
    HeightIndexOutOfRange { index: usize, rows: usize },
    #[error("row {0} does not exist")]
    RowMissing(usize),
    #[error("column index {index} out of range (row {row} has {len} bricks)")]
    ColumnIndexOutOfRange { row: usize, index: usize, len: usize },
    #[error("client already connected: {0}")]
    DuplicateClient(Uuid),
    #[error("client not connected: {0}")]
    UnknownClient(Uuid),
    #[error("duplicate brick id in snapshot: {0}")]
    DuplicateBrick(BrickId),
    #[error("initial delivery to client {0} failed")]
    DeliveryFailed(Uuid),
    #[error("document is closing")]
    Closing,
    #[error("document is degraded")]
    Degraded,
    #[error("document task unavailable")]
    Unavailable,
    #[error(transparent)]
    Brick(#[from] BrickError),
}

impl ErrorCode for DocumentError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::BrickIdInvalid(_) => "E_BRICK_ID_INVALID",
            Self::HeightIndexOutOfRange { .. } => "E_HEIGHT_INDEX",
            Self::RowMissing(_) => "E_ROW_MISSING",
            Self::ColumnIndexOutOfRange { .. } => "E_COLUMN_INDEX",
            Self::DuplicateClient(_) => "E_DUPLICATE_CLIENT",
            Self::UnknownClient(_) => "E_UNKNOWN_CLIENT",
            Self::DuplicateBrick(_) => "E_DUPLICATE_BRICK",
            Self::DeliveryFailed(_) => "E_DELIVERY_FAILED",
            Self::Closing => "E_DOCUMENT_CLOSING",
            Self::Degraded => "E_DOCUMENT_DEGRADED",
            Self::Unavailable => "E_DOCUMENT_UNAVAILABLE",
            Self::Brick(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Closing | Self::Unavailable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    Open,
    /// Sealed for saving. Connects and operations are rejected.
    Closing,
    /// The last save failed. Rejects work until a save succeeds.
    Degraded,
}

#[derive(Debug, Clone, Copy)]
pub struct DocumentConfig {
    /// Bounded command queue per document.
    pub queue_capacity: usize,
    /// How long one recipient may take to accept a broadcast.
    pub broadcast_timeout: Duration,
    /// Whether documents keep a pointer registry for newcomers.
    pub presence_enabled: bool,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_DOCUMENT_QUEUE_CAPACITY,
            broadcast_timeout: Duration::from_millis(DEFAULT_BROADCAST_TIMEOUT_MS),
            presence_enabled: false,
        }
    }
}

/// A content operation requested by a connected client.
#[derive(Debug, Clone)]
pub enum Operation {
    InsertBrick(InsertBrick),
    RemoveBrick(RemoveBrick),
    MoveBrick(MoveBrick),
    BeginPath(BeginPath),
    AddPathPoints { brick_id: BrickId, points: Vec<Point> },
    EndPath { brick_id: BrickId, spline: serde_json::Value, id: String },
    EraseSplines(EraseSplines),
    TextInsert(TextInsert),
    Pointer(Pointer),
    MagicPen(MagicPen),
}

impl Operation {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::InsertBrick(_) => "insertBrick",
            Self::RemoveBrick(_) => "removeBrick",
            Self::MoveBrick(_) => "moveBrick",
            Self::BeginPath(_) => "beginPath",
            Self::AddPathPoints { .. } => "addPathPoint",
            Self::EndPath { .. } => "endPath",
            Self::EraseSplines(_) => "eraseSplines",
            Self::TextInsert(_) => "textInsert",
            Self::Pointer(_) => "pointer",
            Self::MagicPen(_) => "magicPen",
        }
    }
}

/// Who receives the message produced by an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Every registered client, the sender included.
    Broadcast(ServerMessage),
    /// Every registered client except the sender.
    BroadcastExcludeSender(ServerMessage),
}

struct ConnectedClient {
    info: ClientInfo,
    tx: mpsc::Sender<ServerMessage>,
}

// =============================================================================
// DOCUMENT
// =============================================================================

pub struct Document {
    key: DocumentKey,
    /// Rows top to bottom, each a left-to-right list of brick ids.
    layout: Vec<Vec<BrickId>>,
    bricks: HashMap<BrickId, Brick>,
    clients: HashMap<Uuid, ConnectedClient>,
    next_brick_id: BrickId,
    presence: Option<PresenceRegistry>,
    status: DocumentStatus,
    idle_since: Option<Instant>,
}

impl Document {
    #[must_use]
    pub fn new(key: DocumentKey, presence_enabled: bool) -> Self {
        Self {
            key,
            layout: Vec::new(),
            bricks: HashMap::new(),
            clients: HashMap::new(),
            next_brick_id: 1,
            presence: presence_enabled.then(PresenceRegistry::new),
            status: DocumentStatus::Open,
            idle_since: Some(Instant::now()),
        }
    }

    /// Rebuild a document from a saved snapshot. Empty rows are dropped.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateBrick` if a brick id appears twice.
    pub fn load(key: DocumentKey, snapshot: &DocumentSnapshot, presence_enabled: bool) -> Result<Self, DocumentError> {
        let mut document = Self::new(key, presence_enabled);
        for row in &snapshot.bricks {
            if row.is_empty() {
                continue;
            }
            let mut ids = Vec::with_capacity(row.len());
            for saved in row {
                if document.bricks.contains_key(&saved.id) {
                    return Err(DocumentError::DuplicateBrick(saved.id));
                }
                document.bricks.insert(saved.id, Brick::load(saved));
                ids.push(saved.id);
                document.next_brick_id = document.next_brick_id.max(saved.id.saturating_add(1));
            }
            document.layout.push(ids);
        }
        Ok(document)
    }

    #[must_use]
    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    #[must_use]
    pub fn status(&self) -> DocumentStatus {
        self.status
    }

    #[must_use]
    pub fn layout(&self) -> &[Vec<BrickId>] {
        &self.layout
    }

    #[must_use]
    pub fn brick(&self, id: BrickId) -> Option<&Brick> {
        self.bricks.get(&id)
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Full live state, including strokes still being drawn.
    #[must_use]
    pub fn lean(&self) -> DocumentSnapshot {
        self.snapshot_with(Brick::lean)
    }

    /// Durable state for storage. Open strokes are left out.
    #[must_use]
    pub fn save(&self) -> DocumentSnapshot {
        self.snapshot_with(Brick::save)
    }

    fn snapshot_with(&self, view: impl Fn(&Brick) -> crate::message::BrickSnapshot) -> DocumentSnapshot {
        let bricks = self
            .layout
            .iter()
            .map(|row| row.iter().filter_map(|id| self.bricks.get(id)).map(&view).collect())
            .collect();
        DocumentSnapshot { bricks }
    }

    // -------------------------------------------------------------------------
    // Clients
    // -------------------------------------------------------------------------

    /// Check that `client` may join and build the messages it must receive
    /// before it is registered for broadcasts.
    ///
    /// # Errors
    ///
    /// Returns `Closing`/`Degraded` when the document is not open, or
    /// `DuplicateClient` if the connection id is already registered.
    pub fn admit(&self, client: &ClientInfo) -> Result<Vec<ServerMessage>, DocumentError> {
        self.ensure_open()?;
        if self.clients.contains_key(&client.user_unique_id) {
            return Err(DocumentError::DuplicateClient(client.user_unique_id));
        }

        let mut peers: Vec<ClientInfo> = self.clients.values().map(|c| c.info.clone()).collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name).then(a.user_unique_id.cmp(&b.user_unique_id)));

        let mut intro = vec![ServerMessage::Initialize(self.lean()), ServerMessage::Roster(Roster { clients: peers })];
        if let Some(presence) = &self.presence {
            intro.push(ServerMessage::Presence(presence.snapshot()));
        }
        Ok(intro)
    }

    /// Register an admitted client. Peers are told about the newcomer.
    pub fn register(&mut self, client: ClientInfo, tx: mpsc::Sender<ServerMessage>) -> Outcome {
        let announce = ServerMessage::ClientConnect(client.clone());
        self.clients
            .insert(client.user_unique_id, ConnectedClient { info: client, tx });
        self.idle_since = None;
        Outcome::BroadcastExcludeSender(announce)
    }

    /// Remove a client and discard its open strokes. No-op for unknown ids.
    pub fn disconnect_client(&mut self, user_unique_id: Uuid) -> Option<Outcome> {
        let client = self.clients.remove(&user_unique_id)?;
        for brick in self.bricks.values_mut() {
            brick.disconnect_client(user_unique_id);
        }
        if let Some(presence) = &mut self.presence {
            presence.remove(user_unique_id);
        }
        if self.clients.is_empty() {
            self.idle_since = Some(Instant::now());
        }
        Some(Outcome::Broadcast(ServerMessage::ClientDisconnect(client.info)))
    }

    fn recipients(&self, exclude: Option<Uuid>) -> Vec<(Uuid, mpsc::Sender<ServerMessage>)> {
        self.clients
            .iter()
            .filter(|(id, _)| exclude != Some(**id))
            .map(|(id, c)| (*id, c.tx.clone()))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Validate and apply one operation from `author`.
    ///
    /// # Errors
    ///
    /// Returns the validation or brick error; the document is unchanged.
    pub fn apply(&mut self, author: &Author, op: Operation) -> Result<Outcome, DocumentError> {
        self.ensure_open()?;
        if !self.clients.contains_key(&author.user_unique_id) {
            return Err(DocumentError::UnknownClient(author.user_unique_id));
        }

        match op {
            Operation::InsertBrick(insert) => self.insert_brick(author, insert),
            Operation::RemoveBrick(remove) => self.remove_brick(author, remove),
            Operation::MoveBrick(mv) => self.move_brick(author, mv),
            Operation::BeginPath(begin) => self.begin_path(author, begin),
            Operation::AddPathPoints { brick_id, points } => self.add_path_points(author, brick_id, points),
            Operation::EndPath { brick_id, spline, id } => self.end_path(author, brick_id, spline, id),
            Operation::EraseSplines(erase) => self.erase_splines(author, erase),
            Operation::TextInsert(insert) => self.text_insert(author, insert),
            Operation::Pointer(pointer) => Ok(self.pointer(author, pointer)),
            Operation::MagicPen(pen) => self.magic_pen(author, pen),
        }
    }

    fn insert_brick(&mut self, author: &Author, insert: InsertBrick) -> Result<Outcome, DocumentError> {
        let id = self.next_brick_id;
        place(&mut self.layout, id, insert.height_index, insert.column_index)?;
        self.next_brick_id += 1;
        self.bricks.insert(id, Brick::new(id, insert.brick_type));

        Ok(Outcome::Broadcast(ServerMessage::InsertedBrick(InsertedBrick {
            brick_id: id,
            brick_type: insert.brick_type,
            height_index: insert.height_index,
            column_index: insert.column_index,
            user_unique_id: author.user_unique_id,
        })))
    }

    fn remove_brick(&mut self, author: &Author, remove: RemoveBrick) -> Result<Outcome, DocumentError> {
        if !detach(&mut self.layout, remove.brick_id) {
            return Err(DocumentError::BrickIdInvalid(remove.brick_id));
        }
        self.bricks.remove(&remove.brick_id);

        Ok(Outcome::Broadcast(ServerMessage::RemovedBrick(RemovedBrick {
            brick_id: remove.brick_id,
            user_unique_id: author.user_unique_id,
        })))
    }

    fn move_brick(&mut self, author: &Author, mv: MoveBrick) -> Result<Outcome, DocumentError> {
        // Positions refer to the layout with the brick already detached.
        let mut layout = self.layout.clone();
        if !detach(&mut layout, mv.brick_id) {
            return Err(DocumentError::BrickIdInvalid(mv.brick_id));
        }
        place(&mut layout, mv.brick_id, mv.height_index, mv.column_index)?;
        self.layout = layout;

        Ok(Outcome::Broadcast(ServerMessage::MovedBrick(MovedBrick {
            brick_id: mv.brick_id,
            height_index: mv.height_index,
            column_index: mv.column_index,
            user_unique_id: author.user_unique_id,
        })))
    }

    fn begin_path(&mut self, author: &Author, begin: BeginPath) -> Result<Outcome, DocumentError> {
        self.brick_mut(begin.brick_id)?;
        // A client has at most one open stroke; a new one abandons the last.
        for (id, brick) in &mut self.bricks {
            if *id != begin.brick_id && brick.disconnect_client(author.user_unique_id) {
                debug!(document = %self.key, brick_id = id, user_unique_id = %author.user_unique_id, "document: abandoned open stroke");
            }
        }
        self.brick_mut(begin.brick_id)?
            .begin_path(author.user_unique_id, begin.stroke_style.clone());

        Ok(Outcome::BroadcastExcludeSender(ServerMessage::BeginPath(PathBegun {
            brick_id: begin.brick_id,
            stroke_style: begin.stroke_style,
            author: author.clone(),
        })))
    }

    fn add_path_points(&mut self, author: &Author, brick_id: BrickId, points: Vec<Point>) -> Result<Outcome, DocumentError> {
        self.brick_mut(brick_id)?
            .add_path_points(author.user_unique_id, &points)?;

        Ok(Outcome::BroadcastExcludeSender(ServerMessage::AddPathPoint(PathPointsAdded {
            brick_id,
            points,
            author: author.clone(),
        })))
    }

    fn end_path(
        &mut self,
        author: &Author,
        brick_id: BrickId,
        spline: serde_json::Value,
        id: String,
    ) -> Result<Outcome, DocumentError> {
        self.brick_mut(brick_id)?
            .end_path(author.user_unique_id, spline.clone(), id.clone())?;

        Ok(Outcome::BroadcastExcludeSender(ServerMessage::EndPath(PathEnded {
            brick_id,
            spline,
            id,
            author: author.clone(),
        })))
    }

    fn erase_splines(&mut self, author: &Author, erase: EraseSplines) -> Result<Outcome, DocumentError> {
        self.brick_mut(erase.brick_id)?.erase_splines(&erase.ids);

        Ok(Outcome::BroadcastExcludeSender(ServerMessage::EraseSplines(SplinesErased {
            brick_id: erase.brick_id,
            ids: erase.ids,
            author: author.clone(),
        })))
    }

    fn text_insert(&mut self, author: &Author, insert: TextInsert) -> Result<Outcome, DocumentError> {
        self.brick_mut(insert.brick_id)?
            .text_insert(&insert.changes)?;

        Ok(Outcome::BroadcastExcludeSender(ServerMessage::TextInserted(TextInserted {
            brick_id: insert.brick_id,
            changes: insert.changes,
            author: author.clone(),
        })))
    }

    fn pointer(&mut self, author: &Author, pointer: Pointer) -> Outcome {
        if let Some(presence) = &mut self.presence {
            presence.record(author.user_unique_id, &pointer);
        }
        Outcome::BroadcastExcludeSender(ServerMessage::Pointer(PointerMoved { pointer, author: author.clone() }))
    }

    fn magic_pen(&mut self, author: &Author, pen: MagicPen) -> Result<Outcome, DocumentError> {
        if !self.bricks.contains_key(&pen.brick_id) {
            return Err(DocumentError::BrickIdInvalid(pen.brick_id));
        }
        Ok(Outcome::BroadcastExcludeSender(ServerMessage::MagicPen(MagicPenStroke { pen, author: author.clone() })))
    }

    fn brick_mut(&mut self, id: BrickId) -> Result<&mut Brick, DocumentError> {
        self.bricks
            .get_mut(&id)
            .ok_or(DocumentError::BrickIdInvalid(id))
    }

    fn ensure_open(&self) -> Result<(), DocumentError> {
        match self.status {
            DocumentStatus::Open => Ok(()),
            DocumentStatus::Closing => Err(DocumentError::Closing),
            DocumentStatus::Degraded => Err(DocumentError::Degraded),
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Stop accepting work and return the state to save.
    ///
    /// Returns `None` if a close is already under way. With `min_idle`, only
    /// seals when no client has been connected for at least that long.
    /// Degraded documents always seal so their save can be retried.
    pub fn seal(&mut self, min_idle: Option<Duration>) -> Option<DocumentSnapshot> {
        if self.status == DocumentStatus::Closing {
            return None;
        }
        if let (Some(min_idle), DocumentStatus::Open) = (min_idle, self.status) {
            let idle_long_enough = self
                .idle_since
                .is_some_and(|since| since.elapsed() >= min_idle);
            if !self.clients.is_empty() || !idle_long_enough {
                return None;
            }
        }
        self.status = DocumentStatus::Closing;
        Some(self.save())
    }

    pub fn mark_degraded(&mut self) {
        self.status = DocumentStatus::Degraded;
    }
}

// =============================================================================
// LAYOUT HELPERS
// =============================================================================

/// Insert `id` as a new row at `height`, or into row `height` at `column`.
fn place(layout: &mut Vec<Vec<BrickId>>, id: BrickId, height: usize, column: Option<usize>) -> Result<(), DocumentError> {
    let rows = layout.len();
    if height > rows {
        return Err(DocumentError::HeightIndexOutOfRange { index: height, rows });
    }
    match column {
        None => layout.insert(height, vec![id]),
        Some(column) => {
            let row = layout
                .get_mut(height)
                .ok_or(DocumentError::RowMissing(height))?;
            if column > row.len() {
                return Err(DocumentError::ColumnIndexOutOfRange { row: height, index: column, len: row.len() });
            }
            row.insert(column, id);
        }
    }
    Ok(())
}

/// Remove `id` from the layout, dropping its row if it empties.
fn detach(layout: &mut Vec<Vec<BrickId>>, id: BrickId) -> bool {
    let Some((row_index, column)) = layout
        .iter()
        .enumerate()
        .find_map(|(r, row)| row.iter().position(|b| *b == id).map(|c| (r, c)))
    else {
        return false;
    };
    layout[row_index].remove(column);
    if layout[row_index].is_empty() {
        layout.remove(row_index);
    }
    true
}

// =============================================================================
// TASK
// =============================================================================

enum Command {
    Connect {
        client: ClientInfo,
        tx: mpsc::Sender<ServerMessage>,
        reply: oneshot::Sender<Result<(), DocumentError>>,
    },
    Disconnect {
        user_unique_id: Uuid,
    },
    Apply {
        author: Author,
        op: Operation,
    },
    Lean {
        reply: oneshot::Sender<DocumentSnapshot>,
    },
    Seal {
        min_idle: Option<Duration>,
        reply: oneshot::Sender<Option<DocumentSnapshot>>,
    },
    MarkDegraded,
    Shutdown,
}

/// Cloneable handle to a running document task.
#[derive(Clone)]
pub struct DocumentHandle {
    key: Arc<DocumentKey>,
    tx: mpsc::Sender<Command>,
}

impl DocumentHandle {
    /// Move `document` into its own task and return a handle to it.
    #[must_use]
    pub fn spawn(document: Document, config: &DocumentConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let key = Arc::new(document.key().clone());
        tokio::spawn(run_document(document, rx, config.broadcast_timeout));
        Self { key, tx }
    }

    #[must_use]
    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    /// Whether both handles address the same running task.
    #[must_use]
    pub fn same_document(&self, other: &Self) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// Register a client. Its queue receives `initialize` and the roster
    /// before any broadcast.
    ///
    /// # Errors
    ///
    /// Returns the document's rejection, or `Unavailable` if the task is gone.
    pub async fn connect(&self, client: ClientInfo, tx: mpsc::Sender<ServerMessage>) -> Result<(), DocumentError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect { client, tx, reply }).await?;
        rx.await.map_err(|_| DocumentError::Unavailable)?
    }

    pub async fn disconnect(&self, user_unique_id: Uuid) {
        let _ = self.send(Command::Disconnect { user_unique_id }).await;
    }

    /// Queue an operation. Failures of the operation itself are logged by the
    /// document task, not returned.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the task is gone.
    pub async fn apply(&self, author: Author, op: Operation) -> Result<(), DocumentError> {
        self.send(Command::Apply { author, op }).await
    }

    /// # Errors
    ///
    /// Returns `Unavailable` if the task is gone.
    pub async fn lean(&self) -> Result<DocumentSnapshot, DocumentError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Lean { reply }).await?;
        rx.await.map_err(|_| DocumentError::Unavailable)
    }

    /// # Errors
    ///
    /// Returns `Unavailable` if the task is gone.
    pub async fn seal(&self, min_idle: Option<Duration>) -> Result<Option<DocumentSnapshot>, DocumentError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Seal { min_idle, reply }).await?;
        rx.await.map_err(|_| DocumentError::Unavailable)
    }

    pub async fn mark_degraded(&self) {
        let _ = self.send(Command::MarkDegraded).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.send(Command::Shutdown).await;
    }

    async fn send(&self, command: Command) -> Result<(), DocumentError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| DocumentError::Unavailable)
    }
}

async fn run_document(mut document: Document, mut rx: mpsc::Receiver<Command>, broadcast_timeout: Duration) {
    info!(document = %document.key(), bricks = document.bricks.len(), "document: task started");

    while let Some(command) = rx.recv().await {
        match command {
            Command::Connect { client, tx, reply } => {
                let result = connect_client(&mut document, client, tx, broadcast_timeout).await;
                let _ = reply.send(result);
            }
            Command::Disconnect { user_unique_id } => {
                if let Some(outcome) = document.disconnect_client(user_unique_id) {
                    info!(document = %document.key(), %user_unique_id, clients = document.client_count(), "document: client disconnected");
                    deliver(&mut document, outcome, None, broadcast_timeout).await;
                }
            }
            Command::Apply { author, op } => {
                let name = op.name();
                match document.apply(&author, op) {
                    Ok(outcome) => {
                        debug!(document = %document.key(), user_unique_id = %author.user_unique_id, op = name, "document: applied");
                        deliver(&mut document, outcome, Some(author.user_unique_id), broadcast_timeout).await;
                    }
                    Err(e) => {
                        warn!(
                            document = %document.key(),
                            user_unique_id = %author.user_unique_id,
                            op = name,
                            code = e.error_code(),
                            error = %e,
                            "document: operation dropped"
                        );
                    }
                }
            }
            Command::Lean { reply } => {
                let _ = reply.send(document.lean());
            }
            Command::Seal { min_idle, reply } => {
                let _ = reply.send(document.seal(min_idle));
            }
            Command::MarkDegraded => {
                warn!(document = %document.key(), "document: marked degraded");
                document.mark_degraded();
            }
            Command::Shutdown => break,
        }
    }

    info!(document = %document.key(), clients = document.client_count(), "document: task stopped");
}

async fn connect_client(
    document: &mut Document,
    client: ClientInfo,
    tx: mpsc::Sender<ServerMessage>,
    broadcast_timeout: Duration,
) -> Result<(), DocumentError> {
    let user_unique_id = client.user_unique_id;
    let intro = match document.admit(&client) {
        Ok(intro) => intro,
        Err(e) => {
            warn!(document = %document.key(), %user_unique_id, code = e.error_code(), error = %e, "document: connect rejected");
            return Err(e);
        }
    };

    // Snapshot first, subscribe second: the newcomer must not see a
    // broadcast before its `initialize`.
    for message in intro {
        tx.try_send(message)
            .map_err(|_| DocumentError::DeliveryFailed(user_unique_id))?;
    }
    let outcome = document.register(client, tx);
    info!(document = %document.key(), %user_unique_id, clients = document.client_count(), "document: client connected");
    deliver(document, outcome, Some(user_unique_id), broadcast_timeout).await;
    Ok(())
}

/// Fan a message out to its recipients and wait until each has accepted it.
///
/// Recipients that cannot accept within `timeout` are disconnected; their
/// departure is broadcast in turn.
async fn deliver(document: &mut Document, outcome: Outcome, sender: Option<Uuid>, timeout: Duration) {
    let mut pending = vec![(outcome, sender)];

    while let Some((outcome, sender)) = pending.pop() {
        let (message, exclude) = match outcome {
            Outcome::Broadcast(message) => (message, None),
            Outcome::BroadcastExcludeSender(message) => (message, sender),
        };

        let sends = document
            .recipients(exclude)
            .into_iter()
            .map(|(id, tx)| {
                let message = message.clone();
                async move {
                    let accepted = matches!(tokio::time::timeout(timeout, tx.send(message)).await, Ok(Ok(())));
                    (id, accepted)
                }
            });

        for (id, accepted) in join_all(sends).await {
            if accepted {
                continue;
            }
            warn!(document = %document.key(), user_unique_id = %id, event = message.event(), "document: recipient stalled; disconnecting");
            if let Some(departure) = document.disconnect_client(id) {
                pending.push((departure, None));
            }
        }
    }
}

#[cfg(test)]
#[path = "document_test.rs"]
mod tests;
