//! Message — the JSON events exchanged over a document websocket.
//!
//! ARCHITECTURE
//! ============
//! Every websocket text message is `{"event": <name>, "data": <payload>}`.
//! Inbound events deserialize into the closed `ClientMessage` enum so the
//! connection handler dispatches with a single `match`. Outbound events are
//! `ServerMessage` values queued per client by the owning document and
//! written to the socket verbatim.
//!
//! DESIGN
//! ======
//! - Payload validation is the type system: a payload with the wrong shape
//!   fails to deserialize and never reaches a document.
//! - Snapshot types (`DocumentSnapshot`, `BrickSnapshot`) double as the
//!   storage format, so `initialize` and the persisted row share one shape.
//! - Spline payloads are opaque `serde_json::Value`s.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Brick identifier. Allocated by the owning document, never reused.
pub type BrickId = u64;

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured logs.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// SHARED SHAPES
// =============================================================================

/// Surface variant. Encoded on the wire as `0` (draw) or `1` (text).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum BrickKind {
    Draw,
    Text,
}

impl TryFrom<u8> for BrickKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Draw),
            1 => Ok(Self::Text),
            other => Err(format!("unknown brick type: {other}")),
        }
    }
}

impl From<BrickKind> for u8 {
    fn from(kind: BrickKind) -> Self {
        match kind {
            BrickKind::Draw => 0,
            BrickKind::Text => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrokeStyle {
    pub color: String,
    pub thickness: f64,
}

/// One step of a text edit script.
///
/// Wire form is an object with exactly one of `r` (retain), `d` (delete)
/// or `i` (insert).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTextChange", into = "RawTextChange")]
pub enum TextChange {
    Retain(usize),
    Delete(usize),
    Insert(String),
}

#[derive(Serialize, Deserialize)]
struct RawTextChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    r: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    d: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    i: Option<String>,
}

impl TryFrom<RawTextChange> for TextChange {
    type Error = String;

    fn try_from(raw: RawTextChange) -> Result<Self, Self::Error> {
        match (raw.r, raw.d, raw.i) {
            (Some(n), None, None) => Ok(Self::Retain(n)),
            (None, Some(n), None) => Ok(Self::Delete(n)),
            (None, None, Some(s)) => Ok(Self::Insert(s)),
            _ => Err("text change must carry exactly one of r, d, i".into()),
        }
    }
}

impl From<TextChange> for RawTextChange {
    fn from(change: TextChange) -> Self {
        match change {
            TextChange::Retain(n) => Self { r: Some(n), d: None, i: None },
            TextChange::Delete(n) => Self { r: None, d: Some(n), i: None },
            TextChange::Insert(s) => Self { r: None, d: None, i: Some(s) },
        }
    }
}

/// Identity stamped on every relayed content event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub user_id: String,
    pub user_unique_id: Uuid,
}

/// A connected participant as announced to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub user_unique_id: Uuid,
    pub id: String,
    pub name: String,
    pub color: String,
}

impl ClientInfo {
    #[must_use]
    pub fn author(&self) -> Author {
        Author { user_id: self.id.clone(), user_unique_id: self.user_unique_id }
    }
}

// =============================================================================
// SNAPSHOTS
// =============================================================================

/// A stroke that is still being drawn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempPath {
    pub style: StrokeStyle,
    pub points: Vec<Point>,
}

/// A committed stroke, addressable by its caller-assigned id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplineEntry {
    pub id: String,
    pub spline: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrickSnapshot {
    pub id: BrickId,
    #[serde(rename = "type")]
    pub kind: BrickKind,
    #[serde(default)]
    pub temp_paths: BTreeMap<Uuid, TempPath>,
    #[serde(default)]
    pub splines: Vec<SplineEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Full document state: rows of bricks mirroring the layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub bricks: Vec<Vec<BrickSnapshot>>,
}

// =============================================================================
// INBOUND
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authentication {
    pub user_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Echo {
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertBrick {
    pub brick_type: BrickKind,
    pub height_index: usize,
    #[serde(default)]
    pub column_index: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveBrick {
    pub brick_id: BrickId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveBrick {
    pub brick_id: BrickId,
    pub height_index: usize,
    #[serde(default)]
    pub column_index: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeginPath {
    pub brick_id: BrickId,
    pub stroke_style: StrokeStyle,
}

/// Points for the sender's open stroke. The brick is implied by the
/// preceding `beginPath`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddPathPoint {
    pub points: Vec<Point>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndPath {
    pub spline: serde_json::Value,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EraseSplines {
    pub brick_id: BrickId,
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextInsert {
    pub brick_id: BrickId,
    pub changes: Vec<TextChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pointer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brick_id: Option<BrickId>,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MagicPen {
    pub brick_id: BrickId,
    pub points: Vec<Point>,
}

/// Every event a client may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
    Authentication(Authentication),
    Echo(Echo),
    InsertBrick(InsertBrick),
    RemoveBrick(RemoveBrick),
    MoveBrick(MoveBrick),
    BeginPath(BeginPath),
    AddPathPoint(AddPathPoint),
    EndPath(EndPath),
    EraseSplines(EraseSplines),
    TextInsert(TextInsert),
    Pointer(Pointer),
    MagicPen(MagicPen),
}

impl ClientMessage {
    /// Event name, for logging.
    #[must_use]
    pub fn event(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication",
            Self::Echo(_) => "echo",
            Self::InsertBrick(_) => "insertBrick",
            Self::RemoveBrick(_) => "removeBrick",
            Self::MoveBrick(_) => "moveBrick",
            Self::BeginPath(_) => "beginPath",
            Self::AddPathPoint(_) => "addPathPoint",
            Self::EndPath(_) => "endPath",
            Self::EraseSplines(_) => "eraseSplines",
            Self::TextInsert(_) => "textInsert",
            Self::Pointer(_) => "pointer",
            Self::MagicPen(_) => "magicPen",
        }
    }
}

// =============================================================================
// OUTBOUND
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertedBrick {
    pub brick_id: BrickId,
    pub brick_type: BrickKind,
    pub height_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_index: Option<usize>,
    pub user_unique_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovedBrick {
    pub brick_id: BrickId,
    pub user_unique_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovedBrick {
    pub brick_id: BrickId,
    pub height_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_index: Option<usize>,
    pub user_unique_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathBegun {
    pub brick_id: BrickId,
    pub stroke_style: StrokeStyle,
    #[serde(flatten)]
    pub author: Author,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathPointsAdded {
    pub brick_id: BrickId,
    pub points: Vec<Point>,
    #[serde(flatten)]
    pub author: Author,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathEnded {
    pub brick_id: BrickId,
    pub spline: serde_json::Value,
    pub id: String,
    #[serde(flatten)]
    pub author: Author,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplinesErased {
    pub brick_id: BrickId,
    pub ids: Vec<String>,
    #[serde(flatten)]
    pub author: Author,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextInserted {
    pub brick_id: BrickId,
    pub changes: Vec<TextChange>,
    #[serde(flatten)]
    pub author: Author,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointerMoved {
    #[serde(flatten)]
    pub pointer: Pointer,
    #[serde(flatten)]
    pub author: Author,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MagicPenStroke {
    #[serde(flatten)]
    pub pen: MagicPen,
    #[serde(flatten)]
    pub author: Author,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointerPosition {
    pub user_unique_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brick_id: Option<BrickId>,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    pub pointers: Vec<PointerPosition>,
}

/// Clients already connected when the receiver joined.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Roster {
    pub clients: Vec<ClientInfo>,
}

/// Every event the server may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    Initialize(DocumentSnapshot),
    Roster(Roster),
    Presence(PresenceSnapshot),
    Echo(Echo),
    InsertedBrick(InsertedBrick),
    RemovedBrick(RemovedBrick),
    MovedBrick(MovedBrick),
    BeginPath(PathBegun),
    AddPathPoint(PathPointsAdded),
    EndPath(PathEnded),
    EraseSplines(SplinesErased),
    TextInserted(TextInserted),
    Pointer(PointerMoved),
    MagicPen(MagicPenStroke),
    ClientConnect(ClientInfo),
    ClientDisconnect(ClientInfo),
}

impl ServerMessage {
    /// Event name, for logging.
    #[must_use]
    pub fn event(&self) -> &'static str {
        match self {
            Self::Initialize(_) => "initialize",
            Self::Roster(_) => "roster",
            Self::Presence(_) => "presence",
            Self::Echo(_) => "echo",
            Self::InsertedBrick(_) => "insertedBrick",
            Self::RemovedBrick(_) => "removedBrick",
            Self::MovedBrick(_) => "movedBrick",
            Self::BeginPath(_) => "beginPath",
            Self::AddPathPoint(_) => "addPathPoint",
            Self::EndPath(_) => "endPath",
            Self::EraseSplines(_) => "eraseSplines",
            Self::TextInserted(_) => "textInserted",
            Self::Pointer(_) => "pointer",
            Self::MagicPen(_) => "magicPen",
            Self::ClientConnect(_) => "clientConnect",
            Self::ClientDisconnect(_) => "clientDisconnect",
        }
    }
}

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;
