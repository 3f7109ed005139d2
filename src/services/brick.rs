//! Brick service — content of one drawing or text surface.
//!
//! DESIGN
//! ======
//! `Brick` is a closed variant over the two surface kinds. A text brick
//! composes a draw brick (strokes can be drawn over text) and adds a single
//! text buffer. Both variants expose the same stroke operations plus
//! `lean`/`save`/`load`; only the text variant accepts edit scripts.
//!
//! Bricks hold no locks and perform no I/O. The owning document applies
//! operations one at a time, which is the only ordering guarantee.

use std::collections::{BTreeMap, HashMap, HashSet};

use uuid::Uuid;

use crate::message::{
    BrickId, BrickKind, BrickSnapshot, ErrorCode, Point, SplineEntry, StrokeStyle, TempPath, TextChange,
};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BrickError {
    #[error("user has no unfinished path: {0}")]
    NoUnfinishedPath(Uuid),
    #[error("spline id already present: {0}")]
    DuplicateSpline(String),
    #[error("brick {0} is not a text brick")]
    NotText(BrickId),
    #[error("edit script runs past end of text (needs {needed}, length {len})")]
    ScriptOverrun { needed: usize, len: usize },
}

impl ErrorCode for BrickError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NoUnfinishedPath(_) => "E_NO_UNFINISHED_PATH",
            Self::DuplicateSpline(_) => "E_DUPLICATE_SPLINE",
            Self::NotText(_) => "E_NOT_TEXT_BRICK",
            Self::ScriptOverrun { .. } => "E_SCRIPT_OVERRUN",
        }
    }
}

/// Stroke state shared by every brick kind.
#[derive(Debug, Clone)]
pub struct DrawBrick {
    id: BrickId,
    temp_paths: HashMap<Uuid, TempPath>,
    splines: Vec<SplineEntry>,
}

#[derive(Debug, Clone)]
pub struct TextBrick {
    canvas: DrawBrick,
    text: String,
}

#[derive(Debug, Clone)]
pub enum Brick {
    Draw(DrawBrick),
    Text(TextBrick),
}

// =============================================================================
// DRAW BRICK
// =============================================================================

impl DrawBrick {
    #[must_use]
    pub fn new(id: BrickId) -> Self {
        Self { id, temp_paths: HashMap::new(), splines: Vec::new() }
    }

    fn from_snapshot(snapshot: &BrickSnapshot) -> Self {
        Self { id: snapshot.id, temp_paths: HashMap::new(), splines: snapshot.splines.clone() }
    }

    /// Open a stroke for `user`, replacing any stroke already open.
    pub fn begin_path(&mut self, user: Uuid, style: StrokeStyle) {
        self.temp_paths
            .insert(user, TempPath { style, points: Vec::new() });
    }

    /// Append points to the tail of `user`'s open stroke.
    ///
    /// # Errors
    ///
    /// Returns `NoUnfinishedPath` if `user` has no open stroke.
    pub fn add_path_points(&mut self, user: Uuid, points: &[Point]) -> Result<(), BrickError> {
        let path = self
            .temp_paths
            .get_mut(&user)
            .ok_or(BrickError::NoUnfinishedPath(user))?;
        path.points.extend_from_slice(points);
        Ok(())
    }

    /// Close `user`'s stroke and commit `spline` under `spline_id`.
    ///
    /// # Errors
    ///
    /// Returns `NoUnfinishedPath` if no stroke is open, or `DuplicateSpline`
    /// if `spline_id` is already present. The open stroke is kept on error.
    pub fn end_path(&mut self, user: Uuid, spline: serde_json::Value, spline_id: String) -> Result<(), BrickError> {
        if !self.temp_paths.contains_key(&user) {
            return Err(BrickError::NoUnfinishedPath(user));
        }
        if self.splines.iter().any(|s| s.id == spline_id) {
            return Err(BrickError::DuplicateSpline(spline_id));
        }
        self.temp_paths.remove(&user);
        self.splines.push(SplineEntry { id: spline_id, spline });
        Ok(())
    }

    /// Remove every spline whose id is in `ids`. Unknown ids are ignored.
    pub fn erase_splines(&mut self, ids: &[String]) {
        let ids: HashSet<&str> = ids.iter().map(String::as_str).collect();
        self.splines.retain(|s| !ids.contains(s.id.as_str()));
    }

    /// Discard `user`'s open stroke without committing it.
    pub fn disconnect_client(&mut self, user: Uuid) -> bool {
        self.temp_paths.remove(&user).is_some()
    }

    fn snapshot(&self, kind: BrickKind, text: Option<String>, include_temp: bool) -> BrickSnapshot {
        let temp_paths = if include_temp {
            self.temp_paths
                .iter()
                .map(|(user, path)| (*user, path.clone()))
                .collect()
        } else {
            BTreeMap::new()
        };
        BrickSnapshot { id: self.id, kind, temp_paths, splines: self.splines.clone(), text }
    }
}

// =============================================================================
// TEXT BRICK
// =============================================================================

impl TextBrick {
    #[must_use]
    pub fn new(id: BrickId) -> Self {
        Self { canvas: DrawBrick::new(id), text: String::new() }
    }

    /// Apply an edit script to the text. All-or-nothing.
    ///
    /// # Errors
    ///
    /// Returns `ScriptOverrun` if a retain or delete reaches past the end of
    /// the current text.
    pub fn text_insert(&mut self, changes: &[TextChange]) -> Result<(), BrickError> {
        self.text = apply_changes(&self.text, changes)?;
        Ok(())
    }
}

/// Run an edit script over `old`, returning the new text.
///
/// Positions count Unicode scalar values. Characters left after the last
/// step are carried over unchanged.
///
/// # Errors
///
/// Returns `ScriptOverrun` if the script consumes more than `old` holds.
pub fn apply_changes(old: &str, changes: &[TextChange]) -> Result<String, BrickError> {
    let chars: Vec<char> = old.chars().collect();
    let mut out = String::with_capacity(old.len());
    let mut cursor = 0usize;

    for change in changes {
        match change {
            TextChange::Retain(n) => {
                let end = advance(cursor, *n, chars.len())?;
                out.extend(&chars[cursor..end]);
                cursor = end;
            }
            TextChange::Delete(n) => {
                cursor = advance(cursor, *n, chars.len())?;
            }
            TextChange::Insert(s) => out.push_str(s),
        }
    }

    out.extend(&chars[cursor..]);
    Ok(out)
}

fn advance(cursor: usize, n: usize, len: usize) -> Result<usize, BrickError> {
    match cursor.checked_add(n) {
        Some(end) if end <= len => Ok(end),
        _ => Err(BrickError::ScriptOverrun { needed: cursor.saturating_add(n), len }),
    }
}

// =============================================================================
// BRICK
// =============================================================================

impl Brick {
    #[must_use]
    pub fn new(id: BrickId, kind: BrickKind) -> Self {
        match kind {
            BrickKind::Draw => Self::Draw(DrawBrick::new(id)),
            BrickKind::Text => Self::Text(TextBrick::new(id)),
        }
    }

    /// Rebuild a brick from a saved snapshot. Temp paths are not restored.
    #[must_use]
    pub fn load(snapshot: &BrickSnapshot) -> Self {
        let canvas = DrawBrick::from_snapshot(snapshot);
        match snapshot.kind {
            BrickKind::Draw => Self::Draw(canvas),
            BrickKind::Text => Self::Text(TextBrick { canvas, text: snapshot.text.clone().unwrap_or_default() }),
        }
    }

    #[must_use]
    pub fn id(&self) -> BrickId {
        self.canvas().id
    }

    #[must_use]
    pub fn kind(&self) -> BrickKind {
        match self {
            Self::Draw(_) => BrickKind::Draw,
            Self::Text(_) => BrickKind::Text,
        }
    }

    /// Live view including strokes still being drawn.
    #[must_use]
    pub fn lean(&self) -> BrickSnapshot {
        self.canvas().snapshot(self.kind(), self.text().map(str::to_owned), true)
    }

    /// Durable view. Open strokes are transient and left out.
    #[must_use]
    pub fn save(&self) -> BrickSnapshot {
        self.canvas().snapshot(self.kind(), self.text().map(str::to_owned), false)
    }

    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Draw(_) => None,
            Self::Text(t) => Some(&t.text),
        }
    }

    #[must_use]
    pub fn splines(&self) -> &[SplineEntry] {
        &self.canvas().splines
    }

    #[must_use]
    pub fn temp_path(&self, user: Uuid) -> Option<&TempPath> {
        self.canvas().temp_paths.get(&user)
    }

    pub fn begin_path(&mut self, user: Uuid, style: StrokeStyle) {
        self.canvas_mut().begin_path(user, style);
    }

    /// # Errors
    ///
    /// See [`DrawBrick::add_path_points`].
    pub fn add_path_points(&mut self, user: Uuid, points: &[Point]) -> Result<(), BrickError> {
        self.canvas_mut().add_path_points(user, points)
    }

    /// # Errors
    ///
    /// See [`DrawBrick::end_path`].
    pub fn end_path(&mut self, user: Uuid, spline: serde_json::Value, spline_id: String) -> Result<(), BrickError> {
        self.canvas_mut().end_path(user, spline, spline_id)
    }

    pub fn erase_splines(&mut self, ids: &[String]) {
        self.canvas_mut().erase_splines(ids);
    }

    pub fn disconnect_client(&mut self, user: Uuid) -> bool {
        self.canvas_mut().disconnect_client(user)
    }

    /// # Errors
    ///
    /// Returns `NotText` for draw bricks, otherwise see
    /// [`TextBrick::text_insert`].
    pub fn text_insert(&mut self, changes: &[TextChange]) -> Result<(), BrickError> {
        match self {
            Self::Draw(d) => Err(BrickError::NotText(d.id)),
            Self::Text(t) => t.text_insert(changes),
        }
    }

    fn canvas(&self) -> &DrawBrick {
        match self {
            Self::Draw(d) => d,
            Self::Text(t) => &t.canvas,
        }
    }

    fn canvas_mut(&mut self) -> &mut DrawBrick {
        match self {
            Self::Draw(d) => d,
            Self::Text(t) => &mut t.canvas,
        }
    }
}

#[cfg(test)]
#[path = "brick_test.rs"]
mod tests;
