//! Storage service — durable document snapshots.
//!
//! DESIGN
//! ======
//! `DocumentStore` is the seam between live documents and durable state.
//! A document is stored as one JSONB row keyed by `(project_id,
//! document_id)`; the row holds the `save()` form of the document, so open
//! strokes never reach storage.
//!
//! Two implementations ship: `PgDocumentStore` for production and
//! `MemoryDocumentStore` for local runs without `DATABASE_URL` and for
//! tests. Callers reach storage through `with_retry`, which bounds each
//! attempt with a timeout and backs off exponentially between attempts.
//!
//! ERROR HANDLING
//! ==============
//! Connection failures and timeouts are retryable. A stored snapshot that
//! no longer deserializes is not: retrying cannot fix it, and the document
//! must not be silently replaced with an empty one.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::warn;

use crate::message::{DocumentSnapshot, ErrorCode};
use crate::services::document::DocumentKey;

const DEFAULT_STORAGE_RETRIES: usize = 3;
const DEFAULT_STORAGE_RETRY_BASE_MS: u64 = 50;
const DEFAULT_STORAGE_TIMEOUT_MS: u64 = 5000;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("snapshot encoding error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Database(_) => "E_DATABASE",
            Self::Serialization(_) => "E_SNAPSHOT_ENCODING",
            Self::Timeout(_) => "E_STORAGE_TIMEOUT",
            Self::Unavailable(_) => "E_STORAGE_UNAVAILABLE",
        }
    }

    fn retryable(&self) -> bool {
        !matches!(self, Self::Serialization(_))
    }
}

/// Durable home of document snapshots.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// `Ok(None)` means the document has never been saved.
    async fn load_document(&self, key: &DocumentKey) -> Result<Option<DocumentSnapshot>, StoreError>;

    async fn save_document(&self, key: &DocumentKey, snapshot: &DocumentSnapshot) -> Result<(), StoreError>;
}

/// Attempts, backoff base, and per-attempt timeout for storage calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub base: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_STORAGE_RETRIES,
            base: Duration::from_millis(DEFAULT_STORAGE_RETRY_BASE_MS),
            timeout: Duration::from_millis(DEFAULT_STORAGE_TIMEOUT_MS),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`: `base * 2^(attempt - 1)`.
    #[must_use]
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX).min(16);
        self.base.saturating_mul(1 << exponent)
    }
}

/// Run a storage call under `policy`.
///
/// # Errors
///
/// Returns the last error once attempts are exhausted, or the first
/// non-retryable error.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, what: &str, key: &DocumentKey, mut call: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = match tokio::time::timeout(policy.timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(policy.timeout)),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && e.retryable() => {
                let delay = policy.backoff(attempt);
                warn!(
                    document = %key,
                    op = what,
                    attempt,
                    total = attempts,
                    code = e.error_code(),
                    error = %e,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "storage call failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// =============================================================================
// POSTGRES
// =============================================================================

pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn load_document(&self, key: &DocumentKey) -> Result<Option<DocumentSnapshot>, StoreError> {
        let row = sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT snapshot FROM documents WHERE project_id = $1 AND document_id = $2",
        )
        .bind(&key.project_id)
        .bind(&key.document_id)
        .fetch_optional(&self.pool)
        .await?;

        // Decode outside sqlx so a corrupt row surfaces as non-retryable.
        row.map(serde_json::from_value)
            .transpose()
            .map_err(StoreError::from)
    }

    async fn save_document(&self, key: &DocumentKey, snapshot: &DocumentSnapshot) -> Result<(), StoreError> {
        let snapshot = serde_json::to_value(snapshot)?;
        sqlx::query(
            "INSERT INTO documents (project_id, document_id, snapshot, updated_at) \
             VALUES ($1, $2, $3, now()) \
             ON CONFLICT (project_id, document_id) DO UPDATE SET \
             snapshot = EXCLUDED.snapshot, updated_at = now()",
        )
        .bind(&key.project_id)
        .bind(&key.document_id)
        .bind(&snapshot)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// =============================================================================
// MEMORY
// =============================================================================

/// In-process store. Contents are lost on exit.
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<HashMap<DocumentKey, DocumentSnapshot>>,
}

impl MemoryDocumentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a snapshot in place without going through `save_document`.
    pub async fn seed(&self, key: DocumentKey, snapshot: DocumentSnapshot) {
        self.documents.lock().await.insert(key, snapshot);
    }

    pub async fn stored(&self, key: &DocumentKey) -> Option<DocumentSnapshot> {
        self.documents.lock().await.get(key).cloned()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn load_document(&self, key: &DocumentKey) -> Result<Option<DocumentSnapshot>, StoreError> {
        Ok(self.documents.lock().await.get(key).cloned())
    }

    async fn save_document(&self, key: &DocumentKey, snapshot: &DocumentSnapshot) -> Result<(), StoreError> {
        self.documents
            .lock()
            .await
            .insert(key.clone(), snapshot.clone());
        Ok(())
    }
}


#[cfg(test)]
#[path = "storage_test.rs"]
mod tests;
