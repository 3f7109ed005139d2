//! Documents manager — registry of live documents.
//!
//! DESIGN
//! ======
//! Each key maps to a shared `OnceCell` slot. The first caller for a key
//! loads the document from storage inside the cell's initializer; callers
//! arriving while the load is in flight await the same initializer, so a
//! document is loaded once and every caller receives the same handle.
//!
//! A failed load leaves the slot uninitialized. It is pruned once no other
//! caller holds it, so the next request starts a fresh load.
//!
//! CLOSING
//! =======
//! Seal → save (with retry) → evict → shut down. If the save fails the
//! document stays cached and is marked degraded; the idle sweeper seals it
//! again on its next pass, so the save is retried until it lands.
//!
//! From seal until the close finishes, the key carries a close marker.
//! `get_document` waits on it, then loads the freshly saved state, so a
//! client arriving mid-close joins the next incarnation of the document.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{OnceCell, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::message::{DocumentSnapshot, ErrorCode};
use crate::services::document::{Document, DocumentConfig, DocumentError, DocumentHandle, DocumentKey};
use crate::services::storage::{DocumentStore, RetryPolicy, StoreError, with_retry};

const DEFAULT_DOCUMENT_IDLE_SECS: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("stored document is invalid: {0}")]
    Corrupt(#[from] DocumentError),
}

impl ErrorCode for ManagerError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Store(e) => e.error_code(),
            Self::Corrupt(_) => "E_DOCUMENT_CORRUPT",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.retryable(),
            Self::Corrupt(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ManagerConfig {
    pub document: DocumentConfig,
    pub retry: RetryPolicy,
    /// How long a document must have no clients before the sweeper closes it.
    pub idle_after: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            document: DocumentConfig::default(),
            retry: RetryPolicy::default(),
            idle_after: Duration::from_secs(DEFAULT_DOCUMENT_IDLE_SECS),
        }
    }
}

type Slot = Arc<OnceCell<DocumentHandle>>;

/// Resolves (with `Err`) once the closing side drops its sender.
type CloseMarker = watch::Receiver<()>;

pub struct DocumentsManager {
    store: Arc<dyn DocumentStore>,
    documents: RwLock<HashMap<DocumentKey, Slot>>,
    closing: RwLock<HashMap<DocumentKey, CloseMarker>>,
    config: ManagerConfig,
}

impl DocumentsManager {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, config: ManagerConfig) -> Self {
        Self { store, documents: RwLock::new(HashMap::new()), closing: RwLock::new(HashMap::new()), config }
    }

    /// Return the live document for `key`, loading it on first use. Waits
    /// for an in-flight close of the same document to finish first.
    ///
    /// # Errors
    ///
    /// Returns the storage error after retries, or `Corrupt` if the stored
    /// snapshot cannot be rebuilt.
    pub async fn get_document(&self, key: &DocumentKey) -> Result<DocumentHandle, ManagerError> {
        self.wait_for_close(key).await;
        let slot = self.slot(key).await;
        let result = slot
            .get_or_try_init(|| self.open(key))
            .await
            .cloned();
        drop(slot);

        if let Err(e) = &result {
            error!(document = %key, code = e.error_code(), error = %e, "manager: document load failed");
            self.prune_failed(key).await;
        }
        result
    }

    /// Number of documents currently loaded.
    pub async fn document_count(&self) -> usize {
        self.documents
            .read()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    async fn wait_for_close(&self, key: &DocumentKey) {
        let marker = self.closing.read().await.get(key).cloned();
        if let Some(mut marker) = marker {
            debug!(document = %key, "manager: waiting for close to finish");
            // Never sent on; returns once the closer drops its sender.
            while marker.changed().await.is_ok() {}
        }
    }

    async fn slot(&self, key: &DocumentKey) -> Slot {
        if let Some(slot) = self.documents.read().await.get(key) {
            return slot.clone();
        }
        let mut documents = self.documents.write().await;
        documents.entry(key.clone()).or_default().clone()
    }

    async fn open(&self, key: &DocumentKey) -> Result<DocumentHandle, ManagerError> {
        let snapshot = with_retry(self.config.retry, "load", key, || self.store.load_document(key)).await?;
        let presence = self.config.document.presence_enabled;

        let document = match snapshot {
            Some(snapshot) => Document::load(key.clone(), &snapshot, presence)?,
            None => Document::new(key.clone(), presence),
        };
        info!(document = %key, rows = document.layout().len(), "manager: document loaded");
        Ok(DocumentHandle::spawn(document, &self.config.document))
    }

    async fn prune_failed(&self, key: &DocumentKey) {
        let mut documents = self.documents.write().await;
        let stale = documents
            .get(key)
            .is_some_and(|slot| !slot.initialized() && Arc::strong_count(slot) == 1);
        if stale {
            documents.remove(key);
        }
    }

    async fn loaded(&self) -> Vec<DocumentHandle> {
        self.documents
            .read()
            .await
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect()
    }

    // -------------------------------------------------------------------------
    // Closing
    // -------------------------------------------------------------------------

    /// Save and unload one document. `min_idle` restricts the close to
    /// documents that have had no clients for at least that long.
    ///
    /// Returns whether the document was closed.
    ///
    /// # Errors
    ///
    /// Returns the storage error if the final save fails. The document is
    /// then left loaded in the degraded state.
    pub async fn close_document(&self, key: &DocumentKey, min_idle: Option<Duration>) -> Result<bool, ManagerError> {
        let handle = self
            .documents
            .read()
            .await
            .get(key)
            .and_then(|slot| slot.get().cloned());
        match handle {
            Some(handle) => self.close_handle(&handle, min_idle).await,
            None => Ok(false),
        }
    }

    async fn close_handle(&self, handle: &DocumentHandle, min_idle: Option<Duration>) -> Result<bool, ManagerError> {
        let key = handle.key();
        let snapshot = match handle.seal(min_idle).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return Ok(false),
            Err(_) => {
                self.evict(handle).await;
                return Ok(true);
            }
        };

        let (closed, marker) = watch::channel(());
        self.closing.write().await.insert(key.clone(), marker);
        let result = self.save_and_evict(handle, &snapshot).await;
        self.closing.write().await.remove(key);
        drop(closed);
        result
    }

    async fn save_and_evict(&self, handle: &DocumentHandle, snapshot: &DocumentSnapshot) -> Result<bool, ManagerError> {
        let key = handle.key();
        let saved = with_retry(self.config.retry, "save", key, || self.store.save_document(key, snapshot)).await;
        match saved {
            Ok(()) => {
                self.evict(handle).await;
                handle.shutdown().await;
                info!(document = %key, "manager: document saved and closed");
                Ok(true)
            }
            Err(e) => {
                error!(document = %key, code = e.error_code(), error = %e, "manager: save failed; document degraded");
                handle.mark_degraded().await;
                Err(e.into())
            }
        }
    }

    async fn evict(&self, handle: &DocumentHandle) {
        let mut documents = self.documents.write().await;
        let same = documents
            .get(handle.key())
            .and_then(|slot| slot.get())
            .is_some_and(|current| current.same_document(handle));
        if same {
            documents.remove(handle.key());
        }
    }

    /// Close every document idle for at least the configured time, and
    /// retry saves of degraded documents. Returns how many were closed.
    pub async fn close_idle(&self) -> usize {
        let idle_after = self.config.idle_after;
        self.close_many(Some(idle_after)).await
    }

    /// Save and unload every document regardless of clients.
    pub async fn close_all(&self) -> usize {
        let closed = self.close_many(None).await;
        info!(closed, "manager: all documents closed");
        closed
    }

    async fn close_many(&self, min_idle: Option<Duration>) -> usize {
        let handles = self.loaded().await;
        let results = join_all(
            handles
                .iter()
                .map(|handle| self.close_handle(handle, min_idle)),
        )
        .await;
        // Failures are logged in close_handle.
        results
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count()
    }

    /// Run `close_idle` every `every` until the manager is dropped.
    #[must_use]
    pub fn spawn_idle_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        info!(every_ms = u64::try_from(every.as_millis()).unwrap_or(u64::MAX), "manager: idle sweeper configured");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.close_idle().await;
            }
        })
    }
}

#[cfg(test)]
#[path = "manager_test.rs"]
mod tests;
