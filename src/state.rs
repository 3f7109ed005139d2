//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the process configuration and the documents manager. All live
//! document content sits behind the manager; handlers never touch it
//! directly.

use std::sync::Arc;

use crate::config::Config;
use crate::services::manager::DocumentsManager;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub documents: Arc<DocumentsManager>,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config, documents: Arc<DocumentsManager>) -> Self {
        Self { config: Arc::new(config), documents }
    }
}
