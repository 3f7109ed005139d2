//! Domain services used by the websocket route.
//!
//! ARCHITECTURE
//! ============
//! Service modules own document content, lifecycle, and persistence so the
//! route handler can stay focused on protocol translation and connection
//! state.

pub mod brick;
pub mod document;
pub mod manager;
pub mod presence;
pub mod storage;
