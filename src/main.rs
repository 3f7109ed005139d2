use std::sync::Arc;

use brickboard::config::Config;
use brickboard::services::manager::DocumentsManager;
use brickboard::services::storage::{DocumentStore, MemoryDocumentStore, PgDocumentStore};
use brickboard::{db, routes, state};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    let config = Config::from_env();

    let store: Arc<dyn DocumentStore> = match &config.database_url {
        Some(url) => {
            let pool = db::init_pool(url).await.expect("database init failed");
            Arc::new(PgDocumentStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; documents are kept in memory only");
            Arc::new(MemoryDocumentStore::new())
        }
    };

    let documents = Arc::new(DocumentsManager::new(store, config.manager));
    let _sweeper = documents.spawn_idle_sweeper(config.idle_sweep);

    let port = config.port;
    let state = state::AppState::new(config, documents.clone());
    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "brickboard listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(documents))
        .await
        .expect("server failed");
}

/// Wait for ctrl-c, then save and unload every live document.
async fn shutdown_signal(documents: Arc<DocumentsManager>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested; closing documents");
    documents.close_all().await;
}
