use super::*;
use crate::message::{BrickKind, ClientInfo, DocumentSnapshot, InsertBrick, ServerMessage};
use crate::services::document::Operation;
use crate::services::storage::test_helpers::InstrumentedStore;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

fn fast_config() -> ManagerConfig {
    ManagerConfig {
        retry: RetryPolicy { attempts: 2, base: Duration::from_millis(1), timeout: Duration::from_millis(500) },
        idle_after: Duration::ZERO,
        ..ManagerConfig::default()
    }
}

fn manager() -> (Arc<InstrumentedStore>, Arc<DocumentsManager>) {
    let store = Arc::new(InstrumentedStore::new());
    let manager = Arc::new(DocumentsManager::new(store.clone(), fast_config()));
    (store, manager)
}

fn key(doc: &str) -> DocumentKey {
    DocumentKey::new("project", doc)
}

fn client() -> ClientInfo {
    ClientInfo { user_unique_id: Uuid::new_v4(), id: "user-1".into(), name: "Ada".into(), color: "#009688".into() }
}

fn insert_row() -> Operation {
    Operation::InsertBrick(InsertBrick { brick_type: BrickKind::Draw, height_index: 0, column_index: None })
}

/// Connect a client, insert one brick, and wait until the broadcast lands.
async fn edit_once(handle: &DocumentHandle) -> (ClientInfo, mpsc::Receiver<ServerMessage>) {
    let info = client();
    let (tx, mut rx) = mpsc::channel(64);
    handle.connect(info.clone(), tx).await.unwrap();
    handle.apply(info.author(), insert_row()).await.unwrap();
    loop {
        let message = timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("message receive timed out")
            .expect("channel closed");
        if matches!(message, ServerMessage::InsertedBrick(_)) {
            break;
        }
    }
    (info, rx)
}

// =============================================================================
// get_document
// =============================================================================

#[tokio::test]
async fn missing_document_starts_empty() {
    let (store, manager) = manager();
    let handle = manager.get_document(&key("d")).await.unwrap();
    assert_eq!(handle.lean().await.unwrap(), DocumentSnapshot::default());
    assert_eq!(store.load_count(), 1);
}

#[tokio::test]
async fn concurrent_get_document_loads_once() {
    let (store, manager) = manager();
    store.set_load_delay(Duration::from_millis(50)).await;

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_document(&key("shared")).await })
        })
        .collect();

    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap().unwrap());
    }
    assert!(handles.iter().all(|h| h.same_document(&handles[0])));
    assert_eq!(store.load_count(), 1);
    assert_eq!(manager.document_count().await, 1);
}

#[tokio::test]
async fn corrupt_snapshot_fails_and_is_not_cached() {
    let (store, manager) = manager();
    let handle = manager.get_document(&key("src")).await.unwrap();
    edit_once(&handle).await;
    let mut snapshot = handle.lean().await.unwrap();
    snapshot.bricks.push(snapshot.bricks[0].clone());
    store.seed(key("bad"), snapshot).await;

    let err = manager.get_document(&key("bad")).await.err().unwrap();
    assert_eq!(err.error_code(), "E_DOCUMENT_CORRUPT");
    assert!(!err.retryable());

    assert!(manager.get_document(&key("bad")).await.is_err());
    assert_eq!(store.load_count(), 3);
    assert_eq!(manager.document_count().await, 1);
}

// =============================================================================
// close
// =============================================================================

#[tokio::test]
async fn close_saves_and_evicts() {
    let (store, manager) = manager();
    let handle = manager.get_document(&key("d")).await.unwrap();
    let (info, _rx) = edit_once(&handle).await;
    handle.disconnect(info.user_unique_id).await;

    assert!(manager.close_document(&key("d"), None).await.unwrap());
    assert_eq!(manager.document_count().await, 0);
    let stored = store.stored(&key("d")).await.unwrap();
    assert_eq!(stored.bricks.len(), 1);

    let reopened = manager.get_document(&key("d")).await.unwrap();
    assert!(!reopened.same_document(&handle));
    assert_eq!(reopened.lean().await.unwrap(), stored);
    assert_eq!(store.load_count(), 2);
}

#[tokio::test]
async fn close_unknown_document_is_noop() {
    let (store, manager) = manager();
    assert!(!manager.close_document(&key("nope"), None).await.unwrap());
    assert_eq!(store.save_count(), 0);
}

#[tokio::test]
async fn save_failure_leaves_document_degraded_and_cached() {
    let (store, manager) = manager();
    let handle = manager.get_document(&key("d")).await.unwrap();
    edit_once(&handle).await;

    store.fail_next_saves(10);
    let err = manager.close_document(&key("d"), None).await.unwrap_err();
    assert_eq!(err.error_code(), "E_STORAGE_UNAVAILABLE");
    assert_eq!(manager.document_count().await, 1);

    let (tx, _rx) = mpsc::channel(8);
    let err = handle.connect(client(), tx).await.unwrap_err();
    assert!(matches!(err, DocumentError::Degraded));

    // Once storage recovers the sweeper's pass saves it despite connected clients.
    store.fail_next_saves(0);
    assert_eq!(manager.close_idle().await, 1);
    assert_eq!(manager.document_count().await, 0);
    assert_eq!(store.stored(&key("d")).await.unwrap().bricks.len(), 1);
}

#[tokio::test]
async fn close_idle_skips_documents_with_clients() {
    let (store, manager) = manager();
    let busy = manager.get_document(&key("busy")).await.unwrap();
    let (_info, _rx) = edit_once(&busy).await;
    manager.get_document(&key("idle")).await.unwrap();

    assert_eq!(manager.close_idle().await, 1);
    assert_eq!(manager.document_count().await, 1);
    assert!(store.stored(&key("idle")).await.is_some());
    assert!(store.stored(&key("busy")).await.is_none());
}

#[tokio::test]
async fn close_all_closes_documents_with_clients() {
    let (store, manager) = manager();
    let handle = manager.get_document(&key("d")).await.unwrap();
    let (_info, mut rx) = edit_once(&handle).await;

    assert_eq!(manager.close_all().await, 1);
    assert_eq!(manager.document_count().await, 0);
    assert!(store.stored(&key("d")).await.is_some());

    // The document task is gone, so the client's queue closes.
    let closed = timeout(Duration::from_millis(500), rx.recv()).await.unwrap();
    assert!(closed.is_none());
}

#[tokio::test]
async fn overlapping_closes_save_once() {
    let (store, manager) = manager();
    let handle = manager.get_document(&key("d")).await.unwrap();
    let (_info, _rx) = edit_once(&handle).await;
    store.set_save_delay(Duration::from_millis(50)).await;

    let d = key("d");
    let (all, one) = tokio::join!(manager.close_all(), manager.close_document(&d, None));
    assert_eq!(all + usize::from(one.unwrap()), 1);
    assert_eq!(store.save_count(), 1);
    assert_eq!(manager.document_count().await, 0);
}

#[tokio::test]
async fn get_document_during_close_waits_for_fresh_load() {
    let (store, manager) = manager();
    let handle = manager.get_document(&key("d")).await.unwrap();
    let (info, _rx) = edit_once(&handle).await;
    handle.disconnect(info.user_unique_id).await;
    store.set_save_delay(Duration::from_millis(200)).await;

    let closer = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.close_document(&key("d"), None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let reopened = manager.get_document(&key("d")).await.unwrap();
    assert!(closer.await.unwrap().unwrap());
    assert!(!reopened.same_document(&handle));
    assert_eq!(reopened.lean().await.unwrap().bricks.len(), 1);
    assert_eq!(store.load_count(), 2);

    let (tx, _rx) = mpsc::channel(8);
    reopened.connect(client(), tx).await.unwrap();
}

#[tokio::test]
async fn idle_sweeper_closes_idle_documents() {
    let (store, manager) = manager();
    manager.get_document(&key("d")).await.unwrap();

    let sweeper = manager.spawn_idle_sweeper(Duration::from_millis(10));
    let closed = timeout(Duration::from_millis(1000), async {
        while manager.document_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    sweeper.abort();

    assert!(closed.is_ok(), "sweeper should close the idle document");
    assert!(store.stored(&key("d")).await.is_some());
}
