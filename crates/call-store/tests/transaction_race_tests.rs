//! Concurrency tests for optimistic transactions on the memory backend.
//!
//! Verifies the compare-and-swap guarantee the matcher relies on: when many
//! producers race to claim the same document, exactly one commit wins and
//! every loser observes a conflict (or the changed state on retry).

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use call_store::{
    DocPath, DocumentStore, FieldValue, Fields, MemoryStore, SharedStore, Transaction,
    DEFAULT_MAX_ATTEMPTS,
};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn status(value: &str) -> Fields {
    Fields::from([("status".to_string(), FieldValue::value(value))])
}

/// Claim `path` if it is still `waiting`. Returns true if this caller won.
async fn try_claim(store: &SharedStore, path: &DocPath, claimant: u32) -> bool {
    for _ in 0..DEFAULT_MAX_ATTEMPTS {
        let mut tx = Transaction::new(store.as_ref());
        let Some(snapshot) = tx.get(path).await.unwrap() else {
            return false;
        };
        if snapshot.field("status") != Some(&json!("waiting")) {
            return false;
        }
        tx.update(
            path.clone(),
            Fields::from([
                ("status".to_string(), FieldValue::value("matched")),
                ("claimant".to_string(), FieldValue::value(claimant)),
            ]),
        );
        match tx.commit().await {
            Ok(()) => return true,
            Err(e) if e.is_conflict() => continue,
            Err(e) => panic!("unexpected store error: {e}"),
        }
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exactly_one_of_many_racing_claims_wins() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let path = DocPath::new("queue", "target").unwrap();
    store.set(path.clone(), status("waiting")).await.unwrap();

    let wins = Arc::new(AtomicU32::new(0));
    let mut handles = Vec::new();
    for claimant in 0..16 {
        let store = Arc::clone(&store);
        let path = path.clone();
        let wins = Arc::clone(&wins);
        handles.push(tokio::spawn(async move {
            if try_claim(&store, &path, claimant).await {
                wins.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(wins.load(Ordering::SeqCst), 1);
    let snapshot = store.get(&path).await.unwrap().unwrap();
    assert_eq!(snapshot.field("status"), Some(&json!("matched")));
}

#[tokio::test]
async fn test_claim_of_deleted_document_aborts_cleanly() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let path = DocPath::new("queue", "gone").unwrap();
    store.set(path.clone(), status("waiting")).await.unwrap();
    store.delete(path.clone()).await.unwrap();

    assert!(!try_claim(&store, &path, 1).await);
    assert!(store.get(&path).await.unwrap().is_none());
}
