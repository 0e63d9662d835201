//! Behaviour every storage provider must exhibit.
//!
//! Each provider's test module instantiates the whole suite with
//! [`conformance_tests!`], passing an expression that builds a fresh
//! provider together with any guard (such as a temp dir) that must outlive it.

use serde_json::json;

use crate::types::{Batch, BatchId};

use super::StorageProvider;

pub(crate) fn sample_batch(tag: &str) -> Batch {
    Batch::new(vec![
        json!({"msys": {"message_event": {"type": "delivery", "tag": tag}}}),
        json!({"msys": {"message_event": {"type": "open", "tag": tag}}}),
    ])
}

pub(crate) async fn store_then_retrieve<S: StorageProvider>(storage: &S) {
    let batch = sample_batch("a");
    let id = storage.store(&batch).await.unwrap();

    let record = storage.retrieve().await.unwrap().expect("stored batch");
    assert_eq!(record.id, id);
    assert_eq!(record.payload, batch);
}

pub(crate) async fn retrieve_empty_returns_none<S: StorageProvider>(storage: &S) {
    assert!(storage.retrieve().await.unwrap().is_none());
}

pub(crate) async fn release_forgets_batch<S: StorageProvider>(storage: &S) {
    storage.store(&sample_batch("a")).await.unwrap();

    let record = storage.retrieve().await.unwrap().expect("stored batch");
    storage.release(&record.id).await.unwrap();

    assert!(storage.retrieve().await.unwrap().is_none());

    // Requeueing a released id must not resurrect it.
    storage.requeue(&record.id).await.unwrap();
    assert!(storage.retrieve().await.unwrap().is_none());
}

pub(crate) async fn release_unknown_id_succeeds<S: StorageProvider>(storage: &S) {
    storage.release(&BatchId::new("no-such-batch")).await.unwrap();

    let id = storage.store(&sample_batch("a")).await.unwrap();
    storage.release(&id).await.unwrap();
    storage.release(&id).await.unwrap();
}

pub(crate) async fn release_pending_batch_without_retrieve<S: StorageProvider>(storage: &S) {
    let id = storage.store(&sample_batch("a")).await.unwrap();
    storage.release(&id).await.unwrap();
    assert!(storage.retrieve().await.unwrap().is_none());
}

pub(crate) async fn retrieve_is_fifo<S: StorageProvider>(storage: &S) {
    let mut ids = Vec::new();
    for tag in ["first", "second", "third"] {
        ids.push(storage.store(&sample_batch(tag)).await.unwrap());
    }

    for (expected_id, tag) in ids.iter().zip(["first", "second", "third"]) {
        let record = storage.retrieve().await.unwrap().expect("pending batch");
        assert_eq!(&record.id, expected_id);
        assert_eq!(record.payload, sample_batch(tag));
    }
    assert!(storage.retrieve().await.unwrap().is_none());
}

pub(crate) async fn checked_out_batch_not_returned_twice<S: StorageProvider>(storage: &S) {
    let a = storage.store(&sample_batch("a")).await.unwrap();
    let b = storage.store(&sample_batch("b")).await.unwrap();

    let first = storage.retrieve().await.unwrap().unwrap();
    let second = storage.retrieve().await.unwrap().unwrap();
    assert_eq!(first.id, a);
    assert_eq!(second.id, b);
    assert!(storage.retrieve().await.unwrap().is_none());
}

pub(crate) async fn requeue_restores_fifo_position<S: StorageProvider>(storage: &S) {
    let a = storage.store(&sample_batch("a")).await.unwrap();
    let b = storage.store(&sample_batch("b")).await.unwrap();

    let first = storage.retrieve().await.unwrap().unwrap();
    assert_eq!(first.id, a);

    storage.requeue(&first.id).await.unwrap();
    // Idempotent.
    storage.requeue(&first.id).await.unwrap();

    let again = storage.retrieve().await.unwrap().unwrap();
    assert_eq!(again.id, a);
    assert_eq!(again.payload, sample_batch("a"));

    let next = storage.retrieve().await.unwrap().unwrap();
    assert_eq!(next.id, b);
}

pub(crate) async fn ids_are_distinct<S: StorageProvider>(storage: &S) {
    let mut ids = std::collections::HashSet::new();
    for i in 0..20 {
        let id = storage.store(&sample_batch(&i.to_string())).await.unwrap();
        assert!(ids.insert(id), "store returned a duplicate id");
    }
}

macro_rules! conformance_tests {
    ($make:expr) => {
        #[tokio::test]
        async fn conformance_store_then_retrieve() {
            let (storage, _guard) = $make;
            $crate::storage::conformance::store_then_retrieve(&storage).await;
        }

        #[tokio::test]
        async fn conformance_retrieve_empty_returns_none() {
            let (storage, _guard) = $make;
            $crate::storage::conformance::retrieve_empty_returns_none(&storage).await;
        }

        #[tokio::test]
        async fn conformance_release_forgets_batch() {
            let (storage, _guard) = $make;
            $crate::storage::conformance::release_forgets_batch(&storage).await;
        }

        #[tokio::test]
        async fn conformance_release_unknown_id_succeeds() {
            let (storage, _guard) = $make;
            $crate::storage::conformance::release_unknown_id_succeeds(&storage).await;
        }

        #[tokio::test]
        async fn conformance_release_pending_batch_without_retrieve() {
            let (storage, _guard) = $make;
            $crate::storage::conformance::release_pending_batch_without_retrieve(&storage).await;
        }

        #[tokio::test]
        async fn conformance_retrieve_is_fifo() {
            let (storage, _guard) = $make;
            $crate::storage::conformance::retrieve_is_fifo(&storage).await;
        }

        #[tokio::test]
        async fn conformance_checked_out_batch_not_returned_twice() {
            let (storage, _guard) = $make;
            $crate::storage::conformance::checked_out_batch_not_returned_twice(&storage).await;
        }

        #[tokio::test]
        async fn conformance_requeue_restores_fifo_position() {
            let (storage, _guard) = $make;
            $crate::storage::conformance::requeue_restores_fifo_position(&storage).await;
        }

        #[tokio::test]
        async fn conformance_ids_are_distinct() {
            let (storage, _guard) = $make;
            $crate::storage::conformance::ids_are_distinct(&storage).await;
        }
    };
}

pub(crate) use conformance_tests;
