//! Concurrency integration tests.
//!
//! Many tasks race on the same document through the in-memory store, whose
//! reads yield to the scheduler so transactions interleave between their
//! read and their commit:
//!
//! - Concurrent rotations of one token have exactly one winner
//! - Concurrent revocations of one token have exactly one winner
//! - Concurrent generation bumps never lose an increment

#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::Duration;
use idproxy_auth::{
    AccessGenerationConfig, AccessGenerationStore, RefreshTokenRecord, RefreshTokenStore,
    StoreError,
};
use idproxy_runtime::RetryPolicy;
use idproxy_testing::{InMemoryDocumentStore, test_clock, test_instant};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const CONTENDERS: usize = 16;

fn token_store(db: &InMemoryDocumentStore) -> RefreshTokenStore {
    RefreshTokenStore::new(Arc::new(db.clone()), Arc::new(test_clock()))
}

fn record(id: &str) -> RefreshTokenRecord {
    RefreshTokenRecord::new(id, "user-1", format!("digest-{id}"))
        .with_expires_at(test_instant() + Duration::hours(24))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_replace_has_single_winner() {
    let db = InMemoryDocumentStore::new();
    let store = token_store(&db);
    store.create(record("rt-1")).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..CONTENDERS {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .replace("rt-1", record(&format!("rt-next-{i}")), test_instant())
                .await
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(successor) => winners.push(successor.refresh_id),
            Err(e) => assert!(matches!(e, StoreError::Conflict(_)), "unexpected error: {e}"),
        }
    }

    assert_eq!(winners.len(), 1);
    assert_eq!(db.count("refresh_tokens"), 2, "no duplicate successor");
    let old = store.get_by_id("rt-1").await.unwrap();
    assert_eq!(old.replaced_by, winners[0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_revoke_has_single_winner() {
    let db = InMemoryDocumentStore::new();
    let store = token_store(&db);
    store.create(record("rt-1")).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..CONTENDERS {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.revoke("rt-1", &format!("reason-{i}"), test_instant()).await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => successes += 1,
            Err(e) => assert_eq!(e, StoreError::AlreadyRevoked),
        }
    }
    assert_eq!(successes, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_bumps_lose_no_updates() {
    let db = InMemoryDocumentStore::new();
    let config = AccessGenerationConfig::default().with_bump_retry(
        RetryPolicy::builder()
            .max_attempts(CONTENDERS * 2)
            .initial_delay(std::time::Duration::from_millis(1))
            .max_delay(std::time::Duration::from_millis(10))
            .build(),
    );
    let store = AccessGenerationStore::with_config(Arc::new(db.clone()), Arc::new(test_clock()), config);
    let cancel = CancellationToken::new();

    let mut handles = Vec::new();
    for _ in 0..CONTENDERS {
        let store = store.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            store.bump_with_retry("user-1", None, &cancel).await
        }));
    }

    let mut generations = Vec::new();
    for handle in handles {
        generations.push(handle.await.unwrap().unwrap());
    }
    generations.sort_unstable();

    assert_eq!(generations, (1..=CONTENDERS as u64).collect::<Vec<_>>());
    assert_eq!(store.current("user-1").await.unwrap(), CONTENDERS as u64);
}

#[tokio::test]
async fn test_cancel_during_backoff_returns_promptly() {
    let db = InMemoryDocumentStore::new();
    let config = AccessGenerationConfig::default().with_bump_retry(
        RetryPolicy::builder()
            .max_attempts(5)
            .initial_delay(std::time::Duration::from_secs(60))
            .build(),
    );
    let store = AccessGenerationStore::with_config(Arc::new(db.clone()), Arc::new(test_clock()), config);
    db.fail_next_commit(idproxy_core::DocumentStoreError::Unavailable("down".into()));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        store.bump_with_retry("user-1", None, &cancel),
    )
    .await
    .expect("cancellation should interrupt the backoff sleep");

    assert_eq!(result, Err(StoreError::Cancelled));
    assert_eq!(store.current("user-1").await.unwrap(), 0);
}
