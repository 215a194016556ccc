//! Contract tests every `StorageBackend` must pass.
//!
//! The same assertions run against the in-memory and local filesystem
//! backends so the engine can rely on identical conditional-write semantics.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;

use bytes::Bytes;
use spool_core::prelude::*;

async fn put_if_absent_is_exclusive(storage: Arc<dyn StorageBackend>) {
    let first = storage
        .put("c/once", Bytes::from("a"), WritePrecondition::DoesNotExist)
        .await
        .expect("put");
    assert!(first.is_success());

    let second = storage
        .put("c/once", Bytes::from("b"), WritePrecondition::DoesNotExist)
        .await
        .expect("put");
    assert!(!second.is_success());
    assert_eq!(storage.get("c/once").await.expect("get"), Bytes::from("a"));
}

async fn version_tokens_drive_cas(storage: Arc<dyn StorageBackend>) {
    let WriteResult::Success { version } = storage
        .put("c/cas", Bytes::from("1"), WritePrecondition::None)
        .await
        .expect("put")
    else {
        panic!("unconditional put must succeed");
    };

    let head = storage.head("c/cas").await.expect("head").expect("exists");
    assert_eq!(head.version, version);

    let updated = storage
        .put(
            "c/cas",
            Bytes::from("2"),
            WritePrecondition::MatchesVersion(version.clone()),
        )
        .await
        .expect("put");
    assert!(updated.is_success());

    let stale = storage
        .put(
            "c/cas",
            Bytes::from("3"),
            WritePrecondition::MatchesVersion(version),
        )
        .await
        .expect("put");
    let WriteResult::PreconditionFailed { current_version } = stale else {
        panic!("stale version must be rejected");
    };
    let head = storage.head("c/cas").await.expect("head").expect("exists");
    assert_eq!(head.version, current_version);
}

async fn lease_exclusion_holds(storage: Arc<dyn StorageBackend>) {
    let manager = LeaseManager::new(storage, std::time::Duration::from_secs(30));
    let AcquireOutcome::Acquired(lease) = manager
        .try_acquire("leases/contract.json", &WorkerId::new("a"))
        .await
        .expect("acquire")
    else {
        panic!("first acquire must win");
    };
    let outcome = manager
        .try_acquire("leases/contract.json", &WorkerId::new("b"))
        .await
        .expect("acquire");
    assert!(matches!(outcome, AcquireOutcome::Held { .. }));
    lease.release().await.expect("release");
}

#[tokio::test]
async fn memory_backend_meets_contract() {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    put_if_absent_is_exclusive(storage.clone()).await;
    version_tokens_drive_cas(storage.clone()).await;
    lease_exclusion_holds(storage).await;
}

#[tokio::test]
async fn local_fs_backend_meets_contract() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage: Arc<dyn StorageBackend> =
        Arc::new(LocalFsBackend::open(dir.path()).expect("open"));
    put_if_absent_is_exclusive(storage.clone()).await;
    version_tokens_drive_cas(storage.clone()).await;
    lease_exclusion_holds(storage).await;
}
