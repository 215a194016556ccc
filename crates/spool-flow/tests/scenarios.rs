//! End-to-end behavior of the engine: generation, cache hits, crash
//! recovery and cancellation.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use spool_core::lease::LeaseInfo;
use spool_core::{SpoolPaths, StorageBackend, TaskId, WorkerId, WritePrecondition};
use spool_flow::checkpoint::{CheckpointStore, GenerationCheckpoint};
use spool_flow::chunk_log::ChunkLog;
use spool_flow::fingerprint::fingerprint;
use spool_flow::generator::GeneratorRegistry;
use spool_flow::prelude::*;
use spool_test_utils::{SCRIPTED_PROVIDER, ScriptedGenerator, TestEngine, init_test_logging};

const TEXT: &str = "Hi there";

fn hello() -> GenerationRequest {
    GenerationRequest::new("Hello", SCRIPTED_PROVIDER)
}

fn payloads(page: &ChunkPage) -> Vec<&str> {
    page.chunks.iter().map(|c| c.payload.as_str()).collect()
}

/// Writes the durable state a worker leaves behind when it dies after
/// persisting chunk 0 of "Hi there".
async fn seed_half_persisted(t: &TestEngine) -> TaskId {
    let storage = Arc::clone(&t.storage) as Arc<dyn StorageBackend>;
    let generators =
        GeneratorRegistry::new().with(SCRIPTED_PROVIDER, Arc::clone(&t.generator) as _);
    let params = hello().normalize(&generators).expect("normalize");

    let mut task = Task::new(TaskId::generate(), fingerprint(&params).expect("fp"), params);
    task.status = TaskStatus::Persisting;
    task.total_chunks = Some(2);
    task.cursor = 1;
    t.engine.registry().create(&task).await.expect("create");

    CheckpointStore::new(Arc::clone(&storage))
        .save_generation(&GenerationCheckpoint {
            task_id: task.id,
            text: TEXT.into(),
            provider: SCRIPTED_PROVIDER.into(),
            model: "scripted-1".into(),
            produced_at: chrono::Utc::now(),
        })
        .await
        .expect("checkpoint");
    ChunkLog::new(storage, t.engine.registry().clone())
        .append(&task.id, 0, "Hi ")
        .await
        .expect("chunk 0");
    task.id
}

#[tokio::test]
async fn submit_generates_and_persists_chunks() {
    init_test_logging();
    let t = TestEngine::new(TEXT);

    let receipt = t.engine.submit(hello()).await.expect("submit");
    assert!(!receipt.cache_hit);
    assert!(!receipt.joined);
    assert_eq!(
        t.engine.get_status(&receipt.task_id).await.expect("status").status,
        TaskStatus::Created
    );

    t.drain().await;

    let status = t.engine.get_status(&receipt.task_id).await.expect("status");
    assert_eq!(status.status, TaskStatus::Completed);
    assert_eq!(status.cursor, 2);
    assert_eq!(status.total_chunks, Some(2));
    assert!(status.error.is_none());

    let page = t.engine.get_chunks(&receipt.task_id, 0).await.expect("chunks");
    assert_eq!(payloads(&page), vec!["Hi ", "there"]);
    assert!(page.done);
    assert_eq!(t.generator.calls(), 1);
}

#[tokio::test]
async fn generation_walks_every_pipeline_stage() {
    let (generator, gate) = ScriptedGenerator::new(TEXT).gated();
    let t = TestEngine::with_generator(generator);
    let receipt = t.engine.submit(hello()).await.expect("submit");
    let task_id = receipt.task_id;

    let engine = t.engine.clone();
    let drive = tokio::spawn(async move {
        engine
            .orchestrator()
            .drive(task_id, &WorkerId::new("w"))
            .await
    });
    t.generator.wait_for_calls(1).await;
    let status = t.engine.get_status(&task_id).await.expect("status");
    assert_eq!(status.status, TaskStatus::Generating);
    assert_eq!(status.total_chunks, None);

    gate.open();
    let outcome = drive.await.expect("join").expect("drive");
    assert_eq!(outcome, DriveOutcome::Settled(TaskStatus::Completed));

    let mut observed: Vec<TaskStatus> = t
        .storage
        .write_history(&SpoolPaths::task_record(&task_id))
        .iter()
        .map(|data| serde_json::from_slice::<Task>(data).expect("record").status)
        .collect();
    observed.dedup();
    assert_eq!(
        observed,
        vec![
            TaskStatus::Created,
            TaskStatus::Validating,
            TaskStatus::Generating,
            TaskStatus::Persisting,
            TaskStatus::Completed,
        ]
    );
}

#[tokio::test]
async fn identical_resubmission_is_served_from_cache() {
    let t = TestEngine::new(TEXT);
    let first = t.engine.submit(hello()).await.expect("submit");
    t.drain().await;
    let before = t.engine.cache_stats().await.expect("stats");

    let second = t.engine.submit(hello()).await.expect("resubmit");
    assert!(second.cache_hit);
    assert_ne!(second.task_id, first.task_id);
    assert_eq!(second.result.as_deref(), Some(TEXT));

    let status = t.engine.get_status(&second.task_id).await.expect("status");
    assert_eq!(status.status, TaskStatus::Completed);
    assert_eq!(status.cursor, 2);
    assert!(status.cache_hit);
    let page = t.engine.get_chunks(&second.task_id, 0).await.expect("chunks");
    assert_eq!(payloads(&page), vec!["Hi ", "there"]);

    let after = t.engine.cache_stats().await.expect("stats");
    assert_eq!(after.hits, before.hits + 1);
    assert_eq!(after.entries, 1);
    assert_eq!(t.generator.calls(), 1);
}

#[tokio::test]
async fn normalization_makes_cosmetic_differences_hit_the_cache() {
    let t = TestEngine::new(TEXT);
    t.engine.submit(hello()).await.expect("submit");
    t.drain().await;

    let resubmit = GenerationRequest::new("  Hello\n", "  SCRIPTED ");
    let receipt = t.engine.submit(resubmit).await.expect("submit");
    assert!(receipt.cache_hit);
    assert_eq!(t.generator.calls(), 1);
}

#[tokio::test]
async fn crashed_worker_is_recovered_without_regenerating() {
    init_test_logging();
    let t = TestEngine::new(TEXT);
    let task_id = seed_half_persisted(&t).await;

    let expired = LeaseInfo::new("crashed-worker", Duration::ZERO, 4);
    t.storage
        .put(
            &SpoolPaths::task_lease(&task_id),
            Bytes::from(serde_json::to_vec(&expired).expect("encode")),
            WritePrecondition::DoesNotExist,
        )
        .await
        .expect("lease");

    t.drain().await;

    assert_eq!(t.generator.calls(), 0);
    let status = t.engine.get_status(&task_id).await.expect("status");
    assert_eq!(status.status, TaskStatus::Completed);
    assert_eq!(status.cursor, 2);
    let page = t.engine.get_chunks(&task_id, 0).await.expect("chunks");
    assert_eq!(payloads(&page), vec!["Hi ", "there"]);

    // Chunk 0 was never rewritten.
    let chunk0 = SpoolPaths::chunk(&task_id, 0);
    let rewrites = t
        .storage
        .operations_under(&chunk0)
        .into_iter()
        .filter(|op| matches!(op, spool_test_utils::StorageOp::Put { .. }))
        .count();
    assert_eq!(rewrites, 1);
}

#[tokio::test]
async fn live_lease_blocks_other_workers() {
    let t = TestEngine::new(TEXT);
    let task_id = seed_half_persisted(&t).await;

    let live = LeaseInfo::new("other-worker", Duration::from_secs(60), 1);
    t.storage
        .put(
            &SpoolPaths::task_lease(&task_id),
            Bytes::from(serde_json::to_vec(&live).expect("encode")),
            WritePrecondition::DoesNotExist,
        )
        .await
        .expect("lease");

    let outcome = t
        .engine
        .orchestrator()
        .drive(task_id, &WorkerId::new("w"))
        .await
        .expect("drive");
    assert_eq!(
        outcome,
        DriveOutcome::Busy {
            holder_id: "other-worker".into()
        }
    );
    assert_eq!(
        t.engine.get_status(&task_id).await.expect("status").status,
        TaskStatus::Persisting
    );
}

#[tokio::test]
async fn worker_that_loses_its_lease_stops_writing() {
    init_test_logging();
    let (generator, gate) = ScriptedGenerator::new(TEXT).gated();
    let t = TestEngine::with_generator(generator);
    let receipt = t.engine.submit(hello()).await.expect("submit");
    let task_id = receipt.task_id;

    let engine = t.engine.clone();
    let drive = tokio::spawn(async move {
        engine
            .orchestrator()
            .drive(task_id, &WorkerId::new("evicted"))
            .await
    });
    t.generator.wait_for_calls(1).await;

    // Another worker takes the lease while generation is in flight.
    let stolen = LeaseInfo::new("usurper", Duration::from_secs(60), 7);
    t.storage
        .put(
            &SpoolPaths::task_lease(&task_id),
            Bytes::from(serde_json::to_vec(&stolen).expect("encode")),
            WritePrecondition::None,
        )
        .await
        .expect("steal");
    let writes_before = t.storage.write_history(&SpoolPaths::task_record(&task_id)).len();

    let outcome = tokio::time::timeout(Duration::from_secs(5), drive)
        .await
        .expect("heartbeat notices the takeover")
        .expect("join")
        .expect("drive");
    assert_eq!(outcome, DriveOutcome::LeaseLost);

    gate.open();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = t.engine.get_status(&task_id).await.expect("status");
    assert_eq!(status.status, TaskStatus::Generating);
    assert_eq!(status.cursor, 0);
    assert_eq!(
        t.storage.write_history(&SpoolPaths::task_record(&task_id)).len(),
        writes_before
    );
    assert!(t.storage.paths(&SpoolPaths::chunks_prefix(&task_id)).await.is_empty());
    assert!(
        t.storage
            .head(&SpoolPaths::generation(&task_id))
            .await
            .expect("head")
            .is_none()
    );

    let lease: LeaseInfo = serde_json::from_slice(
        &t.storage
            .get(&SpoolPaths::task_lease(&task_id))
            .await
            .expect("lease"),
    )
    .expect("decode");
    assert_eq!(lease.holder_id, "usurper");
    assert_eq!(t.generator.calls(), 1);
}

#[tokio::test]
async fn cancel_after_first_chunk_stops_before_the_second() {
    let t = TestEngine::new(TEXT);
    let task_id = seed_half_persisted(&t).await;

    let ack = t.engine.cancel(&task_id).await.expect("cancel");
    assert!(ack.accepted);
    assert_eq!(ack.fence, 1);

    t.drain().await;

    let status = t.engine.get_status(&task_id).await.expect("status");
    assert_eq!(status.status, TaskStatus::Cancelled);
    assert_eq!(status.cursor, 1);
    let page = t.engine.get_chunks(&task_id, 0).await.expect("chunks");
    assert_eq!(payloads(&page), vec!["Hi "]);
    assert!(page.done);
    assert!(
        t.storage
            .head(&SpoolPaths::chunk(&task_id, 1))
            .await
            .expect("head")
            .is_none()
    );
}

#[tokio::test]
async fn cancelling_a_terminal_task_is_rejected() {
    let t = TestEngine::new(TEXT);
    let receipt = t.engine.submit(hello()).await.expect("submit");
    t.drain().await;

    let ack = t.engine.cancel(&receipt.task_id).await.expect("cancel");
    assert!(!ack.accepted);
    assert_eq!(ack.fence, 2);
    assert_eq!(
        t.engine.get_status(&receipt.task_id).await.expect("status").status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn cancel_during_generation_discards_the_result() {
    let (generator, gate) = ScriptedGenerator::new(TEXT).gated();
    let t = TestEngine::with_generator(generator);
    let receipt = t.engine.submit(hello()).await.expect("submit");

    let engine = t.engine.clone();
    let task_id = receipt.task_id;
    let drive = tokio::spawn(async move {
        engine
            .orchestrator()
            .drive(task_id, &WorkerId::new("w"))
            .await
    });
    t.generator.wait_for_calls(1).await;

    let ack = t.engine.cancel(&task_id).await.expect("cancel");
    assert!(ack.accepted);
    assert_eq!(ack.fence, 0);
    gate.open();

    let outcome = drive.await.expect("join").expect("drive");
    assert_eq!(outcome, DriveOutcome::Settled(TaskStatus::Cancelled));
    let status = t.engine.get_status(&task_id).await.expect("status");
    assert_eq!(status.cursor, 0);
    assert!(t.engine.get_chunks(&task_id, 0).await.expect("chunks").chunks.is_empty());
}

#[tokio::test]
async fn wait_for_outcome_returns_the_text() {
    let t = TestEngine::new(TEXT);
    let receipt = t.engine.submit(hello()).await.expect("submit");
    let pool = t.engine.worker_pool().spawn();

    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        t.engine
            .wait_for_outcome(&receipt.task_id, Duration::from_millis(10)),
    )
    .await
    .expect("settles")
    .expect("outcome");
    pool.shutdown().await;

    assert_eq!(outcome, TaskOutcome::Completed { text: TEXT.into() });
}

#[tokio::test]
async fn unknown_task_is_not_found() {
    let t = TestEngine::new(TEXT);
    let missing = TaskId::generate();
    assert!(matches!(
        t.engine.get_status(&missing).await,
        Err(Error::TaskNotFound { .. })
    ));
    assert!(matches!(
        t.engine.cancel(&missing).await,
        Err(Error::TaskNotFound { .. })
    ));
    assert!(matches!(
        t.engine.get_chunks(&missing, 0).await,
        Err(Error::TaskNotFound { .. })
    ));
}

#[tokio::test]
async fn duplicate_task_id_is_a_conflict() {
    let t = TestEngine::new(TEXT);
    let id = TaskId::generate();
    t.engine
        .submit(hello().with_task_id(id))
        .await
        .expect("first");
    let err = t
        .engine
        .submit(GenerationRequest::new("Something else", SCRIPTED_PROVIDER).with_task_id(id))
        .await
        .expect_err("duplicate");
    assert!(matches!(err, Error::Conflict { .. }));
}

#[tokio::test]
async fn chunks_never_pass_the_cancellation_fence() {
    let storage = Arc::new(spool_test_utils::TracingMemoryBackend::with_latency(
        Duration::from_millis(1),
    ));
    let config = EngineConfig {
        chunk_window: 1,
        chunk_boundary: BoundaryMode::Grapheme,
        ..spool_test_utils::test_config()
    };
    let t = TestEngine::build(
        storage,
        Arc::new(ScriptedGenerator::new("abcdefghijklmnopqrstuvwxyz")),
        config,
    );
    let receipt = t.engine.submit(hello()).await.expect("submit");

    let engine = t.engine.clone();
    let task_id = receipt.task_id;
    let drive = tokio::spawn(async move {
        engine
            .orchestrator()
            .drive(task_id, &WorkerId::new("w"))
            .await
    });
    tokio::time::sleep(Duration::from_millis(60)).await;
    let ack = t.engine.cancel(&task_id).await.expect("cancel");
    drive.await.expect("join").expect("drive");

    let status = t.engine.get_status(&task_id).await.expect("status");
    let persisted = t.engine.get_chunks(&task_id, 0).await.expect("chunks").chunks.len() as u64;
    if ack.accepted {
        assert_eq!(status.status, TaskStatus::Cancelled);
    }
    assert!(persisted <= ack.fence, "{persisted} chunks past fence {}", ack.fence);
    assert_eq!(status.cursor, persisted);
}

#[tokio::test]
async fn batch_submits_every_request_and_shares_duplicates() {
    let t = TestEngine::new(TEXT);
    let receipts = t
        .engine
        .submit_batch(vec![
            hello(),
            GenerationRequest::new("Goodbye", SCRIPTED_PROVIDER),
            hello(),
        ])
        .await
        .expect("batch");

    assert_eq!(receipts.len(), 3);
    assert_ne!(receipts[0].task_id, receipts[1].task_id);
    assert!(receipts[2].joined);
    assert_eq!(receipts[2].task_id, receipts[0].task_id);

    t.drain().await;
    assert_eq!(t.generator.calls(), 2);
    for receipt in &receipts {
        assert_eq!(
            t.engine.get_status(&receipt.task_id).await.expect("status").status,
            TaskStatus::Completed
        );
    }
}

#[tokio::test]
async fn batch_with_a_malformed_request_creates_nothing() {
    let t = TestEngine::new(TEXT);
    let err = t
        .engine
        .submit_batch(vec![hello(), hello().with_temperature(f64::NAN)])
        .await
        .expect_err("rejected");

    assert!(matches!(err, Error::Validation { .. }));
    assert!(err.to_string().contains("request 1"), "{err}");
    assert!(t.engine.list_tasks(10).await.expect("list").is_empty());
}

#[tokio::test]
async fn list_tasks_returns_newest_first() {
    let t = TestEngine::new(TEXT);
    let mut submitted = Vec::new();
    for prompt in ["First prompt", "Second prompt", "Third prompt"] {
        let receipt = t
            .engine
            .submit(GenerationRequest::new(prompt, SCRIPTED_PROVIDER))
            .await
            .expect("submit");
        submitted.push(receipt.task_id);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    t.drain().await;

    let listed = t.engine.list_tasks(2).await.expect("list");
    let ids: Vec<TaskId> = listed.iter().map(|r| r.task_id).collect();
    assert_eq!(ids, vec![submitted[2], submitted[1]]);
    assert!(listed.iter().all(|r| r.status == TaskStatus::Completed));
    assert_eq!(t.engine.list_tasks(20).await.expect("list").len(), 3);
}
