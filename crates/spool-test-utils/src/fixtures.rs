//! Pre-built engines and requests for common test scenarios.

use std::sync::Arc;
use std::time::Duration;

use spool_core::{StorageBackend, WorkerId};
use spool_flow::chunking::BoundaryMode;
use spool_flow::config::EngineConfig;
use spool_flow::engine::Engine;
use spool_flow::generator::GeneratorRegistry;
use spool_flow::request::GenerationRequest;
use spool_flow::retry::{RetryPolicies, RetryPolicy};

use crate::generator::{SCRIPTED_PROVIDER, ScriptedGenerator};
use crate::storage::TracingMemoryBackend;

/// Prompt used by [`request`].
pub const TEST_PROMPT: &str = "Say hi to everyone";

/// Retry policies with millisecond backoff so exhaustion tests stay fast.
pub fn fast_retry() -> RetryPolicies {
    let policy = |attempts, timeout| {
        RetryPolicy::new(
            attempts,
            Duration::from_millis(1),
            Duration::from_millis(5),
            timeout,
        )
    };
    RetryPolicies {
        validate: policy(3, Duration::from_secs(2)),
        generate: policy(3, Duration::from_secs(5)),
        persist: policy(3, Duration::from_secs(2)),
    }
}

/// Engine configuration used by tests: five-grapheme word chunks, fast
/// retries and a short lease.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        chunk_window: 5,
        chunk_boundary: BoundaryMode::Word,
        lease_ttl: Duration::from_secs(2),
        poll_interval: Duration::from_millis(20),
        worker_count: 2,
        retry: fast_retry(),
        ..EngineConfig::default()
    }
}

/// A request for the scripted provider.
pub fn request() -> GenerationRequest {
    GenerationRequest::new(TEST_PROMPT, SCRIPTED_PROVIDER)
}

/// An engine over traced in-memory storage with a scripted provider.
pub struct TestEngine {
    /// The engine under test.
    pub engine: Engine,
    /// Its storage.
    pub storage: Arc<TracingMemoryBackend>,
    /// Its only provider.
    pub generator: Arc<ScriptedGenerator>,
}

impl TestEngine {
    /// Creates an engine that generates `text`.
    pub fn new(text: &str) -> Self {
        Self::with_generator(ScriptedGenerator::new(text))
    }

    /// Creates an engine around a configured generator.
    pub fn with_generator(generator: ScriptedGenerator) -> Self {
        Self::build(
            Arc::new(TracingMemoryBackend::new()),
            Arc::new(generator),
            test_config(),
        )
    }

    /// Creates an engine from all parts.
    pub fn build(
        storage: Arc<TracingMemoryBackend>,
        generator: Arc<ScriptedGenerator>,
        config: EngineConfig,
    ) -> Self {
        let engine = scripted_engine(
            Arc::clone(&storage) as Arc<dyn StorageBackend>,
            Arc::clone(&generator),
            config,
        );
        Self {
            engine,
            storage,
            generator,
        }
    }

    /// Runs scans on one worker until nothing is left to settle.
    pub async fn drain(&self) {
        self.engine
            .worker_pool()
            .drain(&WorkerId::new("test-worker"))
            .await
            .expect("drain");
    }
}

/// Builds an engine over any storage with `generator` as the only provider.
pub fn scripted_engine(
    storage: Arc<dyn StorageBackend>,
    generator: Arc<ScriptedGenerator>,
    config: EngineConfig,
) -> Engine {
    let generators = GeneratorRegistry::new().with(SCRIPTED_PROVIDER, generator);
    Engine::with_generators(storage, config, generators).expect("engine")
}
