//! Scripted generation provider.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use spool_flow::generator::{Generator, GeneratorError};
use spool_flow::task::GenerationParams;

/// Provider selector the fixtures register [`ScriptedGenerator`] under.
pub const SCRIPTED_PROVIDER: &str = "scripted";

/// A generator that replays scripted outcomes and counts its calls.
///
/// Scripted outcomes are consumed in order; once the script is empty every
/// call returns the fallback text.
#[derive(Debug)]
pub struct ScriptedGenerator {
    text: String,
    script: Mutex<VecDeque<Result<String, GeneratorError>>>,
    calls: AtomicU32,
    gate: Option<Arc<Semaphore>>,
    delay: Option<Duration>,
}

/// Holds gated generator calls until opened.
#[derive(Debug, Clone)]
pub struct Gate(Arc<Semaphore>);

impl Gate {
    /// Lets every pending and future call proceed.
    pub fn open(&self) {
        self.0.add_permits(Semaphore::MAX_PERMITS / 2);
    }
}

impl ScriptedGenerator {
    /// Creates a generator that always returns `text`.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
            gate: None,
            delay: None,
        }
    }

    /// Queues outcomes returned before the fallback text.
    #[must_use]
    pub fn with_script(self, outcomes: impl IntoIterator<Item = Result<String, GeneratorError>>) -> Self {
        self.script.lock().expect("lock").extend(outcomes);
        self
    }

    /// Sleeps for `delay` inside every call.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Blocks every call until the returned [`Gate`] is opened.
    #[must_use]
    pub fn gated(mut self) -> (Self, Gate) {
        let semaphore = Arc::new(Semaphore::new(0));
        self.gate = Some(Arc::clone(&semaphore));
        (self, Gate(semaphore))
    }

    /// Returns the number of `generate` calls so far, including blocked ones.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` calls have started.
    pub async fn wait_for_calls(&self, count: u32) {
        while self.calls() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn default_model(&self) -> &str {
        "scripted-1"
    }

    async fn generate(&self, _params: &GenerationParams) -> Result<String, GeneratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.expect("gate semaphore closed");
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.script.lock().expect("lock").pop_front();
        scripted.unwrap_or_else(|| Ok(self.text.clone()))
    }
}
