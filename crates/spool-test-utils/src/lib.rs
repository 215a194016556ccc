//! Shared test utilities for spool integration tests.
//!
//! This crate provides:
//! - [`TracingMemoryBackend`]: In-memory storage with operation recording
//!   and failure injection
//! - [`ScriptedGenerator`]: A provider with scripted outcomes and a call
//!   counter
//! - [`TestEngine`]: A pre-wired engine using both
//!
//! # Example
//!
//! ```rust,ignore
//! use spool_test_utils::{TestEngine, request};
//!
//! #[tokio::test]
//! async fn generates_once() {
//!     let t = TestEngine::new("Hi there");
//!     t.engine.submit(request()).await.unwrap();
//!     t.drain().await;
//!     assert_eq!(t.generator.calls(), 1);
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod fixtures;
pub mod generator;
pub mod storage;

pub use fixtures::*;
pub use generator::*;
pub use storage::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("spool=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
