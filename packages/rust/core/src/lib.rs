//! Brief generation engine: the model provider and the end-to-end run pipeline.
//!
//! This crate ties the registry, search, prompt, markup, delivery, and
//! storage crates into one run (`BriefEngine::run`).

pub mod generator;
pub mod logger;
pub mod pipeline;

pub use generator::{AnthropicProvider, BriefGenerator, Generation, ModelProvider};
pub use logger::{RunLogger, StorageRunLogger, TracingRunLogger};
pub use pipeline::{BriefEngine, ProgressReporter, Providers, SilentProgress, failure_summary, setup_failure};
