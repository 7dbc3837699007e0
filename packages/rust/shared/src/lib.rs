//! Shared types, error model, and configuration for the brief engine.
//!
//! This crate is the foundation depended on by all other briefengine crates.
//! It provides:
//! - [`BriefError`]: the unified, stage-aware error type
//! - [`ProviderError`] and [`retry`]: the contract every external collaborator
//!   is called through
//! - Domain types ([`ModuleDefinition`], [`EvidenceItem`], [`RunOutcome`], [`Stage`])
//! - Configuration ([`AppConfig`], [`Credentials`], config loading)

pub mod config;
pub mod error;
pub mod provider;
pub mod retry;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, Credentials, DeliveryConfig, EngineConfig, ModelConfig, RetryConfig, SearchConfig,
    config_dir, config_file_path, init_config, load_config, load_config_from,
};
pub use error::{BriefError, Result};
pub use provider::{ProviderError, with_timeout};
pub use retry::{RetryExhausted, RetryPolicy, retry};
pub use types::{
    Destination, EvidenceItem, GenerationOptions, ModuleDefinition, RunId, RunOutcome,
    RunRequest, RunType, SectionRule, Stage, VariantDefinition,
};
