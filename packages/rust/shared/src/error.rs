//! Error types for the brief engine.
//!
//! Library crates use [`BriefError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics, except for
//! pipeline failures, which are reported by stage and kind.

use std::path::PathBuf;

use crate::types::Stage;

/// Top-level error type for all brief engine operations.
#[derive(Debug, thiserror::Error)]
pub enum BriefError {
    /// No module definition exists under the requested name.
    #[error("no definition found for module '{module}'")]
    ConfigNotFound { module: String },

    /// The module has no prompt/query mapping for the requested run type.
    #[error("module '{module}' declares no variant for run type '{run_type}'")]
    VariantNotFound { module: String, run_type: String },

    /// The module definition exists but is missing required fields or is unreadable.
    #[error("module '{module}' is invalid: {message}")]
    ConfigInvalid { module: String, message: String },

    /// Every search query failed, or none produced usable evidence.
    #[error("search unavailable: {message}")]
    SearchUnavailable { message: String },

    /// The prompt template is empty or references an unknown placeholder.
    #[error("template error: {message}")]
    TemplateError { message: String },

    /// The rendered prompt exceeds the configured size budget.
    #[error("rendered prompt is {size} chars, budget is {budget}")]
    PayloadTooLarge { size: usize, budget: usize },

    /// The model provider failed on every attempt.
    #[error("model unavailable after {attempts} attempt(s): {message}")]
    ModelUnavailable { attempts: u32, message: String },

    /// The generated brief violates the markup contract.
    #[error("output malformed: {}", .violations.join("; "))]
    OutputMalformed { violations: Vec<String> },

    /// The delivery provider failed on every attempt, or the destination did not verify.
    #[error("delivery failed after {attempts} attempt(s): {message}")]
    DeliveryFailed { attempts: u32, message: String },

    /// Application configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, BriefError>;

impl BriefError {
    /// Create an application config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a module-level `ConfigInvalid` error.
    pub fn config_invalid(module: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            module: module.into(),
            message: msg.into(),
        }
    }

    /// Create a template error from any displayable message.
    pub fn template(msg: impl Into<String>) -> Self {
        Self::TemplateError {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// The pipeline stage that raises this error, if it is a pipeline error.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::ConfigNotFound { .. } | Self::VariantNotFound { .. } | Self::ConfigInvalid { .. } => {
                Some(Stage::ConfigResolver)
            }
            Self::SearchUnavailable { .. } => Some(Stage::SearchAggregator),
            Self::TemplateError { .. } | Self::PayloadTooLarge { .. } => Some(Stage::PromptAssembler),
            Self::ModelUnavailable { .. } => Some(Stage::BriefGenerator),
            Self::OutputMalformed { .. } => Some(Stage::OutputValidator),
            Self::DeliveryFailed { .. } => Some(Stage::DeliveryDispatcher),
            Self::Config { .. } | Self::Io { .. } | Self::Storage(_) => None,
        }
    }

    /// Stable taxonomy name recorded in run outcomes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigNotFound { .. } => "ConfigNotFound",
            Self::VariantNotFound { .. } => "VariantNotFound",
            Self::ConfigInvalid { .. } => "ConfigInvalid",
            Self::SearchUnavailable { .. } => "SearchUnavailable",
            Self::TemplateError { .. } => "TemplateError",
            Self::PayloadTooLarge { .. } => "PayloadTooLarge",
            Self::ModelUnavailable { .. } => "ModelUnavailable",
            Self::OutputMalformed { .. } => "OutputMalformed",
            Self::DeliveryFailed { .. } => "DeliveryFailed",
            Self::Config { .. } => "Config",
            Self::Io { .. } => "Io",
            Self::Storage(_) => "Storage",
        }
    }
}
