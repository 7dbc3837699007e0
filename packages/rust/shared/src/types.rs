//! Core domain types for brief runs.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// RunType
// ---------------------------------------------------------------------------

/// Variant selector for one invocation.
///
/// `daily`, `weekly` and `flash` are the standard run types, but modules may
/// declare others; the engine treats the value as an opaque, lowercase key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunType(String);

impl RunType {
    pub const DAILY: &'static str = "daily";
    pub const WEEKLY: &'static str = "weekly";
    pub const FLASH: &'static str = "flash";

    /// Parse a run type key. Accepts `[a-z0-9_-]+` after lowercasing.
    pub fn parse(raw: &str) -> Option<Self> {
        let key = raw.trim().to_ascii_lowercase();
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        valid.then_some(Self(key))
    }

    pub fn daily() -> Self {
        Self(Self::DAILY.into())
    }

    pub fn weekly() -> Self {
        Self(Self::WEEKLY.into())
    }

    pub fn flash() -> Self {
        Self(Self::FLASH.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for RunType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("invalid run type '{s}': expected [a-z0-9_-]+"))
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    ConfigResolver,
    SearchAggregator,
    PromptAssembler,
    BriefGenerator,
    OutputValidator,
    DeliveryDispatcher,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::ConfigResolver,
        Stage::SearchAggregator,
        Stage::PromptAssembler,
        Stage::BriefGenerator,
        Stage::OutputValidator,
        Stage::DeliveryDispatcher,
    ];

    /// Human-readable stage name, as recorded in run outcomes.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigResolver => "Config Resolver",
            Self::SearchAggregator => "Search Aggregator",
            Self::PromptAssembler => "Prompt Assembler",
            Self::BriefGenerator => "Brief Generator",
            Self::OutputValidator => "Output Validator",
            Self::DeliveryDispatcher => "Delivery Dispatcher",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Module definition
// ---------------------------------------------------------------------------

/// A chat + topic pair a module delivers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    /// Chat identifier (numeric id or `@channel` username).
    pub chat_id: String,
    /// Forum topic within the chat, if the chat uses topics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<i64>,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.thread_id {
            Some(thread) => write!(f, "chat={} thread={thread}", self.chat_id),
            None => write!(f, "chat={}", self.chat_id),
        }
    }
}

/// A section header rule enforced by the output validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionRule {
    /// Header text to match (case-insensitive, decorations such as emoji allowed).
    pub title: String,
    /// Whether the brief must contain this section.
    #[serde(default)]
    pub required: bool,
}

/// One run-type variant of a module: prompt, queries, and output rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantDefinition {
    /// Prompt file the template was read from (for diagnostics).
    pub prompt_path: String,
    /// Prompt template text, loaded when the registry is built.
    pub prompt_template: String,
    /// Search queries, in configuration order.
    pub queries: Vec<String>,
    /// Search recency window (provider-specific, e.g. `pd`, `pw`).
    pub freshness: Option<String>,
    /// Section headers expected in the output, in order.
    pub sections: Vec<SectionRule>,
}

/// A named brief: destination, per-run-type variants, generation settings.
///
/// Immutable once loaded; shared read-only by every stage of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDefinition {
    pub name: String,
    pub destination: Destination,
    /// Model override; the engine default applies when absent.
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub variants: BTreeMap<RunType, VariantDefinition>,
}

impl ModuleDefinition {
    pub fn variant(&self, run_type: &RunType) -> Option<&VariantDefinition> {
        self.variants.get(run_type)
    }
}

/// Options passed to the model provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOptions {
    pub model: String,
    pub max_tokens: u32,
}

// ---------------------------------------------------------------------------
// Run request / evidence
// ---------------------------------------------------------------------------

/// The `(module, run type)` tuple supplied at invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub module: String,
    pub run_type: RunType,
    /// Reference date override; the local date is used when absent.
    pub date: Option<NaiveDate>,
}

impl RunRequest {
    pub fn new(module: impl Into<String>, run_type: RunType) -> Self {
        Self {
            module: module.into(),
            run_type,
            date: None,
        }
    }
}

/// One search result that survived URL filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub title: String,
    /// Absolute http(s) URL. Never empty.
    pub url: String,
    /// Publisher or site name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Publication time, when the provider reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
    /// Provider's relative age label (e.g. "3 hours ago").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<String>,
    pub snippet: String,
}

// ---------------------------------------------------------------------------
// Run outcome
// ---------------------------------------------------------------------------

/// The single audit record written for every run request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub id: RunId,
    pub module: String,
    pub run_type: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Last stage entered: the failing stage, or `DeliveryDispatcher` on success.
    pub stage: Stage,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// Delivery provider's confirmation id (present iff success).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
    /// Generated brief kept for diagnosis or manual resend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl RunOutcome {
    pub fn elapsed_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}
