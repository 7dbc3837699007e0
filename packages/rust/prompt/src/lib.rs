//! Prompt Assembler: renders a module's prompt template for one run.
//!
//! Templates use a fixed placeholder vocabulary:
//!
//! | Placeholder  | Rendered as                                  |
//! |--------------|----------------------------------------------|
//! | `{date}`     | the run's reference date, e.g. `October 16, 2026` |
//! | `{run_type}` | the run type key (`daily`, `weekly`, ...)    |
//! | `{module}`   | the module name                              |
//! | `{evidence}` | the serialized evidence set                  |
//!
//! `{{` and `}}` render as literal braces. Any other `{name}` is a template
//! error. When a template has no `{evidence}` placeholder the evidence block
//! is appended under a `## Search Results` heading.

use std::fmt::Write as _;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::{Captures, Regex};
use tracing::{debug, instrument};

use briefengine_shared::{BriefError, EvidenceItem, Result, RunType};

/// Brace escapes, or a `{identifier}` placeholder.
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{|\}\}|\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Heading used when the evidence block is appended rather than embedded.
const APPENDED_EVIDENCE_HEADING: &str = "\n\n---\n## Search Results\n\n";

/// Values substituted into a template.
#[derive(Debug, Clone, Copy)]
pub struct PromptVars<'a> {
    pub date: NaiveDate,
    pub run_type: &'a RunType,
    pub module: &'a str,
}

/// A template with every placeholder resolved and evidence embedded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub text: String,
    /// Evidence items embedded (always the full set handed in).
    pub evidence_count: usize,
}

impl RenderedPrompt {
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Long-form reference date, e.g. `October 16, 2026`.
pub fn format_date(date: NaiveDate) -> String {
    date.format("%B %d, %Y").to_string()
}

/// Render `template` for one run.
///
/// Fails with `TemplateError` for an empty template or an unrecognized
/// placeholder, and with `PayloadTooLarge` when the result exceeds
/// `max_chars`. Evidence is never truncated here.
#[instrument(skip_all, fields(module = vars.module, run_type = %vars.run_type, evidence = evidence.len()))]
pub fn assemble(
    template: &str,
    vars: &PromptVars<'_>,
    evidence: &[EvidenceItem],
    max_chars: usize,
) -> Result<RenderedPrompt> {
    if template.trim().is_empty() {
        return Err(BriefError::template("prompt template is empty"));
    }

    let unknown = unknown_placeholders(template);
    if !unknown.is_empty() {
        return Err(BriefError::template(format!(
            "unrecognized placeholder(s): {}",
            unknown.iter().map(|name| format!("{{{name}}}")).collect::<Vec<_>>().join(", ")
        )));
    }

    let evidence_block = serialize_evidence(evidence);
    let date = format_date(vars.date);
    let mut embedded = false;

    let mut text = PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| match caps.get(1).map(|m| m.as_str()) {
            None if &caps[0] == "{{" => "{".to_string(),
            None => "}".to_string(),
            Some("date") => date.clone(),
            Some("run_type") => vars.run_type.to_string(),
            Some("module") => vars.module.to_string(),
            Some("evidence") => {
                embedded = true;
                evidence_block.clone()
            }
            // Rejected above.
            Some(other) => format!("{{{other}}}"),
        })
        .into_owned();

    if !embedded {
        text.push_str(APPENDED_EVIDENCE_HEADING);
        text.push_str(&evidence_block);
    }

    let rendered = RenderedPrompt {
        text,
        evidence_count: evidence.len(),
    };

    let size = rendered.char_len();
    if size > max_chars {
        return Err(BriefError::PayloadTooLarge {
            size,
            budget: max_chars,
        });
    }

    debug!(chars = size, embedded, "prompt assembled");
    Ok(rendered)
}

/// Placeholder names the assembler does not recognize, in order of first use.
pub fn unknown_placeholders(template: &str) -> Vec<String> {
    let mut unknown: Vec<String> = Vec::new();
    for caps in PLACEHOLDER.captures_iter(template) {
        let Some(name) = caps.get(1).map(|m| m.as_str()) else {
            continue;
        };
        let known = matches!(name, "date" | "run_type" | "module" | "evidence");
        if !known && !unknown.iter().any(|u| u == name) {
            unknown.push(name.to_string());
        }
    }
    unknown
}

/// Numbered plain-text evidence listing: title, URL, source, date, snippet per item.
pub fn serialize_evidence(evidence: &[EvidenceItem]) -> String {
    let mut out = String::new();

    for (idx, item) in evidence.iter().enumerate() {
        if idx > 0 {
            out.push('\n');
        }
        let _ = writeln!(out, "[{}] {}", idx + 1, item.title);
        let _ = writeln!(out, "URL: {}", item.url);
        let _ = writeln!(out, "Source: {}", item.source.as_deref().unwrap_or("unknown"));
        let date = match (&item.published, &item.age) {
            (Some(published), _) => published.format("%Y-%m-%d").to_string(),
            (None, Some(age)) => age.clone(),
            (None, None) => "unknown".to_string(),
        };
        let _ = writeln!(out, "Date: {date}");
        if !item.snippet.is_empty() {
            let _ = writeln!(out, "{}", item.snippet);
        }
    }

    out
}
