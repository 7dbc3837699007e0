//! Output Validator: checks a generated brief against the destination's
//! markup contract before anything is delivered.
//!
//! The contract is an explicit, versioned [`MarkupSchema`]: the tag
//! vocabulary, the per-bullet hyperlink rule, the escaping rule, the
//! message size ceiling, and the module's section order. Prompts describe
//! the same contract to the model in prose, but only this crate enforces it.
//!
//! Validation is a pure function of `(text, schema)`: the same input always
//! yields the same violations in the same order.

mod rules;

use std::fmt;

use tracing::{debug, warn};

use briefengine_shared::{BriefError, Result, SectionRule};

/// Current markup schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Tags the Telegram HTML parse mode accepts.
pub const TELEGRAM_HTML_TAGS: &[&str] = &[
    "b",
    "strong",
    "i",
    "em",
    "u",
    "ins",
    "s",
    "strike",
    "del",
    "a",
    "code",
    "pre",
    "blockquote",
    "tg-spoiler",
];

/// Line prefixes that mark a content bullet. Numbered items are bullets as well.
pub const BULLET_MARKERS: &[&str] = &["•", "▪", "◦", "‣", "–", "-", "*"];

/// Telegram's per-message character ceiling.
pub const TELEGRAM_MAX_MESSAGE_CHARS: usize = 4096;

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Structural rules a brief must satisfy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkupSchema {
    pub version: u32,
    /// Recognized tag names (lowercase).
    pub allowed_tags: Vec<String>,
    /// Line prefixes that make a line a content bullet.
    pub bullet_markers: Vec<String>,
    /// Every bullet line must carry an `<a href>` with an http(s) URL.
    pub require_link_per_bullet: bool,
    /// Expected section headers, in order.
    pub sections: Vec<SectionRule>,
    /// Maximum visible message length, in UTF-16 code units.
    pub max_chars: usize,
}

impl MarkupSchema {
    /// Telegram HTML contract with the given section rules.
    pub fn telegram_html(sections: Vec<SectionRule>) -> Self {
        Self {
            version: SCHEMA_VERSION,
            allowed_tags: TELEGRAM_HTML_TAGS.iter().map(|t| t.to_string()).collect(),
            bullet_markers: BULLET_MARKERS.iter().map(|m| m.to_string()).collect(),
            require_link_per_bullet: true,
            sections,
            max_chars: TELEGRAM_MAX_MESSAGE_CHARS,
        }
    }

    fn allows(&self, tag: &str) -> bool {
        self.allowed_tags.iter().any(|t| t == tag)
    }
}

impl Default for MarkupSchema {
    fn default() -> Self {
        Self::telegram_html(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Violations
// ---------------------------------------------------------------------------

/// What rule was broken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationKind {
    Empty,
    TooLong { chars: usize, max: usize },
    UnknownTag { tag: String },
    UnclosedTag { tag: String },
    UnexpectedClosingTag { tag: String },
    MismatchedClosingTag { expected: String, found: String },
    LinkWithoutUrl,
    InvalidLinkUrl { href: String },
    UnescapedChar { ch: char },
    BulletWithoutLink { excerpt: String },
    MissingSection { title: String },
    SectionOutOfOrder { title: String, after: String },
    DuplicateSection { title: String },
    EmptySection { title: String },
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("output is empty"),
            Self::TooLong { chars, max } => write!(f, "message too long ({chars} chars, max {max})"),
            Self::UnknownTag { tag } => write!(f, "unrecognized tag <{tag}>"),
            Self::UnclosedTag { tag } => write!(f, "unclosed tag <{tag}>"),
            Self::UnexpectedClosingTag { tag } => write!(f, "closing tag </{tag}> without matching open tag"),
            Self::MismatchedClosingTag { expected, found } => {
                write!(f, "closing tag </{found}> while <{expected}> is open")
            }
            Self::LinkWithoutUrl => f.write_str("<a> tag without href"),
            Self::InvalidLinkUrl { href } => write!(f, "link href '{href}' is not an http(s) URL"),
            Self::UnescapedChar { ch } => write!(f, "unescaped '{ch}' outside a tag"),
            Self::BulletWithoutLink { excerpt } => write!(f, "bullet has no hyperlink: \"{excerpt}\""),
            Self::MissingSection { title } => write!(f, "required section '{title}' is missing"),
            Self::SectionOutOfOrder { title, after } => {
                write!(f, "section '{title}' appears after '{after}'")
            }
            Self::DuplicateSection { title } => write!(f, "section '{title}' appears more than once"),
            Self::EmptySection { title } => write!(f, "section '{title}' has no content"),
        }
    }
}

/// One broken rule, with the 1-based line it was found on when it has one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub line: Option<usize>,
    pub kind: ViolationKind,
}

impl Violation {
    pub(crate) fn at(line: usize, kind: ViolationKind) -> Self {
        Self { line: Some(line), kind }
    }

    pub(crate) fn document(kind: ViolationKind) -> Self {
        Self { line: None, kind }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {line}: {}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Every violation in `text`, ordered by line (document-level ones last).
pub fn check(text: &str, schema: &MarkupSchema) -> Vec<Violation> {
    if text.trim().is_empty() {
        return vec![Violation::document(ViolationKind::Empty)];
    }

    let mut violations = Vec::new();

    let chars = rules::visible_len(text);
    if chars > schema.max_chars {
        violations.push(Violation::document(ViolationKind::TooLong {
            chars,
            max: schema.max_chars,
        }));
    }

    let scan = rules::scan_markup(text, schema, &mut violations);
    if schema.require_link_per_bullet {
        rules::check_bullets(text, schema, &scan.link_lines, &mut violations);
    }
    rules::check_sections(text, &schema.sections, &mut violations);

    // Stable: within a line, rule order is preserved.
    violations.sort_by_key(|v| v.line.unwrap_or(usize::MAX));
    violations
}

/// Accept or reject `text`. Rejection is `OutputMalformed` listing every violation.
pub fn validate(text: &str, schema: &MarkupSchema) -> Result<()> {
    let violations = check(text, schema);

    if violations.is_empty() {
        debug!(chars = text.chars().count(), schema_version = schema.version, "output accepted");
        return Ok(());
    }

    warn!(count = violations.len(), first = %violations[0], "output rejected");
    Err(BriefError::OutputMalformed {
        violations: violations.iter().map(Violation::to_string).collect(),
    })
}
