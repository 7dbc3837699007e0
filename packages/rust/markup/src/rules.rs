//! Individual markup rules. Each pass appends to a shared violation list.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use briefengine_shared::SectionRule;

use crate::{MarkupSchema, Violation, ViolationKind};

/// Result of the tag/escape scan needed by later passes.
pub(crate) struct MarkupScan {
    /// Lines on which a valid `<a href="http(s)://...">` opens.
    pub link_lines: BTreeSet<usize>,
}

// ---------------------------------------------------------------------------
// Pass 1: tags, links, escaping
// ---------------------------------------------------------------------------

/// Walk the text once, tracking open tags and line numbers.
pub(crate) fn scan_markup(text: &str, schema: &MarkupSchema, out: &mut Vec<Violation>) -> MarkupScan {
    static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^<(/)?([a-zA-Z][a-zA-Z0-9-]*)((?:\s[^<>]*)?)>").expect("valid regex")
    });
    static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^&(?:lt|gt|amp|quot|#[0-9]+|#[xX][0-9a-fA-F]+);").expect("valid regex")
    });

    let bytes = text.as_bytes();
    let mut stack: Vec<(String, usize)> = Vec::new();
    let mut link_lines = BTreeSet::new();
    let mut line = 1;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\n' => {
                line += 1;
                i += 1;
            }
            b'<' => {
                let Some(caps) = TAG_RE.captures(&text[i..]) else {
                    out.push(Violation::at(line, ViolationKind::UnescapedChar { ch: '<' }));
                    i += 1;
                    continue;
                };

                let whole = caps.get(0).map_or("", |m| m.as_str());
                let closing = caps.get(1).is_some();
                let name = caps[2].to_ascii_lowercase();
                let attrs = caps.get(3).map_or("", |m| m.as_str());

                if !schema.allows(&name) {
                    out.push(Violation::at(line, ViolationKind::UnknownTag { tag: name }));
                } else if closing {
                    close_tag(&mut stack, name, line, out);
                } else {
                    if name == "a" {
                        match href(attrs) {
                            None => out.push(Violation::at(line, ViolationKind::LinkWithoutUrl)),
                            Some(url) if is_web_url(&url) => {
                                link_lines.insert(line);
                            }
                            Some(url) => out.push(Violation::at(line, ViolationKind::InvalidLinkUrl { href: url })),
                        }
                    }
                    stack.push((name, line));
                }

                line += whole.matches('\n').count();
                i += whole.len();
            }
            b'>' => {
                out.push(Violation::at(line, ViolationKind::UnescapedChar { ch: '>' }));
                i += 1;
            }
            b'&' => match ENTITY_RE.find(&text[i..]) {
                Some(m) => i += m.len(),
                None => {
                    out.push(Violation::at(line, ViolationKind::UnescapedChar { ch: '&' }));
                    i += 1;
                }
            },
            _ => i += 1,
        }
    }

    for (tag, opened_on) in stack {
        out.push(Violation::at(opened_on, ViolationKind::UnclosedTag { tag }));
    }

    MarkupScan { link_lines }
}

fn close_tag(stack: &mut Vec<(String, usize)>, name: String, line: usize, out: &mut Vec<Violation>) {
    match stack.iter().rposition(|(open, _)| *open == name) {
        None => out.push(Violation::at(line, ViolationKind::UnexpectedClosingTag { tag: name })),
        Some(pos) => {
            if pos + 1 != stack.len() {
                let expected = stack[stack.len() - 1].0.clone();
                out.push(Violation::at(
                    line,
                    ViolationKind::MismatchedClosingTag { expected, found: name },
                ));
            }
            // Tags opened inside the one being closed are reported once, here.
            stack.truncate(pos);
        }
    }
}

fn href(attrs: &str) -> Option<String> {
    static HREF_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"(?i)\bhref\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("valid regex")
    });

    let caps = HREF_RE.captures(attrs)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str().trim().to_string())
}

fn is_web_url(href: &str) -> bool {
    let lower = href.to_ascii_lowercase();
    let rest = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"));
    rest.is_some_and(|r| !r.is_empty() && !r.starts_with('/'))
}

// ---------------------------------------------------------------------------
// Pass 2: every bullet carries a hyperlink
// ---------------------------------------------------------------------------

pub(crate) fn check_bullets(
    text: &str,
    schema: &MarkupSchema,
    link_lines: &BTreeSet<usize>,
    out: &mut Vec<Violation>,
) {
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let visible = visible_text(raw);
        let Some(body) = bullet_body(visible.trim_start(), &schema.bullet_markers) else {
            continue;
        };
        if !link_lines.contains(&line) {
            out.push(Violation::at(
                line,
                ViolationKind::BulletWithoutLink {
                    excerpt: excerpt(body.trim(), 60),
                },
            ));
        }
    }
}

/// The text after a bullet marker, if the line is a bullet.
///
/// ASCII markers need trailing whitespace so `-5%` or `*emphasis*` are not bullets.
/// Numbered items (`1. `, `2) `) count as bullets too.
fn bullet_body<'a>(line: &'a str, markers: &[String]) -> Option<&'a str> {
    static NUMBERED_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^\d{1,3}[.)]\s").expect("valid regex"));

    let marked = markers.iter().find_map(|marker| {
        let rest = line.strip_prefix(marker.as_str())?;
        let needs_space = marker.is_ascii();
        if needs_space && !rest.starts_with(char::is_whitespace) {
            return None;
        }
        Some(rest)
    });

    marked.or_else(|| NUMBERED_RE.find(line).map(|m| &line[m.end()..]))
}

fn visible_text(line: &str) -> String {
    static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^<>]*>").expect("valid regex"));
    TAG_RE.replace_all(line, "").into_owned()
}

/// Replace the entities Telegram HTML accepts with the characters they stand for.
fn decode_entities(text: &str) -> String {
    static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"&(lt|gt|amp|quot|#[0-9]+|#[xX][0-9a-fA-F]+);").expect("valid regex")
    });

    ENTITY_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            let decoded = match name {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "amp" => Some('&'),
                "quot" => Some('"'),
                _ => {
                    let code = match name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => name[1..].parse::<u32>().ok(),
                    };
                    code.and_then(char::from_u32)
                }
            };
            decoded.map_or_else(|| caps[0].to_string(), String::from)
        })
        .into_owned()
}

/// Message length as Telegram counts it: UTF-16 code units of the text left
/// after tags are removed and entities decoded.
pub(crate) fn visible_len(text: &str) -> usize {
    decode_entities(&visible_text(text)).encode_utf16().count()
}

fn excerpt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}

// ---------------------------------------------------------------------------
// Pass 3: section headers
// ---------------------------------------------------------------------------

/// A header is a line wholly wrapped in one `<b>` or `<strong>` element.
fn header_text(line: &str) -> Option<String> {
    static HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^\s*<(b|strong)>(.*)</(b|strong)>\s*$").expect("valid regex")
    });

    let caps = HEADER_RE.captures(line)?;
    let inner = caps.get(2).map_or("", |m| m.as_str());
    if inner.contains("</b") || inner.contains("</strong") {
        return None;
    }
    Some(visible_text(inner))
}

/// Lowercase alphanumerics separated by single spaces; emoji and punctuation dropped.
fn normalize_title(text: &str) -> String {
    decode_entities(text)
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn check_sections(text: &str, sections: &[SectionRule], out: &mut Vec<Violation>) {
    if sections.is_empty() {
        return;
    }

    let wanted: Vec<String> = sections.iter().map(|s| normalize_title(&s.title)).collect();
    let lines: Vec<&str> = text.lines().collect();

    // (line index, section index) for each recognized header, in document order.
    let mut found: Vec<(usize, usize)> = Vec::new();
    for (idx, raw) in lines.iter().enumerate() {
        let Some(header) = header_text(raw) else {
            continue;
        };
        let normalized = normalize_title(&header);
        if let Some(section) = wanted.iter().position(|w| !w.is_empty() && *w == normalized) {
            found.push((idx, section));
        }
    }

    let mut seen: BTreeSet<usize> = BTreeSet::new();
    let mut last: Option<usize> = None;

    for (pos, &(idx, section)) in found.iter().enumerate() {
        let line = idx + 1;
        let title = sections[section].title.clone();

        if !seen.insert(section) {
            out.push(Violation::at(line, ViolationKind::DuplicateSection { title }));
            continue;
        }

        if let Some(prev) = last.filter(|&prev| section < prev) {
            out.push(Violation::at(
                line,
                ViolationKind::SectionOutOfOrder {
                    title,
                    after: sections[prev].title.clone(),
                },
            ));
            continue;
        }
        last = Some(section);

        let end = found.get(pos + 1).map_or(lines.len(), |&(next, _)| next);
        let has_content = lines[idx + 1..end].iter().any(|l| !l.trim().is_empty());
        if !has_content {
            out.push(Violation::at(line, ViolationKind::EmptySection { title }));
        }
    }

    for (section, rule) in sections.iter().enumerate() {
        if rule.required && !seen.contains(&section) {
            out.push(Violation::document(ViolationKind::MissingSection {
                title: rule.title.clone(),
            }));
        }
    }
}
