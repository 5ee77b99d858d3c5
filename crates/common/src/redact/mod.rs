// Secret redaction for workspace buffers.
//
// Scanning runs over a file's full joined text so that a secret split across
// a line break is still found; the resulting spans are then applied back onto
// individual lines.

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

pub const REDACTED_MARKER: &str = "[REDACTED]";

/// Upper bound on the text handed to a single scan (4 MiB).
pub const DEFAULT_MAX_SCAN_BYTES: usize = 4 * 1024 * 1024;

/// Byte range `[start, end)` of a secret within the scanned text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SecretSpan {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RedactionError {
    #[error("text of {len} bytes exceeds the scan limit of {limit} bytes")]
    TooLarge { len: usize, limit: usize },
}

pub trait SecretRedactor: Send + Sync {
    /// Returns sorted, non-overlapping secret spans within `text`.
    fn scan(&self, text: &str) -> Result<Vec<SecretSpan>, RedactionError>;

    /// Sanitizes one line that begins at byte `line_offset` of the scanned text.
    fn redact(&self, line: &str, line_offset: usize, spans: &[SecretSpan]) -> String {
        redact_line(line, line_offset, spans)
    }
}

/// Regex-based redactor covering common credential shapes.
#[derive(Debug, Clone)]
pub struct PatternRedactor {
    max_scan_bytes: usize,
}

impl Default for PatternRedactor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SCAN_BYTES)
    }
}

impl PatternRedactor {
    pub fn new(max_scan_bytes: usize) -> Self {
        Self { max_scan_bytes }
    }
}

impl SecretRedactor for PatternRedactor {
    fn scan(&self, text: &str) -> Result<Vec<SecretSpan>, RedactionError> {
        if text.len() > self.max_scan_bytes {
            return Err(RedactionError::TooLarge { len: text.len(), limit: self.max_scan_bytes });
        }

        let mut spans = Vec::new();
        for pattern in secret_patterns() {
            for captures in pattern.captures_iter(text) {
                let matched = captures.name("value").or_else(|| captures.get(0));
                if let Some(matched) = matched {
                    if matched.start() < matched.end() {
                        spans.push(SecretSpan { start: matched.start(), end: matched.end() });
                    }
                }
            }
        }

        Ok(merge_spans(spans))
    }
}

fn secret_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            vec![
                // key = value style assignments; only the value is redacted.
                Regex::new(concat!(
                    r#"(?i)\b(?:api[_-]?key|secret|token|password|passwd|credential"#,
                    r#"|client[_-]?secret|access[_-]?key|private[_-]?key)\b"#,
                    r#"\s*[:=]\s*['"]?(?P<value>[^'"\s]+)"#,
                ))
                .expect("assignment redaction pattern should compile"),
                // AWS-style access keys.
                Regex::new(r"\b(?:AKIA|ASIA)[A-Z0-9]{16}\b")
                    .expect("aws key redaction pattern should compile"),
                // GitHub PATs.
                Regex::new(r"\bghp_[A-Za-z0-9]{30,}\b")
                    .expect("github pat redaction pattern should compile"),
                // Common API key prefixes.
                Regex::new(r"\bsk-(?:live|test|proj)-[A-Za-z0-9_-]{16,}")
                    .expect("api key prefix redaction pattern should compile"),
                // JWT-like bearer tokens.
                Regex::new(r"\beyJ[A-Za-z0-9_-]{8,}\.[A-Za-z0-9_-]{8,}\.[A-Za-z0-9_-]{8,}\b")
                    .expect("jwt redaction pattern should compile"),
                // PEM private keys.
                Regex::new(
                    r"(?s)-----BEGIN [A-Z ]*PRIVATE KEY-----.*?-----END [A-Z ]*PRIVATE KEY-----",
                )
                .expect("pem redaction pattern should compile"),
            ]
        })
        .as_slice()
}

fn merge_spans(mut spans: Vec<SecretSpan>) -> Vec<SecretSpan> {
    spans.sort();
    let mut merged: Vec<SecretSpan> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(last) if span.start <= last.end => last.end = last.end.max(span.end),
            _ => merged.push(span),
        }
    }
    merged
}

/// Replaces every part of `line` covered by `spans` with [`REDACTED_MARKER`].
pub fn redact_line(line: &str, line_offset: usize, spans: &[SecretSpan]) -> String {
    let line_end = line_offset + line.len();
    let mut out = String::with_capacity(line.len());
    let mut cursor = 0usize;

    for span in spans {
        let start = span.start.max(line_offset);
        let end = span.end.min(line_end);
        if start >= end {
            continue;
        }
        let (local_start, local_end) = (start - line_offset, end - line_offset);
        out.push_str(&line[cursor..local_start]);
        out.push_str(REDACTED_MARKER);
        cursor = local_end;
    }

    out.push_str(&line[cursor..]);
    out
}

/// Scans the newline-joined text of `lines` once and redacts each line.
pub fn redact_lines(
    redactor: &dyn SecretRedactor,
    lines: &[String],
) -> Result<Vec<String>, RedactionError> {
    let joined = lines.join("\n");
    let spans = redactor.scan(&joined)?;
    if spans.is_empty() {
        return Ok(lines.to_vec());
    }

    let mut offset = 0usize;
    let mut redacted = Vec::with_capacity(lines.len());
    for line in lines {
        redacted.push(redactor.redact(line, offset, &spans));
        offset += line.len() + 1;
    }
    Ok(redacted)
}
