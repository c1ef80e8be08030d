//! Extraction of the embedded `{"fetch_image": {...}}` directive from model output.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

const DIRECTIVE_KEY: &str = "fetch_image";

#[derive(Debug, Clone, PartialEq, Eq)]
/// Result of scanning a reply for an image directive.
pub enum ReplyDirective {
    /// No well-formed directive; the reply is delivered unchanged.
    PlainText { text: String },
    /// Directive removed from `text`; `query` should be looked up.
    DirectiveFound { text: String, query: String },
}

impl ReplyDirective {
    pub fn text(&self) -> &str {
        match self {
            Self::PlainText { text } | Self::DirectiveFound { text, .. } => text,
        }
    }

    pub fn query(&self) -> Option<&str> {
        match self {
            Self::PlainText { .. } => None,
            Self::DirectiveFound { query, .. } => Some(query),
        }
    }
}

static DIRECTIVE_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\{\s*"fetch_image"\s*:"#).expect("hardcoded regex"));

/// Scans `reply` for the first well-formed directive and strips it.
///
/// Malformed fragments are skipped, so a reply with only a broken directive
/// comes back as `PlainText` with its text untouched.
pub fn parse_reply_directive(reply: &str) -> ReplyDirective {
    for candidate in DIRECTIVE_START.find_iter(reply) {
        let start = candidate.start();
        let Some((end, query)) = parse_directive_at(&reply[start..]) else {
            continue;
        };
        let end = start + end;
        let prefix = reply[..start].trim_end();
        let suffix = reply[end..].trim_start();
        let text = match (prefix.is_empty(), suffix.is_empty()) {
            (_, true) => prefix.to_string(),
            (true, false) => suffix.to_string(),
            (false, false) => format!("{prefix} {suffix}"),
        };
        return ReplyDirective::DirectiveFound { text, query };
    }
    ReplyDirective::PlainText {
        text: reply.to_string(),
    }
}

/// Parses one JSON value at the head of `fragment`; returns its byte length
/// and the query it names.
fn parse_directive_at(fragment: &str) -> Option<(usize, String)> {
    let mut stream = serde_json::Deserializer::from_str(fragment).into_iter::<Value>();
    let value = stream.next()?.ok()?;
    let end = stream.byte_offset();
    let query = match value.get(DIRECTIVE_KEY)? {
        Value::Object(arguments) => arguments.get("query")?.as_str()?,
        Value::String(query) => query.as_str(),
        _ => return None,
    };
    let query = query.trim();
    if query.is_empty() {
        return None;
    }
    Some((end, query.to_string()))
}
