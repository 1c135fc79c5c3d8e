//! Self-reference scanning and rewriting for article bodies.
//!
//! A self-reference is the literal `/post/` followed by a segment of ASCII
//! letters, digits, `_` and `-`. Only all-digit segments are numeric
//! references; anything else is a custom path and never rewritten. Non-ASCII
//! text ends a segment, so prose written directly against a link (common in
//! CJK posts) does not turn the link into a custom path.

use std::sync::LazyLock;

use anyhow::{Result, bail};
use regex::Regex;
use serde::Serialize;

use crate::identifiers::IdentifierMapping;

static POST_SEGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/post/([A-Za-z0-9_-]+)").expect("post segment pattern is valid"));

/// A numeric self-reference; `start..end` is the byte span of the digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostReference {
    pub start: usize,
    pub end: usize,
    pub referenced_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteOutcome {
    pub body: String,
    /// References whose id changed.
    pub replaced: usize,
}

impl RewriteOutcome {
    pub fn changed(&self) -> bool {
        self.replaced > 0
    }
}

/// Parses a `/post/` segment as a numeric article id.
///
/// Returns `None` for custom paths, signed values, and digit runs that overflow `i64`.
pub fn parse_post_id(segment: &str) -> Option<i64> {
    if segment.is_empty() || !segment.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    segment.parse::<i64>().ok()
}

/// Finds every numeric self-reference in `body`, in text order.
pub fn scan(body: &str) -> Vec<PostReference> {
    let mut out = Vec::new();
    for capture in POST_SEGMENT_RE.captures_iter(body) {
        let Some(segment) = capture.get(1) else {
            continue;
        };
        if let Some(referenced_id) = parse_post_id(segment.as_str()) {
            out.push(PostReference {
                start: segment.start(),
                end: segment.end(),
                referenced_id,
            });
        }
    }
    out
}

/// Rewrites every mapped reference in one pass over the original text.
///
/// Replacements are taken from the original ids only, so chained mappings
/// (`7 -> 3`, `3 -> 1`) never compound. Unmapped references are copied verbatim.
pub fn rewrite(body: &str, mapping: &IdentifierMapping) -> RewriteOutcome {
    let mut output = String::with_capacity(body.len());
    let mut cursor = 0usize;
    let mut replaced = 0usize;

    for reference in scan(body) {
        let Some(new_id) = mapping.get(reference.referenced_id) else {
            continue;
        };
        if new_id == reference.referenced_id {
            continue;
        }
        output.push_str(&body[cursor..reference.start]);
        output.push_str(&new_id.to_string());
        cursor = reference.end;
        replaced += 1;
    }

    if replaced == 0 {
        return RewriteOutcome {
            body: body.to_string(),
            replaced: 0,
        };
    }
    output.push_str(&body[cursor..]);
    RewriteOutcome {
        body: output,
        replaced,
    }
}

/// Checks that `rewritten` holds exactly the references `original` should map to.
pub fn verify_rewrite(original: &str, rewritten: &str, mapping: &IdentifierMapping) -> Result<()> {
    let before = scan(original);
    let after = scan(rewritten);
    if before.len() != after.len() {
        bail!(
            "reference count changed during rewrite: {} before, {} after",
            before.len(),
            after.len()
        );
    }
    for (old, new) in before.iter().zip(&after) {
        let expected = mapping.get(old.referenced_id).unwrap_or(old.referenced_id);
        if new.referenced_id != expected {
            bail!(
                "reference to {} rewritten as {} instead of {expected}",
                old.referenced_id,
                new.referenced_id
            );
        }
    }
    Ok(())
}
