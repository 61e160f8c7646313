//! Message normalization and identity fingerprints.
//!
//! Two occurrences of the same error type on the same platform belong to one
//! error identity when their normalized message and backtrace signature agree. Normalization replaces the volatile
//! parts of a message (ids, addresses, timestamps) with fixed placeholders so
//! that `User 8123 not found` and `User 9930 not found` group together.

pub mod frames;

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use xxhash_rust::xxh3::xxh3_64;

use crate::occurrence::ErrorKey;

pub use self::frames::{backtrace_signature, extract_significant_frames, FrameFilter};

/// How a matched substring is rewritten.
enum Rewrite {
    /// Replace the whole match with a fixed placeholder.
    Placeholder(&'static str),
    /// Replacement template with capture references (e.g. `${1}:object_id`).
    Template(&'static str),
    /// Replace with the placeholder only when the match contains both an
    /// ASCII digit and an ASCII letter; otherwise leave it for later rules.
    MixedAlnum(&'static str),
}

struct Rule {
    name: &'static str,
    pattern: Regex,
    rewrite: Rewrite,
}

fn rule(name: &'static str, pattern: &str, rewrite: Rewrite) -> Rule {
    Rule {
        name,
        pattern: Regex::new(pattern).unwrap_or_else(|e| panic!("rule {name}: {e}")),
        rewrite,
    }
}

/// Substitution rules, most specific first. A generic rule placed earlier would
/// eat substrings (digits inside a UUID, hex inside an address) that a
/// specific rule owns.
static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        rule(
            "uuid",
            r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b",
            Rewrite::Placeholder(":uuid"),
        ),
        rule(
            "memory_address",
            r"0x[0-9a-fA-F]{6,16}\b",
            Rewrite::Placeholder(":memory_address"),
        ),
        rule(
            "timestamp_iso",
            r"\b\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:\s?(?:Z|UTC|[+-]\d{2}:?\d{2}))?",
            Rewrite::Placeholder(":timestamp_iso"),
        ),
        rule(
            "token",
            r"[A-Za-z0-9_\-]{32,}",
            Rewrite::MixedAlnum(":token"),
        ),
        rule(
            "object_id",
            r"(#|id=|ID:\s?)\d+",
            Rewrite::Template("${1}:object_id"),
        ),
        rule(
            "hex",
            r"\b[0-9a-fA-F]{8,}\b",
            Rewrite::MixedAlnum(":hex"),
        ),
        rule(
            "large_number",
            r"\b\d{4,}\b",
            Rewrite::Placeholder(":large_number"),
        ),
    ]
});

fn is_mixed_alnum(s: &str) -> bool {
    s.bytes().any(|b| b.is_ascii_digit()) && s.bytes().any(|b| b.is_ascii_alphabetic())
}

/// Returns the rewritten string, or `None` when the rule did not fire.
fn apply(rule: &Rule, input: &str) -> Option<String> {
    let replaced = match rule.rewrite {
        Rewrite::Placeholder(p) => rule.pattern.replace_all(input, p),
        Rewrite::Template(t) => rule.pattern.replace_all(input, t),
        Rewrite::MixedAlnum(p) => rule.pattern.replace_all(input, |caps: &Captures<'_>| {
            let m = &caps[0];
            if is_mixed_alnum(m) {
                p.to_string()
            } else {
                m.to_string()
            }
        }),
    };
    match replaced {
        Cow::Borrowed(_) => None,
        Cow::Owned(s) if s != input => Some(s),
        Cow::Owned(_) => None,
    }
}

/// Normalize an error message into a grouping template.
///
/// Numbers below 1000 survive untouched: in messages like
/// `wrong number of arguments (given 5, expected 2)` they are the message.
pub fn normalize(message: &str) -> String {
    if message.is_empty() {
        return String::new();
    }
    if message.trim().is_empty() {
        return message.to_string();
    }

    let mut out = message.to_string();
    for r in RULES.iter() {
        if let Some(next) = apply(r, &out) {
            tracing::trace!(rule = r.name, "normalization rule applied");
            out = next;
        }
    }
    out
}

/// Normalize an optional message; a missing message normalizes to `""`.
pub fn normalize_opt(message: Option<&str>) -> String {
    message.map(normalize).unwrap_or_default()
}

/// Stable identity key for a (normalized message, backtrace signature) pair
/// within one (error_type, platform) partition.
pub fn fingerprint(key: &ErrorKey, normalized_message: &str, signature: Option<&str>) -> String {
    let raw = format!(
        "{}\n{}\n{}\n{}",
        key.error_type,
        key.platform,
        normalized_message,
        signature.unwrap_or("-")
    );
    format!("{:016x}", xxh3_64(raw.as_bytes()))
}
