use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::{trace, warn};

static FENCED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*\n?(.*?)```").unwrap());

type Strategy = fn(&str) -> Option<Value>;

/// Tried in order; the first that yields valid JSON wins.
const STRATEGIES: &[(&str, Strategy)] = &[
    ("direct", direct),
    ("fenced", fenced),
    ("object", object),
    ("array", array),
];

/// Best-effort JSON out of free model text. Logs and returns `None` when no
/// strategy finds anything parseable.
pub fn parse_lenient(text: &str) -> Option<Value> {
    if text.trim().is_empty() {
        return None;
    }
    for (name, strategy) in STRATEGIES {
        if let Some(v) = strategy(text) {
            trace!(strategy = *name, "Parsed model JSON");
            return Some(v);
        }
    }
    warn!(sample = %sample(text), "Could not parse JSON from model response");
    None
}

fn direct(text: &str) -> Option<Value> {
    serde_json::from_str(text.trim()).ok()
}

fn fenced(text: &str) -> Option<Value> {
    FENCED_RE
        .captures_iter(text)
        .find_map(|caps| serde_json::from_str(caps[1].trim()).ok())
}

fn object(text: &str) -> Option<Value> {
    balanced(text, '{', '}')
}

fn array(text: &str) -> Option<Value> {
    balanced(text, '[', ']')
}

/// First balanced `open…close` span that parses, skipping brackets inside
/// string literals.
fn balanced(text: &str, open: char, close: char) -> Option<Value> {
    let mut search_from = 0;
    while let Some(rel) = text[search_from..].find(open) {
        let start = search_from + rel;
        if let Some(end) = matching_close(&text[start..], open, close) {
            if let Ok(v) = serde_json::from_str(&text[start..start + end]) {
                return Some(v);
            }
        }
        search_from = start + open.len_utf8();
    }
    None
}

/// Byte length of the span starting at `s[0] == open` up to and including its
/// matching `close`.
fn matching_close(s: &str, open: char, close: char) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

fn sample(text: &str) -> String {
    text.chars().take(120).collect::<String>().replace('\n', " ")
}
