//! Utility helpers for the gateway.
//!
//! Text extraction from tool arguments, storage-safe truncation and a shared
//! cache of compiled Aho–Corasick automata used by the safety screen.

use ahash::AHasher;
use aho_corasick::{AhoCorasick, AhoCorasickBuilder, BuildError};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde_json::Value;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Gather every non-empty string leaf of a JSON value, depth first, joined
/// with single spaces.  Object keys are not included.
pub fn collect_strings(value: &Value) -> String {
    fn collect<'a>(val: &'a Value, out: &mut Vec<&'a str>) {
        match val {
            Value::String(s) if !s.is_empty() => out.push(s),
            Value::Array(arr) => {
                for v in arr {
                    collect(v, out);
                }
            }
            Value::Object(map) => {
                for (_k, v) in map {
                    collect(v, out);
                }
            }
            _ => {}
        }
    }

    let mut parts = Vec::new();
    collect(value, &mut parts);
    parts.join(" ")
}

/// Keep at most `max_chars` characters of `input`, appending `...` when
/// anything was cut.  Counts characters, never splits a code point.
pub fn truncate_for_storage(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => {
            let mut out = String::with_capacity(byte_idx + 3);
            out.push_str(&input[..byte_idx]);
            out.push_str("...");
            out
        }
        None => input.to_string(),
    }
}

/// A memoising wrapper around `AhoCorasick::new` to avoid recompiling
/// automata for repeated lists.  The cache key is a hash of the pattern list.
static AC_CACHE: Lazy<DashMap<u64, Arc<AhoCorasick>>> = Lazy::new(DashMap::new);

/// Given a list of literal patterns, return a shared case-insensitive
/// matcher.  Pattern indices in the matcher follow list order.
pub fn ac_for(list: &[String]) -> Result<Arc<AhoCorasick>, BuildError> {
    let mut hasher = AHasher::default();
    list.len().hash(&mut hasher);
    for pat in list {
        pat.hash(&mut hasher);
    }
    let key = hasher.finish();
    if let Some(existing) = AC_CACHE.get(&key) {
        return Ok(existing.clone());
    }
    let lower: Vec<String> = list.iter().map(|p| p.to_lowercase()).collect();
    let ac = Arc::new(
        AhoCorasickBuilder::new()
            .ascii_case_insensitive(true)
            .build(lower)?,
    );
    AC_CACHE.insert(key, ac.clone());
    Ok(ac)
}

/// Lowest pattern index (list order) occurring anywhere in `hay`.
///
/// Leftmost matching would prefer whichever pattern appears earliest in the
/// text; the screen needs list order, so overlapping matches are scanned and
/// the smallest index kept.
pub fn first_listed_match(ac: &AhoCorasick, hay: &str) -> Option<usize> {
    ac.find_overlapping_iter(hay)
        .map(|m| m.pattern().as_usize())
        .min()
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
/// The scheme comparison is case-insensitive.
pub fn bearer_token(raw: &str) -> Option<&str> {
    if raw.len() < 7 || !raw.is_char_boundary(6) || !raw[..6].eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = raw[6..].trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collects_nested_string_leaves() {
        let args = json!({
            "query": "hello",
            "nested": {"items": ["a", "", 3, {"deep": "b"}]},
            "flag": true
        });
        let text = collect_strings(&args);
        let mut words: Vec<&str> = text.split(' ').collect();
        words.sort();
        assert_eq!(words, vec!["a", "b", "hello"]);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = "é".repeat(600);
        let out = truncate_for_storage(&long, 500);
        assert_eq!(out.chars().count(), 503);
        assert!(out.ends_with("..."));
        assert_eq!(truncate_for_storage("short", 500), "short");
        assert_eq!(truncate_for_storage(&"x".repeat(500), 500).len(), 500);
    }

    #[test]
    fn list_order_beats_text_order() {
        let patterns = vec!["zzz".to_string(), "aaa".to_string()];
        let ac = ac_for(&patterns).unwrap();
        assert_eq!(first_listed_match(&ac, "aaa then zzz"), Some(0));
        assert_eq!(first_listed_match(&ac, "only aaa"), Some(1));
        assert_eq!(first_listed_match(&ac, "nothing"), None);
    }

    #[test]
    fn bearer_parsing_is_case_insensitive() {
        assert_eq!(bearer_token("bEaReR abc"), Some("abc"));
        assert_eq!(bearer_token("Bearer   "), None);
        assert_eq!(bearer_token("Basic abc"), None);
    }
}
