use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::models::{StoredMessage, StyleProfile};

static WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w+").unwrap());
static EMOJI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\u{1F300}-\u{1FAFF}]").unwrap());

/// Derive a behavioral fingerprint from recent chat history. Pure and cheap;
/// recomputed on every reply attempt, never persisted.
///
/// `common_words` are the 5 most frequent tokens; ties break by first
/// occurrence across the lowercased, concatenated texts.
pub fn build_style_profile(messages: &[StoredMessage]) -> StyleProfile {
    let texts: Vec<&str> = messages
        .iter()
        .filter_map(|m| m.text.as_deref())
        .filter(|t| !t.is_empty())
        .collect();
    if texts.is_empty() {
        return StyleProfile::default();
    }

    let total_length: usize = texts.iter().map(|t| t.chars().count()).sum();
    let average_length = total_length as f64 / texts.len() as f64;

    let emoji_count: usize = texts.iter().map(|t| EMOJI_RE.find_iter(t).count()).sum();
    let emoji_ratio = emoji_count as f64 / total_length.max(1) as f64;

    let joined = texts.join(" ").to_lowercase();
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for (position, m) in WORD_RE.find_iter(&joined).enumerate() {
        let entry = counts.entry(m.as_str()).or_insert((0, position));
        entry.0 += 1;
    }
    let mut ranked: Vec<(&str, (usize, usize))> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
    let common_words = ranked
        .into_iter()
        .take(5)
        .map(|(word, _)| word.to_string())
        .collect();

    StyleProfile {
        average_length,
        emoji_ratio,
        common_words,
        topics: Vec::new(),
    }
}
