// src/normalize.rs
//! Text normalization primitives feeding the lexical stage: lowercasing,
//! emoji/punctuation stripping, tokenization, character n-grams and word
//! shingles. Everything here is a pure function over immutable input and is
//! safe to call concurrently without synchronization.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?u)\b\w+\b").expect("tokenizer regex"));

/// Lowercase, strip everything that is not a letter, digit or whitespace
/// (any script), and collapse whitespace runs. Stripped characters act as a
/// word boundary, so "iphone-15" normalizes to "iphone 15".
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            for lc in ch.to_lowercase() {
                out.push(lc);
            }
        } else {
            // whitespace, punctuation and emoji all separate words
            pending_space = true;
        }
    }
    out
}

/// Words of the normalized text, in order.
pub fn tokens(text: &str) -> Vec<String> {
    let norm = normalize(text);
    WORD_RE
        .find_iter(&norm)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Character n-grams of the normalized text. A normalized text shorter than
/// `n` yields a single-element set containing the whole string.
pub fn ngrams(text: &str, n: usize) -> HashSet<String> {
    let norm = normalize(text);
    let chars: Vec<char> = norm.chars().collect();
    if chars.len() < n.max(1) {
        let mut set = HashSet::with_capacity(1);
        set.insert(norm);
        return set;
    }
    chars
        .windows(n.max(1))
        .map(|w| w.iter().collect::<String>())
        .collect()
}

/// Contiguous word n-grams of the tokenized text. Fewer than `n` words yield
/// a single-element set containing all words joined by a space.
pub fn word_shingles(text: &str, n: usize) -> HashSet<String> {
    let words = tokens(text);
    if words.len() < n.max(1) {
        let mut set = HashSet::with_capacity(1);
        set.insert(words.join(" "));
        return set;
    }
    words.windows(n.max(1)).map(|w| w.join(" ")).collect()
}

/// Short stable hash for logging text without logging text.
pub fn anon_hash(text: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(12);
    for b in digest.iter().take(6) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
