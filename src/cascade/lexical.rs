// src/cascade/lexical.rs
//! Lexical stage: the cheap gate that runs for every active subscription on
//! every message. Negative keywords veto unconditionally; positive keywords
//! produce a monotonic relevance score in <0..1>.

use std::collections::HashSet;

use crate::config::LexicalParams;
use crate::normalize::{ngrams, normalize, tokens, word_shingles};
use crate::types::Subscription;

/// Result of the lexical stage for one (message, subscription) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct LexicalOutcome {
    /// The negative keyword that vetoed, in its original form.
    pub matched_negative: Option<String>,
    pub score: f32,
    /// Positive keywords that counted as hits (original form).
    pub matched_keywords: Vec<String>,
}

impl LexicalOutcome {
    fn veto(keyword: &str) -> Self {
        Self {
            matched_negative: Some(keyword.to_string()),
            score: 0.0,
            matched_keywords: Vec::new(),
        }
    }
}

/// Precomputed views of one message, shared across the group's subscriptions.
struct MessageView {
    norm: String,
    grams: HashSet<String>,
    words: Vec<String>,
    shingles: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct LexicalScorer {
    params: LexicalParams,
}

impl LexicalScorer {
    pub fn new(params: LexicalParams) -> Self {
        Self { params }
    }

    /// Fraction of `needle`'s n-grams present in `haystack`'s n-gram set.
    /// Containment, not Jaccard: the message is much longer than a keyword.
    fn ngram_containment(&self, needle: &str, haystack: &HashSet<String>) -> f32 {
        let needle_grams = ngrams(needle, self.params.ngram_size);
        if needle_grams.is_empty() {
            return 0.0;
        }
        let hits = needle_grams.iter().filter(|g| haystack.contains(*g)).count();
        hits as f32 / needle_grams.len() as f32
    }

    fn keyword_hits(&self, keyword_norm: &str, view: &MessageView, floor: f32) -> bool {
        if keyword_norm.is_empty() {
            return false;
        }
        if view.norm.contains(keyword_norm) {
            return true;
        }
        if self.ngram_containment(keyword_norm, &view.grams) >= floor {
            return true;
        }
        // fuzzy fallback for single-word keywords (typos, inflections)
        if !keyword_norm.contains(' ') {
            return view
                .words
                .iter()
                .any(|w| strsim::jaro_winkler(w, keyword_norm) >= self.params.fuzzy_token_floor);
        }
        false
    }

    /// Score one (message, subscription) pair. Must stay allocation-light:
    /// this runs for every active subscription in a group on every message.
    pub fn score(&self, message_text: &str, subscription: &Subscription) -> LexicalOutcome {
        let view = MessageView {
            norm: normalize(message_text),
            grams: ngrams(message_text, self.params.ngram_size),
            words: tokens(message_text),
            shingles: word_shingles(message_text, self.params.shingle_size),
        };

        // Negative keywords first: any hit is an unconditional veto.
        for keyword in &subscription.negative_keywords {
            let kw_norm = normalize(keyword);
            if self.keyword_hits(&kw_norm, &view, self.params.negative_ngram_floor) {
                return LexicalOutcome::veto(keyword);
            }
        }

        // Positive relevance: fraction of keywords that hit, plus a shingle
        // bonus for multi-word keywords found as contiguous phrases.
        let mut considered = 0usize;
        let mut hits = 0usize;
        let mut matched = Vec::new();
        let mut multiword = 0usize;
        let mut shingle_hits = 0usize;

        for keyword in &subscription.positive_keywords {
            let kw_norm = normalize(keyword);
            if kw_norm.is_empty() {
                continue;
            }
            considered += 1;

            if self.keyword_hits(&kw_norm, &view, self.params.positive_ngram_floor) {
                hits += 1;
                matched.push(keyword.clone());
            }

            if kw_norm.contains(' ') {
                multiword += 1;
                let kw_shingles = word_shingles(&kw_norm, self.params.shingle_size);
                if kw_shingles.iter().any(|s| view.shingles.contains(s)) {
                    shingle_hits += 1;
                }
            }
        }

        if considered == 0 {
            return LexicalOutcome {
                matched_negative: None,
                score: 0.0,
                matched_keywords: Vec::new(),
            };
        }

        let base = hits as f32 / considered as f32;
        let bonus = if multiword > 0 {
            self.params.shingle_bonus_weight * (shingle_hits as f32 / multiword as f32)
        } else {
            0.0
        };

        LexicalOutcome {
            matched_negative: None,
            score: (base + bonus).min(1.0),
            matched_keywords: matched,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sub(positive: &[&str], negative: &[&str]) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: 1,
            user_id: 10,
            group_id: -100,
            positive_keywords: positive.iter().map(|s| s.to_string()).collect(),
            negative_keywords: negative.iter().map(|s| s.to_string()).collect(),
            disabled_negative_keywords: Vec::new(),
            keyword_embedding: None,
            active: true,
            paused: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn scorer() -> LexicalScorer {
        LexicalScorer::new(LexicalParams::default())
    }

    #[test]
    fn negative_keyword_vetoes_regardless_of_positive_overlap() {
        let s = scorer();
        let out = s.score(
            "Продам чехол для iphone 15",
            &sub(&["iphone 15"], &["чехол"]),
        );
        assert_eq!(out.matched_negative.as_deref(), Some("чехол"));
        assert_eq!(out.score, 0.0);
        assert!(out.matched_keywords.is_empty());
    }

    #[test]
    fn positive_substring_hit_scores_full_fraction() {
        let s = scorer();
        let out = s.score("Продам велосипед б/у", &sub(&["велосипед"], &[]));
        assert!(out.matched_negative.is_none());
        assert!(out.score >= 1.0 - f32::EPSILON, "got {}", out.score);
        assert_eq!(out.matched_keywords, vec!["велосипед".to_string()]);
    }

    #[test]
    fn unrelated_message_scores_zero() {
        let s = scorer();
        let out = s.score("Сдам квартиру в центре", &sub(&["велосипед"], &[]));
        assert!(out.matched_negative.is_none());
        assert_eq!(out.score, 0.0);
    }

    #[test]
    fn multiword_keyword_gets_shingle_bonus() {
        let s = scorer();
        let phrase = s.score("Продам iphone 15 pro недорого", &sub(&["iphone 15"], &[]));
        // phrase present: full hit fraction + full shingle bonus, capped at 1.0
        assert_eq!(phrase.score, 1.0);
        assert_eq!(phrase.matched_keywords, vec!["iphone 15".to_string()]);
    }

    #[test]
    fn fuzzy_token_match_catches_small_typos() {
        let s = scorer();
        let out = s.score("продам велосипедик детский", &sub(&["велосипед"], &[]));
        // substring hit here; the fuzzy path covers the inverse direction too
        assert!(out.score > 0.0);

        let typo = s.score("срочно продаю велосипет", &sub(&["велосипед"], &[]));
        assert!(typo.score > 0.0, "near-identical token should hit");
    }

    #[test]
    fn more_matching_keywords_never_lower_the_score() {
        let s = scorer();
        let one = s.score("велосипед и самокат", &sub(&["велосипед"], &[]));
        let two = s.score("велосипед и самокат", &sub(&["велосипед", "самокат"], &[]));
        assert!(two.score >= one.score - f32::EPSILON);
    }

    #[test]
    fn negative_check_ignores_disabled_keywords() {
        let s = scorer();
        let mut subscription = sub(&["iphone 15"], &[]);
        subscription
            .disabled_negative_keywords
            .push("чехол".to_string());
        let out = s.score("Продам чехол для iphone 15", &subscription);
        assert!(out.matched_negative.is_none());
        assert!(out.score > 0.0);
    }
}
