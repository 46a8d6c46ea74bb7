// Keywatch Engine — Lexical Matcher
//
// First stage of the cascade: cheap character-trigram scoring of a message
// against a subscription's keyword set and description. Also the home of
// negative-phrase detection, which runs before any scoring so a blocklisted
// phrase short-circuits the whole evaluation.
//
// Scoring model:
//   keyword score     = 0.7 · binary coverage + 0.3 · mean coverage
//   description score = 0.3 · trigram Jaccard + 0.7 · word-bigram Jaccard
//   final             = 0.5 · keyword score + 0.5 · description score
//
// Binary coverage counts a keyword only when enough of its trigrams appear
// AND (for multi-word keywords) every bridge trigram is present — the
// adjacency requirement. Mean coverage is the soft counterpart that rewards
// partial morphological overlap ("разбор" vs "разбора").

use crate::atoms::constants::{
    BINARY_COVERAGE_WEIGHT, DESC_BIGRAM_WEIGHT, DESC_TRIGRAM_WEIGHT, KEYWORD_COVERAGE_THRESHOLD,
    NEGATIVE_COVERAGE_THRESHOLD, SOFT_COVERAGE_WEIGHT,
};
use crate::atoms::types::Subscription;
use crate::engine::textnorm::{
    bridge_ngrams, char_ngrams, jaccard, normalize, tokenize, word_shingles, CHAR_NGRAM,
    WORD_SHINGLE,
};
use std::collections::HashSet;

/// Result of the lexical stage for one (subscription × message) pair.
#[derive(Debug, Clone)]
pub struct LexicalOutcome {
    pub passed: bool,
    pub score: f64,
    /// The negative phrase that rejected the pair, when one hit.
    pub rejected_phrase: Option<String>,
}

/// Precomputed lexical shapes of one message, built once and scored against
/// every subscription for the group.
pub struct TextProfile {
    norm: String,
    trigrams: HashSet<String>,
    bigrams: HashSet<String>,
}

impl TextProfile {
    pub fn new(text: &str) -> Self {
        TextProfile {
            norm: normalize(text),
            trigrams: char_ngrams(text, CHAR_NGRAM),
            bigrams: word_shingles(text, WORD_SHINGLE),
        }
    }

    pub fn trigrams(&self) -> &HashSet<String> {
        &self.trigrams
    }
}

/// Fraction of the keyword's character trigrams found in the text trigram
/// set. Keywords shorter than one trigram fall back to substring presence.
fn keyword_coverage(profile: &TextProfile, keyword: &str) -> f64 {
    let kw_norm = normalize(keyword);
    if kw_norm.is_empty() {
        return 0.0;
    }
    if kw_norm.chars().count() < CHAR_NGRAM {
        return if profile.norm.contains(&kw_norm) { 1.0 } else { 0.0 };
    }
    let kw_grams = char_ngrams(&kw_norm, CHAR_NGRAM);
    if kw_grams.is_empty() {
        return 0.0;
    }
    let hits = kw_grams.iter().filter(|g| profile.trigrams.contains(*g)).count();
    hits as f64 / kw_grams.len() as f64
}

/// Every bridge trigram of the phrase is present in the text. Vacuously
/// true for single-word phrases.
fn bridges_present(profile: &TextProfile, phrase: &str) -> bool {
    bridge_ngrams(phrase, CHAR_NGRAM)
        .iter()
        .all(|g| profile.trigrams.contains(g))
}

/// Phrase hit test used for negative keywords: high trigram coverage plus
/// full adjacency evidence. The coverage bar catches morphological variants
/// while the bridge requirement disqualifies coincidental co-occurrence of
/// the phrase's words.
pub fn phrase_matches(profile: &TextProfile, phrase: &str, coverage_threshold: f64) -> bool {
    keyword_coverage(profile, phrase) >= coverage_threshold && bridges_present(profile, phrase)
}

/// Keyword-list score: weighted mix of binary and soft coverage.
fn keyword_score(profile: &TextProfile, keywords: &[String]) -> f64 {
    if keywords.is_empty() {
        return 0.0;
    }
    let mut covered = 0usize;
    let mut coverage_sum = 0.0f64;
    for kw in keywords {
        let coverage = keyword_coverage(profile, kw);
        coverage_sum += coverage;
        if coverage > KEYWORD_COVERAGE_THRESHOLD && bridges_present(profile, kw) {
            covered += 1;
        }
    }
    let binary = covered as f64 / keywords.len() as f64;
    let soft = coverage_sum / keywords.len() as f64;
    BINARY_COVERAGE_WEIGHT * binary + SOFT_COVERAGE_WEIGHT * soft
}

/// Description score: Jaccard similarity on character trigrams and word
/// bigrams, computed independently and blended.
fn description_score(profile: &TextProfile, description: &str) -> f64 {
    if description.trim().is_empty() {
        return 0.0;
    }
    let desc_trigrams = char_ngrams(description, CHAR_NGRAM);
    let desc_bigrams = word_shingles(description, WORD_SHINGLE);
    DESC_TRIGRAM_WEIGHT * jaccard(&profile.trigrams, &desc_trigrams)
        + DESC_BIGRAM_WEIGHT * jaccard(&profile.bigrams, &desc_bigrams)
}

/// Score one message against one subscription.
///
/// Negative phrases are checked first and reject immediately. When the
/// primary score misses the threshold, the keyword term is recomputed over
/// the surface-form query's tokens — long keyword lists dilute binary
/// coverage, but the user's short original query often still carries strong
/// signal — and the pair passes with that subsidiary score if it clears the
/// same threshold.
pub fn evaluate(profile: &TextProfile, sub: &Subscription, threshold: f64) -> LexicalOutcome {
    for phrase in &sub.negative_keywords {
        if phrase_matches(profile, phrase, NEGATIVE_COVERAGE_THRESHOLD) {
            return LexicalOutcome {
                passed: false,
                score: 0.0,
                rejected_phrase: Some(phrase.clone()),
            };
        }
    }

    let desc = description_score(profile, &sub.description);
    let primary = 0.5 * keyword_score(profile, &sub.keywords) + 0.5 * desc;
    if primary >= threshold {
        return LexicalOutcome { passed: true, score: primary, rejected_phrase: None };
    }

    let query_tokens = tokenize(&sub.query);
    if !query_tokens.is_empty() {
        let fallback = 0.5 * keyword_score(profile, &query_tokens) + 0.5 * desc;
        if fallback >= threshold {
            return LexicalOutcome { passed: true, score: fallback, rejected_phrase: None };
        }
    }

    LexicalOutcome { passed: false, score: primary, rejected_phrase: None }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(keywords: &[&str], negatives: &[&str], description: &str) -> Subscription {
        Subscription {
            id: 1,
            user_id: 10,
            query: keywords.join(" "),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            negative_keywords: negatives.iter().map(|s| s.to_string()).collect(),
            description: description.to_string(),
            embeddings: vec![],
            active: true,
            group_ids: vec![100],
        }
    }

    #[test]
    fn iphone_listing_passes_with_high_score() {
        // Scenario: every keyword appears verbatim in the message.
        let s = sub(
            &["iphone", "продаю", "15", "pro"],
            &[],
            "sale of iPhone 15 Pro",
        );
        let profile = TextProfile::new("Продаю iPhone 15 Pro Max 256gb, идеал. Цена 80000.");
        let outcome = evaluate(&profile, &s, 0.15);
        assert!(outcome.passed);
        assert!(outcome.score > 0.4, "score was {}", outcome.score);
    }

    #[test]
    fn unrelated_listing_scores_near_zero() {
        let s = sub(&["samsung", "galaxy"], &[], "продажа samsung galaxy");
        let profile = TextProfile::new("Продаю MacBook Pro M3 Max, 250000₽");
        let outcome = evaluate(&profile, &s, 0.15);
        assert!(!outcome.passed);
        assert!(outcome.score < 0.1, "score was {}", outcome.score);
    }

    #[test]
    fn negative_phrase_rejects_adjacent_words() {
        let s = sub(
            &["iphone", "продаю", "15", "pro"],
            &["на запчасти"],
            "sale of iPhone 15 Pro",
        );
        let profile = TextProfile::new("Продаю iPhone 15 Pro на запчасти, 15000");
        let outcome = evaluate(&profile, &s, 0.15);
        assert!(!outcome.passed);
        assert_eq!(outcome.rejected_phrase.as_deref(), Some("на запчасти"));
    }

    #[test]
    fn negative_phrase_ignores_scattered_words() {
        // The phrase's words are both present but never adjacent; the bridge
        // trigrams are missing, so the phrase must not reject.
        let s = sub(
            &["iphone", "продаю", "15", "pro"],
            &["на запчасти"],
            "sale of iPhone 15 Pro",
        );
        let profile = TextProfile::new("iPhone 15 Pro — звонил, спросил про запчасти у соседа");
        let outcome = evaluate(&profile, &s, 0.15);
        assert!(outcome.rejected_phrase.is_none());
    }

    #[test]
    fn negative_phrase_catches_morphological_variant() {
        let s = sub(&["iphone"], &["разбор"], "iphone sale");
        let profile = TextProfile::new("iPhone на разбор, экран целый");
        let outcome = evaluate(&profile, &s, 0.15);
        assert_eq!(outcome.rejected_phrase.as_deref(), Some("разбор"));
    }

    #[test]
    fn empty_keywords_and_description_reject_everything() {
        let s = sub(&[], &[], "");
        let profile = TextProfile::new("Продаю iPhone 15 Pro");
        let outcome = evaluate(&profile, &s, 0.15);
        assert!(!outcome.passed);
        assert_eq!(outcome.score, 0.0);
    }

    #[test]
    fn query_fallback_rescues_diluted_keyword_list() {
        // A long keyword list where only a couple of terms hit dilutes the
        // binary term below threshold; the short surface query still passes.
        let mut s = sub(
            &[
                "iphone", "айфон", "продам", "продаю", "срочно", "гарантия", "чек", "комплект",
                "коробка", "наушники", "зарядка", "кабель",
            ],
            &[],
            "",
        );
        s.query = "продаю iphone".to_string();
        let profile = TextProfile::new("Продаю iPhone в хорошем состоянии");
        let outcome = evaluate(&profile, &s, 0.3);
        assert!(outcome.passed, "fallback should pass, score {}", outcome.score);
    }

    #[test]
    fn multi_word_keyword_requires_adjacency_for_binary_credit() {
        let profile_adjacent = TextProfile::new("продаю iphone 15 pro");
        let profile_scattered = TextProfile::new("iphone это не 15 и не pro");
        let kws = vec!["iphone 15".to_string()];
        let adjacent = keyword_score(&profile_adjacent, &kws);
        let scattered = keyword_score(&profile_scattered, &kws);
        assert!(adjacent > scattered);
    }

    #[test]
    fn phrase_matches_requires_bridges() {
        let profile = TextProfile::new("на рынке сейчас есть запчасти");
        assert!(!phrase_matches(&profile, "на запчасти", 0.85));
    }
}
