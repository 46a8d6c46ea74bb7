// Keywatch Engine — Text Normalizer
//
// Turns raw post text into the canonical shapes the lexical matcher scores:
//   normalize()    — casefold, strip emoji/punctuation, collapse whitespace
//   tokenize()     — ordered word tokens over the normalized text
//   char_ngrams()  — character n-gram set, spaces preserved so that bridge
//                    n-grams (the window spanning two adjacent words) exist
//   word_shingles()— k-consecutive-word tuple set
//
// Bridge n-grams are the adjacency evidence for multi-word phrase
// detection: "на запчасти" must appear as consecutive words, not merely as
// two tokens scattered through the text.

use std::collections::HashSet;

/// Character n-gram length used throughout the lexical matcher.
pub const CHAR_NGRAM: usize = 3;

/// Word shingle length for description similarity.
pub const WORD_SHINGLE: usize = 2;

/// Casefold and strip everything that is not alphanumeric, collapsing runs
/// of stripped characters (punctuation, emoji, whitespace) into single
/// spaces. Cross-word positions survive as exactly one space, which is what
/// makes bridge n-grams well-defined.
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
            pending_space = true;
        }
    }
    out
}

/// Ordered word tokens of the normalized text.
pub fn tokenize(text: &str) -> Vec<String> {
    normalize(text)
        .split_whitespace()
        .map(|t| t.to_string())
        .collect()
}

/// Set of length-`n` character substrings of the normalized text, spaces
/// included. A text shorter than `n` contributes itself as a single gram so
/// that very short inputs still have a non-empty signature.
pub fn char_ngrams(text: &str, n: usize) -> HashSet<String> {
    let norm = normalize(text);
    let chars: Vec<char> = norm.chars().collect();
    let mut grams = HashSet::new();
    if chars.is_empty() || n == 0 {
        return grams;
    }
    if chars.len() < n {
        grams.insert(norm);
        return grams;
    }
    for window in chars.windows(n) {
        grams.insert(window.iter().collect());
    }
    grams
}

/// N-grams of a phrase that span a word boundary (contain a space). For a
/// single-word phrase this is empty. Presence of every bridge gram in a
/// text's gram set is the adjacency requirement for phrase hits.
pub fn bridge_ngrams(phrase: &str, n: usize) -> HashSet<String> {
    char_ngrams(phrase, n)
        .into_iter()
        .filter(|g| g.contains(' '))
        .collect()
}

/// Set of `k`-consecutive-word tuples (joined by a single space).
pub fn word_shingles(text: &str, k: usize) -> HashSet<String> {
    let tokens = tokenize(text);
    let mut shingles = HashSet::new();
    if k == 0 || tokens.len() < k {
        return shingles;
    }
    for window in tokens.windows(k) {
        shingles.insert(window.join(" "));
    }
    shingles
}

/// Jaccard similarity of two sets. Empty-vs-empty is 0 — an empty
/// description must not match everything.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_casefolds_and_strips() {
        assert_eq!(normalize("Продаю iPhone 15 Pro!"), "продаю iphone 15 pro");
        assert_eq!(normalize("  a,,b  "), "a b");
        assert_eq!(normalize("🔥🔥🔥"), "");
    }

    #[test]
    fn normalize_collapses_emoji_between_words() {
        assert_eq!(normalize("цена🔥80000"), "цена 80000");
    }

    #[test]
    fn tokenize_splits_words() {
        assert_eq!(tokenize("Продаю iPhone 15"), vec!["продаю", "iphone", "15"]);
    }

    #[test]
    fn char_ngrams_include_bridges() {
        let grams = char_ngrams("на запчасти", 3);
        assert!(grams.contains("на "));
        assert!(grams.contains("а з"));
        assert!(grams.contains(" за"));
        assert!(grams.contains("зап"));
    }

    #[test]
    fn char_ngrams_short_text_is_whole_string() {
        let grams = char_ngrams("15", 3);
        assert_eq!(grams.len(), 1);
        assert!(grams.contains("15"));
    }

    #[test]
    fn bridge_ngrams_single_word_empty() {
        assert!(bridge_ngrams("iphone", 3).is_empty());
    }

    #[test]
    fn bridge_ngrams_cover_the_boundary() {
        let bridges = bridge_ngrams("на запчасти", 3);
        assert!(bridges.contains("на "));
        assert!(bridges.contains("а з"));
        assert!(bridges.contains(" за"));
        assert!(!bridges.contains("зап"));
    }

    #[test]
    fn word_shingles_bigrams() {
        let shingles = word_shingles("продаю iphone 15 pro", 2);
        assert!(shingles.contains("продаю iphone"));
        assert!(shingles.contains("iphone 15"));
        assert!(shingles.contains("15 pro"));
        assert_eq!(shingles.len(), 3);
    }

    #[test]
    fn jaccard_empty_is_zero() {
        let empty = HashSet::new();
        let full: HashSet<String> = ["abc".to_string()].into_iter().collect();
        assert_eq!(jaccard(&empty, &full), 0.0);
        assert_eq!(jaccard(&empty, &empty), 0.0);
    }

    #[test]
    fn jaccard_identical_is_one() {
        let a: HashSet<String> = ["abc".to_string(), "bcd".to_string()].into_iter().collect();
        assert!((jaccard(&a, &a) - 1.0).abs() < 1e-9);
    }
}
