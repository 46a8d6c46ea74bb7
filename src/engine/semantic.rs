// Keywatch Engine — Semantic Matcher
//
// Second cascade stage, consulted only when the lexical matcher rejects and
// the subscription carries keyword embeddings. Embeds the message text once
// and scores it by cosine similarity against every cached keyword vector:
// positives accumulate toward the pass threshold, negatives act as a
// blocklist with a max-similarity bar.

use crate::atoms::types::Subscription;
use crate::engine::embedding::EmbeddingClient;
use log::{debug, warn};

/// Result of the semantic stage for one (subscription × message) pair.
#[derive(Debug, Clone)]
pub struct SemanticOutcome {
    pub passed: bool,
    pub score: f64,
    /// The negative keyword that blocked the pair, when one did.
    pub blocking_keyword: Option<String>,
}

/// Score one message against one subscription's keyword embeddings.
///
/// Returns `None` when the stage cannot run — no embeddings on the
/// subscription, the server is in its unreachable window, or the embed call
/// fails. The caller then lets the lexical rejection stand.
pub async fn evaluate(
    client: &EmbeddingClient,
    text: &str,
    sub: &Subscription,
    positive_threshold: f64,
    negative_threshold: f64,
) -> Option<SemanticOutcome> {
    if sub.embeddings.is_empty() {
        return None;
    }
    if !client.is_reachable().await {
        return None;
    }

    let text_vec = match client.embed(text).await {
        Ok(v) => v,
        Err(e) => {
            warn!("[semantic] Embed failed for sub {} — lexical verdict stands: {}", sub.id, e);
            return None;
        }
    };

    let outcome = score(&text_vec, sub, positive_threshold, negative_threshold);
    debug!(
        "[semantic] sub {} score {:.3} passed={} blocked={:?}",
        sub.id, outcome.score, outcome.passed, outcome.blocking_keyword
    );
    Some(outcome)
}

/// Pure scoring of a text embedding against a subscription's keyword
/// vectors. Negatives are a blocklist: the strongest one over the bar
/// rejects. Positive similarities accumulate; the reported score saturates
/// at the pass threshold.
pub fn score(
    text_vec: &[f32],
    sub: &Subscription,
    positive_threshold: f64,
    negative_threshold: f64,
) -> SemanticOutcome {
    let mut neg_max = f64::NEG_INFINITY;
    let mut neg_keyword: Option<&str> = None;
    for emb in sub.negative_embeddings() {
        let sim = cosine_similarity(text_vec, &emb.vector);
        if sim > neg_max {
            neg_max = sim;
            neg_keyword = Some(&emb.keyword);
        }
    }
    if neg_max > negative_threshold {
        return SemanticOutcome {
            passed: false,
            score: neg_max,
            blocking_keyword: neg_keyword.map(|k| k.to_string()),
        };
    }

    let mut sum = 0.0f64;
    for emb in sub.positive_embeddings() {
        sum += cosine_similarity(text_vec, &emb.vector);
    }
    SemanticOutcome { passed: sum >= positive_threshold, score: sum.min(positive_threshold), blocking_keyword: None }
}

/// Cosine similarity of two vectors. Dimension mismatch or a zero norm
/// yields 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-12 {
        return 0.0;
    }
    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::KeywordEmbedding;

    fn sub_with_embeddings(embeddings: Vec<KeywordEmbedding>) -> Subscription {
        Subscription {
            id: 1,
            user_id: 10,
            query: "iphone".into(),
            keywords: vec!["iphone".into()],
            negative_keywords: vec![],
            description: String::new(),
            embeddings,
            active: true,
            group_ids: vec![100],
        }
    }

    #[test]
    fn cosine_identical_vectors() {
        let v = vec![0.5f32, 0.5, 0.1];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_orthogonal_vectors() {
        let a = vec![1.0f32, 0.0];
        let b = vec![0.0f32, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-9);
    }

    #[test]
    fn cosine_dimension_mismatch_is_zero() {
        let a = vec![1.0f32, 0.0];
        let b = vec![1.0f32];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    fn emb(keyword: &str, vector: Vec<f32>, negative: bool) -> KeywordEmbedding {
        KeywordEmbedding { keyword: keyword.into(), vector, negative }
    }

    #[test]
    fn positive_similarities_accumulate_to_pass() {
        let sub = sub_with_embeddings(vec![
            emb("iphone", vec![1.0, 0.0], false),
            emb("продаю", vec![0.0, 1.0], false),
        ]);
        // Equidistant from both positives: each cosine ≈ 0.707, sum ≈ 1.41.
        let text_vec = vec![0.7f32, 0.7];
        let outcome = score(&text_vec, &sub, 0.6, 0.65);
        assert!(outcome.passed);
        // Reported score saturates at the threshold.
        assert!((outcome.score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn weak_positive_sum_fails() {
        let sub = sub_with_embeddings(vec![emb("iphone", vec![1.0, 0.0], false)]);
        let text_vec = vec![0.1f32, 1.0];
        let outcome = score(&text_vec, &sub, 0.6, 0.65);
        assert!(!outcome.passed);
        assert!(outcome.blocking_keyword.is_none());
    }

    #[test]
    fn negative_keyword_blocks_above_bar() {
        let sub = sub_with_embeddings(vec![
            emb("iphone", vec![1.0, 0.0], false),
            emb("запчасти", vec![0.9, 0.44], true),
        ]);
        // Nearly parallel to the negative vector.
        let text_vec = vec![0.9f32, 0.44];
        let outcome = score(&text_vec, &sub, 0.6, 0.65);
        assert!(!outcome.passed);
        assert_eq!(outcome.blocking_keyword.as_deref(), Some("запчасти"));
    }

    #[tokio::test]
    async fn no_embeddings_skips_the_stage() {
        let client = EmbeddingClient::new("http://127.0.0.1:1");
        let sub = sub_with_embeddings(vec![]);
        let outcome = evaluate(&client, "anything", &sub, 0.6, 0.65).await;
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn unreachable_server_skips_the_stage() {
        let client = EmbeddingClient::new("http://127.0.0.1:1");
        client.mark_unreachable();
        let sub = sub_with_embeddings(vec![KeywordEmbedding {
            keyword: "iphone".into(),
            vector: vec![1.0, 0.0],
            negative: false,
        }]);
        let outcome = evaluate(&client, "anything", &sub, 0.6, 0.65).await;
        assert!(outcome.is_none());
    }
}
