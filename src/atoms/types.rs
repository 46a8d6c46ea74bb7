// ── Keywatch Atoms: Pure Data Types ────────────────────────────────────────
// All plain struct/enum definitions with no logic beyond small accessors.
// Atoms layer rule: no I/O, no side effects, no imports from engine/.

use serde::{Deserialize, Serialize};

// ── Subscriptions ──────────────────────────────────────────────────────────

/// A stored query owned by one user: "selling iPhone 15 in Belgrade".
///
/// The surface-form `query` is what the user typed. The derived keyword
/// lists and the longer `description` are produced by the administrative
/// surface that creates subscriptions; the engine only consumes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub user_id: i64,
    /// Surface-form query text, kept for the lexical fallback pass and for
    /// notification payloads.
    pub query: String,
    /// Derived positive keywords (short tokens/phrases).
    pub keywords: Vec<String>,
    /// Negative keywords/phrases. Never overlaps `keywords` — enforced at
    /// registry insert.
    pub negative_keywords: Vec<String>,
    /// Longer natural-language description; secondary lexical target and
    /// the semantic query.
    pub description: String,
    /// Per-keyword embedding vectors, when generated. Empty until the
    /// embedding pass has run for the current keyword revision.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embeddings: Vec<KeywordEmbedding>,
    pub active: bool,
    /// Groups this subscription applies to. A subscription is a candidate
    /// for a message only if this list contains the message's group.
    pub group_ids: Vec<i64>,
}

impl Subscription {
    /// Positive keyword embeddings only.
    pub fn positive_embeddings(&self) -> impl Iterator<Item = &KeywordEmbedding> {
        self.embeddings.iter().filter(|e| !e.negative)
    }

    /// Negative keyword embeddings only.
    pub fn negative_embeddings(&self) -> impl Iterator<Item = &KeywordEmbedding> {
        self.embeddings.iter().filter(|e| e.negative)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordEmbedding {
    pub keyword: String,
    pub vector: Vec<f32>,
    /// True when this embeds a negative keyword (blocklist side).
    pub negative: bool,
}

// ── Incoming messages ──────────────────────────────────────────────────────

/// Normalized representation of one group post, assembled from one or more
/// upstream fragments. Passed through the pipeline exactly once per
/// subscription, then discarded — the ledger records the outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub id: i64,
    pub group_id: i64,
    pub group_name: String,
    pub group_handle: Option<String>,
    /// Forum-structured groups carry a topic.
    pub topic_id: Option<i64>,
    pub topic_title: Option<String>,
    /// Text used for matching. May be enriched page content for URL-only
    /// posts; `display_text` keeps the original for presentation.
    pub text: String,
    pub display_text: String,
    pub media: Vec<MediaItem>,
    pub sender_id: i64,
    pub sender_name: String,
    pub sender_handle: Option<String>,
    /// Unix timestamp (seconds) of the original post.
    pub date: i64,
}

/// Descriptor of one media attachment. Bytes are not held here — they are
/// fetched through the upstream client and handed to the media store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaItem {
    pub index: usize,
    pub mime: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Opaque upstream file reference used for download.
    pub file_ref: String,
}

// ── Match analyses ─────────────────────────────────────────────────────────

/// Outcome kind for one (subscription × message) evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisVerdict {
    Matched,
    /// Rejected by the lexical (n-gram) filter.
    RejectedNgram,
    /// Rejected by the semantic (embedding) filter.
    RejectedSemantic,
    /// Rejected by a negative keyword/phrase hit.
    RejectedNegative,
    /// Rejected by the language-model verifier.
    RejectedVerifier,
}

impl AnalysisVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisVerdict::Matched => "matched",
            AnalysisVerdict::RejectedNgram => "rejected_ngram",
            AnalysisVerdict::RejectedSemantic => "rejected_semantic",
            AnalysisVerdict::RejectedNegative => "rejected_negative",
            AnalysisVerdict::RejectedVerifier => "rejected_verifier",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "matched" => Some(AnalysisVerdict::Matched),
            "rejected_ngram" => Some(AnalysisVerdict::RejectedNgram),
            "rejected_semantic" => Some(AnalysisVerdict::RejectedSemantic),
            "rejected_negative" => Some(AnalysisVerdict::RejectedNegative),
            "rejected_verifier" => Some(AnalysisVerdict::RejectedVerifier),
            _ => None,
        }
    }
}

/// One record per (subscription × message) pair the pipeline evaluates.
/// Written exactly once per pair; duplicate inserts are no-ops at the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchAnalysis {
    pub subscription_id: i64,
    pub message_id: i64,
    pub group_id: i64,
    pub verdict: AnalysisVerdict,
    pub lexical_score: f64,
    /// Present only when the semantic stage was consulted.
    pub semantic_score: Option<f64>,
    /// Present only when the verifier was consulted.
    pub verifier_confidence: Option<f64>,
    pub verifier_reason: Option<String>,
    /// The offending phrase/keyword for negative and semantic rejections.
    pub rejection_keyword: Option<String>,
    /// RFC 3339 timestamp, set when a notification was produced.
    pub notified_at: Option<String>,
}

impl MatchAnalysis {
    /// A rejection record with no verifier involvement.
    pub fn rejected(
        subscription_id: i64,
        message_id: i64,
        group_id: i64,
        verdict: AnalysisVerdict,
        lexical_score: f64,
        semantic_score: Option<f64>,
        rejection_keyword: Option<String>,
    ) -> Self {
        MatchAnalysis {
            subscription_id,
            message_id,
            group_id,
            verdict,
            lexical_score,
            semantic_score,
            verifier_confidence: None,
            verifier_reason: None,
            rejection_keyword,
            notified_at: None,
        }
    }
}

// ── Notifications ──────────────────────────────────────────────────────────

/// The user-visible event produced when a subscription matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: i64,
    pub group_name: String,
    pub group_handle: Option<String>,
    pub message_id: i64,
    pub group_id: i64,
    /// Assembled body: the verifier's matched-item subset (bulleted) when
    /// non-empty, otherwise the original message text.
    pub text: String,
    /// Media filtered to the verifier's matched-photo-indices when those
    /// form a proper subset of the message media.
    pub media: Vec<MediaItem>,
    pub verifier_reason: Option<String>,
    pub subscription_query: String,
    /// Rounded count of other users whose subscriptions also matched.
    pub competitor_count: i64,
}

// ── Engine configuration ───────────────────────────────────────────────────

/// Static engine configuration. Required secrets come from the environment;
/// everything else has a tunable default from atoms/constants.rs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Verifier service endpoint and bearer token.
    pub verifier_url: String,
    pub verifier_token: String,
    /// Embedding server base URL.
    pub embedding_url: String,
    /// SQLite database path. `None` selects the default under the home dir.
    pub db_path: Option<std::path::PathBuf>,
    /// Root directory for persisted media, one subdirectory per group.
    pub media_root: std::path::PathBuf,
    pub lexical_threshold: f64,
    pub semantic_positive_threshold: f64,
    pub semantic_negative_threshold: f64,
    pub backfill_message_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_default();
        EngineConfig {
            verifier_url: String::new(),
            verifier_token: String::new(),
            embedding_url: String::new(),
            db_path: None,
            media_root: home.join(".keywatch").join("media"),
            lexical_threshold: crate::atoms::constants::LEXICAL_THRESHOLD,
            semantic_positive_threshold: crate::atoms::constants::SEMANTIC_POSITIVE_THRESHOLD,
            semantic_negative_threshold: crate::atoms::constants::SEMANTIC_NEGATIVE_THRESHOLD,
            backfill_message_limit: crate::atoms::constants::BACKFILL_MESSAGE_LIMIT,
        }
    }
}

impl EngineConfig {
    /// Build from environment variables. Missing credentials are fatal —
    /// the engine cannot run without its verifier and embedding endpoints.
    pub fn from_env() -> Result<Self, crate::atoms::error::EngineError> {
        use crate::atoms::error::EngineError;
        let require = |key: &str| {
            std::env::var(key)
                .map_err(|_| EngineError::Config(format!("missing required env var {}", key)))
        };

        let mut config = EngineConfig {
            verifier_url: require("KEYWATCH_VERIFIER_URL")?,
            verifier_token: require("KEYWATCH_VERIFIER_TOKEN")?,
            embedding_url: require("KEYWATCH_EMBEDDING_URL")?,
            ..EngineConfig::default()
        };
        if let Ok(path) = std::env::var("KEYWATCH_DB_PATH") {
            config.db_path = Some(path.into());
        }
        if let Ok(root) = std::env::var("KEYWATCH_MEDIA_ROOT") {
            config.media_root = root.into();
        }
        Ok(config)
    }
}
